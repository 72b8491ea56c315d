//! Stereo chessboard captures of a single rig.
//!
//! Produced by an external stereo intrinsic calibration and consumed by the
//! full bundle adjustment as an additional, heavier-tailed residual class.

use anyhow::{ensure, Context, Result};
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::{BufReader, BufWriter};
use std::path::{Path, PathBuf};

use crate::{Iso3, Pt3, Vec2};

/// Corner correspondences and board poses for one stereo rig.
///
/// `camera_poses_left[v]` maps board coordinates into the left camera frame
/// for view `v`; `camera_poses_right[v]` does the same for the right camera.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ChessboardData {
    pub object_points: Vec<Vec<Pt3>>,
    pub image_points_left: Vec<Vec<Vec2>>,
    pub image_points_right: Vec<Vec<Vec2>>,
    pub camera_poses_left: Vec<Iso3>,
    pub camera_poses_right: Vec<Iso3>,
}

impl ChessboardData {
    pub fn num_views(&self) -> usize {
        self.object_points.len()
    }

    /// Total number of corners over all views.
    pub fn num_corners(&self) -> usize {
        self.object_points.iter().map(Vec::len).sum()
    }

    /// Check that per-view lengths agree.
    pub fn validate(&self) -> Result<()> {
        let n = self.object_points.len();
        ensure!(
            self.image_points_left.len() == n
                && self.image_points_right.len() == n
                && self.camera_poses_left.len() == n
                && self.camera_poses_right.len() == n,
            "chessboard view count mismatch: objects {}, left {}, right {}, poses {}/{}",
            n,
            self.image_points_left.len(),
            self.image_points_right.len(),
            self.camera_poses_left.len(),
            self.camera_poses_right.len()
        );
        for (v, obj) in self.object_points.iter().enumerate() {
            ensure!(
                self.image_points_left[v].len() == obj.len()
                    && self.image_points_right[v].len() == obj.len(),
                "chessboard view {} corner count mismatch",
                v
            );
        }
        Ok(())
    }

    /// File name used for the chessboard data of the rig formed by two cameras.
    pub fn file_name(left_camera: &str, right_camera: &str) -> String {
        format!("{}_{}_chessboard_data.json", left_camera, right_camera)
    }

    /// Path of the chessboard data file inside `dir`.
    pub fn path_in(dir: &Path, left_camera: &str, right_camera: &str) -> PathBuf {
        dir.join(Self::file_name(left_camera, right_camera))
    }

    pub fn read_from_file(path: &Path) -> Result<Self> {
        let file = File::open(path)
            .with_context(|| format!("failed to open chessboard data {}", path.display()))?;
        let data: Self = serde_json::from_reader(BufReader::new(file))
            .with_context(|| format!("failed to parse chessboard data {}", path.display()))?;
        data.validate()?;
        Ok(data)
    }

    pub fn write_to_file(&self, path: &Path) -> Result<()> {
        let file = File::create(path)
            .with_context(|| format!("failed to create chessboard data {}", path.display()))?;
        serde_json::to_writer(BufWriter::new(file), self)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn validate_rejects_mismatched_views() {
        let mut data = ChessboardData {
            object_points: vec![vec![Pt3::origin(); 2]],
            image_points_left: vec![vec![Vec2::zeros(); 2]],
            image_points_right: vec![vec![Vec2::zeros(); 2]],
            camera_poses_left: vec![Iso3::identity()],
            camera_poses_right: vec![Iso3::identity()],
        };
        data.validate().unwrap();
        assert_eq!(data.num_corners(), 2);

        data.image_points_right[0].pop();
        assert!(data.validate().is_err());
    }

    #[test]
    fn file_name_follows_camera_names() {
        assert_eq!(
            ChessboardData::file_name("cam0", "cam1"),
            "cam0_cam1_chessboard_data.json"
        );
    }
}

//! The camera array under calibration.
//!
//! Cameras are stored as stereo pairs: rig `i` owns cameras `2i` (left) and
//! `2i + 1` (right). Each camera carries its intrinsic model and its global
//! pose, the transform mapping camera coordinates into the system frame.

use anyhow::{anyhow, ensure, Context, Result};
use nalgebra::{Quaternion, Translation3, UnitQuaternion};
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::Path;

use crate::{camera_from_params, camera_to_params, Iso3, PinholeCamera, Real, Timestamp, Vec3};

/// One camera of the array.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SystemCamera {
    pub name: String,
    pub camera: PinholeCamera,
    /// Pose of the camera in the system frame (camera -> system).
    pub global_pose: Iso3,
}

/// Ordered collection of stereo-paired cameras.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CameraSystem {
    pub(crate) cameras: Vec<SystemCamera>,
}

impl CameraSystem {
    /// Build a camera system; the camera count must be even and non-zero.
    pub fn new(cameras: Vec<SystemCamera>) -> Result<Self> {
        ensure!(!cameras.is_empty(), "camera system needs at least one rig");
        ensure!(
            cameras.len() % 2 == 0,
            "camera count must be even (stereo pairs), got {}",
            cameras.len()
        );
        Ok(Self { cameras })
    }

    pub fn camera_count(&self) -> usize {
        self.cameras.len()
    }

    pub fn rig_count(&self) -> usize {
        self.cameras.len() / 2
    }

    /// Camera indices `(left, right)` of a rig.
    pub fn rig_cameras(&self, rig: usize) -> (usize, usize) {
        (2 * rig, 2 * rig + 1)
    }

    pub fn cameras(&self) -> &[SystemCamera] {
        &self.cameras
    }

    pub fn camera(&self, idx: usize) -> Result<&SystemCamera> {
        self.cameras
            .get(idx)
            .ok_or_else(|| anyhow!("camera index {} out of range ({})", idx, self.cameras.len()))
    }

    pub fn camera_mut(&mut self, idx: usize) -> Result<&mut SystemCamera> {
        let count = self.cameras.len();
        self.cameras
            .get_mut(idx)
            .ok_or_else(|| anyhow!("camera index {} out of range ({})", idx, count))
    }

    pub fn global_camera_pose(&self, idx: usize) -> Result<Iso3> {
        Ok(self.camera(idx)?.global_pose)
    }

    pub fn set_global_camera_pose(&mut self, idx: usize, pose: Iso3) -> Result<()> {
        self.camera_mut(idx)?.global_pose = pose;
        Ok(())
    }

    /// Intrinsic parameter vector `[fx, fy, cx, cy, k1, k2, k3, p1, p2]`.
    pub fn intrinsic_params(&self, idx: usize) -> Result<Vec<Real>> {
        Ok(camera_to_params(&self.camera(idx)?.camera).to_vec())
    }

    pub fn set_intrinsic_params(&mut self, idx: usize, params: &[Real]) -> Result<()> {
        let camera = camera_from_params(params)?;
        self.camera_mut(idx)?.camera = camera;
        Ok(())
    }

    /// Mean of all camera translations in the system frame.
    pub fn translation_centroid(&self) -> Vec3 {
        let sum = self
            .cameras
            .iter()
            .fold(Vec3::zeros(), |acc, c| acc + c.global_pose.translation.vector);
        sum / self.cameras.len() as Real
    }

    /// Write one line per camera: `stamp qx qy qz qw tx ty tz`.
    pub fn write_poses_to_text_file(&self, path: &Path, stamp: Timestamp) -> Result<()> {
        let file = File::create(path)
            .with_context(|| format!("failed to create pose file {}", path.display()))?;
        let mut out = BufWriter::new(file);
        for cam in &self.cameras {
            write_pose_line(&mut out, stamp.as_secs_f64(), &cam.global_pose)?;
        }
        out.flush()?;
        Ok(())
    }

    /// Read global camera poses written by [`Self::write_poses_to_text_file`].
    pub fn read_poses_from_text_file(&mut self, path: &Path) -> Result<()> {
        let file = File::open(path)
            .with_context(|| format!("failed to open pose file {}", path.display()))?;
        let poses = BufReader::new(file)
            .lines()
            .filter(|line| line.as_ref().map_or(true, |l| !l.trim().is_empty()))
            .map(|line| parse_pose_line(&line?))
            .collect::<Result<Vec<_>>>()?;
        ensure!(
            poses.len() == self.cameras.len(),
            "pose file {} has {} entries, camera system has {}",
            path.display(),
            poses.len(),
            self.cameras.len()
        );
        for (cam, (_, pose)) in self.cameras.iter_mut().zip(poses) {
            cam.global_pose = pose;
        }
        Ok(())
    }
}

/// Write `stamp qx qy qz qw tx ty tz` with 20 decimal digits.
pub fn write_pose_line<W: Write>(out: &mut W, stamp_secs: Real, pose: &Iso3) -> Result<()> {
    let q = pose.rotation.coords;
    let t = pose.translation.vector;
    writeln!(
        out,
        "{:.20} {:.20} {:.20} {:.20} {:.20} {:.20} {:.20} {:.20}",
        stamp_secs, q[0], q[1], q[2], q[3], t.x, t.y, t.z
    )?;
    Ok(())
}

/// Parse a line written by [`write_pose_line`].
pub fn parse_pose_line(line: &str) -> Result<(Real, Iso3)> {
    let values = line
        .split_whitespace()
        .map(|tok| {
            tok.parse::<Real>()
                .with_context(|| format!("invalid number '{}' in pose line", tok))
        })
        .collect::<Result<Vec<_>>>()?;
    ensure!(
        values.len() == 8,
        "pose line must have 8 values, got {}",
        values.len()
    );
    let rotation =
        UnitQuaternion::from_quaternion(Quaternion::new(values[4], values[1], values[2], values[3]));
    let translation = Translation3::new(values[5], values[6], values[7]);
    Ok((values[0], Iso3::from_parts(translation, rotation)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{BrownConrady5, CameraParams, FxFyCxCySkew};
    use nalgebra::Rotation3;

    fn camera(name: &str, pose: Iso3) -> SystemCamera {
        SystemCamera {
            name: name.to_string(),
            camera: CameraParams {
                intrinsics: FxFyCxCySkew {
                    fx: 400.0,
                    fy: 400.0,
                    cx: 320.0,
                    cy: 240.0,
                    skew: 0.0,
                },
                distortion: BrownConrady5::default(),
            }
            .build(),
            global_pose: pose,
        }
    }

    #[test]
    fn odd_camera_count_is_rejected() {
        let cams = vec![camera("a", Iso3::identity())];
        assert!(CameraSystem::new(cams).is_err());
    }

    #[test]
    fn pose_file_roundtrip_keeps_precision() {
        let pose = Iso3::from_parts(
            Translation3::new(0.123456789012, -1.5, 2.25),
            Rotation3::from_euler_angles(0.1, -0.2, 0.3).into(),
        );
        let system =
            CameraSystem::new(vec![camera("l", Iso3::identity()), camera("r", pose)]).unwrap();

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("poses.txt");
        system
            .write_poses_to_text_file(&path, Timestamp::from_secs_f64(12.5))
            .unwrap();

        let text = std::fs::read_to_string(&path).unwrap();
        let first = text.lines().next().unwrap();
        assert!(first.starts_with("12.50000000000000000000 "));

        let mut restored =
            CameraSystem::new(vec![camera("l", pose), camera("r", Iso3::identity())]).unwrap();
        restored.read_poses_from_text_file(&path).unwrap();
        let (dt, ang) = crate::pose_error(&restored.global_camera_pose(1).unwrap(), &pose);
        assert!(dt < 1e-12 && ang < 1e-12);
        assert_eq!(restored.global_camera_pose(0).unwrap(), Iso3::identity());
    }

    #[test]
    fn intrinsic_params_roundtrip_through_system() {
        let mut system = CameraSystem::new(vec![
            camera("l", Iso3::identity()),
            camera("r", Iso3::identity()),
        ])
        .unwrap();
        let mut params = system.intrinsic_params(1).unwrap();
        params[0] = 410.0;
        system.set_intrinsic_params(1, &params).unwrap();
        assert_eq!(system.camera(1).unwrap().camera.k.fx, 410.0);
        assert_eq!(system.rig_count(), 1);
        assert_eq!(system.rig_cameras(0), (0, 1));
    }
}

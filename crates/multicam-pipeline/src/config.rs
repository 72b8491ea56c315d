//! Pipeline configuration.
//!
//! Every section has a `Default` matching the reference thresholds, and
//! `#[serde(default)]` lets a JSON file override only the fields it names.

use multicam_optim::{BackendSolveOptions, RobustLoss};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

use crate::CalibError;

// ─────────────────────────────────────────────────────────────────────────────
// Config
// ─────────────────────────────────────────────────────────────────────────────

/// Configuration for multi-rig self-calibration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CalibrationConfig {
    /// Loop-closure thresholds used inside each rig.
    pub per_rig_loop: LoopClosureConfig,
    /// Loop-closure thresholds used across rigs on the merged map.
    pub global_loop: LoopClosureConfig,
    pub ingest: IngestConfig,
    pub handeye: HandeyeConfig,
    pub robust: RobustLossConfig,
    pub solver: SolverConfig,
    pub full_ba: FullBaConfig,
    pub imu: ImuConfig,
    pub io: IoConfig,
}

impl Default for CalibrationConfig {
    fn default() -> Self {
        Self {
            per_rig_loop: LoopClosureConfig::PER_RIG,
            global_loop: LoopClosureConfig::GLOBAL,
            ingest: IngestConfig::default(),
            handeye: HandeyeConfig::default(),
            robust: RobustLossConfig::default(),
            solver: SolverConfig::default(),
            full_ba: FullBaConfig::default(),
            imu: ImuConfig::default(),
            io: IoConfig::default(),
        }
    }
}

impl CalibrationConfig {
    /// Read a configuration from a JSON file.
    pub fn from_json_file(path: &Path) -> Result<Self, CalibError> {
        let text = fs::read_to_string(path).map_err(|e| CalibError::io(path, e))?;
        serde_json::from_str(&text).map_err(|e| CalibError::io(path, e))
    }

    /// Write the configuration as pretty-printed JSON.
    pub fn to_json_file(&self, path: &Path) -> Result<(), CalibError> {
        let text = serde_json::to_string_pretty(self).map_err(|e| CalibError::io(path, e))?;
        fs::write(path, text).map_err(|e| CalibError::io(path, e))
    }
}

/// Thresholds handed to the loop-closure search.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoopClosureConfig {
    /// Minimum 2D-3D correspondences for an accepted image match.
    pub min_correspondences: usize,
    /// Number of candidate images retrieved per query.
    pub n_image_matches: usize,
}

impl LoopClosureConfig {
    pub const PER_RIG: Self = Self {
        min_correspondences: 50,
        n_image_matches: 10,
    };
    pub const GLOBAL: Self = Self {
        min_correspondences: 15,
        n_image_matches: 30,
    };
}

impl Default for LoopClosureConfig {
    fn default() -> Self {
        Self::PER_RIG
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct IngestConfig {
    /// A frame set is committed once some rig tracks fewer correspondences.
    pub keyframe_threshold: usize,
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            keyframe_threshold: 40,
        }
    }
}

/// Linear hand-eye options.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HandeyeConfig {
    /// Minimum rotation (degrees) of a motion pair.
    pub min_angle_deg: f64,
    /// Relative singular-value gap below which rotation axes count as parallel.
    pub degeneracy_eps: f64,
    /// Tikhonov term of the translation least squares.
    pub ridge: f64,
}

impl Default for HandeyeConfig {
    fn default() -> Self {
        Self {
            min_angle_deg: 1.0,
            degeneracy_eps: 1e-6,
            ridge: 1e-12,
        }
    }
}

/// Robust loss scales.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RobustLossConfig {
    /// Huber loss on the normalized image plane (rig BA, pose graph, point refine).
    pub normalized: RobustLoss,
    /// Huber loss on pixel feature residuals of the full bundle adjustment.
    pub pixel: RobustLoss,
    /// Cauchy loss on chessboard corner residuals.
    pub chessboard: RobustLoss,
}

impl Default for RobustLossConfig {
    fn default() -> Self {
        Self {
            normalized: RobustLoss::Huber { scale: 2e-3 },
            pixel: RobustLoss::Huber { scale: 1.0 },
            chessboard: RobustLoss::Cauchy { scale: 1.0 },
        }
    }
}

/// Iteration limits per optimization problem.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SolverConfig {
    pub rig_ba_max_iters: usize,
    pub point_refine_max_iters: usize,
    pub pose_graph_max_iters: usize,
    pub full_ba_max_iters: usize,
    /// Stop once an iteration lowers the cost by less than this.
    pub min_abs_decrease: f64,
    /// Stop once the cost falls below this.
    pub min_error: f64,
    /// Verbosity level (0 = silent, 1 = summary, 2+ = detailed).
    pub verbosity: usize,
}

impl Default for SolverConfig {
    fn default() -> Self {
        Self {
            rig_ba_max_iters: 1000,
            point_refine_max_iters: 100,
            pose_graph_max_iters: 100,
            full_ba_max_iters: 1000,
            min_abs_decrease: 1e-14,
            min_error: 1e-16,
            verbosity: 0,
        }
    }
}

impl SolverConfig {
    pub(crate) fn solve_options(&self, max_iters: usize) -> BackendSolveOptions {
        BackendSolveOptions {
            verbosity: self.verbosity,
            min_abs_decrease: Some(self.min_abs_decrease),
            min_error: Some(self.min_error),
            ..BackendSolveOptions::with_max_iters(max_iters)
        }
    }
}

/// Gauge and intrinsics options of the full bundle adjustment.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FullBaConfig {
    pub fix_intrinsics: bool,
    pub fix_k3: bool,
    /// Hold the extrinsics of camera 0 constant.
    pub fix_first_extrinsic: bool,
    /// Hold the first frame set pose constant.
    pub fix_first_pose: bool,
    /// Iterations between progress notifications.
    pub observer_stride: usize,
}

impl Default for FullBaConfig {
    fn default() -> Self {
        Self {
            fix_intrinsics: false,
            fix_k3: true,
            fix_first_extrinsic: true,
            fix_first_pose: true,
            observer_stride: 10,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ImuConfig {
    /// Minimum rotation (degrees) of a pose/IMU motion pair.
    pub min_angle_deg: f64,
}

impl Default for ImuConfig {
    fn default() -> Self {
        Self { min_angle_deg: 0.5 }
    }
}

/// File locations.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct IoConfig {
    /// Directory receiving snapshots and results.
    pub output_dir: PathBuf,
    /// Binary scene-graph snapshot written after merging.
    pub snapshot_file: String,
    /// Camera poses written after merging.
    pub intermediate_poses_file: String,
    /// Segment-0 system poses written at the end of the run.
    pub system_poses_file: String,
    /// Final camera poses.
    pub camera_poses_file: String,
    /// Skip the per-rig stages and resume from the intermediate snapshot.
    pub read_intermediate_data: bool,
    /// Place-recognition vocabulary handed to the loop-closure search.
    pub vocabulary_path: PathBuf,
    /// Directory holding `<left>_<right>_chessboard_data.json` files.
    pub chessboard_dir: Option<PathBuf>,
}

impl Default for IoConfig {
    fn default() -> Self {
        Self {
            output_dir: PathBuf::from("."),
            snapshot_file: "int_map.sg".to_string(),
            intermediate_poses_file: "int_camera_system_extrinsics.txt".to_string(),
            system_poses_file: "system_poses.txt".to_string(),
            camera_poses_file: "camera_system_extrinsics.txt".to_string(),
            read_intermediate_data: false,
            vocabulary_path: PathBuf::from("vocabulary.bin"),
            chessboard_dir: None,
        }
    }
}

impl IoConfig {
    pub fn snapshot_path(&self) -> PathBuf {
        self.output_dir.join(&self.snapshot_file)
    }

    pub fn intermediate_poses_path(&self) -> PathBuf {
        self.output_dir.join(&self.intermediate_poses_file)
    }

    pub fn system_poses_path(&self) -> PathBuf {
        self.output_dir.join(&self.system_poses_file)
    }

    pub fn camera_poses_path(&self) -> PathBuf {
        self.output_dir.join(&self.camera_poses_file)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_reference_thresholds() {
        let cfg = CalibrationConfig::default();
        assert_eq!(cfg.global_loop, LoopClosureConfig::GLOBAL);
        assert_eq!(cfg.per_rig_loop.min_correspondences, 50);
        assert_eq!(cfg.ingest.keyframe_threshold, 40);
        assert_eq!(cfg.solver.full_ba_max_iters, 1000);
        assert_eq!(cfg.io.snapshot_file, "int_map.sg");
    }

    #[test]
    fn partial_json_keeps_defaults() {
        let json = r#"{ "ingest": { "keyframe_threshold": 25 }, "io": { "read_intermediate_data": true } }"#;
        let cfg: CalibrationConfig = serde_json::from_str(json).unwrap();
        assert_eq!(cfg.ingest.keyframe_threshold, 25);
        assert!(cfg.io.read_intermediate_data);
        assert_eq!(cfg.io.intermediate_poses_file, "int_camera_system_extrinsics.txt");
        assert_eq!(cfg.solver.pose_graph_max_iters, 100);
    }

    #[test]
    fn json_file_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        let mut cfg = CalibrationConfig::default();
        cfg.full_ba.fix_intrinsics = true;
        cfg.to_json_file(&path).unwrap();
        let back = CalibrationConfig::from_json_file(&path).unwrap();
        assert!(back.full_ba.fix_intrinsics);
    }

    #[test]
    fn missing_file_is_an_io_error() {
        let err = CalibrationConfig::from_json_file(Path::new("/nonexistent/config.json"))
            .unwrap_err();
        assert!(matches!(err, CalibError::Io { .. }));
    }
}

//! Self-calibration of an array of stereo rigs from natural scenes.
//!
//! The pipeline takes per-rig maps built by stereo visual odometry and
//! recovers the extrinsics of every camera in a common system frame:
//!
//! 1. per-rig loop closure and bundle adjustment ([`steps::step_rig_calibration`]),
//! 2. hand-eye initialization of each rig against rig 0 ([`steps::step_handeye`]),
//! 3. merging the per-rig maps into one graph ([`steps::step_merge`]),
//! 4. inter-rig loop closure and pose-graph optimization ([`steps::step_global_pose_graph`]),
//! 5. joint bundle adjustment of all cameras ([`steps::step_full_bundle`]),
//! 6. optional alignment with an IMU ([`steps::step_imu_alignment`]),
//! 7. recentering on the mean camera position ([`steps::step_recenter`]).
//!
//! ```no_run
//! use multicam_pipeline::{CalibrationConfig, LoopClosureSearch, SelfCalibration};
//! # fn main() -> Result<(), multicam_pipeline::CalibError> {
//! # let system: multicam_core::CameraSystem = unimplemented!();
//! # let sub_graphs: Vec<multicam_core::SparseGraph> = unimplemented!();
//! # let search: &dyn LoopClosureSearch = unimplemented!();
//! let config = CalibrationConfig::default();
//! let mut calib = SelfCalibration::new(config, system, sub_graphs);
//! let report = calib.run(search, &[], None)?;
//! calib.write_results()?;
//! println!("final cost {:.4e}", report.full_bundle.final_cost);
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod error;
pub mod frontend;
pub mod ingest;
pub mod io;
pub mod run;
pub mod session;
pub mod steps;

// ─────────────────────────────────────────────────────────────────────────────
// Re-exports
// ─────────────────────────────────────────────────────────────────────────────

pub use crate::config::{
    CalibrationConfig, FullBaConfig, HandeyeConfig, ImuConfig, IngestConfig, IoConfig,
    LoopClosureConfig, RobustLossConfig, SolverConfig,
};
pub use crate::error::CalibError;
pub use crate::frontend::{
    Correspondence2D3D, GrayImage, LoopClosureSearch, LoopSearchParams, MatchingMask,
    StereoFrontEnd, StereoImages,
};
pub use crate::ingest::FrameIngestor;
pub use crate::io::{
    load_chessboard_data, read_intermediate_data, write_intermediate_data, write_map_to_vrml,
    write_system_poses_to_text_file,
};
pub use crate::run::{CalibrationReport, SelfCalibration};
pub use crate::session::LogEntry;

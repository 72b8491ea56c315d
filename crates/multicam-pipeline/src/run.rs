//! End-to-end self-calibration run.

use log::error;
use multicam_core::{CameraSystem, ChessboardData, Iso3, SparseGraph, Vec3};
use multicam_linear::PoseImuCalibration;
use multicam_optim::problems::full_bundle::FullBundleReport;
use multicam_optim::IterationObserver;
use std::fmt::Display;

use crate::config::CalibrationConfig;
use crate::frontend::LoopClosureSearch;
use crate::ingest::FrameIngestor;
use crate::io::{
    ensure_dir, read_intermediate_data, write_intermediate_data, write_map_to_vrml,
    write_system_poses_to_text_file,
};
use crate::session::LogEntry;
use crate::steps::{
    step_full_bundle, step_global_pose_graph, step_handeye, step_imu_alignment, step_merge,
    step_recenter, step_rig_calibration, PoseGraphReport, RigReport,
};
use crate::CalibError;

/// Outcome of every stage of [`SelfCalibration::run`].
#[derive(Debug, Clone)]
pub struct CalibrationReport {
    /// Empty when resuming from intermediate data.
    pub rigs: Vec<RigReport>,
    /// Hand-eye estimate per rig; empty when resuming from intermediate data.
    pub handeye: Vec<Option<Iso3>>,
    pub pose_graph: PoseGraphReport,
    pub full_bundle: FullBundleReport,
    pub imu: PoseImuCalibration,
    /// Translation removed by recentering.
    pub centroid: Vec3,
}

/// Calibration state: the camera system, the merged map and the per-rig maps
/// it is built from.
#[derive(Debug, Clone)]
pub struct SelfCalibration {
    pub config: CalibrationConfig,
    pub system: CameraSystem,
    /// Merged map; empty until the merge stage ran.
    pub graph: SparseGraph,
    /// Per-rig maps; consumed by the merge stage.
    pub sub_graphs: Vec<SparseGraph>,
    pub log: Vec<LogEntry>,
}

impl SelfCalibration {
    /// `system` holds the known intrinsics and stereo baselines; every rig
    /// starts at the system origin.
    pub fn new(config: CalibrationConfig, system: CameraSystem, sub_graphs: Vec<SparseGraph>) -> Self {
        Self {
            config,
            system,
            graph: SparseGraph::new(),
            sub_graphs,
            log: Vec::new(),
        }
    }

    pub fn from_ingestor(
        config: CalibrationConfig,
        system: CameraSystem,
        ingestor: FrameIngestor,
    ) -> Self {
        Self::new(config, system, ingestor.into_sub_graphs())
    }

    /// Run every stage in order.
    ///
    /// `chessboards[r]` holds the chessboard captures of rig `r`, if any.
    /// `observer` is notified while the full bundle adjustment iterates.
    pub fn run(
        &mut self,
        search: &dyn LoopClosureSearch,
        chessboards: &[Option<ChessboardData>],
        observer: Option<&mut dyn IterationObserver>,
    ) -> Result<CalibrationReport, CalibError> {
        let io = self.config.io.clone();
        let (rigs, handeye) = if io.read_intermediate_data {
            let graph = read_intermediate_data(
                &mut self.system,
                &io.snapshot_path(),
                &io.intermediate_poses_path(),
            );
            self.graph = record(&mut self.log, "read_intermediate_data", graph, |g| {
                format!("{} frame sets, {} points", g.frame_set_count(), g.point_count())
            })?;
            (Vec::new(), Vec::new())
        } else {
            let rigs = step_rig_calibration(
                &self.system,
                &mut self.sub_graphs,
                search,
                &self.config,
                None,
            );
            let rigs = record(&mut self.log, "rig_calibration", rigs, |r| {
                format!("{} rigs refined", r.iter().filter(|r| r.pose_graph.is_some()).count())
            })?;

            let handeye = step_handeye(&mut self.system, &self.sub_graphs, &self.config.handeye, None);
            let handeye = record(&mut self.log, "handeye", handeye, |h| {
                format!("{} of {} rigs initialized", h.iter().flatten().count(), h.len())
            })?;

            let merged = step_merge(&self.system, std::mem::take(&mut self.sub_graphs));
            self.graph = record(&mut self.log, "merge", merged, |g| {
                format!("{} frame sets, {} points", g.frame_set_count(), g.point_count())
            })?;

            let written = ensure_dir(&io.output_dir).and_then(|()| {
                write_intermediate_data(
                    &self.graph,
                    &self.system,
                    &io.snapshot_path(),
                    &io.intermediate_poses_path(),
                )
            });
            record(&mut self.log, "write_intermediate_data", written, |()| {
                io.snapshot_path().display().to_string()
            })?;
            (rigs, handeye)
        };

        let pose_graph =
            step_global_pose_graph(&self.system, &mut self.graph, search, &self.config, None);
        let pose_graph = record(&mut self.log, "pose_graph", pose_graph, |r| {
            format!(
                "{} correspondences, {} merged points, {}",
                r.correspondences, r.merged_points, r.after_reconstruction
            )
        })?;

        let full_bundle = step_full_bundle(
            &mut self.system,
            &mut self.graph,
            chessboards,
            &self.config,
            None,
            observer,
        );
        let full_bundle = record(&mut self.log, "full_ba", full_bundle, |r| {
            format!("final cost {:.4e}", r.final_cost)
        })?;

        let imu = step_imu_alignment(&mut self.system, &self.graph, &self.config, None);
        let imu = record(&mut self.log, "imu", imu, |c| {
            format!("mean error {:.4} deg over {} pairs", c.mean_error_deg, c.pair_count)
        })?;

        let centroid = record(&mut self.log, "recenter", step_recenter(&mut self.system), |c| {
            format!("[{:.4}, {:.4}, {:.4}]", c.x, c.y, c.z)
        })?;

        Ok(CalibrationReport {
            rigs,
            handeye,
            pose_graph,
            full_bundle,
            imu,
            centroid,
        })
    }

    /// Write the camera poses, the system poses and the VRML map into the
    /// output directory.
    pub fn write_results(&mut self) -> Result<(), CalibError> {
        let io = &self.config.io;
        let written = ensure_dir(&io.output_dir)
            .and_then(|()| {
                let path = io.camera_poses_path();
                self.system
                    .write_poses_to_text_file(&path, Default::default())
                    .map_err(|e| CalibError::io(path, e))
            })
            .and_then(|()| write_system_poses_to_text_file(&self.graph, &io.system_poses_path()))
            .and_then(|()| write_map_to_vrml(&self.graph, &self.system, &io.output_dir.join("map.wrl")));
        let notes = |files: &Vec<_>| format!("{} VRML files in {}", files.len(), io.output_dir.display());
        record(&mut self.log, "write_results", written, notes).map(|_| ())
    }
}

/// Append a log entry for `result` and pass it through.
fn record<T, E: Display>(
    log: &mut Vec<LogEntry>,
    operation: &str,
    result: Result<T, E>,
    notes: impl FnOnce(&T) -> String,
) -> Result<T, E> {
    match &result {
        Ok(value) => log.push(LogEntry::success_with_notes(operation, notes(value))),
        Err(err) => {
            error!("{} failed: {}", operation, err);
            log.push(LogEntry::failure(operation, err.to_string()));
        }
    }
    result
}

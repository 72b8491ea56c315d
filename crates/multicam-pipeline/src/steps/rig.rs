//! Per-rig refinement: intra-rig loop closures followed by bundle adjustment.

use anyhow::{anyhow, ensure, Context, Result};
use log::{info, warn};
use multicam_core::{
    reprojection_stats, CameraSystem, PointAttributes, PointId, ReprojectionStats, SparseGraph,
};
use multicam_optim::problems::rig_bundle::{
    optimize_rig_bundle, RayObservation, RigBundleDataset, RigBundleOptions,
};
use std::collections::HashMap;
use std::thread;

use super::pose_graph::{
    optimize_with_loop_closures, LoopClosureParams, PoseGraphReport, PoseGraphSolveSettings,
};
use super::FrameSetIndex;
use crate::config::CalibrationConfig;
use crate::frontend::{LoopClosureSearch, MatchingMask};
use crate::CalibError;

/// Options for [`step_rig_calibration`].
#[derive(Debug, Clone, Default)]
pub struct RigStepOptions {
    /// Override the maximum number of bundle adjustment iterations.
    pub max_iters: Option<usize>,
    /// Override verbosity level.
    pub verbosity: Option<usize>,
}

#[derive(Debug, Clone, Default)]
pub struct RigReport {
    pub rig: usize,
    /// `None` when the rig had too few frame sets to refine.
    pub pose_graph: Option<PoseGraphReport>,
    pub bundle_cost: f64,
    pub reprojection: ReprojectionStats,
}

/// Refine every rig's trajectory and map, one worker per rig.
///
/// Sub-graph `i` must hold rig `i`'s frame sets in a single segment. A rig
/// with fewer than two frame sets is left untouched.
pub fn step_rig_calibration(
    system: &CameraSystem,
    sub_graphs: &mut [SparseGraph],
    search: &dyn LoopClosureSearch,
    config: &CalibrationConfig,
    opts: Option<RigStepOptions>,
) -> Result<Vec<RigReport>, CalibError> {
    let opts = opts.unwrap_or_default();
    if sub_graphs.len() > system.rig_count() {
        return Err(CalibError::InsufficientData(format!(
            "{} sub-graphs for a camera system of {} rigs",
            sub_graphs.len(),
            system.rig_count()
        )));
    }

    let mask = MatchingMask::intra_rig(system.camera_count());
    let mut bundle = RigBundleOptions {
        robust_loss: config.robust.normalized,
        solve: config
            .solver
            .solve_options(opts.max_iters.unwrap_or(config.solver.rig_ba_max_iters)),
        ..RigBundleOptions::default()
    };
    if let Some(verbosity) = opts.verbosity {
        bundle.solve.verbosity = verbosity;
    }
    let settings = PoseGraphSolveSettings::from_config(config);
    let params = LoopClosureParams {
        vocabulary: &config.io.vocabulary_path,
        mask: &mask,
        thresholds: config.per_rig_loop,
        provenance: PointAttributes::OBSERVED_BY_STEREO_RIG_MULTIPLE_TIMES,
    };

    let results: Vec<Result<RigReport, CalibError>> = thread::scope(|s| {
        let handles: Vec<_> = sub_graphs
            .iter_mut()
            .enumerate()
            .map(|(rig, graph)| {
                let (params, settings, bundle) = (&params, &settings, &bundle);
                s.spawn(move || calibrate_rig(rig, graph, system, search, params, settings, bundle))
            })
            .collect();
        handles
            .into_iter()
            .enumerate()
            .map(|(rig, handle)| {
                let outcome = handle
                    .join()
                    .unwrap_or_else(|_| Err(anyhow!("rig {} worker panicked", rig)));
                outcome.map_err(|source| CalibError::Stage {
                    stage: "rig_calibration",
                    source: source.context(format!("rig {}", rig)),
                })
            })
            .collect()
    });
    results.into_iter().collect()
}

fn calibrate_rig(
    rig: usize,
    graph: &mut SparseGraph,
    system: &CameraSystem,
    search: &dyn LoopClosureSearch,
    params: &LoopClosureParams<'_>,
    settings: &PoseGraphSolveSettings,
    bundle: &RigBundleOptions,
) -> Result<RigReport> {
    ensure!(
        graph.segments().len() == 1,
        "rig {} sub-graph has {} segments, expected 1",
        rig,
        graph.segments().len()
    );
    if graph.frame_set_count() < 2 {
        warn!(
            "rig {}: {} frame set(s), skipping refinement",
            rig,
            graph.frame_set_count()
        );
        return Ok(RigReport {
            rig,
            reprojection: reprojection_stats(graph, system),
            ..RigReport::default()
        });
    }

    let pose_graph = optimize_with_loop_closures(graph, system, search, params, settings)
        .with_context(|| format!("rig {} pose graph", rig))?;

    let before = reprojection_stats(graph, system);
    let (dataset, points) = bundle_dataset(graph, system)?;
    let result = optimize_rig_bundle(&dataset, bundle)
        .with_context(|| format!("rig {} bundle adjustment", rig))?;
    FrameSetIndex::new(graph).write_poses(graph, &result.poses)?;
    for (&pid, position) in points.iter().zip(&result.points) {
        graph.point_mut(pid)?.position = *position;
    }
    let after = reprojection_stats(graph, system);
    info!("rig {}: bundle adjustment before {}", rig, before);
    info!(
        "rig {}: bundle adjustment after  {} (cost {:.3e})",
        rig, after, result.final_cost
    );

    Ok(RigReport {
        rig,
        pose_graph: Some(pose_graph),
        bundle_cost: result.final_cost,
        reprojection: after,
    })
}

/// Rig bundle dataset over every scene point, together with the point handles
/// in dataset order.
fn bundle_dataset(
    graph: &SparseGraph,
    system: &CameraSystem,
) -> Result<(RigBundleDataset, Vec<PointId>)> {
    let frame_sets = FrameSetIndex::new(graph);
    let points = graph.scene_points();
    let mut cam_from_sys = HashMap::new();
    let mut dataset = RigBundleDataset {
        poses: frame_sets.poses(graph)?,
        points: Vec::with_capacity(points.len()),
        observations: Vec::new(),
    };
    for (j, &pid) in points.iter().enumerate() {
        let point = graph.point(pid)?;
        dataset.points.push(point.position);
        for &fid in &point.features {
            let (camera_id, frame_set) = graph.observation_context(fid)?;
            let cam_from_sys = match cam_from_sys.get(&camera_id) {
                Some(&t) => t,
                None => {
                    let t = system.global_camera_pose(camera_id)?.inverse();
                    cam_from_sys.insert(camera_id, t);
                    t
                }
            };
            dataset.observations.push(RayObservation {
                pose: frame_sets.get(frame_set)?,
                point: j,
                cam_from_sys,
                ray: graph.feature(fid)?.ray,
            });
        }
    }
    Ok((dataset, points))
}

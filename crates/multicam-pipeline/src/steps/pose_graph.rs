//! Loop-closure pose graph, duplicate-point merging and map reconstruction.

use anyhow::{Context, Result};
use log::{debug, info};
use multicam_core::{
    reprojection_stats, CameraSystem, Iso3, PointAttributes, PointId, ReprojectionStats, SparseGraph,
};
use multicam_optim::problems::point_refine::{optimize_point, PointObservation};
use multicam_optim::problems::pose_graph::{
    optimize_pose_graph, LoopEdge, PoseGraphDataset, PoseGraphOptions,
};
use multicam_optim::{BackendSolveOptions, RobustLoss};
use std::collections::HashMap;
use std::path::Path;

use super::FrameSetIndex;
use crate::config::{CalibrationConfig, LoopClosureConfig};
use crate::error::StageContext;
use crate::frontend::{Correspondence2D3D, LoopClosureSearch, LoopSearchParams, MatchingMask};
use crate::CalibError;

/// Everything that differs between the per-rig and the global pose graph.
#[derive(Debug, Clone, Copy)]
pub struct LoopClosureParams<'a> {
    pub vocabulary: &'a Path,
    pub mask: &'a MatchingMask,
    pub thresholds: LoopClosureConfig,
    /// Provenance recorded on every point that closes a loop.
    pub provenance: PointAttributes,
}

/// Solver settings of the pose graph and the point refinement.
#[derive(Debug, Clone)]
pub struct PoseGraphSolveSettings {
    pub loop_loss: RobustLoss,
    pub pose_graph: BackendSolveOptions,
    pub point_refine: BackendSolveOptions,
}

impl PoseGraphSolveSettings {
    pub fn from_config(config: &CalibrationConfig) -> Self {
        Self {
            loop_loss: config.robust.normalized,
            pose_graph: config
                .solver
                .solve_options(config.solver.pose_graph_max_iters),
            point_refine: config
                .solver
                .solve_options(config.solver.point_refine_max_iters),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct PoseGraphReport {
    pub correspondences: usize,
    pub loop_factors: usize,
    pub merged_points: usize,
    pub final_cost: f64,
    pub before: ReprojectionStats,
    pub after_optimization: ReprojectionStats,
    pub after_reconstruction: ReprojectionStats,
}

/// Options for [`step_global_pose_graph`].
#[derive(Debug, Clone, Default)]
pub struct PoseGraphStepOptions {
    /// Override the minimum correspondences per image match.
    pub min_correspondences: Option<usize>,
    /// Override the number of candidate images per query.
    pub n_image_matches: Option<usize>,
    /// Override the maximum number of pose graph iterations.
    pub max_iters: Option<usize>,
}

/// Find loops, optimize frame-set poses, merge duplicate points and rebuild
/// every point.
pub fn optimize_with_loop_closures(
    graph: &mut SparseGraph,
    system: &CameraSystem,
    search: &dyn LoopClosureSearch,
    params: &LoopClosureParams<'_>,
    settings: &PoseGraphSolveSettings,
) -> Result<PoseGraphReport> {
    let before = reprojection_stats(graph, system);
    info!("pose graph: reprojection before {}", before);

    let correspondences = search
        .find_correspondences(
            graph,
            &LoopSearchParams {
                vocabulary: params.vocabulary,
                mask: params.mask,
                min_correspondences: params.thresholds.min_correspondences,
                n_image_matches: params.thresholds.n_image_matches,
            },
        )
        .context("loop-closure search failed")?;
    info!("pose graph: {} loop correspondences", correspondences.len());

    let frame_sets = FrameSetIndex::new(graph);
    let poses = frame_sets.poses(graph)?;
    let mut dataset = PoseGraphDataset {
        odometry: PoseGraphDataset::chain_odometry(&poses, &frame_sets.chains),
        loops: Vec::with_capacity(correspondences.len()),
        poses,
    };
    for corr in &correspondences {
        dataset
            .loops
            .push(loop_edge(graph, system, &frame_sets, &dataset.poses, corr)?);
    }

    let opts = PoseGraphOptions {
        loop_loss: settings.loop_loss,
        solve: settings.pose_graph.clone(),
        ..PoseGraphOptions::default()
    };
    let result = optimize_pose_graph(&dataset, &opts)?;
    frame_sets.write_poses(graph, &result.poses)?;
    let after_optimization = reprojection_stats(graph, system);
    info!(
        "pose graph: {} loop factors, cost {:.3e}, reprojection after {}",
        result.loop_factors, result.final_cost, after_optimization
    );

    let merged_points = merge_duplicate_points(graph, &correspondences, params.provenance)?;
    info!("pose graph: merged {} duplicate points", merged_points);

    reconstruct_points(graph, system, settings.loop_loss, &settings.point_refine)?;
    let after_reconstruction = reprojection_stats(graph, system);
    info!("pose graph: reprojection after reconstruction {}", after_reconstruction);

    Ok(PoseGraphReport {
        correspondences: correspondences.len(),
        loop_factors: result.loop_factors,
        merged_points,
        final_cost: result.final_cost,
        before,
        after_optimization,
        after_reconstruction,
    })
}

fn loop_edge(
    graph: &SparseGraph,
    system: &CameraSystem,
    frame_sets: &FrameSetIndex,
    poses: &[Iso3],
    corr: &Correspondence2D3D,
) -> Result<LoopEdge> {
    let (camera_id, query) = graph.observation_context(corr.feature)?;
    let point = graph.point(corr.point)?;
    let first = *point
        .features
        .first()
        .with_context(|| format!("loop point {:?} has no observations", corr.point))?;
    let (_, anchor) = graph.observation_context(first)?;
    let anchor = frame_sets.get(anchor)?;
    Ok(LoopEdge {
        query: frame_sets.get(query)?,
        anchor,
        cam_from_sys: system.global_camera_pose(camera_id)?.inverse(),
        point_in_anchor: poses[anchor]
            .transform_point(&point.position.into())
            .coords,
        ray: graph.feature(corr.feature)?.ray,
    })
}

/// Merge the point matched by each correspondence into the feature's point.
///
/// Returns the number of merges.
pub fn merge_duplicate_points(
    graph: &mut SparseGraph,
    correspondences: &[Correspondence2D3D],
    provenance: PointAttributes,
) -> Result<usize> {
    let mut redirect: HashMap<PointId, PointId> = HashMap::new();
    let resolve = |redirect: &HashMap<PointId, PointId>, mut p: PointId| {
        while let Some(&next) = redirect.get(&p) {
            p = next;
        }
        p
    };

    let mut merged = 0;
    for corr in correspondences {
        let p1 = resolve(&redirect, graph.feature(corr.feature)?.point);
        let p2 = resolve(&redirect, corr.point);
        graph.point_mut(p1)?.attributes.insert(provenance);
        if graph.merge_points(p1, p2)? {
            redirect.insert(p2, p1);
            merged += 1;
        }
    }
    Ok(merged)
}

/// Reset every point from its stereo anchor, then refine it against its
/// observations.
pub fn reconstruct_points(
    graph: &mut SparseGraph,
    system: &CameraSystem,
    loss: RobustLoss,
    opts: &BackendSolveOptions,
) -> Result<()> {
    let points = graph.scene_points();
    for &pid in &points {
        let initial = graph.retriangulate_from_stereo(pid, system)?;
        let observations = graph
            .point(pid)?
            .features
            .iter()
            .map(|&f| {
                Ok(PointObservation {
                    cam_from_world: graph.camera_from_world(f, system)?,
                    ray: graph.feature(f)?.ray,
                })
            })
            .collect::<Result<Vec<_>>>()?;
        let refined = optimize_point(initial, &observations, loss, opts)?;
        graph.point_mut(pid)?.position = refined;
    }
    debug!("reconstructed {} points", points.len());
    Ok(())
}

/// Pose graph over the merged map with loops between rigs.
pub fn step_global_pose_graph(
    system: &CameraSystem,
    graph: &mut SparseGraph,
    search: &dyn LoopClosureSearch,
    config: &CalibrationConfig,
    opts: Option<PoseGraphStepOptions>,
) -> Result<PoseGraphReport, CalibError> {
    let opts = opts.unwrap_or_default();
    let mask = MatchingMask::inter_rig(system.camera_count());
    let params = LoopClosureParams {
        vocabulary: &config.io.vocabulary_path,
        mask: &mask,
        thresholds: LoopClosureConfig {
            min_correspondences: opts
                .min_correspondences
                .unwrap_or(config.global_loop.min_correspondences),
            n_image_matches: opts
                .n_image_matches
                .unwrap_or(config.global_loop.n_image_matches),
        },
        provenance: PointAttributes::OBSERVED_BY_MULTIPLE_STEREO_RIGS,
    };
    let mut settings = PoseGraphSolveSettings::from_config(config);
    if let Some(max_iters) = opts.max_iters {
        settings.pose_graph.max_iters = max_iters;
    }
    optimize_with_loop_closures(graph, system, search, &params, &settings).stage("pose_graph")
}

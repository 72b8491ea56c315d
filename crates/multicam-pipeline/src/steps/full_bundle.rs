//! Joint refinement of the whole camera system on the merged map.

use anyhow::Result;
use log::{info, warn};
use multicam_core::{
    reprojection_stats, CameraSystem, ChessboardData, PointAttributes, PointId, SparseGraph,
};
use multicam_optim::problems::full_bundle::{
    optimize_full_bundle, BundlePoint, ChessboardRig, FeatureObservation, FullBundleCamera,
    FullBundleDataset, FullBundleOptions, FullBundleReport,
};
use multicam_optim::params::distortion::BrownConrady5Params;
use multicam_optim::params::intrinsics::Intrinsics4;
use multicam_optim::IterationObserver;

use super::FrameSetIndex;
use crate::config::CalibrationConfig;
use crate::error::StageContext;
use crate::CalibError;

/// Options for [`step_full_bundle`].
#[derive(Debug, Clone, Default)]
pub struct FullBundleStepOptions {
    /// Override the maximum number of iterations.
    pub max_iters: Option<usize>,
    /// Override intrinsics fixing.
    pub fix_intrinsics: Option<bool>,
}

/// Refine intrinsics, extrinsics, poses and points of the merged map.
///
/// `chessboards[r]` holds the stereo chessboard captures of rig `r`, if any.
/// Points with two or fewer observations stay out of the problem and are
/// reset from their stereo anchors afterwards.
pub fn step_full_bundle(
    system: &mut CameraSystem,
    graph: &mut SparseGraph,
    chessboards: &[Option<ChessboardData>],
    config: &CalibrationConfig,
    opts: Option<FullBundleStepOptions>,
    observer: Option<&mut dyn IterationObserver>,
) -> Result<FullBundleReport, CalibError> {
    let opts = opts.unwrap_or_default();
    let full_ba = &config.full_ba;
    let bundle_opts = FullBundleOptions {
        feature_loss: config.robust.pixel,
        chessboard_loss: config.robust.chessboard,
        fix_intrinsics: opts.fix_intrinsics.unwrap_or(full_ba.fix_intrinsics),
        fix_k3: full_ba.fix_k3,
        fix_extrinsics: if full_ba.fix_first_extrinsic { vec![0] } else { Vec::new() },
        fix_poses: if full_ba.fix_first_pose { vec![0] } else { Vec::new() },
        observer_stride: full_ba.observer_stride.max(1),
        solve: config
            .solver
            .solve_options(opts.max_iters.unwrap_or(config.solver.full_ba_max_iters)),
    };

    let before = reprojection_stats(graph, system);
    let (dataset, frame_sets, points) =
        bundle_dataset(system, graph, chessboards).stage("full_ba")?;
    let result = optimize_full_bundle(&dataset, &bundle_opts, observer).stage("full_ba")?;

    for (c, cam) in result.cameras.iter().enumerate() {
        let target = system.camera_mut(c).stage("full_ba")?;
        target.camera.k = cam.intrinsics.to_core();
        target.camera.dist = cam.distortion.to_core();
        target.global_pose = cam.cam_from_sys.inverse();
    }
    frame_sets
        .write_poses(graph, &result.poses)
        .stage("full_ba")?;
    for (&pid, position) in points.iter().zip(&result.points) {
        graph.point_mut(pid).stage("full_ba")?.position = *position;
    }
    for &j in &result.singletons {
        graph
            .retriangulate_from_stereo(points[j], system)
            .stage("full_ba")?;
    }

    let report = result.report;
    let counts = report.counts;
    info!(
        "full BA: {} single-rig, {} multi-rig, {} chessboard residuals; {} singleton points",
        counts.single_rig,
        counts.multi_rig,
        counts.chessboard,
        result.singletons.len()
    );
    for (name, n) in [
        ("single-rig", counts.single_rig),
        ("multi-rig", counts.multi_rig),
        ("chessboard", counts.chessboard),
    ] {
        if n == 0 {
            warn!("full BA: no {} residuals, class skipped", name);
        }
    }
    info!(
        "full BA: weights single = {:.3}, multi = {:.3}, chessboard = {:.3}, final cost {:.4e}",
        report.weights.single_rig,
        report.weights.multi_rig,
        report.weights.chessboard,
        report.final_cost
    );
    for (c, (b, a)) in report
        .chessboard_rms_before
        .iter()
        .zip(&report.chessboard_rms_after)
        .enumerate()
    {
        if let (Some(b), Some(a)) = (b, a) {
            info!("full BA: camera {} chessboard RMS {:.4} -> {:.4} px", c, b, a);
        }
    }
    info!("full BA: reprojection before {}", before);
    info!("full BA: reprojection after  {}", reprojection_stats(graph, system));
    Ok(report)
}

fn bundle_dataset(
    system: &CameraSystem,
    graph: &SparseGraph,
    chessboards: &[Option<ChessboardData>],
) -> Result<(FullBundleDataset, FrameSetIndex, Vec<PointId>)> {
    let frame_sets = FrameSetIndex::new(graph);
    let points = graph.scene_points();

    let cameras = system
        .cameras()
        .iter()
        .map(|cam| FullBundleCamera {
            intrinsics: Intrinsics4::from_core(&cam.camera.k),
            distortion: BrownConrady5Params::from_core(&cam.camera.dist),
            cam_from_sys: cam.global_pose.inverse(),
        })
        .collect();

    let mut bundle_points = Vec::with_capacity(points.len());
    let mut features = Vec::new();
    for (j, &pid) in points.iter().enumerate() {
        let point = graph.point(pid)?;
        bundle_points.push(BundlePoint {
            position: point.position,
            multi_rig: point
                .attributes
                .contains(PointAttributes::OBSERVED_BY_MULTIPLE_STEREO_RIGS),
        });
        for &fid in &point.features {
            let (camera, frame_set) = graph.observation_context(fid)?;
            features.push(FeatureObservation {
                camera,
                pose: frame_sets.get(frame_set)?,
                point: j,
                uv: graph.feature(fid)?.keypoint,
            });
        }
    }

    let chessboards = chessboards
        .iter()
        .enumerate()
        .take(system.rig_count())
        .filter_map(|(rig, data)| {
            let (left, right) = system.rig_cameras(rig);
            data.as_ref().map(|data| ChessboardRig {
                left,
                right,
                data: data.clone(),
            })
        })
        .collect();

    let dataset = FullBundleDataset {
        cameras,
        poses: frame_sets.poses(graph)?,
        points: bundle_points,
        features,
        chessboards,
    };
    Ok((dataset, frame_sets, points))
}

//! Visual bundle adjustment of one rig's trajectory and map.
//!
//! Camera extrinsics are known constants; system poses and scene points are
//! optimized against normalized image-plane observations of the feature rays.

use crate::backend::{solve_with_backend, BackendKind, BackendSolveOptions};
use crate::ir::{FactorKind, FixedMask, ManifoldKind, ProblemIR, ResidualBlock, RobustLoss};
use crate::params::pose_se3::{iso3_to_se3_array, iso3_to_se3_dvec};
use crate::problems::{ray_obs, solved_point, solved_pose};
use anyhow::{ensure, Result};
use log::debug;
use multicam_core::{Iso3, Vec3};
use nalgebra::DVector;
use std::collections::HashMap;

/// One feature: `pose` and `point` index into the dataset.
#[derive(Debug, Clone)]
pub struct RayObservation {
    pub pose: usize,
    pub point: usize,
    /// Inverse of the observing camera's global pose.
    pub cam_from_sys: Iso3,
    /// Unit bearing in the camera frame.
    pub ray: Vec3,
}

#[derive(Debug, Clone, Default)]
pub struct RigBundleDataset {
    /// `sys_from_world` per frame set.
    pub poses: Vec<Iso3>,
    pub points: Vec<Vec3>,
    pub observations: Vec<RayObservation>,
}

#[derive(Debug, Clone)]
pub struct RigBundleOptions {
    pub robust_loss: RobustLoss,
    /// Pose indices held constant.
    pub fix_poses: Vec<usize>,
    pub solve: BackendSolveOptions,
}

impl Default for RigBundleOptions {
    fn default() -> Self {
        Self {
            robust_loss: RobustLoss::Huber { scale: 2e-3 },
            fix_poses: vec![0],
            solve: BackendSolveOptions::with_max_iters(1000),
        }
    }
}

#[derive(Debug, Clone)]
pub struct RigBundleResult {
    pub poses: Vec<Iso3>,
    pub points: Vec<Vec3>,
    pub final_cost: f64,
    /// Observations dropped because their ray does not point forward.
    pub skipped: usize,
}

/// Build IR for the rig bundle adjustment.
///
/// Returns the IR, its initial values and the number of skipped observations.
pub fn build_rig_bundle_ir(
    dataset: &RigBundleDataset,
    opts: &RigBundleOptions,
) -> Result<(ProblemIR, HashMap<String, DVector<f64>>, usize)> {
    let mut ir = ProblemIR::new();
    let mut initial = HashMap::new();

    let mut pose_ids = Vec::with_capacity(dataset.poses.len());
    for (k, pose) in dataset.poses.iter().enumerate() {
        let fixed = if opts.fix_poses.contains(&k) {
            FixedMask::all_fixed(7)
        } else {
            FixedMask::all_free()
        };
        let key = format!("pose/{k}");
        pose_ids.push(ir.add_param_block(&key, 7, ManifoldKind::SE3, fixed));
        initial.insert(key, iso3_to_se3_dvec(pose));
    }

    let mut point_ids = Vec::with_capacity(dataset.points.len());
    for (j, point) in dataset.points.iter().enumerate() {
        let key = format!("point/{j}");
        point_ids.push(ir.add_param_block(&key, 3, ManifoldKind::Euclidean, FixedMask::all_free()));
        initial.insert(key, DVector::from_column_slice(point.as_slice()));
    }

    let mut skipped = 0;
    for obs in &dataset.observations {
        ensure!(
            obs.pose < pose_ids.len() && obs.point < point_ids.len(),
            "observation references pose {} / point {} out of range",
            obs.pose,
            obs.point
        );
        let Some(uv) = ray_obs(&obs.ray) else {
            skipped += 1;
            continue;
        };
        ir.add_residual_block(ResidualBlock::new(
            vec![pose_ids[obs.pose], point_ids[obs.point]],
            FactorKind::RayReprojPosePoint {
                cam_from_sys: iso3_to_se3_array(&obs.cam_from_sys),
                obs: uv,
                w: 1.0,
            },
            opts.robust_loss,
        ));
    }
    if skipped > 0 {
        debug!("rig bundle: {} observations behind the camera skipped", skipped);
    }

    ir.validate()?;
    Ok((ir, initial, skipped))
}

/// Optimize poses and points of one rig.
pub fn optimize_rig_bundle(
    dataset: &RigBundleDataset,
    opts: &RigBundleOptions,
) -> Result<RigBundleResult> {
    let (ir, initial, skipped) = build_rig_bundle_ir(dataset, opts)?;
    let solution = solve_with_backend(BackendKind::TinySolver, &ir, &initial, &opts.solve)?;

    let poses = (0..dataset.poses.len())
        .map(|k| solved_pose(&solution.params, &format!("pose/{k}")))
        .collect::<Result<Vec<_>>>()?;
    let points = (0..dataset.points.len())
        .map(|j| solved_point(&solution.params, &format!("point/{j}")))
        .collect::<Result<Vec<_>>>()?;

    Ok(RigBundleResult {
        poses,
        points,
        final_cost: solution.final_cost,
        skipped,
    })
}

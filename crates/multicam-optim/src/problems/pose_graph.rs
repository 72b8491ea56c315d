//! Pose graph over frame sets: odometry chains plus loop-closure reprojections.
//!
//! Each frame set contributes one SE3 block (`sys_from_world`). Odometry edges
//! keep consecutive poses at their measured relative motion; loop edges pull a
//! query pose so that a point anchored in another frame set reprojects onto
//! the query feature.

use crate::backend::{solve_with_backend, BackendKind, BackendSolveOptions};
use crate::ir::{FactorKind, FixedMask, ManifoldKind, ProblemIR, ResidualBlock, RobustLoss};
use crate::params::pose_se3::{iso3_to_se3_array, iso3_to_se3_dvec};
use crate::problems::{ray_obs, solved_pose};
use anyhow::{ensure, Result};
use multicam_core::{Iso3, Vec3};
use nalgebra::DVector;
use std::collections::HashMap;

/// Relative motion `to * inv(from)` observed between two poses.
#[derive(Debug, Clone)]
pub struct OdometryEdge {
    pub from: usize,
    pub to: usize,
    pub measured: Iso3,
}

/// A feature at frame set `query` matched to a point anchored at `anchor`.
#[derive(Debug, Clone)]
pub struct LoopEdge {
    pub query: usize,
    pub anchor: usize,
    pub cam_from_sys: Iso3,
    /// Point in the anchor's system frame.
    pub point_in_anchor: Vec3,
    pub ray: Vec3,
}

#[derive(Debug, Clone, Default)]
pub struct PoseGraphDataset {
    pub poses: Vec<Iso3>,
    pub odometry: Vec<OdometryEdge>,
    pub loops: Vec<LoopEdge>,
}

impl PoseGraphDataset {
    /// Odometry edges between consecutive entries of each index chain,
    /// measured from the current pose estimates.
    pub fn chain_odometry(poses: &[Iso3], chains: &[Vec<usize>]) -> Vec<OdometryEdge> {
        chains
            .iter()
            .flat_map(|chain| chain.windows(2))
            .map(|w| OdometryEdge {
                from: w[0],
                to: w[1],
                measured: poses[w[1]] * poses[w[0]].inverse(),
            })
            .collect()
    }
}

#[derive(Debug, Clone)]
pub struct PoseGraphOptions {
    pub odometry_weight: f64,
    pub loop_loss: RobustLoss,
    pub fix_poses: Vec<usize>,
    pub solve: BackendSolveOptions,
}

impl Default for PoseGraphOptions {
    fn default() -> Self {
        Self {
            odometry_weight: 1.0,
            loop_loss: RobustLoss::Huber { scale: 2e-3 },
            fix_poses: vec![0],
            solve: BackendSolveOptions::with_max_iters(100),
        }
    }
}

#[derive(Debug, Clone)]
pub struct PoseGraphResult {
    pub poses: Vec<Iso3>,
    pub final_cost: f64,
    /// Loop edges that produced a residual block.
    pub loop_factors: usize,
}

pub fn build_pose_graph_ir(
    dataset: &PoseGraphDataset,
    opts: &PoseGraphOptions,
) -> Result<(ProblemIR, HashMap<String, DVector<f64>>, usize)> {
    ensure!(opts.odometry_weight > 0.0, "odometry weight must be positive");
    let n = dataset.poses.len();
    let mut ir = ProblemIR::new();
    let mut initial = HashMap::new();

    let mut pose_ids = Vec::with_capacity(n);
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

    for edge in &dataset.odometry {
        ensure!(
            edge.from < n && edge.to < n && edge.from != edge.to,
            "invalid odometry edge {} -> {}",
            edge.from,
            edge.to
        );
        ir.add_residual_block(ResidualBlock::new(
            vec![pose_ids[edge.from], pose_ids[edge.to]],
            FactorKind::RelativePose {
                measured: iso3_to_se3_array(&edge.measured),
                w: opts.odometry_weight,
            },
            RobustLoss::None,
        ));
    }

    let mut loop_factors = 0;
    for edge in &dataset.loops {
        ensure!(
            edge.query < n && edge.anchor < n,
            "loop edge {} -> {} out of range",
            edge.query,
            edge.anchor
        );
        if edge.query == edge.anchor {
            continue;
        }
        let Some(uv) = ray_obs(&edge.ray) else {
            continue;
        };
        let p = edge.point_in_anchor;
        ir.add_residual_block(ResidualBlock::new(
            vec![pose_ids[edge.query], pose_ids[edge.anchor]],
            FactorKind::RayReprojLoop {
                cam_from_sys: iso3_to_se3_array(&edge.cam_from_sys),
                point_in_anchor: [p.x, p.y, p.z],
                obs: uv,
                w: 1.0,
            },
            opts.loop_loss,
        ));
        loop_factors += 1;
    }

    ir.validate()?;
    Ok((ir, initial, loop_factors))
}

pub fn optimize_pose_graph(
    dataset: &PoseGraphDataset,
    opts: &PoseGraphOptions,
) -> Result<PoseGraphResult> {
    let (ir, initial, loop_factors) = build_pose_graph_ir(dataset, opts)?;
    let solution = solve_with_backend(BackendKind::TinySolver, &ir, &initial, &opts.solve)?;
    let poses = (0..dataset.poses.len())
        .map(|k| solved_pose(&solution.params, &format!("pose/{k}")))
        .collect::<Result<Vec<_>>>()?;
    Ok(PoseGraphResult {
        poses,
        final_cost: solution.final_cost,
        loop_factors,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn self_loops_produce_no_factor() {
        let poses = vec![Iso3::identity(), Iso3::translation(0.1, 0.0, 0.0)];
        let dataset = PoseGraphDataset {
            odometry: PoseGraphDataset::chain_odometry(&poses, &[vec![0, 1]]),
            loops: vec![LoopEdge {
                query: 1,
                anchor: 1,
                cam_from_sys: Iso3::identity(),
                point_in_anchor: Vec3::new(0.0, 0.0, 3.0),
                ray: Vec3::z(),
            }],
            poses,
        };
        let (ir, _, loops) = build_pose_graph_ir(&dataset, &PoseGraphOptions::default()).unwrap();
        assert_eq!(loops, 0);
        assert_eq!(ir.residuals.len(), 1);
    }
}

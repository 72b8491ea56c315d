//! Refinement of a single scene point against its own observations.

use crate::backend::{solve_with_backend, BackendKind, BackendSolveOptions};
use crate::ir::{FactorKind, FixedMask, ManifoldKind, ProblemIR, ResidualBlock, RobustLoss};
use crate::params::pose_se3::iso3_to_se3_array;
use crate::problems::{ray_obs, solved_point};
use anyhow::Result;
use multicam_core::{Iso3, Vec3};
use nalgebra::DVector;
use std::collections::HashMap;

#[derive(Debug, Clone)]
pub struct PointObservation {
    pub cam_from_world: Iso3,
    pub ray: Vec3,
}

/// Refine `initial` so that it reprojects onto every observing ray.
///
/// Observations whose ray does not point forward are ignored. Without any
/// usable observation the initial position is returned unchanged.
pub fn optimize_point(
    initial: Vec3,
    observations: &[PointObservation],
    robust_loss: RobustLoss,
    opts: &BackendSolveOptions,
) -> Result<Vec3> {
    let mut ir = ProblemIR::new();
    let point = ir.add_param_block("point", 3, ManifoldKind::Euclidean, FixedMask::all_free());
    for obs in observations {
        let Some(uv) = ray_obs(&obs.ray) else {
            continue;
        };
        ir.add_residual_block(ResidualBlock::new(
            vec![point],
            FactorKind::RayReprojPoint {
                cam_from_world: iso3_to_se3_array(&obs.cam_from_world),
                obs: uv,
                w: 1.0,
            },
            robust_loss,
        ));
    }
    if ir.residuals.is_empty() {
        return Ok(initial);
    }

    let init = HashMap::from([(
        "point".to_string(),
        DVector::from_column_slice(initial.as_slice()),
    )]);
    let solution = solve_with_backend(BackendKind::TinySolver, &ir, &init, opts)?;
    solved_point(&solution.params, "point")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn no_usable_observation_keeps_initial() {
        let p = Vec3::new(1.0, 2.0, 3.0);
        let obs = [PointObservation {
            cam_from_world: Iso3::identity(),
            ray: -Vec3::z(),
        }];
        let out = optimize_point(p, &obs, RobustLoss::None, &BackendSolveOptions::default())
            .unwrap();
        assert_eq!(out, p);
    }
}

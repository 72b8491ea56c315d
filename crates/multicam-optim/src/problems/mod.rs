//! Problem builders.
//!
//! Each problem turns plain geometric data (poses, points, rays, pixels) into
//! a [`ProblemIR`](crate::ir::ProblemIR) plus initial values, solves it with a
//! backend and converts the solution back into typed results.

pub mod full_bundle;
pub mod point_refine;
pub mod pose_graph;
pub mod rig_bundle;

use anyhow::{anyhow, Result};
use multicam_core::{Iso3, Vec3};
use nalgebra::DVector;
use std::collections::HashMap;

use crate::params::pose_se3::se3_dvec_to_iso3;

/// Rays at or behind this depth cannot be normalized.
pub(crate) const MIN_RAY_DEPTH: f64 = 1e-9;

/// Normalized image-plane observation `(x/z, y/z)` of a camera-frame ray.
pub(crate) fn ray_obs(ray: &Vec3) -> Option<[f64; 2]> {
    if ray.z <= MIN_RAY_DEPTH {
        return None;
    }
    Some([ray.x / ray.z, ray.y / ray.z])
}

pub(crate) fn solved_block<'a>(
    params: &'a HashMap<String, DVector<f64>>,
    key: &str,
) -> Result<&'a DVector<f64>> {
    params
        .get(key)
        .ok_or_else(|| anyhow!("solution is missing parameter block {}", key))
}

pub(crate) fn solved_pose(params: &HashMap<String, DVector<f64>>, key: &str) -> Result<Iso3> {
    se3_dvec_to_iso3(solved_block(params, key)?.as_view())
}

pub(crate) fn solved_point(params: &HashMap<String, DVector<f64>>, key: &str) -> Result<Vec3> {
    let v = solved_block(params, key)?;
    anyhow::ensure!(v.len() == 3, "point block {} has dim {}", key, v.len());
    Ok(Vec3::new(v[0], v[1], v[2]))
}

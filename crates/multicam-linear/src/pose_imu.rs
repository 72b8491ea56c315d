//! Rotation between the system frame and an inertial measurement unit.
//!
//! System poses map world into system coordinates; IMU orientations map IMU
//! coordinates into the IMU's own (gravity-aligned) world. Relative motions of
//! both chains are conjugate through the fixed rotation `X = R_sys_imu`:
//! `A_k X = X B_k`.

use anyhow::{ensure, Result};
use log::debug;
use multicam_core::{Iso3, Quat, Real};

use crate::handeye::solve_rotation;

/// Minimum number of paired samples.
pub const MIN_POSE_IMU_SAMPLES: usize = 3;

/// Result of [`calibrate_pose_imu`].
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PoseImuCalibration {
    /// Rotation from the IMU frame into the system frame.
    pub sys_from_imu: Quat,
    pub mean_error_deg: Real,
    pub max_error_deg: Real,
    pub pair_count: usize,
}

/// Estimate `R_sys_imu` from synchronized system poses and IMU orientations.
///
/// `system_poses[k]` is `sys_from_world` and `imu_orientations[k]` is
/// `world_from_imu` at the same instant. Consecutive pairs rotating less than
/// `min_angle_deg` are ignored.
///
/// # Errors
///
/// Fails on mismatched lengths, fewer than [`MIN_POSE_IMU_SAMPLES`] samples,
/// no usable motion pair or degenerate rotation axes.
pub fn calibrate_pose_imu(
    system_poses: &[Iso3],
    imu_orientations: &[Quat],
    min_angle_deg: Real,
    degeneracy_eps: Real,
) -> Result<PoseImuCalibration> {
    ensure!(
        system_poses.len() == imu_orientations.len(),
        "pose/IMU sample count mismatch: {} vs {}",
        system_poses.len(),
        imu_orientations.len()
    );
    ensure!(
        system_poses.len() >= MIN_POSE_IMU_SAMPLES,
        "need at least {} pose/IMU samples, got {}",
        MIN_POSE_IMU_SAMPLES,
        system_poses.len()
    );

    let min_angle = min_angle_deg.to_radians();
    let mut pairs = Vec::with_capacity(system_poses.len() - 1);
    for k in 0..system_poses.len() - 1 {
        let a = system_poses[k + 1].rotation * system_poses[k].rotation.inverse();
        let b = imu_orientations[k + 1].inverse() * imu_orientations[k];
        if a.angle().min(b.angle()) < min_angle {
            debug!("pose/IMU pair {} rejected: small rotation", k);
            continue;
        }
        pairs.push((a, b));
    }
    ensure!(!pairs.is_empty(), "no pose/IMU motion pair rotates enough");

    let x = solve_rotation(&pairs, degeneracy_eps)?;
    let errors: Vec<Real> = pairs
        .iter()
        .map(|(a, b)| ((a * x).angle_to(&(x * b))).to_degrees())
        .collect();
    let mean_error_deg = errors.iter().sum::<Real>() / errors.len() as Real;
    let max_error_deg = errors.iter().copied().fold(0.0, Real::max);

    Ok(PoseImuCalibration {
        sys_from_imu: x,
        mean_error_deg,
        max_error_deg,
        pair_count: pairs.len(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use nalgebra::UnitQuaternion;

    #[test]
    fn too_few_samples_fail() {
        let poses = [Iso3::identity(); 2];
        let imu = [UnitQuaternion::identity(); 2];
        assert!(calibrate_pose_imu(&poses, &imu, 0.5, 1e-6).is_err());
    }

    #[test]
    fn identity_motion_has_no_pairs() {
        let poses = [Iso3::identity(); 4];
        let imu = [UnitQuaternion::identity(); 4];
        let err = calibrate_pose_imu(&poses, &imu, 0.5, 1e-6).unwrap_err();
        assert!(err.to_string().contains("rotates enough"));
    }
}

use log::{info, warn};
use multicam_core::{rotation_iso, CameraSystem, SparseGraph};
use multicam_linear::{calibrate_pose_imu, PoseImuCalibration, MIN_POSE_IMU_SAMPLES};

use crate::config::CalibrationConfig;
use crate::error::StageContext;
use crate::CalibError;

/// Options for [`step_imu_alignment`].
#[derive(Debug, Clone, Default)]
pub struct ImuStepOptions {
    /// Override minimum motion angle (degrees).
    pub min_angle_deg: Option<f64>,
}

/// Estimate the system-to-IMU rotation and re-express every camera in the
/// IMU frame.
///
/// Uses the segment-0 frame sets that carry an IMU sample.
pub fn step_imu_alignment(
    system: &mut CameraSystem,
    graph: &SparseGraph,
    config: &CalibrationConfig,
    opts: Option<ImuStepOptions>,
) -> Result<PoseImuCalibration, CalibError> {
    let opts = opts.unwrap_or_default();
    let mut poses = Vec::new();
    let mut orientations = Vec::new();
    for &id in graph.segment(0) {
        let frame_set = graph.frame_set(id).stage("imu")?;
        if let Some(imu) = &frame_set.imu {
            poses.push(frame_set.pose.to_iso());
            orientations.push(imu.orientation);
        }
    }
    if poses.len() < MIN_POSE_IMU_SAMPLES {
        return Err(CalibError::InsufficientData(format!(
            "{} frame sets with IMU data, need {}",
            poses.len(),
            MIN_POSE_IMU_SAMPLES
        )));
    }

    let calib = calibrate_pose_imu(
        &poses,
        &orientations,
        opts.min_angle_deg.unwrap_or(config.imu.min_angle_deg),
        config.handeye.degeneracy_eps,
    )
    .map_err(|e| CalibError::InsufficientData(format!("{:#}", e)))?;

    let imu_from_sys = rotation_iso(&calib.sys_from_imu.inverse());
    for cam in 0..system.camera_count() {
        let pose = system.global_camera_pose(cam).stage("imu")?;
        system
            .set_global_camera_pose(cam, imu_from_sys * pose)
            .stage("imu")?;
    }

    info!(
        "pose-IMU rotation from {} pairs: mean error {:.4} deg, max error {:.4} deg",
        calib.pair_count, calib.mean_error_deg, calib.max_error_deg
    );
    if calib.max_error_deg > 1.0 {
        warn!("pose-IMU residual exceeds 1 deg; check IMU synchronization");
    }
    Ok(calib)
}

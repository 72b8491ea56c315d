use log::info;
use multicam_core::{CameraSystem, Vec3};

use crate::error::StageContext;
use crate::CalibError;

/// Shift every camera so the mean camera position is the origin.
///
/// Rotations are untouched. Returns the removed centroid.
pub fn step_recenter(system: &mut CameraSystem) -> Result<Vec3, CalibError> {
    let centroid = system.translation_centroid();
    for cam in 0..system.camera_count() {
        let mut pose = system.global_camera_pose(cam).stage("recenter")?;
        pose.translation.vector -= centroid;
        system.set_global_camera_pose(cam, pose).stage("recenter")?;
    }
    info!(
        "recentered camera system by [{:.4}, {:.4}, {:.4}]",
        centroid.x, centroid.y, centroid.z
    );
    Ok(centroid)
}

#[cfg(test)]
mod tests {
    use super::*;
    use multicam_core::synthetic::{MultiRigConfig, MultiRigScene};

    #[test]
    fn recentering_is_idempotent() {
        let scene = MultiRigScene::new(&MultiRigConfig {
            rigs: 3,
            ..MultiRigConfig::default()
        });
        let mut system = scene.camera_system.clone();
        let first = step_recenter(&mut system).unwrap();
        assert!(first.norm() > 0.1);
        assert!(system.translation_centroid().norm() < 1e-12);

        let once = system.clone();
        let second = step_recenter(&mut system).unwrap();
        assert!(second.norm() < 1e-12);
        for (a, b) in once.cameras().iter().zip(system.cameras()) {
            assert!((a.global_pose.translation.vector - b.global_pose.translation.vector).norm() < 1e-12);
            assert_eq!(a.global_pose.rotation, b.global_pose.rotation);
        }
    }
}

//! Linear initialization of the rig extrinsics from per-rig trajectories.

use log::{info, warn};
use multicam_core::{CameraSystem, Iso3, SparseGraph};
use multicam_linear::{estimate_rig_transform, relative_motions, HandEyeOptions};

use crate::config::HandeyeConfig;
use crate::error::StageContext;
use crate::CalibError;

/// Options for [`step_handeye`].
#[derive(Debug, Clone, Default)]
pub struct HandeyeStepOptions {
    /// Override minimum motion angle (degrees).
    pub min_angle_deg: Option<f64>,
}

/// Estimate `H_i0` for every rig `i >= 1` and move its cameras into rig 0's
/// frame.
///
/// Returns one entry per rig; rig 0 is the identity and rigs whose
/// trajectory has no motion are `None` and left in place.
///
/// # Errors
///
/// - fewer than 2 rigs
/// - a rig whose motion pairs are unusable or degenerate
pub fn step_handeye(
    system: &mut CameraSystem,
    sub_graphs: &[SparseGraph],
    config: &HandeyeConfig,
    opts: Option<HandeyeStepOptions>,
) -> Result<Vec<Option<Iso3>>, CalibError> {
    let rigs = system.rig_count().min(sub_graphs.len());
    if rigs < 2 {
        return Err(CalibError::InsufficientRigs { found: rigs });
    }
    let opts = opts.unwrap_or_default();
    let handeye = HandEyeOptions {
        min_angle_deg: opts.min_angle_deg.unwrap_or(config.min_angle_deg),
        degeneracy_eps: config.degeneracy_eps,
        ridge: config.ridge,
    };

    let motions = sub_graphs[..rigs]
        .iter()
        .map(|graph| {
            let poses = graph
                .segment(0)
                .iter()
                .map(|&id| Ok(graph.frame_set(id)?.pose.to_iso()))
                .collect::<anyhow::Result<Vec<_>>>()?;
            Ok(relative_motions(&poses))
        })
        .collect::<anyhow::Result<Vec<_>>>()
        .stage("handeye")?;

    let mut estimates = vec![Some(Iso3::identity())];
    for rig in 1..rigs {
        if motions[0].is_empty() || motions[rig].is_empty() {
            warn!("hand-eye: rig {} has no motion, keeping its cameras in place", rig);
            estimates.push(None);
            continue;
        }
        let x = estimate_rig_transform(&motions[0], &motions[rig], &handeye)
            .map_err(|e| e.context(format!("rig {}", rig)))
            .stage("handeye")?;
        let (left, right) = system.rig_cameras(rig);
        for cam in [left, right] {
            let pose = system.global_camera_pose(cam).stage("handeye")?;
            system
                .set_global_camera_pose(cam, x * pose)
                .stage("handeye")?;
        }
        let t = x.translation.vector;
        info!(
            "hand-eye: rig {} -> rig 0: t = [{:.4}, {:.4}, {:.4}], angle = {:.3} deg",
            rig,
            t.x,
            t.y,
            t.z,
            x.rotation.angle().to_degrees()
        );
        estimates.push(Some(x));
    }
    Ok(estimates)
}

#[cfg(test)]
mod tests {
    use super::*;
    use multicam_core::pose_error;
    use multicam_core::synthetic::{MultiRigConfig, MultiRigScene};

    #[test]
    fn single_rig_is_rejected() {
        let scene = MultiRigScene::new(&MultiRigConfig {
            rigs: 1,
            ..MultiRigConfig::default()
        });
        let mut system = scene.initial_camera_system();
        let err = step_handeye(
            &mut system,
            &[scene.sub_graph(0)],
            &HandeyeConfig::default(),
            None,
        )
        .unwrap_err();
        assert!(matches!(err, CalibError::InsufficientRigs { found: 1 }));
    }

    #[test]
    fn noiseless_rigs_recover_global_poses() {
        let scene = MultiRigScene::new(&MultiRigConfig::default());
        let mut system = scene.initial_camera_system();
        let graphs = [scene.sub_graph(0), scene.sub_graph(1)];
        let estimates =
            step_handeye(&mut system, &graphs, &HandeyeConfig::default(), None).unwrap();
        let (dt, ang) = pose_error(&estimates[1].unwrap(), &scene.rig_extrinsic(1));
        assert!(dt < 1e-6 && ang < 1e-6);
        for cam in 0..system.camera_count() {
            let (dt, ang) = pose_error(
                &system.global_camera_pose(cam).unwrap(),
                &scene.camera_system.global_camera_pose(cam).unwrap(),
            );
            assert!(dt < 1e-6 && ang < 1e-6, "camera {cam}");
        }
    }

    #[test]
    fn static_rig_is_skipped() {
        let scene = MultiRigScene::new(&MultiRigConfig {
            frame_sets: 1,
            ..MultiRigConfig::default()
        });
        let mut system = scene.initial_camera_system();
        let graphs = [scene.sub_graph(0), scene.sub_graph(1)];
        let estimates =
            step_handeye(&mut system, &graphs, &HandeyeConfig::default(), None).unwrap();
        assert_eq!(estimates.len(), 2);
        assert!(estimates[1].is_none());
        assert_eq!(system, scene.initial_camera_system());
    }
}

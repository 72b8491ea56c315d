mod common;

use common::{ingest, ingest_without_imu, DescriptorSearch};
use multicam_core::synthetic::{MultiRigConfig, MultiRigScene};
use multicam_core::{pose_error, reprojection_stats, CameraSystem, ChessboardData, PointAttributes};
use multicam_pipeline::steps::{
    step_full_bundle, step_global_pose_graph, step_handeye, step_merge, step_rig_calibration,
};
use multicam_pipeline::{CalibError, CalibrationConfig, SelfCalibration};
use std::path::Path;

fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

fn config(output_dir: &Path) -> CalibrationConfig {
    let mut config = CalibrationConfig::default();
    config.ingest.keyframe_threshold = usize::MAX;
    config.io.output_dir = output_dir.to_path_buf();
    config
}

fn chessboards(scene: &MultiRigScene) -> Vec<Option<ChessboardData>> {
    (0..scene.rig_count())
        .map(|rig| Some(scene.chessboard(rig)))
        .collect()
}

/// Compare every rig's left camera relative to rig 0 with ground truth.
///
/// Returns the worst translation error (meters) and rotation error (degrees).
fn relative_rig_errors(scene: &MultiRigScene, system: &CameraSystem) -> (f64, f64) {
    let reference = system.global_camera_pose(0).unwrap();
    let mut worst = (0.0_f64, 0.0_f64);
    for rig in 1..scene.rig_count() {
        let (left, _) = system.rig_cameras(rig);
        let estimated = reference.inverse() * system.global_camera_pose(left).unwrap();
        let (dt, angle) = pose_error(&estimated, &scene.rig_extrinsic(rig));
        worst = (worst.0.max(dt), worst.1.max(angle.to_degrees()));
    }
    worst
}

#[test]
fn full_run_recovers_rig_extrinsics() {
    init_logging();
    let scene = MultiRigScene::new(&MultiRigConfig::default());
    let dir = tempfile::tempdir().unwrap();
    let ingestor = ingest(&scene, usize::MAX);
    assert!(ingestor
        .sub_graphs()
        .iter()
        .all(|g| g.frame_set_count() == scene.frame_set_count()));

    let mut calib = SelfCalibration::from_ingestor(
        config(dir.path()),
        scene.initial_camera_system(),
        ingestor,
    );
    let report = calib
        .run(&DescriptorSearch, &chessboards(&scene), None)
        .unwrap();

    assert!(calib.log.iter().all(|entry| entry.success), "{:?}", calib.log);
    assert_eq!(report.rigs.len(), 2);
    assert!(report.handeye.iter().all(Option::is_some));
    assert!(report.pose_graph.correspondences > 0);
    assert!(report.pose_graph.merged_points > 0);
    assert!(report.pose_graph.after_reconstruction.mean_error < 1.0);
    assert!(report.full_bundle.counts.multi_rig > 0);
    assert!(report.full_bundle.counts.chessboard > 0);

    let baseline = scene.rig_extrinsic(1).translation.vector.norm();
    let (dt, angle_deg) = relative_rig_errors(&scene, &calib.system);
    assert!(dt < 0.01 * baseline, "translation error {dt}");
    assert!(angle_deg < 0.5, "rotation error {angle_deg} deg");

    assert!(report.imu.sys_from_imu.angle_to(&scene.sys_from_imu).to_degrees() < 0.5);
    assert!(calib.system.translation_centroid().norm() < 1e-9);

    calib.write_results().unwrap();
    let io = &calib.config.io;
    for path in [
        io.snapshot_path(),
        io.intermediate_poses_path(),
        io.camera_poses_path(),
        io.system_poses_path(),
        dir.path().join("map.wrl"),
    ] {
        assert!(path.exists(), "{} missing", path.display());
    }
}

#[test]
fn resume_from_intermediate_data() {
    init_logging();
    let scene = MultiRigScene::new(&MultiRigConfig::default());
    let dir = tempfile::tempdir().unwrap();
    let mut first = SelfCalibration::from_ingestor(
        config(dir.path()),
        scene.initial_camera_system(),
        ingest(&scene, usize::MAX),
    );
    first.run(&DescriptorSearch, &chessboards(&scene), None).unwrap();

    let mut resumed_config = config(dir.path());
    resumed_config.io.read_intermediate_data = true;
    let mut resumed =
        SelfCalibration::new(resumed_config, scene.initial_camera_system(), Vec::new());
    let report = resumed
        .run(&DescriptorSearch, &chessboards(&scene), None)
        .unwrap();

    assert!(report.rigs.is_empty() && report.handeye.is_empty());
    assert_eq!(resumed.log[0].operation, "read_intermediate_data");
    assert_eq!(resumed.graph.frame_set_count(), scene.frame_set_count());
    let (dt, angle_deg) = relative_rig_errors(&scene, &resumed.system);
    assert!(dt < 5e-3, "translation error {dt}");
    assert!(angle_deg < 0.5, "rotation error {angle_deg} deg");
}

#[test]
fn missing_snapshot_fails_the_resume() {
    let scene = MultiRigScene::new(&MultiRigConfig::default());
    let dir = tempfile::tempdir().unwrap();
    let mut config = config(dir.path());
    config.io.read_intermediate_data = true;
    let mut calib = SelfCalibration::new(config, scene.initial_camera_system(), Vec::new());
    assert!(calib.run(&DescriptorSearch, &[], None).is_err());
    assert_eq!(calib.log.len(), 1);
    assert!(!calib.log[0].success);
}

#[test]
fn run_without_imu_samples_fails_at_the_imu_stage() {
    init_logging();
    let scene = MultiRigScene::new(&MultiRigConfig::default());
    let dir = tempfile::tempdir().unwrap();
    let mut calib = SelfCalibration::from_ingestor(
        config(dir.path()),
        scene.initial_camera_system(),
        ingest_without_imu(&scene),
    );
    let result = calib.run(&DescriptorSearch, &chessboards(&scene), None);

    assert!(matches!(result, Err(CalibError::InsufficientData(_))), "{result:?}");
    let last = calib.log.last().unwrap();
    assert_eq!(last.operation, "imu");
    assert!(!last.success);
    let before_imu = &calib.log[..calib.log.len() - 1];
    assert!(before_imu.iter().all(|entry| entry.success), "{before_imu:?}");
}

#[test]
fn stages_build_a_consistent_merged_map() {
    init_logging();
    let scene = MultiRigScene::new(&MultiRigConfig {
        rigs: 3,
        ..MultiRigConfig::default()
    });
    let config = config(Path::new("."));
    let mut system = scene.initial_camera_system();
    let mut sub_graphs: Vec<_> = (0..scene.rig_count()).map(|r| scene.sub_graph(r)).collect();

    step_rig_calibration(&system, &mut sub_graphs, &DescriptorSearch, &config, None).unwrap();
    let handeye = step_handeye(&mut system, &sub_graphs, &config.handeye, None).unwrap();
    for (rig, x) in handeye.iter().enumerate() {
        let (dt, angle) = pose_error(&x.unwrap(), &scene.rig_extrinsic(rig));
        assert!(dt < 1e-3 && angle < 1e-3, "rig {rig}: {dt} m, {angle} rad");
    }

    let mut graph = step_merge(&system, sub_graphs).unwrap();
    graph.check_links().unwrap();
    assert_eq!(graph.frame_set_count(), scene.frame_set_count());
    assert!(reprojection_stats(&graph, &system).mean_error < 1e-3);

    let pose_graph =
        step_global_pose_graph(&system, &mut graph, &DescriptorSearch, &config, None).unwrap();
    graph.check_links().unwrap();
    assert!(pose_graph.merged_points > 0);
    let multi_rig = graph
        .scene_points()
        .into_iter()
        .filter(|&p| {
            graph
                .point(p)
                .unwrap()
                .attributes
                .contains(PointAttributes::OBSERVED_BY_MULTIPLE_STEREO_RIGS)
        })
        .count();
    assert!(multi_rig > 0);

    let chessboards: Vec<_> = (0..scene.rig_count())
        .map(|rig| Some(scene.chessboard(rig)))
        .collect();
    let report =
        step_full_bundle(&mut system, &mut graph, &chessboards, &config, None, None).unwrap();
    assert!(report.counts.single_rig > 0);
    let stats = reprojection_stats(&graph, &system);
    assert!(stats.mean_error < 1.0, "{stats}");
    let (dt, angle_deg) = relative_rig_errors(&scene, &system);
    assert!(dt < 5e-3 && angle_deg < 0.5, "{dt} m, {angle_deg} deg");
}

//! Snapshots, pose files, VRML export and chessboard loading.

use anyhow::{Context, Result};
use log::{info, warn};
use multicam_core::{
    write_pose_line, CameraSystem, ChessboardData, Iso3, Pt3, SparseGraph, Timestamp,
};
use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use crate::CalibError;

/// Half extent of a camera frustum on its far plane (meters).
const FRUSTUM_HALF_EXTENT: f64 = 0.06;
/// Distance of the frustum far plane (meters).
const FRUSTUM_DEPTH: f64 = 0.08;

/// Write the graph snapshot and the camera poses it was computed with.
pub fn write_intermediate_data(
    graph: &SparseGraph,
    system: &CameraSystem,
    snapshot: &Path,
    poses: &Path,
) -> Result<(), CalibError> {
    graph
        .write_to_binary_file(snapshot)
        .map_err(|e| CalibError::io(snapshot, e))?;
    system
        .write_poses_to_text_file(poses, first_stamp(graph))
        .map_err(|e| CalibError::io(poses, e))?;
    info!(
        "wrote intermediate data to {} and {}",
        snapshot.display(),
        poses.display()
    );
    Ok(())
}

/// Restore a snapshot written by [`write_intermediate_data`].
///
/// The camera poses are read into `system`, which must have the same cameras.
pub fn read_intermediate_data(
    system: &mut CameraSystem,
    snapshot: &Path,
    poses: &Path,
) -> Result<SparseGraph, CalibError> {
    let graph = SparseGraph::read_from_binary_file(snapshot)
        .map_err(|e| CalibError::io(snapshot, e))?;
    system
        .read_poses_from_text_file(poses)
        .map_err(|e| CalibError::io(poses, e))?;
    info!(
        "read {} frame sets and {} points from {}",
        graph.frame_set_count(),
        graph.point_count(),
        snapshot.display()
    );
    Ok(graph)
}

fn first_stamp(graph: &SparseGraph) -> Timestamp {
    graph
        .segments()
        .first()
        .and_then(|s| s.first())
        .and_then(|&id| graph.frame_set(id).ok())
        .map(|fs| fs.pose.stamp)
        .unwrap_or_default()
}

/// Write the segment-0 system poses, one `stamp qx qy qz qw tx ty tz` line each.
pub fn write_system_poses_to_text_file(graph: &SparseGraph, path: &Path) -> Result<(), CalibError> {
    let write = || -> Result<()> {
        let file = File::create(path)?;
        let mut out = BufWriter::new(file);
        if let Some(segment) = graph.segments().first() {
            for &id in segment {
                let pose = &graph.frame_set(id)?.pose;
                write_pose_line(&mut out, pose.stamp.as_secs_f64(), &pose.to_iso())?;
            }
        }
        out.flush()?;
        Ok(())
    };
    write().map_err(|e| CalibError::io(path, e))
}

/// Export the map and one camera rig model per frame set as VRML97.
///
/// `path` receives the point cloud; `<nsec>_pose.wrl` files with the camera
/// frustums of each segment-0 frame set are written next to it.
pub fn write_map_to_vrml(
    graph: &SparseGraph,
    system: &CameraSystem,
    path: &Path,
) -> Result<Vec<PathBuf>, CalibError> {
    let dir = path.parent().unwrap_or_else(|| Path::new("."));
    let mut written = Vec::new();
    if let Some(segment) = graph.segments().first() {
        for &id in segment {
            let pose = &graph.frame_set(id).map_err(|e| CalibError::io(path, e))?.pose;
            let file = dir.join(format!("{}_pose.wrl", pose.stamp.as_nanos()));
            let world_from_sys = pose.to_iso().inverse();
            write_frustums(system, &world_from_sys, &file).map_err(|e| CalibError::io(&file, e))?;
            written.push(file);
        }
    }
    write_point_cloud(graph, path).map_err(|e| CalibError::io(path, e))?;
    written.push(path.to_path_buf());
    Ok(written)
}

fn write_frustums(system: &CameraSystem, world_from_sys: &Iso3, path: &Path) -> Result<()> {
    let apex = Pt3::origin();
    let (e, d) = (FRUSTUM_HALF_EXTENT, FRUSTUM_DEPTH);
    let corners = [
        Pt3::new(-e, -e, d),
        Pt3::new(e, -e, d),
        Pt3::new(e, e, d),
        Pt3::new(-e, e, d),
    ];
    let mut vertices: Vec<Pt3> = Vec::with_capacity(5 * system.camera_count());
    for cam in system.cameras() {
        let world_from_cam = world_from_sys * cam.global_pose;
        vertices.push(world_from_cam.transform_point(&apex));
        vertices.extend(corners.iter().map(|c| world_from_cam.transform_point(c)));
    }

    let mut out = BufWriter::new(File::create(path)?);
    writeln!(out, "#VRML V2.0 utf8")?;
    writeln!(out)?;
    let appearance = "    appearance Appearance {\n        material Material { diffuseColor 0 1 0 }\n    }";

    writeln!(out, "Shape {{")?;
    writeln!(out, "{}", appearance)?;
    writeln!(out, "    geometry IndexedLineSet {{")?;
    write_coordinates(&mut out, &vertices)?;
    writeln!(out, "        coordIndex [")?;
    for base in (0..vertices.len()).step_by(5) {
        for l in 1..5 {
            writeln!(out, "            {}, {}, -1,", base, base + l)?;
        }
    }
    writeln!(out, "        ]")?;
    writeln!(out, "    }}")?;
    writeln!(out, "}}")?;

    writeln!(out, "Shape {{")?;
    writeln!(out, "{}", appearance)?;
    writeln!(out, "    geometry IndexedFaceSet {{")?;
    writeln!(out, "        solid FALSE")?;
    write_coordinates(&mut out, &vertices)?;
    writeln!(out, "        coordIndex [")?;
    for base in (0..vertices.len()).step_by(5) {
        writeln!(
            out,
            "            {}, {}, {}, {}, -1,",
            base + 1,
            base + 2,
            base + 3,
            base + 4
        )?;
    }
    writeln!(out, "        ]")?;
    writeln!(out, "    }}")?;
    writeln!(out, "}}")?;
    out.flush()?;
    Ok(())
}

fn write_coordinates<W: Write>(out: &mut W, points: &[Pt3]) -> Result<()> {
    writeln!(out, "        coord Coordinate {{")?;
    writeln!(out, "            point [")?;
    for p in points {
        writeln!(out, "                {:.5} {:.5} {:.5},", p.x, p.y, p.z)?;
    }
    writeln!(out, "            ]")?;
    writeln!(out, "        }}")?;
    Ok(())
}

fn write_point_cloud(graph: &SparseGraph, path: &Path) -> Result<()> {
    let positions = graph
        .scene_points()
        .into_iter()
        .map(|pid| Ok(Pt3::from(graph.point(pid)?.position)))
        .collect::<Result<Vec<_>>>()?;

    let mut out = BufWriter::new(File::create(path)?);
    writeln!(out, "#VRML V2.0 utf8")?;
    writeln!(out)?;
    writeln!(out, "Shape {{")?;
    writeln!(out, "    geometry PointSet {{")?;
    write_coordinates(&mut out, &positions)?;
    writeln!(out, "    }}")?;
    writeln!(out, "}}")?;
    out.flush()?;
    Ok(())
}

/// Load `<left>_<right>_chessboard_data.json` for every rig.
///
/// A rig without a file gets `None`; a file that fails to parse or validate
/// is an error.
pub fn load_chessboard_data(
    dir: &Path,
    system: &CameraSystem,
) -> Result<Vec<Option<ChessboardData>>, CalibError> {
    (0..system.rig_count())
        .map(|rig| {
            let (l, r) = system.rig_cameras(rig);
            let left = &system.camera(l).map_err(|e| CalibError::io(dir, e))?.name;
            let right = &system.camera(r).map_err(|e| CalibError::io(dir, e))?.name;
            let path = ChessboardData::path_in(dir, left, right);
            if !path.exists() {
                warn!("no chessboard data for rig {} ({})", rig, path.display());
                return Ok(None);
            }
            let data = ChessboardData::read_from_file(&path)
                .and_then(|data| {
                    data.validate()
                        .with_context(|| format!("invalid chessboard data for rig {}", rig))?;
                    Ok(data)
                })
                .map_err(|e| CalibError::io(&path, e))?;
            info!(
                "rig {}: {} chessboard views, {} corners",
                rig,
                data.num_views(),
                data.num_corners()
            );
            Ok(Some(data))
        })
        .collect()
}

/// Create `dir` and its parents when missing.
pub(crate) fn ensure_dir(dir: &Path) -> Result<(), CalibError> {
    fs::create_dir_all(dir).map_err(|e| CalibError::io(dir, e))
}

#[cfg(test)]
mod tests {
    use super::*;
    use multicam_core::synthetic::{MultiRigConfig, MultiRigScene};

    #[test]
    fn vrml_export_writes_one_file_per_frame_set() {
        let scene = MultiRigScene::new(&MultiRigConfig::default());
        let graph = scene.sub_graph(0);
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("map.wrl");
        let written = write_map_to_vrml(&graph, &scene.camera_system, &path).unwrap();
        assert_eq!(written.len(), scene.frame_set_count() + 1);

        let frustum = fs::read_to_string(dir.path().join("100000000_pose.wrl")).unwrap();
        assert!(frustum.starts_with("#VRML V2.0 utf8"));
        assert!(frustum.contains("IndexedLineSet") && frustum.contains("IndexedFaceSet"));
        assert!(frustum.contains("diffuseColor 0 1 0"));
        // 4 cameras, 4 lines each.
        assert_eq!(frustum.matches(", -1,").count(), 4 * 4 + 4);

        let cloud = fs::read_to_string(&path).unwrap();
        assert!(cloud.contains("PointSet"));
        assert_eq!(cloud.lines().filter(|l| l.ends_with(',')).count(), graph.point_count());
    }

    #[test]
    fn system_poses_have_one_line_per_frame_set() {
        let scene = MultiRigScene::new(&MultiRigConfig::default());
        let graph = scene.sub_graph(0);
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("poses.txt");
        write_system_poses_to_text_file(&graph, &path).unwrap();
        let text = fs::read_to_string(&path).unwrap();
        assert_eq!(text.lines().count(), scene.frame_set_count());
        let (stamp, pose) = multicam_core::parse_pose_line(text.lines().nth(2).unwrap()).unwrap();
        assert!((stamp - 0.2).abs() < 1e-9);
        let (dt, ang) = multicam_core::pose_error(&pose, &scene.rig_pose(0, 2));
        assert!(dt < 1e-12 && ang < 1e-12);
    }

    #[test]
    fn intermediate_data_round_trip() {
        let scene = MultiRigScene::new(&MultiRigConfig::default());
        let graph = scene.sub_graph(1);
        let dir = tempfile::tempdir().unwrap();
        let (snapshot, poses) = (dir.path().join("int_map.sg"), dir.path().join("int.txt"));
        write_intermediate_data(&graph, &scene.camera_system, &snapshot, &poses).unwrap();

        let mut system = scene.initial_camera_system();
        let back = read_intermediate_data(&mut system, &snapshot, &poses).unwrap();
        back.check_links().unwrap();
        assert_eq!(back.point_count(), graph.point_count());
        let (dt, _) = multicam_core::pose_error(
            &system.global_camera_pose(3).unwrap(),
            &scene.camera_system.global_camera_pose(3).unwrap(),
        );
        assert!(dt < 1e-12);
    }

    #[test]
    fn missing_chessboards_are_skipped() {
        let scene = MultiRigScene::new(&MultiRigConfig::default());
        let dir = tempfile::tempdir().unwrap();
        let system = &scene.camera_system;
        let data = scene.chessboard(1);
        data.write_to_file(&ChessboardData::path_in(dir.path(), "cam2", "cam3"))
            .unwrap();
        let loaded = load_chessboard_data(dir.path(), system).unwrap();
        assert!(loaded[0].is_none());
        assert_eq!(loaded[1].as_ref().unwrap().num_corners(), data.num_corners());

        fs::write(ChessboardData::path_in(dir.path(), "cam0", "cam1"), "{").unwrap();
        assert!(matches!(
            load_chessboard_data(dir.path(), system),
            Err(CalibError::Io { .. })
        ));
    }
}

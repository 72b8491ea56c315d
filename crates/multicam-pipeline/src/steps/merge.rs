//! Merge of the per-rig maps into one graph expressed in rig 0's world.

use anyhow::Context;
use log::info;
use multicam_core::{reprojection_stats, CameraSystem, SparseGraph};

use crate::error::StageContext;
use crate::CalibError;

/// Fold every rig's frame sets into rig 0's and re-express their points.
///
/// Frame set `k` of rig `i` gives its frames to frame set `k` of rig 0 and
/// its own pose is dropped. Points of rig `i` are reset from their stereo
/// anchors through the merged poses and the current camera poses, so the
/// camera system must already hold the hand-eye estimates.
///
/// With a single rig the graph is returned unchanged.
pub fn step_merge(
    system: &CameraSystem,
    sub_graphs: Vec<SparseGraph>,
) -> Result<SparseGraph, CalibError> {
    let mut graphs = sub_graphs.into_iter();
    let Some(mut merged) = graphs.next() else {
        return Err(CalibError::InsufficientData("no rig graphs to merge".to_string()));
    };
    let rest: Vec<SparseGraph> = graphs.collect();
    if rest.is_empty() {
        return Ok(merged);
    }

    let expected = merged.segment(0).len();
    for (i, graph) in rest.iter().enumerate() {
        let rig = i + 1;
        if graph.segments().len() != 1 || graph.segment(0).len() != expected {
            return Err(CalibError::InsufficientData(format!(
                "rig {} has {} frame sets in {} segment(s), rig 0 has {}",
                rig,
                graph.frame_set_count(),
                graph.segments().len(),
                expected
            )));
        }
    }

    for (i, graph) in rest.into_iter().enumerate() {
        let rig = i + 1;
        let points = graph.scene_points();
        let remap = merged.absorb(graph);
        let segment = remap.segments[0];
        merged
            .fold_segment(segment, 0)
            .with_context(|| format!("folding rig {}", rig))
            .stage("merge")?;
        for p in points {
            let Some(&p) = remap.points.get(&p) else {
                continue;
            };
            merged
                .retriangulate_from_stereo(p, system)
                .with_context(|| format!("re-triangulating rig {} point", rig))
                .stage("merge")?;
        }
    }

    info!(
        "merged map: {} frame sets, {} points, reprojection {}",
        merged.frame_set_count(),
        merged.point_count(),
        reprojection_stats(&merged, system)
    );
    Ok(merged)
}

#[cfg(test)]
mod tests {
    use super::*;
    use multicam_core::synthetic::{MultiRigConfig, MultiRigScene};

    #[test]
    fn merged_segment_matches_sub_graph_length() {
        let scene = MultiRigScene::new(&MultiRigConfig::default());
        let graphs = vec![scene.sub_graph(0), scene.sub_graph(1)];
        let points: usize = graphs.iter().map(SparseGraph::point_count).sum();
        let merged = step_merge(&scene.camera_system, graphs).unwrap();
        merged.check_links().unwrap();
        assert_eq!(merged.segments().len(), 1);
        assert_eq!(merged.segment(0).len(), scene.frame_set_count());
        assert_eq!(merged.point_count(), points);
        for &fs in merged.segment(0) {
            assert_eq!(merged.frame_set(fs).unwrap().frames.len(), 4);
        }
    }

    #[test]
    fn ground_truth_extrinsics_give_a_consistent_map() {
        let scene = MultiRigScene::new(&MultiRigConfig::default());
        let graphs = vec![scene.sub_graph(0), scene.sub_graph(1)];
        let merged = step_merge(&scene.camera_system, graphs).unwrap();
        let stats = reprojection_stats(&merged, &scene.camera_system);
        assert!(stats.mean_error < 1e-6, "{stats}");
    }

    #[test]
    fn length_mismatch_is_rejected() {
        let scene = MultiRigScene::new(&MultiRigConfig::default());
        let short = MultiRigScene::new(&MultiRigConfig {
            frame_sets: 3,
            ..MultiRigConfig::default()
        });
        let err = step_merge(
            &scene.camera_system,
            vec![scene.sub_graph(0), short.sub_graph(1)],
        )
        .unwrap_err();
        assert!(matches!(err, CalibError::InsufficientData(_)));
    }
}

use std::fmt;

use super::SparseGraph;
use crate::{CameraSystem, Real};

/// Pixel reprojection statistics over every feature of a graph.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct ReprojectionStats {
    pub mean_error: Real,
    pub max_error: Real,
    pub mean_depth: Real,
    pub count: usize,
}

impl fmt::Display for ReprojectionStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "avg = {:.3} | max = {:.3} | avg depth = {:.3} | count = {}",
            self.mean_error, self.max_error, self.mean_depth, self.count
        )
    }
}

/// Reproject every live point into each observing camera.
///
/// Observations whose camera index is unknown to `system` or whose point lies
/// behind the camera are skipped.
pub fn reprojection_stats(graph: &SparseGraph, system: &CameraSystem) -> ReprojectionStats {
    let mut sum_err = 0.0;
    let mut sum_depth = 0.0;
    let mut max_error: Real = 0.0;
    let mut count = 0usize;

    for pid in graph.scene_points() {
        let Ok(point) = graph.point(pid) else {
            continue;
        };
        for &fid in &point.features {
            let (Ok(feature), Ok(cam_from_world)) =
                (graph.feature(fid), graph.camera_from_world(fid, system))
            else {
                continue;
            };
            let Ok((camera_id, _)) = graph.observation_context(fid) else {
                continue;
            };
            let Ok(camera) = system.camera(camera_id) else {
                continue;
            };
            let p_c = cam_from_world.transform_point(&point.position.into()).coords;
            let Some(px) = camera.camera.project_point_c(&p_c) else {
                continue;
            };
            let err = (px - feature.keypoint).norm();
            sum_err += err;
            sum_depth += p_c.norm();
            max_error = max_error.max(err);
            count += 1;
        }
    }

    if count == 0 {
        return ReprojectionStats::default();
    }
    ReprojectionStats {
        mean_error: sum_err / count as Real,
        max_error,
        mean_depth: sum_depth / count as Real,
        count,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_graph_reports_zeros() {
        let scene = crate::synthetic::MultiRigScene::new(&Default::default());
        let stats = reprojection_stats(&SparseGraph::new(), &scene.camera_system);
        assert_eq!(stats, ReprojectionStats::default());
        assert_eq!(
            stats.to_string(),
            "avg = 0.000 | max = 0.000 | avg depth = 0.000 | count = 0"
        );
    }
}

//! Calibration stages.
//!
//! Each stage is a free function over the camera system and scene graph(s),
//! taking an `Option<...Options>` for per-call overrides of the
//! [`CalibrationConfig`](crate::CalibrationConfig) values.

pub mod full_bundle;
pub mod handeye;
pub mod imu;
pub mod merge;
pub mod pose_graph;
pub mod recenter;
pub mod rig;

pub use full_bundle::*;
pub use handeye::*;
pub use imu::*;
pub use merge::*;
pub use pose_graph::*;
pub use recenter::*;
pub use rig::*;

use anyhow::Result;
use multicam_core::{FrameSetId, Iso3, SparseGraph};
use std::collections::HashMap;

/// Dense numbering of the frame sets of a graph, segment by segment.
#[derive(Debug, Clone, Default)]
pub(crate) struct FrameSetIndex {
    pub ids: Vec<FrameSetId>,
    pub index: HashMap<FrameSetId, usize>,
    /// Dense indices of each segment, in order.
    pub chains: Vec<Vec<usize>>,
}

impl FrameSetIndex {
    pub fn new(graph: &SparseGraph) -> Self {
        let mut out = Self::default();
        for segment in graph.segments() {
            let mut chain = Vec::with_capacity(segment.len());
            for &id in segment {
                let k = out.ids.len();
                out.ids.push(id);
                out.index.insert(id, k);
                chain.push(k);
            }
            out.chains.push(chain);
        }
        out
    }

    pub fn get(&self, id: FrameSetId) -> Result<usize> {
        self.index
            .get(&id)
            .copied()
            .ok_or_else(|| anyhow::anyhow!("frame set {:?} is not part of any segment", id))
    }

    pub fn poses(&self, graph: &SparseGraph) -> Result<Vec<Iso3>> {
        self.ids
            .iter()
            .map(|&id| Ok(graph.frame_set(id)?.pose.to_iso()))
            .collect()
    }

    pub fn write_poses(&self, graph: &mut SparseGraph, poses: &[Iso3]) -> Result<()> {
        for (&id, pose) in self.ids.iter().zip(poses) {
            graph.frame_set_mut(id)?.pose.set_iso(pose);
        }
        Ok(())
    }
}

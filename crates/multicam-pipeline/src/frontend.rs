//! External collaborators: stereo visual odometry and loop-closure search.
//!
//! The pipeline never detects features or matches descriptors itself. A
//! [`StereoFrontEnd`] per rig turns images into [`FrameSetObservation`]s and a
//! [`LoopClosureSearch`] finds 2D-3D correspondences inside a scene graph.

use anyhow::Result;
use multicam_core::{FeatureId, FrameSetObservation, PointId, SparseGraph, Timestamp};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// 8-bit single-channel image, row-major.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GrayImage {
    pub width: usize,
    pub height: usize,
    pub data: Vec<u8>,
}

/// Synchronized left/right images of one rig.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StereoImages {
    pub left: GrayImage,
    pub right: GrayImage,
}

/// Stereo visual odometry of one rig.
pub trait StereoFrontEnd: Send {
    /// Feed the images captured at `stamp`.
    fn read_frames(&mut self, stamp: Timestamp, images: &StereoImages) -> Result<()>;

    /// Track the last images and report the resulting frame set.
    fn process_frames(&mut self) -> Result<FrameSetObservation>;

    /// Make the last processed frame set the tracking reference.
    fn key_frame_set(&mut self);

    /// Correspondences between the last processed frame set and the reference.
    fn correspondence_count(&self) -> usize;
}

/// Pairs of cameras allowed to match during loop-closure search.
///
/// Entry `(i, j)` permits features of camera `i` to match points observed by
/// camera `j`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MatchingMask {
    size: usize,
    allowed: Vec<bool>,
}

impl MatchingMask {
    /// Mask with every pair disallowed.
    pub fn new(size: usize) -> Self {
        Self {
            size,
            allowed: vec![false; size * size],
        }
    }

    /// Left cameras match only themselves.
    pub fn intra_rig(camera_count: usize) -> Self {
        let mut mask = Self::new(camera_count);
        for i in (0..camera_count).step_by(2) {
            mask.set(i, i, true);
        }
        mask
    }

    /// Left cameras match the left cameras of every other rig.
    pub fn inter_rig(camera_count: usize) -> Self {
        let mut mask = Self::new(camera_count);
        for i in (0..camera_count).step_by(2) {
            for j in (0..camera_count).step_by(2) {
                if i != j {
                    mask.set(i, j, true);
                }
            }
        }
        mask
    }

    pub fn size(&self) -> usize {
        self.size
    }

    /// Out-of-range pairs are ignored.
    pub fn set(&mut self, i: usize, j: usize, allowed: bool) {
        if i < self.size && j < self.size {
            self.allowed[i * self.size + j] = allowed;
        }
    }

    /// Out-of-range pairs are never allowed.
    pub fn allows(&self, i: usize, j: usize) -> bool {
        i < self.size && j < self.size && self.allowed[i * self.size + j]
    }
}

/// Parameters of one loop-closure query.
#[derive(Debug, Clone, Copy)]
pub struct LoopSearchParams<'a> {
    pub vocabulary: &'a Path,
    pub mask: &'a MatchingMask,
    pub min_correspondences: usize,
    pub n_image_matches: usize,
}

/// A feature matched to a scene point of another frame set.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Correspondence2D3D {
    pub feature: FeatureId,
    pub point: PointId,
}

/// Place recognition over the frames of a scene graph.
pub trait LoopClosureSearch: Sync {
    fn find_correspondences(
        &self,
        graph: &SparseGraph,
        params: &LoopSearchParams<'_>,
    ) -> Result<Vec<Correspondence2D3D>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn intra_rig_mask_keeps_left_diagonal() {
        let mask = MatchingMask::intra_rig(4);
        assert!(mask.allows(0, 0) && mask.allows(2, 2));
        assert!(!mask.allows(1, 1) && !mask.allows(0, 2) && !mask.allows(3, 3));
    }

    #[test]
    fn inter_rig_mask_pairs_distinct_left_cameras() {
        let mask = MatchingMask::inter_rig(6);
        assert!(mask.allows(0, 2) && mask.allows(4, 0) && mask.allows(2, 4));
        assert!(!mask.allows(0, 0) && !mask.allows(1, 3) && !mask.allows(0, 7));
    }
}

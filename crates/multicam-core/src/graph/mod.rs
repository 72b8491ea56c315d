//! Sparse scene graph: frame sets, frames, 2D features and 3D scene points.
//!
//! All entities live in [`slotmap`] arenas owned by a [`SparseGraph`]; cross
//! links (frame -> frame set, feature -> frame, feature <-> point) are stable
//! handles. Merging two scene points or folding one graph into another is a
//! rewrite of handles, never a copy of shared state.
//!
//! Link invariants kept by every mutating operation:
//! - a feature's `point` lists that feature in its `features`,
//! - a frame's `frame_set` lists that frame in its `frames`,
//! - a feature's `frame` lists that feature in its `features`.

mod observation;
mod stats;

pub use observation::*;
pub use stats::*;

use anyhow::{anyhow, bail, ensure, Context, Result};
use serde::{Deserialize, Serialize};
use slotmap::{new_key_type, SlotMap};
use std::collections::HashMap;
use std::fs::File;
use std::io::{BufReader, BufWriter};
use std::ops::BitOr;
use std::path::Path;

use crate::{CameraSystem, GroundTruth, ImuMeasurement, Iso3, Pose, Vec2, Vec3};

new_key_type! {
    /// Handle of a [`FrameSet`].
    pub struct FrameSetId;
    /// Handle of a [`Frame`].
    pub struct FrameId;
    /// Handle of a [`Point2DFeature`].
    pub struct FeatureId;
    /// Handle of a [`Point3DFeature`].
    pub struct PointId;
}

/// Observation-provenance flags of a scene point.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PointAttributes(u8);

impl PointAttributes {
    pub const NONE: Self = Self(0);
    /// Re-observed by the same stereo rig at a non-consecutive instant.
    pub const OBSERVED_BY_STEREO_RIG_MULTIPLE_TIMES: Self = Self(0x1);
    /// Observed by more than one stereo rig.
    pub const OBSERVED_BY_MULTIPLE_STEREO_RIGS: Self = Self(0x2);

    pub fn contains(self, flag: Self) -> bool {
        flag.0 != 0 && self.0 & flag.0 == flag.0
    }

    pub fn insert(&mut self, flag: Self) {
        self.0 |= flag.0;
    }

    pub fn bits(self) -> u8 {
        self.0
    }
}

impl BitOr for PointAttributes {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

/// A synchronized capture instant across the cameras of one or more rigs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FrameSet {
    pub pose: Pose,
    pub frames: Vec<FrameId>,
    pub imu: Option<ImuMeasurement>,
    pub ground_truth: Option<GroundTruth>,
}

/// Image of one camera inside a frame set.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Frame {
    pub frame_set: FrameSetId,
    pub camera_id: usize,
    pub features: Vec<FeatureId>,
}

/// A detected keypoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Point2DFeature {
    /// Pixel coordinate.
    pub keypoint: Vec2,
    /// Unit back-projected ray in the camera frame.
    pub ray: Vec3,
    /// Appearance descriptor used by place recognition.
    pub descriptor: Vec<u8>,
    pub frame: FrameId,
    pub point: PointId,
}

/// A triangulated scene point.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Point3DFeature {
    /// Current estimate in world coordinates.
    pub position: Vec3,
    /// Stereo triangulation in the camera frame of the first observing feature.
    pub point_from_stereo: Vec3,
    pub attributes: PointAttributes,
    pub features: Vec<FeatureId>,
}

/// Handle translation produced by [`SparseGraph::absorb`].
#[derive(Debug, Clone, Default)]
pub struct GraphRemap {
    pub frame_sets: HashMap<FrameSetId, FrameSetId>,
    pub frames: HashMap<FrameId, FrameId>,
    pub features: HashMap<FeatureId, FeatureId>,
    pub points: HashMap<PointId, PointId>,
    /// Indices of the absorbed segments in the receiving graph.
    pub segments: Vec<usize>,
}

/// Scene graph with arena storage and ordered frame-set segments.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SparseGraph {
    frame_sets: SlotMap<FrameSetId, FrameSet>,
    frames: SlotMap<FrameId, Frame>,
    features: SlotMap<FeatureId, Point2DFeature>,
    points: SlotMap<PointId, Point3DFeature>,
    segments: Vec<Vec<FrameSetId>>,
}

impl SparseGraph {
    pub fn new() -> Self {
        Self::default()
    }

    /// Graph with `count` empty segments.
    pub fn with_segments(count: usize) -> Self {
        Self {
            segments: vec![Vec::new(); count],
            ..Self::default()
        }
    }

    // ─────────────────────────────────────────────────────────────────────
    // Construction
    // ─────────────────────────────────────────────────────────────────────

    /// Append a frame set to the end of `segment`, creating segments as needed.
    pub fn add_frame_set(
        &mut self,
        segment: usize,
        pose: Pose,
        imu: Option<ImuMeasurement>,
        ground_truth: Option<GroundTruth>,
    ) -> FrameSetId {
        let id = self.frame_sets.insert(FrameSet {
            pose,
            frames: Vec::new(),
            imu,
            ground_truth,
        });
        if self.segments.len() <= segment {
            self.segments.resize(segment + 1, Vec::new());
        }
        self.segments[segment].push(id);
        id
    }

    pub fn add_frame(&mut self, frame_set: FrameSetId, camera_id: usize) -> Result<FrameId> {
        ensure!(
            self.frame_sets.contains_key(frame_set),
            "unknown frame set {:?}",
            frame_set
        );
        let id = self.frames.insert(Frame {
            frame_set,
            camera_id,
            features: Vec::new(),
        });
        self.frame_sets[frame_set].frames.push(id);
        Ok(id)
    }

    pub fn add_point(&mut self, position: Vec3, point_from_stereo: Vec3) -> PointId {
        self.points.insert(Point3DFeature {
            position,
            point_from_stereo,
            attributes: PointAttributes::NONE,
            features: Vec::new(),
        })
    }

    /// Add a feature to `frame` observing `point`, linking both directions.
    pub fn add_feature(
        &mut self,
        frame: FrameId,
        point: PointId,
        keypoint: Vec2,
        ray: Vec3,
        descriptor: Vec<u8>,
    ) -> Result<FeatureId> {
        ensure!(self.frames.contains_key(frame), "unknown frame {:?}", frame);
        ensure!(self.points.contains_key(point), "unknown point {:?}", point);
        let id = self.features.insert(Point2DFeature {
            keypoint,
            ray,
            descriptor,
            frame,
            point,
        });
        self.frames[frame].features.push(id);
        self.points[point].features.push(id);
        Ok(id)
    }

    // ─────────────────────────────────────────────────────────────────────
    // Access
    // ─────────────────────────────────────────────────────────────────────

    pub fn segments(&self) -> &[Vec<FrameSetId>] {
        &self.segments
    }

    pub fn segment(&self, idx: usize) -> &[FrameSetId] {
        self.segments.get(idx).map_or(&[], Vec::as_slice)
    }

    /// Frame sets of all segments in order.
    pub fn frame_set_ids(&self) -> impl Iterator<Item = FrameSetId> + '_ {
        self.segments.iter().flatten().copied()
    }

    pub fn frame_set_count(&self) -> usize {
        self.segments.iter().map(Vec::len).sum()
    }

    pub fn frame_count(&self) -> usize {
        self.frames.len()
    }

    pub fn feature_count(&self) -> usize {
        self.features.len()
    }

    pub fn point_count(&self) -> usize {
        self.points.len()
    }

    pub fn frame_set(&self, id: FrameSetId) -> Result<&FrameSet> {
        self.frame_sets
            .get(id)
            .ok_or_else(|| anyhow!("unknown frame set {:?}", id))
    }

    pub fn frame_set_mut(&mut self, id: FrameSetId) -> Result<&mut FrameSet> {
        self.frame_sets
            .get_mut(id)
            .ok_or_else(|| anyhow!("unknown frame set {:?}", id))
    }

    pub fn frame(&self, id: FrameId) -> Result<&Frame> {
        self.frames
            .get(id)
            .ok_or_else(|| anyhow!("unknown frame {:?}", id))
    }

    pub fn frame_mut(&mut self, id: FrameId) -> Result<&mut Frame> {
        self.frames
            .get_mut(id)
            .ok_or_else(|| anyhow!("unknown frame {:?}", id))
    }

    pub fn feature(&self, id: FeatureId) -> Result<&Point2DFeature> {
        self.features
            .get(id)
            .ok_or_else(|| anyhow!("unknown feature {:?}", id))
    }

    pub fn feature_mut(&mut self, id: FeatureId) -> Result<&mut Point2DFeature> {
        self.features
            .get_mut(id)
            .ok_or_else(|| anyhow!("unknown feature {:?}", id))
    }

    pub fn point(&self, id: PointId) -> Result<&Point3DFeature> {
        self.points
            .get(id)
            .ok_or_else(|| anyhow!("unknown point {:?}", id))
    }

    pub fn point_mut(&mut self, id: PointId) -> Result<&mut Point3DFeature> {
        self.points
            .get_mut(id)
            .ok_or_else(|| anyhow!("unknown point {:?}", id))
    }

    pub fn contains_point(&self, id: PointId) -> bool {
        self.points.contains_key(id)
    }

    /// Camera id and frame set of the frame owning `feature`.
    pub fn observation_context(&self, feature: FeatureId) -> Result<(usize, FrameSetId)> {
        let frame = self.frame(self.feature(feature)?.frame)?;
        Ok((frame.camera_id, frame.frame_set))
    }

    /// Scene points observed by at least one feature, in arena order.
    pub fn scene_points(&self) -> Vec<PointId> {
        self.points
            .iter()
            .filter(|(_, p)| !p.features.is_empty())
            .map(|(id, _)| id)
            .collect()
    }

    /// Unique scene points observed from frames of `camera_id`.
    pub fn points_seen_by_camera(&self, camera_id: usize) -> Vec<PointId> {
        let mut seen = std::collections::HashSet::new();
        let mut out = Vec::new();
        for fs in self.frame_set_ids() {
            let Some(frame_set) = self.frame_sets.get(fs) else {
                continue;
            };
            for &frame_id in &frame_set.frames {
                let frame = &self.frames[frame_id];
                if frame.camera_id != camera_id {
                    continue;
                }
                for &f in &frame.features {
                    let p = self.features[f].point;
                    if seen.insert(p) {
                        out.push(p);
                    }
                }
            }
        }
        out
    }

    // ─────────────────────────────────────────────────────────────────────
    // Geometry
    // ─────────────────────────────────────────────────────────────────────

    /// World -> camera transform of the frame owning `feature`.
    pub fn camera_from_world(&self, feature: FeatureId, system: &CameraSystem) -> Result<Iso3> {
        let (camera_id, frame_set) = self.observation_context(feature)?;
        let sys_from_world = self.frame_set(frame_set)?.pose.to_iso();
        let sys_from_cam = system.global_camera_pose(camera_id)?;
        Ok(sys_from_cam.inverse() * sys_from_world)
    }

    /// Reset a point from its stereo anchor through its first observation.
    ///
    /// `position = inv(Pose) * G(camera) * point_from_stereo`.
    pub fn retriangulate_from_stereo(
        &mut self,
        point: PointId,
        system: &CameraSystem,
    ) -> Result<Vec3> {
        let p = self.point(point)?;
        let first = *p
            .features
            .first()
            .ok_or_else(|| anyhow!("point {:?} has no observations", point))?;
        let anchor = p.point_from_stereo;
        let world_from_cam = self.camera_from_world(first, system)?.inverse();
        let position = world_from_cam.transform_point(&anchor.into()).coords;
        self.points[point].position = position;
        Ok(position)
    }

    // ─────────────────────────────────────────────────────────────────────
    // Merging
    // ─────────────────────────────────────────────────────────────────────

    /// Fold `absorbed` into `canonical`.
    ///
    /// Features of `absorbed` not already observing `canonical` are appended,
    /// every feature of `canonical` is re-pointed and `absorbed` is removed
    /// from the arena. Returns `false` (no-op) when both handles are equal.
    pub fn merge_points(&mut self, canonical: PointId, absorbed: PointId) -> Result<bool> {
        if canonical == absorbed {
            return Ok(false);
        }
        ensure!(
            self.points.contains_key(canonical),
            "unknown canonical point {:?}",
            canonical
        );
        let removed = self
            .points
            .remove(absorbed)
            .ok_or_else(|| anyhow!("unknown absorbed point {:?}", absorbed))?;

        let target = &mut self.points[canonical];
        target.attributes.insert(removed.attributes);
        for f in removed.features {
            if !target.features.contains(&f) {
                target.features.push(f);
            }
        }
        for &f in &target.features {
            if let Some(feature) = self.features.get_mut(f) {
                feature.point = canonical;
            }
        }
        Ok(true)
    }

    /// Move every entity of `other` into this graph.
    ///
    /// Segments of `other` are appended after the existing segments.
    pub fn absorb(&mut self, other: SparseGraph) -> GraphRemap {
        let mut remap = GraphRemap::default();
        let SparseGraph {
            frame_sets,
            frames,
            features,
            points,
            segments,
        } = other;

        for (old, point) in points {
            remap.points.insert(old, self.points.insert(point));
        }
        for (old, frame_set) in frame_sets {
            remap.frame_sets.insert(old, self.frame_sets.insert(frame_set));
        }
        for (old, frame) in frames {
            remap.frames.insert(old, self.frames.insert(frame));
        }
        for (old, feature) in features {
            remap.features.insert(old, self.features.insert(feature));
        }

        for &id in remap.points.values() {
            let p = &mut self.points[id];
            p.features = p
                .features
                .iter()
                .filter_map(|f| remap.features.get(f).copied())
                .collect();
        }
        for &id in remap.frame_sets.values() {
            let fs = &mut self.frame_sets[id];
            fs.frames = fs
                .frames
                .iter()
                .filter_map(|f| remap.frames.get(f).copied())
                .collect();
        }
        for &id in remap.frames.values() {
            let frame = &mut self.frames[id];
            if let Some(&fs) = remap.frame_sets.get(&frame.frame_set) {
                frame.frame_set = fs;
            }
            frame.features = frame
                .features
                .iter()
                .filter_map(|f| remap.features.get(f).copied())
                .collect();
        }
        for &id in remap.features.values() {
            let feature = &mut self.features[id];
            if let Some(&frame) = remap.frames.get(&feature.frame) {
                feature.frame = frame;
            }
            if let Some(&point) = remap.points.get(&feature.point) {
                feature.point = point;
            }
        }

        for segment in segments {
            remap.segments.push(self.segments.len());
            self.segments.push(
                segment
                    .iter()
                    .filter_map(|fs| remap.frame_sets.get(fs).copied())
                    .collect(),
            );
        }
        remap
    }

    /// Move the frames of segment `src` into the frame sets of segment `dst`.
    ///
    /// Frame set `k` of `src` contributes its frames to frame set `k` of `dst`
    /// and is then dropped together with its pose; the emptied segment is
    /// removed. Both segments must have the same length.
    pub fn fold_segment(&mut self, src: usize, dst: usize) -> Result<()> {
        ensure!(src != dst, "cannot fold segment {} into itself", src);
        ensure!(
            src < self.segments.len() && dst < self.segments.len(),
            "segment index out of range ({}, {}) of {}",
            src,
            dst,
            self.segments.len()
        );
        let (n_src, n_dst) = (self.segments[src].len(), self.segments[dst].len());
        ensure!(
            n_src == n_dst,
            "frame set count mismatch: segment {} has {}, segment {} has {}",
            src,
            n_src,
            dst,
            n_dst
        );

        let src_ids = self.segments.remove(src);
        let dst_idx = if dst > src { dst - 1 } else { dst };
        let dst_ids = self.segments[dst_idx].clone();
        for (s, d) in src_ids.into_iter().zip(dst_ids) {
            let moved = self
                .frame_sets
                .remove(s)
                .ok_or_else(|| anyhow!("unknown frame set {:?}", s))?;
            for &frame in &moved.frames {
                self.frames[frame].frame_set = d;
            }
            self.frame_sets[d].frames.extend(moved.frames);
        }
        Ok(())
    }

    /// Verify the bidirectional link invariants.
    pub fn check_links(&self) -> Result<()> {
        for (fid, feature) in &self.features {
            let point = self
                .points
                .get(feature.point)
                .with_context(|| format!("feature {:?} links a missing point", fid))?;
            ensure!(
                point.features.contains(&fid),
                "point {:?} does not list its feature {:?}",
                feature.point,
                fid
            );
            let frame = self
                .frames
                .get(feature.frame)
                .with_context(|| format!("feature {:?} links a missing frame", fid))?;
            ensure!(
                frame.features.contains(&fid),
                "frame {:?} does not list its feature {:?}",
                feature.frame,
                fid
            );
        }
        for (pid, point) in &self.points {
            for f in &point.features {
                match self.features.get(*f) {
                    Some(feature) if feature.point == pid => {}
                    Some(feature) => bail!(
                        "point {:?} lists feature {:?} which links point {:?}",
                        pid,
                        f,
                        feature.point
                    ),
                    None => bail!("point {:?} lists missing feature {:?}", pid, f),
                }
            }
        }
        for (frame_id, frame) in &self.frames {
            let fs = self
                .frame_sets
                .get(frame.frame_set)
                .with_context(|| format!("frame {:?} links a missing frame set", frame_id))?;
            ensure!(
                fs.frames.contains(&frame_id),
                "frame set {:?} does not list its frame {:?}",
                frame.frame_set,
                frame_id
            );
        }
        Ok(())
    }

    // ─────────────────────────────────────────────────────────────────────
    // Persistence
    // ─────────────────────────────────────────────────────────────────────

    pub fn write_to_binary_file(&self, path: &Path) -> Result<()> {
        let file = File::create(path)
            .with_context(|| format!("failed to create graph snapshot {}", path.display()))?;
        bincode::serialize_into(BufWriter::new(file), self)
            .with_context(|| format!("failed to write graph snapshot {}", path.display()))?;
        Ok(())
    }

    pub fn read_from_binary_file(path: &Path) -> Result<Self> {
        let file = File::open(path)
            .with_context(|| format!("failed to open graph snapshot {}", path.display()))?;
        let graph: Self = bincode::deserialize_from(BufReader::new(file))
            .with_context(|| format!("failed to read graph snapshot {}", path.display()))?;
        graph.check_links()?;
        Ok(graph)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Timestamp;
    use std::collections::HashSet;

    /// Two frame sets, one camera, two points each observed twice.
    fn two_point_graph() -> (SparseGraph, PointId, PointId) {
        let mut g = SparseGraph::with_segments(1);
        let a = g.add_point(Vec3::new(0.0, 0.0, 5.0), Vec3::new(0.0, 0.0, 5.0));
        let b = g.add_point(Vec3::new(0.1, 0.0, 5.0), Vec3::new(0.1, 0.0, 5.0));
        for k in 0..2u64 {
            let fs = g.add_frame_set(0, Pose::identity(Timestamp(k)), None, None);
            let frame = g.add_frame(fs, 0).unwrap();
            g.add_feature(frame, a, Vec2::zeros(), Vec3::z(), vec![1])
                .unwrap();
            g.add_feature(frame, b, Vec2::zeros(), Vec3::z(), vec![2])
                .unwrap();
        }
        (g, a, b)
    }

    fn feature_set(g: &SparseGraph, p: PointId) -> HashSet<FeatureId> {
        g.point(p).unwrap().features.iter().copied().collect()
    }

    #[test]
    fn merge_keeps_links_consistent() {
        let (mut g, a, b) = two_point_graph();
        assert!(g.merge_points(a, b).unwrap());
        g.check_links().unwrap();
        assert_eq!(g.point(a).unwrap().features.len(), 4);
        assert!(!g.contains_point(b));
    }

    #[test]
    fn merge_with_itself_is_noop() {
        let (mut g, a, _) = two_point_graph();
        assert!(!g.merge_points(a, a).unwrap());
        assert_eq!(g.point_count(), 2);
    }

    #[test]
    fn merge_membership_is_commutative() {
        let (g, a, b) = two_point_graph();
        let mut ab = g.clone();
        ab.merge_points(a, b).unwrap();
        let mut ba = g.clone();
        ba.merge_points(b, a).unwrap();
        assert_eq!(feature_set(&ab, a), feature_set(&ba, b));
    }

    #[test]
    fn merge_unions_attributes() {
        let (mut g, a, b) = two_point_graph();
        g.point_mut(b)
            .unwrap()
            .attributes
            .insert(PointAttributes::OBSERVED_BY_MULTIPLE_STEREO_RIGS);
        g.merge_points(a, b).unwrap();
        assert!(g
            .point(a)
            .unwrap()
            .attributes
            .contains(PointAttributes::OBSERVED_BY_MULTIPLE_STEREO_RIGS));
    }

    #[test]
    fn absorb_and_fold_rewrite_handles() {
        let (mut g, _, _) = two_point_graph();
        let (other, _, _) = two_point_graph();
        let remap = g.absorb(other);
        assert_eq!(remap.segments, vec![1]);
        assert_eq!(g.point_count(), 4);
        g.check_links().unwrap();

        g.fold_segment(1, 0).unwrap();
        g.check_links().unwrap();
        assert_eq!(g.segments().len(), 1);
        assert_eq!(g.segment(0).len(), 2);
        for &fs in g.segment(0) {
            assert_eq!(g.frame_set(fs).unwrap().frames.len(), 2);
        }
    }

    #[test]
    fn fold_rejects_unequal_segments() {
        let (mut g, _, _) = two_point_graph();
        g.add_frame_set(1, Pose::identity(Timestamp(0)), None, None);
        assert!(g.fold_segment(1, 0).is_err());
        assert_eq!(g.segments().len(), 2);
    }

    #[test]
    fn binary_snapshot_roundtrip() {
        let (g, a, _) = two_point_graph();
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("map.sg");
        g.write_to_binary_file(&path).unwrap();
        let restored = SparseGraph::read_from_binary_file(&path).unwrap();
        assert_eq!(restored.frame_set_count(), 2);
        assert_eq!(restored.point(a).unwrap().features.len(), 2);
    }
}

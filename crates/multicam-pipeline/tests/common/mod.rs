#![allow(dead_code)]

use anyhow::{anyhow, Result};
use multicam_core::synthetic::MultiRigScene;
use multicam_core::{
    FrameSetId, FrameSetObservation, PointId, SparseGraph, Timestamp, TrackId,
};
use multicam_pipeline::{
    Correspondence2D3D, LoopClosureSearch, LoopSearchParams, StereoFrontEnd, StereoImages,
};
use std::collections::{HashMap, HashSet, VecDeque};

/// Front end replaying one rig's synthetic odometry stream.
pub struct ReplayFrontEnd {
    queue: VecDeque<FrameSetObservation>,
    current: Option<FrameSetObservation>,
    keyed_tracks: HashSet<TrackId>,
}

impl ReplayFrontEnd {
    pub fn new(scene: &MultiRigScene, rig: usize) -> Self {
        Self {
            queue: scene.observations(rig).into(),
            current: None,
            keyed_tracks: HashSet::new(),
        }
    }

    fn tracks(obs: &FrameSetObservation) -> impl Iterator<Item = TrackId> + '_ {
        obs.frames
            .iter()
            .flat_map(|frame| &frame.features)
            .map(|f| f.track)
    }
}

impl StereoFrontEnd for ReplayFrontEnd {
    fn read_frames(&mut self, _stamp: Timestamp, _images: &StereoImages) -> Result<()> {
        self.current = Some(
            self.queue
                .pop_front()
                .ok_or_else(|| anyhow!("stream exhausted"))?,
        );
        Ok(())
    }

    fn process_frames(&mut self) -> Result<FrameSetObservation> {
        self.current
            .clone()
            .ok_or_else(|| anyhow!("no frames read"))
    }

    fn key_frame_set(&mut self) {
        if let Some(obs) = &self.current {
            self.keyed_tracks = Self::tracks(obs).collect();
        }
    }

    fn correspondence_count(&self) -> usize {
        let Some(obs) = &self.current else {
            return 0;
        };
        Self::tracks(obs)
            .collect::<HashSet<_>>()
            .intersection(&self.keyed_tracks)
            .count()
    }
}

/// Feed every frame set of `scene` through one replay front end per rig.
pub fn ingest(scene: &MultiRigScene, keyframe_threshold: usize) -> multicam_pipeline::FrameIngestor {
    ingest_streams(scene, keyframe_threshold, true)
}

/// Like [`ingest`], with no IMU samples attached.
pub fn ingest_without_imu(scene: &MultiRigScene) -> multicam_pipeline::FrameIngestor {
    ingest_streams(scene, usize::MAX, false)
}

fn ingest_streams(
    scene: &MultiRigScene,
    keyframe_threshold: usize,
    with_imu: bool,
) -> multicam_pipeline::FrameIngestor {
    let front_ends: Vec<Box<dyn StereoFrontEnd>> = (0..scene.rig_count())
        .map(|rig| Box::new(ReplayFrontEnd::new(scene, rig)) as Box<dyn StereoFrontEnd>)
        .collect();
    let mut ingestor = multicam_pipeline::FrameIngestor::new(front_ends, keyframe_threshold);
    let images = vec![StereoImages::default(); scene.rig_count()];
    for k in 0..scene.frame_set_count() {
        ingestor
            .process_frames(
                scene.stamp(k),
                &images,
                with_imu.then(|| scene.imu(k)),
                Some(scene.ground_truth(k)),
            )
            .unwrap();
    }
    ingestor
}

/// Exact descriptor matching standing in for place recognition.
///
/// A query feature matches every other point, observed by an allowed camera,
/// whose descriptor is identical. Matches are grouped by the pair of query
/// and anchor frame sets; only groups of at least `min_correspondences` are
/// kept, and at most `n_image_matches` anchors per query frame.
pub struct DescriptorSearch;

impl LoopClosureSearch for DescriptorSearch {
    fn find_correspondences(
        &self,
        graph: &SparseGraph,
        params: &LoopSearchParams<'_>,
    ) -> Result<Vec<Correspondence2D3D>> {
        let cameras = params.mask.size();
        let mut index: Vec<HashMap<Vec<u8>, Vec<(PointId, FrameSetId)>>> = vec![HashMap::new(); cameras];
        for (camera, by_descriptor) in index.iter_mut().enumerate() {
            for pid in graph.points_seen_by_camera(camera) {
                let point = graph.point(pid)?;
                let Some(&first) = point.features.first() else {
                    continue;
                };
                let (_, anchor) = graph.observation_context(first)?;
                by_descriptor
                    .entry(graph.feature(first)?.descriptor.clone())
                    .or_default()
                    .push((pid, anchor));
            }
        }

        let mut out = Vec::new();
        for query in graph.frame_set_ids() {
            for &frame_id in &graph.frame_set(query)?.frames {
                let frame = graph.frame(frame_id)?;
                let mut groups: HashMap<FrameSetId, Vec<Correspondence2D3D>> = HashMap::new();
                for &fid in &frame.features {
                    let feature = graph.feature(fid)?;
                    for (camera, by_descriptor) in index.iter().enumerate() {
                        if !params.mask.allows(frame.camera_id, camera) {
                            continue;
                        }
                        let Some(candidates) = by_descriptor.get(&feature.descriptor) else {
                            continue;
                        };
                        for &(pid, anchor) in candidates {
                            if pid == feature.point || anchor == query {
                                continue;
                            }
                            groups.entry(anchor).or_default().push(Correspondence2D3D {
                                feature: fid,
                                point: pid,
                            });
                        }
                    }
                }
                let mut groups: Vec<_> = groups
                    .into_values()
                    .filter(|g| g.len() >= params.min_correspondences)
                    .collect();
                groups.sort_by_key(|g| std::cmp::Reverse(g.len()));
                out.extend(groups.into_iter().take(params.n_image_matches).flatten());
            }
        }
        Ok(out)
    }
}

//! Synchronized ingestion of stereo frames into per-rig scene graphs.

use anyhow::anyhow;
use log::{debug, info};
use multicam_core::{
    FrameSetObservation, GroundTruth, ImuMeasurement, PointId, SparseGraph, Timestamp, TrackId,
};
use std::collections::{HashMap, HashSet};
use std::thread;

use crate::frontend::{StereoFrontEnd, StereoImages};
use crate::CalibError;

/// Drives one [`StereoFrontEnd`] per rig and keeps their graphs in lockstep.
///
/// Every committed capture instant appends exactly one frame set to every
/// rig's graph, so segment `k` of each sub-graph describes the same instant.
pub struct FrameIngestor {
    front_ends: Vec<Box<dyn StereoFrontEnd>>,
    graphs: Vec<SparseGraph>,
    tracks: Vec<HashMap<TrackId, PointId>>,
    keyframe_threshold: usize,
    initialized: bool,
}

impl FrameIngestor {
    pub fn new(front_ends: Vec<Box<dyn StereoFrontEnd>>, keyframe_threshold: usize) -> Self {
        let rigs = front_ends.len();
        Self {
            front_ends,
            graphs: (0..rigs).map(|_| SparseGraph::with_segments(1)).collect(),
            tracks: vec![HashMap::new(); rigs],
            keyframe_threshold,
            initialized: false,
        }
    }

    pub fn rig_count(&self) -> usize {
        self.front_ends.len()
    }

    pub fn sub_graphs(&self) -> &[SparseGraph] {
        &self.graphs
    }

    pub fn into_sub_graphs(self) -> Vec<SparseGraph> {
        self.graphs
    }

    /// Process one synchronized capture of every rig.
    ///
    /// Returns `true` when a frame set was committed. Nothing is appended
    /// when any rig fails.
    pub fn process_frames(
        &mut self,
        stamp: Timestamp,
        images: &[StereoImages],
        imu: Option<ImuMeasurement>,
        ground_truth: Option<GroundTruth>,
    ) -> Result<bool, CalibError> {
        if images.len() != self.front_ends.len() {
            return Err(CalibError::InsufficientData(format!(
                "got images for {} rigs, expected {}",
                images.len(),
                self.front_ends.len()
            )));
        }

        let observations = thread::scope(|s| {
            let handles: Vec<_> = self
                .front_ends
                .iter_mut()
                .zip(images)
                .map(|(front_end, images)| {
                    s.spawn(move || {
                        front_end.read_frames(stamp, images)?;
                        front_end.process_frames()
                    })
                })
                .collect();
            handles
                .into_iter()
                .enumerate()
                .map(|(rig, handle)| match handle.join() {
                    Ok(Ok(obs)) => Ok(obs),
                    Ok(Err(source)) => Err(CalibError::Ingestion { rig, source }),
                    Err(_) => Err(CalibError::Ingestion {
                        rig,
                        source: anyhow!("front-end worker panicked"),
                    }),
                })
                .collect::<Result<Vec<_>, _>>()
        })?;

        let key = !self.initialized
            || self
                .front_ends
                .iter()
                .any(|f| f.correspondence_count() < self.keyframe_threshold);
        if !key {
            debug!("frame set at {} s not keyed", stamp.as_secs_f64());
            return Ok(false);
        }

        for (rig, obs) in observations.iter().enumerate() {
            if let Some(track) = unknown_track(obs, &self.tracks[rig]) {
                return Err(CalibError::Ingestion {
                    rig,
                    source: anyhow!("observation references unknown track {}", track.0),
                });
            }
        }

        for (rig, obs) in observations.into_iter().enumerate() {
            self.graphs[rig]
                .append_observation(0, obs, imu.clone(), ground_truth.clone(), &mut self.tracks[rig])
                .map_err(|source| CalibError::Ingestion { rig, source })?;
        }
        for front_end in &mut self.front_ends {
            front_end.key_frame_set();
        }
        self.initialized = true;
        info!(
            "frame set {} committed at {:.3} s",
            self.graphs.first().map_or(0, SparseGraph::frame_set_count),
            stamp.as_secs_f64()
        );
        Ok(true)
    }
}

fn unknown_track(obs: &FrameSetObservation, tracks: &HashMap<TrackId, PointId>) -> Option<TrackId> {
    let new: HashSet<TrackId> = obs.landmarks.iter().map(|l| l.track).collect();
    obs.frames
        .iter()
        .flat_map(|frame| &frame.features)
        .map(|f| f.track)
        .find(|t| !tracks.contains_key(t) && !new.contains(t))
}

#[cfg(test)]
mod tests {
    use super::*;
    use multicam_core::synthetic::{MultiRigConfig, MultiRigScene};
    use std::collections::VecDeque;

    struct Replay {
        queue: VecDeque<FrameSetObservation>,
        current: Option<FrameSetObservation>,
        count: usize,
        fail: bool,
    }

    impl StereoFrontEnd for Replay {
        fn read_frames(&mut self, _stamp: Timestamp, _images: &StereoImages) -> anyhow::Result<()> {
            anyhow::ensure!(!self.fail, "camera disconnected");
            self.current = self.queue.pop_front();
            Ok(())
        }

        fn process_frames(&mut self) -> anyhow::Result<FrameSetObservation> {
            self.current.clone().ok_or_else(|| anyhow!("stream exhausted"))
        }

        fn key_frame_set(&mut self) {}

        fn correspondence_count(&self) -> usize {
            self.count
        }
    }

    fn replay(scene: &MultiRigScene, rig: usize, count: usize, fail: bool) -> Box<dyn StereoFrontEnd> {
        Box::new(Replay {
            queue: scene.observations(rig).into(),
            current: None,
            count,
            fail,
        })
    }

    #[test]
    fn failing_rig_appends_nothing() {
        let scene = MultiRigScene::new(&MultiRigConfig::default());
        let mut ingestor =
            FrameIngestor::new(vec![replay(&scene, 0, 0, false), replay(&scene, 1, 0, true)], 40);
        let images = vec![StereoImages::default(); 2];
        let err = ingestor
            .process_frames(scene.stamp(0), &images, None, None)
            .unwrap_err();
        assert!(matches!(err, CalibError::Ingestion { rig: 1, .. }));
        assert!(ingestor.sub_graphs().iter().all(|g| g.frame_set_count() == 0));
    }

    #[test]
    fn well_tracked_frames_are_not_keyed() {
        let scene = MultiRigScene::new(&MultiRigConfig::default());
        let mut ingestor = FrameIngestor::new(
            vec![replay(&scene, 0, 100, false), replay(&scene, 1, 100, false)],
            40,
        );
        let images = vec![StereoImages::default(); 2];
        assert!(ingestor
            .process_frames(scene.stamp(0), &images, Some(scene.imu(0)), None)
            .unwrap());
        assert!(!ingestor
            .process_frames(scene.stamp(1), &images, Some(scene.imu(1)), None)
            .unwrap());
        for g in ingestor.sub_graphs() {
            assert_eq!(g.segment(0).len(), 1);
        }
    }

    #[test]
    fn weak_tracking_keys_every_rig() {
        let scene = MultiRigScene::new(&MultiRigConfig::default());
        let mut ingestor = FrameIngestor::new(
            vec![replay(&scene, 0, 100, false), replay(&scene, 1, 10, false)],
            40,
        );
        let images = vec![StereoImages::default(); 2];
        for k in 0..3 {
            assert!(ingestor
                .process_frames(scene.stamp(k), &images, None, None)
                .unwrap());
        }
        let graphs = ingestor.into_sub_graphs();
        for g in &graphs {
            g.check_links().unwrap();
            assert_eq!(g.segment(0).len(), 3);
        }
    }

    #[test]
    fn image_count_must_match_rigs() {
        let scene = MultiRigScene::new(&MultiRigConfig::default());
        let mut ingestor = FrameIngestor::new(vec![replay(&scene, 0, 0, false)], 40);
        let err = ingestor
            .process_frames(scene.stamp(0), &[], None, None)
            .unwrap_err();
        assert!(matches!(err, CalibError::InsufficientData(_)));
    }
}

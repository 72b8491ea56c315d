//! Per-instant output of a stereo visual-odometry front end and its insertion
//! into a [`SparseGraph`].

use anyhow::{bail, Result};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};

use super::{FrameSetId, PointId, SparseGraph};
use crate::{GroundTruth, ImuMeasurement, Pose, Vec2, Vec3};

/// Front-end landmark track identifier, stable across frame sets of one rig.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TrackId(pub u64);

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FeatureObservation {
    pub track: TrackId,
    pub keypoint: Vec2,
    pub ray: Vec3,
    pub descriptor: Vec<u8>,
}

/// Features seen by one camera.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FrameObservation {
    pub camera_id: usize,
    pub features: Vec<FeatureObservation>,
}

/// A landmark first triangulated at this instant.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LandmarkInit {
    pub track: TrackId,
    pub position: Vec3,
    /// Stereo triangulation in the frame of the first camera observing it.
    pub point_from_stereo: Vec3,
}

/// Everything a front end reports for one capture instant.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FrameSetObservation {
    pub pose: Pose,
    pub frames: Vec<FrameObservation>,
    pub landmarks: Vec<LandmarkInit>,
}

impl SparseGraph {
    /// Append an observation as a new frame set at the end of `segment`.
    ///
    /// New landmarks become points; features link to the point of their
    /// track through `tracks`. An unknown track is an error and leaves the
    /// graph untouched.
    pub fn append_observation(
        &mut self,
        segment: usize,
        obs: FrameSetObservation,
        imu: Option<ImuMeasurement>,
        ground_truth: Option<GroundTruth>,
        tracks: &mut HashMap<TrackId, PointId>,
    ) -> Result<FrameSetId> {
        let new_tracks: HashSet<TrackId> = obs.landmarks.iter().map(|l| l.track).collect();
        for frame in &obs.frames {
            for f in &frame.features {
                if !tracks.contains_key(&f.track) && !new_tracks.contains(&f.track) {
                    bail!(
                        "camera {} observes unknown track {}",
                        frame.camera_id,
                        f.track.0
                    );
                }
            }
        }

        for landmark in &obs.landmarks {
            if !tracks.contains_key(&landmark.track) {
                let point = self.add_point(landmark.position, landmark.point_from_stereo);
                tracks.insert(landmark.track, point);
            }
        }

        let frame_set = self.add_frame_set(segment, obs.pose, imu, ground_truth);
        for frame in obs.frames {
            let frame_id = self.add_frame(frame_set, frame.camera_id)?;
            for f in frame.features {
                let Some(&point) = tracks.get(&f.track) else {
                    bail!("track {} vanished during insertion", f.track.0);
                };
                self.add_feature(frame_id, point, f.keypoint, f.ray, f.descriptor)?;
            }
        }
        Ok(frame_set)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Timestamp;

    fn obs(stamp: u64, tracks: &[u64], landmarks: &[u64]) -> FrameSetObservation {
        let features = tracks
            .iter()
            .map(|&t| FeatureObservation {
                track: TrackId(t),
                keypoint: Vec2::new(320.0, 240.0),
                ray: Vec3::z(),
                descriptor: t.to_le_bytes().to_vec(),
            })
            .collect::<Vec<_>>();
        FrameSetObservation {
            pose: Pose::identity(Timestamp(stamp)),
            frames: vec![
                FrameObservation {
                    camera_id: 0,
                    features: features.clone(),
                },
                FrameObservation {
                    camera_id: 1,
                    features,
                },
            ],
            landmarks: landmarks
                .iter()
                .map(|&t| LandmarkInit {
                    track: TrackId(t),
                    position: Vec3::new(0.0, 0.0, 4.0),
                    point_from_stereo: Vec3::new(0.0, 0.0, 4.0),
                })
                .collect(),
        }
    }

    #[test]
    fn tracks_link_features_across_frame_sets() {
        let mut g = SparseGraph::with_segments(1);
        let mut tracks = HashMap::new();
        g.append_observation(0, obs(0, &[1, 2], &[1, 2]), None, None, &mut tracks)
            .unwrap();
        g.append_observation(0, obs(1, &[2, 3], &[3]), None, None, &mut tracks)
            .unwrap();
        g.check_links().unwrap();
        assert_eq!(g.point_count(), 3);
        assert_eq!(g.frame_set_count(), 2);
        assert_eq!(g.point(tracks[&TrackId(2)]).unwrap().features.len(), 4);
    }

    #[test]
    fn unknown_track_leaves_graph_untouched() {
        let mut g = SparseGraph::with_segments(1);
        let mut tracks = HashMap::new();
        assert!(g
            .append_observation(0, obs(0, &[7], &[]), None, None, &mut tracks)
            .is_err());
        assert_eq!(g.frame_set_count(), 0);
        assert_eq!(g.point_count(), 0);
    }
}

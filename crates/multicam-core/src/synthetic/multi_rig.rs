//! Synthetic multi-rig scene.
//!
//! Rig 0's left camera defines the system frame, and the world frame is the
//! system frame at the first frame set. Every rig runs its own visual
//! odometry whose world is its left camera at the first frame set, so rig
//! `i` reports `T_k = inv(W_k * X_i) * X_i`, with `W_k = world_from_sys` and
//! `X_i = sys_from_rig`.

use nalgebra::{Translation3, UnitQuaternion};
use std::collections::HashMap;

use super::noise::{signed_unit, UniformPixelNoise};
use crate::{
    BrownConrady5, CameraParams, CameraSystem, ChessboardData, FeatureObservation,
    FrameObservation, FrameSetObservation, FxFyCxCySkew, GroundTruth, ImuMeasurement, Iso3,
    LandmarkInit, PinholeCamera, Pose, Pt3, Quat, Real, SparseGraph, SystemCamera, Timestamp,
    TrackId, Vec2, Vec3,
};

pub const IMAGE_WIDTH: Real = 640.0;
pub const IMAGE_HEIGHT: Real = 480.0;
/// Stereo baseline (meters); the right camera sits at `+x` of the left one.
pub const BASELINE: Real = 0.12;
/// Spacing between consecutive frame sets.
pub const FRAME_PERIOD_NS: u64 = 100_000_000;

const IMAGE_MARGIN: Real = 5.0;
const MIN_DEPTH: Real = 0.5;
const BOARD_COLS: usize = 6;
const BOARD_ROWS: usize = 5;
const BOARD_SQUARE: Real = 0.05;
const BOARD_VIEWS: usize = 3;

/// Scene generation options.
#[derive(Debug, Clone)]
pub struct MultiRigConfig {
    pub rigs: usize,
    pub frame_sets: usize,
    /// Landmark grid resolution along x, y and z.
    pub grid: [usize; 3],
    pub seed: u64,
    pub pixel_noise: UniformPixelNoise,
}

impl Default for MultiRigConfig {
    fn default() -> Self {
        Self {
            rigs: 2,
            frame_sets: 5,
            grid: [10, 7, 3],
            seed: 0x5EED,
            pixel_noise: UniformPixelNoise::noiseless(),
        }
    }
}

/// Ground-truth scene plus the observation streams derived from it.
#[derive(Debug, Clone)]
pub struct MultiRigScene {
    pub config: MultiRigConfig,
    /// Camera system with ground-truth global poses.
    pub camera_system: CameraSystem,
    pub sys_from_rig: Vec<Iso3>,
    pub world_from_sys: Vec<Iso3>,
    pub landmarks: Vec<Vec3>,
    /// Rotation from the IMU frame into the system frame.
    pub sys_from_imu: Quat,
    /// Rotation from the world frame into the IMU's gravity-aligned world.
    pub imu_world_from_world: Quat,
}

fn pinhole() -> PinholeCamera {
    CameraParams {
        intrinsics: FxFyCxCySkew {
            fx: 500.0,
            fy: 500.0,
            cx: IMAGE_WIDTH / 2.0,
            cy: IMAGE_HEIGHT / 2.0,
            skew: 0.0,
        },
        distortion: BrownConrady5 {
            iters: 8,
            ..BrownConrady5::default()
        },
    }
    .build()
}

fn iso(euler: [Real; 3], t: [Real; 3]) -> Iso3 {
    Iso3::from_parts(
        Translation3::new(t[0], t[1], t[2]),
        UnitQuaternion::from_euler_angles(euler[0], euler[1], euler[2]),
    )
}

/// Pose of the right camera in its rig frame.
pub fn rig_from_right() -> Iso3 {
    Iso3::translation(BASELINE, 0.0, 0.0)
}

/// `sys_from_rig` of rig `i`; rig 0 is the system frame.
pub fn rig_transform(i: usize) -> Iso3 {
    if i == 0 {
        return Iso3::identity();
    }
    let s = i as Real;
    iso(
        [0.03 * s, 0.26 * s, 0.05],
        [0.5 * s, -0.05 * s, 0.1 * s],
    )
}

fn trajectory_pose(k: usize) -> Iso3 {
    const TABLE: [([Real; 3], [Real; 3]); 5] = [
        ([0.0, 0.0, 0.0], [0.0, 0.0, 0.0]),
        ([0.06, 0.10, 0.0], [0.20, 0.05, 0.10]),
        ([-0.04, 0.18, 0.05], [0.35, -0.05, 0.25]),
        ([0.08, 0.05, -0.06], [0.10, 0.10, 0.40]),
        ([0.02, -0.10, 0.08], [-0.15, 0.0, 0.30]),
    ];
    if let Some((e, t)) = TABLE.get(k) {
        return iso(*e, *t);
    }
    let x = k as Real;
    iso(
        [
            0.06 * (1.7 * x).sin(),
            0.15 * (0.9 * x).sin(),
            0.05 * (1.1 * x).cos(),
        ],
        [
            0.2 * (0.8 * x).sin(),
            0.05 * (1.3 * x).cos(),
            0.3 * (0.5 * x).sin(),
        ],
    )
}

fn in_image(px: &Vec2) -> bool {
    px.x >= IMAGE_MARGIN
        && px.x <= IMAGE_WIDTH - IMAGE_MARGIN
        && px.y >= IMAGE_MARGIN
        && px.y <= IMAGE_HEIGHT - IMAGE_MARGIN
}

impl MultiRigScene {
    pub fn new(config: &MultiRigConfig) -> Self {
        let camera = pinhole();
        let sys_from_rig: Vec<Iso3> = (0..config.rigs.max(1)).map(rig_transform).collect();
        let cameras = sys_from_rig
            .iter()
            .enumerate()
            .flat_map(|(i, x)| {
                [
                    SystemCamera {
                        name: format!("cam{}", 2 * i),
                        camera: camera.clone(),
                        global_pose: *x,
                    },
                    SystemCamera {
                        name: format!("cam{}", 2 * i + 1),
                        camera: camera.clone(),
                        global_pose: x * rig_from_right(),
                    },
                ]
            })
            .collect();

        let [nx, ny, nz] = config.grid;
        let mut landmarks = Vec::with_capacity(nx * ny * nz);
        let step = |n: usize, lo: Real, hi: Real, i: usize| {
            if n < 2 {
                (lo + hi) / 2.0
            } else {
                lo + (hi - lo) * i as Real / (n - 1) as Real
            }
        };
        for iz in 0..nz {
            for iy in 0..ny {
                for ix in 0..nx {
                    let j = landmarks.len();
                    let jitter = Vec3::new(
                        signed_unit(config.seed, j, 0),
                        signed_unit(config.seed, j, 1),
                        signed_unit(config.seed, j, 2),
                    ) * 0.08;
                    landmarks.push(
                        Vec3::new(
                            step(nx, -2.0, 2.5, ix),
                            step(ny, -1.5, 1.5, iy),
                            step(nz, 4.0, 8.0, iz),
                        ) + jitter,
                    );
                }
            }
        }

        Self {
            config: config.clone(),
            camera_system: CameraSystem {
                cameras,
            },
            sys_from_rig,
            world_from_sys: (0..config.frame_sets).map(trajectory_pose).collect(),
            landmarks,
            sys_from_imu: UnitQuaternion::from_euler_angles(0.1, -0.3, 1.2),
            imu_world_from_world: UnitQuaternion::from_euler_angles(-1.4, 0.2, 0.05),
        }
    }

    pub fn rig_count(&self) -> usize {
        self.sys_from_rig.len()
    }

    pub fn frame_set_count(&self) -> usize {
        self.world_from_sys.len()
    }

    pub fn stamp(&self, k: usize) -> Timestamp {
        Timestamp(k as u64 * FRAME_PERIOD_NS)
    }

    /// Camera system as known before calibration: every rig at the origin,
    /// stereo baselines known, ground-truth intrinsics.
    pub fn initial_camera_system(&self) -> CameraSystem {
        let mut system = self.camera_system.clone();
        for (idx, cam) in system.cameras.iter_mut().enumerate() {
            cam.global_pose = if idx % 2 == 0 {
                Iso3::identity()
            } else {
                rig_from_right()
            };
        }
        system
    }

    /// Pose of rig `rig` at frame set `k` as reported by its own odometry.
    pub fn rig_pose(&self, rig: usize, k: usize) -> Iso3 {
        let x = self.sys_from_rig[rig];
        (self.world_from_sys[k] * x).inverse() * x
    }

    /// Relative rigid transform `H_i0` that maps rig `rig` into rig 0's frame.
    pub fn rig_extrinsic(&self, rig: usize) -> Iso3 {
        self.sys_from_rig[rig]
    }

    pub fn imu(&self, k: usize) -> ImuMeasurement {
        let orientation =
            self.imu_world_from_world * self.world_from_sys[k].rotation * self.sys_from_imu;
        ImuMeasurement::from_orientation(self.stamp(k), orientation)
    }

    pub fn ground_truth(&self, k: usize) -> GroundTruth {
        GroundTruth {
            stamp: self.stamp(k),
            pose: self.world_from_sys[k],
        }
    }

    /// Odometry stream of one rig: one observation per frame set.
    ///
    /// Tracks that leave the field of view and come back receive a new track
    /// id; the descriptor (the landmark index) stays the same.
    pub fn observations(&self, rig: usize) -> Vec<FrameSetObservation> {
        let (left_id, right_id) = (2 * rig, 2 * rig + 1);
        let x = self.sys_from_rig[rig];
        let right_from_left = rig_from_right().inverse();
        let camera_count = 2 * self.rig_count();
        let noise = self.config.pixel_noise;
        let mut last_seen: HashMap<usize, usize> = HashMap::new();
        let mut generation: HashMap<usize, u64> = HashMap::new();

        let mut out = Vec::with_capacity(self.frame_set_count());
        for k in 0..self.frame_set_count() {
            let left_from_world = (self.world_from_sys[k] * x).inverse();
            let odometry_world_from_world = x.inverse();
            let camera = |idx: usize| &self.camera_system.cameras[idx].camera;

            let mut left = Vec::new();
            let mut right = Vec::new();
            let mut landmarks = Vec::new();
            for (j, p_w) in self.landmarks.iter().enumerate() {
                let p_l = left_from_world.transform_point(&Pt3::from(*p_w)).coords;
                let p_r = right_from_left.transform_point(&Pt3::from(p_l)).coords;
                if p_l.z < MIN_DEPTH || p_r.z < MIN_DEPTH {
                    continue;
                }
                let (Some(uv_l), Some(uv_r)) = (
                    camera(left_id).project_point_c(&p_l),
                    camera(right_id).project_point_c(&p_r),
                ) else {
                    continue;
                };
                if !in_image(&uv_l) || !in_image(&uv_r) {
                    continue;
                }

                let continued = k > 0 && last_seen.get(&j) == Some(&(k - 1));
                let track_generation = generation.entry(j).or_insert(0);
                if !continued {
                    if last_seen.contains_key(&j) {
                        *track_generation += 1;
                    }
                    landmarks.push(LandmarkInit {
                        track: track_id(j, *track_generation),
                        position: odometry_world_from_world
                            .transform_point(&Pt3::from(*p_w))
                            .coords,
                        point_from_stereo: p_l,
                    });
                }
                last_seen.insert(j, k);
                let track = track_id(j, *track_generation);
                let descriptor = (j as u32).to_le_bytes().to_vec();

                let uv_l = noise.apply(k * camera_count + left_id, j, uv_l);
                let uv_r = noise.apply(k * camera_count + right_id, j, uv_r);
                left.push(FeatureObservation {
                    track,
                    keypoint: uv_l,
                    ray: camera(left_id).backproject_pixel(&uv_l).dir,
                    descriptor: descriptor.clone(),
                });
                right.push(FeatureObservation {
                    track,
                    keypoint: uv_r,
                    ray: camera(right_id).backproject_pixel(&uv_r).dir,
                    descriptor,
                });
            }

            out.push(FrameSetObservation {
                pose: Pose::from_iso(self.stamp(k), &self.rig_pose(rig, k)),
                frames: vec![
                    FrameObservation {
                        camera_id: left_id,
                        features: left,
                    },
                    FrameObservation {
                        camera_id: right_id,
                        features: right,
                    },
                ],
                landmarks,
            });
        }
        out
    }

    /// One-segment graph of rig `rig` with IMU and ground truth attached.
    pub fn sub_graph(&self, rig: usize) -> SparseGraph {
        let mut graph = SparseGraph::with_segments(1);
        let mut tracks = HashMap::new();
        for (k, obs) in self.observations(rig).into_iter().enumerate() {
            // Observations reference only tracks created in the same stream.
            if let Err(err) = graph.append_observation(
                0,
                obs,
                Some(self.imu(k)),
                Some(self.ground_truth(k)),
                &mut tracks,
            ) {
                log::warn!("synthetic frame set {} of rig {} dropped: {}", k, rig, err);
            }
        }
        graph
    }

    /// Stereo chessboard captures of rig `rig`.
    pub fn chessboard(&self, rig: usize) -> ChessboardData {
        let (left_id, right_id) = (2 * rig, 2 * rig + 1);
        let right_from_left = rig_from_right().inverse();
        let noise = self.config.pixel_noise;
        let cx = (BOARD_COLS - 1) as Real * BOARD_SQUARE / 2.0;
        let cy = (BOARD_ROWS - 1) as Real * BOARD_SQUARE / 2.0;
        let board: Vec<Pt3> = (0..BOARD_ROWS)
            .flat_map(|r| {
                (0..BOARD_COLS).map(move |c| {
                    Pt3::new(c as Real * BOARD_SQUARE, r as Real * BOARD_SQUARE, 0.0)
                })
            })
            .collect();

        let mut data = ChessboardData::default();
        for v in 0..BOARD_VIEWS {
            let s = v as Real - 1.0;
            let left_from_board = iso([0.25 * s, -0.2 * s, 0.1 * s], [-cx + 0.05 * s, -cy, 0.9]);
            let right_from_board = right_from_left * left_from_board;
            let project = |cam: usize, pose: &Iso3, image: usize| -> Vec<Vec2> {
                board
                    .iter()
                    .enumerate()
                    .filter_map(|(j, p)| {
                        self.camera_system.cameras[cam]
                            .camera
                            .project_point(&pose.transform_point(p))
                            .map(|uv| noise.apply(image, j, uv))
                    })
                    .collect()
            };
            data.object_points.push(board.clone());
            data.image_points_left
                .push(project(left_id, &left_from_board, 1000 + 2 * v));
            data.image_points_right
                .push(project(right_id, &right_from_board, 1001 + 2 * v));
            data.camera_poses_left.push(left_from_board);
            data.camera_poses_right.push(right_from_board);
        }
        data
    }
}

fn track_id(landmark: usize, generation: u64) -> TrackId {
    TrackId(((landmark as u64) << 16) | generation)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn odometry_motions_conjugate_reference_motions() {
        let scene = MultiRigScene::new(&MultiRigConfig::default());
        let x = scene.rig_extrinsic(1);
        for k in 0..scene.frame_set_count() - 1 {
            let a = scene.rig_pose(0, k + 1) * scene.rig_pose(0, k).inverse();
            let b = scene.rig_pose(1, k + 1) * scene.rig_pose(1, k).inverse();
            let (dt, ang) = crate::pose_error(&(a * x), &(x * b));
            assert!(dt < 1e-9 && ang < 1e-9);
        }
    }

    #[test]
    fn sub_graphs_are_linked_and_overlap() {
        let scene = MultiRigScene::new(&MultiRigConfig::default());
        for rig in 0..scene.rig_count() {
            let g = scene.sub_graph(rig);
            g.check_links().unwrap();
            assert_eq!(g.frame_set_count(), 5);
            assert!(g.point_count() > 30, "rig {rig}: {}", g.point_count());
            let stats = crate::reprojection_stats(&g, &scene.initial_camera_system());
            assert!(stats.mean_error < 1e-6, "rig {rig}: {stats}");
        }
    }

    #[test]
    fn chessboard_views_are_complete() {
        let scene = MultiRigScene::new(&MultiRigConfig::default());
        let data = scene.chessboard(1);
        data.validate().unwrap();
        assert_eq!(data.num_views(), 3);
        assert_eq!(data.num_corners(), 3 * 30);
    }
}

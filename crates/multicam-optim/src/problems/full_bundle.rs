//! Joint refinement of intrinsics, extrinsics, trajectory, map and chessboards.
//!
//! Three residual classes share one problem:
//!
//! - single-rig features (pixel reprojection, weight 1),
//! - multi-rig features, those of points seen by more than one rig
//!   (weight `N1 / N2`),
//! - stereo chessboard corners (weight `N1 / N3`).
//!
//! `N1`, `N2` and `N3` count the residuals of each class, so every class
//! contributes with the same total weight as the single-rig features. A weight
//! multiplies the robustified cost of its residuals, so each class keeps the
//! inlier threshold of its loss. Points
//! with two or fewer observations get no parameter block and are reported as
//! singletons.

use crate::backend::{solve_with_observer, BackendKind, BackendSolveOptions, IterationObserver};
use crate::factors::reprojection_model::{stereo_chessboard_residual, StereoCorner};
use crate::ir::{FactorKind, FixedMask, ManifoldKind, ProblemIR, ResidualBlock, RobustLoss};
use crate::params::distortion::BrownConrady5Params;
use crate::params::intrinsics::Intrinsics4;
use crate::params::pose_se3::iso3_to_se3_dvec;
use crate::problems::{solved_block, solved_point, solved_pose};
use anyhow::{ensure, Result};
use multicam_core::{ChessboardData, Iso3, Vec2, Vec3};
use nalgebra::DVector;
use std::collections::HashMap;

/// Points need more observations than this to enter the problem.
pub const MIN_POINT_OBSERVATIONS: usize = 2;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FullBundleCamera {
    pub intrinsics: Intrinsics4,
    pub distortion: BrownConrady5Params,
    pub cam_from_sys: Iso3,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BundlePoint {
    pub position: Vec3,
    /// Observed by more than one rig.
    pub multi_rig: bool,
}

#[derive(Debug, Clone)]
pub struct FeatureObservation {
    pub camera: usize,
    pub pose: usize,
    pub point: usize,
    pub uv: Vec2,
}

/// Chessboard captures of the rig formed by cameras `left` and `right`.
#[derive(Debug, Clone)]
pub struct ChessboardRig {
    pub left: usize,
    pub right: usize,
    pub data: ChessboardData,
}

#[derive(Debug, Clone, Default)]
pub struct FullBundleDataset {
    pub cameras: Vec<FullBundleCamera>,
    /// `sys_from_world` per frame set.
    pub poses: Vec<Iso3>,
    pub points: Vec<BundlePoint>,
    pub features: Vec<FeatureObservation>,
    pub chessboards: Vec<ChessboardRig>,
}

#[derive(Debug, Clone)]
pub struct FullBundleOptions {
    pub feature_loss: RobustLoss,
    pub chessboard_loss: RobustLoss,
    /// Hold every intrinsic parameter constant.
    pub fix_intrinsics: bool,
    pub fix_k3: bool,
    /// Camera indices whose extrinsics are held constant.
    pub fix_extrinsics: Vec<usize>,
    pub fix_poses: Vec<usize>,
    /// Iterations between observer notifications.
    pub observer_stride: usize,
    pub solve: BackendSolveOptions,
}

impl Default for FullBundleOptions {
    fn default() -> Self {
        Self {
            feature_loss: RobustLoss::Huber { scale: 1.0 },
            chessboard_loss: RobustLoss::Cauchy { scale: 1.0 },
            fix_intrinsics: false,
            fix_k3: true,
            fix_extrinsics: vec![0],
            fix_poses: vec![0],
            observer_stride: 10,
            solve: BackendSolveOptions::with_max_iters(1000),
        }
    }
}

/// Residual counts per class.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ResidualCounts {
    pub single_rig: usize,
    pub multi_rig: usize,
    pub chessboard: usize,
}

/// Per-class residual weights. A skipped class has weight 0.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ResidualWeights {
    pub single_rig: f64,
    pub multi_rig: f64,
    pub chessboard: f64,
}

/// Weights that balance the classes against the single-rig features.
///
/// Classes with no residuals are skipped. Without single-rig features the
/// remaining classes use weight 1.
pub fn residual_weights(counts: &ResidualCounts) -> ResidualWeights {
    let n1 = counts.single_rig as f64;
    let balanced = |n: usize| {
        if n == 0 {
            0.0
        } else if counts.single_rig == 0 {
            1.0
        } else {
            n1 / n as f64
        }
    };
    ResidualWeights {
        single_rig: if counts.single_rig == 0 { 0.0 } else { 1.0 },
        multi_rig: balanced(counts.multi_rig),
        chessboard: balanced(counts.chessboard),
    }
}

#[derive(Debug, Clone)]
pub struct FullBundleReport {
    pub counts: ResidualCounts,
    pub weights: ResidualWeights,
    pub final_cost: f64,
    /// Per-camera chessboard RMS pixel error; `None` for cameras without corners.
    pub chessboard_rms_before: Vec<Option<f64>>,
    pub chessboard_rms_after: Vec<Option<f64>>,
}

#[derive(Debug, Clone)]
pub struct FullBundleResult {
    pub cameras: Vec<FullBundleCamera>,
    pub poses: Vec<Iso3>,
    /// Optimized positions; singletons keep their input position.
    pub points: Vec<Vec3>,
    /// Indices of points left out of the problem.
    pub singletons: Vec<usize>,
    /// `camL_from_board` per chessboard rig and view.
    pub boards_left: Vec<Vec<Iso3>>,
    /// `camR_from_board`, derived from the optimized left board and extrinsics.
    pub boards_right: Vec<Vec<Iso3>>,
    pub report: FullBundleReport,
}

/// IR together with the bookkeeping the solve needs.
#[derive(Debug, Clone)]
pub struct FullBundleProblem {
    pub ir: ProblemIR,
    pub initial: HashMap<String, DVector<f64>>,
    pub counts: ResidualCounts,
    pub weights: ResidualWeights,
    pub singletons: Vec<usize>,
}

fn validate_dataset(dataset: &FullBundleDataset) -> Result<()> {
    let nc = dataset.cameras.len();
    for f in &dataset.features {
        ensure!(
            f.camera < nc && f.pose < dataset.poses.len() && f.point < dataset.points.len(),
            "feature references camera {} / pose {} / point {} out of range",
            f.camera,
            f.pose,
            f.point
        );
    }
    for rig in &dataset.chessboards {
        ensure!(
            rig.left < nc && rig.right < nc && rig.left != rig.right,
            "chessboard rig cameras {} / {} invalid",
            rig.left,
            rig.right
        );
        rig.data.validate()?;
    }
    Ok(())
}

pub fn build_full_bundle_ir(
    dataset: &FullBundleDataset,
    opts: &FullBundleOptions,
) -> Result<FullBundleProblem> {
    validate_dataset(dataset)?;

    let mut observation_count = vec![0usize; dataset.points.len()];
    for f in &dataset.features {
        observation_count[f.point] += 1;
    }
    let singletons: Vec<usize> = (0..dataset.points.len())
        .filter(|&j| observation_count[j] <= MIN_POINT_OBSERVATIONS)
        .collect();

    let mut counts = ResidualCounts::default();
    for f in &dataset.features {
        if observation_count[f.point] <= MIN_POINT_OBSERVATIONS {
            continue;
        }
        if dataset.points[f.point].multi_rig {
            counts.multi_rig += 1;
        } else {
            counts.single_rig += 1;
        }
    }
    counts.chessboard = dataset.chessboards.iter().map(|r| r.data.num_corners()).sum();
    let weights = residual_weights(&counts);

    let mut ir = ProblemIR::new();
    let mut initial = HashMap::new();

    let intr_fixed = if opts.fix_intrinsics {
        FixedMask::all_fixed(Intrinsics4::DIM)
    } else {
        FixedMask::all_free()
    };
    let dist_fixed = if opts.fix_intrinsics {
        FixedMask::all_fixed(BrownConrady5Params::DIM)
    } else if opts.fix_k3 {
        FixedMask::fix_indices(&[BrownConrady5Params::K3_INDEX])
    } else {
        FixedMask::all_free()
    };

    let mut intr_ids = Vec::new();
    let mut dist_ids = Vec::new();
    let mut extr_ids = Vec::new();
    for (c, cam) in dataset.cameras.iter().enumerate() {
        let key = format!("intr/{c}");
        intr_ids.push(ir.add_param_block(&key, 4, ManifoldKind::Euclidean, intr_fixed.clone()));
        initial.insert(key, cam.intrinsics.to_dvec());

        let key = format!("dist/{c}");
        dist_ids.push(ir.add_param_block(&key, 5, ManifoldKind::Euclidean, dist_fixed.clone()));
        initial.insert(key, cam.distortion.to_dvec());

        let fixed = if opts.fix_extrinsics.contains(&c) {
            FixedMask::all_fixed(7)
        } else {
            FixedMask::all_free()
        };
        let key = format!("extr/{c}");
        extr_ids.push(ir.add_param_block(&key, 7, ManifoldKind::SE3, fixed));
        initial.insert(key, iso3_to_se3_dvec(&cam.cam_from_sys));
    }

    let mut pose_ids = Vec::new();
    for (k, pose) in dataset.poses.iter().enumerate() {
        let fixed = if opts.fix_poses.contains(&k) {
            FixedMask::all_fixed(7)
        } else {
            FixedMask::all_free()
        };
        let key = format!("pose/{k}");
        pose_ids.push(ir.add_param_block(&key, 7, ManifoldKind::SE3, fixed));
        initial.insert(key, iso3_to_se3_dvec(pose));
    }

    let mut point_ids = vec![None; dataset.points.len()];
    for (j, point) in dataset.points.iter().enumerate() {
        if observation_count[j] <= MIN_POINT_OBSERVATIONS {
            continue;
        }
        let key = format!("point/{j}");
        point_ids[j] = Some(ir.add_param_block(
            &key,
            3,
            ManifoldKind::Euclidean,
            FixedMask::all_free(),
        ));
        initial.insert(key, DVector::from_column_slice(point.position.as_slice()));
    }

    for f in &dataset.features {
        let Some(point_id) = point_ids[f.point] else {
            continue;
        };
        let w = if dataset.points[f.point].multi_rig {
            weights.multi_rig
        } else {
            weights.single_rig
        };
        ir.add_residual_block(ResidualBlock::new(
            vec![
                intr_ids[f.camera],
                dist_ids[f.camera],
                extr_ids[f.camera],
                pose_ids[f.pose],
                point_id,
            ],
            FactorKind::ReprojPointPinhole4Dist5Chain {
                uv: [f.uv.x, f.uv.y],
                w: 1.0,
            },
            opts.feature_loss,
        )
        .with_weight(w));
    }

    for (r, rig) in dataset.chessboards.iter().enumerate() {
        for v in 0..rig.data.num_views() {
            let key = format!("board/{r}/{v}");
            let board_id = ir.add_param_block(&key, 7, ManifoldKind::SE3, FixedMask::all_free());
            initial.insert(key, iso3_to_se3_dvec(&rig.data.camera_poses_left[v]));

            for corner in board_corners(&rig.data, v) {
                ir.add_residual_block(ResidualBlock::new(
                    vec![
                        intr_ids[rig.left],
                        dist_ids[rig.left],
                        intr_ids[rig.right],
                        dist_ids[rig.right],
                        extr_ids[rig.left],
                        extr_ids[rig.right],
                        board_id,
                    ],
                    FactorKind::StereoChessboardPinhole4Dist5 {
                        pw: corner.pw,
                        uv_left: corner.uv_left,
                        uv_right: corner.uv_right,
                        w: corner.w,
                    },
                    opts.chessboard_loss,
                )
                .with_weight(weights.chessboard));
            }
        }
    }

    ir.validate()?;
    Ok(FullBundleProblem {
        ir,
        initial,
        counts,
        weights,
        singletons,
    })
}

fn board_corners(data: &ChessboardData, view: usize) -> impl Iterator<Item = StereoCorner> + '_ {
    data.object_points[view]
        .iter()
        .zip(&data.image_points_left[view])
        .zip(&data.image_points_right[view])
        .map(move |((pw, l), r)| StereoCorner {
            pw: [pw.x, pw.y, pw.z],
            uv_left: [l.x, l.y],
            uv_right: [r.x, r.y],
            w: 1.0,
        })
}

/// Per-camera RMS pixel error of the chessboard corners under the given
/// parameter values.
fn chessboard_rms(
    params: &HashMap<String, DVector<f64>>,
    dataset: &FullBundleDataset,
) -> Result<Vec<Option<f64>>> {
    let mut sum_sq = vec![0.0; dataset.cameras.len()];
    let mut count = vec![0usize; dataset.cameras.len()];

    for (r, rig) in dataset.chessboards.iter().enumerate() {
        let (l, rc) = (rig.left, rig.right);
        let intr_l = solved_block(params, &format!("intr/{l}"))?;
        let dist_l = solved_block(params, &format!("dist/{l}"))?;
        let intr_r = solved_block(params, &format!("intr/{rc}"))?;
        let dist_r = solved_block(params, &format!("dist/{rc}"))?;
        let extr_l = solved_block(params, &format!("extr/{l}"))?;
        let extr_r = solved_block(params, &format!("extr/{rc}"))?;
        for v in 0..rig.data.num_views() {
            let board = solved_block(params, &format!("board/{r}/{v}"))?;
            for corner in board_corners(&rig.data, v) {
                let res = stereo_chessboard_residual(
                    [intr_l, dist_l, intr_r, dist_r, extr_l, extr_r, board],
                    &corner,
                );
                sum_sq[l] += res[0] * res[0] + res[1] * res[1];
                sum_sq[rc] += res[2] * res[2] + res[3] * res[3];
                count[l] += 1;
                count[rc] += 1;
            }
        }
    }

    Ok(sum_sq
        .iter()
        .zip(&count)
        .map(|(&s, &n)| (n > 0).then(|| (s / n as f64).sqrt()))
        .collect())
}

/// Run the full bundle adjustment.
///
/// `observer`, when given, is notified every `observer_stride` iterations.
pub fn optimize_full_bundle(
    dataset: &FullBundleDataset,
    opts: &FullBundleOptions,
    observer: Option<&mut dyn IterationObserver>,
) -> Result<FullBundleResult> {
    let problem = build_full_bundle_ir(dataset, opts)?;
    let chessboard_rms_before = chessboard_rms(&problem.initial, dataset)?;

    let solution = solve_with_observer(
        BackendKind::TinySolver,
        &problem.ir,
        &problem.initial,
        &opts.solve,
        opts.observer_stride,
        observer,
    )?;
    let params = &solution.params;
    let chessboard_rms_after = chessboard_rms(params, dataset)?;

    let cameras = (0..dataset.cameras.len())
        .map(|c| {
            Ok(FullBundleCamera {
                intrinsics: Intrinsics4::from_dvec(
                    solved_block(params, &format!("intr/{c}"))?.as_view(),
                )?,
                distortion: BrownConrady5Params::from_dvec(
                    solved_block(params, &format!("dist/{c}"))?.as_view(),
                )?,
                cam_from_sys: solved_pose(params, &format!("extr/{c}"))?,
            })
        })
        .collect::<Result<Vec<_>>>()?;
    let poses = (0..dataset.poses.len())
        .map(|k| solved_pose(params, &format!("pose/{k}")))
        .collect::<Result<Vec<_>>>()?;
    let points = dataset
        .points
        .iter()
        .enumerate()
        .map(|(j, p)| {
            if problem.singletons.binary_search(&j).is_ok() {
                Ok(p.position)
            } else {
                solved_point(params, &format!("point/{j}"))
            }
        })
        .collect::<Result<Vec<_>>>()?;

    let mut boards_left = Vec::with_capacity(dataset.chessboards.len());
    let mut boards_right = Vec::with_capacity(dataset.chessboards.len());
    for (r, rig) in dataset.chessboards.iter().enumerate() {
        let right_from_left =
            cameras[rig.right].cam_from_sys * cameras[rig.left].cam_from_sys.inverse();
        let left = (0..rig.data.num_views())
            .map(|v| solved_pose(params, &format!("board/{r}/{v}")))
            .collect::<Result<Vec<_>>>()?;
        boards_right.push(left.iter().map(|b| right_from_left * b).collect());
        boards_left.push(left);
    }

    Ok(FullBundleResult {
        cameras,
        poses,
        points,
        singletons: problem.singletons,
        boards_left,
        boards_right,
        report: FullBundleReport {
            counts: problem.counts,
            weights: problem.weights,
            final_cost: solution.final_cost,
            chessboard_rms_before,
            chessboard_rms_after,
        },
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn weights_balance_classes() {
        let w = residual_weights(&ResidualCounts {
            single_rig: 120,
            multi_rig: 30,
            chessboard: 60,
        });
        assert_eq!(w.single_rig, 1.0);
        assert!((w.multi_rig - 4.0).abs() < 1e-12);
        assert!((w.chessboard - 2.0).abs() < 1e-12);
    }

    #[test]
    fn empty_classes_are_skipped() {
        let w = residual_weights(&ResidualCounts {
            single_rig: 0,
            multi_rig: 8,
            chessboard: 0,
        });
        assert_eq!(w.single_rig, 0.0);
        assert_eq!(w.multi_rig, 1.0);
        assert_eq!(w.chessboard, 0.0);
    }
}

use anyhow::{ensure, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;

/// Identifier for a parameter block in the IR.
///
/// Stable within a `ProblemIR` instance; residual blocks reference their
/// parameters through it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ParamId(pub usize);

/// Supported manifold types for parameter blocks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ManifoldKind {
    /// Standard Euclidean vector space.
    Euclidean,
    /// SE(3) pose stored as `[qx, qy, qz, qw, tx, ty, tz]`.
    SE3,
}

impl ManifoldKind {
    /// Returns `true` if the given ambient dimension matches the manifold storage.
    pub fn compatible_dim(self, dim: usize) -> bool {
        match self {
            ManifoldKind::Euclidean => dim > 0,
            ManifoldKind::SE3 => dim == 7,
        }
    }
}

/// Fixed parameter mask for a block.
///
/// Backends interpret this as per-index fixing for Euclidean blocks; manifold
/// blocks are either fully free or fully fixed.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct FixedMask {
    fixed_indices: HashSet<usize>,
}

impl FixedMask {
    pub fn all_free() -> Self {
        Self::default()
    }

    pub fn all_fixed(dim: usize) -> Self {
        Self {
            fixed_indices: (0..dim).collect(),
        }
    }

    pub fn fix_indices(indices: &[usize]) -> Self {
        Self {
            fixed_indices: indices.iter().copied().collect(),
        }
    }

    pub fn is_fixed(&self, idx: usize) -> bool {
        self.fixed_indices.contains(&idx)
    }

    pub fn is_all_fixed(&self, dim: usize) -> bool {
        (0..dim).all(|i| self.fixed_indices.contains(&i))
    }

    pub fn iter(&self) -> impl Iterator<Item = usize> + '_ {
        self.fixed_indices.iter().copied()
    }

    pub fn is_empty(&self) -> bool {
        self.fixed_indices.is_empty()
    }
}

/// Robust loss applied to a residual block.
///
/// Each residual block carries its own loss; per-observation robustification
/// is achieved by using one residual block per observation.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RobustLoss {
    #[default]
    None,
    Huber {
        scale: f64,
    },
    Cauchy {
        scale: f64,
    },
    Arctan {
        scale: f64,
    },
}

/// Backend-agnostic factor kinds.
///
/// Each kind implies its parameter layout and residual dimension. Rays are
/// camera-frame directions; "normalized" residuals compare `(x/z, y/z)`.
#[derive(Debug, Clone, PartialEq)]
pub enum FactorKind {
    /// Normalized reprojection of a free point through a known camera pose.
    ///
    /// Parameters: `[point]`.
    RayReprojPoint {
        cam_from_world: [f64; 7],
        obs: [f64; 2],
        w: f64,
    },
    /// Normalized reprojection with a free system pose and a free point.
    ///
    /// Parameters: `[pose (sys_from_world), point]`.
    /// Chain: `p_cam = cam_from_sys * pose * p_world`.
    RayReprojPosePoint {
        cam_from_sys: [f64; 7],
        obs: [f64; 2],
        w: f64,
    },
    /// Loop-closure reprojection of a point anchored in another frame set.
    ///
    /// Parameters: `[pose_query, pose_anchor]`.
    /// Chain: `p_cam = cam_from_sys * pose_query * inv(pose_anchor) * p_anchor`.
    RayReprojLoop {
        cam_from_sys: [f64; 7],
        point_in_anchor: [f64; 3],
        obs: [f64; 2],
        w: f64,
    },
    /// Relative-pose (odometry) constraint between two SE3 poses.
    ///
    /// Parameters: `[from, to]`. Predicted motion is `to * inv(from)`.
    /// Residual: `[2 * vec(q_meas^-1 q_pred), t_pred - t_meas]`.
    RelativePose { measured: [f64; 7], w: f64 },
    /// Pixel reprojection through intrinsics, distortion, extrinsics and pose.
    ///
    /// Parameters: `[intr, dist, extr (cam_from_sys), pose (sys_from_world), point]`.
    ReprojPointPinhole4Dist5Chain { uv: [f64; 2], w: f64 },
    /// Stereo chessboard corner seen by both cameras of a rig.
    ///
    /// Parameters: `[intr_l, dist_l, intr_r, dist_r, extr_l, extr_r, board]`,
    /// `board` being `camL_from_board`. The right camera sees the board
    /// through `extr_r * inv(extr_l) * board`.
    StereoChessboardPinhole4Dist5 {
        pw: [f64; 3],
        uv_left: [f64; 2],
        uv_right: [f64; 2],
        w: f64,
    },
}

impl FactorKind {
    /// Residual dimension implied by the factor.
    pub fn residual_dim(&self) -> usize {
        match self {
            FactorKind::RayReprojPoint { .. } => 2,
            FactorKind::RayReprojPosePoint { .. } => 2,
            FactorKind::RayReprojLoop { .. } => 2,
            FactorKind::RelativePose { .. } => 6,
            FactorKind::ReprojPointPinhole4Dist5Chain { .. } => 2,
            FactorKind::StereoChessboardPinhole4Dist5 { .. } => 4,
        }
    }

    /// Expected `(dim, manifold)` of each parameter, in order.
    fn param_layout(&self) -> &'static [(usize, ManifoldKind)] {
        use ManifoldKind::{Euclidean, SE3};
        match self {
            FactorKind::RayReprojPoint { .. } => &[(3, Euclidean)],
            FactorKind::RayReprojPosePoint { .. } => &[(7, SE3), (3, Euclidean)],
            FactorKind::RayReprojLoop { .. } => &[(7, SE3), (7, SE3)],
            FactorKind::RelativePose { .. } => &[(7, SE3), (7, SE3)],
            FactorKind::ReprojPointPinhole4Dist5Chain { .. } => &[
                (4, Euclidean),
                (5, Euclidean),
                (7, SE3),
                (7, SE3),
                (3, Euclidean),
            ],
            FactorKind::StereoChessboardPinhole4Dist5 { .. } => &[
                (4, Euclidean),
                (5, Euclidean),
                (4, Euclidean),
                (5, Euclidean),
                (7, SE3),
                (7, SE3),
                (7, SE3),
            ],
        }
    }
}

/// Parameter block definition in the IR.
#[derive(Debug, Clone)]
pub struct ParamBlock {
    pub id: ParamId,
    pub name: String,
    pub dim: usize,
    pub manifold: ManifoldKind,
    pub fixed: FixedMask,
}

/// Residual block definition in the IR.
///
/// The order of `params` must match the factor's expected parameter order.
#[derive(Debug, Clone)]
pub struct ResidualBlock {
    pub params: Vec<ParamId>,
    pub loss: RobustLoss,
    /// Multiplies the robustified cost: the block contributes `weight * rho(|r|^2)`.
    pub weight: f64,
    pub factor: FactorKind,
    pub residual_dim: usize,
}

impl ResidualBlock {
    /// Residual block whose dimension is taken from the factor.
    pub fn new(params: Vec<ParamId>, factor: FactorKind, loss: RobustLoss) -> Self {
        let residual_dim = factor.residual_dim();
        Self {
            params,
            loss,
            weight: 1.0,
            factor,
            residual_dim,
        }
    }

    pub fn with_weight(mut self, weight: f64) -> Self {
        self.weight = weight;
        self
    }
}

/// Backend-agnostic optimization problem representation.
#[derive(Debug, Default, Clone)]
pub struct ProblemIR {
    pub params: Vec<ParamBlock>,
    pub residuals: Vec<ResidualBlock>,
}

impl ProblemIR {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a parameter block and returns its `ParamId`.
    pub fn add_param_block(
        &mut self,
        name: impl Into<String>,
        dim: usize,
        manifold: ManifoldKind,
        fixed: FixedMask,
    ) -> ParamId {
        let id = ParamId(self.params.len());
        self.params.push(ParamBlock {
            id,
            name: name.into(),
            dim,
            manifold,
            fixed,
        });
        id
    }

    pub fn add_residual_block(&mut self, residual: ResidualBlock) {
        self.residuals.push(residual);
    }

    pub fn param_by_name(&self, name: &str) -> Option<ParamId> {
        self.params.iter().find(|p| p.name == name).map(|p| p.id)
    }

    /// Parameter ids referenced by at least one residual block.
    pub fn referenced_params(&self) -> HashSet<ParamId> {
        self.residuals
            .iter()
            .flat_map(|r| r.params.iter().copied())
            .collect()
    }

    /// Validates internal consistency and factor expectations.
    pub fn validate(&self) -> Result<()> {
        let mut names = HashSet::new();
        for (idx, param) in self.params.iter().enumerate() {
            ensure!(
                param.id.0 == idx,
                "param id mismatch: expected {}, got {:?}",
                idx,
                param.id
            );
            ensure!(
                names.insert(param.name.as_str()),
                "duplicate param name {}",
                param.name
            );
            ensure!(
                param.manifold.compatible_dim(param.dim),
                "param {} manifold {:?} incompatible with dim {}",
                param.name,
                param.manifold,
                param.dim
            );
            for fixed_idx in param.fixed.iter() {
                ensure!(
                    fixed_idx < param.dim,
                    "param {} fixed index {} out of range",
                    param.name,
                    fixed_idx
                );
            }
        }

        for (r_idx, residual) in self.residuals.iter().enumerate() {
            ensure!(
                residual.weight.is_finite() && residual.weight > 0.0,
                "residual {} weight {} must be positive",
                r_idx,
                residual.weight
            );
            ensure!(
                residual.residual_dim == residual.factor.residual_dim(),
                "residual {} dim {} does not match factor expectation {}",
                r_idx,
                residual.residual_dim,
                residual.factor.residual_dim()
            );
            let layout = residual.factor.param_layout();
            ensure!(
                residual.params.len() == layout.len(),
                "residual {} ({:?}) requires {} params, got {}",
                r_idx,
                residual.factor,
                layout.len(),
                residual.params.len()
            );
            for (slot, (param, (dim, manifold))) in residual.params.iter().zip(layout).enumerate() {
                ensure!(
                    param.0 < self.params.len(),
                    "residual {} references missing param {:?}",
                    r_idx,
                    param
                );
                let block = &self.params[param.0];
                ensure!(
                    block.dim == *dim && block.manifold == *manifold,
                    "residual {} slot {} expects {}D {:?}, got {} with dim={} manifold={:?}",
                    r_idx,
                    slot,
                    dim,
                    manifold,
                    block.name,
                    block.dim,
                    block.manifold
                );
            }
        }

        Ok(())
    }
}

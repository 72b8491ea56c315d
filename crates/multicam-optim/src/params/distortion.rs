//! Distortion parameter blocks.

use anyhow::{ensure, Result};
use multicam_core::{BrownConrady5, Real};
use nalgebra::{DVector, DVectorView};

/// Brown-Conrady 5-parameter distortion block.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BrownConrady5Params {
    pub k1: f64,
    pub k2: f64,
    pub k3: f64,
    pub p1: f64,
    pub p2: f64,
}

impl BrownConrady5Params {
    pub const DIM: usize = 5;
    /// Index of `k3` in the parameter vector.
    pub const K3_INDEX: usize = 2;

    /// Zero distortion (identity mapping).
    pub fn zeros() -> Self {
        Self {
            k1: 0.0,
            k2: 0.0,
            k3: 0.0,
            p1: 0.0,
            p2: 0.0,
        }
    }

    /// Convert to a dense parameter vector `[k1, k2, k3, p1, p2]`.
    pub fn to_dvec(&self) -> DVector<f64> {
        nalgebra::dvector![self.k1, self.k2, self.k3, self.p1, self.p2]
    }

    /// Build from a dense parameter vector `[k1, k2, k3, p1, p2]`.
    pub fn from_dvec(v: DVectorView<'_, f64>) -> Result<Self> {
        ensure!(
            v.len() == Self::DIM,
            "expected distortion vector of length {}, got {}",
            Self::DIM,
            v.len()
        );
        Ok(Self {
            k1: v[0],
            k2: v[1],
            k3: v[2],
            p1: v[3],
            p2: v[4],
        })
    }

    /// Convert into the core distortion type with default iteration count.
    pub fn to_core(self) -> BrownConrady5<Real> {
        BrownConrady5 {
            k1: self.k1,
            k2: self.k2,
            k3: self.k3,
            p1: self.p1,
            p2: self.p2,
            iters: 8,
        }
    }

    pub fn from_core(dist: &BrownConrady5<Real>) -> Self {
        Self {
            k1: dist.k1,
            k2: dist.k2,
            k3: dist.k3,
            p1: dist.p1,
            p2: dist.p2,
        }
    }
}

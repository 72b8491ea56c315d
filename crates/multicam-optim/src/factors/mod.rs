//! Residual factor implementations with automatic differentiation support.
//!
//! Every residual function is generic over [`nalgebra::RealField`] so that the
//! same code evaluates plain `f64` values and the dual numbers tiny-solver
//! uses for Jacobians.
//!
//! ## Conventions
//!
//! - SE3 blocks are stored as `[qx, qy, qz, qw, tx, ty, tz]`.
//! - Residuals are `(measured - predicted) * sqrt(w)`.
//! - Depth is clamped to a small positive epsilon before division.
//!
//! # Available Factors
//!
//! - [`reprojection_model`] - normalized ray and pixel reprojection, chained
//!   poses, stereo chessboards and relative-pose constraints.

pub mod reprojection_model;

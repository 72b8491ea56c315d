//! Core types for multi-rig stereo self-calibration.
//!
//! This crate contains:
//! - linear algebra type aliases (`Real`, `Vec2`, `Pt3`, `Iso3`, ...),
//! - composable camera models (projection + distortion + intrinsics),
//! - the [`CameraSystem`] holding every camera of the array and its global pose,
//! - the [`SparseGraph`] scene graph (frame sets, frames, 2D/3D features) with
//!   arena storage and handle-based cross links,
//! - inertial, ground-truth and chessboard measurement types,
//! - deterministic synthetic multi-rig scenes for tests.
//!
//! Camera pipeline:
//! `pixel = K ∘ distortion ∘ projection(dir)`

/// Camera system (cameras + global poses).
pub mod camera_system;
/// Stereo chessboard captures.
pub mod chessboard;
/// Scene graph arena and reprojection statistics.
pub mod graph;
/// Linear algebra type aliases and helpers.
pub mod math;
/// Inertial and ground-truth measurements.
pub mod measurements;
/// Camera models and distortion utilities.
pub mod models;
/// System pose and timestamp types.
pub mod pose;
/// Deterministic synthetic scenes for tests and examples.
pub mod synthetic;

pub use camera_system::*;
pub use chessboard::*;
pub use graph::*;
pub use math::*;
pub use measurements::*;
pub use models::*;
pub use pose::*;

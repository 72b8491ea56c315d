//! Non-linear optimization for multi-rig calibration, built on tiny-solver.
//!
//! Problems are described in a backend-independent IR ([`ir::ProblemIR`]) of
//! named parameter blocks and residual blocks, then compiled and solved by a
//! backend ([`backend::TinySolverBackend`]). Problem builders live in
//! [`problems`]:
//!
//! - [`problems::rig_bundle`]: poses and points of a graph with fixed cameras,
//! - [`problems::point_refine`]: a single scene point over its observations,
//! - [`problems::pose_graph`]: odometry plus loop-closure reprojection,
//! - [`problems::full_bundle`]: intrinsics, extrinsics, poses, points and
//!   stereo chessboards with class re-weighting.

pub mod backend;
pub mod factors;
pub mod ir;
pub mod params;
pub mod problems;

pub use backend::{BackendSolveOptions, IterationObserver, LinearSolverKind};
pub use ir::RobustLoss;

//! Parameter block definitions.
//!
//! Each block type knows its dimension and converts to and from the dense
//! vectors the backends operate on:
//!
//! - [`intrinsics::Intrinsics4`] - `[fx, fy, cx, cy]`
//! - [`distortion::BrownConrady5Params`] - `[k1, k2, k3, p1, p2]`
//! - [`pose_se3`] - SE(3) poses as `[qx, qy, qz, qw, tx, ty, tz]`

pub mod distortion;
pub mod intrinsics;
pub mod pose_se3;

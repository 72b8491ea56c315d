//! Closed-form initializers.
//!
//! - [`handeye`]: rigid transform between two rigidly coupled rigs from their
//!   synchronized motion sequences (`A X = X B`, Tsai-Lenz).
//! - [`pose_imu`]: rotation between the system frame and an inertial sensor
//!   from relative orientations.

pub mod handeye;
pub mod pose_imu;

pub use handeye::*;
pub use pose_imu::*;

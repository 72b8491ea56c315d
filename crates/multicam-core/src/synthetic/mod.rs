//! Deterministic synthetic data for tests.

mod multi_rig;
pub mod noise;

pub use multi_rig::*;
pub use noise::UniformPixelNoise;

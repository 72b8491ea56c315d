use nalgebra::UnitQuaternion;
use serde::{Deserialize, Serialize};

use crate::{Iso3, Real, Timestamp, Vec3};

/// One inertial sample attached to a frame set.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ImuMeasurement {
    pub stamp: Timestamp,
    /// Orientation of the IMU in its world frame (`world_from_imu`).
    pub orientation: UnitQuaternion<Real>,
    pub angular_velocity: Vec3,
    pub linear_acceleration: Vec3,
}

impl ImuMeasurement {
    /// Sample carrying only an orientation.
    pub fn from_orientation(stamp: Timestamp, orientation: UnitQuaternion<Real>) -> Self {
        Self {
            stamp,
            orientation,
            angular_velocity: Vec3::zeros(),
            linear_acceleration: Vec3::zeros(),
        }
    }
}

/// External ground-truth pose (e.g. from a motion-capture or GNSS system).
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct GroundTruth {
    pub stamp: Timestamp,
    pub pose: Iso3,
}

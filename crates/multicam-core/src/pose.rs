use nalgebra::{Translation3, UnitQuaternion};
use serde::{Deserialize, Serialize};

use crate::{Iso3, Real, Vec3};

/// Capture timestamp in nanoseconds.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Timestamp(pub u64);

impl Timestamp {
    pub fn from_secs_f64(secs: Real) -> Self {
        Self((secs * 1e9).round().max(0.0) as u64)
    }

    pub fn as_secs_f64(self) -> Real {
        self.0 as Real * 1e-9
    }

    pub fn as_nanos(self) -> u64 {
        self.0
    }
}

/// System pose of one frame set.
///
/// Maps world coordinates into the system frame at `stamp`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Pose {
    pub stamp: Timestamp,
    pub rotation: UnitQuaternion<Real>,
    pub translation: Vec3,
}

impl Pose {
    pub fn identity(stamp: Timestamp) -> Self {
        Self {
            stamp,
            rotation: UnitQuaternion::identity(),
            translation: Vec3::zeros(),
        }
    }

    pub fn from_iso(stamp: Timestamp, iso: &Iso3) -> Self {
        Self {
            stamp,
            rotation: iso.rotation,
            translation: iso.translation.vector,
        }
    }

    pub fn to_iso(&self) -> Iso3 {
        Iso3::from_parts(Translation3::from(self.translation), self.rotation)
    }

    pub fn set_iso(&mut self, iso: &Iso3) {
        self.rotation = iso.rotation;
        self.translation = iso.translation.vector;
    }
}

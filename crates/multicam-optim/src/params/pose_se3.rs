//! SE(3) parameter conversions.

use anyhow::{ensure, Result};
use multicam_core::Iso3;
use nalgebra::{DVector, DVectorView, Quaternion, UnitQuaternion, Vector3};

/// Convert an `Iso3` into a 7D SE(3) parameter vector `[qx, qy, qz, qw, tx, ty, tz]`.
pub fn iso3_to_se3_dvec(pose: &Iso3) -> DVector<f64> {
    let q = pose.rotation.into_inner();
    let t = pose.translation.vector;
    nalgebra::dvector![
        q.coords[0],
        q.coords[1],
        q.coords[2],
        q.coords[3],
        t.x,
        t.y,
        t.z
    ]
}

/// Same as [`iso3_to_se3_dvec`] but as a fixed array, for factor constants.
pub fn iso3_to_se3_array(pose: &Iso3) -> [f64; 7] {
    let q = pose.rotation.into_inner();
    let t = pose.translation.vector;
    [q.coords[0], q.coords[1], q.coords[2], q.coords[3], t.x, t.y, t.z]
}

/// Convert a 7D SE(3) vector `[qx, qy, qz, qw, tx, ty, tz]` into an `Iso3`.
pub fn se3_dvec_to_iso3(v: DVectorView<'_, f64>) -> Result<Iso3> {
    ensure!(
        v.len() == 7,
        "expected se3 vector of length 7, got {}",
        v.len()
    );
    let quat = Quaternion::new(v[3], v[0], v[1], v[2]);
    let rot = UnitQuaternion::from_quaternion(quat);
    let trans = Vector3::new(v[4], v[5], v[6]);
    Ok(Iso3::from_parts(trans.into(), rot))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn array_and_dvec_agree() {
        let pose = Iso3::new(Vector3::new(0.1, -0.2, 0.3), Vector3::new(0.2, 0.1, -0.3));
        let v = iso3_to_se3_dvec(&pose);
        assert_eq!(v.as_slice(), &iso3_to_se3_array(&pose));
        let back = se3_dvec_to_iso3(v.as_view()).unwrap();
        assert!((back.to_homogeneous() - pose.to_homogeneous()).norm() < 1e-12);
        let short = DVector::<f64>::zeros(6);
        assert!(se3_dvec_to_iso3(short.as_view()).is_err());
    }
}

use nalgebra::{Isometry3, Matrix3, Matrix4, Point2, Point3, UnitQuaternion, Vector2, Vector3};

pub type Real = f64;

pub type Vec2 = Vector2<Real>;
pub type Vec3 = Vector3<Real>;
pub type Pt2 = Point2<Real>;
pub type Pt3 = Point3<Real>;
pub type Mat3 = Matrix3<Real>;
pub type Mat4 = Matrix4<Real>;
pub type Iso3 = Isometry3<Real>;
pub type Quat = UnitQuaternion<Real>;

pub fn to_homogeneous(p: &Pt2) -> Vec3 {
    Vec3::new(p.x, p.y, 1.0)
}

pub fn from_homogeneous(v: &Vec3) -> Pt2 {
    Pt2::new(v.x / v.z, v.y / v.z)
}

/// Normalized image-plane coordinates `(x/z, y/z)` of a camera-frame ray.
///
/// Returns `None` for rays at or behind the image plane.
pub fn ray_to_normalized(ray: &Vec3) -> Option<Vec2> {
    if ray.z <= Real::EPSILON {
        return None;
    }
    Some(Vec2::new(ray.x / ray.z, ray.y / ray.z))
}

/// Translation distance and rotation angle (radians) between two poses.
pub fn pose_error(a: &Iso3, b: &Iso3) -> (Real, Real) {
    let dt = (a.translation.vector - b.translation.vector).norm();
    let angle = a.rotation.angle_to(&b.rotation);
    (dt, angle)
}

/// Pure-rotation isometry.
pub fn rotation_iso(q: &Quat) -> Iso3 {
    Iso3::from_parts(nalgebra::Translation3::identity(), *q)
}

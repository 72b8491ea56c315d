//! Backend-independent reprojection residual models.

use nalgebra::{
    DVectorView, Quaternion, RealField, SVector, UnitQuaternion, Vector2, Vector3,
};

const DEPTH_EPS: f64 = 1e-12;

/// Rigid transform used inside generic residuals.
struct Se3<T: RealField> {
    rot: UnitQuaternion<T>,
    t: Vector3<T>,
}

impl<T: RealField> Se3<T> {
    fn from_view(v: DVectorView<'_, T>) -> Self {
        debug_assert!(v.len() == 7, "pose must have 7 params");
        let quat = Quaternion::new(v[3].clone(), v[0].clone(), v[1].clone(), v[2].clone());
        Self {
            rot: UnitQuaternion::from_quaternion(quat),
            t: Vector3::new(v[4].clone(), v[5].clone(), v[6].clone()),
        }
    }

    fn from_const(v: &[f64; 7]) -> Self {
        let c = |x: f64| T::from_f64(x).unwrap();
        let quat = Quaternion::new(c(v[3]), c(v[0]), c(v[1]), c(v[2]));
        Self {
            rot: UnitQuaternion::from_quaternion(quat),
            t: Vector3::new(c(v[4]), c(v[5]), c(v[6])),
        }
    }

    fn transform(&self, p: &Vector3<T>) -> Vector3<T> {
        self.rot.transform_vector(p) + self.t.clone()
    }

    fn inverse_transform(&self, p: &Vector3<T>) -> Vector3<T> {
        self.rot.inverse_transform_vector(&(p.clone() - self.t.clone()))
    }

    /// `self * other`.
    fn compose(&self, other: &Self) -> Self {
        Self {
            rot: self.rot.clone() * other.rot.clone(),
            t: self.rot.transform_vector(&other.t) + self.t.clone(),
        }
    }

    fn inverse(&self) -> Self {
        let rot = self.rot.inverse();
        let t = -rot.transform_vector(&self.t);
        Self { rot, t }
    }
}

fn const_vec3<T: RealField>(p: [f64; 3]) -> Vector3<T> {
    Vector3::new(
        T::from_f64(p[0]).unwrap(),
        T::from_f64(p[1]).unwrap(),
        T::from_f64(p[2]).unwrap(),
    )
}

fn normalize<T: RealField>(pc: &Vector3<T>) -> Vector2<T> {
    let eps = T::from_f64(DEPTH_EPS).unwrap();
    let z_safe = if pc.z.clone() > eps.clone() {
        pc.z.clone()
    } else {
        eps
    };
    Vector2::new(pc.x.clone() / z_safe.clone(), pc.y.clone() / z_safe)
}

fn weighted_residual<T: RealField>(meas: [f64; 2], pred: &Vector2<T>, w: f64) -> SVector<T, 2> {
    let sqrt_w = T::from_f64(w.sqrt()).unwrap();
    let ru = (T::from_f64(meas[0]).unwrap() - pred.x.clone()) * sqrt_w.clone();
    let rv = (T::from_f64(meas[1]).unwrap() - pred.y.clone()) * sqrt_w;
    SVector::<T, 2>::new(ru, rv)
}

/// Apply Brown-Conrady distortion to normalized coordinates (generic for autodiff).
fn distort_brown_conrady_generic<T: RealField>(
    x: T,
    y: T,
    k1: T,
    k2: T,
    k3: T,
    p1: T,
    p2: T,
) -> (T, T) {
    let r2 = x.clone() * x.clone() + y.clone() * y.clone();
    let r4 = r2.clone() * r2.clone();
    let r6 = r4.clone() * r2.clone();

    let radial = T::one() + k1 * r2.clone() + k2 * r4 + k3 * r6;

    let two = T::one() + T::one();
    let x2 = x.clone() * x.clone();
    let y2 = y.clone() * y.clone();
    let xy = x.clone() * y.clone();

    let x_tan =
        two.clone() * p1.clone() * xy.clone() + p2.clone() * (r2.clone() + two.clone() * x2);
    let y_tan = p1 * (r2 + two.clone() * y2) + two * p2 * xy;

    (x.clone() * radial.clone() + x_tan, y * radial + y_tan)
}

/// Project a camera-frame point to pixels with `[fx, fy, cx, cy]` and
/// `[k1, k2, k3, p1, p2]`.
fn project_pinhole4_dist5<T: RealField>(
    intr: DVectorView<'_, T>,
    dist: DVectorView<'_, T>,
    pc: &Vector3<T>,
) -> Vector2<T> {
    debug_assert!(intr.len() >= 4, "intrinsics must have 4 params");
    debug_assert!(dist.len() >= 5, "distortion must have 5 params");
    let n = normalize(pc);
    let (xd, yd) = distort_brown_conrady_generic(
        n.x.clone(),
        n.y.clone(),
        dist[0].clone(),
        dist[1].clone(),
        dist[2].clone(),
        dist[3].clone(),
        dist[4].clone(),
    );
    Vector2::new(
        intr[0].clone() * xd + intr[2].clone(),
        intr[1].clone() * yd + intr[3].clone(),
    )
}

/// Normalized reprojection of a free world point through a fixed camera pose.
pub(crate) fn ray_reproj_point_generic<T: RealField>(
    point: DVectorView<'_, T>,
    cam_from_world: &[f64; 7],
    obs: [f64; 2],
    w: f64,
) -> SVector<T, 2> {
    debug_assert!(point.len() == 3, "point must have 3 params");
    let pw = Vector3::new(point[0].clone(), point[1].clone(), point[2].clone());
    let pc = Se3::from_const(cam_from_world).transform(&pw);
    weighted_residual(obs, &normalize(&pc), w)
}

/// Normalized reprojection through `cam_from_sys * pose * point`.
pub(crate) fn ray_reproj_pose_point_generic<T: RealField>(
    pose: DVectorView<'_, T>,
    point: DVectorView<'_, T>,
    cam_from_sys: &[f64; 7],
    obs: [f64; 2],
    w: f64,
) -> SVector<T, 2> {
    debug_assert!(point.len() == 3, "point must have 3 params");
    let pw = Vector3::new(point[0].clone(), point[1].clone(), point[2].clone());
    let ps = Se3::from_view(pose).transform(&pw);
    let pc = Se3::<T>::from_const(cam_from_sys).transform(&ps);
    weighted_residual(obs, &normalize(&pc), w)
}

/// Normalized reprojection of a point expressed in an anchor frame set.
///
/// The point is carried to world through `inv(pose_anchor)`, then into the
/// observing camera through `cam_from_sys * pose_query`.
pub(crate) fn ray_reproj_loop_generic<T: RealField>(
    pose_query: DVectorView<'_, T>,
    pose_anchor: DVectorView<'_, T>,
    cam_from_sys: &[f64; 7],
    point_in_anchor: [f64; 3],
    obs: [f64; 2],
    w: f64,
) -> SVector<T, 2> {
    let pw = Se3::from_view(pose_anchor).inverse_transform(&const_vec3(point_in_anchor));
    let ps = Se3::from_view(pose_query).transform(&pw);
    let pc = Se3::<T>::from_const(cam_from_sys).transform(&ps);
    weighted_residual(obs, &normalize(&pc), w)
}

/// Relative-pose residual between two `sys_from_world` poses.
///
/// The predicted motion is `to * inv(from)`; the residual stacks twice the
/// vector part of `q_meas^-1 * q_pred` (sign-canonicalized) and the
/// translation difference.
pub(crate) fn relative_pose_generic<T: RealField>(
    from: DVectorView<'_, T>,
    to: DVectorView<'_, T>,
    measured: &[f64; 7],
    w: f64,
) -> SVector<T, 6> {
    let pred = Se3::from_view(to).compose(&Se3::from_view(from).inverse());
    let meas = Se3::<T>::from_const(measured);

    let dq = meas.rot.inverse() * pred.rot;
    let c = dq.quaternion().coords.clone();
    let two = T::one() + T::one();
    let sign = if c[3].clone() < T::zero() {
        -two
    } else {
        two
    };
    let dt = pred.t - meas.t;
    let sqrt_w = T::from_f64(w.sqrt()).unwrap();

    SVector::<T, 6>::new(
        c[0].clone() * sign.clone() * sqrt_w.clone(),
        c[1].clone() * sign.clone() * sqrt_w.clone(),
        c[2].clone() * sign * sqrt_w.clone(),
        dt.x.clone() * sqrt_w.clone(),
        dt.y.clone() * sqrt_w.clone(),
        dt.z.clone() * sqrt_w,
    )
}

/// Pixel reprojection of a free point through the full camera chain.
///
/// # Parameters
/// - `intr`: Intrinsics vector `[fx, fy, cx, cy]`
/// - `dist`: Distortion vector `[k1, k2, k3, p1, p2]`
/// - `extr`: `cam_from_sys` SE3
/// - `pose`: `sys_from_world` SE3
/// - `point`: world point
/// - `uv`: measured pixel
/// - `w`: weight
pub(crate) fn reproj_pinhole4_dist5_chain_generic<T: RealField>(
    intr: DVectorView<'_, T>,
    dist: DVectorView<'_, T>,
    extr: DVectorView<'_, T>,
    pose: DVectorView<'_, T>,
    point: DVectorView<'_, T>,
    uv: [f64; 2],
    w: f64,
) -> SVector<T, 2> {
    debug_assert!(point.len() == 3, "point must have 3 params");
    let pw = Vector3::new(point[0].clone(), point[1].clone(), point[2].clone());
    let pc = Se3::from_view(extr).transform(&Se3::from_view(pose).transform(&pw));
    let proj = project_pinhole4_dist5(intr, dist, &pc);
    weighted_residual(uv, &proj, w)
}

/// Corner observation in both cameras of a stereo rig.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StereoCorner {
    pub pw: [f64; 3],
    pub uv_left: [f64; 2],
    pub uv_right: [f64; 2],
    pub w: f64,
}

/// Stereo chessboard residual `[u_l, v_l, u_r, v_r]`.
///
/// `board` is `camL_from_board`; the right camera sees the board through
/// `extr_r * inv(extr_l) * board`.
#[allow(clippy::too_many_arguments)]
pub(crate) fn stereo_chessboard_generic<T: RealField>(
    intr_l: DVectorView<'_, T>,
    dist_l: DVectorView<'_, T>,
    intr_r: DVectorView<'_, T>,
    dist_r: DVectorView<'_, T>,
    extr_l: DVectorView<'_, T>,
    extr_r: DVectorView<'_, T>,
    board: DVectorView<'_, T>,
    corner: &StereoCorner,
) -> SVector<T, 4> {
    let pb = const_vec3::<T>(corner.pw);
    let board = Se3::from_view(board);
    let pc_l = board.transform(&pb);
    let right_from_left = Se3::from_view(extr_r).compose(&Se3::from_view(extr_l).inverse());
    let pc_r = right_from_left.transform(&pc_l);

    let rl = weighted_residual(
        corner.uv_left,
        &project_pinhole4_dist5(intr_l, dist_l, &pc_l),
        corner.w,
    );
    let rr = weighted_residual(
        corner.uv_right,
        &project_pinhole4_dist5(intr_r, dist_r, &pc_r),
        corner.w,
    );
    SVector::<T, 4>::new(rl[0].clone(), rl[1].clone(), rr[0].clone(), rr[1].clone())
}

/// Evaluate the stereo chessboard residual in `f64`.
///
/// Blocks are passed in the factor's parameter order.
pub fn stereo_chessboard_residual(
    blocks: [&nalgebra::DVector<f64>; 7],
    corner: &StereoCorner,
) -> SVector<f64, 4> {
    stereo_chessboard_generic(
        blocks[0].as_view(),
        blocks[1].as_view(),
        blocks[2].as_view(),
        blocks[3].as_view(),
        blocks[4].as_view(),
        blocks[5].as_view(),
        blocks[6].as_view(),
        corner,
    )
}

/// Evaluate the relative-pose residual in `f64`.
pub fn relative_pose_residual(
    from: &nalgebra::DVector<f64>,
    to: &nalgebra::DVector<f64>,
    measured: &[f64; 7],
    w: f64,
) -> SVector<f64, 6> {
    relative_pose_generic(from.as_view(), to.as_view(), measured, w)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::params::pose_se3::iso3_to_se3_dvec;
    use multicam_core::Iso3;
    use nalgebra::{dvector, DVector};

    fn arr7(v: &DVector<f64>) -> [f64; 7] {
        let mut out = [0.0; 7];
        out.copy_from_slice(v.as_slice());
        out
    }

    #[test]
    fn loop_residual_vanishes_for_consistent_geometry() {
        let anchor = Iso3::new(Vector3::new(0.2, -0.1, 0.3), Vector3::new(0.05, 0.1, -0.02));
        let query = Iso3::new(Vector3::new(-0.4, 0.0, 0.1), Vector3::new(0.0, -0.2, 0.03));
        let cam_from_sys = Iso3::new(Vector3::new(0.12, 0.0, 0.0), Vector3::zeros());
        let pw = nalgebra::Point3::new(0.3, -0.2, 5.0);
        let p_anchor = anchor.transform_point(&pw);
        let pc = (cam_from_sys * query).transform_point(&pw);
        let obs = [pc.x / pc.z, pc.y / pc.z];

        let r: SVector<f64, 2> = ray_reproj_loop_generic(
            iso3_to_se3_dvec(&query).as_view(),
            iso3_to_se3_dvec(&anchor).as_view(),
            &arr7(&iso3_to_se3_dvec(&cam_from_sys)),
            [p_anchor.x, p_anchor.y, p_anchor.z],
            obs,
            1.0,
        );
        assert!(r.norm() < 1e-12, "r={r}");
    }

    #[test]
    fn relative_pose_residual_is_zero_at_measurement() {
        let from = Iso3::new(Vector3::new(1.0, 0.0, 0.0), Vector3::new(0.0, 0.3, 0.0));
        let to = Iso3::new(Vector3::new(1.2, 0.1, 0.0), Vector3::new(0.1, 0.35, 0.0));
        let measured = arr7(&iso3_to_se3_dvec(&(to * from.inverse())));
        let r = relative_pose_residual(
            &iso3_to_se3_dvec(&from),
            &iso3_to_se3_dvec(&to),
            &measured,
            1.0,
        );
        assert!(r.norm() < 1e-12, "r={r}");

        // A negated measured quaternion describes the same rotation.
        let mut flipped = measured;
        for v in flipped.iter_mut().take(4) {
            *v = -*v;
        }
        let r = relative_pose_residual(
            &iso3_to_se3_dvec(&from),
            &iso3_to_se3_dvec(&to),
            &flipped,
            1.0,
        );
        assert!(r.norm() < 1e-12, "r={r}");
    }

    #[test]
    fn stereo_chessboard_residual_matches_projection() {
        let intr = dvector![500.0, 500.0, 320.0, 240.0];
        let dist = DVector::zeros(5);
        let extr_l = iso3_to_se3_dvec(&Iso3::identity());
        let right_from_left = Iso3::translation(-0.12, 0.0, 0.0);
        let extr_r = iso3_to_se3_dvec(&right_from_left);
        let board = Iso3::translation(-0.1, -0.1, 1.0);
        let pw = [0.05, 0.1, 0.0];
        let pc_l = board.transform_point(&pw.into());
        let pc_r = right_from_left.transform_point(&pc_l);
        let corner = StereoCorner {
            pw,
            uv_left: [500.0 * pc_l.x / pc_l.z + 320.0, 500.0 * pc_l.y / pc_l.z + 240.0],
            uv_right: [500.0 * pc_r.x / pc_r.z + 320.0, 500.0 * pc_r.y / pc_r.z + 240.0],
            w: 1.0,
        };
        let board_v = iso3_to_se3_dvec(&board);
        let r = stereo_chessboard_residual(
            [&intr, &dist, &intr, &dist, &extr_l, &extr_r, &board_v],
            &corner,
        );
        assert!(r.norm() < 1e-9, "r={r}");
    }
}

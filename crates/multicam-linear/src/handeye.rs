//! Rig-to-rig hand-eye calibration (AX = XB) using Tsai–Lenz.
//!
//! Two rigidly mounted rigs observe the same motion, each in its own frame.
//! With `A_k` the motions of the reference rig and `B_k` those of another rig
//! over the same interval, the fixed transform `X` mapping the other rig into
//! the reference rig satisfies `A_k X = X B_k`.

use anyhow::{anyhow, bail, ensure, Result};
use log::debug;
use multicam_core::{Iso3, Quat, Real, Vec3};
use nalgebra::{
    DMatrix, DVector, Matrix3, Matrix4, Quaternion, Rotation3, Translation3, UnitQuaternion,
};

/// Options of [`estimate_rig_transform`].
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct HandEyeOptions {
    /// Motion pairs rotating less than this (in either chain) are discarded.
    pub min_angle_deg: Real,
    /// Relative singular-value gap below which the rotation is unobservable
    /// (all usable motions rotate about parallel axes).
    pub degeneracy_eps: Real,
    /// Ridge term of the translation least squares.
    pub ridge: Real,
}

impl Default for HandEyeOptions {
    fn default() -> Self {
        Self {
            min_angle_deg: 1.0,
            degeneracy_eps: 1e-6,
            ridge: 1e-12,
        }
    }
}

/// Motion pair for AX = XB:
/// A: relative motion of the reference rig,
/// B: relative motion of the rig being calibrated.
#[derive(Debug, Clone, Copy)]
pub struct MotionPair {
    pub rot_a: Matrix3<Real>,
    pub rot_b: Matrix3<Real>,
    pub tra_a: Vec3,
    pub tra_b: Vec3,
}

/// Relative motions `P[k+1] * P[k]^-1` of a pose sequence.
///
/// Empty when fewer than two poses are given.
pub fn relative_motions(poses: &[Iso3]) -> Vec<Iso3> {
    poses.windows(2).map(|w| w[1] * w[0].inverse()).collect()
}

fn make_motion_pair(a: &Iso3, b: &Iso3) -> Result<MotionPair> {
    Ok(MotionPair {
        rot_a: project_to_so3(*a.rotation.to_rotation_matrix().matrix())?,
        rot_b: project_to_so3(*b.rotation.to_rotation_matrix().matrix())?,
        tra_a: a.translation.vector,
        tra_b: b.translation.vector,
    })
}

fn rotation_angle(r: &Matrix3<Real>) -> Real {
    UnitQuaternion::from_rotation_matrix(&Rotation3::from_matrix_unchecked(*r)).angle()
}

/// Pair up synchronized motions, dropping pairs with too little rotation.
pub fn build_motion_pairs(
    motions_ref: &[Iso3],
    motions_rig: &[Iso3],
    min_angle_deg: Real,
) -> Result<Vec<MotionPair>> {
    ensure!(
        motions_ref.len() == motions_rig.len(),
        "inconsistent hand-eye input sizes: reference {} vs rig {}",
        motions_ref.len(),
        motions_rig.len()
    );
    let min_angle = min_angle_deg.to_radians();

    let mut pairs = Vec::with_capacity(motions_ref.len());
    for (k, (a, b)) in motions_ref.iter().zip(motions_rig).enumerate() {
        let pair = make_motion_pair(a, b)?;
        let min_rot = rotation_angle(&pair.rot_a).min(rotation_angle(&pair.rot_b));
        if min_rot < min_angle {
            debug!(
                "motion pair {} rejected: small rotation {:.3} deg",
                k,
                min_rot.to_degrees()
            );
            continue;
        }
        pairs.push(pair);
    }

    if pairs.is_empty() {
        bail!("no valid motion pairs after filtering");
    }
    Ok(pairs)
}

fn quat_left(q: &UnitQuaternion<Real>) -> Matrix4<Real> {
    let w = q.w;
    let (x, y, z) = (q.i, q.j, q.k);
    Matrix4::new(w, -x, -y, -z, x, w, -z, y, y, z, w, -x, z, -y, x, w)
}

fn quat_right(q: &UnitQuaternion<Real>) -> Matrix4<Real> {
    let w = q.w;
    let (x, y, z) = (q.i, q.j, q.k);
    Matrix4::new(w, -x, -y, -z, x, w, z, -y, y, -z, w, x, z, y, -x, w)
}

/// Quaternion on the `w >= 0` hemisphere.
fn canonical(q: &Quat) -> Quat {
    if q.w < 0.0 {
        UnitQuaternion::new_unchecked(-q.into_inner())
    } else {
        *q
    }
}

/// Solve `q_a * q_x = q_x * q_b` over all pairs (least squares, SVD).
///
/// Fails when the null space is not one-dimensional, i.e. the rotation axes
/// of the motions do not span enough directions.
pub fn solve_rotation(rotation_pairs: &[(Quat, Quat)], degeneracy_eps: Real) -> Result<Quat> {
    ensure!(!rotation_pairs.is_empty(), "no rotation pairs to solve");
    let mut m = DMatrix::<Real>::zeros(4 * rotation_pairs.len(), 4);
    for (idx, (qa, qb)) in rotation_pairs.iter().enumerate() {
        let (qa, qb) = (canonical(qa), canonical(qb));
        m.view_mut((4 * idx, 0), (4, 4))
            .copy_from(&(quat_left(&qa) - quat_right(&qb)));
    }

    let svd = m.svd(false, true);
    let v_t = svd
        .v_t
        .ok_or_else(|| anyhow!("svd failed during hand-eye estimation"))?;
    let sv = &svd.singular_values;
    let mut order: Vec<usize> = (0..sv.len()).collect();
    order.sort_by(|&i, &j| sv[i].total_cmp(&sv[j]));
    let (smallest, second, largest) = (order[0], order[1], order[order.len() - 1]);
    debug!(
        "hand-eye rotation singular values: min {:.3e}, next {:.3e}, max {:.3e}",
        sv[smallest], sv[second], sv[largest]
    );
    ensure!(
        sv[second] > degeneracy_eps * sv[largest].max(Real::EPSILON),
        "degenerate motion: rotation axes do not constrain the hand-eye rotation"
    );

    let q_vec = v_t.row(smallest);
    let q = Quaternion::new(q_vec[0], q_vec[1], q_vec[2], q_vec[3]);
    Ok(canonical(&UnitQuaternion::from_quaternion(q)))
}

fn estimate_rotation(pairs: &[MotionPair], degeneracy_eps: Real) -> Result<Matrix3<Real>> {
    let rotation_pairs: Vec<(Quat, Quat)> = pairs
        .iter()
        .map(|p| {
            (
                UnitQuaternion::from_rotation_matrix(&Rotation3::from_matrix_unchecked(p.rot_a)),
                UnitQuaternion::from_rotation_matrix(&Rotation3::from_matrix_unchecked(p.rot_b)),
            )
        })
        .collect();
    Ok(solve_rotation(&rotation_pairs, degeneracy_eps)?
        .to_rotation_matrix()
        .into_inner())
}

/// `(R_a - I) t = R_x t_b - t_a`, stacked over all pairs.
fn estimate_translation(pairs: &[MotionPair], rot_x: &Matrix3<Real>, ridge: Real) -> Result<Vec3> {
    let mut mat_c = DMatrix::<Real>::zeros(3 * pairs.len(), 3);
    let mut vec_w = DVector::<Real>::zeros(3 * pairs.len());
    for (idx, p) in pairs.iter().enumerate() {
        mat_c
            .view_mut((3 * idx, 0), (3, 3))
            .copy_from(&(p.rot_a - Matrix3::identity()));
        vec_w
            .rows_mut(3 * idx, 3)
            .copy_from(&(rot_x * p.tra_b - p.tra_a));
    }
    ridge_llsq(&mat_c, &vec_w, ridge)
}

/// Estimate `X` with `A_k X = X B_k`.
///
/// `motions_ref` are the relative motions of the reference rig (see
/// [`relative_motions`]), `motions_rig` those of the rig being calibrated.
/// The result maps the calibrated rig's frame into the reference rig's frame.
///
/// # Errors
///
/// - sequences of different length,
/// - no pair rotates more than `min_angle_deg`,
/// - all usable rotation axes are parallel.
pub fn estimate_rig_transform(
    motions_ref: &[Iso3],
    motions_rig: &[Iso3],
    opts: &HandEyeOptions,
) -> Result<Iso3> {
    let pairs = build_motion_pairs(motions_ref, motions_rig, opts.min_angle_deg)?;
    let rot_x = estimate_rotation(&pairs, opts.degeneracy_eps)?;
    let t_x = estimate_translation(&pairs, &rot_x, opts.ridge)?;
    debug!("hand-eye solved from {} motion pairs", pairs.len());

    let rot = UnitQuaternion::from_rotation_matrix(&Rotation3::from_matrix_unchecked(rot_x));
    Ok(Iso3::from_parts(Translation3::from(t_x), rot))
}

/// Closest rotation matrix (SO(3)) to a general 3x3 matrix.
fn project_to_so3(m: Matrix3<Real>) -> Result<Matrix3<Real>> {
    let svd = m.svd(true, true);
    let u = svd
        .u
        .ok_or_else(|| anyhow!("svd failed during hand-eye estimation"))?;
    let v_t = svd
        .v_t
        .ok_or_else(|| anyhow!("svd failed during hand-eye estimation"))?;
    let mut r = u * v_t;
    if r.determinant() < 0.0 {
        let mut u_flipped = u;
        u_flipped.column_mut(2).neg_mut();
        r = u_flipped * v_t;
    }
    Ok(r)
}

/// min ||A x - b||^2 + λ ||x||^2 via the augmented system `[A; sqrt(λ) I]`.
fn ridge_llsq(a: &DMatrix<Real>, b: &DVector<Real>, lambda: Real) -> Result<Vec3> {
    let m = a.nrows();
    let n = a.ncols();
    ensure!(n == 3, "linear solve failed during hand-eye estimation");

    let mut a_aug = DMatrix::<Real>::zeros(m + n, n);
    a_aug.view_mut((0, 0), (m, n)).copy_from(a);
    let sqrt_lambda = lambda.sqrt();
    for i in 0..n {
        a_aug[(m + i, i)] = sqrt_lambda;
    }
    let mut b_aug = DVector::<Real>::zeros(m + n);
    b_aug.rows_mut(0, m).copy_from(b);

    let x = a_aug
        .svd(true, true)
        .solve(&b_aug, 1e-12)
        .map_err(|_| anyhow!("linear solve failed during hand-eye estimation"))?;
    Ok(Vec3::new(x[0], x[1], x[2]))
}

#[cfg(test)]
mod tests {
    use super::*;
    use multicam_core::pose_error;

    fn make_iso(angles: (Real, Real, Real), t: (Real, Real, Real)) -> Iso3 {
        let rot = Rotation3::from_euler_angles(angles.0, angles.1, angles.2);
        Iso3::from_parts(Translation3::new(t.0, t.1, t.2), rot.into())
    }

    fn coupled_motions(x: &Iso3, a: &[Iso3]) -> Vec<Iso3> {
        a.iter().map(|a| x.inverse() * a * x).collect()
    }

    #[test]
    fn recovers_ground_truth() {
        let x_gt = make_iso((0.2, -0.1, 0.05), (0.1, -0.05, 0.2));
        let a: Vec<Iso3> = (1..6)
            .map(|k| {
                let kf = k as Real;
                make_iso(
                    (0.05 * kf, -0.03 * kf * kf, 0.02),
                    (0.1 * kf, -0.05 * kf, 0.05),
                )
            })
            .collect();
        let b = coupled_motions(&x_gt, &a);

        let x_est = estimate_rig_transform(&a, &b, &HandEyeOptions::default()).unwrap();
        let (dt, ang) = pose_error(&x_est, &x_gt);
        assert!(dt < 1e-6, "translation error too large: {}", dt);
        assert!(ang < 1e-6, "rotation error too large: {}", ang);
    }

    #[test]
    fn relative_motions_of_short_sequences_are_empty() {
        assert!(relative_motions(&[]).is_empty());
        assert!(relative_motions(&[Iso3::identity()]).is_empty());
        assert_eq!(relative_motions(&[Iso3::identity(); 3]).len(), 2);
    }

    #[test]
    fn mismatched_lengths_are_rejected() {
        let a = vec![make_iso((0.1, 0.0, 0.0), (0.0, 0.0, 0.0)); 3];
        let err = estimate_rig_transform(&a, &a[..2], &HandEyeOptions::default());
        assert!(err.is_err());
    }

    #[test]
    fn small_motions_leave_no_pairs() {
        let a = vec![make_iso((0.001, 0.0, 0.0), (0.1, 0.0, 0.0)); 4];
        let err = estimate_rig_transform(&a, &a, &HandEyeOptions::default()).unwrap_err();
        assert!(err.to_string().contains("no valid motion pairs"));
    }

    #[test]
    fn parallel_axes_are_degenerate() {
        let x_gt = make_iso((0.2, -0.1, 0.05), (0.1, -0.05, 0.2));
        let a: Vec<Iso3> = (1..5)
            .map(|k| make_iso((0.1 * k as Real, 0.0, 0.0), (0.1, 0.0, 0.0)))
            .collect();
        let b = coupled_motions(&x_gt, &a);
        let err = estimate_rig_transform(&a, &b, &HandEyeOptions::default()).unwrap_err();
        assert!(err.to_string().contains("degenerate"));
    }
}

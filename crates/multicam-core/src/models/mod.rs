//! Camera model building blocks.
//!
//! The camera pipeline has three stages:
//!
//! 1. `ProjectionModel`: map a 3D ray to normalized coordinates (pinhole).
//! 2. `DistortionModel`: apply radial/tangential distortion in normalized space.
//! 3. `IntrinsicsModel`: map normalized coordinates to pixels (K matrix).
//!
//! Every camera of the array uses [`PinholeCamera`]. Its intrinsic parameter
//! vector, as consumed by the optimizers, is
//! `[fx, fy, cx, cy, k1, k2, k3, p1, p2]`.

mod camera;
mod distortion;
mod intrinsics;
mod projection;

pub use camera::*;
pub use distortion::*;
pub use intrinsics::*;
pub use projection::*;

use anyhow::{ensure, Result};
use serde::{Deserialize, Serialize};

use crate::Real;

/// Pinhole camera with Brown-Conrady distortion, the model used by every rig camera.
pub type PinholeCamera = Camera<Real, Pinhole, BrownConrady5<Real>, FxFyCxCySkew<Real>>;

/// Length of the intrinsic parameter vector of a [`PinholeCamera`].
pub const INTRINSIC_PARAM_COUNT: usize = 9;

/// Serializable camera parameters used in configuration files.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CameraParams {
    /// Pinhole intrinsics.
    pub intrinsics: FxFyCxCySkew<Real>,
    /// Brown-Conrady distortion.
    pub distortion: BrownConrady5<Real>,
}

impl CameraParams {
    /// Build the runtime camera model.
    pub fn build(&self) -> PinholeCamera {
        Camera::new(Pinhole, self.distortion, self.intrinsics)
    }
}

/// Pack a camera into `[fx, fy, cx, cy, k1, k2, k3, p1, p2]`.
pub fn camera_to_params(camera: &PinholeCamera) -> [Real; INTRINSIC_PARAM_COUNT] {
    let k = &camera.k;
    let d = &camera.dist;
    [k.fx, k.fy, k.cx, k.cy, d.k1, d.k2, d.k3, d.p1, d.p2]
}

/// Build a camera from `[fx, fy, cx, cy, k1, k2, k3, p1, p2]`, keeping skew at zero.
pub fn camera_from_params(params: &[Real]) -> Result<PinholeCamera> {
    ensure!(
        params.len() == INTRINSIC_PARAM_COUNT,
        "expected {} intrinsic parameters, got {}",
        INTRINSIC_PARAM_COUNT,
        params.len()
    );
    let k = FxFyCxCySkew {
        fx: params[0],
        fy: params[1],
        cx: params[2],
        cy: params[3],
        skew: 0.0,
    };
    let dist = BrownConrady5 {
        k1: params[4],
        k2: params[5],
        k3: params[6],
        p1: params[7],
        p2: params[8],
        iters: 8,
    };
    Ok(Camera::new(Pinhole, dist, k))
}

#[cfg(test)]
mod tests {
    use super::*;
    use nalgebra::{Vector2, Vector3};

    fn test_camera(k1: Real) -> PinholeCamera {
        CameraParams {
            intrinsics: FxFyCxCySkew {
                fx: 500.0,
                fy: 505.0,
                cx: 320.0,
                cy: 240.0,
                skew: 0.0,
            },
            distortion: BrownConrady5 {
                k1,
                k2: 0.01,
                k3: 0.0,
                p1: 0.0005,
                p2: -0.0003,
                iters: 10,
            },
        }
        .build()
    }

    #[test]
    fn roundtrip_backproject_project() {
        let cam = test_camera(-0.08);
        let px = Vector2::new(450.0, 130.0);
        let ray = cam.backproject_pixel(&px);
        let px2 = cam.project_point_c(&(ray.dir * 2.5)).unwrap();
        let err = (px2 - px).norm();
        assert!(err < 1e-6, "err={err}");
    }

    #[test]
    fn points_behind_camera_do_not_project() {
        let cam = test_camera(0.0);
        assert!(cam.project_point_c(&Vector3::new(0.0, 0.0, -1.0)).is_none());
    }

    #[test]
    fn param_vector_layout() {
        let cam = test_camera(-0.08);
        let params = camera_to_params(&cam);
        assert_eq!(params[0], 500.0);
        assert_eq!(params[4], -0.08);
        let rebuilt = camera_from_params(&params).unwrap();
        assert_eq!(camera_to_params(&rebuilt), params);
        assert!(camera_from_params(&params[..4]).is_err());
    }

    #[test]
    fn camera_params_json_shape() {
        let json = r#"{
            "intrinsics": {"fx": 400.0, "fy": 401.0, "cx": 320.0, "cy": 240.0, "skew": 0.0},
            "distortion": {"k1": 0.1, "k2": 0.0, "k3": 0.0, "p1": 0.0, "p2": 0.0}
        }"#;
        let params: CameraParams = serde_json::from_str(json).unwrap();
        assert_eq!(params.distortion.iters, 0);
        assert!((params.intrinsics.fy - 401.0).abs() < 1e-12);
    }
}

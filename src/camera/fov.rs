//! Implements the Field-of-View (FOV) camera model.
//!
//! The FOV model of Devernay and Faugeras describes radial distortion with a
//! single parameter `w`, the field of view of the ideal fisheye lens.
//! Parameters are `[fx, fy, cx, cy, w]`.
//!
//! # References
//!
//! "Straight lines have to be straight" by Frédéric Devernay and Olivier
//! Faugeras.

use nalgebra::{self as na, Matrix2, Matrix2x3, RealField, Vector2, Vector3};

use crate::camera::{validation, CameraModelError, LensModel};

/// Below this `w²` the lens is treated as undistorted.
const W_SQUARED_EPS: f64 = 1e-5;
/// Below this `r²` the distortion factor uses its series expansion.
const R_SQUARED_EPS: f64 = 1e-5;

/// Devernay-Faugeras field-of-view lens.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct Fov;

/// Ratio between distorted and undistorted radius, from the squared radius.
///
/// The square root is only taken away from the optical axis so that dual
/// numbers stay finite on it.
fn distortion_factor<T: RealField>(w: T, r2: T) -> T {
    let w_eps: T = na::convert(W_SQUARED_EPS);
    let r_eps: T = na::convert(R_SQUARED_EPS);
    if w.clone() * w.clone() < w_eps {
        return T::one();
    }
    let two: T = na::convert(2.0);
    let three: T = na::convert(3.0);
    let k = two.clone() * (w.clone() / two).tan();
    if r2 < r_eps {
        let k3 = k.clone() * k.clone() * k.clone();
        k / w.clone() - r2 * k3 / (w * three)
    } else {
        let r = r2.sqrt();
        (r.clone() * k).atan() / (r * w)
    }
}

impl LensModel for Fov {
    const NUM_PARAMS: usize = 5;
    const NAME: &'static str = "fov";

    fn project<T: RealField>(params: &[T], ray: &Vector3<T>) -> Vector2<T> {
        let a = ray.x.clone() / ray.z.clone();
        let b = ray.y.clone() / ray.z.clone();
        let r2 = a.clone() * a.clone() + b.clone() * b.clone();
        let factor = distortion_factor(params[4].clone(), r2);
        Vector2::new(
            params[0].clone() * factor.clone() * a + params[2].clone(),
            params[1].clone() * factor * b + params[3].clone(),
        )
    }

    fn unproject(params: &[f64], pixel: &Vector2<f64>) -> Vector3<f64> {
        let w = params[4];
        let mx = (pixel.x - params[2]) / params[0];
        let my = (pixel.y - params[3]) / params[1];
        let rd = (mx * mx + my * my).sqrt();

        let factor_inv = if w * w < W_SQUARED_EPS {
            1.0
        } else {
            let k = 2.0 * (w / 2.0).tan();
            if rd * rd < R_SQUARED_EPS {
                w / k
            } else {
                (rd * w).tan() / (k * rd)
            }
        };
        Vector3::new(mx * factor_inv, my * factor_inv, 1.0)
    }

    fn d_project_d_ray(params: &[f64], ray: &Vector3<f64>) -> Matrix2x3<f64> {
        let (fx, fy, w) = (params[0], params[1], params[4]);
        let z_inv = 1.0 / ray.z;
        let a = ray.x * z_inv;
        let b = ray.y * z_inv;
        let r2 = a * a + b * b;
        let r = r2.sqrt();

        // factor and (d factor / dr) / r
        let (factor, d_factor_over_r) = if w * w < W_SQUARED_EPS {
            (1.0, 0.0)
        } else {
            let k = 2.0 * (w / 2.0).tan();
            if r2 < R_SQUARED_EPS {
                let k3 = k * k * k;
                (k / w - r2 * k3 / (3.0 * w), -2.0 * k3 / (3.0 * w))
            } else {
                let atan_rk = (r * k).atan();
                (
                    atan_rk / (r * w),
                    k / (w * r2 * (1.0 + r2 * k * k)) - atan_rk / (w * r2 * r),
                )
            }
        };

        let d_pixel_d_ab = Matrix2::new(
            fx * (factor + a * a * d_factor_over_r),
            fx * a * b * d_factor_over_r,
            fy * a * b * d_factor_over_r,
            fy * (factor + b * b * d_factor_over_r),
        );
        let d_ab_d_ray = Matrix2x3::new(z_inv, 0.0, -a * z_inv, 0.0, z_inv, -b * z_inv);
        d_pixel_d_ab * d_ab_d_ray
    }

    fn validate_params(params: &[f64]) -> Result<(), CameraModelError> {
        validation::validate_intrinsics(&validation::intrinsics_of(params))?;
        let w = params[4];
        if !w.is_finite() || !(0.0..std::f64::consts::PI).contains(&w) {
            return Err(CameraModelError::InvalidParams(format!(
                "fov parameter w must lie in [0, pi), got {w}"
            )));
        }
        Ok(())
    }
}

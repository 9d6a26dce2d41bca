//! Implements the Kannala-Brandt camera model.
//!
//! The equidistant fisheye model maps the incidence angle `theta` through an
//! odd polynomial `theta_d = theta (1 + k1 theta^2 + k2 theta^4 + k3 theta^6 + k4 theta^8)`.
//! Parameters are `[fx, fy, cx, cy, k1, k2, k3, k4]`.
//!
//! # References
//!
//! "A Generic Camera Model and Calibration Method for Conventional, Wide-Angle,
//! and Fish-Eye Lenses" by Juho Kannala and Sami S. Brandt.

use nalgebra::{self as na, Matrix2x3, RealField, Vector2, Vector3};

use crate::camera::{validation, CameraModelError, LensModel};

/// Below this squared radius a ray is treated as lying on the optical axis.
const AXIS_EPS: f64 = 1e-14;
const NEWTON_ITERATIONS: usize = 20;

/// Kannala-Brandt equidistant fisheye lens.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct KannalaBrandt;

/// `(theta_d, d theta_d / d theta)` for the distortion polynomial.
fn distort_theta(k: &[f64], theta: f64) -> (f64, f64) {
    let theta2 = theta * theta;
    let theta4 = theta2 * theta2;
    let theta6 = theta4 * theta2;
    let theta8 = theta4 * theta4;
    let theta_d = theta * (1.0 + k[0] * theta2 + k[1] * theta4 + k[2] * theta6 + k[3] * theta8);
    let d_theta_d = 1.0
        + 3.0 * k[0] * theta2
        + 5.0 * k[1] * theta4
        + 7.0 * k[2] * theta6
        + 9.0 * k[3] * theta8;
    (theta_d, d_theta_d)
}

impl LensModel for KannalaBrandt {
    const NUM_PARAMS: usize = 8;
    const NAME: &'static str = "kannala_brandt";

    fn project<T: RealField>(params: &[T], ray: &Vector3<T>) -> Vector2<T> {
        let fx = params[0].clone();
        let fy = params[1].clone();
        let cx = params[2].clone();
        let cy = params[3].clone();
        let (x, y, z) = (ray.x.clone(), ray.y.clone(), ray.z.clone());

        let r2 = x.clone() * x.clone() + y.clone() * y.clone();
        let axis_eps: T = na::convert(AXIS_EPS);
        if r2 < axis_eps {
            return Vector2::new(fx * x / z.clone() + cx, fy * y / z + cy);
        }

        let r = r2.sqrt();
        let theta = r.clone().atan2(z);
        let theta2 = theta.clone() * theta.clone();
        let theta4 = theta2.clone() * theta2.clone();
        let theta6 = theta4.clone() * theta2.clone();
        let theta8 = theta4.clone() * theta4.clone();
        let theta_d = theta
            * (T::one()
                + params[4].clone() * theta2
                + params[5].clone() * theta4
                + params[6].clone() * theta6
                + params[7].clone() * theta8);

        let scale = theta_d / r;
        Vector2::new(fx * scale.clone() * x + cx, fy * scale * y + cy)
    }

    fn unproject(params: &[f64], pixel: &Vector2<f64>) -> Vector3<f64> {
        let mx = (pixel.x - params[2]) / params[0];
        let my = (pixel.y - params[3]) / params[1];
        let theta_d = (mx * mx + my * my).sqrt();
        if theta_d * theta_d < AXIS_EPS {
            return Vector3::new(mx, my, 1.0);
        }

        let k = &params[4..8];
        let mut theta = theta_d;
        for _ in 0..NEWTON_ITERATIONS {
            let (value, derivative) = distort_theta(k, theta);
            let step = (value - theta_d) / derivative;
            theta -= step;
            if step.abs() < 1e-14 {
                break;
            }
        }

        let scale = theta.tan() / theta_d;
        Vector3::new(mx * scale, my * scale, 1.0)
    }

    fn d_project_d_ray(params: &[f64], ray: &Vector3<f64>) -> Matrix2x3<f64> {
        let (fx, fy) = (params[0], params[1]);
        let (x, y, z) = (ray.x, ray.y, ray.z);
        let r2 = x * x + y * y;
        if r2 < AXIS_EPS {
            let z_inv = 1.0 / z;
            return Matrix2x3::new(
                fx * z_inv,
                0.0,
                -fx * x * z_inv * z_inv,
                0.0,
                fy * z_inv,
                -fy * y * z_inv * z_inv,
            );
        }

        let r = r2.sqrt();
        let d2 = r2 + z * z;
        let theta = r.atan2(z);
        let (theta_d, d_theta_d) = distort_theta(&params[4..8], theta);

        // pixel = f * g * (x, y) + c with g = theta_d / r
        let g = theta_d / r;
        let radial = d_theta_d * z / (r2 * d2) - theta_d / (r2 * r);
        let dg_dx = x * radial;
        let dg_dy = y * radial;
        let dg_dz = -d_theta_d / d2;

        Matrix2x3::new(
            fx * (g + x * dg_dx),
            fx * x * dg_dy,
            fx * x * dg_dz,
            fy * y * dg_dx,
            fy * (g + y * dg_dy),
            fy * y * dg_dz,
        )
    }

    fn validate_params(params: &[f64]) -> Result<(), CameraModelError> {
        validation::validate_intrinsics(&validation::intrinsics_of(params))?;
        if params[4..8].iter().any(|k| !k.is_finite()) {
            return Err(CameraModelError::InvalidParams(
                "Kannala-Brandt coefficients must be finite".to_string(),
            ));
        }
        Ok(())
    }
}

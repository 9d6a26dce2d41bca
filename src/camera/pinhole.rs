//! Implements the Pinhole camera model.
//!
//! The pinhole model is the simplest lens model, assuming no distortion.
//! Parameters are `[fx, fy, cx, cy]`.

use nalgebra::{Matrix2x3, RealField, Vector2, Vector3};

use crate::camera::LensModel;

/// Ideal perspective projection.
///
/// # Examples
///
/// ```rust
/// use nalgebra::Vector3;
/// use rig_calib::camera::{CameraInterface, CameraModel, Pinhole};
///
/// let camera = CameraModel::<Pinhole>::new(&[500.0, 500.0, 320.0, 240.0]).unwrap();
/// let pixel = camera.project(&Vector3::new(0.1, 0.2, 1.0));
/// assert!((pixel.x - 370.0).abs() < 1e-9);
/// assert!((pixel.y - 340.0).abs() < 1e-9);
/// ```
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct Pinhole;

impl LensModel for Pinhole {
    const NUM_PARAMS: usize = 4;
    const NAME: &'static str = "pinhole";

    /// `u = fx * X / Z + cx`, `v = fy * Y / Z + cy`
    fn project<T: RealField>(params: &[T], ray: &Vector3<T>) -> Vector2<T> {
        let mx = ray.x.clone() / ray.z.clone();
        let my = ray.y.clone() / ray.z.clone();
        Vector2::new(
            params[0].clone() * mx + params[2].clone(),
            params[1].clone() * my + params[3].clone(),
        )
    }

    fn unproject(params: &[f64], pixel: &Vector2<f64>) -> Vector3<f64> {
        let mx = (pixel.x - params[2]) / params[0];
        let my = (pixel.y - params[3]) / params[1];
        Vector3::new(mx, my, 1.0)
    }

    fn d_project_d_ray(params: &[f64], ray: &Vector3<f64>) -> Matrix2x3<f64> {
        let z_inv = 1.0 / ray.z;
        let z_inv2 = z_inv * z_inv;
        Matrix2x3::new(
            params[0] * z_inv,
            0.0,
            -params[0] * ray.x * z_inv2,
            0.0,
            params[1] * z_inv,
            -params[1] * ray.y * z_inv2,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::camera::{numeric_d_project_d_ray, CameraInterface, CameraModel};
    use approx::assert_relative_eq;

    fn get_sample_camera() -> CameraModel<Pinhole> {
        CameraModel::new(&[461.629, 460.152, 362.680, 246.049]).unwrap()
    }

    #[test]
    fn test_pinhole_project_unproject() {
        let model = get_sample_camera();

        let point_3d = Vector3::new(1.0, 1.0, 5.0);
        let point_2d = model.project(&point_3d);
        let ray = model.unproject(&point_2d);

        assert_relative_eq!(ray.normalize(), point_3d.normalize(), epsilon = 1e-9);
        assert_relative_eq!(ray.z, 1.0);
    }

    #[test]
    fn test_pinhole_unproject_project() {
        let model = get_sample_camera();
        for pixel in [
            Vector2::new(10.0, 20.0),
            Vector2::new(362.68, 246.049),
            Vector2::new(700.0, 450.0),
        ] {
            let ray = model.unproject(&pixel);
            assert_relative_eq!(model.project(&ray), pixel, epsilon = 1e-9);
        }
    }

    #[test]
    fn test_pinhole_jacobian_matches_numeric() {
        let model = get_sample_camera();
        for ray in [
            Vector3::new(0.0, 0.0, 1.0),
            Vector3::new(0.4, -0.3, 2.0),
            Vector3::new(-1.0, 0.5, 3.0),
        ] {
            let analytic = model.d_project_d_ray(&ray);
            let numeric = numeric_d_project_d_ray(|r| model.project(r), &ray);
            assert_relative_eq!(analytic, numeric, epsilon = 1e-4);
        }
    }
}

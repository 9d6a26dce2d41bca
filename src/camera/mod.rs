//! This module defines the camera projection interface used by the rig and the
//! calibration engine.
//!
//! A lens model only has to provide three primitives through [`LensModel`]:
//! projection of a ray to a pixel, unprojection of a pixel to a ray, and the
//! analytic Jacobian of the projection with respect to the ray. Everything
//! else (multi-view transfer with inverse depth and its Jacobian) is derived
//! once in [`CameraInterface`].
//!
//! [`CameraModel`] binds an intrinsic parameter vector to a lens model and is
//! the type the calibration engine optimizes.
//!
//! This module re-exports the concrete lens models from its submodules:
//! - `pinhole`: ideal perspective projection.
//! - `fov`: the Devernay-Faugeras field-of-view model.
//! - `kannala_brandt`: the Kannala-Brandt equidistant fisheye model.

use nalgebra::{Matrix2x3, Matrix2x4, RealField, Vector2, Vector3};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::fs;
use std::io::Write;
use std::marker::PhantomData;

use crate::geometry::Pose;

pub mod fov;
pub mod kannala_brandt;
pub mod pinhole;

pub use fov::Fov;
pub use kannala_brandt::KannalaBrandt;
pub use pinhole::Pinhole;

/// Represents the linear part of a camera's intrinsic parameters.
///
/// Every lens model in this crate stores these four values first in its
/// parameter vector.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Intrinsics {
    /// The focal length along the x-axis, in pixels.
    pub fx: f64,
    /// The focal length along the y-axis, in pixels.
    pub fy: f64,
    /// The x-coordinate of the principal point, in pixels.
    pub cx: f64,
    /// The y-coordinate of the principal point, in pixels.
    pub cy: f64,
}

/// Defines the possible errors that can occur during camera model operations.
#[derive(thiserror::Error, Debug)]
pub enum CameraModelError {
    /// A focal length parameter (fx or fy) is not positive.
    #[error("Focal length must be positive")]
    FocalLengthMustBePositive,
    /// A principal point coordinate (cx or cy) is not finite.
    #[error("Principal point must be finite")]
    PrincipalPointMustBeFinite,
    /// One or more camera parameters are invalid.
    #[error("Invalid camera parameters: {0}")]
    InvalidParams(String),
    /// A YAML camera description could not be parsed or written.
    #[error("Failed to load YAML: {0}")]
    YamlError(String),
    /// File input/output failed.
    #[error("IO Error: {0}")]
    IOError(String),
}

impl From<std::io::Error> for CameraModelError {
    fn from(err: std::io::Error) -> Self {
        CameraModelError::IOError(err.to_string())
    }
}

impl From<serde_yaml::Error> for CameraModelError {
    fn from(err: serde_yaml::Error) -> Self {
        CameraModelError::YamlError(err.to_string())
    }
}

/// The primitive contract every lens model implements.
///
/// Parameters are passed in as a slice laid out as `[fx, fy, cx, cy, ...]`
/// followed by the model specific distortion terms. Implementors are usually
/// zero-sized marker types.
pub trait LensModel: fmt::Debug + Clone + Default + Send + Sync + 'static {
    /// Number of intrinsic parameters of the model.
    const NUM_PARAMS: usize;

    /// Name used in logs and YAML files.
    const NAME: &'static str;

    /// Project a ray in camera coordinates to a pixel.
    ///
    /// Generic over the scalar so residuals can be differentiated
    /// automatically by the solver.
    fn project<T: RealField>(params: &[T], ray: &Vector3<T>) -> Vector2<T>;

    /// Unproject a pixel to a ray scaled to unit depth (`z == 1`).
    fn unproject(params: &[f64], pixel: &Vector2<f64>) -> Vector3<f64>;

    /// Jacobian of [`LensModel::project`] with respect to the ray.
    fn d_project_d_ray(params: &[f64], ray: &Vector3<f64>) -> Matrix2x3<f64>;

    /// Validate a parameter vector that already has the right length.
    fn validate_params(params: &[f64]) -> Result<(), CameraModelError> {
        validation::validate_intrinsics(&validation::intrinsics_of(params))
    }
}

/// Object-safe camera interface with derived multi-view transfer.
///
/// `transfer_3d` and `d_transfer_3d_d_ray` are built purely from `project`
/// and `d_project_d_ray`; implementors are not expected to override them.
pub trait CameraInterface: fmt::Debug + Send + Sync {
    /// Name of the underlying lens model.
    fn model_name(&self) -> &'static str;

    /// Current intrinsic parameter vector.
    fn params(&self) -> &[f64];

    /// Project a ray in camera coordinates to a pixel.
    fn project(&self, ray: &Vector3<f64>) -> Vector2<f64>;

    /// Unproject a pixel to a ray with unit depth.
    fn unproject(&self, pixel: &Vector2<f64>) -> Vector3<f64>;

    /// Jacobian of the projection with respect to the ray (2×3).
    fn d_project_d_ray(&self, ray: &Vector3<f64>) -> Matrix2x3<f64>;

    /// Transfer a ray observed in frame `a` into frame `b` and project it.
    ///
    /// The point is parameterized by its bearing `ray` and inverse depth
    /// `rho`; `rho == 0` is a point at infinity.
    fn transfer_3d(&self, t_ba: &Pose, ray: &Vector3<f64>, rho: f64) -> Vector2<f64> {
        let ray_b = t_ba.rotation.transform_vector(ray) + t_ba.translation.vector * rho;
        self.project(&ray_b)
    }

    /// Jacobian of [`CameraInterface::transfer_3d`] with respect to
    /// `(ray, rho)` (2×4).
    fn d_transfer_3d_d_ray(&self, t_ba: &Pose, ray: &Vector3<f64>, rho: f64) -> Matrix2x4<f64> {
        let rotation = t_ba.rotation.to_rotation_matrix().into_inner();
        let translation = t_ba.translation.vector;
        let ray_b = rotation * ray + translation * rho;
        let d_project = self.d_project_d_ray(&ray_b);

        let mut jacobian = Matrix2x4::zeros();
        jacobian
            .fixed_view_mut::<2, 3>(0, 0)
            .copy_from(&(d_project * rotation));
        jacobian.set_column(3, &(d_project * translation));
        jacobian
    }
}

/// A lens model bound to its intrinsic parameters.
pub struct CameraModel<M: LensModel> {
    params: Vec<f64>,
    model: PhantomData<M>,
}

#[derive(Serialize, Deserialize)]
struct CameraYaml {
    camera_model: String,
    intrinsics: Vec<f64>,
}

#[derive(Serialize, Deserialize)]
struct CameraYamlDoc {
    cam0: CameraYaml,
}

impl<M: LensModel> CameraModel<M> {
    /// Creates a camera from its intrinsic parameter vector.
    ///
    /// # Errors
    ///
    /// [`CameraModelError::InvalidParams`] if `params` does not have
    /// `M::NUM_PARAMS` entries, or any error of `M::validate_params`.
    pub fn new(params: &[f64]) -> Result<Self, CameraModelError> {
        if params.len() != M::NUM_PARAMS {
            return Err(CameraModelError::InvalidParams(format!(
                "{} model requires {} parameters, got {}",
                M::NAME,
                M::NUM_PARAMS,
                params.len()
            )));
        }
        M::validate_params(params)?;
        Ok(CameraModel {
            params: params.to_vec(),
            model: PhantomData,
        })
    }

    /// Number of intrinsic parameters.
    pub fn num_params(&self) -> usize {
        M::NUM_PARAMS
    }

    /// Linear intrinsics (fx, fy, cx, cy).
    pub fn intrinsics(&self) -> Intrinsics {
        validation::intrinsics_of(&self.params)
    }

    /// Replace the parameter vector, e.g. with a solver result.
    pub fn set_params(&mut self, params: &[f64]) -> Result<(), CameraModelError> {
        let updated = Self::new(params)?;
        self.params = updated.params;
        Ok(())
    }

    /// Loads a camera from a YAML file of the form
    /// `cam0: { camera_model: <name>, intrinsics: [...] }`.
    pub fn load_from_yaml(path: &str) -> Result<Self, CameraModelError> {
        let contents = fs::read_to_string(path)?;
        Self::from_yaml_str(&contents)
    }

    /// Parses a camera from a YAML string, see [`CameraModel::load_from_yaml`].
    pub fn from_yaml_str(contents: &str) -> Result<Self, CameraModelError> {
        let doc: CameraYamlDoc = serde_yaml::from_str(contents)?;
        if doc.cam0.camera_model != M::NAME {
            return Err(CameraModelError::InvalidParams(format!(
                "expected camera_model '{}', found '{}'",
                M::NAME,
                doc.cam0.camera_model
            )));
        }
        Self::new(&doc.cam0.intrinsics)
    }

    /// Serializes the camera to YAML, see [`CameraModel::load_from_yaml`].
    pub fn to_yaml_string(&self) -> Result<String, CameraModelError> {
        let doc = CameraYamlDoc {
            cam0: CameraYaml {
                camera_model: M::NAME.to_string(),
                intrinsics: self.params.clone(),
            },
        };
        Ok(serde_yaml::to_string(&doc)?)
    }

    /// Saves the camera to a YAML file.
    pub fn save_to_yaml(&self, path: &str) -> Result<(), CameraModelError> {
        let yaml_string = self.to_yaml_string()?;
        let mut file = fs::File::create(path)?;
        file.write_all(yaml_string.as_bytes())?;
        Ok(())
    }
}

impl<M: LensModel> Clone for CameraModel<M> {
    fn clone(&self) -> Self {
        CameraModel {
            params: self.params.clone(),
            model: PhantomData,
        }
    }
}

impl<M: LensModel> PartialEq for CameraModel<M> {
    fn eq(&self, other: &Self) -> bool {
        self.params == other.params
    }
}

impl<M: LensModel> fmt::Debug for CameraModel<M> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "CameraModel<{}> {:?}", M::NAME, self.params)
    }
}

impl<M: LensModel> CameraInterface for CameraModel<M> {
    fn model_name(&self) -> &'static str {
        M::NAME
    }

    fn params(&self) -> &[f64] {
        &self.params
    }

    fn project(&self, ray: &Vector3<f64>) -> Vector2<f64> {
        M::project(&self.params, ray)
    }

    fn unproject(&self, pixel: &Vector2<f64>) -> Vector3<f64> {
        M::unproject(&self.params, pixel)
    }

    fn d_project_d_ray(&self, ray: &Vector3<f64>) -> Matrix2x3<f64> {
        M::d_project_d_ray(&self.params, ray)
    }
}

/// Common validation functions for camera parameters
pub mod validation {
    use super::*;

    /// Reads `[fx, fy, cx, cy]` from the head of a parameter vector.
    pub fn intrinsics_of(params: &[f64]) -> Intrinsics {
        Intrinsics {
            fx: params[0],
            fy: params[1],
            cx: params[2],
            cy: params[3],
        }
    }

    pub fn validate_intrinsics(intrinsics: &Intrinsics) -> Result<(), CameraModelError> {
        if !(intrinsics.fx > 0.0 && intrinsics.fy > 0.0) {
            return Err(CameraModelError::FocalLengthMustBePositive);
        }
        if !intrinsics.cx.is_finite() || !intrinsics.cy.is_finite() {
            return Err(CameraModelError::PrincipalPointMustBeFinite);
        }
        Ok(())
    }
}

/// Central-difference Jacobian of a projection, shared by the model tests.
#[cfg(test)]
pub(crate) fn numeric_d_project_d_ray<F>(project: F, ray: &Vector3<f64>) -> Matrix2x3<f64>
where
    F: Fn(&Vector3<f64>) -> Vector2<f64>,
{
    const STEP: f64 = 1e-6;
    let mut jacobian = Matrix2x3::zeros();
    for i in 0..3 {
        let mut plus = *ray;
        let mut minus = *ray;
        plus[i] += STEP;
        minus[i] -= STEP;
        jacobian.set_column(i, &((project(&plus) - project(&minus)) / (2.0 * STEP)));
    }
    jacobian
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use nalgebra::{Isometry3, Translation3, UnitQuaternion};

    fn sample_camera() -> CameraModel<Fov> {
        CameraModel::new(&[300.0, 305.0, 320.0, 240.0, 0.9]).unwrap()
    }

    fn sample_rays() -> Vec<Vector3<f64>> {
        vec![
            Vector3::new(0.0, 0.0, 1.0),
            Vector3::new(0.3, -0.2, 1.0),
            Vector3::new(-0.5, 0.4, 2.0),
            Vector3::new(0.1, 0.6, 1.5),
        ]
    }

    #[test]
    fn test_new_rejects_wrong_dimension() {
        let result = CameraModel::<Pinhole>::new(&[500.0, 500.0, 320.0]);
        assert!(matches!(result, Err(CameraModelError::InvalidParams(_))));
    }

    #[test]
    fn test_new_rejects_non_positive_focal_length() {
        let result = CameraModel::<Pinhole>::new(&[0.0, 500.0, 320.0, 240.0]);
        assert!(matches!(
            result,
            Err(CameraModelError::FocalLengthMustBePositive)
        ));
    }

    #[test]
    fn test_transfer_identity_at_infinity_matches_project() {
        let camera = sample_camera();
        let identity = Pose::identity();
        for ray in sample_rays() {
            let transferred = camera.transfer_3d(&identity, &ray, 0.0);
            let projected = camera.project(&ray);
            assert_relative_eq!(transferred, projected, epsilon = 1e-12);
        }
    }

    #[test]
    fn test_transfer_applies_rotation_and_scaled_translation() {
        let camera = sample_camera();
        let t_ba = Isometry3::from_parts(
            Translation3::new(0.1, -0.05, 0.2),
            UnitQuaternion::from_euler_angles(0.05, -0.1, 0.02),
        );
        let ray = Vector3::new(0.2, 0.1, 1.0);
        let rho = 0.25;
        let expected = camera.project(&(t_ba.rotation * ray + t_ba.translation.vector * rho));
        assert_relative_eq!(camera.transfer_3d(&t_ba, &ray, rho), expected, epsilon = 1e-12);
    }

    #[test]
    fn test_transfer_jacobian_matches_numeric() {
        let camera = sample_camera();
        let t_ba = Isometry3::from_parts(
            Translation3::new(-0.2, 0.1, 0.05),
            UnitQuaternion::from_euler_angles(-0.03, 0.08, 0.1),
        );
        let rho = 0.4;
        let step = 1e-6;
        for ray in sample_rays() {
            let analytic = camera.d_transfer_3d_d_ray(&t_ba, &ray, rho);
            let ray_part = numeric_d_project_d_ray(|r| camera.transfer_3d(&t_ba, r, rho), &ray);
            let rho_part = (camera.transfer_3d(&t_ba, &ray, rho + step)
                - camera.transfer_3d(&t_ba, &ray, rho - step))
                / (2.0 * step);
            assert_relative_eq!(
                analytic.fixed_view::<2, 3>(0, 0).into_owned(),
                ray_part,
                epsilon = 1e-4
            );
            assert_relative_eq!(analytic.column(3).into_owned(), rho_part, epsilon = 1e-4);
        }
    }

    #[test]
    fn test_camera_yaml_round_trip() {
        let camera = sample_camera();
        let yaml = camera.to_yaml_string().unwrap();
        let loaded = CameraModel::<Fov>::from_yaml_str(&yaml).unwrap();
        assert_eq!(camera, loaded);
        assert!(CameraModel::<Pinhole>::from_yaml_str(&yaml).is_err());
    }

    #[test]
    fn test_intrinsics_view() {
        let camera = sample_camera();
        let intrinsics = camera.intrinsics();
        assert_eq!(intrinsics.fx, 300.0);
        assert_eq!(intrinsics.fy, 305.0);
        assert_eq!(intrinsics.cx, 320.0);
        assert_eq!(intrinsics.cy, 240.0);
        assert_eq!(camera.num_params(), 5);
    }
}

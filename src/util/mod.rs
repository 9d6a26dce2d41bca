use crate::camera::CameraInterface;
use nalgebra::{Matrix2xX, Matrix3xX};
use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(thiserror::Error, Debug)]
pub enum UtilError {
    #[error("Zero projection points")]
    ZeroProjectionPoints,
    #[error("Invalid parameters: {0}")]
    InvalidParams(String),
}

#[derive(Clone, PartialEq, Serialize, Deserialize)]
pub struct ProjectionError {
    pub rmse: f64,
    pub min: f64,
    pub max: f64,
    pub mean: f64,
    pub stddev: f64,
    pub median: f64,
}

impl fmt::Debug for ProjectionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Projection Error [ rmse: {}, min: {}, max: {}, mean: {}, stddev: {}, median: {} ]",
            self.rmse, self.min, self.max, self.mean, self.stddev, self.median
        )
    }
}

/// Summarize a set of per-point reprojection errors (pixel distances).
///
/// Non-finite entries are skipped. Fails with `ZeroProjectionPoints` if
/// nothing is left.
pub fn compute_projection_error(errors: &[f64]) -> Result<ProjectionError, UtilError> {
    let errors: Vec<f64> = errors.iter().copied().filter(|e| e.is_finite()).collect();
    if errors.is_empty() {
        return Err(UtilError::ZeroProjectionPoints);
    }

    // Calculate statistics
    let n = errors.len() as f64;
    let sum: f64 = errors.iter().sum::<f64>();
    let mean = sum / n;

    // Calculate variance and standard deviation
    let variance: f64 = errors.iter().map(|x| (x - mean).powi(2)).sum::<f64>() / n;
    let stddev = variance.sqrt();

    // Calculate RMSE
    let sum_squared: f64 = errors.iter().map(|x| x.powi(2)).sum::<f64>();
    let rmse = (sum_squared / n).sqrt();

    // Find min and max
    let min = errors.iter().fold(f64::INFINITY, |a, &b| a.min(b));
    let max = errors.iter().fold(f64::NEG_INFINITY, |a, &b| a.max(b));

    // Calculate median
    let mut sorted_errors = errors;
    sorted_errors.sort_by(|a, b| a.total_cmp(b));
    let median = if sorted_errors.len() % 2 == 0 {
        let mid = sorted_errors.len() / 2;
        (sorted_errors[mid - 1] + sorted_errors[mid]) / 2.0
    } else {
        sorted_errors[sorted_errors.len() / 2]
    };

    Ok(ProjectionError {
        rmse,
        min,
        max,
        mean,
        stddev,
        median,
    })
}

/// Reprojection error of a camera over matched camera-frame points and pixels.
pub fn compute_reprojection_error(
    camera: &dyn CameraInterface,
    points3d: &Matrix3xX<f64>,
    points2d: &Matrix2xX<f64>,
) -> Result<ProjectionError, UtilError> {
    if points3d.ncols() != points2d.ncols() {
        return Err(UtilError::InvalidParams(format!(
            "{} points but {} pixels",
            points3d.ncols(),
            points2d.ncols()
        )));
    }

    let errors: Vec<f64> = (0..points3d.ncols())
        .map(|i| {
            let point3d = points3d.column(i).into_owned();
            let point2d = points2d.column(i).into_owned();
            (camera.project(&point3d) - point2d).norm()
        })
        .collect();

    compute_projection_error(&errors)
}

/// One-line parameter listing for a camera, named per lens model.
pub fn format_camera_parameters(camera: &dyn CameraInterface) -> String {
    let p = camera.params();
    match camera.model_name() {
        "pinhole" => format!(
            "Pinhole parameters: fx={:.3}, fy={:.3}, cx={:.3}, cy={:.3}",
            p[0], p[1], p[2], p[3]
        ),
        "fov" => format!(
            "FOV parameters: fx={:.3}, fy={:.3}, cx={:.3}, cy={:.3}, w={:.6}",
            p[0], p[1], p[2], p[3], p[4]
        ),
        "kannala_brandt" => format!(
            "KB parameters: fx={:.3}, fy={:.3}, cx={:.3}, cy={:.3}, k1={:.6}, k2={:.6}, k3={:.6}, k4={:.6}",
            p[0], p[1], p[2], p[3], p[4], p[5], p[6], p[7]
        ),
        name => format!("{name} parameters: {p:?}"),
    }
}

use crate::camera::CameraModelError;

/// Lifecycle calls made in the wrong state.
#[derive(thiserror::Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum Misuse {
    /// `start` or `solve_once` while the solve loop is already running.
    #[error("calibration loop is already running")]
    AlreadyRunning,
    /// `stop` while no solve loop is running.
    #[error("calibration loop is not running")]
    NotRunning,
}

/// Errors reported by the calibration engine.
#[derive(thiserror::Error, Debug)]
pub enum CalibrationError {
    #[error("unknown frame id {id} ({count} frames)")]
    UnknownFrame { id: usize, count: usize },
    #[error("unknown camera id {id} ({count} cameras)")]
    UnknownCamera { id: usize, count: usize },
    #[error("intrinsics must have {expected} parameters, got {actual}")]
    IntrinsicsDimension { expected: usize, actual: usize },
    #[error(transparent)]
    Camera(#[from] CameraModelError),
    #[error("invalid configuration: {0}")]
    Config(String),
    #[error("IO Error: {0}")]
    Io(#[from] std::io::Error),
    #[error("numerical failure: {0}")]
    NumericalFailure(String),
    #[error(transparent)]
    ConcurrencyMisuse(Misuse),
    #[error("failed to spawn the solver thread: {0}")]
    Spawn(#[source] std::io::Error),
}

impl CalibrationError {
    /// `true` for errors caused by invalid input to a structural call.
    pub fn is_configuration(&self) -> bool {
        matches!(
            self,
            CalibrationError::UnknownFrame { .. }
                | CalibrationError::UnknownCamera { .. }
                | CalibrationError::IntrinsicsDimension { .. }
                | CalibrationError::Camera(_)
                | CalibrationError::Config(_)
        )
    }
}

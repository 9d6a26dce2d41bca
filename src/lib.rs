//! Rig Calibration Library
//!
//! Continuous calibration of multi-camera rigs from 3D-point to 2D-pixel
//! correspondences. The library provides:
//! - A camera projection interface with derived multi-view transfer
//! - Pinhole, Field-of-View and Kannala-Brandt lens models
//! - An SE(3) manifold for pose parameter blocks
//! - An incremental calibration engine that re-solves the growing
//!   bundle-adjustment problem on a background thread
//!
//! Nonlinear refinement uses the tiny-solver optimization framework.

pub mod calibrator;
pub mod camera;
pub mod config;
pub mod geometry;
pub mod optimization;
pub mod rig;
pub mod util;

// Re-export commonly used types
pub use calibrator::{
    CalibrationError, Calibrator, CameraPose, CostTerm, Frame, Misuse, RoundOutcome, SolveStats,
};
pub use camera::{
    CameraInterface, CameraModel, CameraModelError, Fov, Intrinsics, KannalaBrandt, LensModel,
    Pinhole,
};
pub use config::{CalibratorConfig, RetryPolicy, SolverOptions};
pub use geometry::{Pose, PoseManifold};
pub use optimization::RoundSummary;
pub use rig::Rig;

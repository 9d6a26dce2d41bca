//! Structural state owned by the engine: frames, cameras and cost terms.
//!
//! All three are append-only arenas addressed by index. Cost terms refer to
//! frames and cameras by id, so growing an arena never invalidates a term.

use nalgebra::{Vector2, Vector3};

use crate::calibrator::CalibrationError;
use crate::camera::{CameraModel, LensModel};
use crate::geometry::Pose;

/// A keyframe: the rig pose at one capture instant.
#[derive(Debug, Clone, PartialEq)]
pub struct Frame {
    pub id: usize,
    /// World to keyframe.
    pub t_kw: Pose,
}

/// A camera together with its extrinsic in the keyframe.
#[derive(Debug, Clone, PartialEq)]
pub struct CameraPose<M: LensModel> {
    pub id: usize,
    pub camera: CameraModel<M>,
    /// Keyframe to camera.
    pub t_ck: Pose,
}

/// One 3D-2D correspondence seen by `camera` in `frame`.
#[derive(Debug, Clone, PartialEq)]
pub struct CostTerm {
    pub frame: usize,
    pub camera: usize,
    /// Target point in the world frame.
    pub point: Vector3<f64>,
    /// Observed pixel.
    pub pixel: Vector2<f64>,
}

#[derive(Debug)]
pub(crate) struct CalibrationState<M: LensModel> {
    pub(crate) frames: Vec<Frame>,
    pub(crate) cameras: Vec<CameraPose<M>>,
    pub(crate) terms: Vec<CostTerm>,
    /// Bumped by `clear`; a round started before it must not write back.
    pub(crate) generation: u64,
}

impl<M: LensModel> Default for CalibrationState<M> {
    fn default() -> Self {
        CalibrationState {
            frames: Vec::new(),
            cameras: Vec::new(),
            terms: Vec::new(),
            generation: 0,
        }
    }
}

impl<M: LensModel> CalibrationState<M> {
    pub(crate) fn add_camera(&mut self, camera: CameraModel<M>, t_ck: Pose) -> usize {
        let id = self.cameras.len();
        self.cameras.push(CameraPose { id, camera, t_ck });
        id
    }

    pub(crate) fn add_frame(&mut self, t_kw: Pose) -> usize {
        let id = self.frames.len();
        self.frames.push(Frame { id, t_kw });
        id
    }

    pub(crate) fn add_term(&mut self, term: CostTerm) -> Result<(), CalibrationError> {
        if term.frame >= self.frames.len() {
            return Err(CalibrationError::UnknownFrame {
                id: term.frame,
                count: self.frames.len(),
            });
        }
        if term.camera >= self.cameras.len() {
            return Err(CalibrationError::UnknownCamera {
                id: term.camera,
                count: self.cameras.len(),
            });
        }
        self.terms.push(term);
        Ok(())
    }

    pub(crate) fn clear(&mut self) {
        self.frames.clear();
        self.cameras.clear();
        self.terms.clear();
        self.generation += 1;
    }
}

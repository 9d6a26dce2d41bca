//! A rig is an ordered set of cameras with their poses in a common frame.
//!
//! Cameras are only ever appended, so an index returned by
//! [`Rig::add_camera`] stays valid for the lifetime of the rig.

use nalgebra::{Point3, Vector2};

use crate::camera::{CameraInterface, CameraModel, LensModel};
use crate::geometry::Pose;

/// Ordered collection of `(camera, T_wc)` pairs.
#[derive(Debug, Default)]
pub struct Rig {
    cameras: Vec<Box<dyn CameraInterface>>,
    t_wc: Vec<Pose>,
}

impl Rig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a camera with its pose in the rig frame and return its index.
    pub fn add_camera(&mut self, camera: Box<dyn CameraInterface>, t_wc: Pose) -> usize {
        self.cameras.push(camera);
        self.t_wc.push(t_wc);
        self.cameras.len() - 1
    }

    pub fn add_camera_model<M: LensModel>(&mut self, camera: CameraModel<M>, t_wc: Pose) -> usize {
        self.add_camera(Box::new(camera), t_wc)
    }

    pub fn len(&self) -> usize {
        self.cameras.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cameras.is_empty()
    }

    pub fn camera(&self, index: usize) -> Option<&dyn CameraInterface> {
        self.cameras.get(index).map(|c| c.as_ref())
    }

    /// Pose of camera `index` in the rig frame (`T_wc`).
    pub fn pose(&self, index: usize) -> Option<&Pose> {
        self.t_wc.get(index)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&dyn CameraInterface, &Pose)> {
        self.cameras
            .iter()
            .map(|c| c.as_ref())
            .zip(self.t_wc.iter())
    }

    /// Project a point given in the rig frame into camera `index`.
    ///
    /// Returns `None` for an unknown index or a point behind the camera.
    pub fn project_point(&self, index: usize, p_world: &Point3<f64>) -> Option<Vector2<f64>> {
        let camera = self.camera(index)?;
        let p_camera = self.t_wc[index].inverse_transform_point(p_world);
        if p_camera.z <= 0.0 {
            return None;
        }
        Some(camera.project(&p_camera.coords))
    }
}

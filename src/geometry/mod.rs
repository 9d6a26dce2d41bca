//! Rigid-body pose helpers shared by the rig, the solver glue and the tests.
//!
//! Poses are `nalgebra::Isometry3<f64>`. When handed to the solver a pose is
//! flattened into the 7-vector `[qx, qy, qz, qw, tx, ty, tz]`, the same
//! layout tiny-solver's SE(3) manifold uses.

use nalgebra::{self as na, DVector, Isometry3, Quaternion, RealField, Translation3};
use nalgebra::{UnitQuaternion, Vector3};

pub mod manifold;

pub use manifold::PoseManifold;

/// Rigid transform between two frames.
pub type Pose = Isometry3<f64>;

/// Length of a pose parameter block.
pub const POSE_PARAM_DIM: usize = 7;

/// Dimension of the pose tangent space.
pub const POSE_TANGENT_DIM: usize = 6;

/// Flatten a pose into `[qx, qy, qz, qw, tx, ty, tz]`.
pub fn pose_to_dvec(pose: &Pose) -> DVector<f64> {
    let q = pose.rotation.quaternion();
    let t = pose.translation.vector;
    na::dvector![q.i, q.j, q.k, q.w, t.x, t.y, t.z]
}

/// Rebuild a pose from `[qx, qy, qz, qw, tx, ty, tz]`.
///
/// The quaternion is re-normalized. Returns `None` on a wrong length or
/// non-finite entries.
pub fn pose_from_slice(v: &[f64]) -> Option<Pose> {
    if v.len() != POSE_PARAM_DIM || v.iter().any(|x| !x.is_finite()) {
        return None;
    }
    let (rotation, translation) = split_pose(v);
    Some(Isometry3::from_parts(Translation3::from(translation), rotation))
}

/// Split a pose parameter block into rotation and translation.
pub fn split_pose<T: RealField>(v: &[T]) -> (UnitQuaternion<T>, Vector3<T>) {
    debug_assert_eq!(v.len(), POSE_PARAM_DIM, "pose must have 7 params");
    let quat = Quaternion::new(v[3].clone(), v[0].clone(), v[1].clone(), v[2].clone());
    let rotation = UnitQuaternion::from_quaternion(quat);
    let translation = Vector3::new(v[4].clone(), v[5].clone(), v[6].clone());
    (rotation, translation)
}

/// Apply a pose parameter block to a point: `R * p + t`.
pub fn transform_point<T: RealField>(pose: &[T], point: &Vector3<T>) -> Vector3<T> {
    let (rotation, translation) = split_pose(pose);
    rotation.transform_vector(point) + translation
}

//! SE(3) manifold for pose parameter blocks.
//!
//! The ambient state is `[qx, qy, qz, qw, tx, ty, tz]` and the tangent is
//! `[rho, phi]` with `rho` the translational part and `phi` the rotation
//! vector. `plus(x, delta) = x * Exp(delta)` and
//! `minus(y, x) = Log(x^-1 * y)`.

use std::num::NonZero;

use nalgebra::{self as na, DMatrix, DVector, DVectorView, Matrix3, Quaternion, RealField};
use nalgebra::{UnitQuaternion, Vector3};
use tiny_solver::manifold::{AutoDiffManifold, Manifold};

use super::{split_pose, POSE_PARAM_DIM, POSE_TANGENT_DIM};

/// Below this squared angle the exponential and logarithm use series
/// expansions.
const SMALL_ANGLE_SQUARED: f64 = 1e-10;

const TANGENT_SIZE: NonZero<usize> = match NonZero::new(POSE_TANGENT_DIM) {
    Some(size) => size,
    None => panic!("pose tangent dimension is zero"),
};

/// Pose manifold registered with the minimizer for every frame pose and
/// camera extrinsic.
#[derive(Debug, Clone, Copy, Default)]
pub struct PoseManifold;

fn to_vec<T: RealField>(v: DVectorView<T>) -> Vec<T> {
    v.iter().cloned().collect()
}

fn hat<T: RealField>(v: &Vector3<T>) -> Matrix3<T> {
    v.cross_matrix()
}

/// `Exp(delta)` split into the rotation and `V(phi) * rho`.
fn exp_se3<T: RealField>(rho: &Vector3<T>, phi: &Vector3<T>) -> (UnitQuaternion<T>, Vector3<T>) {
    let eps: T = na::convert(SMALL_ANGLE_SQUARED);
    let theta2 = phi.norm_squared();
    let half: T = na::convert(0.5);

    let (dq, a, b) = if theta2 < eps {
        let eighth: T = na::convert(0.125);
        let c24: T = na::convert(1.0 / 24.0);
        let c6: T = na::convert(1.0 / 6.0);
        let c120: T = na::convert(1.0 / 120.0);
        let imag = phi * half.clone();
        let q = Quaternion::new(
            T::one() - theta2.clone() * eighth,
            imag.x.clone(),
            imag.y.clone(),
            imag.z.clone(),
        );
        (
            UnitQuaternion::from_quaternion(q),
            half - theta2.clone() * c24,
            c6 - theta2 * c120,
        )
    } else {
        let theta = theta2.clone().sqrt();
        let (sin_half, cos_half) = (theta.clone() * half).sin_cos();
        let imag = phi * (sin_half / theta.clone());
        let q = Quaternion::new(cos_half, imag.x.clone(), imag.y.clone(), imag.z.clone());
        let (sin_t, cos_t) = theta.clone().sin_cos();
        let theta3 = theta2.clone() * theta.clone();
        (
            UnitQuaternion::from_quaternion(q),
            (T::one() - cos_t) / theta2,
            (theta - sin_t) / theta3,
        )
    };

    let phi_hat = hat(phi);
    let phi_hat2 = &phi_hat * &phi_hat;
    let v = Matrix3::identity() + phi_hat * a + phi_hat2 * b;
    (dq, v * rho)
}

/// `Log` of a relative pose, returned as `(rho, phi)`.
fn log_se3<T: RealField>(
    rotation: &UnitQuaternion<T>,
    translation: &Vector3<T>,
) -> (Vector3<T>, Vector3<T>) {
    let eps: T = na::convert(SMALL_ANGLE_SQUARED);
    let two: T = na::convert(2.0);
    let half: T = na::convert(0.5);

    // q and -q are the same rotation; take the short way round
    let mut q = rotation.quaternion().clone();
    if q.w < T::zero() {
        q = -q;
    }
    let imag = q.imag();
    let n2 = imag.norm_squared();

    let phi = if n2 < eps {
        imag * (two / q.w.clone())
    } else {
        let n = n2.sqrt();
        let theta = two * n.clone().atan2(q.w.clone());
        imag * (theta / n)
    };

    let theta2 = phi.norm_squared();
    let c = if theta2 < eps {
        let c12: T = na::convert(1.0 / 12.0);
        let c720: T = na::convert(1.0 / 720.0);
        c12 + theta2 * c720
    } else {
        let theta = theta2.clone().sqrt();
        let (sin_t, cos_t) = theta.clone().sin_cos();
        (T::one() - theta * sin_t * half.clone() / (T::one() - cos_t)) / theta2
    };

    let phi_hat = hat(&phi);
    let phi_hat2 = &phi_hat * &phi_hat;
    let v_inv = Matrix3::identity() - phi_hat * half + phi_hat2 * c;
    (v_inv * translation, phi)
}

fn pack<T: RealField>(rotation: &UnitQuaternion<T>, translation: &Vector3<T>) -> DVector<T> {
    let q = rotation.quaternion();
    na::dvector![
        q.i.clone(),
        q.j.clone(),
        q.k.clone(),
        q.w.clone(),
        translation.x.clone(),
        translation.y.clone(),
        translation.z.clone()
    ]
}

impl<T: RealField> AutoDiffManifold<T> for PoseManifold {
    fn plus(&self, x: DVectorView<T>, delta: DVectorView<T>) -> DVector<T> {
        debug_assert_eq!(x.len(), POSE_PARAM_DIM);
        debug_assert_eq!(delta.len(), POSE_TANGENT_DIM);

        let (rotation, translation) = split_pose(&to_vec(x));
        let rho = Vector3::new(delta[0].clone(), delta[1].clone(), delta[2].clone());
        let phi = Vector3::new(delta[3].clone(), delta[4].clone(), delta[5].clone());

        let (dq, v_rho) = exp_se3(&rho, &phi);
        let new_translation = translation + rotation.transform_vector(&v_rho);
        let new_rotation = rotation * dq;
        pack(&new_rotation, &new_translation)
    }

    fn minus(&self, y: DVectorView<T>, x: DVectorView<T>) -> DVector<T> {
        debug_assert_eq!(x.len(), POSE_PARAM_DIM);
        debug_assert_eq!(y.len(), POSE_PARAM_DIM);

        let (rot_x, t_x) = split_pose(&to_vec(x));
        let (rot_y, t_y) = split_pose(&to_vec(y));
        let rot_x_inv = rot_x.inverse();
        let rel_rotation = rot_x_inv.clone() * rot_y;
        let rel_translation = rot_x_inv.transform_vector(&(t_y - t_x));

        let (rho, phi) = log_se3(&rel_rotation, &rel_translation);
        na::dvector![
            rho.x.clone(),
            rho.y.clone(),
            rho.z.clone(),
            phi.x.clone(),
            phi.y.clone(),
            phi.z.clone()
        ]
    }
}

impl Manifold for PoseManifold {
    fn tangent_size(&self) -> NonZero<usize> {
        TANGENT_SIZE
    }
}

impl PoseManifold {
    /// Jacobian of `plus(x, delta)` with respect to `delta` at `delta = 0`.
    ///
    /// Returns a 7x6 matrix. Translation rows depend only on `rho` through
    /// `R(x)`; quaternion rows depend only on `phi`.
    pub fn plus_jacobian(x: &[f64]) -> DMatrix<f64> {
        let (rotation, _) = split_pose(x);
        let q = rotation.quaternion();
        let v = q.imag();
        let w = q.w;

        let mut jacobian = DMatrix::zeros(POSE_PARAM_DIM, POSE_TANGENT_DIM);
        let d_imag = (Matrix3::identity() * w + v.cross_matrix()) * 0.5;
        jacobian.view_mut((0, 3), (3, 3)).copy_from(&d_imag);
        jacobian
            .view_mut((3, 3), (1, 3))
            .copy_from(&(v.transpose() * -0.5));
        jacobian
            .view_mut((4, 0), (3, 3))
            .copy_from(rotation.to_rotation_matrix().matrix());
        jacobian
    }
}

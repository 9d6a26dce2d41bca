use nalgebra::{self as na, DVector, RealField, Vector2, Vector3};
use std::marker::PhantomData;
use tiny_solver::factors::Factor;

use crate::camera::LensModel;
use crate::geometry::transform_point;

/// Cost function for one observation of a world point.
///
/// Parameter blocks, in order: the frame pose `T_kw` (7), the camera
/// extrinsic `T_ck` (7) and the camera intrinsics (`M::NUM_PARAMS`). The
/// residual is the predicted pixel minus the observed one.
#[derive(Debug, Clone)]
pub struct ReprojectionCost<M: LensModel> {
    /// Target point in the world frame.
    point: Vector3<f64>,
    /// Observed pixel.
    pixel: Vector2<f64>,
    model: PhantomData<M>,
}

impl<M: LensModel> ReprojectionCost<M> {
    pub fn new(point: Vector3<f64>, pixel: Vector2<f64>) -> Self {
        ReprojectionCost {
            point,
            pixel,
            model: PhantomData,
        }
    }
}

impl<M: LensModel, T: RealField> Factor<T> for ReprojectionCost<M> {
    fn residual_func(&self, params: &[DVector<T>]) -> DVector<T> {
        let t_kw = params[0].as_slice();
        let t_ck = params[1].as_slice();
        let intrinsics = params[2].as_slice();

        let p_w = Vector3::new(
            na::convert::<f64, T>(self.point.x),
            na::convert::<f64, T>(self.point.y),
            na::convert::<f64, T>(self.point.z),
        );
        let p_k = transform_point(t_kw, &p_w);
        let p_c = transform_point(t_ck, &p_k);
        let predicted = M::project(intrinsics, &p_c);

        let u: T = na::convert(self.pixel.x);
        let v: T = na::convert(self.pixel.y);
        na::dvector![predicted.x.clone() - u, predicted.y.clone() - v]
    }
}

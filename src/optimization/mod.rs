//! The `optimization` module turns the engine's structural state into a
//! bundle-adjustment problem for `tiny_solver` and folds the solution back.
//!
//! A round has three steps, each with its own locking needs:
//! 1. [`Snapshot::build`] copies every current cost term into a fresh
//!    [`tiny_solver::Problem`], registers the [`PoseManifold`] for frame poses
//!    and camera extrinsics and fixes camera 0's extrinsic. Runs under the
//!    engine lock.
//! 2. [`Snapshot::solve`] runs Levenberg-Marquardt. Runs unlocked.
//! 3. [`write_back`] copies the solved blocks into the arenas by id. Runs
//!    under the engine lock.

use log::debug;
use nalgebra::DVector;
use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tiny_solver::factors::Factor;
use tiny_solver::{LevenbergMarquardtOptimizer, Optimizer as TinySolverOptimizer};

pub mod reprojection;

pub use reprojection::ReprojectionCost;

use crate::calibrator::state::CalibrationState;
use crate::calibrator::CalibrationError;
use crate::camera::{CameraInterface, LensModel};
use crate::config::SolverOptions;
use crate::geometry::{pose_from_slice, pose_to_dvec, PoseManifold, POSE_PARAM_DIM};
use crate::util::{compute_projection_error, ProjectionError};

/// Camera whose extrinsic anchors the gauge.
pub const GAUGE_CAMERA: usize = 0;

pub fn frame_key(id: usize) -> String {
    format!("frame{id}")
}

pub fn extrinsic_key(id: usize) -> String {
    format!("extrinsic{id}")
}

pub fn intrinsics_key(id: usize) -> String {
    format!("intrinsics{id}")
}

/// Outcome of one solve round.
#[derive(Clone, PartialEq)]
pub struct RoundSummary {
    pub num_frames: usize,
    pub num_cameras: usize,
    pub num_observations: usize,
    /// Scalar residuals, two per observation.
    pub num_residuals: usize,
    /// `0.5 * sum(r^2)` before the round.
    pub initial_cost: f64,
    /// `0.5 * sum(r^2)` after the round.
    pub final_cost: f64,
    /// Mean squared scalar residual after the round, `sum(r^2) / num_residuals`.
    /// This is twice `final_cost / num_residuals`.
    pub mse: f64,
    /// Pixel distance statistics after the round.
    pub reprojection: Option<ProjectionError>,
    pub elapsed: Duration,
}

impl fmt::Debug for RoundSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Round [ frames: {}, cameras: {}, residuals: {}, initial cost: {:.6e}, final cost: {:.6e}, mse: {:.6e}, time(ms): {:.1} ]",
            self.num_frames,
            self.num_cameras,
            self.num_residuals,
            self.initial_cost,
            self.final_cost,
            self.mse,
            self.elapsed.as_secs_f64() * 1000.0
        )?;
        if let Some(reprojection) = &self.reprojection {
            write!(f, " {reprojection:?}")?;
        }
        Ok(())
    }
}

struct ResidualBlock<M: LensModel> {
    cost: ReprojectionCost<M>,
    keys: [String; 3],
}

/// A solve problem built from the terms visible at one instant.
pub(crate) struct Snapshot<M: LensModel> {
    problem: tiny_solver::Problem,
    initial: HashMap<String, DVector<f64>>,
    blocks: Vec<ResidualBlock<M>>,
    frames: Vec<usize>,
    cameras: Vec<usize>,
    generation: u64,
}

/// Solver output tagged with the snapshot it came from.
pub(crate) struct SolvedRound {
    solution: HashMap<String, DVector<f64>>,
    frames: Vec<usize>,
    cameras: Vec<usize>,
    generation: u64,
    pub(crate) summary: RoundSummary,
}

impl<M: LensModel> Snapshot<M> {
    /// Build the problem for the current state. `None` if there is nothing
    /// to solve.
    pub(crate) fn build(state: &CalibrationState<M>) -> Option<Self> {
        if state.terms.is_empty() {
            return None;
        }

        let mut problem = tiny_solver::Problem::new();
        let mut blocks = Vec::with_capacity(state.terms.len());
        let mut frames = BTreeSet::new();
        let mut cameras = BTreeSet::new();

        for term in &state.terms {
            frames.insert(term.frame);
            cameras.insert(term.camera);

            let keys = [
                frame_key(term.frame),
                extrinsic_key(term.camera),
                intrinsics_key(term.camera),
            ];
            let cost = ReprojectionCost::<M>::new(term.point, term.pixel);
            let key_refs: Vec<&str> = keys.iter().map(|k| k.as_str()).collect();
            problem.add_residual_block(2, &key_refs, Box::new(cost.clone()), None);
            blocks.push(ResidualBlock { cost, keys });
        }

        let mut initial = HashMap::new();
        for &id in &frames {
            let key = frame_key(id);
            problem.set_variable_manifold(&key, Arc::new(PoseManifold));
            initial.insert(key, pose_to_dvec(&state.frames[id].t_kw));
        }
        for &id in &cameras {
            let camera = &state.cameras[id];
            let key = extrinsic_key(id);
            if id == GAUGE_CAMERA {
                for idx in 0..POSE_PARAM_DIM {
                    problem.fix_variable(&key, idx);
                }
            } else {
                problem.set_variable_manifold(&key, Arc::new(PoseManifold));
            }
            initial.insert(key, pose_to_dvec(&camera.t_ck));
            initial.insert(
                intrinsics_key(id),
                DVector::from_column_slice(camera.camera.params()),
            );
        }

        debug!(
            "Snapshot of {} observations over {} frames and {} cameras",
            blocks.len(),
            frames.len(),
            cameras.len()
        );

        Some(Snapshot {
            problem,
            initial,
            blocks,
            frames: frames.into_iter().collect(),
            cameras: cameras.into_iter().collect(),
            generation: state.generation,
        })
    }

    pub(crate) fn num_residuals(&self) -> usize {
        self.blocks.len() * 2
    }

    /// Residual vector of every block at `values`.
    fn residuals(&self, values: &HashMap<String, DVector<f64>>) -> Option<Vec<DVector<f64>>> {
        self.blocks
            .iter()
            .map(|block| {
                let params = block
                    .keys
                    .iter()
                    .map(|k| values.get(k).cloned())
                    .collect::<Option<Vec<_>>>()?;
                Some(block.cost.residual_func(params.as_slice()))
            })
            .collect()
    }

    /// Run Levenberg-Marquardt on the snapshot.
    ///
    /// A minimizer that reports failure, panics or produces non-finite
    /// values yields [`CalibrationError::NumericalFailure`].
    pub(crate) fn solve(self, options: &SolverOptions) -> Result<SolvedRound, CalibrationError> {
        let start = Instant::now();
        let initial_residuals = self.residuals(&self.initial).ok_or_else(|| {
            CalibrationError::NumericalFailure("missing initial parameter block".to_string())
        })?;
        let initial_cost = half_squared_norm(&initial_residuals);

        let optimizer = LevenbergMarquardtOptimizer::default();
        let optimizer_options = options.to_optimizer_options();
        let result = panic::catch_unwind(AssertUnwindSafe(|| {
            optimizer.optimize(&self.problem, &self.initial, Some(optimizer_options))
        }))
        .map_err(|payload| {
            CalibrationError::NumericalFailure(format!(
                "minimizer panicked: {}",
                panic_message(payload.as_ref())
            ))
        })?;
        let solution = result.ok_or_else(|| {
            CalibrationError::NumericalFailure("Optimization failed".to_string())
        })?;

        if solution.values().any(|v| v.iter().any(|x| !x.is_finite())) {
            return Err(CalibrationError::NumericalFailure(
                "solution contains non-finite values".to_string(),
            ));
        }

        let final_residuals = self.residuals(&solution).ok_or_else(|| {
            CalibrationError::NumericalFailure("solution is missing a parameter block".to_string())
        })?;
        let final_cost = half_squared_norm(&final_residuals);
        let num_residuals = self.num_residuals();
        let pixel_errors: Vec<f64> = final_residuals.iter().map(|r| r.norm()).collect();

        let summary = RoundSummary {
            num_frames: self.frames.len(),
            num_cameras: self.cameras.len(),
            num_observations: self.blocks.len(),
            num_residuals,
            initial_cost,
            final_cost,
            mse: 2.0 * final_cost / num_residuals as f64,
            reprojection: compute_projection_error(&pixel_errors).ok(),
            elapsed: start.elapsed(),
        };

        Ok(SolvedRound {
            solution,
            frames: self.frames,
            cameras: self.cameras,
            generation: self.generation,
            summary,
        })
    }
}

fn half_squared_norm(residuals: &[DVector<f64>]) -> f64 {
    0.5 * residuals.iter().map(|r| r.norm_squared()).sum::<f64>()
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

/// Copy a solved round into the arenas.
///
/// Returns `Ok(false)` without touching anything if the state was cleared
/// after the snapshot. Camera 0's extrinsic is never written. Either every
/// block of the round is applied or none is.
pub(crate) fn write_back<M: LensModel>(
    state: &mut CalibrationState<M>,
    round: &SolvedRound,
) -> Result<bool, CalibrationError> {
    if state.generation != round.generation {
        return Ok(false);
    }

    let missing =
        |key: &str| CalibrationError::NumericalFailure(format!("solution has no block {key}"));
    let lookup = |key: String| -> Result<&DVector<f64>, CalibrationError> {
        round.solution.get(&key).ok_or_else(|| missing(&key))
    };
    let to_pose = |key: String| -> Result<_, CalibrationError> {
        let v = lookup(key.clone())?;
        pose_from_slice(v.as_slice())
            .ok_or_else(|| CalibrationError::NumericalFailure(format!("invalid pose in {key}")))
    };

    let mut frame_updates = Vec::with_capacity(round.frames.len());
    for &id in &round.frames {
        frame_updates.push((id, to_pose(frame_key(id))?));
    }

    let mut camera_updates = Vec::with_capacity(round.cameras.len());
    for &id in &round.cameras {
        let extrinsic = if id == GAUGE_CAMERA {
            None
        } else {
            Some(to_pose(extrinsic_key(id))?)
        };
        let mut camera = state.cameras[id].camera.clone();
        camera.set_params(lookup(intrinsics_key(id))?.as_slice())?;
        camera_updates.push((id, extrinsic, camera));
    }

    for (id, t_kw) in frame_updates {
        state.frames[id].t_kw = t_kw;
    }
    for (id, extrinsic, camera) in camera_updates {
        let entry = &mut state.cameras[id];
        entry.camera = camera;
        if let Some(t_ck) = extrinsic {
            entry.t_ck = t_ck;
        }
    }
    Ok(true)
}

//! Continuous multi-camera calibration engine.
//!
//! [`Calibrator`] owns the frames, cameras and observations of one rig and
//! refines them with repeated bundle-adjustment rounds. Structural calls
//! (`add_camera`, `add_frame`, `add_observation`) only hold the state lock
//! for a push, so they can be made from any thread while a background loop
//! started with [`Calibrator::start`] keeps re-solving the growing problem.
//!
//! Each round snapshots the current observations, solves them without the
//! lock and writes the result back by id. Observations added during a solve
//! are picked up by the next round. Camera 0's extrinsic anchors the gauge
//! and is never modified by a round.

use log::{debug, error, info, warn};
use nalgebra::{Vector2, Vector3};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

pub mod error;
pub(crate) mod state;

pub use error::{CalibrationError, Misuse};
pub use state::{CameraPose, CostTerm, Frame};

use crate::camera::{CameraModel, LensModel};
use crate::config::CalibratorConfig;
use crate::geometry::Pose;
use crate::optimization::{write_back, RoundSummary, Snapshot};
use crate::rig::Rig;
use crate::util::format_camera_parameters;
use state::CalibrationState;

const WORKER_NAME: &str = "calibration-solver";
/// Longest uninterrupted sleep of the loop, so `stop` is not delayed by a
/// long idle interval or backoff.
const SLEEP_SLICE: Duration = Duration::from_millis(5);

/// What a single round did.
#[derive(Debug, Clone, PartialEq)]
pub enum RoundOutcome {
    /// No observations, nothing was solved.
    Idle,
    /// The round was solved and written back.
    Applied(RoundSummary),
    /// The round was solved but the engine was cleared meanwhile.
    Discarded,
}

/// Counters of the rounds run so far.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SolveStats {
    /// Rounds solved and written back.
    pub rounds: usize,
    /// Rounds that ended in a numerical failure.
    pub failures: usize,
    pub consecutive_failures: usize,
    /// Rounds dropped because of a concurrent `clear`.
    pub discarded: usize,
    pub last_round: Option<RoundSummary>,
}

struct Shared<M: LensModel> {
    state: Mutex<CalibrationState<M>>,
    config: CalibratorConfig,
    should_run: AtomicBool,
    stats: Mutex<SolveStats>,
}

impl<M: LensModel> Shared<M> {
    fn is_running(&self) -> bool {
        self.should_run.load(Ordering::SeqCst)
    }

    /// Snapshot, solve unlocked, write back.
    fn round(&self) -> Result<RoundOutcome, CalibrationError> {
        let snapshot = {
            let state = self.state.lock();
            Snapshot::build(&state)
        };
        let Some(snapshot) = snapshot else {
            return Ok(RoundOutcome::Idle);
        };

        let solved = snapshot.solve(&self.config.solver).and_then(|round| {
            let mut state = self.state.lock();
            write_back(&mut state, &round).map(|applied| (applied, round.summary))
        });

        let mut stats = self.stats.lock();
        match solved {
            Ok((true, summary)) => {
                info!("{summary:?}");
                stats.rounds += 1;
                stats.consecutive_failures = 0;
                stats.last_round = Some(summary.clone());
                Ok(RoundOutcome::Applied(summary))
            }
            Ok((false, _)) => {
                info!("Engine was cleared during the round, result discarded");
                stats.discarded += 1;
                Ok(RoundOutcome::Discarded)
            }
            Err(e) => {
                warn!("Calibration round failed: {e}");
                stats.failures += 1;
                stats.consecutive_failures += 1;
                Err(e)
            }
        }
    }

    /// Sleep for `duration` or until the run flag is cleared.
    fn sleep_while_running(&self, duration: Duration) {
        let deadline = Instant::now() + duration;
        while self.is_running() {
            let now = Instant::now();
            if now >= deadline {
                break;
            }
            thread::sleep((deadline - now).min(SLEEP_SLICE));
        }
    }

    fn solve_loop(&self) {
        info!("Calibration loop started");
        while self.is_running() {
            match self.round() {
                Ok(RoundOutcome::Applied(_)) => {}
                Ok(RoundOutcome::Idle) | Ok(RoundOutcome::Discarded) => {
                    self.sleep_while_running(self.config.idle_interval());
                }
                Err(e) => {
                    let failures = self.stats.lock().consecutive_failures;
                    if self.config.retry.exhausted(failures) {
                        error!("Giving up after {failures} consecutive failed rounds, last: {e}");
                        self.should_run.store(false, Ordering::SeqCst);
                        break;
                    }
                    self.sleep_while_running(self.config.retry.backoff());
                }
            }
        }
        info!("Calibration loop stopped");
    }
}

/// Incremental calibration engine for a rig whose cameras share lens model `M`.
///
/// All methods take `&self`; the engine can be shared between threads.
pub struct Calibrator<M: LensModel> {
    shared: Arc<Shared<M>>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl<M: LensModel> Default for Calibrator<M> {
    fn default() -> Self {
        Self::new()
    }
}

impl<M: LensModel> Calibrator<M> {
    pub fn new() -> Self {
        Self::with_config(CalibratorConfig::default())
    }

    pub fn with_config(config: CalibratorConfig) -> Self {
        Calibrator {
            shared: Arc::new(Shared {
                state: Mutex::new(CalibrationState::default()),
                config,
                should_run: AtomicBool::new(false),
                stats: Mutex::new(SolveStats::default()),
            }),
            worker: Mutex::new(None),
        }
    }

    pub fn config(&self) -> &CalibratorConfig {
        &self.shared.config
    }

    /// Add a camera from its intrinsic parameters and keyframe-to-camera
    /// extrinsic. Returns the camera id.
    ///
    /// # Errors
    ///
    /// [`CalibrationError::IntrinsicsDimension`] if `intrinsics` does not
    /// have `M::NUM_PARAMS` entries, [`CalibrationError::Camera`] if the
    /// values are invalid for the model.
    pub fn add_camera(
        &self,
        intrinsics: &[f64],
        extrinsic: Pose,
    ) -> Result<usize, CalibrationError> {
        if intrinsics.len() != M::NUM_PARAMS {
            return Err(CalibrationError::IntrinsicsDimension {
                expected: M::NUM_PARAMS,
                actual: intrinsics.len(),
            });
        }
        let camera = CameraModel::<M>::new(intrinsics)?;
        Ok(self.add_camera_model(camera, extrinsic))
    }

    /// Add an already constructed camera. Returns the camera id.
    pub fn add_camera_model(&self, camera: CameraModel<M>, extrinsic: Pose) -> usize {
        let id = self.shared.state.lock().add_camera(camera, extrinsic);
        debug!("Added camera {id}");
        id
    }

    /// Add a keyframe with its world-to-keyframe pose. Returns the frame id.
    pub fn add_frame(&self, t_kw: Pose) -> usize {
        let id = self.shared.state.lock().add_frame(t_kw);
        debug!("Added frame {id}");
        id
    }

    /// Add an observation of world `point` at `pixel` by `camera` in `frame`.
    ///
    /// # Errors
    ///
    /// [`CalibrationError::UnknownFrame`] or [`CalibrationError::UnknownCamera`]
    /// if an id does not exist; nothing is added in that case.
    pub fn add_observation(
        &self,
        frame: usize,
        camera: usize,
        point: Vector3<f64>,
        pixel: Vector2<f64>,
    ) -> Result<(), CalibrationError> {
        self.shared.state.lock().add_term(CostTerm {
            frame,
            camera,
            point,
            pixel,
        })
    }

    /// Start the background solve loop.
    ///
    /// # Errors
    ///
    /// `ConcurrencyMisuse(AlreadyRunning)` if the loop is running,
    /// [`CalibrationError::Spawn`] if the thread could not be created.
    pub fn start(&self) -> Result<(), CalibrationError> {
        let mut worker = self.worker.lock();
        if self.shared.should_run.swap(true, Ordering::SeqCst) {
            warn!("Calibration loop is already running");
            return Err(CalibrationError::ConcurrencyMisuse(Misuse::AlreadyRunning));
        }

        // A loop that gave up on its own leaves a finished handle behind
        if let Some(handle) = worker.take() {
            join_worker(handle);
        }
        // Every loop starts with a fresh retry budget
        self.shared.stats.lock().consecutive_failures = 0;

        let shared = Arc::clone(&self.shared);
        let spawned = thread::Builder::new()
            .name(WORKER_NAME.to_string())
            .spawn(move || shared.solve_loop());
        match spawned {
            Ok(handle) => {
                *worker = Some(handle);
                Ok(())
            }
            Err(e) => {
                self.shared.should_run.store(false, Ordering::SeqCst);
                error!("Failed to spawn {WORKER_NAME}: {e}");
                Err(CalibrationError::Spawn(e))
            }
        }
    }

    /// Ask the loop to finish its current round and wait for it.
    ///
    /// # Errors
    ///
    /// `ConcurrencyMisuse(NotRunning)` if no loop is running.
    pub fn stop(&self) -> Result<(), CalibrationError> {
        let mut worker = self.worker.lock();
        if !self.shared.should_run.swap(false, Ordering::SeqCst) {
            warn!("Calibration loop is not running");
            return Err(CalibrationError::ConcurrencyMisuse(Misuse::NotRunning));
        }
        if let Some(handle) = worker.take() {
            join_worker(handle);
        }
        Ok(())
    }

    pub fn is_running(&self) -> bool {
        self.shared.is_running()
    }

    /// Run one round on the calling thread.
    ///
    /// Uses the same code path as the background loop; unlike the loop, a
    /// numerical failure is returned to the caller (it is still counted in
    /// [`Calibrator::stats`]). `start` and `stop` wait for the round.
    ///
    /// # Errors
    ///
    /// `ConcurrencyMisuse(AlreadyRunning)` while the background loop runs.
    pub fn solve_once(&self) -> Result<RoundOutcome, CalibrationError> {
        let _worker = self.worker.lock();
        if self.shared.is_running() {
            warn!("solve_once called while the calibration loop is running");
            return Err(CalibrationError::ConcurrencyMisuse(Misuse::AlreadyRunning));
        }
        self.shared.round()
    }

    pub fn stats(&self) -> SolveStats {
        self.shared.stats.lock().clone()
    }

    pub fn frame(&self, id: usize) -> Option<Frame> {
        self.shared.state.lock().frames.get(id).cloned()
    }

    pub fn camera(&self, id: usize) -> Option<CameraPose<M>> {
        self.shared.state.lock().cameras.get(id).cloned()
    }

    pub fn num_frames(&self) -> usize {
        self.shared.state.lock().frames.len()
    }

    pub fn num_cameras(&self) -> usize {
        self.shared.state.lock().cameras.len()
    }

    pub fn num_observations(&self) -> usize {
        self.shared.state.lock().terms.len()
    }

    /// Drop every frame, camera and observation.
    ///
    /// A round in flight finishes but its result is discarded.
    pub fn clear(&self) {
        self.shared.state.lock().clear();
        info!("Calibration state cleared");
    }

    /// Current estimate as a rig with camera poses expressed in the keyframe.
    pub fn to_rig(&self) -> Rig {
        let state = self.shared.state.lock();
        let mut rig = Rig::new();
        for camera in &state.cameras {
            rig.add_camera_model(camera.camera.clone(), camera.t_ck.inverse());
        }
        rig
    }
}

fn join_worker(handle: JoinHandle<()>) {
    if handle.join().is_err() {
        error!("{WORKER_NAME} thread panicked");
    }
}

impl<M: LensModel> Drop for Calibrator<M> {
    fn drop(&mut self) {
        if self.shared.should_run.swap(false, Ordering::SeqCst) {
            info!("Stopping calibration loop");
        }
        if let Some(handle) = self.worker.get_mut().take() {
            join_worker(handle);
        }

        let state = self.shared.state.lock();
        for camera in &state.cameras {
            info!(
                "Camera {} {}",
                camera.id,
                format_camera_parameters(&camera.camera)
            );
        }
    }
}

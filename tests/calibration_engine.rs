use approx::assert_relative_eq;
use nalgebra::{Isometry3, Point3, Translation3, UnitQuaternion, Vector2, Vector3};
use rig_calib::{
    CalibrationError, Calibrator, CalibratorConfig, CameraInterface, CameraModel, Misuse, Pinhole,
    Pose, RetryPolicy, RoundOutcome,
};
use std::thread;
use std::time::{Duration, Instant};

fn init_logger() {
    let _ = env_logger::builder().is_test(true).try_init();
}

/// Ground truth of a two-camera rig observing a non-planar target.
struct SyntheticRig {
    intrinsics: Vec<[f64; 4]>,
    extrinsics: Vec<Pose>,
    frames: Vec<Pose>,
    points: Vec<Vector3<f64>>,
}

impl SyntheticRig {
    fn new() -> Self {
        let mut points = Vec::new();
        for x in [-0.6, -0.3, 0.0, 0.3, 0.6] {
            for y in [-0.6, -0.3, 0.0, 0.3, 0.6] {
                for z in [-0.3, 0.0, 0.3] {
                    points.push(Vector3::new(x, y, z));
                }
            }
        }

        SyntheticRig {
            intrinsics: vec![[500.0, 505.0, 320.0, 240.0], [480.0, 482.0, 330.0, 235.0]],
            extrinsics: vec![
                Pose::identity(),
                Isometry3::from_parts(
                    Translation3::new(-0.25, 0.01, 0.02),
                    UnitQuaternion::from_euler_angles(0.01, 0.06, -0.02),
                ),
            ],
            frames: vec![
                Isometry3::from_parts(
                    Translation3::new(0.1, -0.05, 3.0),
                    UnitQuaternion::from_euler_angles(0.05, -0.1, 0.02),
                ),
                Isometry3::from_parts(
                    Translation3::new(-0.2, 0.1, 3.3),
                    UnitQuaternion::from_euler_angles(-0.08, 0.05, 0.1),
                ),
                Isometry3::from_parts(
                    Translation3::new(0.05, 0.15, 2.8),
                    UnitQuaternion::from_euler_angles(0.1, 0.12, -0.05),
                ),
            ],
            points,
        }
    }

    fn pixel(&self, frame: usize, camera: usize, point: &Vector3<f64>) -> Vector2<f64> {
        let model = CameraModel::<Pinhole>::new(&self.intrinsics[camera]).unwrap();
        let p_c = self.extrinsics[camera] * self.frames[frame] * Point3::from(*point);
        model.project(&p_c.coords)
    }

    /// Engine seeded with perturbed estimates of everything but camera 0's extrinsic.
    fn perturbed_calibrator(&self, config: CalibratorConfig) -> Calibrator<Pinhole> {
        let calibrator = Calibrator::with_config(config);
        self.seed(&calibrator);
        calibrator
    }

    fn seed(&self, calibrator: &Calibrator<Pinhole>) {
        let intrinsic_offsets = [[4.0, -3.0, 2.0, -2.5], [-5.0, 4.0, -3.0, 2.0]];
        for (camera, offset) in intrinsic_offsets.iter().enumerate() {
            let guess: Vec<f64> = self.intrinsics[camera]
                .iter()
                .zip(offset)
                .map(|(v, d)| v + d)
                .collect();
            let extrinsic = if camera == 0 {
                self.extrinsics[0]
            } else {
                perturb(&self.extrinsics[camera], 0.02, 0.01)
            };
            calibrator.add_camera(&guess, extrinsic).unwrap();
        }
        for frame in &self.frames {
            calibrator.add_frame(perturb(frame, 0.04, 0.015));
        }
    }

    fn add_all_observations(&self, calibrator: &Calibrator<Pinhole>, frames: &[usize]) {
        for &frame in frames {
            for camera in 0..self.intrinsics.len() {
                for point in &self.points {
                    calibrator
                        .add_observation(frame, camera, *point, self.pixel(frame, camera, point))
                        .unwrap();
                }
            }
        }
    }
}

fn perturb(pose: &Pose, translation: f64, angle: f64) -> Pose {
    let delta = Isometry3::from_parts(
        Translation3::new(translation, -translation, translation * 0.5),
        UnitQuaternion::from_euler_angles(angle, -angle, angle * 0.5),
    );
    delta * pose
}

/// Config whose rounds retry quickly after a failure.
fn fast_retry_config(max_consecutive_failures: Option<usize>) -> CalibratorConfig {
    CalibratorConfig {
        idle_interval_ms: 5,
        retry: RetryPolicy {
            max_consecutive_failures,
            backoff_ms: 1,
        },
        ..Default::default()
    }
}

fn add_non_finite_observation(calibrator: &Calibrator<Pinhole>) {
    calibrator
        .add_observation(
            0,
            0,
            Vector3::new(0.1, 0.2, 0.0),
            Vector2::new(f64::NAN, 240.0),
        )
        .unwrap();
}

fn wait_until(timeout: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        thread::sleep(Duration::from_millis(10));
    }
    condition()
}

#[test]
fn test_end_to_end_recovers_rig() {
    init_logger();
    let truth = SyntheticRig::new();
    let calibrator = truth.perturbed_calibrator(CalibratorConfig::default());
    truth.add_all_observations(&calibrator, &[0, 1, 2]);
    assert_eq!(calibrator.num_observations(), 3 * 2 * truth.points.len());

    let anchor_before = calibrator.camera(0).unwrap().t_ck;

    let mut last_mse = f64::INFINITY;
    for _ in 0..8 {
        match calibrator.solve_once().unwrap() {
            RoundOutcome::Applied(summary) => {
                assert_eq!(summary.num_residuals, 2 * calibrator.num_observations());
                last_mse = summary.mse;
            }
            other => panic!("unexpected round outcome {other:?}"),
        }
        if last_mse < 1e-12 {
            break;
        }
    }
    assert!(last_mse < 1e-6, "mse {last_mse}");

    // Gauge anchor is bit-identical
    let anchor_after = calibrator.camera(0).unwrap().t_ck;
    assert_eq!(anchor_before, anchor_after);

    for (id, expected) in truth.intrinsics.iter().enumerate() {
        let camera = calibrator.camera(id).unwrap();
        for (value, truth) in camera.camera.params().iter().zip(expected) {
            assert_relative_eq!(*value, *truth, epsilon = 1e-3);
        }
    }
    assert_relative_eq!(
        calibrator.camera(1).unwrap().t_ck,
        truth.extrinsics[1],
        epsilon = 1e-5
    );
    for (id, expected) in truth.frames.iter().enumerate() {
        assert_relative_eq!(calibrator.frame(id).unwrap().t_kw, *expected, epsilon = 1e-5);
    }

    let stats = calibrator.stats();
    assert!(stats.rounds >= 1);
    assert_eq!(stats.failures, 0);
    assert!(stats.last_round.is_some());
}

#[test]
fn test_solve_rounds_keep_anchor_bit_identical() {
    init_logger();
    let truth = SyntheticRig::new();
    let calibrator = truth.perturbed_calibrator(CalibratorConfig::default());
    truth.add_all_observations(&calibrator, &[0]);

    let anchor = calibrator.camera(0).unwrap().t_ck;
    let q = anchor.rotation.quaternion().coords;
    for _ in 0..3 {
        calibrator.solve_once().unwrap();
        let after = calibrator.camera(0).unwrap().t_ck;
        assert_eq!(
            after.translation.vector.map(f64::to_bits),
            anchor.translation.vector.map(f64::to_bits)
        );
        assert_eq!(
            after.rotation.quaternion().coords.map(f64::to_bits),
            q.map(f64::to_bits)
        );
    }
}

#[test]
fn test_idle_round_changes_nothing() {
    init_logger();
    let truth = SyntheticRig::new();
    let calibrator = truth.perturbed_calibrator(CalibratorConfig::default());
    let frames: Vec<_> = (0..3).map(|i| calibrator.frame(i).unwrap()).collect();
    let cameras: Vec<_> = (0..2).map(|i| calibrator.camera(i).unwrap()).collect();

    assert_eq!(calibrator.solve_once().unwrap(), RoundOutcome::Idle);

    for (i, frame) in frames.iter().enumerate() {
        assert_eq!(&calibrator.frame(i).unwrap(), frame);
    }
    for (i, camera) in cameras.iter().enumerate() {
        assert_eq!(&calibrator.camera(i).unwrap(), camera);
    }
    assert_eq!(calibrator.stats().rounds, 0);
}

#[test]
fn test_background_loop_lifecycle() {
    init_logger();
    let truth = SyntheticRig::new();
    let config = CalibratorConfig {
        idle_interval_ms: 5,
        ..Default::default()
    };
    let calibrator = truth.perturbed_calibrator(config);

    calibrator.start().unwrap();
    assert!(matches!(
        calibrator.start(),
        Err(CalibrationError::ConcurrencyMisuse(Misuse::AlreadyRunning))
    ));

    // Observations arrive while the loop is already running
    truth.add_all_observations(&calibrator, &[0, 1]);
    let total = calibrator.num_observations();
    assert!(wait_until(Duration::from_secs(60), || {
        calibrator
            .stats()
            .last_round
            .is_some_and(|round| round.num_observations == total)
    }));

    calibrator.stop().unwrap();
    assert!(!calibrator.is_running());
    let rounds_after_stop = calibrator.stats().rounds;
    thread::sleep(Duration::from_millis(50));
    assert_eq!(calibrator.stats().rounds, rounds_after_stop);

    // Resume and feed the last frame
    calibrator.start().unwrap();
    truth.add_all_observations(&calibrator, &[2]);
    let total = calibrator.num_observations();
    assert!(wait_until(Duration::from_secs(60), || {
        calibrator
            .stats()
            .last_round
            .is_some_and(|round| round.num_observations == total)
    }));
    calibrator.stop().unwrap();

    assert!(matches!(
        calibrator.stop(),
        Err(CalibrationError::ConcurrencyMisuse(Misuse::NotRunning))
    ));
    assert_eq!(calibrator.stats().failures, 0);
}

#[test]
fn test_drop_stops_running_loop() {
    init_logger();
    let calibrator = Calibrator::<Pinhole>::new();
    calibrator
        .add_camera(&[500.0, 500.0, 320.0, 240.0], Pose::identity())
        .unwrap();
    calibrator.start().unwrap();
    assert!(calibrator.is_running());
    drop(calibrator);
}

#[test]
fn test_clear_while_running() {
    init_logger();
    let truth = SyntheticRig::new();
    let calibrator = truth.perturbed_calibrator(CalibratorConfig {
        idle_interval_ms: 5,
        ..Default::default()
    });
    truth.add_all_observations(&calibrator, &[0]);
    calibrator.start().unwrap();
    calibrator.clear();
    assert_eq!(calibrator.num_observations(), 0);

    // The loop keeps running on an empty problem
    thread::sleep(Duration::from_millis(30));
    assert!(calibrator.is_running());
    assert_eq!(calibrator.num_frames(), 0);
    calibrator.stop().unwrap();
}

#[test]
fn test_failed_rounds_are_contained_by_loop() {
    init_logger();
    let truth = SyntheticRig::new();
    let calibrator = truth.perturbed_calibrator(fast_retry_config(None));
    truth.add_all_observations(&calibrator, &[0]);
    add_non_finite_observation(&calibrator);
    let before = calibrator.frame(0).unwrap();

    calibrator.start().unwrap();
    assert!(wait_until(Duration::from_secs(30), || {
        calibrator.stats().failures >= 3
    }));
    assert!(calibrator.is_running());

    // Structural calls keep working while rounds fail
    let frame = calibrator.add_frame(Pose::identity());
    calibrator
        .add_observation(frame, 1, Vector3::zeros(), Vector2::new(330.0, 235.0))
        .unwrap();
    assert_eq!(calibrator.num_frames(), 4);

    calibrator.stop().unwrap();
    assert!(!calibrator.is_running());

    let stats = calibrator.stats();
    assert_eq!(stats.rounds, 0);
    assert!(stats.last_round.is_none());
    assert_eq!(stats.consecutive_failures, stats.failures);
    // A failed round leaves the estimates untouched
    assert_eq!(calibrator.frame(0).unwrap(), before);
}

#[test]
fn test_solve_once_reports_numerical_failure() {
    init_logger();
    let truth = SyntheticRig::new();
    let calibrator = truth.perturbed_calibrator(CalibratorConfig::default());
    add_non_finite_observation(&calibrator);

    assert!(matches!(
        calibrator.solve_once(),
        Err(CalibrationError::NumericalFailure(_))
    ));
    let stats = calibrator.stats();
    assert_eq!(stats.failures, 1);
    assert_eq!(stats.rounds, 0);
}

#[test]
fn test_restart_after_retry_policy_gives_up() {
    init_logger();
    let truth = SyntheticRig::new();
    let calibrator = truth.perturbed_calibrator(fast_retry_config(Some(2)));
    truth.add_all_observations(&calibrator, &[0]);
    add_non_finite_observation(&calibrator);

    calibrator.start().unwrap();
    assert!(wait_until(Duration::from_secs(30), || !calibrator.is_running()));
    assert_eq!(calibrator.stats().failures, 2);
    assert!(matches!(
        calibrator.stop(),
        Err(CalibrationError::ConcurrencyMisuse(Misuse::NotRunning))
    ));

    // A restarted loop gets the whole budget again
    calibrator.start().unwrap();
    assert!(wait_until(Duration::from_secs(30), || !calibrator.is_running()));
    let stats = calibrator.stats();
    assert_eq!(stats.failures, 4);
    assert_eq!(stats.consecutive_failures, 2);

    // With the bad observation gone the next start resumes solving
    calibrator.clear();
    truth.seed(&calibrator);
    truth.add_all_observations(&calibrator, &[0, 1, 2]);
    calibrator.start().unwrap();
    assert!(wait_until(Duration::from_secs(60), || {
        calibrator.stats().rounds >= 1
    }));
    calibrator.stop().unwrap();

    let stats = calibrator.stats();
    assert_eq!(stats.failures, 4);
    assert_eq!(stats.consecutive_failures, 0);
    assert!(stats.last_round.is_some());
}

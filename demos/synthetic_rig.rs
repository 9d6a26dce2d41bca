//! Synthetic Rig Calibration Example
//!
//! This example simulates a rig of pinhole cameras observing a non-planar
//! target. A producer thread feeds frames and observations into a running
//! calibration engine while the background loop keeps re-solving. Once the
//! producer is done and enough rounds have run, the loop is stopped and the
//! recovered rig is printed next to the ground truth.
//!
//! Usage:
//! ```bash
//! cargo run --example synthetic_rig -- --cameras 3 --frames 6 --rounds 10
//! ```

use clap::Parser;
use flexi_logger::{colored_detailed_format, detailed_format, Duplicate, FileSpec, Logger};
use log::info;
use nalgebra::{Isometry3, Point3, Translation3, UnitQuaternion, Vector3};
use rig_calib::util::format_camera_parameters;
use rig_calib::{CalibratorConfig, Calibrator, CameraInterface, CameraModel, Pinhole, Pose};
use std::path::PathBuf;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

/// Continuous rig calibration on synthetic data
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Number of cameras in the rig
    #[arg(short = 'c', long, default_value = "2")]
    cameras: usize,

    /// Number of frames fed by the producer
    #[arg(short = 'f', long, default_value = "5")]
    frames: usize,

    /// Solve rounds to wait for after the last frame
    #[arg(short = 'r', long, default_value = "5")]
    rounds: usize,

    /// Optional calibrator configuration (YAML)
    #[arg(short = 'p', long)]
    config: Option<PathBuf>,
}

fn target_points() -> Vec<Vector3<f64>> {
    let mut points = Vec::new();
    for i in 0..6 {
        for j in 0..6 {
            let x = -0.5 + 0.2 * i as f64;
            let y = -0.5 + 0.2 * j as f64;
            // Alternate depth so the target is not planar
            let z = if (i + j) % 2 == 0 { 0.0 } else { 0.25 };
            points.push(Vector3::new(x, y, z));
        }
    }
    points
}

fn true_intrinsics(camera: usize) -> [f64; 4] {
    let c = camera as f64;
    [480.0 + 10.0 * c, 482.0 + 8.0 * c, 320.0 + 2.0 * c, 240.0 - 3.0 * c]
}

fn true_extrinsic(camera: usize) -> Pose {
    if camera == 0 {
        return Pose::identity();
    }
    let c = camera as f64;
    Isometry3::from_parts(
        Translation3::new(-0.2 * c, 0.01 * c, 0.0),
        UnitQuaternion::from_euler_angles(0.0, 0.04 * c, 0.01 * c),
    )
}

fn true_frame(frame: usize) -> Pose {
    let f = frame as f64;
    Isometry3::from_parts(
        Translation3::new(0.1 * (f * 0.7).sin(), 0.1 * (f * 1.3).cos(), 3.0 + 0.1 * f),
        UnitQuaternion::from_euler_angles(0.05 * (f * 0.9).sin(), 0.08 * (f * 0.5).cos(), 0.02 * f),
    )
}

fn perturb(pose: &Pose, amount: f64) -> Pose {
    Isometry3::from_parts(
        Translation3::new(amount, -amount, amount),
        UnitQuaternion::from_euler_angles(amount * 0.3, amount * 0.2, -amount * 0.3),
    ) * pose
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize logger with info level filter
    Logger::try_with_str("info")?
        .log_to_file(
            FileSpec::default()
                .directory("logs")
                .suppress_timestamp()
                .suffix("log"),
        )
        .duplicate_to_stdout(Duplicate::All)
        .format_for_files(detailed_format)
        .format_for_stdout(colored_detailed_format)
        .set_palette("196;208;76;39;178".to_string())
        .start()?;

    let cli = Cli::parse();
    if cli.cameras == 0 {
        return Err("the rig needs at least one camera".into());
    }

    let config = match &cli.config {
        Some(path) => {
            let path = path.to_str().ok_or("Invalid config path string")?;
            CalibratorConfig::load_from_yaml(path)?
        }
        None => CalibratorConfig::default(),
    };

    println!("🎯 CONTINUOUS RIG CALIBRATION");
    println!("==============================");
    println!(
        "cameras: {}, frames: {}, rounds: {}\n",
        cli.cameras, cli.frames, cli.rounds
    );

    let calibrator = Arc::new(Calibrator::<Pinhole>::with_config(config));
    for camera in 0..cli.cameras {
        let guess: Vec<f64> = true_intrinsics(camera).iter().map(|v| v * 1.01).collect();
        let extrinsic = if camera == 0 {
            true_extrinsic(0)
        } else {
            perturb(&true_extrinsic(camera), 0.02)
        };
        calibrator.add_camera(&guess, extrinsic)?;
    }

    calibrator.start()?;

    let producer = {
        let calibrator = Arc::clone(&calibrator);
        let num_cameras = cli.cameras;
        let num_frames = cli.frames;
        thread::Builder::new()
            .name("producer".to_string())
            .spawn(move || -> Result<(), rig_calib::CalibrationError> {
                let points = target_points();
                let cameras: Vec<CameraModel<Pinhole>> = (0..num_cameras)
                    .map(|c| CameraModel::new(&true_intrinsics(c)))
                    .collect::<Result<_, _>>()?;

                for f in 0..num_frames {
                    let truth = true_frame(f);
                    let frame = calibrator.add_frame(perturb(&truth, 0.03));
                    for (c, camera) in cameras.iter().enumerate() {
                        let t_ck = true_extrinsic(c);
                        for point in &points {
                            let p_c = t_ck * truth * Point3::from(*point);
                            let pixel = camera.project(&p_c.coords);
                            calibrator.add_observation(frame, c, *point, pixel)?;
                        }
                    }
                    info!("Producer added frame {frame}");
                    thread::sleep(Duration::from_millis(50));
                }
                Ok(())
            })?
    };

    producer
        .join()
        .map_err(|_| "producer thread panicked")??;

    let start = Instant::now();
    let target_rounds = calibrator.stats().rounds + cli.rounds;
    while calibrator.stats().rounds < target_rounds && start.elapsed() < Duration::from_secs(60) {
        thread::sleep(Duration::from_millis(20));
    }
    calibrator.stop()?;

    let stats = calibrator.stats();
    println!("\n📊 Rounds: {}, failures: {}", stats.rounds, stats.failures);
    if let Some(round) = &stats.last_round {
        println!("{round:?}");
    }

    let rig = calibrator.to_rig();
    for (i, (camera, pose)) in rig.iter().enumerate() {
        println!("\nCamera {i}");
        println!("  estimated: {}", format_camera_parameters(camera));
        println!(
            "  truth:     {}",
            format_camera_parameters(&CameraModel::<Pinhole>::new(&true_intrinsics(i))?)
        );
        println!("  T_kc translation: {:?}", pose.translation.vector.as_slice());
        println!(
            "  truth translation: {:?}",
            true_extrinsic(i).inverse().translation.vector.as_slice()
        );
    }

    Ok(())
}

use argh::FromArgs;
use std::path::{Path, PathBuf};
use std::process::ExitCode;

use glam::{DVec2, DVec3};
use kornia_sfm::camera::{CameraPose, PinholeCamera};
use kornia_sfm::config::{ExportConfig, SfmConfig};
use kornia_sfm::features::{Descriptors, Features, View};
use kornia_sfm::io::{write_ply, write_poses_json};
use kornia_sfm::linalg::exp_so3;
use kornia_sfm::pipeline::{Pipeline, ReconstructionStatus, SfmReport};
use rand::seq::SliceRandom;
use rand::{rngs::StdRng, Rng, SeedableRng};

#[derive(FromArgs)]
/// Reconstruct a synthetic cube seen from cameras on an arc
struct Args {
    /// number of cameras
    #[argh(option, short = 'n', default = "5")]
    num_cameras: usize,

    /// number of points on the cube surface
    #[argh(option, short = 'p', default = "200")]
    num_points: usize,

    /// keypoint noise amplitude in pixels
    #[argh(option, default = "0.5")]
    noise: f64,

    /// fraction of keypoints per image with a wrong descriptor
    #[argh(option, default = "0.02")]
    mismatch_ratio: f64,

    /// random seed
    #[argh(option, default = "0")]
    seed: u64,

    /// optional JSON configuration file
    #[argh(option, short = 'c')]
    config: Option<PathBuf>,

    /// output directory for the point cloud and poses
    #[argh(option, short = 'o', default = "PathBuf::from(\"sfm_output\")")]
    output: PathBuf,
}

fn render_cube(args: &Args) -> Result<Vec<View>, Box<dyn std::error::Error>> {
    let camera = PinholeCamera::new(500.0, 500.0, 320.0, 240.0, 640, 480);
    let center = DVec3::new(0.0, 0.0, 6.0);
    let mut rng = StdRng::seed_from_u64(args.seed);

    // points on the faces of a cube of side 2
    let points: Vec<DVec3> = (0..args.num_points)
        .map(|_| {
            let (u, v): (f64, f64) = (rng.random_range(-1.0..1.0), rng.random_range(-1.0..1.0));
            let sign = if rng.random_bool(0.5) { 1.0 } else { -1.0 };
            let local = match rng.random_range(0..3) {
                0 => DVec3::new(sign, u, v),
                1 => DVec3::new(u, sign, v),
                _ => DVec3::new(u, v, sign),
            };
            center + local
        })
        .collect();
    let signatures: Vec<[f32; 16]> = (0..args.num_points).map(|_| rng.random()).collect();

    let half = (args.num_cameras as f64 - 1.0) / 2.0;
    let mut views = Vec::with_capacity(args.num_cameras);
    for i in 0..args.num_cameras {
        let theta = (i as f64 - half) * 10f64.to_radians();
        let r = exp_so3(DVec3::new(0.0, theta, 0.0));
        let eye = center + DVec3::new(theta.sin(), 0.0, -theta.cos()) * 6.0;
        let pose = CameraPose::new(r, -(r * eye));

        let mut order: Vec<usize> = (0..args.num_points).collect();
        order.shuffle(&mut rng);
        let mut signature_of = order.clone();
        let swaps = (args.mismatch_ratio * args.num_points as f64).round() as usize;
        for _ in 0..swaps {
            let a = rng.random_range(0..order.len());
            let b = rng.random_range(0..order.len());
            signature_of.swap(a, b);
        }

        let mut keypoints = Vec::with_capacity(order.len());
        for &p in &order {
            let noise = DVec2::new(
                rng.random_range(-args.noise..=args.noise),
                rng.random_range(-args.noise..=args.noise),
            );
            let uv = pose.project(&camera, points[p]).ok_or("point behind camera")?;
            keypoints.push(uv + noise);
        }
        let data = signature_of.iter().flat_map(|&p| signatures[p]).collect();
        let colors = signature_of
            .iter()
            .map(|&p| {
                let c = (points[p] - center + DVec3::ONE) * 127.5;
                [c.x as u8, c.y as u8, c.z as u8]
            })
            .collect();
        let features = Features {
            keypoints,
            descriptors: Descriptors::Float { dim: 16, data },
            colors: Some(colors),
        };
        views.push(View::new(format!("cube_{i:02}"), camera, features)?);
    }
    Ok(views)
}

fn export(
    report: &SfmReport,
    output: &Path,
    config: &ExportConfig,
) -> Result<(), Box<dyn std::error::Error>> {
    std::fs::create_dir_all(output)?;
    let cloud = match config.outlier_std_factor {
        Some(k) => report.point_cloud.without_distant_points(k),
        None => report.point_cloud.clone(),
    };
    write_ply(output.join("points.ply"), &cloud, config.ply_format)?;
    write_poses_json(output.join("poses.json"), &report.cameras)?;
    log::info!(
        "wrote {} points and {} poses to {}",
        cloud.len(),
        report.cameras.len(),
        output.display()
    );
    Ok(())
}

fn run(args: &Args) -> Result<ReconstructionStatus, Box<dyn std::error::Error>> {
    let config = match &args.config {
        Some(path) => SfmConfig::from_json_file(path)?,
        None => SfmConfig::default(),
    };
    let views = render_cube(args)?;
    let report = Pipeline::new(config.pipeline.clone()).run(&views)?;

    for camera in &report.cameras {
        let c = camera.pose.center();
        log::info!(
            "{}: center ({:.3}, {:.3}, {:.3}), mean error {:.3} px, {} observations",
            camera.image_id,
            c.x,
            c.y,
            c.z,
            camera.mean_reprojection_error.unwrap_or(f64::NAN),
            camera.observations
        );
    }
    for skipped in &report.skipped {
        log::warn!("{} skipped: {}", skipped.image_id, skipped.reason);
    }
    export(&report, &args.output, &config.export)?;
    Ok(report.status)
}

fn main() -> ExitCode {
    env_logger::init();
    let args: Args = argh::from_env();
    match run(&args) {
        Ok(ReconstructionStatus::Complete) => ExitCode::SUCCESS,
        Ok(ReconstructionStatus::Partial) => ExitCode::from(2),
        Err(e) => {
            log::error!("reconstruction failed: {e}");
            ExitCode::from(1)
        }
    }
}

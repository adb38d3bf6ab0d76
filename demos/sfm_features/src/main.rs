use argh::FromArgs;
use std::path::PathBuf;
use std::process::ExitCode;

use kornia_sfm::config::SfmConfig;
use kornia_sfm::io::{read_intrinsics, read_views, write_ply, write_poses_json};
use kornia_sfm::pipeline::{Pipeline, ReconstructionStatus};

#[derive(FromArgs)]
/// Reconstruct a scene from per-image feature files and a K.txt calibration
struct Args {
    /// directory holding one JSON feature file per image
    #[argh(option, short = 'f')]
    features_dir: PathBuf,

    /// path to the 3x3 intrinsics file
    #[argh(option, short = 'k')]
    intrinsics: PathBuf,

    /// image width in pixels at calibration resolution
    #[argh(option)]
    width: usize,

    /// image height in pixels at calibration resolution
    #[argh(option)]
    height: usize,

    /// factor by which the images were downscaled before feature extraction
    #[argh(option, default = "1.0")]
    downscale: f64,

    /// optional JSON configuration file
    #[argh(option, short = 'c')]
    config: Option<PathBuf>,

    /// output directory for the point cloud and poses
    #[argh(option, short = 'o', default = "PathBuf::from(\"sfm_output\")")]
    output: PathBuf,
}

fn run(args: &Args) -> Result<ReconstructionStatus, Box<dyn std::error::Error>> {
    let config = match &args.config {
        Some(path) => SfmConfig::from_json_file(path)?,
        None => SfmConfig::default(),
    };

    let mut camera = read_intrinsics(&args.intrinsics, args.width, args.height)?;
    if args.downscale > 1.0 {
        camera = camera.downscaled(args.downscale);
    }
    let views = read_views(&args.features_dir, &camera)?;
    log::info!("loaded {} views from {}", views.len(), args.features_dir.display());

    let report = Pipeline::new(config.pipeline.clone()).run(&views)?;
    for skipped in &report.skipped {
        log::warn!("{} skipped: {}", skipped.image_id, skipped.reason);
    }

    std::fs::create_dir_all(&args.output)?;
    let cloud = match config.export.outlier_std_factor {
        Some(k) => report.point_cloud.without_distant_points(k),
        None => report.point_cloud.clone(),
    };
    write_ply(args.output.join("points.ply"), &cloud, config.export.ply_format)?;
    write_poses_json(args.output.join("poses.json"), &report.cameras)?;
    log::info!(
        "{:?}: {} of {} cameras, {} points written to {}",
        report.status,
        report.cameras.len(),
        views.len(),
        cloud.len(),
        args.output.display()
    );
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

mod common;

use common::{centroid_and_spread, CubeScene, DescriptorFlavor, RenderOptions};
use glam::{DVec2, DVec3};
use kornia_sfm::camera::PinholeCamera;
use kornia_sfm::features::{Descriptors, Features, View};
use kornia_sfm::io::{read_poses_json, write_ply, write_poses_json, PlyFormat};
use kornia_sfm::pipeline::{
    Pipeline, PipelineParams, ReconstructionStatus, RegistrationMethod, SfmError, SfmReport,
};
use kornia_sfm::pose::{estimate_relative_pose, TwoViewConfig, TwoViewError};

fn assert_matches_ground_truth(scene: &CubeScene, report: &SfmReport) {
    // the bootstrap pair fixes the frame and the unit of length
    let (first, second) = (report.cameras[0].view, report.cameras[1].view);
    let (gt_points, gt_centers) = scene.normalized(first, second);
    let (gt_centroid, gt_spread) = centroid_and_spread(&gt_points);

    let cloud = report.point_cloud.without_distant_points(3.0);
    let points: Vec<DVec3> = cloud
        .points()
        .iter()
        .map(|p| DVec3::from_array(*p))
        .collect();
    let (centroid, spread) = centroid_and_spread(&points);

    let centroid_error = (centroid - gt_centroid).length() / gt_centroid.length();
    let scale_error = (spread / gt_spread - 1.0).abs();
    assert!(centroid_error < 0.05, "centroid error {centroid_error}");
    assert!(scale_error < 0.05, "scale error {scale_error}");

    for camera in &report.cameras {
        let offset = camera.pose.center() - gt_centers[camera.view];
        let error = offset.length() / gt_centroid.length();
        assert!(error < 0.05, "camera {} center error {error}", camera.view);
    }
}

#[test]
fn test_cube_reconstruction() -> Result<(), Box<dyn std::error::Error>> {
    let scene = CubeScene::new(5, 200, 7);
    let views = scene.render(&RenderOptions::default());

    let report = Pipeline::new(PipelineParams::default()).run(&views)?;
    assert_eq!(report.status, ReconstructionStatus::Complete);
    assert_eq!(report.cameras.len(), 5);
    assert!(report.skipped.is_empty());
    assert!(report.bundle.is_none());
    assert_eq!(report.cameras[0].view, 0);
    assert_eq!(report.cameras[1].view, 1);
    assert_eq!(report.cameras[0].method, RegistrationMethod::Bootstrap);
    assert!(report.cameras[2..]
        .iter()
        .all(|c| c.method != RegistrationMethod::Bootstrap));
    let num_points = report.point_cloud.len();
    assert!(num_points >= 150, "{num_points} points");

    assert_matches_ground_truth(&scene, &report);
    Ok(())
}

#[test]
fn test_cube_reconstruction_with_bundle_adjustment() -> Result<(), Box<dyn std::error::Error>> {
    let scene = CubeScene::new(5, 200, 11);
    let views = scene.render(&RenderOptions {
        seed: 5,
        ..Default::default()
    });

    let params = PipelineParams {
        run_final_bundle_adjustment: true,
        ..Default::default()
    };
    let report = Pipeline::new(params).run(&views)?;
    assert_eq!(report.status, ReconstructionStatus::Complete);

    let bundle = report.bundle.as_ref().ok_or("bundle adjustment did not run")?;
    assert!(bundle.final_cost <= bundle.initial_cost);
    assert!(bundle.final_rms < 1.0, "final rms {}", bundle.final_rms);
    for camera in &report.cameras {
        let error = camera.mean_reprojection_error.ok_or("camera without observations")?;
        assert!(error < 1.0, "view {} error {error}", camera.view);
    }

    assert_matches_ground_truth(&scene, &report);
    Ok(())
}

#[test]
fn test_cube_reconstruction_binary_descriptors() -> Result<(), Box<dyn std::error::Error>> {
    let scene = CubeScene::new(5, 200, 3);
    let views = scene.render(&RenderOptions {
        flavor: DescriptorFlavor::Binary,
        ..Default::default()
    });

    let report = Pipeline::new(PipelineParams::default()).run(&views)?;
    assert_eq!(report.status, ReconstructionStatus::Complete);
    assert_eq!(report.cameras.len(), 5);
    assert_matches_ground_truth(&scene, &report);
    Ok(())
}

#[test]
fn test_export_reconstruction() -> Result<(), Box<dyn std::error::Error>> {
    let scene = CubeScene::new(4, 150, 19);
    let views = scene.render(&RenderOptions::default());
    let report = Pipeline::new(PipelineParams::default()).run(&views)?;

    let dir = tempfile::tempdir()?;
    write_ply(dir.path().join("cloud.ply"), &report.point_cloud, PlyFormat::Ascii)?;
    write_poses_json(dir.path().join("poses.json"), &report.cameras)?;

    let text = std::fs::read_to_string(dir.path().join("cloud.ply"))?;
    assert!(text.contains(&format!("element vertex {}", report.point_cloud.len())));
    assert!(text.contains("property uchar red"));

    let poses = read_poses_json(dir.path().join("poses.json"))?;
    assert_eq!(poses.len(), report.cameras.len());
    assert_eq!(poses[0].image_id, "cube_00");
    Ok(())
}

fn sparse_views(count: usize) -> Result<Vec<View>, Box<dyn std::error::Error>> {
    let camera = PinholeCamera::new(500.0, 500.0, 320.0, 240.0, 640, 480);
    let scene = CubeScene::new(2, count, 1);
    (0..2)
        .map(|i| {
            let keypoints: Vec<DVec2> = scene
                .points
                .iter()
                .map(|p| scene.poses[i].project(&camera, *p).unwrap_or(DVec2::ZERO))
                .collect();
            let features = Features {
                descriptors: Descriptors::Float {
                    dim: 1,
                    data: (0..count).map(|k| k as f32 * 10.0).collect(),
                },
                keypoints,
                colors: None,
            };
            Ok(View::new(format!("sparse_{i}"), camera, features)?)
        })
        .collect()
}

#[test]
fn test_insufficient_correspondences() -> Result<(), Box<dyn std::error::Error>> {
    let views = sparse_views(7)?;

    let result = estimate_relative_pose(
        views[0].keypoints(),
        views[1].keypoints(),
        views[0].camera(),
        views[1].camera(),
        &TwoViewConfig::default(),
    );
    assert!(matches!(
        result,
        Err(TwoViewError::InsufficientInliers { .. })
    ));

    match Pipeline::new(PipelineParams::default()).run(&views) {
        Err(SfmError::Bootstrap {
            images,
            pairs_tried,
        }) => {
            assert_eq!(images, 2);
            assert_eq!(pairs_tried, 1);
        }
        other => panic!("expected a bootstrap failure, got {other:?}"),
    }
    Ok(())
}

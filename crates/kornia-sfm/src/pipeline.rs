//! The reconstruction controller.
//!
//! Images are processed in input order through three stages:
//!
//! 1. **Bootstrap**: the first pair of nearby images that can be related by a robust
//!    two-view estimate is registered, its first camera anchoring the world frame and the
//!    baseline fixing the scale to one. The pair's inlier matches seed the tracks.
//! 2. **Incremental registration**: every remaining image is localized against the
//!    existing tracks (PnP on track endpoint matches), falling back to a relative pose
//!    chained from a registered neighbour with recovered scale. Its matches with the
//!    registered images then extend and create tracks. Images that fail are retried after
//!    later images succeed.
//! 3. **Finalize**: optional bundle adjustment, then the report.

use crate::bundle::{bundle_adjust, BundleAdjusterParams, BundleAdjustmentReport};
use crate::camera::CameraPose;
use crate::chain::{PoseChainError, PoseChainParams, PoseChainer};
use crate::features::View;
use crate::matching::{match_pairs, match_views, Correspondence, MatchingError, MatchingParams};
use crate::pnp::{solve_pnp_ransac, LMRefineParams, PnPError, PnPRansacParams};
use crate::pointcloud::PointCloud;
use crate::pose::{
    essential_from_motion, estimate_relative_pose, fundamental_from_essential,
    symmetric_epipolar_distance, TwoViewConfig, TwoViewError,
};
use crate::reconstruction::{Reconstruction, ReconstructionError};
use crate::tracks::{
    add_correspondences, extend_tracks, match_track_endpoints, merge_duplicate_tracks,
    retriangulate_tracks, TrackParams, TrackStats,
};
use glam::DVec2;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Fatal pipeline errors.
#[derive(Debug, thiserror::Error)]
pub enum SfmError {
    /// No pair of images could be related, so there is nothing to reconstruct.
    #[error("bootstrap failed: no image pair could be related ({images} images, {pairs_tried} pairs tried)")]
    Bootstrap {
        /// Number of input images.
        images: usize,
        /// Number of candidate pairs attempted.
        pairs_tried: usize,
    },
}

/// Why one image could not be registered.
#[derive(Debug, thiserror::Error)]
pub enum RegistrationError {
    /// Descriptor matching failed.
    #[error(transparent)]
    Matching(#[from] MatchingError),
    /// Relative pose estimation failed.
    #[error(transparent)]
    TwoView(#[from] TwoViewError),
    /// Absolute pose estimation failed.
    #[error(transparent)]
    PnP(#[from] PnPError),
    /// Scale recovery or chaining failed.
    #[error(transparent)]
    Chain(#[from] PoseChainError),
    /// A reconstruction update was refused.
    #[error(transparent)]
    Reconstruction(#[from] ReconstructionError),
    /// The pair produced too few triangulated points.
    #[error("only {found} points triangulated, need {required}")]
    TooFewPoints {
        /// Points triangulated.
        found: usize,
        /// Points required.
        required: usize,
    },
    /// No registered image was available to relate to.
    #[error("no registered image to relate to")]
    NoReference,
}

/// Parameters of the whole pipeline.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineParams {
    /// Descriptor matching.
    pub matching: MatchingParams,
    /// Robust two-view estimation.
    pub two_view: TwoViewConfig,
    /// Robust absolute pose estimation.
    pub pnp: PnPRansacParams,
    /// Absolute pose refinement.
    pub pnp_refine: LMRefineParams,
    /// Scale recovery.
    pub chain: PoseChainParams,
    /// Track building.
    pub tracks: TrackParams,
    /// Bundle adjustment.
    pub bundle: BundleAdjusterParams,
    /// Bootstrap considers pairs `(i, j)` with `j - i <= bootstrap_window`.
    pub bootstrap_window: usize,
    /// Minimum number of track matches to attempt PnP before falling back to chaining.
    pub min_pnp_correspondences: usize,
    /// Run bundle adjustment after each newly registered image.
    pub refine_after_each_registration: bool,
    /// Run bundle adjustment once all images are processed.
    pub run_final_bundle_adjustment: bool,
}

impl Default for PipelineParams {
    fn default() -> Self {
        Self {
            matching: MatchingParams::default(),
            two_view: TwoViewConfig::default(),
            pnp: PnPRansacParams::default(),
            pnp_refine: LMRefineParams::default(),
            chain: PoseChainParams::default(),
            tracks: TrackParams::default(),
            bundle: BundleAdjusterParams::default(),
            bootstrap_window: 3,
            min_pnp_correspondences: 20,
            refine_after_each_registration: false,
            run_final_bundle_adjustment: false,
        }
    }
}

/// How a camera got its pose.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum RegistrationMethod {
    /// One of the two bootstrap images.
    Bootstrap,
    /// Absolute pose from matches to existing tracks.
    Pnp,
    /// Relative pose to a registered image, chained with recovered scale.
    RelativePose,
}

/// A registered camera in the final report.
#[derive(Clone, Debug, PartialEq)]
pub struct RegisteredCamera {
    /// Index of the input image.
    pub view: usize,
    /// Image identifier.
    pub image_id: String,
    /// Final world-to-camera pose.
    pub pose: CameraPose,
    /// How the camera was registered.
    pub method: RegistrationMethod,
    /// Mean reprojection error of the camera's observations right after registration.
    pub registration_error: Option<f64>,
    /// Mean reprojection error of the camera's observations in the final state.
    pub mean_reprojection_error: Option<f64>,
    /// Number of tracks observed by the camera in the final state.
    pub observations: usize,
}

/// An image that could not be registered.
#[derive(Clone, Debug, PartialEq)]
pub struct SkippedView {
    /// Index of the input image.
    pub view: usize,
    /// Image identifier.
    pub image_id: String,
    /// Last registration failure.
    pub reason: String,
}

/// Whether every image was registered.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ReconstructionStatus {
    /// All images registered.
    Complete,
    /// A subset of the images registered.
    Partial,
}

/// Outcome of a pipeline run.
#[derive(Clone, Debug)]
pub struct SfmReport {
    /// Complete or partial reconstruction.
    pub status: ReconstructionStatus,
    /// Registered cameras in registration order.
    pub cameras: Vec<RegisteredCamera>,
    /// One point per track.
    pub point_cloud: PointCloud,
    /// Images left unregistered.
    pub skipped: Vec<SkippedView>,
    /// Summary of the final bundle adjustment, when it ran and succeeded.
    pub bundle: Option<BundleAdjustmentReport>,
}

impl SfmReport {
    /// Pose of an input image, if it was registered.
    pub fn pose(&self, view: usize) -> Option<&CameraPose> {
        self.cameras
            .iter()
            .find(|c| c.view == view)
            .map(|c| &c.pose)
    }
}

/// Drives the reconstruction over a set of views.
#[derive(Clone, Debug)]
pub struct Pipeline {
    params: PipelineParams,
    chainer: PoseChainer,
}

struct Registered {
    method: RegistrationMethod,
    error: Option<f64>,
}

impl Pipeline {
    /// Create a pipeline with the given parameters.
    pub fn new(params: PipelineParams) -> Self {
        let chainer = PoseChainer::new(params.chain);
        Self { params, chainer }
    }

    /// The pipeline parameters.
    pub fn params(&self) -> &PipelineParams {
        &self.params
    }

    /// Reconstruct cameras and points from the views.
    ///
    /// Fails only when no pair of images can be related.
    pub fn run(&self, views: &[View]) -> Result<SfmReport, SfmError> {
        log::info!("bootstrap over {} images", views.len());
        let (mut rec, (first, second)) = self.bootstrap(views)?;
        let mut registered: BTreeMap<usize, Registered> = BTreeMap::new();
        for view in [first, second] {
            registered.insert(
                view,
                Registered {
                    method: RegistrationMethod::Bootstrap,
                    error: rec.mean_reprojection_error(view),
                },
            );
        }

        log::info!("incremental registration");
        let mut pending: Vec<usize> = (0..views.len())
            .filter(|v| !rec.is_registered(*v))
            .collect();
        let mut failures: BTreeMap<usize, RegistrationError> = BTreeMap::new();
        while !pending.is_empty() {
            let mut progressed = false;
            let mut remaining = Vec::new();
            for view in pending {
                match self.register_view(&mut rec, view) {
                    Ok(method) => {
                        let error = rec.mean_reprojection_error(view);
                        log::info!(
                            "registered view {view} ({}) by {method:?}: {} cameras, {} tracks, mean error {:.3} px",
                            views[view].id(),
                            rec.registered().len(),
                            rec.num_tracks(),
                            error.unwrap_or(f64::NAN)
                        );
                        failures.remove(&view);
                        registered.insert(view, Registered { method, error });
                        progressed = true;
                    }
                    Err(e) => {
                        log::info!("view {view} ({}) not registered: {e}", views[view].id());
                        failures.insert(view, e);
                        remaining.push(view);
                    }
                }
            }
            pending = remaining;
            if !progressed {
                break;
            }
        }

        log::info!("finalize");
        let bundle = if self.params.run_final_bundle_adjustment {
            match bundle_adjust(&mut rec, &self.params.bundle) {
                Ok(report) => Some(report),
                Err(e) => {
                    log::warn!("final bundle adjustment skipped: {e}");
                    None
                }
            }
        } else {
            None
        };

        let skipped: Vec<SkippedView> = failures
            .into_iter()
            .map(|(view, reason)| {
                log::warn!("skipped view {view} ({}): {reason}", views[view].id());
                SkippedView {
                    view,
                    image_id: views[view].id().to_string(),
                    reason: reason.to_string(),
                }
            })
            .collect();
        let cameras = rec
            .registered()
            .iter()
            .filter_map(|&view| {
                let info = registered.get(&view)?;
                Some(RegisteredCamera {
                    view,
                    image_id: views[view].id().to_string(),
                    pose: *rec.pose(view)?,
                    method: info.method,
                    registration_error: info.error,
                    mean_reprojection_error: rec.mean_reprojection_error(view),
                    observations: rec.observation_count(view),
                })
            })
            .collect();
        let status = if skipped.is_empty() {
            ReconstructionStatus::Complete
        } else {
            ReconstructionStatus::Partial
        };
        log::info!(
            "{status:?} reconstruction: {} of {} cameras, {} points",
            rec.registered().len(),
            views.len(),
            rec.num_tracks()
        );
        Ok(SfmReport {
            status,
            cameras,
            point_cloud: rec.point_cloud(),
            skipped,
            bundle,
        })
    }

    /// Find the first relatable image pair and seed a reconstruction from it.
    ///
    /// Returns the reconstruction and the registered pair.
    pub fn bootstrap<'a>(
        &self,
        views: &'a [View],
    ) -> Result<(Reconstruction<'a>, (usize, usize)), SfmError> {
        let n = views.len();
        let mut pairs_tried = 0;
        for i in 0..n {
            for j in (i + 1)..n.min(i + 1 + self.params.bootstrap_window.max(1)) {
                pairs_tried += 1;
                match self.initialize_pair(views, i, j) {
                    Ok(rec) => {
                        log::info!(
                            "bootstrapped from views {i} and {j} with {} tracks",
                            rec.num_tracks()
                        );
                        return Ok((rec, (i, j)));
                    }
                    Err(e) => log::info!("bootstrap pair ({i}, {j}) rejected: {e}"),
                }
            }
        }
        Err(SfmError::Bootstrap {
            images: n,
            pairs_tried,
        })
    }

    fn initialize_pair<'a>(
        &self,
        views: &'a [View],
        i: usize,
        j: usize,
    ) -> Result<Reconstruction<'a>, RegistrationError> {
        let correspondences = match_views(i, &views[i], j, &views[j], &self.params.matching)?;
        let (x1, x2) = pixels(views, &correspondences);
        let relative = estimate_relative_pose(
            &x1,
            &x2,
            views[i].camera(),
            views[j].camera(),
            &self.params.two_view,
        )?;

        let mut rec = Reconstruction::new(views);
        let anchor = self.chainer.anchor();
        let second = self.chainer.chain(&anchor, &relative.pose);
        rec.register_camera(i, anchor)?;
        rec.register_camera(j, second)?;

        let inliers: Vec<Correspondence> = correspondences
            .iter()
            .zip(relative.inliers.iter())
            .filter_map(|(c, &inlier)| inlier.then_some(*c))
            .collect();
        let stats = add_correspondences(&mut rec, &inliers, &self.params.tracks)?;
        let required = self.params.two_view.ransac.min_inliers;
        if stats.created < required {
            return Err(RegistrationError::TooFewPoints {
                found: stats.created,
                required,
            });
        }
        Ok(rec)
    }

    /// Register one more image and grow the tracks with it.
    pub fn register_view(
        &self,
        rec: &mut Reconstruction<'_>,
        view: usize,
    ) -> Result<RegistrationMethod, RegistrationError> {
        let track_matches = match match_track_endpoints(rec, view, &self.params.matching) {
            Ok(m) => m,
            Err(e) => {
                log::debug!("view {view}: no track matches ({e})");
                Vec::new()
            }
        };

        let mut located = None;
        if track_matches.len() >= self.params.min_pnp_correspondences {
            let world: Vec<_> = track_matches
                .iter()
                .filter_map(|m| rec.track(m.track).map(|t| t.point()))
                .collect();
            let image: Vec<DVec2> = track_matches
                .iter()
                .map(|m| rec.views()[view].keypoint(m.keypoint))
                .collect();
            match solve_pnp_ransac(
                &world,
                &image,
                rec.views()[view].camera(),
                &self.params.pnp,
                &self.params.pnp_refine,
            ) {
                Ok(result) => {
                    log::debug!(
                        "view {view}: pnp with {} of {} track matches, rmse {:.3} px",
                        result.inliers.len(),
                        track_matches.len(),
                        result.reproj_rmse
                    );
                    located = Some((result.pose, RegistrationMethod::Pnp));
                }
                Err(e) => log::debug!("view {view}: pnp failed ({e}), falling back to chaining"),
            }
        }
        let (pose, method) = match located {
            Some(found) => found,
            None => (
                self.chain_from_neighbour(rec, view)?,
                RegistrationMethod::RelativePose,
            ),
        };
        // nothing below may fail once the camera is registered
        rec.register_camera(view, pose)?;

        let mut stats = extend_tracks(rec, view, &track_matches, &self.params.tracks);
        stats += self.triangulate_new_matches(rec, view);
        let merged = merge_duplicate_tracks(rec, &self.params.tracks);
        let retriangulated = retriangulate_tracks(rec, &self.params.tracks);
        log::debug!(
            "view {view}: {} tracks extended, {} created, {} rejected, {merged} merged, {retriangulated} re-triangulated",
            stats.extended,
            stats.created,
            stats.rejected
        );

        if self.params.refine_after_each_registration {
            if let Err(e) = bundle_adjust(rec, &self.params.bundle) {
                log::warn!("bundle adjustment after view {view} skipped: {e}");
            }
        }
        Ok(method)
    }

    // relative pose against the registered images closest in input order
    fn chain_from_neighbour(
        &self,
        rec: &Reconstruction<'_>,
        view: usize,
    ) -> Result<CameraPose, RegistrationError> {
        let mut references: Vec<usize> = rec.registered().to_vec();
        references.sort_by_key(|r| (r.abs_diff(view), *r));

        let mut last = RegistrationError::NoReference;
        for reference in references {
            match self.relate_to(rec, reference, view) {
                Ok(pose) => return Ok(pose),
                Err(e) => {
                    log::debug!("view {view}: chaining from view {reference} failed ({e})");
                    last = e;
                }
            }
        }
        Err(last)
    }

    fn relate_to(
        &self,
        rec: &Reconstruction<'_>,
        reference: usize,
        view: usize,
    ) -> Result<CameraPose, RegistrationError> {
        let views = rec.views();
        let correspondences = match_views(
            reference,
            &views[reference],
            view,
            &views[view],
            &self.params.matching,
        )?;
        let (x1, x2) = pixels(views, &correspondences);
        let relative = estimate_relative_pose(
            &x1,
            &x2,
            views[reference].camera(),
            views[view].camera(),
            &self.params.two_view,
        )?;
        let pairs: Vec<(usize, usize)> = correspondences
            .iter()
            .zip(relative.inliers.iter())
            .filter(|(_, &inlier)| inlier)
            .map(|(c, _)| (c.keypoint_a, c.keypoint_b))
            .collect();
        let pose = self
            .chainer
            .chain_with_scale(rec, reference, view, &relative.pose, &pairs)?;
        Ok(pose)
    }

    // match the new image against every registered image and triangulate what agrees
    // with the known epipolar geometry
    fn triangulate_new_matches(&self, rec: &mut Reconstruction<'_>, view: usize) -> TrackStats {
        let views = rec.views();
        let pairs: Vec<(usize, usize)> = rec
            .registered()
            .iter()
            .filter(|&&r| r != view)
            .map(|&r| (r, view))
            .collect();
        let max_distance = self.params.tracks.triangulation.max_reprojection_error;

        let mut stats = TrackStats::default();
        let matched = match_pairs(views, &pairs, &self.params.matching);
        for (&(reference, _), result) in pairs.iter().zip(matched) {
            let correspondences = match result {
                Ok(c) => c,
                Err(e) => {
                    log::trace!("views ({reference}, {view}) not matched: {e}");
                    continue;
                }
            };
            let (Some(pose_a), Some(pose_b)) = (rec.pose(reference), rec.pose(view)) else {
                continue;
            };
            let motion = pose_b.relative_to(pose_a);
            let f = fundamental_from_essential(
                &essential_from_motion(&motion.rotation, &motion.translation),
                &views[reference].camera().matrix(),
                &views[view].camera().matrix(),
            );
            let consistent: Vec<Correspondence> = correspondences
                .into_iter()
                .filter(|c| {
                    let d = symmetric_epipolar_distance(
                        &f,
                        &views[reference].keypoint(c.keypoint_a),
                        &views[view].keypoint(c.keypoint_b),
                    );
                    d.is_finite() && d <= max_distance
                })
                .collect();
            match add_correspondences(rec, &consistent, &self.params.tracks) {
                Ok(added) => stats += added,
                Err(e) => log::debug!("views ({reference}, {view}) added no tracks: {e}"),
            }
        }
        stats
    }
}

fn pixels(views: &[View], correspondences: &[Correspondence]) -> (Vec<DVec2>, Vec<DVec2>) {
    correspondences
        .iter()
        .map(|c| {
            (
                views[c.view_a].keypoint(c.keypoint_a),
                views[c.view_b].keypoint(c.keypoint_b),
            )
        })
        .unzip()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::camera::PinholeCamera;
    use crate::features::{Descriptors, Features};
    use crate::linalg::exp_so3;
    use glam::DVec3;
    use std::ops::Range;

    fn camera() -> PinholeCamera {
        PinholeCamera::new(500.0, 500.0, 320.0, 240.0, 640, 480)
    }

    fn points(num_points: usize) -> Vec<DVec3> {
        (0..num_points)
            .map(|k| {
                let k = k as f64;
                DVec3::new(
                    (k * 0.37).sin() * 1.2,
                    (k * 0.91).cos() * 0.9,
                    6.0 + (k * 0.53).sin() * 1.5,
                )
            })
            .collect()
    }

    // camera i sits at x = 0.6 i, so the bootstrap pair (0, 1) puts camera i at x = i
    fn pose(i: usize) -> CameraPose {
        let r = exp_so3(DVec3::new(0.0, 0.08 * i as f64, 0.0));
        let center = DVec3::new(0.6 * i as f64, 0.0, 0.0);
        CameraPose::new(r, -(r * center))
    }

    // noiseless view of the points in `visible`, descriptors identify the point
    fn render(i: usize, points: &[DVec3], visible: Range<usize>) -> View {
        let pose = pose(i);
        let keypoints = visible
            .clone()
            .map(|k| pose.project(&camera(), points[k]).unwrap())
            .collect();
        let features = Features {
            keypoints,
            descriptors: Descriptors::Float {
                dim: 2,
                data: visible.flat_map(|k| [10.0 * k as f32, 0.0]).collect(),
            },
            colors: None,
        };
        View::new(format!("img{i}"), camera(), features).unwrap()
    }

    fn views(num_views: usize, num_points: usize) -> Vec<View> {
        let points = points(num_points);
        (0..num_views)
            .map(|i| render(i, &points, 0..num_points))
            .collect()
    }

    // an image whose descriptors match nothing
    fn unrelated_view() -> View {
        let features = Features {
            keypoints: (0..30)
                .map(|k| DVec2::new(10.0 * k as f64, 5.0 * k as f64))
                .collect(),
            descriptors: Descriptors::Float {
                dim: 2,
                data: (0..30)
                    .flat_map(|k| [1e4 + 37.0 * k as f32, -1e4])
                    .collect(),
            },
            colors: None,
        };
        View::new("unrelated", camera(), features).unwrap()
    }

    fn assert_centers_on_baseline_axis(report: &SfmReport) {
        for camera in &report.cameras {
            let expected = DVec3::new(camera.view as f64, 0.0, 0.0);
            let error = (camera.pose.center() - expected).length();
            assert!(error < 0.02, "view {} center error {error}", camera.view);
        }
    }

    #[test]
    fn test_pipeline_registers_all_views() -> Result<(), Box<dyn std::error::Error>> {
        let views = views(4, 120);
        let report = Pipeline::new(PipelineParams::default()).run(&views)?;
        assert_eq!(report.status, ReconstructionStatus::Complete);
        assert_eq!(report.cameras.len(), 4);
        assert!(report.skipped.is_empty());
        assert!(report.point_cloud.len() > 50);
        assert_eq!(report.pose(0), Some(&CameraPose::IDENTITY));
        for camera in &report.cameras {
            let err = camera.mean_reprojection_error.unwrap_or(f64::INFINITY);
            assert!(err < 1.0, "view {} error {err}", camera.view);
        }
        assert_centers_on_baseline_axis(&report);
        Ok(())
    }

    #[test]
    fn test_pipeline_chains_relative_poses() -> Result<(), Box<dyn std::error::Error>> {
        let views = views(4, 120);
        let params = PipelineParams {
            min_pnp_correspondences: usize::MAX,
            ..Default::default()
        };
        let report = Pipeline::new(params).run(&views)?;
        assert_eq!(report.status, ReconstructionStatus::Complete);
        assert_eq!(report.cameras.len(), 4);
        for camera in &report.cameras[2..] {
            assert_eq!(camera.method, RegistrationMethod::RelativePose);
        }
        assert_centers_on_baseline_axis(&report);
        Ok(())
    }

    #[test]
    fn test_pipeline_retries_pending_view() -> Result<(), Box<dyn std::error::Error>> {
        // view 2 only shares points with views 0 and 3; they become tracks once view 3 is in
        let points = points(160);
        let visibility = [0..160, 0..100, 100..160, 40..160];
        let views: Vec<View> = visibility
            .iter()
            .enumerate()
            .map(|(i, visible)| render(i, &points, visible.clone()))
            .collect();

        let report = Pipeline::new(PipelineParams::default()).run(&views)?;
        assert_eq!(report.status, ReconstructionStatus::Complete);
        assert!(report.skipped.is_empty());
        let order: Vec<usize> = report.cameras.iter().map(|c| c.view).collect();
        assert_eq!(order, vec![0, 1, 3, 2]);
        assert_eq!(report.cameras[3].method, RegistrationMethod::Pnp);
        assert_centers_on_baseline_axis(&report);
        Ok(())
    }

    #[test]
    fn test_pipeline_partial_when_view_unrelated() -> Result<(), Box<dyn std::error::Error>> {
        let mut views = views(3, 120);
        views.push(unrelated_view());

        let report = Pipeline::new(PipelineParams::default()).run(&views)?;
        assert_eq!(report.status, ReconstructionStatus::Partial);
        assert_eq!(report.cameras.len(), 3);
        assert_eq!(report.skipped.len(), 1);
        assert_eq!(report.skipped[0].view, 3);
        assert_eq!(report.skipped[0].image_id, "unrelated");
        Ok(())
    }

    #[test]
    fn test_failed_registration_keeps_view_out() -> Result<(), Box<dyn std::error::Error>> {
        let mut views = views(3, 120);
        views.push(unrelated_view());
        let pipeline = Pipeline::new(PipelineParams::default());
        let (mut rec, pair) = pipeline.bootstrap(&views)?;
        assert_eq!(pair, (0, 1));

        assert!(pipeline.register_view(&mut rec, 3).is_err());
        assert!(!rec.is_registered(3));
        let method = pipeline.register_view(&mut rec, 2)?;
        assert_eq!(method, RegistrationMethod::Pnp);
        assert!(rec.is_registered(2));
        assert!(pipeline.register_view(&mut rec, 3).is_err());
        assert_eq!(rec.registered(), &[0, 1, 2]);
        Ok(())
    }

    #[test]
    fn test_pipeline_bootstrap_failure() {
        let views = views(1, 50);
        match Pipeline::new(PipelineParams::default()).run(&views) {
            Err(SfmError::Bootstrap {
                images,
                pairs_tried,
            }) => {
                assert_eq!(images, 1);
                assert_eq!(pairs_tried, 0);
            }
            other => panic!("expected bootstrap failure, got {other:?}"),
        }
    }
}

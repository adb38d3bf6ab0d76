//! Chaining relative poses into the global frame anchored at the first registered camera.

use crate::camera::{CameraPose, MIN_DEPTH};
use crate::reconstruction::Reconstruction;
use crate::triangulation::{triangulate_dlt, ViewObservation};
use serde::{Deserialize, Serialize};

/// Errors raised by the pose chainer.
#[derive(Debug, thiserror::Error)]
pub enum PoseChainError {
    /// No (or too few) shared tracks to fix the translation scale.
    #[error("cannot recover scale of view {view} against view {reference}: {shared} shared tracks, {required} required")]
    ScaleRecovery {
        /// Already registered view the relative pose refers to.
        reference: usize,
        /// View being chained.
        view: usize,
        /// Usable shared tracks.
        shared: usize,
        /// Minimum number of shared tracks.
        required: usize,
    },
    /// The reference view has no pose.
    #[error("reference view {0} is not registered")]
    UnregisteredReference(usize),
}

/// Parameters of scale recovery.
#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct PoseChainParams {
    /// Minimum number of shared tracks with valid depths.
    pub min_shared_tracks: usize,
    /// Depth ratios outside `[median / band, median * band]` are ignored.
    pub ratio_band: f64,
}

impl Default for PoseChainParams {
    fn default() -> Self {
        Self {
            min_shared_tracks: 3,
            ratio_band: 1.5,
        }
    }
}

/// Accumulates relative poses into absolute ones.
#[derive(Clone, Copy, Debug, Default)]
pub struct PoseChainer {
    params: PoseChainParams,
}

impl PoseChainer {
    /// Creates a chainer with the given parameters.
    pub fn new(params: PoseChainParams) -> Self {
        Self { params }
    }

    /// Pose of the camera that anchors the world frame.
    pub fn anchor(&self) -> CameraPose {
        CameraPose::IDENTITY
    }

    /// Compose a relative pose (camera j to camera i) with camera j's absolute pose.
    ///
    /// `R_i = R_rel R_j`, `t_i = R_rel t_j + t_rel`.
    pub fn chain(&self, reference: &CameraPose, relative: &CameraPose) -> CameraPose {
        reference.then(relative)
    }

    /// Scale of a unit-baseline relative pose in the units of the reconstruction.
    ///
    /// `matches` pairs keypoints of the registered `reference` view with keypoints of
    /// `view`. For every pair whose reference keypoint belongs to a track, the depth of the
    /// track point in the reference camera (`z`) is compared with the depth obtained by
    /// triangulating the pair under the unit relative pose (`z'`). After discarding ratios
    /// far from the median, the scale is the least-squares ratio `sum(z z') / sum(z'^2)`.
    pub fn recover_scale(
        &self,
        rec: &Reconstruction<'_>,
        reference: usize,
        view: usize,
        relative: &CameraPose,
        matches: &[(usize, usize)],
    ) -> Result<f64, PoseChainError> {
        let ref_pose = rec
            .pose(reference)
            .ok_or(PoseChainError::UnregisteredReference(reference))?;
        let views = rec.views();
        let (cam_ref, cam_new) = (views[reference].camera(), views[view].camera());
        let origin = CameraPose::IDENTITY;

        let mut depths = Vec::new();
        for &(kp_ref, kp_new) in matches {
            let Some(track) = rec.track_of(reference, kp_ref).and_then(|id| rec.track(id)) else {
                continue;
            };
            let z = ref_pose.depth(track.point());
            let local = triangulate_dlt(&[
                ViewObservation {
                    camera: cam_ref,
                    pose: &origin,
                    pixel: views[reference].keypoint(kp_ref),
                },
                ViewObservation {
                    camera: cam_new,
                    pose: relative,
                    pixel: views[view].keypoint(kp_new),
                },
            ]);
            if let Some(p) = local {
                if z > MIN_DEPTH && p.z > MIN_DEPTH && relative.depth(p) > MIN_DEPTH {
                    depths.push((z, p.z));
                }
            }
        }

        let scale_error = |shared: usize| PoseChainError::ScaleRecovery {
            reference,
            view,
            shared,
            required: self.params.min_shared_tracks,
        };
        if depths.len() < self.params.min_shared_tracks.max(1) {
            return Err(scale_error(depths.len()));
        }

        let mut ratios: Vec<f64> = depths.iter().map(|(z, zp)| z / zp).collect();
        ratios.sort_by(|a, b| a.total_cmp(b));
        let median = ratios[ratios.len() / 2];
        let band = self.params.ratio_band.max(1.0);
        let kept: Vec<&(f64, f64)> = depths
            .iter()
            .filter(|(z, zp)| {
                let r = z / zp;
                r >= median / band && r <= median * band
            })
            .collect();
        if kept.len() < self.params.min_shared_tracks.max(1) {
            return Err(scale_error(kept.len()));
        }

        let num: f64 = kept.iter().map(|(z, zp)| z * zp).sum();
        let den: f64 = kept.iter().map(|(_, zp)| zp * zp).sum();
        let scale = num / den;
        if !scale.is_finite() || scale <= 0.0 {
            return Err(scale_error(0));
        }
        log::debug!(
            "scale of view {view} against view {reference}: {scale:.4} from {} shared tracks",
            kept.len()
        );
        Ok(scale)
    }

    /// Recover the scale of a relative pose and chain it into the global frame.
    pub fn chain_with_scale(
        &self,
        rec: &Reconstruction<'_>,
        reference: usize,
        view: usize,
        relative: &CameraPose,
        matches: &[(usize, usize)],
    ) -> Result<CameraPose, PoseChainError> {
        let scale = self.recover_scale(rec, reference, view, relative, matches)?;
        let ref_pose = rec
            .pose(reference)
            .ok_or(PoseChainError::UnregisteredReference(reference))?;
        let scaled = CameraPose::new(relative.rotation, relative.translation * scale);
        Ok(self.chain(ref_pose, &scaled))
    }
}

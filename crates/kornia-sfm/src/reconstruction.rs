//! The reconstruction state: registered cameras and multi-view tracks.
//!
//! All mutation goes through the update operations of [`Reconstruction`] so that the
//! track invariants hold at all times:
//!
//! * every observation of a track belongs to a distinct, registered image;
//! * an image keypoint belongs to at most one track;
//! * every track has at least two observations and a point in front of all of them.

use crate::camera::{CameraPose, MIN_DEPTH};
use crate::features::View;
use crate::pointcloud::PointCloud;
use crate::triangulation::{
    check_point, triangulate, TriangulationError, TriangulationParams, ViewObservation,
};
use glam::{DVec2, DVec3};
use std::collections::{BTreeMap, HashMap};

/// Identifier of a track, stable for the lifetime of the reconstruction.
pub type TrackId = usize;

/// Errors raised by reconstruction updates.
#[derive(Debug, thiserror::Error)]
pub enum ReconstructionError {
    /// The view index is out of range.
    #[error("unknown view {0}")]
    UnknownView(usize),
    /// The view already has a pose.
    #[error("view {0} is already registered")]
    AlreadyRegistered(usize),
    /// The view has no pose yet.
    #[error("view {0} is not registered")]
    NotRegistered(usize),
    /// The track does not exist.
    #[error("unknown track {0}")]
    UnknownTrack(TrackId),
    /// The keypoint index is out of range for its view.
    #[error("keypoint {keypoint} out of range in view {view}")]
    UnknownKeypoint {
        /// View index.
        view: usize,
        /// Keypoint index.
        keypoint: usize,
    },
    /// A track would contain two observations from the same view.
    #[error("track would observe view {view} twice")]
    DuplicateView {
        /// The repeated view.
        view: usize,
    },
    /// The observation already belongs to another track.
    #[error("observation ({view}, {keypoint}) already belongs to track {track}")]
    ObservationInUse {
        /// View index.
        view: usize,
        /// Keypoint index.
        keypoint: usize,
        /// Owning track.
        track: TrackId,
    },
    /// A track needs at least two observations.
    #[error("a track needs at least two observations, got {0}")]
    TooFewObservations(usize),
    /// The point is behind an observing camera.
    #[error("point behind the camera of view {0}")]
    NegativeDepth(usize),
    /// Re-triangulation rejected the update.
    #[error(transparent)]
    Triangulation(#[from] TriangulationError),
}

/// Observations of one physical point and its current 3D estimate.
#[derive(Clone, Debug, PartialEq)]
pub struct Track {
    observations: BTreeMap<usize, usize>,
    point: DVec3,
    color: Option<[u8; 3]>,
    endpoint: (usize, usize),
}

impl Track {
    /// The `(view, keypoint)` observations ordered by view.
    pub fn observations(&self) -> impl Iterator<Item = (usize, usize)> + '_ {
        self.observations.iter().map(|(v, k)| (*v, *k))
    }

    /// Number of observations.
    pub fn len(&self) -> usize {
        self.observations.len()
    }

    /// Always false: tracks hold at least two observations.
    pub fn is_empty(&self) -> bool {
        self.observations.is_empty()
    }

    /// Current 3D estimate.
    pub fn point(&self) -> DVec3 {
        self.point
    }

    /// Color sampled from the first contributing image that carries colors.
    pub fn color(&self) -> Option<[u8; 3]> {
        self.color
    }

    /// Keypoint observed in `view`, if any.
    pub fn keypoint_in(&self, view: usize) -> Option<usize> {
        self.observations.get(&view).copied()
    }

    /// The most recently added observation, used for matching against new images.
    pub fn endpoint(&self) -> (usize, usize) {
        self.endpoint
    }
}

/// The growing set of registered cameras and tracks.
#[derive(Debug)]
pub struct Reconstruction<'a> {
    views: &'a [View],
    poses: Vec<Option<CameraPose>>,
    order: Vec<usize>,
    tracks: BTreeMap<TrackId, Track>,
    owner: HashMap<(usize, usize), TrackId>,
    next_track: TrackId,
}

impl<'a> Reconstruction<'a> {
    /// An empty reconstruction over the given input images.
    pub fn new(views: &'a [View]) -> Self {
        Self {
            views,
            poses: vec![None; views.len()],
            order: Vec::new(),
            tracks: BTreeMap::new(),
            owner: HashMap::new(),
            next_track: 0,
        }
    }

    /// The input images.
    pub fn views(&self) -> &'a [View] {
        self.views
    }

    /// Registered views in registration order.
    pub fn registered(&self) -> &[usize] {
        &self.order
    }

    /// Whether `view` has a pose.
    pub fn is_registered(&self, view: usize) -> bool {
        self.poses.get(view).is_some_and(|p| p.is_some())
    }

    /// Pose of a registered view.
    pub fn pose(&self, view: usize) -> Option<&CameraPose> {
        self.poses.get(view).and_then(|p| p.as_ref())
    }

    /// All tracks ordered by id.
    pub fn tracks(&self) -> impl Iterator<Item = (TrackId, &Track)> + '_ {
        self.tracks.iter().map(|(id, t)| (*id, t))
    }

    /// Number of tracks.
    pub fn num_tracks(&self) -> usize {
        self.tracks.len()
    }

    /// The track with the given id.
    pub fn track(&self, id: TrackId) -> Option<&Track> {
        self.tracks.get(&id)
    }

    /// The track owning a keypoint, if any.
    pub fn track_of(&self, view: usize, keypoint: usize) -> Option<TrackId> {
        self.owner.get(&(view, keypoint)).copied()
    }

    /// Register a camera pose. A view is registered at most once.
    pub fn register_camera(
        &mut self,
        view: usize,
        pose: CameraPose,
    ) -> Result<(), ReconstructionError> {
        let slot = self
            .poses
            .get_mut(view)
            .ok_or(ReconstructionError::UnknownView(view))?;
        if slot.is_some() {
            return Err(ReconstructionError::AlreadyRegistered(view));
        }
        *slot = Some(pose);
        self.order.push(view);
        log::debug!("registered view {} ({} cameras)", view, self.order.len());
        Ok(())
    }

    pub(crate) fn registered_pose(&self, view: usize) -> Result<&CameraPose, ReconstructionError> {
        match self.pose(view) {
            Some(pose) => Ok(pose),
            None => Err(ReconstructionError::NotRegistered(view)),
        }
    }

    fn existing_track(&self, id: TrackId) -> Result<&Track, ReconstructionError> {
        match self.tracks.get(&id) {
            Some(track) => Ok(track),
            None => Err(ReconstructionError::UnknownTrack(id)),
        }
    }

    fn check_observation(&self, view: usize, keypoint: usize) -> Result<(), ReconstructionError> {
        if !self.is_registered(view) {
            return Err(ReconstructionError::NotRegistered(view));
        }
        if keypoint >= self.views[view].keypoints().len() {
            return Err(ReconstructionError::UnknownKeypoint { view, keypoint });
        }
        if let Some(&track) = self.owner.get(&(view, keypoint)) {
            return Err(ReconstructionError::ObservationInUse {
                view,
                keypoint,
                track,
            });
        }
        Ok(())
    }

    fn check_depth<'o>(
        &self,
        observations: impl IntoIterator<Item = &'o (usize, usize)>,
        p: DVec3,
    ) -> Result<(), ReconstructionError> {
        for &(view, _) in observations {
            let pose = self.registered_pose(view)?;
            if pose.depth(p) <= MIN_DEPTH {
                return Err(ReconstructionError::NegativeDepth(view));
            }
        }
        Ok(())
    }

    /// Add a triangulated track.
    ///
    /// The observations must come from distinct registered views, must not be owned by
    /// another track, and the point must be in front of every observing camera.
    pub fn add_track(
        &mut self,
        observations: &[(usize, usize)],
        point: DVec3,
    ) -> Result<TrackId, ReconstructionError> {
        if observations.len() < 2 {
            return Err(ReconstructionError::TooFewObservations(observations.len()));
        }
        let mut map = BTreeMap::new();
        for &(view, keypoint) in observations {
            self.check_observation(view, keypoint)?;
            if map.insert(view, keypoint).is_some() {
                return Err(ReconstructionError::DuplicateView { view });
            }
        }
        self.check_depth(observations, point)?;

        let color = observations
            .iter()
            .find_map(|&(v, k)| self.views[v].color(k));
        let id = self.next_track;
        self.next_track += 1;
        for &(view, keypoint) in observations {
            self.owner.insert((view, keypoint), id);
        }
        let endpoint = observations[observations.len() - 1];
        self.tracks.insert(
            id,
            Track {
                observations: map,
                point,
                color,
                endpoint,
            },
        );
        Ok(id)
    }

    /// Observations of a track paired with their camera data.
    pub fn view_observations(
        &self,
        id: TrackId,
    ) -> Result<Vec<ViewObservation<'_>>, ReconstructionError> {
        let track = self.existing_track(id)?;
        self.observations_of(track.observations())
    }

    fn observations_of(
        &self,
        observations: impl Iterator<Item = (usize, usize)>,
    ) -> Result<Vec<ViewObservation<'_>>, ReconstructionError> {
        observations
            .map(|(view, keypoint)| {
                let pose = self.registered_pose(view)?;
                Ok(ViewObservation {
                    camera: self.views[view].camera(),
                    pose,
                    pixel: self.views[view].keypoint(keypoint),
                })
            })
            .collect()
    }

    /// Add an observation from a newly registered view to a track and re-triangulate it.
    ///
    /// The track is left unchanged when the re-triangulated point is rejected.
    pub fn extend_track(
        &mut self,
        id: TrackId,
        view: usize,
        keypoint: usize,
        params: &TriangulationParams,
    ) -> Result<(), ReconstructionError> {
        self.check_observation(view, keypoint)?;
        let track = self.existing_track(id)?;
        if track.observations.contains_key(&view) {
            return Err(ReconstructionError::DuplicateView { view });
        }
        let all = track.observations().chain([(view, keypoint)]);
        let obs = self.observations_of(all)?;
        let point = triangulate(&obs, params)?;

        let color = track.color.or_else(|| self.views[view].color(keypoint));
        if let Some(track) = self.tracks.get_mut(&id) {
            track.observations.insert(view, keypoint);
            track.point = point;
            track.color = color;
            track.endpoint = (view, keypoint);
        }
        self.owner.insert((view, keypoint), id);
        Ok(())
    }

    /// Merge track `b` into track `a` when they observe no common image.
    ///
    /// The union is re-triangulated; on rejection both tracks are left unchanged.
    pub fn merge_tracks(
        &mut self,
        a: TrackId,
        b: TrackId,
        params: &TriangulationParams,
    ) -> Result<TrackId, ReconstructionError> {
        let ta = self.existing_track(a)?;
        let tb = self.existing_track(b)?;
        for &view in tb.observations.keys() {
            if ta.observations.contains_key(&view) {
                return Err(ReconstructionError::DuplicateView { view });
            }
        }
        let both = ta.observations().chain(tb.observations());
        let obs = self.observations_of(both)?;
        let point = triangulate(&obs, params)?;

        let Some(tb) = self.tracks.remove(&b) else {
            return Err(ReconstructionError::UnknownTrack(b));
        };
        for (view, keypoint) in tb.observations() {
            self.owner.insert((view, keypoint), a);
        }
        if let Some(ta) = self.tracks.get_mut(&a) {
            ta.observations.extend(tb.observations.iter());
            ta.point = point;
            ta.color = ta.color.or(tb.color);
        }
        Ok(a)
    }

    /// Replace the pose of a registered view (refinement only).
    pub fn set_pose(&mut self, view: usize, pose: CameraPose) -> Result<(), ReconstructionError> {
        match self.poses.get_mut(view) {
            Some(Some(p)) => {
                *p = pose;
                Ok(())
            }
            Some(None) => Err(ReconstructionError::NotRegistered(view)),
            None => Err(ReconstructionError::UnknownView(view)),
        }
    }

    /// Replace the point of a track (refinement only).
    ///
    /// Fails, leaving the track untouched, if the point falls behind an observing camera.
    pub fn set_point(&mut self, id: TrackId, point: DVec3) -> Result<(), ReconstructionError> {
        let track = self.existing_track(id)?;
        let obs: Vec<(usize, usize)> = track.observations().collect();
        self.check_depth(&obs, point)?;
        if let Some(track) = self.tracks.get_mut(&id) {
            track.point = point;
        }
        Ok(())
    }

    /// Re-triangulate a track from all of its observations.
    ///
    /// The point is replaced only if the new estimate passes the acceptance policy.
    pub fn retriangulate(
        &mut self,
        id: TrackId,
        params: &TriangulationParams,
    ) -> Result<(), ReconstructionError> {
        let obs = self.view_observations(id)?;
        let point = triangulate(&obs, params)?;
        self.set_point(id, point)
    }

    /// Whether a track's current point passes the acceptance policy.
    pub fn track_is_valid(&self, id: TrackId, params: &TriangulationParams) -> bool {
        match (self.view_observations(id), self.track(id)) {
            (Ok(obs), Some(t)) => check_point(&obs, t.point(), params).is_ok(),
            _ => false,
        }
    }

    /// Pixel residual of every observation as `(view, track, residual)`.
    pub fn residuals(&self) -> Vec<(usize, TrackId, DVec2)> {
        let mut out = Vec::new();
        for (id, track) in &self.tracks {
            for (view, keypoint) in track.observations() {
                let Some(pose) = self.pose(view) else {
                    continue;
                };
                if let Some(uv) = pose.project(self.views[view].camera(), track.point) {
                    out.push((view, *id, uv - self.views[view].keypoint(keypoint)));
                }
            }
        }
        out
    }

    /// Mean reprojection error in pixels of the observations made by `view`.
    pub fn mean_reprojection_error(&self, view: usize) -> Option<f64> {
        let errors: Vec<f64> = self
            .residuals()
            .into_iter()
            .filter(|(v, _, _)| *v == view)
            .map(|(_, _, r)| r.length())
            .collect();
        let mean = errors.iter().sum::<f64>() / errors.len() as f64;
        (!errors.is_empty()).then_some(mean)
    }

    /// Number of tracks observed by `view`.
    pub fn observation_count(&self, view: usize) -> usize {
        self.tracks
            .values()
            .filter(|t| t.observations.contains_key(&view))
            .count()
    }

    /// Current point cloud: one point per track with color and visibility.
    pub fn point_cloud(&self) -> PointCloud {
        let points = self.tracks.values().map(|t| t.point.to_array()).collect();
        let visibility = self.tracks.values().map(|t| t.len()).collect();
        // colors only when every track has one
        let colors: Option<Vec<[u8; 3]>> = self.tracks.values().map(|t| t.color).collect();
        let colors = colors.filter(|c| !c.is_empty());
        PointCloud::new(points, colors, visibility)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::camera::PinholeCamera;
    use crate::features::{Descriptors, Features};
    use crate::linalg::exp_so3;

    fn views(points: &[DVec3], poses: &[CameraPose]) -> Vec<View> {
        let cam = PinholeCamera::new(500.0, 500.0, 320.0, 240.0, 640, 480);
        poses
            .iter()
            .enumerate()
            .map(|(i, pose)| {
                let keypoints = points
                    .iter()
                    .map(|p| pose.project(&cam, *p).unwrap())
                    .collect();
                let features = Features {
                    keypoints,
                    descriptors: Descriptors::Float {
                        dim: 1,
                        data: (0..points.len()).map(|k| k as f32).collect(),
                    },
                    colors: Some(vec![[i as u8, 0, 0]; points.len()]),
                };
                View::new(format!("{i}"), cam, features).unwrap()
            })
            .collect()
    }

    fn setup() -> (Vec<DVec3>, Vec<CameraPose>) {
        let points = vec![
            DVec3::new(0.0, 0.0, 5.0),
            DVec3::new(0.5, -0.3, 6.0),
            DVec3::new(-0.4, 0.2, 5.5),
        ];
        let pose = |w: DVec3, t: DVec3| CameraPose::new(exp_so3(w), t);
        let poses = vec![
            CameraPose::IDENTITY,
            pose(DVec3::new(0.0, -0.1, 0.0), DVec3::new(-1.0, 0.0, 0.0)),
            pose(DVec3::new(0.0, 0.1, 0.0), DVec3::new(1.0, 0.0, 0.0)),
            pose(DVec3::new(0.05, 0.05, 0.0), DVec3::new(0.5, 0.3, 0.0)),
        ];
        (points, poses)
    }

    #[test]
    fn test_track_invariants() -> Result<(), Box<dyn std::error::Error>> {
        let (points, poses) = setup();
        let vs = views(&points, &poses);
        let mut rec = Reconstruction::new(&vs);
        rec.register_camera(0, poses[0])?;
        rec.register_camera(1, poses[1])?;
        assert!(matches!(
            rec.register_camera(1, poses[1]),
            Err(ReconstructionError::AlreadyRegistered(1))
        ));

        let id = rec.add_track(&[(0, 0), (1, 0)], points[0])?;
        assert_eq!(rec.track_of(1, 0), Some(id));
        assert!(matches!(
            rec.add_track(&[(0, 0), (1, 1)], points[1]),
            Err(ReconstructionError::ObservationInUse { track: 0, .. })
        ));
        assert!(matches!(
            rec.add_track(&[(0, 1), (0, 2)], points[1]),
            Err(ReconstructionError::DuplicateView { view: 0 })
        ));
        assert!(matches!(
            rec.add_track(&[(0, 1), (2, 1)], points[1]),
            Err(ReconstructionError::NotRegistered(2))
        ));
        assert!(matches!(
            rec.add_track(&[(0, 1), (1, 1)], DVec3::new(0.0, 0.0, -3.0)),
            Err(ReconstructionError::NegativeDepth(_))
        ));

        rec.register_camera(2, poses[2])?;
        rec.extend_track(id, 2, 0, &TriangulationParams::default())?;
        let track = rec.track(id).unwrap();
        assert_eq!(track.len(), 3);
        assert_eq!(track.endpoint(), (2, 0));
        assert!(track.point().distance(points[0]) < 1e-6);
        assert!(matches!(
            rec.extend_track(id, 2, 1, &TriangulationParams::default()),
            Err(ReconstructionError::ObservationInUse { .. })
                | Err(ReconstructionError::DuplicateView { .. })
        ));
        Ok(())
    }

    #[test]
    fn test_extend_reverts_on_rejection() -> Result<(), Box<dyn std::error::Error>> {
        let (points, poses) = setup();
        let vs = views(&points, &poses);
        let mut rec = Reconstruction::new(&vs);
        for (i, p) in poses.iter().enumerate() {
            rec.register_camera(i, *p)?;
        }
        let id = rec.add_track(&[(0, 0), (1, 0)], points[0])?;
        let before = rec.track(id).cloned();
        // keypoint 1 of view 2 belongs to a different physical point
        let res = rec.extend_track(id, 2, 1, &TriangulationParams::default());
        assert!(matches!(res, Err(ReconstructionError::Triangulation(_))));
        assert_eq!(rec.track(id).cloned(), before);
        assert_eq!(rec.track_of(2, 1), None);
        Ok(())
    }

    #[test]
    fn test_merge_tracks() -> Result<(), Box<dyn std::error::Error>> {
        let (points, poses) = setup();
        let vs = views(&points, &poses);
        let mut rec = Reconstruction::new(&vs);
        for (i, p) in poses.iter().enumerate() {
            rec.register_camera(i, *p)?;
        }
        let a = rec.add_track(&[(0, 1), (1, 1)], points[1])?;
        let b = rec.add_track(&[(2, 2), (1, 2)], points[2])?;
        // b observes view 1 too
        assert!(matches!(
            rec.merge_tracks(a, b, &TriangulationParams::default()),
            Err(ReconstructionError::DuplicateView { view: 1 })
        ));
        let c = rec.add_track(&[(2, 1), (3, 1)], points[1])?;
        assert_eq!(rec.merge_tracks(a, c, &TriangulationParams::default())?, a);
        assert!(rec.track(c).is_none());
        assert_eq!(rec.track_of(3, 1), Some(a));
        assert_eq!(rec.track(a).map(|t| t.len()), Some(4));
        assert_eq!(rec.num_tracks(), 2);

        let pc = rec.point_cloud();
        assert_eq!(pc.len(), 2);
        assert_eq!(pc.visibility(), &[4, 2]);
        assert_eq!(pc.colors().unwrap()[0], [0, 0, 0]);
        Ok(())
    }

    #[test]
    fn test_residuals_zero_for_exact_scene() -> Result<(), Box<dyn std::error::Error>> {
        let (points, poses) = setup();
        let vs = views(&points, &poses);
        let mut rec = Reconstruction::new(&vs);
        for (i, p) in poses.iter().enumerate() {
            rec.register_camera(i, *p)?;
        }
        for (k, p) in points.iter().enumerate() {
            rec.add_track(&[(0, k), (1, k), (2, k), (3, k)], *p)?;
        }
        assert!(rec.mean_reprojection_error(2).unwrap() < 1e-9);
        assert_eq!(rec.observation_count(1), 3);
        assert!(rec.mean_reprojection_error(5).is_none());
        Ok(())
    }
}

//! Track building: seeding, extending, merging and re-triangulating multi-view tracks.

use crate::features::Descriptors;
use crate::matching::{match_descriptors, Correspondence, MatchingError, MatchingParams};
use crate::reconstruction::{Reconstruction, ReconstructionError, TrackId};
use crate::triangulation::{triangulate_pair, TriangulationParams, ViewObservation};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Parameters of the track builder.
#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct TrackParams {
    /// Acceptance policy for new and updated points.
    pub triangulation: TriangulationParams,
    /// Two tracks closer than this (world units) are merge candidates.
    pub merge_distance: f64,
    /// Re-triangulate tracks whose mean reprojection error exceeds this many pixels.
    pub retriangulate_error: f64,
}

impl Default for TrackParams {
    fn default() -> Self {
        Self {
            triangulation: TriangulationParams::default(),
            merge_distance: 0.05,
            retriangulate_error: 2.0,
        }
    }
}

/// Counts of a track-building pass.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct TrackStats {
    /// New tracks.
    pub created: usize,
    /// Observations added to existing tracks.
    pub extended: usize,
    /// Candidates dropped by the triangulation policy or the track invariants.
    pub rejected: usize,
}

impl std::ops::AddAssign for TrackStats {
    fn add_assign(&mut self, other: Self) {
        self.created += other.created;
        self.extended += other.extended;
        self.rejected += other.rejected;
    }
}

/// A keypoint of a new image matched to an existing track.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct TrackMatch {
    /// Matched track.
    pub track: TrackId,
    /// Keypoint in the new image.
    pub keypoint: usize,
    /// Descriptor distance.
    pub distance: f32,
}

/// Match the endpoint descriptors of all tracks against the keypoints of `view`.
///
/// Every track is represented by the descriptor of its most recent observation. Keypoints
/// already owned by a track are skipped, and a keypoint claimed by several tracks goes to
/// the closest one.
pub fn match_track_endpoints(
    rec: &Reconstruction<'_>,
    view: usize,
    params: &MatchingParams,
) -> Result<Vec<TrackMatch>, MatchingError> {
    let views = rec.views();
    let ids: Vec<TrackId> = rec.tracks().map(|(id, _)| id).collect();
    let query = Descriptors::collect(rec.tracks().filter_map(|(_, t)| {
        let (v, k) = t.endpoint();
        views[v].descriptors().get(k)
    }));
    let Some(query) = query else {
        return Err(MatchingError::InsufficientCorrespondences {
            required: params.min_matches,
            found: 0,
        });
    };
    if query.len() != ids.len() {
        return Err(MatchingError::IncompatibleDescriptors {
            left: query.kind(),
            right: views[view].descriptors().kind(),
        });
    }

    let matches = match_descriptors(&query, views[view].descriptors(), params)?;
    let mut best: HashMap<usize, TrackMatch> = HashMap::new();
    for m in matches {
        if rec.track_of(view, m.train).is_some() {
            continue;
        }
        let candidate = TrackMatch {
            track: ids[m.query],
            keypoint: m.train,
            distance: m.distance,
        };
        best.entry(m.train)
            .and_modify(|e| {
                if candidate.distance < e.distance {
                    *e = candidate;
                }
            })
            .or_insert(candidate);
    }
    let mut out: Vec<TrackMatch> = best.into_values().collect();
    out.sort_by_key(|m| (m.track, m.keypoint));
    Ok(out)
}

/// Extend tracks with observations from a newly registered view.
///
/// Each extension re-triangulates the track from all its views; rejected extensions
/// leave the track untouched.
pub fn extend_tracks(
    rec: &mut Reconstruction<'_>,
    view: usize,
    matches: &[TrackMatch],
    params: &TrackParams,
) -> TrackStats {
    let mut stats = TrackStats::default();
    for m in matches {
        match rec.extend_track(m.track, view, m.keypoint, &params.triangulation) {
            Ok(()) => stats.extended += 1,
            Err(e) => {
                log::trace!("track {} not extended by view {view}: {e}", m.track);
                stats.rejected += 1;
            }
        }
    }
    stats
}

/// Turn inlier correspondences between two registered views into tracks.
///
/// A correspondence whose keypoint in one view already belongs to a track extends that
/// track; otherwise the pair is triangulated and, if accepted, becomes a new track.
pub fn add_correspondences(
    rec: &mut Reconstruction<'_>,
    correspondences: &[Correspondence],
    params: &TrackParams,
) -> Result<TrackStats, ReconstructionError> {
    let tri = &params.triangulation;
    let mut stats = TrackStats::default();
    for c in correspondences {
        let (a, b) = ((c.view_a, c.keypoint_a), (c.view_b, c.keypoint_b));
        let owner_a = rec.track_of(a.0, a.1);
        let owner_b = rec.track_of(b.0, b.1);
        let result = match (owner_a, owner_b) {
            (Some(_), Some(_)) => continue,
            (Some(t), None) => rec.extend_track(t, b.0, b.1, tri).map(|_| false),
            (None, Some(t)) => rec.extend_track(t, a.0, a.1, tri).map(|_| false),
            (None, None) => new_track(rec, a, b, tri).map(|_| true),
        };
        match result {
            Ok(true) => stats.created += 1,
            Ok(false) => stats.extended += 1,
            Err(e @ ReconstructionError::NotRegistered(_)) => return Err(e),
            Err(e) => {
                log::trace!("correspondence {c:?} dropped: {e}");
                stats.rejected += 1;
            }
        }
    }
    Ok(stats)
}

fn new_track(
    rec: &mut Reconstruction<'_>,
    a: (usize, usize),
    b: (usize, usize),
    params: &TriangulationParams,
) -> Result<TrackId, ReconstructionError> {
    let views = rec.views();
    let pose_a = *rec.registered_pose(a.0)?;
    let pose_b = *rec.registered_pose(b.0)?;
    let point = triangulate_pair(
        ViewObservation {
            camera: views[a.0].camera(),
            pose: &pose_a,
            pixel: views[a.0].keypoint(a.1),
        },
        ViewObservation {
            camera: views[b.0].camera(),
            pose: &pose_b,
            pixel: views[b.0].keypoint(b.1),
        },
        params,
    )?;
    rec.add_track(&[a, b], point)
}

/// Merge tracks whose points lie within `merge_distance` and share no image.
///
/// Candidates are found through a uniform grid with the merge distance as cell size.
/// Returns the number of merges performed.
pub fn merge_duplicate_tracks(rec: &mut Reconstruction<'_>, params: &TrackParams) -> usize {
    let cell = params.merge_distance;
    if cell <= 0.0 {
        return 0;
    }
    let key = |p: glam::DVec3| {
        let q = (p / cell).floor();
        (q.x as i64, q.y as i64, q.z as i64)
    };
    let mut grid: HashMap<(i64, i64, i64), Vec<TrackId>> = HashMap::new();
    for (id, t) in rec.tracks() {
        grid.entry(key(t.point())).or_default().push(id);
    }

    let ids: Vec<TrackId> = rec.tracks().map(|(id, _)| id).collect();
    let mut merged = 0;
    for id in ids {
        let Some(point) = rec.track(id).map(|t| t.point()) else {
            continue;
        };
        let (cx, cy, cz) = key(point);
        let mut neighbours = Vec::new();
        for dx in -1..=1 {
            for dy in -1..=1 {
                for dz in -1..=1 {
                    if let Some(cands) = grid.get(&(cx + dx, cy + dy, cz + dz)) {
                        neighbours.extend(cands.iter().copied().filter(|&o| o > id));
                    }
                }
            }
        }
        neighbours.sort_unstable();
        for other in neighbours {
            let close = match (rec.track(id), rec.track(other)) {
                (Some(a), Some(b)) => a.point().distance(b.point()) <= params.merge_distance,
                _ => false,
            };
            if close && rec.merge_tracks(id, other, &params.triangulation).is_ok() {
                merged += 1;
            }
        }
    }
    if merged > 0 {
        log::debug!("merged {merged} duplicate tracks");
    }
    merged
}

/// Re-triangulate poorly constrained tracks from all of their observations.
///
/// A track qualifies when its mean reprojection error exceeds `retriangulate_error` or
/// when it no longer passes the acceptance policy. Returns the number of updated tracks.
pub fn retriangulate_tracks(rec: &mut Reconstruction<'_>, params: &TrackParams) -> usize {
    let mut sums: HashMap<TrackId, (f64, usize)> = HashMap::new();
    for (_, id, r) in rec.residuals() {
        let e = sums.entry(id).or_default();
        e.0 += r.length();
        e.1 += 1;
    }
    let weak: Vec<TrackId> = rec
        .tracks()
        .map(|(id, _)| id)
        .filter(|id| {
            let mean = sums.get(id).map_or(f64::INFINITY, |(s, n)| s / *n as f64);
            mean > params.retriangulate_error || !rec.track_is_valid(*id, &params.triangulation)
        })
        .collect();
    weak.into_iter()
        .filter(|id| rec.retriangulate(*id, &params.triangulation).is_ok())
        .count()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::camera::{CameraPose, PinholeCamera};
    use crate::features::{Features, View};
    use crate::linalg::exp_so3;
    use glam::{DVec2, DVec3};

    // three views of a small grid, descriptor k identifies point k in every view
    fn scene() -> (Vec<View>, Vec<CameraPose>, Vec<DVec3>) {
        let cam = PinholeCamera::new(500.0, 500.0, 320.0, 240.0, 640, 480);
        let points: Vec<DVec3> = (0..30)
            .map(|k| {
                let k = k as f64;
                DVec3::new(
                    (k % 6.0) * 0.3 - 0.75,
                    (k / 6.0).floor() * 0.3 - 0.6,
                    5.0 + (k * 0.7).sin(),
                )
            })
            .collect();
        let poses = vec![
            CameraPose::IDENTITY,
            CameraPose::new(
                exp_so3(DVec3::new(0.0, -0.12, 0.0)),
                DVec3::new(-0.8, 0.0, 0.05),
            ),
            CameraPose::new(
                exp_so3(DVec3::new(0.02, 0.12, 0.0)),
                DVec3::new(0.8, 0.1, 0.0),
            ),
            CameraPose::new(
                exp_so3(DVec3::new(0.0, 0.05, 0.02)),
                DVec3::new(0.3, -0.2, 0.1),
            ),
        ];
        let views = poses
            .iter()
            .enumerate()
            .map(|(i, pose)| {
                let keypoints: Vec<DVec2> = points
                    .iter()
                    .map(|p| pose.project(&cam, *p).unwrap())
                    .collect();
                let mut data = Vec::new();
                for k in 0..points.len() {
                    for d in 0..4 {
                        let id = if d == 0 { k as f32 * 10.0 } else { 0.0 };
                        data.push(((k * 7 + d * 13) % 31) as f32 + id);
                    }
                }
                let features = Features {
                    keypoints,
                    descriptors: Descriptors::Float { dim: 4, data },
                    colors: None,
                };
                View::new(format!("{i}"), cam, features).unwrap()
            })
            .collect();
        (views, poses, points)
    }

    fn pairs(a: usize, b: usize, n: usize) -> Vec<Correspondence> {
        (0..n)
            .map(|k| Correspondence {
                view_a: a,
                keypoint_a: k,
                view_b: b,
                keypoint_b: k,
            })
            .collect()
    }

    #[test]
    fn test_seed_and_extend() -> Result<(), Box<dyn std::error::Error>> {
        let (views, poses, points) = scene();
        let mut rec = Reconstruction::new(&views);
        rec.register_camera(0, poses[0])?;
        rec.register_camera(1, poses[1])?;
        let params = TrackParams::default();
        let stats = add_correspondences(&mut rec, &pairs(0, 1, points.len()), &params)?;
        assert_eq!(stats.created, points.len());
        assert_eq!(rec.num_tracks(), points.len());

        rec.register_camera(2, poses[2])?;
        let matching = MatchingParams::default();
        let matches = match_track_endpoints(&rec, 2, &matching)?;
        assert_eq!(matches.len(), points.len());
        for m in &matches {
            let track = rec.track(m.track).unwrap();
            assert_eq!(track.keypoint_in(0), Some(m.keypoint));
        }

        let stats = extend_tracks(&mut rec, 2, &matches, &params);
        assert_eq!(stats.extended, points.len());
        for (_, t) in rec.tracks() {
            assert_eq!(t.len(), 3);
            for (v, _) in t.observations() {
                assert!(rec.pose(v).unwrap().depth(t.point()) > 0.0);
            }
        }
        // already-owned keypoints are not offered again
        let again = match_track_endpoints(&rec, 2, &matching.with_min_matches(0))?;
        assert!(again.is_empty());
        Ok(())
    }

    #[test]
    fn test_correspondence_extends_existing_track() -> Result<(), Box<dyn std::error::Error>> {
        let (views, poses, _) = scene();
        let mut rec = Reconstruction::new(&views);
        for (i, p) in poses.iter().enumerate() {
            rec.register_camera(i, *p)?;
        }
        add_correspondences(&mut rec, &pairs(0, 1, 10), &TrackParams::default())?;
        let stats = add_correspondences(&mut rec, &pairs(1, 2, 10), &TrackParams::default())?;
        assert_eq!(
            stats,
            TrackStats {
                created: 0,
                extended: 10,
                rejected: 0
            }
        );
        assert_eq!(rec.num_tracks(), 10);
        Ok(())
    }

    #[test]
    fn test_merge_duplicates() -> Result<(), Box<dyn std::error::Error>> {
        let (views, poses, points) = scene();
        let mut rec = Reconstruction::new(&views);
        for (i, p) in poses.iter().enumerate() {
            rec.register_camera(i, *p)?;
        }
        // the same physical point triangulated twice from disjoint observations
        let a = rec.add_track(&[(0, 3), (1, 3)], points[3])?;
        let b = rec.add_track(&[(2, 3), (3, 3)], points[3] + DVec3::new(0.01, 0.0, 0.0))?;
        // close to c but observing view 1 as well
        let c = rec.add_track(&[(0, 5), (1, 5)], points[5])?;
        let d = rec.add_track(&[(1, 6), (2, 6)], points[5] + DVec3::new(0.0, 0.01, 0.0))?;

        let merged = merge_duplicate_tracks(&mut rec, &TrackParams::default());
        assert_eq!(merged, 1);
        assert!(rec.track(b).is_none());
        assert_eq!(rec.track(a).map(|t| t.len()), Some(4));
        assert!(rec.track(a).unwrap().point().distance(points[3]) < 1e-6);
        assert!(rec.track(c).is_some() && rec.track(d).is_some());
        assert_eq!(rec.num_tracks(), 3);
        Ok(())
    }

    #[test]
    fn test_retriangulate_fixes_perturbed_point() -> Result<(), Box<dyn std::error::Error>> {
        let (views, poses, points) = scene();
        let mut rec = Reconstruction::new(&views);
        for (i, p) in poses.iter().enumerate() {
            rec.register_camera(i, *p)?;
        }
        let off = points[0] + DVec3::new(0.05, 0.0, 0.2);
        let id = rec.add_track(&[(0, 0), (1, 0), (2, 0)], off)?;
        let updated = retriangulate_tracks(&mut rec, &TrackParams::default());
        assert_eq!(updated, 1);
        assert!(rec.track(id).unwrap().point().distance(points[0]) < 1e-6);
        Ok(())
    }
}

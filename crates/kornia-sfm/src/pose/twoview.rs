use crate::camera::{CameraPose, PinholeCamera, MIN_DEPTH};
use crate::linalg::{closest_rotation, exp_so3};
use crate::pnp::LMRefineParams;
use crate::pose::essential::{
    decompose_essential, essential_from_motion, fundamental_from_essential, EssentialError,
};
use crate::pose::fundamental::FundamentalError;
use crate::pose::ransac::{ransac_epipolar, MinimalSolver, RansacParams};
use crate::triangulation::{triangulate_dlt, triangulation_angle_deg, ViewObservation};
use faer::prelude::SpSolver;
use faer::Mat;
use glam::{DMat3, DVec2, DVec3};
use serde::{Deserialize, Serialize};

/// Errors returned by two-view estimation.
#[derive(thiserror::Error, Debug)]
pub enum TwoViewError {
    /// The two point lists differ in length.
    #[error("correspondence lists differ in length: {x1} vs {x2}")]
    LengthMismatch {
        /// Number of points in the first image.
        x1: usize,
        /// Number of points in the second image.
        x2: usize,
    },
    /// Too few robust matches for the pair.
    #[error("insufficient inliers: required {required}, found {found}")]
    InsufficientInliers {
        /// Minimum number of inliers.
        required: usize,
        /// Number of inliers found.
        found: usize,
    },
    /// The motion is ambiguous or degenerate (e.g. pure rotation).
    #[error("degenerate geometry: {reason}")]
    DegenerateGeometry {
        /// Human readable description.
        reason: String,
    },
    /// Fundamental estimation failed.
    #[error("fundamental estimation error: {0}")]
    Fundamental(#[from] FundamentalError),
    /// Essential estimation failed.
    #[error("essential estimation error: {0}")]
    Essential(#[from] EssentialError),
}

/// Configuration for two-view relative pose estimation.
#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct TwoViewConfig {
    /// Minimal solver used in RANSAC.
    pub solver: MinimalSolver,
    /// RANSAC settings.
    pub ransac: RansacParams,
    /// Median triangulation angle below which the motion is considered a pure rotation.
    pub min_parallax_deg: f64,
    /// Number of inliers triangulated to disambiguate the four pose candidates.
    pub cheirality_samples: usize,
    /// Non-linear refinement of the selected pose on the inliers.
    pub refinement: LMRefineParams,
}

impl Default for TwoViewConfig {
    fn default() -> Self {
        Self {
            solver: MinimalSolver::default(),
            ransac: RansacParams::default(),
            min_parallax_deg: 1.0,
            cheirality_samples: 100,
            refinement: LMRefineParams::default(),
        }
    }
}

/// The selected pose of a cheirality check.
#[derive(Clone, Copy, Debug)]
pub struct CheiralityResult {
    /// Motion from the first to the second camera.
    pub pose: CameraPose,
    /// Fraction of sampled points in front of both cameras.
    pub confidence: f64,
    /// Number of sampled points in front of both cameras.
    pub positive: usize,
}

/// Output of two-view estimation.
#[derive(Clone, Debug)]
pub struct RelativePose {
    /// Motion from view 1 to view 2, `x2 = R x1 + t`, with `|t| = 1`.
    pub pose: CameraPose,
    /// Essential matrix of the refined pose.
    pub essential: DMat3,
    /// Fundamental matrix of the refined pose.
    pub fundamental: DMat3,
    /// Inlier mask: epipolar inliers with positive depth in both views.
    pub inliers: Vec<bool>,
    /// Number of inliers.
    pub inlier_count: usize,
    /// Cheirality confidence of the selected pose.
    pub confidence: f64,
    /// Median triangulation angle of the inliers in degrees.
    pub median_parallax_deg: f64,
}

// triangulate with view 1 at the origin and view 2 at `pose`
fn triangulate_normalized(pose: &CameraPose, a: DVec3, b: DVec3) -> Option<DVec3> {
    let unit = PinholeCamera::new(1.0, 1.0, 0.0, 0.0, 1, 1);
    let origin = CameraPose::IDENTITY;
    triangulate_dlt(&[
        ViewObservation {
            camera: &unit,
            pose: &origin,
            pixel: a.truncate(),
        },
        ViewObservation {
            camera: &unit,
            pose,
            pixel: b.truncate(),
        },
    ])
}

fn in_front(pose: &CameraPose, p: DVec3) -> bool {
    p.z > MIN_DEPTH && pose.depth(p) > MIN_DEPTH
}

/// Disambiguate the four decompositions of an essential matrix.
///
/// Triangulates every ray pair under each candidate and returns the candidate with the
/// most points in front of both cameras, with the fraction of such points as confidence.
/// Rays are normalized image coordinates `(x, y, 1)`. Returns `None` for empty input or
/// when no candidate places any point in front of both cameras.
pub fn select_pose(
    candidates: &[(DMat3, DVec3)],
    x1: &[DVec3],
    x2: &[DVec3],
) -> Option<CheiralityResult> {
    let n = x1.len().min(x2.len());
    if n == 0 {
        return None;
    }
    let mut best: Option<CheiralityResult> = None;
    for (r, t) in candidates {
        let pose = CameraPose::new(*r, *t);
        let positive = x1
            .iter()
            .zip(x2.iter())
            .filter(|(a, b)| {
                triangulate_normalized(&pose, **a, **b).is_some_and(|p| in_front(&pose, p))
            })
            .count();
        if positive > 0 && best.map_or(true, |b| positive > b.positive) {
            best = Some(CheiralityResult {
                pose,
                confidence: positive as f64 / n as f64,
                positive,
            });
        }
    }
    best
}

// first-order geometric error of the epipolar constraint `b^T E a`
fn sampson_residual(e: &DMat3, a: DVec3, b: DVec3) -> Option<f64> {
    let ea = *e * a;
    let etb = e.transpose() * b;
    let denom = ea.x * ea.x + ea.y * ea.y + etb.x * etb.x + etb.y * etb.y;
    (denom > f64::MIN_POSITIVE).then(|| b.dot(ea) / denom.sqrt())
}

fn sampson_cost(pose: &CameraPose, x1: &[DVec3], x2: &[DVec3]) -> f64 {
    let e = essential_from_motion(&pose.rotation, &pose.translation);
    x1.iter()
        .zip(x2.iter())
        .filter_map(|(a, b)| sampson_residual(&e, *a, *b))
        .map(|r| r * r)
        .sum()
}

/// Refine a relative pose with Levenberg-Marquardt on the Sampson error of the rays.
///
/// Rays are normalized image coordinates `(x, y, 1)`. The rotation is updated on the left
/// and the translation moves on the unit sphere, so the result keeps `|t| = 1`. The
/// Sampson denominators are held fixed while linearizing.
pub fn refine_relative_pose(
    initial: &CameraPose,
    x1: &[DVec3],
    x2: &[DVec3],
    params: &LMRefineParams,
) -> CameraPose {
    let Some(direction) = initial.translation.try_normalize() else {
        return *initial;
    };
    let mut pose = CameraPose::new(initial.rotation, direction);
    if x1.len().min(x2.len()) < 5 {
        return pose;
    }
    let mut cost = sampson_cost(&pose, x1, x2);
    let mut lambda = params.initial_lambda;
    for _ in 0..params.max_iterations {
        let t = pose.translation;
        let (b1, b2) = t.any_orthonormal_pair();
        let e = essential_from_motion(&pose.rotation, &t);
        let mut h = Mat::<f64>::zeros(5, 5);
        let mut g = Mat::<f64>::zeros(5, 1);
        for (a, b) in x1.iter().zip(x2.iter()) {
            let ea = e * *a;
            let etb = e.transpose() * *b;
            let denom = ea.x * ea.x + ea.y * ea.y + etb.x * etb.x + etb.y * etb.y;
            if denom <= f64::MIN_POSITIVE {
                continue;
            }
            let w = denom.sqrt().recip();
            let r = b.dot(ea) * w;
            // n = b . (t x R a): dn/dw = R a x (b x t), dn/dt = R a x b
            let y = pose.rotation * *a;
            let dw = y.cross(b.cross(t)) * w;
            let dt = y.cross(*b) * w;
            let jac = [dw.x, dw.y, dw.z, dt.dot(b1), dt.dot(b2)];
            for i in 0..5 {
                g.write(i, 0, g.read(i, 0) + jac[i] * r);
                for j in 0..5 {
                    h.write(i, j, h.read(i, j) + jac[i] * jac[j]);
                }
            }
        }

        let mut accepted = false;
        while lambda < 1e12 {
            let mut damped = h.clone();
            for d in 0..5 {
                damped.write(d, d, h.read(d, d) + lambda * h.read(d, d).max(1e-12));
            }
            let delta = damped.partial_piv_lu().solve(&g);
            let step = |k: usize| -delta.read(k, 0);
            let rotation = exp_so3(DVec3::new(step(0), step(1), step(2))) * pose.rotation;
            let Some(translation) = (t + b1 * step(3) + b2 * step(4)).try_normalize() else {
                lambda *= 10.0;
                continue;
            };
            let candidate = CameraPose::new(closest_rotation(&rotation), translation);
            let new_cost = sampson_cost(&candidate, x1, x2);
            if new_cost.is_finite() && new_cost < cost {
                let rel = (cost - new_cost) / cost.max(f64::MIN_POSITIVE);
                pose = candidate;
                cost = new_cost;
                lambda = (lambda * 0.1).max(1e-12);
                accepted = true;
                if rel < params.cost_tolerance {
                    return pose;
                }
                break;
            }
            lambda *= 10.0;
        }
        if !accepted {
            break;
        }
    }
    pose
}

/// Estimate the relative pose between two views from pixel correspondences.
///
/// Runs RANSAC with the configured minimal solver, checks that the winning model beats a
/// random one and resolves the four-fold pose ambiguity by cheirality. The selected pose
/// is refined on the epipolar inliers before pure rotations are rejected by their small
/// triangulation angles.
///
/// # Errors
///
/// * [`TwoViewError::InsufficientInliers`] when fewer correspondences than a minimal sample
///   exist or RANSAC does not reach the minimum inlier count.
/// * [`TwoViewError::DegenerateGeometry`] when the inlier set is indistinguishable from
///   chance, too few inliers survive the cheirality check, or parallax is too small.
pub fn estimate_relative_pose(
    x1: &[DVec2],
    x2: &[DVec2],
    camera1: &PinholeCamera,
    camera2: &PinholeCamera,
    config: &TwoViewConfig,
) -> Result<RelativePose, TwoViewError> {
    let ransac = ransac_epipolar(x1, x2, camera1, camera2, config.solver, &config.ransac)?;
    let n = x1.len();

    // a random epipolar model catches a point with probability ~ band area / image area
    let band = |c: &PinholeCamera| {
        (2.0 * ransac.threshold * c.diagonal() / (c.width * c.height).max(1) as f64).min(1.0)
    };
    let p0 = band(camera1).max(band(camera2));
    let expected = n as f64 * p0;
    let sigma = (n as f64 * p0 * (1.0 - p0)).sqrt();
    if ransac.inlier_count as f64 <= expected + 3.0 * sigma {
        return Err(TwoViewError::DegenerateGeometry {
            reason: format!(
                "{} inliers of {} is indistinguishable from chance ({:.1} expected)",
                ransac.inlier_count, n, expected
            ),
        });
    }

    let rays1: Vec<DVec3> = x1.iter().map(|p| camera1.unproject(*p)).collect();
    let rays2: Vec<DVec3> = x2.iter().map(|p| camera2.unproject(*p)).collect();
    let inlier_idx: Vec<usize> = (0..n).filter(|&i| ransac.inliers[i]).collect();
    let stride = (inlier_idx.len() / config.cheirality_samples.max(1)).max(1);
    let sample: Vec<usize> = inlier_idx.iter().copied().step_by(stride).collect();
    let s1: Vec<DVec3> = sample.iter().map(|&i| rays1[i]).collect();
    let s2: Vec<DVec3> = sample.iter().map(|&i| rays2[i]).collect();

    let candidates = decompose_essential(&ransac.model.essential);
    let Some(selected) = select_pose(&candidates, &s1, &s2) else {
        return Err(TwoViewError::DegenerateGeometry {
            reason: "no pose candidate places points in front of both cameras".to_string(),
        });
    };
    let (in1, in2): (Vec<DVec3>, Vec<DVec3>) =
        inlier_idx.iter().map(|&i| (rays1[i], rays2[i])).unzip();
    let pose = refine_relative_pose(&selected.pose, &in1, &in2, &config.refinement);

    let center2 = pose.center();
    let mut inliers = vec![false; n];
    let mut angles = Vec::with_capacity(inlier_idx.len());
    for &i in &inlier_idx {
        if let Some(p) = triangulate_normalized(&pose, rays1[i], rays2[i]) {
            if in_front(&pose, p) {
                inliers[i] = true;
                angles.push(triangulation_angle_deg(DVec3::ZERO, center2, p));
            }
        }
    }
    let inlier_count = angles.len();
    if inlier_count < config.ransac.min_inliers {
        return Err(TwoViewError::DegenerateGeometry {
            reason: format!(
                "{inlier_count} inliers in front of both cameras, {} required",
                config.ransac.min_inliers
            ),
        });
    }

    angles.sort_by(|a, b| a.total_cmp(b));
    let median_parallax_deg = angles[angles.len() / 2];
    if median_parallax_deg < config.min_parallax_deg {
        return Err(TwoViewError::DegenerateGeometry {
            reason: format!(
                "median parallax {median_parallax_deg:.3} deg below {:.3} deg (rotation only?)",
                config.min_parallax_deg
            ),
        });
    }

    log::debug!(
        "two-view: {inlier_count}/{n} inliers, cheirality {:.2}, median parallax {median_parallax_deg:.2} deg",
        selected.confidence
    );

    let essential = essential_from_motion(&pose.rotation, &pose.translation);
    let fundamental =
        fundamental_from_essential(&essential, &camera1.matrix(), &camera2.matrix());
    Ok(RelativePose {
        pose,
        essential,
        fundamental,
        inliers,
        inlier_count,
        confidence: selected.confidence,
        median_parallax_deg,
    })
}

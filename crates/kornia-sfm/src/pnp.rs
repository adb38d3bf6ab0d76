//! Perspective-n-Point pose estimation for registering a new image against known structure.

use crate::camera::{CameraPose, PinholeCamera, MIN_DEPTH};
use crate::linalg::{closest_rotation, exp_so3, mat3_from_row_major, right_nullspace, skew, svd3};
use crate::pose::adaptive_iterations;
use faer::prelude::SpSolver;
use faer::Mat;
use glam::{DVec2, DVec3};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};

/// Minimal sample of the linear solver.
pub const PNP_SAMPLE_SIZE: usize = 6;

/// Error types for PnP solvers.
#[derive(Debug, thiserror::Error)]
pub enum PnPError {
    /// Not enough 2D-3D correspondences for the solver.
    #[error("PnP solver requires at least {required} 2D-3D correspondences, got {actual}")]
    InsufficientCorrespondences {
        /// Minimum number of correspondences required by the solver.
        required: usize,
        /// Actual number of correspondences provided.
        actual: usize,
    },
    /// Mismatched array lengths.
    #[error("mismatched array lengths: {world} world points, {image} image points")]
    MismatchedArrayLengths {
        /// Number of world points.
        world: usize,
        /// Number of image points.
        image: usize,
    },
    /// RANSAC did not find enough inliers.
    #[error("PnP RANSAC found {found} inliers, {required} required")]
    InsufficientInliers {
        /// Minimum number of inliers.
        required: usize,
        /// Inliers of the best hypothesis.
        found: usize,
    },
    /// The point configuration does not constrain the pose.
    #[error("degenerate 2D-3D configuration")]
    Degenerate,
}

/// Parameters for RANSAC over PnP.
#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct PnPRansacParams {
    /// Maximum number of RANSAC iterations.
    pub max_iterations: usize,
    /// Pixel error threshold to classify an observation as an inlier.
    pub reproj_threshold_px: f64,
    /// Desired probability that at least one sample set is outlier-free.
    pub confidence: f64,
    /// Minimum number of inliers to accept the pose.
    pub min_inliers: usize,
    /// Optional fixed seed for reproducible sampling.
    pub random_seed: Option<u64>,
}

impl Default for PnPRansacParams {
    fn default() -> Self {
        Self {
            max_iterations: 1000,
            reproj_threshold_px: 4.0,
            confidence: 0.99,
            min_inliers: 15,
            random_seed: Some(0),
        }
    }
}

/// Parameters controlling the LM pose refinement.
#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct LMRefineParams {
    /// Maximum number of LM iterations.
    pub max_iterations: usize,
    /// Convergence threshold on relative cost change.
    pub cost_tolerance: f64,
    /// Initial damping factor (lambda).
    pub initial_lambda: f64,
}

impl Default for LMRefineParams {
    fn default() -> Self {
        Self {
            max_iterations: 20,
            cost_tolerance: 1e-6,
            initial_lambda: 1e-3,
        }
    }
}

/// Result of robust PnP.
#[derive(Clone, Debug)]
pub struct PnPResult {
    /// World-to-camera pose.
    pub pose: CameraPose,
    /// Indices of inlier correspondences.
    pub inliers: Vec<usize>,
    /// Root-mean-square reprojection error over the inliers, in pixels.
    pub reproj_rmse: f64,
    /// Number of RANSAC iterations performed.
    pub iterations: usize,
}

/// Linear pose from six or more 2D-3D correspondences (normalized DLT).
///
/// World points are centred and scaled before building the system; the 3x3 block of the
/// recovered projection is projected onto the rotation group.
pub fn solve_pnp_dlt(
    world: &[DVec3],
    image: &[DVec2],
    camera: &PinholeCamera,
) -> Result<CameraPose, PnPError> {
    if world.len() != image.len() {
        return Err(PnPError::MismatchedArrayLengths {
            world: world.len(),
            image: image.len(),
        });
    }
    let n = world.len();
    if n < PNP_SAMPLE_SIZE {
        return Err(PnPError::InsufficientCorrespondences {
            required: PNP_SAMPLE_SIZE,
            actual: n,
        });
    }

    let centroid = world.iter().fold(DVec3::ZERO, |a, p| a + *p) / n as f64;
    let mean_dist = world.iter().map(|p| p.distance(centroid)).sum::<f64>() / n as f64;
    if mean_dist <= f64::EPSILON {
        return Err(PnPError::Degenerate);
    }
    let scale = 3f64.sqrt() / mean_dist;

    let mut a = Mat::<f64>::zeros(2 * n, 12);
    for (i, (x, px)) in world.iter().zip(image.iter()).enumerate() {
        let xn = (*x - centroid) * scale;
        let ray = camera.unproject(*px);
        let h = [xn.x, xn.y, xn.z, 1.0];
        for (j, hj) in h.iter().enumerate() {
            a.write(2 * i, j, *hj);
            a.write(2 * i, 8 + j, -ray.x * hj);
            a.write(2 * i + 1, 4 + j, *hj);
            a.write(2 * i + 1, 8 + j, -ray.y * hj);
        }
    }
    let p = right_nullspace(&a, 1).pop().ok_or(PnPError::Degenerate)?;

    // P_n = [M | p4] acts on normalized points
    let mut m = mat3_from_row_major(&[p[0], p[1], p[2], p[4], p[5], p[6], p[8], p[9], p[10]]);
    let mut p4 = DVec3::new(p[3], p[7], p[11]);
    if m.determinant() < 0.0 {
        m = -m;
        p4 = -p4;
    }
    let (_, s, _) = svd3(&m);
    let lambda = (s.x + s.y + s.z) / 3.0;
    if !lambda.is_finite() || lambda <= f64::EPSILON {
        return Err(PnPError::Degenerate);
    }
    let r = closest_rotation(&m);

    // undo the normalization: x_c ~ M (s (X - c)) + p4
    let rotation = r;
    let translation = p4 / (lambda * scale) - rotation * centroid;
    Ok(CameraPose::new(rotation, translation))
}

fn classify_inliers(
    world: &[DVec3],
    image: &[DVec2],
    camera: &PinholeCamera,
    pose: &CameraPose,
    threshold: f64,
) -> (Vec<usize>, f64) {
    let mut inliers = Vec::new();
    let mut sq = 0.0;
    for (i, (x, px)) in world.iter().zip(image.iter()).enumerate() {
        if let Some(e) = pose.reprojection_error(camera, *x, *px) {
            if e <= threshold {
                inliers.push(i);
                sq += e * e;
            }
        }
    }
    (inliers, sq)
}

fn pnp_cost(world: &[DVec3], image: &[DVec2], camera: &PinholeCamera, pose: &CameraPose) -> f64 {
    world
        .iter()
        .zip(image.iter())
        .map(|(x, px)| match pose.project(camera, *x) {
            Some(uv) => (uv - *px).length_squared(),
            None => f64::INFINITY,
        })
        .sum()
}

/// Refine a pose by Levenberg-Marquardt on the pixel reprojection error.
///
/// The rotation is updated on the left, `R <- exp(w) R`, and the translation additively.
pub fn refine_pose_lm(
    world: &[DVec3],
    image: &[DVec2],
    camera: &PinholeCamera,
    initial: &CameraPose,
    params: &LMRefineParams,
) -> CameraPose {
    let mut pose = *initial;
    let mut cost = pnp_cost(world, image, camera, &pose);
    let mut lambda = params.initial_lambda;
    for _ in 0..params.max_iterations {
        let mut h = Mat::<f64>::zeros(6, 6);
        let mut g = Mat::<f64>::zeros(6, 1);
        for (x, px) in world.iter().zip(image.iter()) {
            let rx = pose.rotation * *x;
            let pc = rx + pose.translation;
            let Some(uv) = camera.project(pc) else {
                continue;
            };
            let r = uv - *px;
            // d(pc)/d(w) = -[R X]x, d(pc)/d(t) = I
            let dw = -skew(rx);
            let rows = camera.projection_jacobian(pc);
            let mut jac = [[0.0; 6]; 2];
            for (k, row) in rows.iter().enumerate() {
                let jw = dw.transpose() * *row;
                jac[k] = [jw.x, jw.y, jw.z, row.x, row.y, row.z];
            }
            for a in 0..6 {
                g.write(a, 0, g.read(a, 0) + jac[0][a] * r.x + jac[1][a] * r.y);
                for b in 0..6 {
                    let hab = jac[0][a] * jac[0][b] + jac[1][a] * jac[1][b];
                    h.write(a, b, h.read(a, b) + hab);
                }
            }
        }

        let mut accepted = false;
        while lambda < 1e12 {
            let mut damped = h.clone();
            for d in 0..6 {
                damped.write(d, d, h.read(d, d) + lambda * h.read(d, d).max(1e-9));
            }
            let delta = damped.partial_piv_lu().solve(&g);
            let step = |k: usize| -delta.read(k, 0);
            let omega = DVec3::new(step(0), step(1), step(2));
            let candidate = CameraPose::new(
                closest_rotation(&(exp_so3(omega) * pose.rotation)),
                pose.translation + DVec3::new(step(3), step(4), step(5)),
            );
            let new_cost = pnp_cost(world, image, camera, &candidate);
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

/// Solve PnP robustly: DLT inside RANSAC, linear refit on the inliers, then LM refinement.
///
/// Hypotheses placing any sampled point behind the camera are discarded.
pub fn solve_pnp_ransac(
    world: &[DVec3],
    image: &[DVec2],
    camera: &PinholeCamera,
    params: &PnPRansacParams,
    refine: &LMRefineParams,
) -> Result<PnPResult, PnPError> {
    let n = world.len();
    if n != image.len() {
        return Err(PnPError::MismatchedArrayLengths {
            world: n,
            image: image.len(),
        });
    }
    if n < PNP_SAMPLE_SIZE {
        return Err(PnPError::InsufficientCorrespondences {
            required: PNP_SAMPLE_SIZE,
            actual: n,
        });
    }
    let threshold = params.reproj_threshold_px;

    let mut rng = match params.random_seed {
        Some(seed) => StdRng::seed_from_u64(seed),
        None => StdRng::seed_from_u64(rand::rng().random()),
    };

    let mut best: Option<(CameraPose, Vec<usize>, f64)> = None;
    let mut iterations = 0;
    let mut required = params.max_iterations;
    while iterations < required {
        iterations += 1;
        let sample = rand::seq::index::sample(&mut rng, n, PNP_SAMPLE_SIZE).into_vec();
        let w: Vec<DVec3> = sample.iter().map(|&i| world[i]).collect();
        let x: Vec<DVec2> = sample.iter().map(|&i| image[i]).collect();
        let pose = match solve_pnp_dlt(&w, &x, camera) {
            Ok(p) => p,
            Err(_) => continue,
        };
        if w.iter().any(|p| pose.depth(*p) <= MIN_DEPTH) {
            continue;
        }
        let (inliers, sq) = classify_inliers(world, image, camera, &pose, threshold);
        let is_better = match &best {
            None => true,
            Some((_, b, bsq)) => inliers.len() > b.len() || (inliers.len() == b.len() && sq < *bsq),
        };
        if is_better {
            required = required.min(adaptive_iterations(
                inliers.len() as f64 / n as f64,
                PNP_SAMPLE_SIZE,
                params.confidence,
                params.max_iterations,
            ));
            best = Some((pose, inliers, sq));
        }
    }

    let (mut pose, mut inliers, _) = best.ok_or(PnPError::InsufficientInliers {
        required: params.min_inliers,
        found: 0,
    })?;
    if inliers.len() < params.min_inliers.max(PNP_SAMPLE_SIZE) {
        return Err(PnPError::InsufficientInliers {
            required: params.min_inliers.max(PNP_SAMPLE_SIZE),
            found: inliers.len(),
        });
    }

    let w: Vec<DVec3> = inliers.iter().map(|&i| world[i]).collect();
    let x: Vec<DVec2> = inliers.iter().map(|&i| image[i]).collect();
    if let Ok(refit) = solve_pnp_dlt(&w, &x, camera) {
        if pnp_cost(&w, &x, camera, &refit) < pnp_cost(&w, &x, camera, &pose) {
            pose = refit;
        }
    }
    pose = refine_pose_lm(&w, &x, camera, &pose, refine);
    let (final_inliers, _) = classify_inliers(world, image, camera, &pose, threshold);
    if final_inliers.len() >= inliers.len() {
        inliers = final_inliers;
    }
    let sq: f64 = inliers
        .iter()
        .filter_map(|&i| pose.reprojection_error(camera, world[i], image[i]))
        .map(|e| e * e)
        .sum();
    let reproj_rmse = (sq / inliers.len() as f64).sqrt();

    log::debug!(
        "pnp: {}/{} inliers after {} iterations, rmse {:.3} px",
        inliers.len(),
        n,
        iterations,
        reproj_rmse
    );

    Ok(PnPResult {
        pose,
        inliers,
        reproj_rmse,
        iterations,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::linalg::rotation_angle;

    fn camera() -> PinholeCamera {
        PinholeCamera::new(520.0, 520.0, 320.0, 240.0, 640, 480)
    }

    fn scene(pose: &CameraPose, n: usize, seed: u64) -> (Vec<DVec3>, Vec<DVec2>) {
        let cam = camera();
        let mut rng = StdRng::seed_from_u64(seed);
        let mut world = Vec::new();
        let mut image = Vec::new();
        while world.len() < n {
            let p = DVec3::new(
                rng.random_range(-1.5..1.5),
                rng.random_range(-1.0..1.0),
                rng.random_range(4.0..7.0),
            );
            if let Some(uv) = pose.project(&cam, p) {
                world.push(p);
                image.push(uv);
            }
        }
        (world, image)
    }

    #[test]
    fn test_dlt_exact() -> Result<(), Box<dyn std::error::Error>> {
        let truth = CameraPose::new(
            exp_so3(DVec3::new(0.1, -0.2, 0.05)),
            DVec3::new(0.3, -0.1, 0.5),
        );
        let (world, image) = scene(&truth, 12, 1);
        let pose = solve_pnp_dlt(&world, &image, &camera())?;
        let r_error = pose.rotation * truth.rotation.transpose();
        assert!(rotation_angle(&r_error) < 1e-6);
        assert!(pose.translation.distance(truth.translation) < 1e-6);
        Ok(())
    }

    #[test]
    fn test_ransac_with_outliers_and_noise() -> Result<(), Box<dyn std::error::Error>> {
        let truth = CameraPose::new(
            exp_so3(DVec3::new(-0.05, 0.25, 0.0)),
            DVec3::new(-0.8, 0.1, 0.3),
        );
        let (world, mut image) = scene(&truth, 120, 2);
        let mut rng = StdRng::seed_from_u64(9);
        for (i, px) in image.iter_mut().enumerate() {
            if i % 4 == 0 {
                *px = DVec2::new(rng.random_range(0.0..640.0), rng.random_range(0.0..480.0));
            } else {
                *px += DVec2::new(rng.random_range(-0.5..0.5), rng.random_range(-0.5..0.5));
            }
        }
        let res = solve_pnp_ransac(
            &world,
            &image,
            &camera(),
            &PnPRansacParams::default(),
            &LMRefineParams::default(),
        )?;
        assert!(res.inliers.len() >= 85);
        assert!(res.reproj_rmse < 1.0);
        let r_error = res.pose.rotation * truth.rotation.transpose();
        assert!(rotation_angle(&r_error).to_degrees() < 0.5);
        assert!(res.pose.center().distance(truth.center()) < 0.05);
        Ok(())
    }

    #[test]
    fn test_lm_reduces_error() {
        let truth = CameraPose::new(exp_so3(DVec3::Y * 0.1), DVec3::X * 0.2);
        let (world, image) = scene(&truth, 30, 3);
        let start = CameraPose::new(
            exp_so3(DVec3::new(0.02, -0.01, 0.01)) * truth.rotation,
            truth.translation + DVec3::new(0.05, -0.03, 0.02),
        );
        let cam = camera();
        let refined = refine_pose_lm(&world, &image, &cam, &start, &LMRefineParams::default());
        assert!(pnp_cost(&world, &image, &cam, &refined) < 1e-6);
    }

    #[test]
    fn test_insufficient_correspondences() {
        let (world, image) = scene(&CameraPose::IDENTITY, 5, 4);
        assert!(matches!(
            solve_pnp_dlt(&world, &image, &camera()),
            Err(PnPError::InsufficientCorrespondences {
                required: 6,
                actual: 5
            })
        ));
    }
}

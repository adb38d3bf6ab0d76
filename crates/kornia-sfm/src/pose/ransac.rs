use crate::camera::PinholeCamera;
use crate::pose::essential::{
    enforce_essential_constraints, essential_5point, essential_from_fundamental,
    fundamental_from_essential,
};
use crate::pose::fundamental::{fundamental_8point, symmetric_epipolar_distance};
use crate::pose::twoview::TwoViewError;
use glam::{DMat3, DVec2, DVec3};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};

// trials evaluated in parallel between two adaptive-stopping checks
const TRIAL_BATCH: usize = 64;

/// Minimal solver used inside the RANSAC loop.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MinimalSolver {
    /// Normalized 8-point fundamental matrix in pixel coordinates (uncalibrated).
    EightPoint,
    /// 5-point essential matrix in normalized coordinates (calibrated).
    #[default]
    FivePoint,
}

impl MinimalSolver {
    /// Number of correspondences in a minimal sample.
    pub fn sample_size(&self) -> usize {
        match self {
            MinimalSolver::EightPoint => 8,
            MinimalSolver::FivePoint => 5,
        }
    }
}

/// Parameters for RANSAC model estimation.
#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct RansacParams {
    /// Maximum number of RANSAC iterations.
    pub max_iterations: usize,
    /// Inlier threshold on the symmetric epipolar distance, in pixels.
    pub threshold_px: f64,
    /// Image size (largest side, pixels) at which `threshold_px` applies unscaled.
    pub reference_resolution: f64,
    /// Target probability of drawing at least one all-inlier sample.
    pub confidence: f64,
    /// Minimum number of inliers required for acceptance.
    pub min_inliers: usize,
    /// Optional RNG seed for deterministic runs.
    pub random_seed: Option<u64>,
}

impl Default for RansacParams {
    fn default() -> Self {
        Self {
            max_iterations: 2000,
            threshold_px: 1.0,
            reference_resolution: 1024.0,
            confidence: 0.99,
            min_inliers: 20,
            random_seed: Some(0),
        }
    }
}

impl RansacParams {
    /// Set the iteration cap.
    pub fn with_max_iterations(mut self, max_iterations: usize) -> Self {
        self.max_iterations = max_iterations;
        self
    }

    /// Set the pixel threshold.
    pub fn with_threshold_px(mut self, threshold_px: f64) -> Self {
        self.threshold_px = threshold_px;
        self
    }

    /// Set the minimum inlier count.
    pub fn with_min_inliers(mut self, min_inliers: usize) -> Self {
        self.min_inliers = min_inliers;
        self
    }

    /// Set the RNG seed, `None` draws one from the thread RNG.
    pub fn with_random_seed(mut self, random_seed: Option<u64>) -> Self {
        self.random_seed = random_seed;
        self
    }

    /// Inlier threshold for an image of the given size.
    ///
    /// The threshold grows linearly with the largest image side beyond the reference
    /// resolution and is never reduced below `threshold_px`.
    pub fn threshold_for(&self, camera: &PinholeCamera) -> f64 {
        let side = camera.width.max(camera.height) as f64;
        self.threshold_px * (side / self.reference_resolution).max(1.0)
    }
}

/// Result of a RANSAC model fit.
#[derive(Clone, Debug)]
pub struct RansacResult<M> {
    /// Estimated model.
    pub model: M,
    /// Per-correspondence inlier mask.
    pub inliers: Vec<bool>,
    /// Total inlier count.
    pub inlier_count: usize,
    /// Sum of squared inlier residuals (lower is better).
    pub score: f64,
    /// Number of hypotheses drawn.
    pub iterations: usize,
    /// Inlier threshold that was applied, in pixels.
    pub threshold: f64,
}

/// An epipolar model expressed in both pixel and normalized coordinates.
#[derive(Clone, Copy, Debug)]
pub struct EpipolarModel {
    /// Fundamental matrix, `x2^T F x1 = 0` in pixels.
    pub fundamental: DMat3,
    /// Essential matrix, `x2^T E x1 = 0` in normalized coordinates.
    pub essential: DMat3,
}

/// Number of iterations needed to draw one all-inlier sample with the given confidence.
///
/// `N = log(1 - p) / log(1 - w^s)`, clamped to `[1, max_iterations]`.
pub fn adaptive_iterations(
    inlier_ratio: f64,
    sample_size: usize,
    confidence: f64,
    max_iterations: usize,
) -> usize {
    let w = inlier_ratio.clamp(0.0, 1.0);
    let good = w.powi(sample_size as i32);
    if good >= 1.0 - f64::EPSILON {
        return 1;
    }
    if good <= f64::EPSILON {
        return max_iterations;
    }
    let n = (1.0 - confidence.clamp(0.0, 1.0 - 1e-12)).ln() / (1.0 - good).ln();
    if !n.is_finite() {
        return max_iterations;
    }
    (n.ceil() as usize).clamp(1, max_iterations)
}

struct Problem<'a> {
    x1: &'a [DVec2],
    x2: &'a [DVec2],
    n1: Vec<DVec3>,
    n2: Vec<DVec3>,
    k1: DMat3,
    k2: DMat3,
    threshold: f64,
}

impl Problem<'_> {
    fn from_essential(&self, e: DMat3) -> EpipolarModel {
        EpipolarModel {
            fundamental: fundamental_from_essential(&e, &self.k1, &self.k2),
            essential: e,
        }
    }

    fn from_fundamental(&self, f: DMat3) -> EpipolarModel {
        let e = essential_from_fundamental(&f, &self.k1, &self.k2);
        EpipolarModel {
            fundamental: f,
            essential: enforce_essential_constraints(&e),
        }
    }

    fn fit_minimal(&self, solver: MinimalSolver, sample: &[usize]) -> Vec<EpipolarModel> {
        match solver {
            MinimalSolver::EightPoint => {
                let s1: Vec<DVec2> = sample.iter().map(|&i| self.x1[i]).collect();
                let s2: Vec<DVec2> = sample.iter().map(|&i| self.x2[i]).collect();
                fundamental_8point(&s1, &s2)
                    .map(|f| vec![self.from_fundamental(f)])
                    .unwrap_or_default()
            }
            MinimalSolver::FivePoint => {
                let s1: Vec<DVec3> = sample.iter().map(|&i| self.n1[i]).collect();
                let s2: Vec<DVec3> = sample.iter().map(|&i| self.n2[i]).collect();
                let essentials = essential_5point(&s1, &s2).unwrap_or_default();
                essentials
                    .into_iter()
                    .map(|e| self.from_essential(e))
                    .collect()
            }
        }
    }

    // least-squares refit on every inlier
    fn fit_all(&self, solver: MinimalSolver, inliers: &[bool]) -> Option<EpipolarModel> {
        let idx: Vec<usize> = (0..inliers.len()).filter(|&i| inliers[i]).collect();
        match solver {
            MinimalSolver::EightPoint => {
                let s1: Vec<DVec2> = idx.iter().map(|&i| self.x1[i]).collect();
                let s2: Vec<DVec2> = idx.iter().map(|&i| self.x2[i]).collect();
                fundamental_8point(&s1, &s2)
                    .ok()
                    .map(|f| self.from_fundamental(f))
            }
            MinimalSolver::FivePoint => {
                let s1: Vec<DVec2> = idx.iter().map(|&i| self.n1[i].truncate()).collect();
                let s2: Vec<DVec2> = idx.iter().map(|&i| self.n2[i].truncate()).collect();
                fundamental_8point(&s1, &s2)
                    .ok()
                    .map(|e| self.from_essential(enforce_essential_constraints(&e)))
            }
        }
    }

    fn score(&self, model: &EpipolarModel) -> (usize, f64) {
        let mut count = 0;
        let mut score = 0.0;
        for (a, b) in self.x1.iter().zip(self.x2.iter()) {
            let d = symmetric_epipolar_distance(&model.fundamental, a, b);
            if d <= self.threshold {
                count += 1;
                score += d * d;
            }
        }
        (count, score)
    }

    fn inlier_mask(&self, model: &EpipolarModel) -> Vec<bool> {
        self.x1
            .iter()
            .zip(self.x2.iter())
            .map(|(a, b)| symmetric_epipolar_distance(&model.fundamental, a, b) <= self.threshold)
            .collect()
    }
}

#[derive(Clone, Copy)]
struct Hypothesis {
    model: EpipolarModel,
    count: usize,
    score: f64,
    iteration: usize,
}

// strict total order so that the parallel reduction is deterministic
fn better(a: Hypothesis, b: Hypothesis) -> Hypothesis {
    let key = |h: &Hypothesis| (std::cmp::Reverse(h.count), h.score, h.iteration);
    match key(&a).partial_cmp(&key(&b)) {
        Some(std::cmp::Ordering::Greater) => b,
        _ => a,
    }
}

fn trial_rng(seed: u64, iteration: usize) -> StdRng {
    let mix = (iteration as u64 + 1).wrapping_mul(0x9E37_79B9_7F4A_7C15);
    StdRng::seed_from_u64(seed ^ mix)
}

/// Estimate the epipolar geometry of an image pair with RANSAC.
///
/// Trials are evaluated in parallel batches; each trial draws its sample from an RNG
/// derived from the seed and the trial index so that results do not depend on thread
/// scheduling. The iteration budget shrinks as the best inlier ratio improves. The best
/// hypothesis is finally refit by least squares on all of its inliers.
///
/// # Errors
///
/// [`TwoViewError::InsufficientInliers`] when there are fewer correspondences than a
/// minimal sample, or when no hypothesis reaches `params.min_inliers`.
pub fn ransac_epipolar(
    x1: &[DVec2],
    x2: &[DVec2],
    camera1: &PinholeCamera,
    camera2: &PinholeCamera,
    solver: MinimalSolver,
    params: &RansacParams,
) -> Result<RansacResult<EpipolarModel>, TwoViewError> {
    if x1.len() != x2.len() {
        return Err(TwoViewError::LengthMismatch {
            x1: x1.len(),
            x2: x2.len(),
        });
    }
    let n = x1.len();
    let sample_size = solver.sample_size();
    if n < sample_size {
        return Err(TwoViewError::InsufficientInliers {
            required: sample_size,
            found: n,
        });
    }

    let problem = Problem {
        x1,
        x2,
        n1: x1.iter().map(|p| camera1.unproject(*p)).collect(),
        n2: x2.iter().map(|p| camera2.unproject(*p)).collect(),
        k1: camera1.matrix(),
        k2: camera2.matrix(),
        threshold: params
            .threshold_for(camera1)
            .max(params.threshold_for(camera2)),
    };

    let seed = params.random_seed.unwrap_or_else(|| rand::rng().random());

    let mut best: Option<Hypothesis> = None;
    let mut iterations = 0usize;
    let mut budget = params.max_iterations;
    while iterations < budget {
        let batch = (budget - iterations).min(TRIAL_BATCH);
        let batch_best = (iterations..iterations + batch)
            .into_par_iter()
            .filter_map(|it| {
                let mut rng = trial_rng(seed, it);
                let sample = rand::seq::index::sample(&mut rng, n, sample_size).into_vec();
                problem
                    .fit_minimal(solver, &sample)
                    .into_iter()
                    .map(|model| {
                        let (count, score) = problem.score(&model);
                        Hypothesis {
                            model,
                            count,
                            score,
                            iteration: it,
                        }
                    })
                    .reduce(better)
            })
            .reduce_with(better);
        iterations += batch;

        if let Some(h) = batch_best {
            let improved = best.map_or(true, |b| better(h, b).iteration == h.iteration);
            if improved {
                best = Some(h);
                let ratio = h.count as f64 / n as f64;
                budget = budget.min(adaptive_iterations(
                    ratio,
                    sample_size,
                    params.confidence,
                    params.max_iterations,
                ));
            }
        }
    }

    let best = match best {
        Some(b) if b.count >= params.min_inliers => b,
        other => {
            let found = other.map_or(0, |b| b.count);
            log::debug!(
                "ransac: best hypothesis has {found} inliers after {iterations} iterations"
            );
            return Err(TwoViewError::InsufficientInliers {
                required: params.min_inliers,
                found,
            });
        }
    };

    let mut inliers = problem.inlier_mask(&best.model);
    let mut model = best.model;
    let (mut inlier_count, mut score) = (best.count, best.score);
    if let Some(refit) = problem.fit_all(solver, &inliers) {
        let (count, s) = problem.score(&refit);
        if count >= inlier_count {
            model = refit;
            inliers = problem.inlier_mask(&refit);
            inlier_count = count;
            score = s;
        }
    }

    log::debug!(
        "ransac: {inlier_count}/{n} inliers after {iterations} iterations (threshold {:.2} px)",
        problem.threshold
    );

    Ok(RansacResult {
        model,
        inliers,
        inlier_count,
        score,
        iterations,
        threshold: problem.threshold,
    })
}

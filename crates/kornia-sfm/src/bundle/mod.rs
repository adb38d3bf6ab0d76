//! Sparse bundle adjustment.
//!
//! Jointly refines the registered camera poses and the track points of a
//! [`Reconstruction`] by minimizing the robust reprojection error with
//! Levenberg-Marquardt. The normal equations are reduced onto the cameras with the
//! Schur complement over the 3x3 point blocks, so the dense system that gets factored
//! has size `6 x (cameras - 1)`.
//!
//! The gauge is fixed by holding the first registered camera constant and, once the
//! solver stops, rescaling the scene about that camera so the distance between the first
//! two registered cameras keeps its initial value. Rotations are updated on the left,
//! `R <- exp(w) R`.

mod losses;

pub use losses::{LossFunction, RobustLoss};

use crate::camera::{CameraPose, PinholeCamera};
use crate::linalg::{closest_rotation, exp_so3, skew};
use crate::reconstruction::{Reconstruction, ReconstructionError, TrackId};
use faer::prelude::SpSolver;
use faer::Mat;
use glam::{DMat3, DVec2, DVec3};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};

/// Errors raised by [`bundle_adjust`].
#[derive(Debug, thiserror::Error)]
pub enum BundleAdjustmentError {
    /// Every damping increase failed to reduce the cost; the reconstruction is left untouched.
    #[error("optimizer diverged after {rejected_steps} rejected steps at cost {cost}")]
    OptimizerDivergence {
        /// Number of consecutive rejected steps.
        rejected_steps: usize,
        /// Cost of the last accepted state.
        cost: f64,
    },
    /// The starting reconstruction has an observation that does not project.
    #[error("initial cost is not finite")]
    InvalidInitialState,
    /// Writing the refined state back failed.
    #[error(transparent)]
    Reconstruction(#[from] ReconstructionError),
}

/// Why the optimizer stopped.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum TerminationReason {
    /// The relative cost decrease fell below the tolerance.
    CostConverged,
    /// The gradient vanished.
    GradientConverged,
    /// The iteration budget ran out.
    MaxIterations,
    /// There were no observations to optimize.
    NothingToOptimize,
}

/// Parameters of [`bundle_adjust`].
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BundleAdjusterParams {
    /// Maximum number of accepted or attempted iterations.
    pub max_iterations: usize,
    /// Relative cost decrease below which the optimizer stops.
    pub cost_tolerance: f64,
    /// Absolute gradient magnitude below which the optimizer stops.
    pub gradient_tolerance: f64,
    /// Robust loss applied to each squared pixel residual.
    pub loss: LossFunction,
    /// Initial damping.
    pub lambda_init: f64,
    /// Damping multiplier on rejection and divisor on acceptance.
    pub lambda_factor: f64,
    /// Damping above which the optimizer gives up.
    pub lambda_max: f64,
    /// Consecutive cost increases tolerated before reporting divergence.
    pub max_consecutive_rejections: usize,
}

impl Default for BundleAdjusterParams {
    fn default() -> Self {
        Self {
            max_iterations: 100,
            cost_tolerance: 1e-6,
            gradient_tolerance: 1e-10,
            loss: LossFunction::default(),
            lambda_init: 1e-3,
            lambda_factor: 10.0,
            lambda_max: 1e10,
            max_consecutive_rejections: 10,
        }
    }
}

impl BundleAdjusterParams {
    /// Set the maximum number of iterations.
    pub fn with_max_iterations(mut self, max_iterations: usize) -> Self {
        self.max_iterations = max_iterations;
        self
    }

    /// Set the relative cost tolerance.
    pub fn with_cost_tolerance(mut self, cost_tolerance: f64) -> Self {
        self.cost_tolerance = cost_tolerance;
        self
    }

    /// Set the robust loss.
    pub fn with_loss(mut self, loss: LossFunction) -> Self {
        self.loss = loss;
        self
    }
}

/// Outcome of a successful bundle adjustment.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct BundleAdjustmentReport {
    /// Robust cost before optimization.
    pub initial_cost: f64,
    /// Robust cost after optimization.
    pub final_cost: f64,
    /// RMS pixel error before optimization.
    pub initial_rms: f64,
    /// RMS pixel error after optimization.
    pub final_rms: f64,
    /// Number of iterations run.
    pub iterations: usize,
    /// Why the optimizer stopped.
    pub termination_reason: TerminationReason,
    /// Number of optimized cameras, excluding the fixed one.
    pub num_free_cameras: usize,
    /// Number of optimized points.
    pub num_points: usize,
    /// Number of residual blocks.
    pub num_observations: usize,
}

struct Observation {
    slot: usize,
    point: usize,
    pixel: DVec2,
}

struct Linearized {
    residual: DVec2,
    weight: f64,
    jc: [[f64; 6]; 2],
    jp: [DVec3; 2],
}

#[derive(Clone)]
struct State {
    poses: Vec<CameraPose>,
    points: Vec<DVec3>,
}

struct Problem {
    views: Vec<usize>,
    cameras: Vec<PinholeCamera>,
    free: Vec<Option<usize>>,
    num_free: usize,
    tracks: Vec<TrackId>,
    observations: Vec<Observation>,
    by_point: Vec<Vec<usize>>,
}

/// Reduced camera system plus the point blocks needed for back-substitution.
struct NormalEquations {
    u: Vec<[[f64; 6]; 6]>,
    gc: Vec<[f64; 6]>,
    v: Vec<DMat3>,
    gp: Vec<DVec3>,
    w: Vec<[DVec3; 6]>,
}

struct Step {
    cameras: Vec<[f64; 6]>,
    points: Vec<DVec3>,
}

impl Problem {
    fn new(rec: &Reconstruction<'_>) -> (Self, State) {
        let views: Vec<usize> = rec.registered().to_vec();
        let mut slot_of = vec![None; rec.views().len()];
        let mut free = Vec::with_capacity(views.len());
        let mut poses = Vec::with_capacity(views.len());
        let mut cameras = Vec::with_capacity(views.len());
        for (slot, &view) in views.iter().enumerate() {
            slot_of[view] = Some(slot);
            free.push((slot > 0).then(|| slot - 1));
            poses.push(rec.pose(view).copied().unwrap_or_default());
            cameras.push(*rec.views()[view].camera());
        }

        let mut tracks = Vec::new();
        let mut points = Vec::new();
        let mut observations = Vec::new();
        let mut by_point = Vec::new();
        for (id, track) in rec.tracks() {
            let point = points.len();
            let mut obs = Vec::new();
            for (view, keypoint) in track.observations() {
                let Some(slot) = slot_of[view] else {
                    continue;
                };
                obs.push(observations.len());
                observations.push(Observation {
                    slot,
                    point,
                    pixel: rec.views()[view].keypoint(keypoint),
                });
            }
            tracks.push(id);
            points.push(track.point());
            by_point.push(obs);
        }

        let num_free = views.len().saturating_sub(1);
        (
            Self {
                views,
                cameras,
                free,
                num_free,
                tracks,
                observations,
                by_point,
            },
            State { poses, points },
        )
    }

    fn residual(&self, state: &State, obs: &Observation) -> Option<DVec2> {
        state.poses[obs.slot]
            .project(&self.cameras[obs.slot], state.points[obs.point])
            .map(|uv| uv - obs.pixel)
    }

    fn cost(&self, state: &State, loss: &dyn RobustLoss) -> f64 {
        self.observations
            .par_iter()
            .map(|o| match self.residual(state, o) {
                Some(r) => loss.cost(r.length_squared()),
                None => f64::INFINITY,
            })
            .sum()
    }

    fn rms(&self, state: &State) -> f64 {
        if self.observations.is_empty() {
            return 0.0;
        }
        let sum: f64 = self
            .observations
            .par_iter()
            .filter_map(|o| self.residual(state, o))
            .map(|r| r.length_squared())
            .sum();
        (sum / self.observations.len() as f64).sqrt()
    }

    fn linearize(&self, state: &State, loss: &dyn RobustLoss) -> Option<Vec<Linearized>> {
        self.observations
            .par_iter()
            .map(|o| {
                let pose = &state.poses[o.slot];
                let camera = &self.cameras[o.slot];
                let rx = pose.rotation * state.points[o.point];
                let pc = rx + pose.translation;
                let uv = camera.project(pc)?;
                let residual = uv - o.pixel;
                // d(pc)/d(w) = -[R X]x, d(pc)/d(t) = I, d(pc)/d(X) = R
                let dw = -skew(rx);
                let rows = camera.projection_jacobian(pc);
                let mut jc = [[0.0; 6]; 2];
                let mut jp = [DVec3::ZERO; 2];
                for (k, row) in rows.iter().enumerate() {
                    let jw = dw.transpose() * *row;
                    jc[k] = [jw.x, jw.y, jw.z, row.x, row.y, row.z];
                    jp[k] = pose.rotation.transpose() * *row;
                }
                Some(Linearized {
                    residual,
                    weight: loss.weight(residual.length_squared()),
                    jc,
                    jp,
                })
            })
            .collect()
    }

    fn normal_equations(&self, lin: &[Linearized]) -> NormalEquations {
        let mut u = vec![[[0.0; 6]; 6]; self.num_free];
        let mut gc = vec![[0.0; 6]; self.num_free];
        let mut v = vec![DMat3::ZERO; self.by_point.len()];
        let mut gp = vec![DVec3::ZERO; self.by_point.len()];
        let mut w = vec![[DVec3::ZERO; 6]; self.observations.len()];

        for (idx, (obs, l)) in self.observations.iter().zip(lin.iter()).enumerate() {
            let r = [l.residual.x, l.residual.y];
            for k in 0..2 {
                let jp = l.jp[k];
                v[obs.point] += outer(jp) * l.weight;
                gp[obs.point] += jp * (l.weight * r[k]);
            }
            let Some(cam) = self.free[obs.slot] else {
                continue;
            };
            for a in 0..6 {
                for k in 0..2 {
                    gc[cam][a] += l.weight * l.jc[k][a] * r[k];
                    w[idx][a] += l.jp[k] * (l.weight * l.jc[k][a]);
                }
                for b in 0..6 {
                    u[cam][a][b] += l.weight * (l.jc[0][a] * l.jc[0][b] + l.jc[1][a] * l.jc[1][b]);
                }
            }
        }
        NormalEquations { u, gc, v, gp, w }
    }
}

fn outer(a: DVec3) -> DMat3 {
    DMat3::from_cols(a * a.x, a * a.y, a * a.z)
}

fn damped_inverse(v: &DMat3, lambda: f64) -> DMat3 {
    let diag = DVec3::new(v.x_axis.x, v.y_axis.y, v.z_axis.z);
    let damped = *v + DMat3::from_diagonal(diag * lambda + DVec3::splat(1e-12));
    if damped.determinant().abs() < 1e-300 {
        DMat3::ZERO
    } else {
        damped.inverse()
    }
}

impl NormalEquations {
    fn max_gradient(&self) -> f64 {
        let cams = self.gc.iter().flat_map(|g| g.iter().copied());
        let pts = self.gp.iter().flat_map(|g| g.to_array());
        cams.chain(pts).fold(0.0, |m, x| m.max(x.abs()))
    }

    fn solve(&self, problem: &Problem, lambda: f64) -> Option<Step> {
        let n = 6 * problem.num_free;
        let vinv: Vec<DMat3> = self.v.iter().map(|v| damped_inverse(v, lambda)).collect();

        let mut s = Mat::<f64>::zeros(n, n);
        let mut b = Mat::<f64>::zeros(n, 1);
        for (cam, (u, g)) in self.u.iter().zip(self.gc.iter()).enumerate() {
            for a in 0..6 {
                b.write(6 * cam + a, 0, -g[a]);
                for c in 0..6 {
                    let mut val = u[a][c];
                    if a == c {
                        val += lambda * u[a][a].max(1e-9);
                    }
                    s.write(6 * cam + a, 6 * cam + c, val);
                }
            }
        }

        // S -= W V^-1 W^T, b += W V^-1 gp
        for (point, obs_ids) in problem.by_point.iter().enumerate() {
            let free: Vec<(usize, [DVec3; 6])> = obs_ids
                .iter()
                .filter_map(|&o| {
                    let cam = problem.free[problem.observations[o].slot]?;
                    let y = self.w[o].map(|row| vinv[point].transpose() * row);
                    Some((cam, y))
                })
                .collect();
            for (cam_a, y) in free.iter() {
                for r in 0..6 {
                    let idx = 6 * cam_a + r;
                    b.write(idx, 0, b.read(idx, 0) + y[r].dot(self.gp[point]));
                }
                for &o in obs_ids.iter() {
                    let Some(cam_b) = problem.free[problem.observations[o].slot] else {
                        continue;
                    };
                    for r in 0..6 {
                        for c in 0..6 {
                            let (row, col) = (6 * cam_a + r, 6 * cam_b + c);
                            s.write(row, col, s.read(row, col) - y[r].dot(self.w[o][c]));
                        }
                    }
                }
            }
        }

        let dc = if n == 0 {
            Mat::<f64>::zeros(0, 1)
        } else {
            match s.cholesky(faer::Side::Lower) {
                Ok(chol) => chol.solve(&b),
                Err(_) => s.partial_piv_lu().solve(&b),
            }
        };
        let cameras: Vec<[f64; 6]> = (0..problem.num_free)
            .map(|cam| std::array::from_fn(|a| dc.read(6 * cam + a, 0)))
            .collect();
        if cameras.iter().flatten().any(|x| !x.is_finite()) {
            return None;
        }

        let points: Vec<DVec3> = problem
            .by_point
            .iter()
            .enumerate()
            .map(|(point, obs_ids)| {
                let mut rhs = -self.gp[point];
                for &o in obs_ids {
                    if let Some(cam) = problem.free[problem.observations[o].slot] {
                        for (r, row) in self.w[o].iter().enumerate() {
                            rhs -= *row * cameras[cam][r];
                        }
                    }
                }
                vinv[point] * rhs
            })
            .collect();
        if points.iter().any(|p| !p.is_finite()) {
            return None;
        }
        Some(Step { cameras, points })
    }
}

impl State {
    fn apply(&self, problem: &Problem, step: &Step) -> State {
        let poses = self
            .poses
            .iter()
            .zip(problem.free.iter())
            .map(|(pose, free)| match free {
                Some(cam) => {
                    let d = &step.cameras[*cam];
                    CameraPose::new(
                        closest_rotation(&(exp_so3(DVec3::new(d[0], d[1], d[2])) * pose.rotation)),
                        pose.translation + DVec3::new(d[3], d[4], d[5]),
                    )
                }
                None => *pose,
            })
            .collect();
        let points = self
            .points
            .iter()
            .zip(step.points.iter())
            .map(|(p, d)| *p + *d)
            .collect();
        State { poses, points }
    }

    fn baseline(&self) -> Option<f64> {
        match self.poses.as_slice() {
            [first, second, ..] => Some((second.center() - first.center()).length()),
            _ => None,
        }
    }

    // similarity about the first camera: cost and the first pose are unchanged
    fn rescale_baseline(&mut self, baseline: f64) {
        let Some(current) = self.baseline() else {
            return;
        };
        if current <= f64::EPSILON || baseline <= f64::EPSILON {
            return;
        }
        let scale = baseline / current;
        if (scale - 1.0).abs() <= f64::EPSILON {
            return;
        }
        let origin = self.poses[0].center();
        for pose in self.poses.iter_mut().skip(1) {
            let center = origin + (pose.center() - origin) * scale;
            *pose = CameraPose::new(pose.rotation, -(pose.rotation * center));
        }
        for point in self.points.iter_mut() {
            *point = origin + (*point - origin) * scale;
        }
    }
}

/// Refine all registered poses and track points of `rec` in place.
///
/// On divergence the reconstruction is left exactly as it was.
pub fn bundle_adjust(
    rec: &mut Reconstruction<'_>,
    params: &BundleAdjusterParams,
) -> Result<BundleAdjustmentReport, BundleAdjustmentError> {
    let (problem, mut state) = Problem::new(rec);
    let initial_baseline = state.baseline();
    let loss = &params.loss;

    let initial_cost = problem.cost(&state, loss);
    if !initial_cost.is_finite() {
        return Err(BundleAdjustmentError::InvalidInitialState);
    }
    let initial_rms = problem.rms(&state);
    let mut report = BundleAdjustmentReport {
        initial_cost,
        final_cost: initial_cost,
        initial_rms,
        final_rms: initial_rms,
        iterations: 0,
        termination_reason: TerminationReason::NothingToOptimize,
        num_free_cameras: problem.num_free,
        num_points: problem.tracks.len(),
        num_observations: problem.observations.len(),
    };
    if problem.observations.is_empty() {
        return Ok(report);
    }

    let mut cost = initial_cost;
    let mut lambda = params.lambda_init;
    let mut rejections = 0;
    let mut termination = TerminationReason::MaxIterations;

    'outer: for iteration in 0..params.max_iterations {
        report.iterations = iteration + 1;
        let Some(lin) = problem.linearize(&state, loss) else {
            return Err(BundleAdjustmentError::InvalidInitialState);
        };
        let system = problem.normal_equations(&lin);
        if system.max_gradient() < params.gradient_tolerance {
            termination = TerminationReason::GradientConverged;
            break;
        }

        loop {
            let candidate = system
                .solve(&problem, lambda)
                .map(|step| state.apply(&problem, &step));
            let new_cost = candidate
                .as_ref()
                .map_or(f64::INFINITY, |c| problem.cost(c, loss));

            let improved = new_cost.is_finite() && new_cost < cost;
            if let Some(candidate) = candidate.filter(|_| improved) {
                let relative = (cost - new_cost) / cost.max(f64::MIN_POSITIVE);
                state = candidate;
                cost = new_cost;
                lambda = (lambda / params.lambda_factor).max(1e-12);
                rejections = 0;
                log::trace!(
                    "bundle adjustment iteration {iteration}: cost {cost:.6e}, lambda {lambda:.1e}"
                );
                if relative < params.cost_tolerance {
                    termination = TerminationReason::CostConverged;
                    break 'outer;
                }
                break;
            }

            if new_cost.is_finite() && (new_cost - cost).abs() < params.cost_tolerance * cost {
                termination = TerminationReason::CostConverged;
                break 'outer;
            }

            rejections += 1;
            lambda *= params.lambda_factor;
            if rejections >= params.max_consecutive_rejections || lambda > params.lambda_max {
                log::warn!(
                    "bundle adjustment diverged after {rejections} rejected steps, keeping the prior state"
                );
                return Err(BundleAdjustmentError::OptimizerDivergence {
                    rejected_steps: rejections,
                    cost,
                });
            }
        }
    }

    if let Some(baseline) = initial_baseline {
        state.rescale_baseline(baseline);
    }
    for (slot, &view) in problem.views.iter().enumerate() {
        if problem.free[slot].is_some() {
            rec.set_pose(view, state.poses[slot])?;
        }
    }
    for (idx, &id) in problem.tracks.iter().enumerate() {
        rec.set_point(id, state.points[idx])?;
    }

    report.final_cost = problem.cost(&state, loss);
    report.final_rms = problem.rms(&state);
    report.termination_reason = termination;
    log::debug!(
        "bundle adjustment: {} cameras, {} points, cost {:.4e} -> {:.4e}, rms {:.3} -> {:.3} px ({:?})",
        problem.num_free,
        problem.tracks.len(),
        report.initial_cost,
        report.final_cost,
        report.initial_rms,
        report.final_rms,
        report.termination_reason,
    );
    Ok(report)
}

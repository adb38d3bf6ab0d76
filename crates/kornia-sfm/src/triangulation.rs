use crate::camera::{CameraPose, PinholeCamera, MIN_DEPTH};
use faer::Mat;
use glam::{DMat3, DVec2, DVec3};
use serde::{Deserialize, Serialize};

/// Why a triangulated point was not accepted.
#[derive(Clone, Copy, Debug, PartialEq, thiserror::Error)]
pub enum RejectionReason {
    /// Fewer than two observations.
    #[error("only {found} observation(s)")]
    NotEnoughViews {
        /// Number of observations supplied.
        found: usize,
    },
    /// The linear system has no finite solution.
    #[error("degenerate linear system")]
    Degenerate,
    /// The point lies behind one of the observing cameras.
    #[error("point behind camera of observation {observation}")]
    BehindCamera {
        /// Index of the offending observation.
        observation: usize,
    },
    /// The point reprojects too far from one of its observations.
    #[error("reprojection error {error:.2} px in observation {observation}")]
    ReprojectionError {
        /// Index of the offending observation.
        observation: usize,
        /// Reprojection error in pixels.
        error: f64,
    },
    /// The viewing rays are nearly parallel.
    #[error("triangulation angle {angle_deg:.3} deg too small")]
    LowParallax {
        /// Largest angle between viewing rays in degrees.
        angle_deg: f64,
    },
}

/// Errors raised by the triangulator.
#[derive(Debug, thiserror::Error)]
pub enum TriangulationError {
    /// The point failed the acceptance policy and is excluded.
    #[error("triangulation rejected: {0}")]
    Rejected(#[from] RejectionReason),
}

/// Acceptance policy of the triangulator.
#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct TriangulationParams {
    /// Maximum reprojection error in every view, in pixels.
    pub max_reprojection_error: f64,
    /// Minimum angle between the viewing rays of at least one view pair, in degrees.
    pub min_triangulation_angle_deg: f64,
    /// Gauss-Newton iterations of the multi-view refinement.
    pub refine_iterations: usize,
}

impl Default for TriangulationParams {
    fn default() -> Self {
        Self {
            max_reprojection_error: 4.0,
            min_triangulation_angle_deg: 1.0,
            refine_iterations: 10,
        }
    }
}

/// One observation of a point: the observing camera and the measured pixel.
#[derive(Clone, Copy, Debug)]
pub struct ViewObservation<'a> {
    /// Intrinsics of the observing camera.
    pub camera: &'a PinholeCamera,
    /// World-to-camera pose of the observing camera.
    pub pose: &'a CameraPose,
    /// Observed keypoint in pixels.
    pub pixel: DVec2,
}

/// Linear triangulation (DLT) from two or more views.
///
/// Each view contributes the two rows of `[x]x P X = 0` written in normalized image
/// coordinates; the homogeneous solution is the right singular vector of the smallest
/// singular value.
pub fn triangulate_dlt(observations: &[ViewObservation<'_>]) -> Option<DVec3> {
    if observations.len() < 2 {
        return None;
    }
    let mut a = Mat::<f64>::zeros(2 * observations.len(), 4);
    for (i, obs) in observations.iter().enumerate() {
        let ray = obs.camera.unproject(obs.pixel);
        write_dlt_row(&mut a, 2 * i, ray.x, obs.pose, 0);
        write_dlt_row(&mut a, 2 * i + 1, ray.y, obs.pose, 1);
    }
    let svd = a.svd();
    let v = svd.v();
    let w = v.read(3, 3);
    if !w.is_finite() || w.abs() < 1e-12 {
        return None;
    }
    let p = DVec3::new(v.read(0, 3) / w, v.read(1, 3) / w, v.read(2, 3) / w);
    p.is_finite().then_some(p)
}

// row = coord * P[2] - P[axis], unit-normalized
fn write_dlt_row(a: &mut Mat<f64>, row: usize, coord: f64, pose: &CameraPose, axis: usize) {
    let r = pose.rotation.transpose();
    let (p_axis, p_z) = (r.col(axis), r.col(2));
    let (t_axis, t_z) = (pose.translation[axis], pose.translation.z);
    let vals = [
        coord * p_z.x - p_axis.x,
        coord * p_z.y - p_axis.y,
        coord * p_z.z - p_axis.z,
        coord * t_z - t_axis,
    ];
    let norm = vals
        .iter()
        .map(|v| v * v)
        .sum::<f64>()
        .sqrt()
        .max(f64::MIN_POSITIVE);
    for (j, v) in vals.iter().enumerate() {
        a.write(row, j, v / norm);
    }
}

fn outer(a: DVec3, b: DVec3) -> DMat3 {
    DMat3::from_cols(a * b.x, a * b.y, a * b.z)
}

fn reprojection_cost(observations: &[ViewObservation<'_>], p: DVec3) -> f64 {
    observations
        .iter()
        .map(|o| match o.pose.project(o.camera, p) {
            Some(uv) => (uv - o.pixel).length_squared(),
            None => f64::INFINITY,
        })
        .sum()
}

/// Refine a point by Gauss-Newton on the pixel reprojection error over all observations.
///
/// Steps that do not lower the cost are rejected; the best point found is returned.
pub fn refine_point(
    observations: &[ViewObservation<'_>],
    initial: DVec3,
    iterations: usize,
) -> DVec3 {
    let mut p = initial;
    let mut cost = reprojection_cost(observations, p);
    for _ in 0..iterations {
        let mut jtj = DMat3::ZERO;
        let mut jtr = DVec3::ZERO;
        for o in observations {
            let pc = o.pose.transform_point(p);
            let Some(uv) = o.camera.project(pc) else {
                continue;
            };
            let r = uv - o.pixel;
            // d(uv)/d(pc) rows pulled back to world by R^T
            let [ju, jv] = o.camera.projection_jacobian(pc);
            let rt = o.pose.rotation.transpose();
            let (ju, jv) = (rt * ju, rt * jv);
            jtj += outer(ju, ju) + outer(jv, jv);
            jtr += ju * r.x + jv * r.y;
        }
        if jtj.determinant().abs() < 1e-18 {
            break;
        }
        let candidate = p - jtj.inverse() * jtr;
        let new_cost = reprojection_cost(observations, candidate);
        if new_cost.is_nan() || new_cost >= cost {
            break;
        }
        let converged = cost - new_cost < 1e-12 * cost.max(1.0);
        p = candidate;
        cost = new_cost;
        if converged {
            break;
        }
    }
    p
}

/// Angle in degrees between the rays from two camera centers to a point.
pub fn triangulation_angle_deg(center_a: DVec3, center_b: DVec3, point: DVec3) -> f64 {
    let a = (point - center_a).normalize_or_zero();
    let b = (point - center_b).normalize_or_zero();
    a.dot(b).clamp(-1.0, 1.0).acos().to_degrees()
}

/// Check a candidate point against the acceptance policy.
///
/// The point must lie in front of every camera, reproject within the configured pixel
/// threshold in every view, and be seen under a sufficient angle by at least one pair.
pub fn check_point(
    observations: &[ViewObservation<'_>],
    point: DVec3,
    params: &TriangulationParams,
) -> Result<(), RejectionReason> {
    for (i, o) in observations.iter().enumerate() {
        if o.pose.depth(point) <= MIN_DEPTH {
            return Err(RejectionReason::BehindCamera { observation: i });
        }
        let error = o
            .pose
            .reprojection_error(o.camera, point, o.pixel)
            .unwrap_or(f64::INFINITY);
        if error.is_nan() || error > params.max_reprojection_error {
            return Err(RejectionReason::ReprojectionError {
                observation: i,
                error,
            });
        }
    }

    let centers: Vec<DVec3> = observations.iter().map(|o| o.pose.center()).collect();
    let mut max_angle = 0.0f64;
    for i in 0..centers.len() {
        for j in (i + 1)..centers.len() {
            max_angle = max_angle.max(triangulation_angle_deg(centers[i], centers[j], point));
        }
    }
    if max_angle < params.min_triangulation_angle_deg {
        return Err(RejectionReason::LowParallax {
            angle_deg: max_angle,
        });
    }
    Ok(())
}

/// Triangulate a point from two or more posed views and apply the acceptance policy.
///
/// Two views use the linear solution directly; with more views the linear estimate is
/// refined by minimizing the reprojection error over all contributing views.
pub fn triangulate(
    observations: &[ViewObservation<'_>],
    params: &TriangulationParams,
) -> Result<DVec3, TriangulationError> {
    if observations.len() < 2 {
        return Err(RejectionReason::NotEnoughViews {
            found: observations.len(),
        }
        .into());
    }
    let mut point = triangulate_dlt(observations).ok_or(RejectionReason::Degenerate)?;
    if observations.len() > 2 {
        point = refine_point(observations, point, params.refine_iterations);
    }
    check_point(observations, point, params)?;
    Ok(point)
}

/// Triangulate one correspondence between two posed cameras.
pub fn triangulate_pair(
    a: ViewObservation<'_>,
    b: ViewObservation<'_>,
    params: &TriangulationParams,
) -> Result<DVec3, TriangulationError> {
    triangulate(&[a, b], params)
}

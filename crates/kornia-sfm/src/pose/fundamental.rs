use crate::linalg::{mat3_from_row_major, svd3};
use glam::{DMat3, DVec2, DVec3};

/// Errors raised by the fundamental matrix solvers.
#[derive(Debug, thiserror::Error)]
pub enum FundamentalError {
    /// Not enough correspondences, or the two point sets differ in length.
    #[error("need at least {required} correspondences of equal length, got {x1} and {x2}")]
    InvalidInput {
        /// Minimum number of correspondences.
        required: usize,
        /// Number of points in the first image.
        x1: usize,
        /// Number of points in the second image.
        x2: usize,
    },
    /// The linear system is degenerate (e.g. coincident points).
    #[error("degenerate point configuration")]
    Degenerate,
}

/// Estimate the fundamental matrix using the normalized 8-point algorithm.
///
/// With more than eight correspondences the result is the linear least-squares solution.
/// The returned matrix satisfies `x2^T F x1 = 0`, has rank 2 and unit Frobenius norm.
pub fn fundamental_8point(x1: &[DVec2], x2: &[DVec2]) -> Result<DMat3, FundamentalError> {
    if x1.len() != x2.len() || x1.len() < 8 {
        return Err(FundamentalError::InvalidInput {
            required: 8,
            x1: x1.len(),
            x2: x2.len(),
        });
    }

    let (x1n, t1) = normalize_points_2d(x1).ok_or(FundamentalError::Degenerate)?;
    let (x2n, t2) = normalize_points_2d(x2).ok_or(FundamentalError::Degenerate)?;

    // design matrix A (N x 9) for x2'^T F x1 = 0, zero-padded so the SVD is square
    let n = x1n.len();
    let mut a = faer::Mat::<f64>::zeros(n.max(9), 9);
    for i in 0..n {
        let (x, y) = (x1n[i].x, x1n[i].y);
        let (xp, yp) = (x2n[i].x, x2n[i].y);
        a.write(i, 0, xp * x);
        a.write(i, 1, xp * y);
        a.write(i, 2, xp);
        a.write(i, 3, yp * x);
        a.write(i, 4, yp * y);
        a.write(i, 5, yp);
        a.write(i, 6, x);
        a.write(i, 7, y);
        a.write(i, 8, 1.0);
    }

    let svd = a.svd();
    let v = svd.v();
    let fvec: Vec<f64> = (0..9).map(|i| v.read(i, 8)).collect();
    let f = mat3_from_row_major(&fvec);

    // rank-2 constraint
    let (u, mut s, v) = svd3(&f);
    s.z = 0.0;
    let f = u * DMat3::from_diagonal(s) * v.transpose();

    // F = T2^T * F * T1
    let f = t2.transpose() * f * t1;
    let norm = frobenius_norm(&f);
    if !norm.is_finite() || norm < f64::EPSILON {
        return Err(FundamentalError::Degenerate);
    }
    Ok(f * (1.0 / norm))
}

/// Translate points to their centroid and scale them to a mean distance of `sqrt(2)`.
///
/// Returns the normalized points together with the similarity `T` such that `x_n = T x`,
/// or `None` when all points coincide.
pub fn normalize_points_2d(x: &[DVec2]) -> Option<(Vec<DVec2>, DMat3)> {
    if x.is_empty() {
        return None;
    }
    let n = x.len() as f64;
    let mean = x.iter().fold(DVec2::ZERO, |acc, p| acc + *p) / n;
    let mean_dist = x.iter().map(|p| p.distance(mean)).sum::<f64>() / n;
    if mean_dist <= f64::EPSILON {
        return None;
    }
    let scale = std::f64::consts::SQRT_2 / mean_dist;

    let xn = x.iter().map(|p| (*p - mean) * scale).collect();
    let t = DMat3::from_cols(
        DVec3::new(scale, 0.0, 0.0),
        DVec3::new(0.0, scale, 0.0),
        DVec3::new(-scale * mean.x, -scale * mean.y, 1.0),
    );
    Some((xn, t))
}

/// Symmetric epipolar distance of a correspondence in pixels.
///
/// Root mean square of the distance of `x2` to the epipolar line `F x1` and of `x1` to
/// the line `F^T x2`.
pub fn symmetric_epipolar_distance(f: &DMat3, x1: &DVec2, x2: &DVec2) -> f64 {
    let p1 = x1.extend(1.0);
    let p2 = x2.extend(1.0);
    let l2 = *f * p1;
    let l1 = f.transpose() * p2;
    let e = p2.dot(l2);
    let n2 = l2.x * l2.x + l2.y * l2.y;
    let n1 = l1.x * l1.x + l1.y * l1.y;
    if n1 <= f64::MIN_POSITIVE || n2 <= f64::MIN_POSITIVE {
        return f64::INFINITY;
    }
    (0.5 * e * e * (1.0 / n1 + 1.0 / n2)).sqrt()
}

/// Frobenius norm of a 3x3 matrix.
pub fn frobenius_norm(m: &DMat3) -> f64 {
    m.to_cols_array().iter().map(|v| v * v).sum::<f64>().sqrt()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::linalg::{exp_so3, skew};
    use approx::assert_relative_eq;

    fn synthetic_pair() -> (Vec<DVec2>, Vec<DVec2>, DMat3) {
        let k = DMat3::from_cols(
            DVec3::new(500.0, 0.0, 0.0),
            DVec3::new(0.0, 500.0, 0.0),
            DVec3::new(320.0, 240.0, 1.0),
        );
        let r = exp_so3(DVec3::new(0.02, -0.1, 0.01));
        let t = DVec3::new(1.0, 0.1, 0.05);
        let mut x1 = Vec::new();
        let mut x2 = Vec::new();
        for i in 0..20 {
            let fi = i as f64;
            let p = DVec3::new(
                (fi * 0.37).sin(),
                (fi * 0.73).cos(),
                4.0 + (fi * 0.19).sin(),
            );
            let a = k * p;
            let b = k * (r * p + t);
            x1.push(DVec2::new(a.x / a.z, a.y / a.z));
            x2.push(DVec2::new(b.x / b.z, b.y / b.z));
        }
        let kinv = k.inverse();
        let f = kinv.transpose() * skew(t) * r * kinv;
        (x1, x2, f)
    }

    #[test]
    fn test_fundamental_8point_epipolar_constraint() -> Result<(), Box<dyn std::error::Error>> {
        let (x1, x2, _) = synthetic_pair();
        let f = fundamental_8point(&x1, &x2)?;
        for (a, b) in x1.iter().zip(x2.iter()) {
            assert!(symmetric_epipolar_distance(&f, a, b) < 1e-6);
        }
        let (_, s, _) = svd3(&f);
        assert!(s.z.abs() < 1e-9);
        Ok(())
    }

    #[test]
    fn test_symmetric_distance_pixels() {
        let (x1, x2, f) = synthetic_pair();
        let shifted = x2[0] + DVec2::new(0.0, 3.0);
        let d = symmetric_epipolar_distance(&f, &x1[0], &shifted);
        // epipolar lines are close to horizontal for this motion
        assert!(d > 0.5 && d < 10.0);
        let exact = symmetric_epipolar_distance(&f, &x1[1], &x2[1]);
        assert_relative_eq!(exact, 0.0, epsilon = 1e-9);
    }

    #[test]
    fn test_invalid_input() {
        let x = vec![DVec2::ZERO; 7];
        assert!(matches!(
            fundamental_8point(&x, &x),
            Err(FundamentalError::InvalidInput { required: 8, .. })
        ));
    }

    #[test]
    fn test_normalize_points() {
        let pts = vec![DVec2::new(0.0, 0.0), DVec2::new(2.0, 0.0), DVec2::new(1.0, 3.0)];
        let (xn, t) = normalize_points_2d(&pts).unwrap();
        let mean = xn.iter().fold(DVec2::ZERO, |a, p| a + *p) / 3.0;
        assert_relative_eq!(mean.length(), 0.0, epsilon = 1e-12);
        let md = xn.iter().map(|p| p.length()).sum::<f64>() / 3.0;
        assert_relative_eq!(md, std::f64::consts::SQRT_2, epsilon = 1e-12);
        let p = t * pts[2].extend(1.0);
        assert_relative_eq!(p.x, xn[2].x, epsilon = 1e-12);
    }
}

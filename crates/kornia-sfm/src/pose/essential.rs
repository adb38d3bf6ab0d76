use crate::linalg::{mat3_from_row_major, right_nullspace, skew, svd3};
use crate::pose::fundamental::frobenius_norm;
use faer::prelude::SpSolver;
use faer::Mat;
use glam::{DMat3, DVec3};

/// Errors raised by the essential matrix solvers.
#[derive(Debug, thiserror::Error)]
pub enum EssentialError {
    /// Wrong number of correspondences.
    #[error("need at least {required} correspondences of equal length, got {x1} and {x2}")]
    InvalidInput {
        /// Minimum number of correspondences.
        required: usize,
        /// Number of rays in the first image.
        x1: usize,
        /// Number of rays in the second image.
        x2: usize,
    },
    /// The polynomial system has no real solution.
    #[error("no real essential matrix solution")]
    NoSolution,
}

/// Build an essential matrix from a fundamental matrix and camera intrinsics.
///
/// E = K2^T * F * K1
pub fn essential_from_fundamental(f: &DMat3, k1: &DMat3, k2: &DMat3) -> DMat3 {
    k2.transpose() * *f * *k1
}

/// Build a fundamental matrix from an essential matrix and camera intrinsics.
///
/// F = K2^-T * E * K1^-1
pub fn fundamental_from_essential(e: &DMat3, k1: &DMat3, k2: &DMat3) -> DMat3 {
    k2.inverse().transpose() * *e * k1.inverse()
}

/// Essential matrix of the relative motion `x2 = R x1 + t`, `E = [t]x R`.
pub fn essential_from_motion(r: &DMat3, t: &DVec3) -> DMat3 {
    skew(*t) * *r
}

/// Enforce the (1,1,0) singular value constraint on an essential matrix.
pub fn enforce_essential_constraints(e: &DMat3) -> DMat3 {
    let (u, _, v) = svd3(e);
    u * DMat3::from_diagonal(DVec3::new(1.0, 1.0, 0.0)) * v.transpose()
}

/// Decompose an essential matrix into its four possible `(R, t)` solutions.
///
/// Every rotation is proper and every translation has unit norm.
pub fn decompose_essential(e: &DMat3) -> [(DMat3, DVec3); 4] {
    let (mut u, _, mut v) = svd3(e);
    if u.determinant() < 0.0 {
        u.z_axis = -u.z_axis;
    }
    if v.determinant() < 0.0 {
        v.z_axis = -v.z_axis;
    }

    let w = DMat3::from_cols(
        DVec3::new(0.0, 1.0, 0.0),
        DVec3::new(-1.0, 0.0, 0.0),
        DVec3::new(0.0, 0.0, 1.0),
    );
    let r1 = u * w * v.transpose();
    let r2 = u * w.transpose() * v.transpose();
    let t = u.z_axis.normalize_or_zero();

    [(r1, t), (r1, -t), (r2, t), (r2, -t)]
}

// Monomials in (x, y, z) of degree <= 3: the ten cubic terms first, then the ten
// remaining ones which form the quotient basis used by the action matrix.
const MONOMIALS: [[u8; 3]; 20] = [
    [3, 0, 0],
    [2, 1, 0],
    [2, 0, 1],
    [1, 2, 0],
    [1, 1, 1],
    [1, 0, 2],
    [0, 3, 0],
    [0, 2, 1],
    [0, 1, 2],
    [0, 0, 3],
    [2, 0, 0],
    [1, 1, 0],
    [1, 0, 1],
    [0, 2, 0],
    [0, 1, 1],
    [0, 0, 2],
    [1, 0, 0],
    [0, 1, 0],
    [0, 0, 1],
    [0, 0, 0],
];

fn monomial_index(e: [u8; 3]) -> usize {
    MONOMIALS.iter().position(|m| *m == e).unwrap_or(19)
}

#[derive(Clone, Copy)]
struct Poly([f64; 20]);

impl Poly {
    const ZERO: Poly = Poly([0.0; 20]);

    fn linear(x: f64, y: f64, z: f64, w: f64) -> Poly {
        let mut p = Poly::ZERO;
        p.0[16] = x;
        p.0[17] = y;
        p.0[18] = z;
        p.0[19] = w;
        p
    }

    fn mul(&self, other: &Poly) -> Poly {
        let mut out = Poly::ZERO;
        for (i, a) in self.0.iter().enumerate().filter(|(_, a)| **a != 0.0) {
            for (j, b) in other.0.iter().enumerate().filter(|(_, b)| **b != 0.0) {
                let (ea, eb) = (MONOMIALS[i], MONOMIALS[j]);
                let e = [ea[0] + eb[0], ea[1] + eb[1], ea[2] + eb[2]];
                // products stay within degree 3 by construction
                if e.iter().sum::<u8>() <= 3 {
                    out.0[monomial_index(e)] += a * b;
                }
            }
        }
        out
    }

    fn add(&self, other: &Poly) -> Poly {
        let mut out = *self;
        for (a, b) in out.0.iter_mut().zip(other.0.iter()) {
            *a += b;
        }
        out
    }

    fn scale(&self, s: f64) -> Poly {
        let mut out = *self;
        out.0.iter_mut().for_each(|a| *a *= s);
        out
    }
}

/// Five-point relative pose solver (Nister / Stewenius).
///
/// `x1`, `x2` are exactly five (or more, only the first five are used) corresponding rays
/// in normalized image coordinates. Returns up to ten essential matrices with unit
/// Frobenius norm satisfying `x2^T E x1 = 0`.
pub fn essential_5point(x1: &[DVec3], x2: &[DVec3]) -> Result<Vec<DMat3>, EssentialError> {
    if x1.len() != x2.len() || x1.len() < 5 {
        return Err(EssentialError::InvalidInput {
            required: 5,
            x1: x1.len(),
            x2: x2.len(),
        });
    }

    let mut q = Mat::<f64>::zeros(5, 9);
    for i in 0..5 {
        let (a, b) = (x1[i], x2[i]);
        for r in 0..3 {
            for c in 0..3 {
                q.write(i, 3 * r + c, b[r] * a[c]);
            }
        }
    }
    let basis = right_nullspace(&q, 4);
    if basis.len() < 4 {
        return Err(EssentialError::NoSolution);
    }
    let (bx, by, bz, bw) = (&basis[0], &basis[1], &basis[2], &basis[3]);

    // E(x, y, z) = x X + y Y + z Z + W as polynomial entries
    let e: Vec<Poly> = (0..9)
        .map(|k| Poly::linear(bx[k], by[k], bz[k], bw[k]))
        .collect();
    let at = |r: usize, c: usize| e[3 * r + c];

    let mut constraints = Vec::with_capacity(10);
    let minor = |a: Poly, b: Poly, c: Poly, d: Poly| a.mul(&b).add(&c.mul(&d).scale(-1.0));
    let m00 = minor(at(1, 1), at(2, 2), at(1, 2), at(2, 1));
    let m01 = minor(at(1, 0), at(2, 2), at(1, 2), at(2, 0));
    let m02 = minor(at(1, 0), at(2, 1), at(1, 1), at(2, 0));
    let det = at(0, 0)
        .mul(&m00)
        .add(&at(0, 1).mul(&m01).scale(-1.0))
        .add(&at(0, 2).mul(&m02));
    constraints.push(det);

    // 2 E E^T E - tr(E E^T) E = 0
    let mut eet = [[Poly::ZERO; 3]; 3];
    for (r, row) in eet.iter_mut().enumerate() {
        for (c, v) in row.iter_mut().enumerate() {
            *v = (0..3).fold(Poly::ZERO, |acc, k| acc.add(&at(r, k).mul(&at(c, k))));
        }
    }
    let trace = eet[0][0].add(&eet[1][1]).add(&eet[2][2]);
    for r in 0..3 {
        for c in 0..3 {
            let mut p = Poly::ZERO;
            for (k, eet_rk) in eet[r].iter().enumerate() {
                let mut lhs = eet_rk.scale(2.0);
                if k == r {
                    lhs = lhs.add(&trace.scale(-1.0));
                }
                p = p.add(&lhs.mul(&at(k, c)));
            }
            constraints.push(p);
        }
    }

    let m1 = Mat::from_fn(10, 10, |i, j| constraints[i].0[j]);
    let m2 = Mat::from_fn(10, 10, |i, j| constraints[i].0[10 + j]);
    let g = m1.partial_piv_lu().solve(&m2);
    if (0..10).any(|i| (0..10).any(|j| !g.read(i, j).is_finite())) {
        return Err(EssentialError::NoSolution);
    }

    // multiplication by x on the basis [x^2, xy, xz, y^2, yz, z^2, x, y, z, 1]
    let mut action = Mat::<f64>::zeros(10, 10);
    for row in 0..6 {
        for j in 0..10 {
            action.write(row, j, -g.read(row, j));
        }
    }
    action.write(6, 0, 1.0);
    action.write(7, 1, 1.0);
    action.write(8, 2, 1.0);
    action.write(9, 6, 1.0);

    let eigenvalues = action.eigenvalues::<faer::complex_native::c64>();
    let mut solutions = Vec::new();
    for lambda in eigenvalues {
        if lambda.im.abs() > 1e-8 * (1.0 + lambda.re.abs()) {
            continue;
        }
        let shifted = Mat::from_fn(10, 10, |i, j| {
            action.read(i, j) - if i == j { lambda.re } else { 0.0 }
        });
        let v = match right_nullspace(&shifted, 1).pop() {
            Some(v) => v,
            None => continue,
        };
        if v[9].abs() < 1e-12 {
            continue;
        }
        let (x, y, z) = (v[6] / v[9], v[7] / v[9], v[8] / v[9]);
        let coeffs: Vec<f64> = (0..9)
            .map(|k| x * bx[k] + y * by[k] + z * bz[k] + bw[k])
            .collect();
        let em = mat3_from_row_major(&coeffs);
        let norm = frobenius_norm(&em);
        if norm.is_finite() && norm > f64::EPSILON {
            solutions.push(em * (1.0 / norm));
        }
    }

    if solutions.is_empty() {
        return Err(EssentialError::NoSolution);
    }
    Ok(solutions)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::linalg::{exp_so3, rotation_angle};
    use approx::assert_relative_eq;

    fn rays(r: &DMat3, t: &DVec3, n: usize) -> (Vec<DVec3>, Vec<DVec3>) {
        let mut x1 = Vec::new();
        let mut x2 = Vec::new();
        for i in 0..n {
            let fi = i as f64;
            let p = DVec3::new(
                (fi * 1.3).sin(),
                (fi * 0.7).cos() * 0.8,
                5.0 + (fi * 2.1).sin(),
            );
            let q = *r * p + *t;
            x1.push(p / p.z);
            x2.push(q / q.z);
        }
        (x1, x2)
    }

    #[test]
    fn test_decompose_essential_identity_rotation() {
        let r = DMat3::IDENTITY;
        let t = DVec3::new(1.0, 0.0, 0.0);
        let e = essential_from_motion(&r, &t);

        let candidates = decompose_essential(&e);
        let found = candidates.iter().any(|(rc, tc)| {
            assert_relative_eq!(rc.determinant(), 1.0, epsilon = 1e-9);
            tc.dot(t) > 0.999 && rotation_angle(&(*rc * r.transpose())) < 1e-6
        });
        assert!(found);
    }

    #[test]
    fn test_enforce_essential_constraints_rank2() {
        let e = mat3_from_row_major(&[0.1, 0.4, -0.2, 0.2, -0.1, 0.5, -0.3, 0.2, 0.3]);
        let e_fixed = enforce_essential_constraints(&e);
        let (_, s, _) = svd3(&e_fixed);
        assert_relative_eq!(s.z, 0.0, epsilon = 1e-9);
        assert_relative_eq!(s.x, s.y, epsilon = 1e-9);
    }

    #[test]
    fn test_five_point_recovers_motion() -> Result<(), Box<dyn std::error::Error>> {
        let r = exp_so3(DVec3::new(0.05, -0.2, 0.03));
        let t = DVec3::new(-0.8, 0.1, 0.2).normalize();
        let (x1, x2) = rays(&r, &t, 8);
        let e_true = essential_from_motion(&r, &t);
        let e_true = e_true * (1.0 / frobenius_norm(&e_true));

        let solutions = essential_5point(&x1[..5], &x2[..5])?;
        let best = solutions
            .iter()
            .map(|e| {
                let d1 = frobenius_norm(&(*e - e_true));
                let d2 = frobenius_norm(&(*e + e_true));
                d1.min(d2)
            })
            .fold(f64::INFINITY, f64::min);
        assert!(best < 1e-5, "closest solution off by {best}");

        // every solution satisfies the epipolar constraint on the sample
        for e in &solutions {
            for (a, b) in x1[..5].iter().zip(x2[..5].iter()) {
                assert!(b.dot(*e * *a).abs() < 1e-8);
            }
        }
        Ok(())
    }

    #[test]
    fn test_five_point_invalid_input() {
        let x = vec![DVec3::Z; 4];
        assert!(matches!(
            essential_5point(&x, &x),
            Err(EssentialError::InvalidInput { required: 5, .. })
        ));
    }
}

use faer::{Mat, MatRef};
use glam::{DMat3, DVec3};

/// Convert a glam 3x3 matrix into a dense faer matrix.
pub fn mat3_to_faer(m: &DMat3) -> Mat<f64> {
    Mat::from_fn(3, 3, |i, j| m.col(j)[i])
}

/// Convert the top-left 3x3 block of a faer matrix into a glam matrix.
pub fn faer_to_mat3(m: MatRef<'_, f64>) -> DMat3 {
    DMat3::from_cols(
        DVec3::new(m.read(0, 0), m.read(1, 0), m.read(2, 0)),
        DVec3::new(m.read(0, 1), m.read(1, 1), m.read(2, 1)),
        DVec3::new(m.read(0, 2), m.read(1, 2), m.read(2, 2)),
    )
}

/// Build a 3x3 matrix from a row-major 9-vector.
pub fn mat3_from_row_major(v: &[f64]) -> DMat3 {
    DMat3::from_cols(
        DVec3::new(v[0], v[3], v[6]),
        DVec3::new(v[1], v[4], v[7]),
        DVec3::new(v[2], v[5], v[8]),
    )
}

/// Flatten a 3x3 matrix in row-major order.
pub fn mat3_to_row_major(m: &DMat3) -> [f64; 9] {
    m.transpose().to_cols_array()
}

/// Singular value decomposition of a 3x3 matrix, `m = U diag(s) V^T`.
///
/// Singular values are sorted in decreasing order.
pub fn svd3(m: &DMat3) -> (DMat3, DVec3, DMat3) {
    let svd = mat3_to_faer(m).svd();
    let s = svd.s_diagonal();
    (
        faer_to_mat3(svd.u()),
        DVec3::new(s.read(0), s.read(1), s.read(2)),
        faer_to_mat3(svd.v()),
    )
}

/// Right null space of a (possibly wide) matrix.
///
/// Returns the `dim` right singular vectors associated with the smallest singular values,
/// the last one first. Wide systems are zero-padded to square before the decomposition.
pub fn right_nullspace(a: &Mat<f64>, dim: usize) -> Vec<Vec<f64>> {
    let (rows, cols) = (a.nrows(), a.ncols());
    let padded;
    let a = if rows < cols {
        padded = Mat::from_fn(cols, cols, |i, j| if i < rows { a.read(i, j) } else { 0.0 });
        &padded
    } else {
        a
    };
    let svd = a.svd();
    let v = svd.v();
    (0..dim.min(cols))
        .map(|k| {
            let c = cols - 1 - k;
            (0..cols).map(|i| v.read(i, c)).collect()
        })
        .collect()
}

/// Project a 3x3 matrix to the closest rotation in the Frobenius sense.
pub fn closest_rotation(m: &DMat3) -> DMat3 {
    let (u, _, v) = svd3(m);
    let mut r = u * v.transpose();
    if r.determinant() < 0.0 {
        let d = DMat3::from_diagonal(DVec3::new(1.0, 1.0, -1.0));
        r = u * d * v.transpose();
    }
    r
}

/// Skew-symmetric cross-product matrix, `[v]x w = v x w`.
pub fn skew(v: DVec3) -> DMat3 {
    DMat3::from_cols(
        DVec3::new(0.0, v.z, -v.y),
        DVec3::new(-v.z, 0.0, v.x),
        DVec3::new(v.y, -v.x, 0.0),
    )
}

/// Geodesic angle of a rotation matrix in radians.
pub fn rotation_angle(r: &DMat3) -> f64 {
    let c = ((r.x_axis.x + r.y_axis.y + r.z_axis.z - 1.0) * 0.5).clamp(-1.0, 1.0);
    c.acos()
}

/// Exponential map from an axis-angle vector to a rotation matrix.
pub fn exp_so3(omega: DVec3) -> DMat3 {
    DMat3::from_quat(glam::DQuat::from_scaled_axis(omega))
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn test_row_major_roundtrip() {
        let v = [1.0, 2.0, 3.0, 4.0, 5.0, 6.0, 7.0, 8.0, 9.0];
        let m = mat3_from_row_major(&v);
        assert_relative_eq!(m.col(2).x, 3.0);
        assert_relative_eq!(m.col(0).y, 4.0);
        assert_eq!(mat3_to_row_major(&m), v);
    }

    #[test]
    fn test_svd3_reconstructs() {
        let m = mat3_from_row_major(&[2.0, -1.0, 0.5, 0.3, 1.5, -2.0, 1.0, 0.0, 3.0]);
        let (u, s, v) = svd3(&m);
        let rec = u * DMat3::from_diagonal(s) * v.transpose();
        for (a, b) in rec.to_cols_array().iter().zip(m.to_cols_array().iter()) {
            assert_relative_eq!(a, b, epsilon = 1e-9);
        }
        assert!(s.x >= s.y && s.y >= s.z);
    }

    #[test]
    fn test_closest_rotation_is_orthonormal() {
        let r = exp_so3(DVec3::new(0.1, -0.3, 0.2));
        let noisy = r + DMat3::from_diagonal(DVec3::splat(1e-3));
        let q = closest_rotation(&noisy);
        assert_relative_eq!(q.determinant(), 1.0, epsilon = 1e-9);
        assert!(rotation_angle(&(q * r.transpose())) < 1e-2);
    }

    #[test]
    fn test_right_nullspace_wide() {
        // x + y + z = 0 has a 2-dimensional null space
        let a = Mat::from_fn(1, 3, |_, _| 1.0);
        let ns = right_nullspace(&a, 2);
        assert_eq!(ns.len(), 2);
        for v in ns {
            assert_relative_eq!(v.iter().sum::<f64>(), 0.0, epsilon = 1e-9);
        }
    }
}

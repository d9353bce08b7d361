//! Template-to-image transform estimation.
//!
//! - Direct Linear Transform (DLT) with Hartley normalization from ≥4 points.
//! - Least-squares affine fit from ≥3 points.
//! - Projection, reprojection errors and local linearization.

use nalgebra::{DMatrix, DVector, Matrix2, Matrix3, Vector3};

// ── Error type ───────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum TransformFitError {
    #[error("too few points: need {needed}, got {got}")]
    TooFewPoints { needed: usize, got: usize },
    #[error("numerical failure: {0}")]
    NumericalFailure(String),
}

// ── Projection ───────────────────────────────────────────────────────────

/// Project a point through a 3×3 transform: H * [x, y, 1]^T → [u, v].
///
/// Returns `None` for points mapped to (or behind) the line at infinity.
pub fn project(h: &Matrix3<f64>, p: [f64; 2]) -> Option<[f64; 2]> {
    let q = h * Vector3::new(p[0], p[1], 1.0);
    if q[2] <= 1e-12 {
        return None;
    }
    let out = [q[0] / q[2], q[1] / q[2]];
    (out[0].is_finite() && out[1].is_finite()).then_some(out)
}

/// Per-correspondence reprojection error ||project(H, src) - dst||.
///
/// Points that cannot be projected get `f64::INFINITY`.
pub fn reprojection_errors(h: &Matrix3<f64>, src: &[[f64; 2]], dst: &[[f64; 2]]) -> Vec<f64> {
    src.iter()
        .zip(dst)
        .map(|(s, d)| match project(h, *s) {
            Some(p) => ((p[0] - d[0]).powi(2) + (p[1] - d[1]).powi(2)).sqrt(),
            None => f64::INFINITY,
        })
        .collect()
}

/// Jacobian of the projective map at `p` (2×2, image units per template unit).
pub fn local_jacobian(h: &Matrix3<f64>, p: [f64; 2]) -> Option<Matrix2<f64>> {
    let q = h * Vector3::new(p[0], p[1], 1.0);
    let w = q[2];
    if w <= 1e-12 {
        return None;
    }
    let u = q[0] / w;
    let v = q[1] / w;
    let j = Matrix2::new(
        (h[(0, 0)] - u * h[(2, 0)]) / w,
        (h[(0, 1)] - u * h[(2, 1)]) / w,
        (h[(1, 0)] - v * h[(2, 0)]) / w,
        (h[(1, 1)] - v * h[(2, 1)]) / w,
    );
    j.iter().all(|x| x.is_finite()).then_some(j)
}

// ── Hartley normalization ────────────────────────────────────────────────

/// Compute a normalizing transform: translate centroid to origin, scale so
/// mean distance from origin is sqrt(2).
fn normalize_points(pts: &[[f64; 2]]) -> (Matrix3<f64>, Vec<[f64; 2]>) {
    let n = pts.len() as f64;
    let cx: f64 = pts.iter().map(|p| p[0]).sum::<f64>() / n;
    let cy: f64 = pts.iter().map(|p| p[1]).sum::<f64>() / n;

    let mean_dist: f64 = pts
        .iter()
        .map(|p| ((p[0] - cx).powi(2) + (p[1] - cy).powi(2)).sqrt())
        .sum::<f64>()
        / n;

    let s = if mean_dist > 1e-15 {
        std::f64::consts::SQRT_2 / mean_dist
    } else {
        1.0
    };

    let t = Matrix3::new(s, 0.0, -s * cx, 0.0, s, -s * cy, 0.0, 0.0, 1.0);
    let normalized = pts
        .iter()
        .map(|p| [s * (p[0] - cx), s * (p[1] - cy)])
        .collect();

    (t, normalized)
}

// ── DLT ──────────────────────────────────────────────────────────────────

/// Estimate a homography from ≥4 correspondences using normalized DLT.
///
/// Returns H such that dst ≈ project(H, src), scaled so that H[2][2] = 1.
pub fn estimate_homography_dlt(
    src: &[[f64; 2]],
    dst: &[[f64; 2]],
) -> Result<Matrix3<f64>, TransformFitError> {
    let n = src.len();
    if n < 4 || dst.len() < 4 {
        return Err(TransformFitError::TooFewPoints {
            needed: 4,
            got: n.min(dst.len()),
        });
    }
    if src.len() != dst.len() {
        return Err(TransformFitError::NumericalFailure(
            "src and dst must have the same length".into(),
        ));
    }

    let (t_src, src_n) = normalize_points(src);
    let (t_dst, dst_n) = normalize_points(dst);

    // 2n × 9 design matrix
    let mut a = DMatrix::zeros(2 * n, 9);
    for i in 0..n {
        let (sx, sy) = (src_n[i][0], src_n[i][1]);
        let (dx, dy) = (dst_n[i][0], dst_n[i][1]);

        a[(2 * i, 3)] = -sx;
        a[(2 * i, 4)] = -sy;
        a[(2 * i, 5)] = -1.0;
        a[(2 * i, 6)] = dy * sx;
        a[(2 * i, 7)] = dy * sy;
        a[(2 * i, 8)] = dy;

        a[(2 * i + 1, 0)] = sx;
        a[(2 * i + 1, 1)] = sy;
        a[(2 * i + 1, 2)] = 1.0;
        a[(2 * i + 1, 6)] = -dx * sx;
        a[(2 * i + 1, 7)] = -dx * sy;
        a[(2 * i + 1, 8)] = -dx;
    }

    // Null vector of A = eigenvector of A^T A with the smallest eigenvalue.
    let ata = a.transpose() * &a;
    let eig = nalgebra::SymmetricEigen::new(ata);
    let mut min_idx = 0;
    let mut min_val = eig.eigenvalues[0].abs();
    for i in 1..9 {
        let v = eig.eigenvalues[i].abs();
        if v < min_val {
            min_val = v;
            min_idx = i;
        }
    }
    let h_vec: Vec<f64> = (0..9).map(|j| eig.eigenvectors[(j, min_idx)]).collect();
    let h_norm = Matrix3::from_row_slice(&h_vec);

    // H = T_dst^-1 * H_norm * T_src
    let t_dst_inv = t_dst
        .try_inverse()
        .ok_or_else(|| TransformFitError::NumericalFailure("T_dst not invertible".into()))?;
    let h = t_dst_inv * h_norm * t_src;

    let scale = h[(2, 2)];
    if scale.abs() < 1e-15 || !h.iter().all(|v| v.is_finite()) {
        return Err(TransformFitError::NumericalFailure(
            "degenerate homography".into(),
        ));
    }
    Ok(h / scale)
}

// ── Affine ───────────────────────────────────────────────────────────────

/// Least-squares affine transform from ≥3 non-collinear correspondences.
pub fn estimate_affine_lsq(
    src: &[[f64; 2]],
    dst: &[[f64; 2]],
) -> Result<Matrix3<f64>, TransformFitError> {
    let n = src.len();
    if n < 3 || dst.len() < 3 {
        return Err(TransformFitError::TooFewPoints {
            needed: 3,
            got: n.min(dst.len()),
        });
    }
    if src.len() != dst.len() {
        return Err(TransformFitError::NumericalFailure(
            "src and dst must have the same length".into(),
        ));
    }

    let (t_src, src_n) = normalize_points(src);
    let a = DMatrix::from_fn(n, 3, |r, c| match c {
        0 => src_n[r][0],
        1 => src_n[r][1],
        _ => 1.0,
    });
    let svd = a.svd(true, true);
    let sv = &svd.singular_values;
    let (sv_max, sv_min) = (sv.max(), sv.min());
    if sv_max <= 0.0 || sv_min / sv_max < 1e-9 {
        return Err(TransformFitError::NumericalFailure(
            "correspondences are collinear".into(),
        ));
    }

    let bu = DVector::from_iterator(n, dst.iter().map(|d| d[0]));
    let bv = DVector::from_iterator(n, dst.iter().map(|d| d[1]));
    let row_u = svd
        .solve(&bu, 1e-12)
        .map_err(|e| TransformFitError::NumericalFailure(e.to_string()))?;
    let row_v = svd
        .solve(&bv, 1e-12)
        .map_err(|e| TransformFitError::NumericalFailure(e.to_string()))?;

    let m = Matrix3::new(
        row_u[0], row_u[1], row_u[2], row_v[0], row_v[1], row_v[2], 0.0, 0.0, 1.0,
    );
    Ok(m * t_src)
}

/// Row-major array form used in serialized results.
pub fn matrix3_to_array(m: &Matrix3<f64>) -> [[f64; 3]; 3] {
    [
        [m[(0, 0)], m[(0, 1)], m[(0, 2)]],
        [m[(1, 0)], m[(1, 1)], m[(1, 2)]],
        [m[(2, 0)], m[(2, 1)], m[(2, 2)]],
    ]
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    fn sample_h() -> Matrix3<f64> {
        Matrix3::new(1.1, 0.08, 30.0, -0.05, 0.95, 12.0, 1e-4, -5e-5, 1.0)
    }

    fn corners() -> Vec<[f64; 2]> {
        vec![
            [0.0, 0.0],
            [600.0, 0.0],
            [0.0, 800.0],
            [600.0, 800.0],
            [300.0, 410.0],
        ]
    }

    #[test]
    fn dlt_recovers_exact_homography() {
        let h = sample_h();
        let src = corners();
        let dst: Vec<[f64; 2]> = src.iter().map(|p| project(&h, *p).unwrap()).collect();
        let est = estimate_homography_dlt(&src, &dst).unwrap();
        for p in &src {
            let a = project(&h, *p).unwrap();
            let b = project(&est, *p).unwrap();
            assert_abs_diff_eq!(a[0], b[0], epsilon = 1e-6);
            assert_abs_diff_eq!(a[1], b[1], epsilon = 1e-6);
        }
    }

    #[test]
    fn affine_recovers_rotation_and_translation() {
        let (s, c) = 0.2f64.sin_cos();
        let truth = Matrix3::new(2.0 * c, -2.0 * s, 40.0, 2.0 * s, 2.0 * c, -7.0, 0.0, 0.0, 1.0);
        let src = vec![[10.0, 10.0], [500.0, 20.0], [40.0, 700.0]];
        let dst: Vec<[f64; 2]> = src.iter().map(|p| project(&truth, *p).unwrap()).collect();
        let est = estimate_affine_lsq(&src, &dst).unwrap();
        for (a, b) in est.iter().zip(truth.iter()) {
            assert_abs_diff_eq!(*a, *b, epsilon = 1e-8);
        }
    }

    #[test]
    fn affine_rejects_collinear_points() {
        let src = vec![[0.0, 0.0], [1.0, 1.0], [2.0, 2.0], [3.0, 3.0]];
        let dst = src.clone();
        assert!(matches!(
            estimate_affine_lsq(&src, &dst),
            Err(TransformFitError::NumericalFailure(_))
        ));
    }

    #[test]
    fn too_few_points_is_reported() {
        let pts = vec![[0.0, 0.0], [1.0, 0.0], [0.0, 1.0]];
        assert_eq!(
            estimate_homography_dlt(&pts, &pts),
            Err(TransformFitError::TooFewPoints { needed: 4, got: 3 })
        );
    }

    #[test]
    fn jacobian_of_affine_is_its_linear_part() {
        let m = Matrix3::new(2.0, 0.5, 3.0, -0.25, 1.5, 4.0, 0.0, 0.0, 1.0);
        let j = local_jacobian(&m, [17.0, -3.0]).unwrap();
        assert_abs_diff_eq!(j[(0, 0)], 2.0, epsilon = 1e-12);
        assert_abs_diff_eq!(j[(0, 1)], 0.5, epsilon = 1e-12);
        assert_abs_diff_eq!(j[(1, 0)], -0.25, epsilon = 1e-12);
        assert_abs_diff_eq!(j[(1, 1)], 1.5, epsilon = 1e-12);
    }

    #[test]
    fn projection_behind_camera_is_rejected() {
        let h = Matrix3::new(1.0, 0.0, 0.0, 0.0, 1.0, 0.0, -0.01, 0.0, 1.0);
        assert!(project(&h, [200.0, 0.0]).is_none());
        assert_eq!(reprojection_errors(&h, &[[200.0, 0.0]], &[[0.0, 0.0]]), [f64::INFINITY]);
    }
}

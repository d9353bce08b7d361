//! Transform estimation, projection, and related utilities.

mod core;

pub use self::core::{
    estimate_affine_lsq, estimate_homography_dlt, local_jacobian, matrix3_to_array, project,
    reprojection_errors,
};

/// Root-mean-square error; `INFINITY` as soon as one entry is not finite.
pub(crate) fn rms(errors: &[f64]) -> f64 {
    if errors.is_empty() {
        return 0.0;
    }
    if errors.iter().any(|e| !e.is_finite()) {
        return f64::INFINITY;
    }
    (errors.iter().map(|e| e * e).sum::<f64>() / errors.len() as f64).sqrt()
}

//! Physical plausibility of a fitted page transform.

use nalgebra::Matrix3;

use super::PagePrior;
use crate::config::DistortionBounds;
use crate::homography::{local_jacobian, project};

/// Local shape of the transform at the page center.
#[derive(Debug, Clone, Copy, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct TransformShape {
    /// Image pixels per template unit (geometric mean of both axes).
    pub pixels_per_unit: f64,
    /// `pixels_per_unit` relative to the page fitted into the image.
    pub scale_ratio: f64,
    pub anisotropy: f64,
    pub skew_deg: f64,
    /// Signed in-plane rotation.
    pub rotation_deg: f64,
}

/// Measure the transform and reject it when it leaves `bounds`.
pub(crate) fn check_plausibility(
    h: &Matrix3<f64>,
    page_size: [f64; 2],
    prior: &PagePrior,
    bounds: &DistortionBounds,
) -> Result<TransformShape, String> {
    let [pw, ph] = page_size;
    let corners = [[0.0, 0.0], [pw, 0.0], [pw, ph], [0.0, ph]];
    let mut quad = [[0.0f64; 2]; 4];
    for (dst, &c) in quad.iter_mut().zip(corners.iter()) {
        *dst = project(h, c).ok_or_else(|| "page corner projects to infinity".to_string())?;
    }
    for k in 0..4 {
        let a = quad[k];
        let b = quad[(k + 1) % 4];
        let c = quad[(k + 2) % 4];
        let cross = (b[0] - a[0]) * (c[1] - b[1]) - (b[1] - a[1]) * (c[0] - b[0]);
        if cross.is_nan() || cross <= 0.0 {
            return Err("projected page is folded or mirrored".into());
        }
    }

    let center = [0.5 * pw, 0.5 * ph];
    let j = local_jacobian(h, center)
        .ok_or_else(|| "transform is singular at the page center".to_string())?;
    let det = j.determinant();
    if det.is_nan() || det <= 0.0 {
        return Err("transform mirrors the page".into());
    }
    let sx = j.column(0).norm();
    let sy = j.column(1).norm();
    let cos = (j.column(0).dot(&j.column(1)) / (sx * sy)).clamp(-1.0, 1.0);

    let shape = TransformShape {
        pixels_per_unit: det.sqrt(),
        scale_ratio: det.sqrt() / prior.scale,
        anisotropy: sx.max(sy) / sx.min(sy),
        skew_deg: (90.0 - cos.acos().to_degrees()).abs(),
        rotation_deg: j[(1, 0)].atan2(j[(0, 0)]).to_degrees(),
    };

    if shape.scale_ratio < bounds.min_scale_ratio || shape.scale_ratio > bounds.max_scale_ratio {
        return Err(format!(
            "scale ratio {:.3} outside [{:.3}, {:.3}]",
            shape.scale_ratio, bounds.min_scale_ratio, bounds.max_scale_ratio
        ));
    }
    if shape.anisotropy > bounds.max_anisotropy {
        return Err(format!(
            "anisotropy {:.3} exceeds {:.3}",
            shape.anisotropy, bounds.max_anisotropy
        ));
    }
    if shape.skew_deg > bounds.max_skew_deg {
        return Err(format!(
            "skew {:.1} deg exceeds {:.1} deg",
            shape.skew_deg, bounds.max_skew_deg
        ));
    }
    if shape.rotation_deg.abs() > bounds.max_rotation_deg {
        return Err(format!(
            "rotation {:.1} deg exceeds {:.1} deg",
            shape.rotation_deg, bounds.max_rotation_deg
        ));
    }
    Ok(shape)
}

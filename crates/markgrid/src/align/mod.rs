//! Alignment engine: template-to-image transform from detected fiducials.
//!
//! Pipeline:
//! 1. Dark compact blobs are proposed as fiducial candidates.
//! 2. A coarse similarity pose is seeded from fiducial pairs, and candidates
//!    are assigned to template fiducials by a global minimum-cost matching
//!    against the positions it predicts. Without a seed the page is assumed
//!    fitted into the image.
//! 3. A transform is fitted to the matched pairs. Fiducials left unmatched
//!    are re-matched against the fitted transform, and the fit is repeated
//!    when that recovers any.
//! 4. The fit is rejected when it is physically implausible or its residual
//!    is too large.

mod distortion;
mod fiducials;
mod matching;
mod seed;

use image::GrayImage;
use nalgebra::Matrix3;

pub use distortion::TransformShape;

use crate::config::{GradeConfig, TransformModel};
use crate::error::AlignmentError;
use crate::homography::{
    estimate_affine_lsq, estimate_homography_dlt, matrix3_to_array, project, reprojection_errors,
    rms,
};
use crate::template::{max_triangle_area, Template};
use fiducials::{find_candidates, FiducialCandidate};
use matching::{match_fiducials, FiducialAssignment};

/// Uniform page-into-image placement, used before any fiducial is known.
#[derive(Debug, Clone, Copy, PartialEq)]
pub(crate) struct PagePrior {
    /// Image pixels per template unit.
    pub scale: f64,
    /// Image position of the page origin.
    pub offset: [f64; 2],
}

impl PagePrior {
    /// Largest centered placement of the page inside the image.
    pub fn fit(page_size: [f64; 2], image_size: (u32, u32)) -> Self {
        let (w, h) = (image_size.0 as f64, image_size.1 as f64);
        let scale = (w / page_size[0]).min(h / page_size[1]);
        Self {
            scale,
            offset: [
                0.5 * (w - page_size[0] * scale),
                0.5 * (h - page_size[1] * scale),
            ],
        }
    }

    pub fn expected(&self, p: [f64; 2]) -> [f64; 2] {
        [
            p[0] * self.scale + self.offset[0],
            p[1] * self.scale + self.offset[1],
        ]
    }

    pub fn diagonal_px(&self, page_size: [f64; 2]) -> f64 {
        page_size[0].hypot(page_size[1]) * self.scale
    }
}

/// A template fiducial and the image blob it was matched to.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct FiducialMatch {
    pub name: String,
    /// Template coordinates.
    pub template_xy: [f64; 2],
    /// Image coordinates of the matched candidate.
    pub image_xy: [f64; 2],
    /// Reprojection error under the final transform, in pixels.
    pub residual_px: f64,
}

/// Outcome of a successful alignment.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct AlignmentResult {
    /// Row-major template-to-image transform.
    pub transform: [[f64; 3]; 3],
    /// Model actually fitted (never `auto`).
    pub model: TransformModel,
    /// In (0, 1]; 1.0 for a perfect fit.
    pub confidence: f64,
    pub rms_residual_px: f64,
    /// RMS residual in projected fiducial sizes.
    pub normalized_residual: f64,
    pub shape: TransformShape,
    pub matched: Vec<FiducialMatch>,
    /// Fiducials that found no candidate.
    pub unmatched: Vec<String>,
    /// Matched fiducials that had a competing candidate nearby.
    pub ambiguous: Vec<String>,
    /// Number of fiducial candidates detected in the image.
    pub n_candidates: usize,
}

impl AlignmentResult {
    pub fn transform_matrix(&self) -> Matrix3<f64> {
        let t = &self.transform;
        Matrix3::new(
            t[0][0], t[0][1], t[0][2], t[1][0], t[1][1], t[1][2], t[2][0], t[2][1], t[2][2],
        )
    }

    /// Project a template point into the image.
    pub fn project(&self, p: [f64; 2]) -> Option<[f64; 2]> {
        project(&self.transform_matrix(), p)
    }
}

/// Estimate the template-to-image transform of one sheet.
pub fn align(
    gray: &GrayImage,
    template: &Template,
    config: &GradeConfig,
) -> Result<AlignmentResult, AlignmentError> {
    let (w, h) = gray.dimensions();
    if w < 4 || h < 4 {
        return Err(AlignmentError::EmptyImage);
    }
    let page = template.page_size();
    let prior = PagePrior::fit(page, (w, h));
    let candidates = find_candidates(gray, template, &prior, config);

    let fid_cfg = &config.fiducials;
    let ambiguity_ratio = fid_cfg.ambiguity_ratio as f64;
    let (expected, gate): (Vec<[f64; 2]>, f64) =
        match seed::seed_pose(template, &candidates, &prior, config) {
            Some(seed) => {
                tracing::debug!(
                    support = seed.support,
                    scale_ratio = seed.pose.scale / prior.scale,
                    rotation_deg = seed.pose.rotation.to_degrees(),
                    "seeded page pose"
                );
                let expected = template
                    .fiducials()
                    .iter()
                    .map(|f| seed.pose.apply(f.center))
                    .collect();
                (expected, seed.gate_px)
            }
            None => {
                let expected = template
                    .fiducials()
                    .iter()
                    .map(|f| prior.expected(f.center))
                    .collect();
                (expected, fid_cfg.match_gate_frac as f64 * prior.diagonal_px(page))
            }
        };
    let mut assignment = match_fiducials(&expected, &candidates, gate, ambiguity_ratio);

    check_quorum(template, &assignment, config.fiducial_quorum, candidates.len())?;
    let (mut transform, mut model) =
        fit_transform(template, &candidates, &assignment, config.transform_model)?;

    if assignment.pairs.len() < template.fiducials().len() {
        let projected: Vec<[f64; 2]> = template
            .fiducials()
            .iter()
            .map(|f| project(&transform, f.center).unwrap_or([f64::NAN, f64::NAN]))
            .collect();
        let fiducial_px = template.mean_fiducial_size() * transform_scale(&transform, page);
        let refine_gate = fid_cfg.refine_gate_factor as f64 * fiducial_px;
        let refined = match_fiducials(&projected, &candidates, refine_gate, ambiguity_ratio);
        if refined.pairs.len() > assignment.pairs.len() {
            tracing::debug!(
                before = assignment.pairs.len(),
                after = refined.pairs.len(),
                "re-matched fiducials against fitted transform"
            );
            check_quorum(template, &refined, config.fiducial_quorum, candidates.len())?;
            (transform, model) =
                fit_transform(template, &candidates, &refined, config.transform_model)?;
            assignment = refined;
        }
    }

    let shape = distortion::check_plausibility(&transform, page, &prior, &config.distortion)
        .map_err(AlignmentError::ExcessiveDistortion)?;

    let (src, dst) = correspondences(template, &candidates, &assignment);
    let errors = reprojection_errors(&transform, &src, &dst);
    let rms_residual_px = rms(&errors);
    let fiducial_px = template.mean_fiducial_size() * shape.pixels_per_unit;
    let normalized_residual = rms_residual_px / fiducial_px;
    if !normalized_residual.is_finite() || normalized_residual > config.max_alignment_residual {
        return Err(AlignmentError::ExcessiveDistortion(format!(
            "residual {:.3} fiducial sizes exceeds {:.3}",
            normalized_residual, config.max_alignment_residual
        )));
    }

    let fiducials = template.fiducials();
    let matched: Vec<FiducialMatch> = assignment
        .pairs
        .iter()
        .zip(errors.iter())
        .map(|(&(f, c, _), &e)| FiducialMatch {
            name: fiducials[f].name.clone(),
            template_xy: fiducials[f].center,
            image_xy: candidates[c].center,
            residual_px: e,
        })
        .collect();
    let unmatched: Vec<String> = fiducials
        .iter()
        .enumerate()
        .filter(|(i, _)| assignment.candidate_of(*i).is_none())
        .map(|(_, f)| f.name.clone())
        .collect();
    let ambiguous: Vec<String> = assignment
        .ambiguous
        .iter()
        .map(|&i| fiducials[i].name.clone())
        .collect();

    let result = AlignmentResult {
        transform: matrix3_to_array(&transform),
        model,
        confidence: 1.0 / (1.0 + normalized_residual),
        rms_residual_px,
        normalized_residual,
        shape,
        matched,
        unmatched,
        ambiguous,
        n_candidates: candidates.len(),
    };
    tracing::debug!(
        model = ?result.model,
        matched = result.matched.len(),
        rms_px = result.rms_residual_px,
        confidence = result.confidence,
        rotation_deg = result.shape.rotation_deg,
        "sheet aligned"
    );
    Ok(result)
}

fn correspondences(
    template: &Template,
    candidates: &[FiducialCandidate],
    assignment: &FiducialAssignment,
) -> (Vec<[f64; 2]>, Vec<[f64; 2]>) {
    assignment
        .pairs
        .iter()
        .map(|&(f, c, _)| (template.fiducials()[f].center, candidates[c].center))
        .unzip()
}

fn check_quorum(
    template: &Template,
    assignment: &FiducialAssignment,
    required: usize,
    n_candidates: usize,
) -> Result<(), AlignmentError> {
    let matched = assignment.pairs.len();
    if matched < required {
        return Err(AlignmentError::InsufficientFiducials {
            matched,
            required,
            candidates: n_candidates,
        });
    }
    let centers: Vec<[f64; 2]> = assignment
        .pairs
        .iter()
        .map(|&(f, _, _)| template.fiducials()[f].center)
        .collect();
    let [pw, ph] = template.page_size();
    if max_triangle_area(&centers) <= 1e-6 * pw * ph {
        return Err(AlignmentError::CollinearFiducials { matched });
    }
    Ok(())
}

fn fit_transform(
    template: &Template,
    candidates: &[FiducialCandidate],
    assignment: &FiducialAssignment,
    requested: TransformModel,
) -> Result<(Matrix3<f64>, TransformModel), AlignmentError> {
    let (src, dst) = correspondences(template, candidates, assignment);
    let model = match requested {
        TransformModel::Auto if src.len() >= 4 => TransformModel::Homography,
        TransformModel::Auto => TransformModel::Affine,
        m => m,
    };
    if model == TransformModel::Homography && src.len() < 4 {
        return Err(AlignmentError::InsufficientFiducials {
            matched: src.len(),
            required: 4,
            candidates: candidates.len(),
        });
    }
    let h = match model {
        TransformModel::Homography => estimate_homography_dlt(&src, &dst),
        _ => estimate_affine_lsq(&src, &dst),
    }
    .map_err(|e| AlignmentError::DegenerateTransform(e.to_string()))?;
    Ok((h, model))
}

/// Geometric-mean pixel scale at the page center, 0.0 when undefined.
fn transform_scale(h: &Matrix3<f64>, page: [f64; 2]) -> f64 {
    crate::homography::local_jacobian(h, [0.5 * page[0], 0.5 * page[1]])
        .map(|j| j.determinant().abs().sqrt())
        .unwrap_or(0.0)
}

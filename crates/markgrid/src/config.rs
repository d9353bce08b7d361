//! Grading configuration.
//!
//! [`GradeConfig`] is an immutable value passed into every run; there is no
//! process-wide tuning state. All fields have defaults so a partial
//! `config.json` only overrides what it names.

use std::path::Path;

use crate::error::ConfigError;
use crate::template::Template;

/// Transform family fitted to the matched fiducials.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransformModel {
    /// Homography with four or more matches, affine with exactly three.
    #[default]
    Auto,
    /// Least-squares affine transform (flat scans).
    Affine,
    /// Projective transform (photographs). Needs four matches.
    Homography,
}

/// Fiducial candidate detection parameters.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
#[serde(default)]
pub struct FiducialDetectionConfig {
    /// Box-filter radius for the local background, in expected fiducial sizes.
    pub background_radius_factor: f32,
    /// A pixel joins the dark mask when it is this much darker (relative)
    /// than its local background.
    pub mask_contrast: f32,
    /// Relative slack on the expected fiducial size, applied on top of the
    /// scale range in [`DistortionBounds`].
    pub size_tolerance: f32,
    /// Minimum compactness (1.0 for a disk, ~0.95 for a square).
    pub min_compactness: f32,
    /// Maximum ratio between the principal axes of a candidate blob.
    pub max_elongation: f32,
    /// Initial matching gate as a fraction of the projected page diagonal.
    pub match_gate_frac: f32,
    /// Gate used when re-matching against the fitted transform, in fiducial sizes.
    pub refine_gate_factor: f32,
    /// A fiducial is reported ambiguous when another compatible candidate is
    /// within this factor of the assigned candidate's distance.
    pub ambiguity_ratio: f32,
}

impl Default for FiducialDetectionConfig {
    fn default() -> Self {
        Self {
            background_radius_factor: 2.0,
            mask_contrast: 0.25,
            size_tolerance: 0.3,
            min_compactness: 0.75,
            max_elongation: 1.8,
            match_gate_frac: 0.1,
            refine_gate_factor: 1.0,
            ambiguity_ratio: 1.25,
        }
    }
}

/// Plausible capture ranges for the fitted transform.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
#[serde(default)]
pub struct DistortionBounds {
    /// Minimum scale relative to the page fitted into the image.
    pub min_scale_ratio: f64,
    /// Maximum scale relative to the page fitted into the image.
    pub max_scale_ratio: f64,
    /// Maximum ratio between the two axis scales.
    pub max_anisotropy: f64,
    /// Maximum deviation from perpendicular axes, in degrees.
    pub max_skew_deg: f64,
    /// Maximum in-plane rotation, in degrees.
    pub max_rotation_deg: f64,
}

impl Default for DistortionBounds {
    fn default() -> Self {
        Self {
            min_scale_ratio: 0.5,
            max_scale_ratio: 1.5,
            max_anisotropy: 1.35,
            max_skew_deg: 12.0,
            max_rotation_deg: 25.0,
        }
    }
}

/// Bubble sampling parameters.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
#[serde(default)]
pub struct SamplerConfig {
    /// Fraction of the bubble half-size that is sampled; excludes the printed outline.
    pub inset: f32,
    /// Relative darkness below the local background that counts as ink.
    pub dark_contrast: f32,
    /// Side of the background window, in bubble sizes.
    pub background_window: f32,
    /// Percentile of the window intensities taken as paper level.
    pub background_percentile: f32,
    /// Bubbles with fewer in-image sample pixels are unreadable.
    pub min_pixels: usize,
}

impl Default for SamplerConfig {
    fn default() -> Self {
        Self {
            inset: 0.7,
            dark_contrast: 0.3,
            background_window: 2.2,
            background_percentile: 0.9,
            min_pixels: 1,
        }
    }
}

/// Scoring policy switches.
#[derive(Debug, Clone, Default, PartialEq, serde::Serialize, serde::Deserialize)]
#[serde(default)]
pub struct ScoringPolicy {
    /// Award partial credit to a `multiple` decision that contains a correct option.
    pub lenient_multiple: bool,
}

/// Top-level grading configuration.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
#[serde(default)]
pub struct GradeConfig {
    /// Minimum number of matched fiducials (at least 3).
    pub fiducial_quorum: usize,
    /// Maximum RMS fiducial residual, in projected fiducial sizes.
    pub max_alignment_residual: f64,
    /// Required ratio between the top bubble's lift above the question
    /// background and the runner-up's lift for a `single` decision.
    pub marked_margin_factor: f32,
    /// Darkness difference under which two marked bubbles are considered tied.
    pub tie_margin: f32,
    /// Darkness floor below which a bubble is never considered marked.
    pub min_mark_darkness: f32,
    /// Maximum number of sheets graded in parallel; `None` uses one worker per core.
    pub concurrency_limit: Option<usize>,
    pub transform_model: TransformModel,
    pub fiducials: FiducialDetectionConfig,
    pub distortion: DistortionBounds,
    pub sampler: SamplerConfig,
    pub scoring: ScoringPolicy,
}

impl Default for GradeConfig {
    fn default() -> Self {
        Self {
            fiducial_quorum: 3,
            max_alignment_residual: 0.5,
            marked_margin_factor: 2.0,
            tie_margin: 0.15,
            min_mark_darkness: 0.35,
            concurrency_limit: None,
            transform_model: TransformModel::Auto,
            fiducials: FiducialDetectionConfig::default(),
            distortion: DistortionBounds::default(),
            sampler: SamplerConfig::default(),
            scoring: ScoringPolicy::default(),
        }
    }
}

fn check(ok: bool, field: &'static str, reason: &str) -> Result<(), ConfigError> {
    if ok {
        Ok(())
    } else {
        Err(ConfigError::InvalidValue {
            field,
            reason: reason.to_string(),
        })
    }
}

fn unit_interval(v: f32) -> bool {
    v.is_finite() && (0.0..=1.0).contains(&v)
}

impl GradeConfig {
    /// Parse a configuration from JSON. Missing fields take their defaults.
    pub fn from_json_str(data: &str) -> Result<Self, ConfigError> {
        let config: Self =
            serde_json::from_str(data).map_err(|e| ConfigError::Parse(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Load and validate a configuration file.
    pub fn from_json_file(path: &Path) -> Result<Self, ConfigError> {
        let data = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::Io(format!("{}: {}", path.display(), e)))?;
        Self::from_json_str(&data)
    }

    /// Check value ranges that do not depend on a template.
    pub fn validate(&self) -> Result<(), ConfigError> {
        check(self.fiducial_quorum >= 3, "fiducial_quorum", "must be >= 3")?;
        check(
            self.max_alignment_residual.is_finite() && self.max_alignment_residual > 0.0,
            "max_alignment_residual",
            "must be finite and > 0",
        )?;
        check(
            self.marked_margin_factor.is_finite() && self.marked_margin_factor >= 1.0,
            "marked_margin_factor",
            "must be finite and >= 1",
        )?;
        check(unit_interval(self.tie_margin), "tie_margin", "must be in [0, 1]")?;
        check(
            unit_interval(self.min_mark_darkness) && self.min_mark_darkness > 0.0,
            "min_mark_darkness",
            "must be in (0, 1]",
        )?;
        check(
            self.concurrency_limit != Some(0),
            "concurrency_limit",
            "must be >= 1 when set",
        )?;

        let f = &self.fiducials;
        check(
            f.background_radius_factor.is_finite() && f.background_radius_factor > 0.0,
            "fiducials.background_radius_factor",
            "must be finite and > 0",
        )?;
        check(
            unit_interval(f.mask_contrast) && f.mask_contrast > 0.0,
            "fiducials.mask_contrast",
            "must be in (0, 1]",
        )?;
        check(
            unit_interval(f.size_tolerance),
            "fiducials.size_tolerance",
            "must be in [0, 1]",
        )?;
        check(
            unit_interval(f.min_compactness),
            "fiducials.min_compactness",
            "must be in [0, 1]",
        )?;
        check(
            f.max_elongation.is_finite() && f.max_elongation >= 1.0,
            "fiducials.max_elongation",
            "must be finite and >= 1",
        )?;
        check(
            f.match_gate_frac.is_finite() && f.match_gate_frac > 0.0,
            "fiducials.match_gate_frac",
            "must be finite and > 0",
        )?;
        check(
            f.refine_gate_factor.is_finite() && f.refine_gate_factor > 0.0,
            "fiducials.refine_gate_factor",
            "must be finite and > 0",
        )?;
        check(
            f.ambiguity_ratio.is_finite() && f.ambiguity_ratio >= 1.0,
            "fiducials.ambiguity_ratio",
            "must be finite and >= 1",
        )?;

        let d = &self.distortion;
        check(
            d.min_scale_ratio.is_finite()
                && d.min_scale_ratio > 0.0
                && d.max_scale_ratio.is_finite()
                && d.max_scale_ratio >= d.min_scale_ratio,
            "distortion.min_scale_ratio",
            "scale range must be finite, positive and ordered",
        )?;
        check(
            d.max_anisotropy.is_finite() && d.max_anisotropy >= 1.0,
            "distortion.max_anisotropy",
            "must be finite and >= 1",
        )?;
        check(
            d.max_skew_deg.is_finite() && (0.0..90.0).contains(&d.max_skew_deg),
            "distortion.max_skew_deg",
            "must be in [0, 90)",
        )?;
        check(
            d.max_rotation_deg.is_finite() && (0.0..=180.0).contains(&d.max_rotation_deg),
            "distortion.max_rotation_deg",
            "must be in [0, 180]",
        )?;

        let s = &self.sampler;
        check(
            s.inset.is_finite() && s.inset > 0.0 && s.inset <= 1.0,
            "sampler.inset",
            "must be in (0, 1]",
        )?;
        check(
            unit_interval(s.dark_contrast) && s.dark_contrast > 0.0,
            "sampler.dark_contrast",
            "must be in (0, 1]",
        )?;
        check(
            s.background_window.is_finite() && s.background_window >= 1.0,
            "sampler.background_window",
            "must be finite and >= 1",
        )?;
        check(
            unit_interval(s.background_percentile),
            "sampler.background_percentile",
            "must be in [0, 1]",
        )?;
        check(s.min_pixels >= 1, "sampler.min_pixels", "must be >= 1")?;

        Ok(())
    }

    /// Full validation, including constraints that depend on the template.
    pub fn validate_for(&self, template: &Template) -> Result<(), ConfigError> {
        self.validate()?;
        let declared = template.fiducials().len();
        if self.fiducial_quorum > declared {
            return Err(ConfigError::QuorumExceedsFiducials {
                quorum: self.fiducial_quorum,
                declared,
            });
        }
        if self.transform_model == TransformModel::Homography && declared < 4 {
            return Err(ConfigError::InvalidValue {
                field: "transform_model",
                reason: format!("homography needs 4 fiducials, template declares {declared}"),
            });
        }
        Ok(())
    }
}

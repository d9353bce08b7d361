//! Serialized template schema (`markgrid.template.v1`).
//!
//! Field blocks are parametric: bubble positions are generated at load time
//! from `(origin, field_labels, bubble_values, direction, gaps)`. Per-bubble
//! coordinate lists are not part of the schema.

use std::collections::BTreeMap;

use crate::error::TemplateError;

pub(crate) const TEMPLATE_SCHEMA_V1: &str = "markgrid.template.v1";

/// Shape of a bubble's sampling region.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BubbleShape {
    /// Ellipse inscribed in the bubble box.
    #[default]
    Circle,
    /// The full bubble box.
    Rect,
}

/// Printed shape of a fiducial marker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FiducialShape {
    #[default]
    Square,
    Circle,
}

/// Layout direction of a field block.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    /// One question per row, options left to right.
    #[default]
    Horizontal,
    /// One question per column, options top to bottom.
    Vertical,
}

fn default_min_contrast() -> f32 {
    0.35
}

/// Fiducial marker descriptor.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
#[serde(deny_unknown_fields)]
pub struct FiducialSpec {
    pub name: String,
    /// Marker center in template units.
    pub center: [f64; 2],
    /// Side length (square) or diameter (circle) in template units.
    pub size: f64,
    #[serde(default)]
    pub shape: FiducialShape,
    /// Minimum relative contrast against the local background.
    #[serde(default = "default_min_contrast")]
    pub min_contrast: f32,
}

/// Parametric grid of bubbles.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
#[serde(deny_unknown_fields)]
pub struct FieldBlockSpec {
    pub name: String,
    /// Top-left corner of the first bubble box.
    pub origin: [f64; 2],
    /// Question labels; `"q1..5"` expands to `q1, q2, ..., q5`.
    pub field_labels: Vec<String>,
    /// Option labels, in layout order.
    pub bubble_values: Vec<String>,
    #[serde(default)]
    pub direction: Direction,
    /// Distance between neighbouring options of one question.
    pub bubbles_gap: f64,
    /// Distance between neighbouring questions.
    pub labels_gap: f64,
    /// Overrides the template-wide bubble size.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bubble_size: Option<[f64; 2]>,
}

/// Inline template definition, as stored in `template.json`.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TemplateSpec {
    pub schema: String,
    pub name: String,
    /// Page `[width, height]` in template units.
    pub page_size: [f64; 2],
    /// Default bubble box `[width, height]`.
    pub bubble_size: [f64; 2],
    #[serde(default)]
    pub bubble_shape: BubbleShape,
    /// Response value for unmarked questions.
    #[serde(default)]
    pub empty_value: String,
    /// Optional closed set of question ids.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub questions: Option<Vec<String>>,
    pub fiducials: Vec<FiducialSpec>,
    pub field_blocks: Vec<FieldBlockSpec>,
    /// Labels whose response is the concatenation of several questions.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub custom_labels: BTreeMap<String, Vec<String>>,
}

impl TemplateSpec {
    pub fn from_json_str(data: &str) -> Result<Self, TemplateError> {
        serde_json::from_str(data).map_err(|e| TemplateError::Parse(e.to_string()))
    }
}

/// Expand field labels, resolving `prefixA..B` ranges.
pub(crate) fn expand_field_labels(labels: &[String]) -> Result<Vec<String>, TemplateError> {
    let mut out = Vec::with_capacity(labels.len());
    for label in labels {
        let label = label.trim();
        if label.is_empty() {
            return Err(TemplateError::MalformedLabel(label.to_string()));
        }
        match label.split_once("..") {
            None => out.push(label.to_string()),
            Some((head, tail)) => out.extend(expand_range(label, head, tail)?),
        }
    }
    Ok(out)
}

fn expand_range(label: &str, head: &str, tail: &str) -> Result<Vec<String>, TemplateError> {
    let malformed = || TemplateError::MalformedLabel(label.to_string());
    let digits_at = head
        .char_indices()
        .rev()
        .take_while(|(_, c)| c.is_ascii_digit())
        .last()
        .map(|(i, _)| i)
        .ok_or_else(malformed)?;
    let (prefix, start) = head.split_at(digits_at);
    let start: u32 = start.parse().map_err(|_| malformed())?;
    let end: u32 = tail.trim().parse().map_err(|_| malformed())?;
    if end < start {
        return Err(malformed());
    }
    Ok((start..=end).map(|n| format!("{prefix}{n}")).collect())
}

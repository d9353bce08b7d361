//! Template model: validated, indexed description of a sheet family.
//!
//! A [`Template`] is built once from a [`TemplateSpec`] and never mutated
//! afterwards. Bubbles live in a flat arena addressed by `usize` index;
//! questions and field blocks refer to bubbles by index, and a question-id
//! map gives O(1) lookup for the decision stage.

mod spec;

use std::collections::HashMap;
use std::path::Path;

pub use spec::{
    BubbleShape, Direction, FiducialShape, FiducialSpec, FieldBlockSpec, TemplateSpec,
};

use crate::error::TemplateError;
use spec::{expand_field_labels, TEMPLATE_SCHEMA_V1};

const GEOMETRY_EPS: f64 = 1e-9;

/// A single markable region.
#[derive(Debug, Clone, PartialEq)]
pub struct Bubble {
    /// Owning field block index.
    pub block: usize,
    /// Grid row inside the block.
    pub row: usize,
    /// Grid column inside the block.
    pub col: usize,
    /// Owning question index.
    pub question: usize,
    /// Option label.
    pub option: String,
    /// Center in template units.
    pub center: [f64; 2],
    /// Box `[width, height]` in template units.
    pub size: [f64; 2],
    pub shape: BubbleShape,
}

impl Bubble {
    /// Axis-aligned box `[min_x, min_y, max_x, max_y]`.
    pub fn bounds(&self) -> [f64; 4] {
        let hw = 0.5 * self.size[0];
        let hh = 0.5 * self.size[1];
        [
            self.center[0] - hw,
            self.center[1] - hh,
            self.center[0] + hw,
            self.center[1] + hh,
        ]
    }
}

/// One question and its option bubbles, in declared option order.
#[derive(Debug, Clone, PartialEq)]
pub struct Question {
    pub id: String,
    pub block: usize,
    pub bubbles: Vec<usize>,
}

/// A rectangular grid of bubbles.
#[derive(Debug, Clone, PartialEq)]
pub struct FieldBlock {
    pub name: String,
    pub rows: usize,
    pub cols: usize,
    /// `[min_x, min_y, max_x, max_y]` over all bubble boxes.
    pub bounds: [f64; 4],
    /// Row-major bubble indices.
    cells: Vec<usize>,
}

impl FieldBlock {
    /// Bubble index at `(row, col)`.
    pub fn cell(&self, row: usize, col: usize) -> Option<usize> {
        if row >= self.rows || col >= self.cols {
            return None;
        }
        self.cells.get(row * self.cols + col).copied()
    }
}

/// Validated fiducial marker.
#[derive(Debug, Clone, PartialEq)]
pub struct Fiducial {
    pub name: String,
    pub center: [f64; 2],
    pub size: f64,
    pub shape: FiducialShape,
    pub min_contrast: f32,
}

impl Fiducial {
    /// Printed ink area in template units squared.
    pub fn area(&self) -> f64 {
        match self.shape {
            FiducialShape::Square => self.size * self.size,
            FiducialShape::Circle => std::f64::consts::FRAC_PI_4 * self.size * self.size,
        }
    }
}

/// Immutable, validated sheet-family description.
#[derive(Debug, Clone)]
pub struct Template {
    name: String,
    page_size: [f64; 2],
    empty_value: String,
    fiducials: Vec<Fiducial>,
    blocks: Vec<FieldBlock>,
    bubbles: Vec<Bubble>,
    questions: Vec<Question>,
    question_index: HashMap<String, usize>,
    custom_labels: Vec<(String, Vec<usize>)>,
}

impl Template {
    /// Parse and validate a template from JSON.
    pub fn from_json_str(data: &str) -> Result<Self, TemplateError> {
        Self::from_spec(TemplateSpec::from_json_str(data)?)
    }

    /// Load and validate a template file.
    pub fn from_json_file(path: &Path) -> Result<Self, TemplateError> {
        let data = std::fs::read_to_string(path)
            .map_err(|e| TemplateError::Io(format!("{}: {}", path.display(), e)))?;
        Self::from_json_str(&data)
    }

    /// Validate a spec and build the indexed representation.
    pub fn from_spec(spec: TemplateSpec) -> Result<Self, TemplateError> {
        if spec.schema != TEMPLATE_SCHEMA_V1 {
            return Err(TemplateError::UnsupportedSchema {
                found: spec.schema,
                expected: TEMPLATE_SCHEMA_V1,
            });
        }
        validate_header(&spec)?;
        let fiducials = build_fiducials(&spec)?;

        let mut builder = GridBuilder::new(&spec);
        for (block_idx, block) in spec.field_blocks.iter().enumerate() {
            builder.add_block(block_idx, block)?;
        }
        let GridBuilder {
            blocks,
            bubbles,
            questions,
            question_index,
            ..
        } = builder;

        if let Some(declared) = &spec.questions {
            for q in declared {
                if !question_index.contains_key(q) {
                    return Err(TemplateError::Invalid(format!(
                        "declared question '{q}' has no bubbles"
                    )));
                }
            }
        }
        check_collisions(&bubbles, &questions)?;

        let mut custom_labels = Vec::with_capacity(spec.custom_labels.len());
        for (label, members) in &spec.custom_labels {
            let mut indices = Vec::with_capacity(members.len());
            for q in expand_field_labels(members)? {
                let idx = *question_index.get(&q).ok_or_else(|| {
                    TemplateError::UnknownCustomLabelQuestion {
                        label: label.clone(),
                        question: q.clone(),
                    }
                })?;
                indices.push(idx);
            }
            custom_labels.push((label.clone(), indices));
        }

        Ok(Self {
            name: spec.name,
            page_size: spec.page_size,
            empty_value: spec.empty_value,
            fiducials,
            blocks,
            bubbles,
            questions,
            question_index,
            custom_labels,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Page `[width, height]` in template units.
    pub fn page_size(&self) -> [f64; 2] {
        self.page_size
    }

    pub fn empty_value(&self) -> &str {
        &self.empty_value
    }

    pub fn fiducials(&self) -> &[Fiducial] {
        &self.fiducials
    }

    pub fn blocks(&self) -> &[FieldBlock] {
        &self.blocks
    }

    pub fn bubbles(&self) -> &[Bubble] {
        &self.bubbles
    }

    pub fn bubble(&self, idx: usize) -> Option<&Bubble> {
        self.bubbles.get(idx)
    }

    /// Questions in declaration order.
    pub fn questions(&self) -> &[Question] {
        &self.questions
    }

    /// Index of a question id.
    pub fn question_index(&self, id: &str) -> Option<usize> {
        self.question_index.get(id).copied()
    }

    pub fn question(&self, id: &str) -> Option<&Question> {
        self.question_index(id).map(|i| &self.questions[i])
    }

    /// All option bubbles of a question, in declared option order.
    pub fn question_bubbles(&self, id: &str) -> Option<&[usize]> {
        self.question(id).map(|q| q.bubbles.as_slice())
    }

    /// Logical `(question, option)` pair of a block cell.
    pub fn cell(&self, block: usize, row: usize, col: usize) -> Option<(&str, &str)> {
        let bubble = &self.bubbles[self.blocks.get(block)?.cell(row, col)?];
        Some((
            self.questions[bubble.question].id.as_str(),
            bubble.option.as_str(),
        ))
    }

    /// Custom labels and the question indices they concatenate.
    pub fn custom_labels(&self) -> &[(String, Vec<usize>)] {
        &self.custom_labels
    }

    /// Mean declared fiducial size.
    pub fn mean_fiducial_size(&self) -> f64 {
        let n = self.fiducials.len().max(1) as f64;
        self.fiducials.iter().map(|f| f.size).sum::<f64>() / n
    }

    /// Human-readable `question/option` name of a bubble.
    pub fn bubble_label(&self, idx: usize) -> String {
        let b = &self.bubbles[idx];
        format!("{}/{}", self.questions[b.question].id, b.option)
    }
}

fn positive_finite(v: f64) -> bool {
    v.is_finite() && v > 0.0
}

fn inside_page(bounds: [f64; 4], page: [f64; 2]) -> bool {
    bounds[0] >= -GEOMETRY_EPS
        && bounds[1] >= -GEOMETRY_EPS
        && bounds[2] <= page[0] + GEOMETRY_EPS
        && bounds[3] <= page[1] + GEOMETRY_EPS
}

fn validate_header(spec: &TemplateSpec) -> Result<(), TemplateError> {
    if spec.name.trim().is_empty() {
        return Err(TemplateError::Invalid("template name must not be empty".into()));
    }
    if !spec.page_size.iter().all(|&v| positive_finite(v)) {
        return Err(TemplateError::Invalid(
            "page_size must be finite and > 0".into(),
        ));
    }
    if !spec.bubble_size.iter().all(|&v| positive_finite(v)) {
        return Err(TemplateError::Invalid(
            "bubble_size must be finite and > 0".into(),
        ));
    }
    if spec.field_blocks.is_empty() {
        return Err(TemplateError::Invalid(
            "template must declare at least one field block".into(),
        ));
    }
    Ok(())
}

fn build_fiducials(spec: &TemplateSpec) -> Result<Vec<Fiducial>, TemplateError> {
    if spec.fiducials.len() < 3 {
        return Err(TemplateError::TooFewFiducials {
            found: spec.fiducials.len(),
        });
    }
    let mut out = Vec::with_capacity(spec.fiducials.len());
    for f in &spec.fiducials {
        if !positive_finite(f.size) || !f.center.iter().all(|v| v.is_finite()) {
            return Err(TemplateError::Invalid(format!(
                "fiducial '{}' has non-finite or non-positive geometry",
                f.name
            )));
        }
        if !(0.0..=1.0).contains(&f.min_contrast) {
            return Err(TemplateError::Invalid(format!(
                "fiducial '{}' min_contrast must be in [0, 1]",
                f.name
            )));
        }
        let half = 0.5 * f.size;
        let bounds = [
            f.center[0] - half,
            f.center[1] - half,
            f.center[0] + half,
            f.center[1] + half,
        ];
        if !inside_page(bounds, spec.page_size) {
            return Err(TemplateError::OutOfBounds {
                what: "fiducial",
                name: f.name.clone(),
                page_size: spec.page_size,
            });
        }
        out.push(Fiducial {
            name: f.name.clone(),
            center: f.center,
            size: f.size,
            shape: f.shape,
            min_contrast: f.min_contrast,
        });
    }

    let centers: Vec<[f64; 2]> = out.iter().map(|f| f.center).collect();
    let page_area = spec.page_size[0] * spec.page_size[1];
    if max_triangle_area(&centers) <= 1e-6 * page_area {
        return Err(TemplateError::CollinearFiducials);
    }
    Ok(out)
}

/// Largest triangle spanned by any three points (O(n^3), n is tiny).
pub(crate) fn max_triangle_area(points: &[[f64; 2]]) -> f64 {
    let mut best = 0.0f64;
    for i in 0..points.len() {
        for j in (i + 1)..points.len() {
            for k in (j + 1)..points.len() {
                let [ax, ay] = points[i];
                let [bx, by] = points[j];
                let [cx, cy] = points[k];
                let area = 0.5 * ((bx - ax) * (cy - ay) - (by - ay) * (cx - ax)).abs();
                best = best.max(area);
            }
        }
    }
    best
}

struct GridBuilder<'a> {
    spec: &'a TemplateSpec,
    blocks: Vec<FieldBlock>,
    bubbles: Vec<Bubble>,
    questions: Vec<Question>,
    question_index: HashMap<String, usize>,
}

impl<'a> GridBuilder<'a> {
    fn new(spec: &'a TemplateSpec) -> Self {
        Self {
            spec,
            blocks: Vec::new(),
            bubbles: Vec::new(),
            questions: Vec::new(),
            question_index: HashMap::new(),
        }
    }

    fn add_block(&mut self, block_idx: usize, block: &FieldBlockSpec) -> Result<(), TemplateError> {
        let invalid = |what: &str| {
            TemplateError::Invalid(format!("field block '{}': {}", block.name, what))
        };
        if block.name.trim().is_empty() {
            return Err(TemplateError::Invalid(
                "field block name must not be empty".into(),
            ));
        }
        if !block.origin.iter().all(|v| v.is_finite()) {
            return Err(invalid("origin must be finite"));
        }
        if !positive_finite(block.bubbles_gap) || !positive_finite(block.labels_gap) {
            return Err(invalid("bubbles_gap and labels_gap must be finite and > 0"));
        }
        if block.bubble_values.is_empty() {
            return Err(invalid("bubble_values must not be empty"));
        }
        let size = block.bubble_size.unwrap_or(self.spec.bubble_size);
        if !size.iter().all(|&v| positive_finite(v)) {
            return Err(invalid("bubble_size must be finite and > 0"));
        }

        let labels = expand_field_labels(&block.field_labels)?;
        if labels.is_empty() {
            return Err(invalid("field_labels must not be empty"));
        }

        let (rows, cols) = match block.direction {
            Direction::Horizontal => (labels.len(), block.bubble_values.len()),
            Direction::Vertical => (block.bubble_values.len(), labels.len()),
        };
        let mut cells = vec![usize::MAX; rows * cols];
        let mut bounds = [f64::INFINITY, f64::INFINITY, f64::NEG_INFINITY, f64::NEG_INFINITY];

        for (label_idx, label) in labels.iter().enumerate() {
            if let Some(declared) = &self.spec.questions {
                if !declared.iter().any(|q| q == label) {
                    return Err(TemplateError::UndefinedQuestion {
                        block: block.name.clone(),
                        question: label.clone(),
                        option: block.bubble_values[0].clone(),
                    });
                }
            }
            if let Some(&existing) = self.question_index.get(label) {
                return Err(TemplateError::DuplicateQuestion {
                    question: label.clone(),
                    first_block: self.block_name(self.questions[existing].block, block_idx, block),
                    second_block: block.name.clone(),
                });
            }

            let question_idx = self.questions.len();
            let mut option_bubbles = Vec::with_capacity(block.bubble_values.len());
            for (value_idx, value) in block.bubble_values.iter().enumerate() {
                if block.bubble_values[..value_idx].contains(value) {
                    return Err(TemplateError::DuplicateOption {
                        question: label.clone(),
                        option: value.clone(),
                    });
                }
                let (row, col, dx, dy) = match block.direction {
                    Direction::Horizontal => (
                        label_idx,
                        value_idx,
                        value_idx as f64 * block.bubbles_gap,
                        label_idx as f64 * block.labels_gap,
                    ),
                    Direction::Vertical => (
                        value_idx,
                        label_idx,
                        label_idx as f64 * block.labels_gap,
                        value_idx as f64 * block.bubbles_gap,
                    ),
                };
                let bubble = Bubble {
                    block: block_idx,
                    row,
                    col,
                    question: question_idx,
                    option: value.clone(),
                    center: [
                        block.origin[0] + dx + 0.5 * size[0],
                        block.origin[1] + dy + 0.5 * size[1],
                    ],
                    size,
                    shape: self.spec.bubble_shape,
                };
                let b = bubble.bounds();
                bounds = [
                    bounds[0].min(b[0]),
                    bounds[1].min(b[1]),
                    bounds[2].max(b[2]),
                    bounds[3].max(b[3]),
                ];
                let bubble_idx = self.bubbles.len();
                cells[row * cols + col] = bubble_idx;
                option_bubbles.push(bubble_idx);
                self.bubbles.push(bubble);
            }

            self.question_index.insert(label.clone(), question_idx);
            self.questions.push(Question {
                id: label.clone(),
                block: block_idx,
                bubbles: option_bubbles,
            });
        }

        if !inside_page(bounds, self.spec.page_size) {
            return Err(TemplateError::OutOfBounds {
                what: "field block",
                name: block.name.clone(),
                page_size: self.spec.page_size,
            });
        }

        self.blocks.push(FieldBlock {
            name: block.name.clone(),
            rows,
            cols,
            bounds,
            cells,
        });
        Ok(())
    }

    fn block_name(&self, idx: usize, current_idx: usize, current: &FieldBlockSpec) -> String {
        if idx == current_idx {
            current.name.clone()
        } else {
            self.blocks[idx].name.clone()
        }
    }
}

/// Reject overlapping bubble boxes with a sweep over x-sorted boxes.
fn check_collisions(bubbles: &[Bubble], questions: &[Question]) -> Result<(), TemplateError> {
    let bounds: Vec<[f64; 4]> = bubbles.iter().map(Bubble::bounds).collect();
    let mut order: Vec<usize> = (0..bubbles.len()).collect();
    order.sort_by(|&a, &b| bounds[a][0].total_cmp(&bounds[b][0]));

    let name = |i: usize| format!("{}/{}", questions[bubbles[i].question].id, bubbles[i].option);
    for (pos, &i) in order.iter().enumerate() {
        let a = bounds[i];
        for &j in &order[pos + 1..] {
            let b = bounds[j];
            if b[0] >= a[2] - GEOMETRY_EPS {
                break;
            }
            let overlap_y = b[1] < a[3] - GEOMETRY_EPS && a[1] < b[3] - GEOMETRY_EPS;
            if overlap_y {
                let (first, second) = if i < j { (i, j) } else { (j, i) };
                return Err(TemplateError::BubbleCollision {
                    first: name(first),
                    second: name(second),
                });
            }
        }
    }
    Ok(())
}

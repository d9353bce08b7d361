//! markgrid — optical mark recognition grading engine.
//!
//! Grades scanned or photographed answer sheets against a declarative
//! template. Per sheet, the pipeline stages are:
//!
//! 1. **Align** – detect fiducial markers, match them to the template by
//!    optimal assignment, fit an affine or projective transform and reject
//!    implausible fits.
//! 2. **Sample** – project every bubble into the image and measure its
//!    darkness against a local background estimate.
//! 3. **Decide** – turn each question's signals into a `single`, `none`,
//!    `multiple` or `low_confidence` outcome with adaptive thresholds.
//! 4. **Score** – compare decisions with an optional answer key.
//!
//! Batches run on a bounded worker pool; one bad sheet never aborts the batch.
//!
//! # Public API
//! - [`Grader`] and [`grade`] as primary entry points
//! - [`Template`] and [`GradeConfig`] for inputs, [`AnswerKey`] for scoring
//! - [`BatchResult`] / [`SheetRecord`] result structures
//! - [`synth`] for rendering synthetic sheets in tests and tooling

mod align;
mod api;
mod capture;
mod config;
mod decision;
mod error;
mod homography;
mod pipeline;
mod sampler;
mod scoring;
pub mod synth;
mod template;

pub use align::{align, AlignmentResult, FiducialMatch, TransformShape};
pub use api::{
    grade, GradeRequest, Grader, TemplateRef, TemplateRegistry, WorkDir, IMAGE_EXTENSIONS,
};
pub use capture::{CapturedImage, Orientation};
pub use config::{
    DistortionBounds, FiducialDetectionConfig, GradeConfig, SamplerConfig, ScoringPolicy,
    TransformModel,
};
pub use decision::{
    decide_question, decide_sheet, Decision, DecisionStatus, LowConfidenceReason,
    QuestionDecision,
};
pub use error::{AlignmentError, ConfigError, GradeError, KeyError, TemplateError};
pub use pipeline::{
    BatchResult, CancelToken, SheetFailure, SheetOutcome, SheetRecord, SheetResult, SheetStage,
};
pub use sampler::{sample_bubbles, BubbleReading, BubbleSignal, BubbleStats, SamplingGap};
pub use scoring::{
    score_sheet, AnswerKey, BatchStats, KeyEntry, QuestionScore, QuestionStats, SheetScore,
    Verdict,
};
pub use template::{
    Bubble, BubbleShape, Direction, FieldBlock, FieldBlockSpec, Fiducial, FiducialShape,
    FiducialSpec, Question, Template, TemplateSpec,
};

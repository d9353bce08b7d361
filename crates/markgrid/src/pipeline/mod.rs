//! Pipeline orchestrator: per-sheet stage machine and batch supervision.
//!
//! Each sheet runs `aligning → sampling → deciding → scoring → done` in
//! isolation, preceded by `loading` when it is graded from a file. Any
//! failure (including a panic) becomes a per-sheet [`SheetFailure`]; the
//! batch keeps going and returns records in submission order.

mod batch;
mod sheet;

use std::collections::BTreeMap;
use std::path::PathBuf;

pub use batch::CancelToken;

use crate::align::AlignmentResult;
use crate::capture::{sheet_id_of, CapturedImage, Orientation};
use crate::config::GradeConfig;
use crate::decision::QuestionDecision;
use crate::error::GradeError;
use crate::sampler::BubbleSignal;
use crate::scoring::{AnswerKey, BatchStats, SheetScore};
use crate::template::Template;

/// Processing stage of one sheet.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SheetStage {
    Pending,
    /// Decoding the image file.
    Loading,
    Aligning,
    Sampling,
    Deciding,
    Scoring,
    Done,
}

impl std::fmt::Display for SheetStage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Self::Pending => "pending",
            Self::Loading => "loading",
            Self::Aligning => "aligning",
            Self::Sampling => "sampling",
            Self::Deciding => "deciding",
            Self::Scoring => "scoring",
            Self::Done => "done",
        })
    }
}

/// Stage at which a sheet failed, with a human-readable reason.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct SheetFailure {
    pub stage: SheetStage,
    pub reason: String,
}

impl std::fmt::Display for SheetFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "failed while {}: {}", self.stage, self.reason)
    }
}

/// Everything produced for a successfully graded sheet.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct SheetResult {
    pub sheet_id: String,
    /// Upright image `[width, height]`.
    pub image_size: [u32; 2],
    pub alignment: AlignmentResult,
    /// One decision per question, in template order.
    pub decisions: Vec<QuestionDecision>,
    /// Raw per-bubble signals, in bubble arena order.
    pub signals: Vec<BubbleSignal>,
    /// Response string per question, with custom labels concatenated.
    pub responses: BTreeMap<String, String>,
    /// Number of questions decided `multiple`.
    pub multi_marked: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub score: Option<SheetScore>,
}

impl SheetResult {
    pub fn decision(&self, question: &str) -> Option<&crate::decision::Decision> {
        self.decisions
            .iter()
            .find(|d| d.question == question)
            .map(|d| &d.decision)
    }

    /// Whether any question needs a human reviewer.
    pub fn needs_review(&self) -> bool {
        self.decisions.iter().any(|d| d.decision.needs_review())
    }
}

#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum SheetOutcome {
    Graded(Box<SheetResult>),
    Failed(SheetFailure),
    /// Never started because the batch was cancelled.
    Cancelled,
}

#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct SheetRecord {
    pub sheet_id: String,
    pub outcome: SheetOutcome,
}

impl SheetRecord {
    pub fn result(&self) -> Option<&SheetResult> {
        match &self.outcome {
            SheetOutcome::Graded(r) => Some(r),
            _ => None,
        }
    }

    pub fn failure(&self) -> Option<&SheetFailure> {
        match &self.outcome {
            SheetOutcome::Failed(f) => Some(f),
            _ => None,
        }
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self.outcome, SheetOutcome::Cancelled)
    }
}

/// Records of a batch, in submission order, plus aggregate statistics.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct BatchResult {
    /// Template name.
    pub template: String,
    pub sheets: Vec<SheetRecord>,
    pub stats: BatchStats,
}

/// Shared, read-only inputs of every sheet in a run.
#[derive(Debug, Clone, Copy)]
pub(crate) struct RunContext<'a> {
    pub template: &'a Template,
    pub config: &'a GradeConfig,
    pub key: Option<&'a AnswerKey>,
}

pub(crate) fn grade_sheet(ctx: RunContext<'_>, image: &CapturedImage) -> SheetRecord {
    SheetRecord {
        sheet_id: image.id().to_string(),
        outcome: sheet::grade_one(ctx, image),
    }
}

pub(crate) fn grade_batch(
    ctx: RunContext<'_>,
    images: &[CapturedImage],
    cancel: Option<&CancelToken>,
) -> Result<BatchResult, GradeError> {
    tracing::info!(
        template = ctx.template.name(),
        sheets = images.len(),
        workers = ?ctx.config.concurrency_limit,
        "grading batch"
    );
    let outcomes = batch::supervise(images, ctx.config.concurrency_limit, cancel, |_, image| {
        sheet::grade_one(ctx, image)
    })?;

    let ids = images.iter().map(|image| image.id().to_string());
    Ok(finish_batch(ctx, ids, outcomes))
}

/// Grade image files, decoding each one on the worker that grades it so at
/// most `concurrency_limit` decoded images are alive at once. Files that
/// cannot be decoded fail at [`SheetStage::Loading`].
pub(crate) fn grade_paths(
    ctx: RunContext<'_>,
    paths: &[PathBuf],
    orientation: Orientation,
    cancel: Option<&CancelToken>,
) -> Result<BatchResult, GradeError> {
    tracing::info!(
        template = ctx.template.name(),
        sheets = paths.len(),
        workers = ?ctx.config.concurrency_limit,
        "grading image files"
    );
    let outcomes = batch::supervise(paths, ctx.config.concurrency_limit, cancel, |_, path| {
        sheet::load_and_grade(ctx, path, orientation)
    })?;
    let ids = paths.iter().map(|path| sheet_id_of(path));
    Ok(finish_batch(ctx, ids, outcomes))
}

fn finish_batch(
    ctx: RunContext<'_>,
    ids: impl Iterator<Item = String>,
    outcomes: Vec<Option<SheetOutcome>>,
) -> BatchResult {
    let sheets: Vec<SheetRecord> = ids
        .zip(outcomes)
        .map(|(sheet_id, outcome)| SheetRecord {
            sheet_id,
            outcome: outcome.unwrap_or(SheetOutcome::Cancelled),
        })
        .collect();
    let stats = BatchStats::from_records(ctx.template, &sheets);
    tracing::info!(
        graded = stats.n_graded,
        failed = stats.n_failed,
        cancelled = stats.n_cancelled,
        needing_review = stats.n_needing_review,
        "batch finished"
    );
    BatchResult {
        template: ctx.template.name().to_string(),
        sheets,
        stats,
    }
}

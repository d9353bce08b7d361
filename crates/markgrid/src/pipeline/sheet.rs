//! Per-sheet stage machine.

use std::any::Any;
use std::cell::Cell;
use std::collections::BTreeMap;
use std::panic::{self, AssertUnwindSafe};
use std::path::Path;

use super::{RunContext, SheetFailure, SheetOutcome, SheetResult, SheetStage};
use crate::align::align;
use crate::capture::{CapturedImage, Orientation};
use crate::decision::{decide_sheet, Decision, QuestionDecision};
use crate::sampler::sample_bubbles;
use crate::scoring::score_sheet;
use crate::template::Template;

pub(super) fn grade_one(ctx: RunContext<'_>, image: &CapturedImage) -> SheetOutcome {
    let outcome = isolated(|stage| run_stages(ctx, image, stage));
    if let SheetOutcome::Failed(failure) = &outcome {
        tracing::warn!(
            sheet = image.id(),
            stage = %failure.stage,
            reason = %failure.reason,
            "sheet failed"
        );
    }
    outcome
}

/// Decode `path` and grade it; the decoded image is dropped on return.
pub(super) fn load_and_grade(
    ctx: RunContext<'_>,
    path: &Path,
    orientation: Orientation,
) -> SheetOutcome {
    match CapturedImage::open(path) {
        Ok(image) => grade_one(ctx, &image.with_orientation(orientation)),
        Err(e) => {
            tracing::warn!(path = %path.display(), error = %e, "image not decodable");
            SheetOutcome::Failed(SheetFailure {
                stage: SheetStage::Loading,
                reason: e.to_string(),
            })
        }
    }
}

/// Run `f`, converting both errors and panics into a failure at the stage
/// `f` last entered.
fn isolated<F>(f: F) -> SheetOutcome
where
    F: FnOnce(&Cell<SheetStage>) -> Result<SheetResult, SheetFailure>,
{
    let stage = Cell::new(SheetStage::Pending);
    match panic::catch_unwind(AssertUnwindSafe(|| f(&stage))) {
        Ok(Ok(result)) => SheetOutcome::Graded(Box::new(result)),
        Ok(Err(failure)) => SheetOutcome::Failed(failure),
        Err(payload) => SheetOutcome::Failed(SheetFailure {
            stage: stage.get(),
            reason: format!("internal error: {}", panic_message(payload.as_ref())),
        }),
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> &str {
    if let Some(s) = payload.downcast_ref::<&str>() {
        *s
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.as_str()
    } else {
        "unknown panic"
    }
}

fn run_stages(
    ctx: RunContext<'_>,
    image: &CapturedImage,
    stage: &Cell<SheetStage>,
) -> Result<SheetResult, SheetFailure> {
    let _span = tracing::debug_span!("sheet", id = image.id()).entered();

    stage.set(SheetStage::Aligning);
    let gray = image.upright();
    let alignment = align(&gray, ctx.template, ctx.config).map_err(|e| SheetFailure {
        stage: SheetStage::Aligning,
        reason: e.to_string(),
    })?;

    stage.set(SheetStage::Sampling);
    let signals = sample_bubbles(
        &gray,
        ctx.template,
        &alignment.transform_matrix(),
        &ctx.config.sampler,
    );

    stage.set(SheetStage::Deciding);
    let decisions = decide_sheet(ctx.template, &signals, ctx.config);
    let responses = collect_responses(ctx.template, &decisions);
    let multi_marked = decisions
        .iter()
        .filter(|d| matches!(d.decision, Decision::Multiple { .. }))
        .count();

    stage.set(SheetStage::Scoring);
    let score = ctx
        .key
        .map(|key| score_sheet(&decisions, key, &ctx.config.scoring));

    stage.set(SheetStage::Done);
    tracing::debug!(
        confidence = alignment.confidence,
        multi_marked,
        score = score.as_ref().map(|s| s.total),
        "sheet graded"
    );
    Ok(SheetResult {
        sheet_id: image.id().to_string(),
        image_size: [gray.width(), gray.height()],
        alignment,
        decisions,
        signals,
        responses,
        multi_marked,
        score,
    })
}

/// Response strings: the marked option(s) of each question, or the template's
/// empty value. Questions folded into a custom label appear only through it.
pub(crate) fn collect_responses(
    template: &Template,
    decisions: &[QuestionDecision],
) -> BTreeMap<String, String> {
    let value = |d: &Decision| -> String {
        match d {
            Decision::Single { option, .. } => option.clone(),
            Decision::Multiple { options, .. } => options.concat(),
            Decision::None { .. } | Decision::LowConfidence { .. } => {
                template.empty_value().to_string()
            }
        }
    };

    let mut responses: BTreeMap<String, String> = decisions
        .iter()
        .map(|qd| (qd.question.clone(), value(&qd.decision)))
        .collect();

    for (label, members) in template.custom_labels() {
        let mut joined = String::new();
        for &q in members {
            let id = &template.questions()[q].id;
            if let Some(v) = responses.get(id) {
                joined.push_str(v);
            }
        }
        responses.insert(label.clone(), joined);
    }
    for (_, members) in template.custom_labels() {
        for &q in members {
            responses.remove(&template.questions()[q].id);
        }
    }
    responses
}

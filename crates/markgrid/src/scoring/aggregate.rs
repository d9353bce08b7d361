//! Batch statistics over sheet records.

use super::Verdict;
use crate::decision::DecisionStatus;
use crate::pipeline::{SheetOutcome, SheetRecord};
use crate::template::Template;

/// Item statistics of one question across the graded sheets.
#[derive(Debug, Clone, Default, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct QuestionStats {
    pub question: String,
    pub n_single: usize,
    pub n_none: usize,
    pub n_multiple: usize,
    pub n_low_confidence: usize,
    /// Sheets where this question was scored correct.
    pub n_correct: usize,
}

#[derive(Debug, Clone, Default, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct BatchStats {
    pub n_sheets: usize,
    pub n_graded: usize,
    pub n_failed: usize,
    pub n_cancelled: usize,
    /// Graded sheets with at least one `multiple` or `low_confidence` question.
    pub n_needing_review: usize,
    /// Over graded sheets with a score; `None` without an answer key.
    pub mean_score: Option<f64>,
    pub median_score: Option<f64>,
    /// In template question order.
    pub question_stats: Vec<QuestionStats>,
}

impl BatchStats {
    pub fn from_records(template: &Template, records: &[SheetRecord]) -> Self {
        let mut stats = BatchStats {
            n_sheets: records.len(),
            question_stats: template
                .questions()
                .iter()
                .map(|q| QuestionStats {
                    question: q.id.clone(),
                    ..QuestionStats::default()
                })
                .collect(),
            ..BatchStats::default()
        };

        let mut totals = Vec::new();
        for record in records {
            let result = match &record.outcome {
                SheetOutcome::Graded(result) => result,
                SheetOutcome::Failed(_) => {
                    stats.n_failed += 1;
                    continue;
                }
                SheetOutcome::Cancelled => {
                    stats.n_cancelled += 1;
                    continue;
                }
            };
            stats.n_graded += 1;
            if result.needs_review() {
                stats.n_needing_review += 1;
            }
            for qd in &result.decisions {
                let Some(idx) = template.question_index(&qd.question) else {
                    continue;
                };
                let q = &mut stats.question_stats[idx];
                match qd.decision.status() {
                    DecisionStatus::Single => q.n_single += 1,
                    DecisionStatus::None => q.n_none += 1,
                    DecisionStatus::Multiple => q.n_multiple += 1,
                    DecisionStatus::LowConfidence => q.n_low_confidence += 1,
                }
            }
            if let Some(score) = &result.score {
                totals.push(score.total);
                for qs in &score.questions {
                    if qs.verdict != Verdict::Correct {
                        continue;
                    }
                    if let Some(idx) = template.question_index(&qs.question) {
                        stats.question_stats[idx].n_correct += 1;
                    }
                }
            }
        }

        if !totals.is_empty() {
            stats.mean_score = Some(totals.iter().sum::<f64>() / totals.len() as f64);
            totals.sort_by(f64::total_cmp);
            let n = totals.len();
            stats.median_score = Some(if n % 2 == 1 {
                totals[n / 2]
            } else {
                0.5 * (totals[n / 2 - 1] + totals[n / 2])
            });
        }
        stats
    }
}

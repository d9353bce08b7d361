//! Decision engine: per-question marked/unmarked/ambiguous outcomes.
//!
//! Thresholds adapt to each question. The top signal is compared with the
//! runner-up and with the question's own background level (median of the
//! readable signals below the top), so light or heavy pencil pressure on a
//! sheet shifts all of them together.

use crate::config::GradeConfig;
use crate::sampler::BubbleSignal;
use crate::template::Template;

/// Why a question could not be decided confidently.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LowConfidenceReason {
    /// An unreadable bubble could hide or be the mark.
    Unreadable,
    /// The top bubble is above the floor but does not stand out.
    WeakSeparation,
}

/// Outcome for one question. `margin` is `top − runner-up` for marked
/// outcomes and `floor − top` for [`Decision::None`].
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum Decision {
    Single {
        option: String,
        margin: f32,
    },
    None {
        margin: f32,
    },
    Multiple {
        options: Vec<String>,
        margin: f32,
    },
    LowConfidence {
        /// Viable options, in declared order.
        options: Vec<String>,
        reason: LowConfidenceReason,
        margin: f32,
    },
}

/// Status tag of a [`Decision`], without payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DecisionStatus {
    Single,
    None,
    Multiple,
    LowConfidence,
}

impl std::fmt::Display for DecisionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Self::Single => "single",
            Self::None => "none",
            Self::Multiple => "multiple",
            Self::LowConfidence => "low_confidence",
        })
    }
}

impl Decision {
    pub fn status(&self) -> DecisionStatus {
        match self {
            Self::Single { .. } => DecisionStatus::Single,
            Self::None { .. } => DecisionStatus::None,
            Self::Multiple { .. } => DecisionStatus::Multiple,
            Self::LowConfidence { .. } => DecisionStatus::LowConfidence,
        }
    }

    pub fn margin(&self) -> f32 {
        match self {
            Self::Single { margin, .. }
            | Self::None { margin }
            | Self::Multiple { margin, .. }
            | Self::LowConfidence { margin, .. } => *margin,
        }
    }

    /// Options judged marked (or viable, for low-confidence outcomes).
    pub fn options(&self) -> Vec<&str> {
        match self {
            Self::Single { option, .. } => vec![option.as_str()],
            Self::None { .. } => Vec::new(),
            Self::Multiple { options, .. } | Self::LowConfidence { options, .. } => {
                options.iter().map(String::as_str).collect()
            }
        }
    }

    /// `multiple` and `low_confidence` need a human reviewer.
    pub fn needs_review(&self) -> bool {
        matches!(self, Self::Multiple { .. } | Self::LowConfidence { .. })
    }
}

#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct QuestionDecision {
    pub question: String,
    pub decision: Decision,
}

fn median(sorted_desc: &[f32]) -> f32 {
    let n = sorted_desc.len();
    match n {
        0 => 0.0,
        _ if n % 2 == 1 => sorted_desc[n / 2],
        _ => 0.5 * (sorted_desc[n / 2 - 1] + sorted_desc[n / 2]),
    }
}

/// Decide one question from its option signals, given in declared option order.
pub fn decide_question(signals: &[&BubbleSignal], config: &GradeConfig) -> Decision {
    let floor = config.min_mark_darkness;
    let unreadable: Vec<usize> = (0..signals.len())
        .filter(|&i| signals[i].darkness().is_none())
        .collect();
    let mut readable: Vec<(usize, f32)> = signals
        .iter()
        .enumerate()
        .filter_map(|(i, s)| s.darkness().map(|d| (i, d)))
        .collect();

    let options_of = |idx: &mut Vec<usize>| -> Vec<String> {
        idx.sort_unstable();
        idx.dedup();
        idx.iter().map(|&i| signals[i].option.clone()).collect()
    };

    if readable.is_empty() {
        return Decision::LowConfidence {
            options: options_of(&mut unreadable.clone()),
            reason: LowConfidenceReason::Unreadable,
            margin: 0.0,
        };
    }

    // stable: equal darkness keeps declared order
    readable.sort_by(|a, b| b.1.total_cmp(&a.1));
    let (top_idx, t1) = readable[0];
    let t2 = readable.get(1).map_or(0.0, |r| r.1);
    let rest: Vec<f32> = readable[1..].iter().map(|r| r.1).collect();
    let background = median(&rest);

    if t1 < floor {
        let margin = floor - t1;
        if unreadable.is_empty() {
            return Decision::None { margin };
        }
        return Decision::LowConfidence {
            options: options_of(&mut unreadable.clone()),
            reason: LowConfidenceReason::Unreadable,
            margin,
        };
    }

    let margin = t1 - t2;
    let mut contenders: Vec<usize> = readable
        .iter()
        .filter(|(_, d)| *d >= floor && t1 - *d <= config.tie_margin)
        .map(|(i, _)| *i)
        .collect();
    if contenders.len() >= 2 {
        return Decision::Multiple {
            options: options_of(&mut contenders),
            margin,
        };
    }

    let lift_top = t1 - background;
    let lift_runner_up = (t2 - background).max(0.0);
    let separated = lift_top > 0.0 && lift_top >= config.marked_margin_factor * lift_runner_up;

    if separated {
        if unreadable.is_empty() {
            return Decision::Single {
                option: signals[top_idx].option.clone(),
                margin,
            };
        }
        let mut viable = unreadable.clone();
        viable.push(top_idx);
        return Decision::LowConfidence {
            options: options_of(&mut viable),
            reason: LowConfidenceReason::Unreadable,
            margin,
        };
    }

    if t2 >= floor {
        let mut above: Vec<usize> = readable
            .iter()
            .filter(|(_, d)| *d >= floor)
            .map(|(i, _)| *i)
            .collect();
        return Decision::Multiple {
            options: options_of(&mut above),
            margin,
        };
    }

    Decision::LowConfidence {
        options: vec![signals[top_idx].option.clone()],
        reason: LowConfidenceReason::WeakSeparation,
        margin,
    }
}

/// Decide every question of a sheet, in template question order.
///
/// `signals` is indexed by bubble arena index, as produced by
/// [`crate::sampler::sample_bubbles`].
pub fn decide_sheet(
    template: &Template,
    signals: &[BubbleSignal],
    config: &GradeConfig,
) -> Vec<QuestionDecision> {
    template
        .questions()
        .iter()
        .map(|q| {
            let own: Vec<&BubbleSignal> =
                q.bubbles.iter().filter_map(|&b| signals.get(b)).collect();
            let decision = decide_question(&own, config);
            tracing::trace!(
                question = %q.id,
                status = %decision.status(),
                margin = decision.margin(),
                "question decided"
            );
            QuestionDecision {
                question: q.id.clone(),
                decision,
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sampler::{BubbleReading, BubbleStats, SamplingGap};

    fn signal(option: &str, darkness: Option<f32>) -> BubbleSignal {
        let reading = match darkness {
            Some(d) => BubbleReading::Readable(BubbleStats {
                darkness: d,
                mean_intensity: 235.0 * (1.0 - d),
                variance: 0.0,
                background: 235.0,
                n_pixels: 300,
            }),
            None => BubbleReading::Unreadable {
                reason: SamplingGap::OutsideImage,
            },
        };
        BubbleSignal {
            bubble: 0,
            question: "q".into(),
            option: option.into(),
            reading,
        }
    }

    fn decide(values: &[Option<f32>]) -> Decision {
        let signals: Vec<BubbleSignal> = values
            .iter()
            .zip(["A", "B", "C", "D"])
            .map(|(&d, o)| signal(o, d))
            .collect();
        let refs: Vec<&BubbleSignal> = signals.iter().collect();
        decide_question(&refs, &GradeConfig::default())
    }

    #[test]
    fn one_dark_bubble_is_single() {
        let d = decide(&[Some(0.0), Some(1.0), Some(0.0), Some(0.0)]);
        assert_eq!(
            d,
            Decision::Single {
                option: "B".into(),
                margin: 1.0
            }
        );
    }

    #[test]
    fn faint_runner_up_still_single() {
        let d = decide(&[Some(0.9), Some(0.3), Some(0.05), Some(0.05)]);
        assert_eq!(d.status(), DecisionStatus::Single);
        assert_eq!(d.options(), ["A"]);
    }

    #[test]
    fn close_pair_above_floor_is_multiple() {
        let d = decide(&[Some(0.0), Some(0.9), Some(0.0), Some(0.82)]);
        match d {
            Decision::Multiple { options, margin } => {
                assert_eq!(options, ["B", "D"]);
                assert!((margin - 0.08).abs() < 1e-6);
            }
            other => panic!("expected multiple, got {other:?}"),
        }
    }

    #[test]
    fn unseparated_pair_above_floor_is_multiple() {
        let d = decide(&[Some(0.9), Some(0.6), Some(0.0), Some(0.0)]);
        assert_eq!(d.status(), DecisionStatus::Multiple);
        assert_eq!(d.options(), ["A", "B"]);
    }

    #[test]
    fn all_below_floor_is_none() {
        let d = decide(&[Some(0.1), Some(0.0), Some(0.2), Some(0.05)]);
        match d {
            Decision::None { margin } => assert!((margin - 0.15).abs() < 1e-6),
            other => panic!("expected none, got {other:?}"),
        }
    }

    #[test]
    fn weak_separation_is_low_confidence() {
        let d = decide(&[Some(0.5), Some(0.3), Some(0.02), Some(0.02)]);
        match d {
            Decision::LowConfidence {
                options,
                reason,
                margin,
            } => {
                assert_eq!(options, ["A"]);
                assert_eq!(reason, LowConfidenceReason::WeakSeparation);
                assert!((margin - 0.2).abs() < 1e-6);
            }
            other => panic!("expected low confidence, got {other:?}"),
        }
    }

    #[test]
    fn unreadable_only_viable_option_is_low_confidence() {
        let d = decide(&[Some(0.0), None, Some(0.0), Some(0.0)]);
        assert_eq!(
            d,
            Decision::LowConfidence {
                options: vec!["B".into()],
                reason: LowConfidenceReason::Unreadable,
                margin: 0.35,
            }
        );
    }

    #[test]
    fn unreadable_competitor_blocks_single() {
        let d = decide(&[Some(1.0), Some(0.0), None, Some(0.0)]);
        assert_eq!(d.status(), DecisionStatus::LowConfidence);
        assert_eq!(d.options(), ["A", "C"]);
    }

    #[test]
    fn nothing_readable_is_low_confidence() {
        let d = decide(&[None, None]);
        assert_eq!(d.options(), ["A", "B"]);
        assert!(d.needs_review());
    }

    #[test]
    fn single_option_question() {
        let d = decide(&[Some(0.8)]);
        assert_eq!(d.status(), DecisionStatus::Single);
    }

    #[test]
    fn decisions_serialize_with_status_tag() {
        let d = Decision::Multiple {
            options: vec!["A".into(), "C".into()],
            margin: 0.0,
        };
        let json = serde_json::to_value(&d).expect("serialize");
        assert_eq!(json["status"], "multiple");
        assert_eq!(json["options"], serde_json::json!(["A", "C"]));
        let back: Decision = serde_json::from_value(json).expect("deserialize");
        assert_eq!(back, d);
    }
}

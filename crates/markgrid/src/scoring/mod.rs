//! Scoring against an answer key, and batch aggregation.

mod aggregate;

use std::collections::BTreeMap;
use std::path::Path;

pub use aggregate::{BatchStats, QuestionStats};

use crate::config::ScoringPolicy;
use crate::decision::{Decision, QuestionDecision};
use crate::error::KeyError;
use crate::template::Template;

fn default_weight() -> f64 {
    1.0
}

fn default_partial_credit() -> f64 {
    0.5
}

#[derive(Debug, Clone, serde::Deserialize)]
#[serde(untagged)]
enum OneOrMany {
    One(String),
    Many(Vec<String>),
}

impl OneOrMany {
    fn into_vec(self) -> Vec<String> {
        match self {
            Self::One(s) => vec![s],
            Self::Many(v) => v,
        }
    }
}

/// Accepted JSON forms of a key entry: `"A"`, `["B", "C"]`, or a full object.
#[derive(Debug, Clone, serde::Deserialize)]
#[serde(untagged)]
enum RawKeyEntry {
    Options(OneOrMany),
    Full {
        correct: OneOrMany,
        #[serde(default = "default_weight")]
        weight: f64,
        #[serde(default = "default_partial_credit")]
        partial_credit: f64,
    },
}

/// Expected answer of one question.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct KeyEntry {
    /// Accepted options; any one of them is correct.
    pub correct: Vec<String>,
    pub weight: f64,
    /// Fraction of `weight` awarded under the lenient multiple-mark policy.
    pub partial_credit: f64,
}

impl KeyEntry {
    pub fn new<I, S>(correct: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            correct: correct.into_iter().map(Into::into).collect(),
            weight: default_weight(),
            partial_credit: default_partial_credit(),
        }
    }

    pub fn with_weight(mut self, weight: f64) -> Self {
        self.weight = weight;
        self
    }

    pub fn with_partial_credit(mut self, partial_credit: f64) -> Self {
        self.partial_credit = partial_credit;
        self
    }

    fn check(&self, question: &str) -> Result<(), KeyError> {
        let invalid = |reason: &str| KeyError::InvalidEntry {
            question: question.to_string(),
            reason: reason.to_string(),
        };
        if self.correct.is_empty() {
            return Err(invalid("no correct option"));
        }
        if !(self.weight.is_finite() && self.weight >= 0.0) {
            return Err(invalid("weight must be finite and >= 0"));
        }
        if !(self.partial_credit.is_finite() && (0.0..=1.0).contains(&self.partial_credit)) {
            return Err(invalid("partial_credit must be in [0, 1]"));
        }
        Ok(())
    }
}

/// Question id → expected answer.
#[derive(Debug, Clone, Default, PartialEq, serde::Serialize, serde::Deserialize)]
#[serde(
    try_from = "BTreeMap<String, RawKeyEntry>",
    into = "BTreeMap<String, KeyEntry>"
)]
pub struct AnswerKey {
    entries: BTreeMap<String, KeyEntry>,
}

impl TryFrom<BTreeMap<String, RawKeyEntry>> for AnswerKey {
    type Error = KeyError;

    fn try_from(raw: BTreeMap<String, RawKeyEntry>) -> Result<Self, Self::Error> {
        let mut key = AnswerKey::default();
        for (question, entry) in raw {
            let entry = match entry {
                RawKeyEntry::Options(options) => KeyEntry::new(options.into_vec()),
                RawKeyEntry::Full {
                    correct,
                    weight,
                    partial_credit,
                } => KeyEntry {
                    correct: correct.into_vec(),
                    weight,
                    partial_credit,
                },
            };
            key.insert(question, entry)?;
        }
        Ok(key)
    }
}

impl From<AnswerKey> for BTreeMap<String, KeyEntry> {
    fn from(key: AnswerKey) -> Self {
        key.entries
    }
}

impl AnswerKey {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_json_str(data: &str) -> Result<Self, KeyError> {
        serde_json::from_str(data).map_err(|e| KeyError::Parse(e.to_string()))
    }

    pub fn from_json_file(path: &Path) -> Result<Self, KeyError> {
        let data = std::fs::read_to_string(path)
            .map_err(|e| KeyError::Io(format!("{}: {}", path.display(), e)))?;
        Self::from_json_str(&data)
    }

    /// Add or replace an entry after checking its values.
    pub fn insert(&mut self, question: impl Into<String>, entry: KeyEntry) -> Result<(), KeyError> {
        let question = question.into();
        entry.check(&question)?;
        self.entries.insert(question, entry);
        Ok(())
    }

    /// Builder form of [`AnswerKey::insert`] for single-answer questions.
    pub fn with(mut self, question: &str, option: &str) -> Result<Self, KeyError> {
        self.insert(question, KeyEntry::new([option]))?;
        Ok(self)
    }

    pub fn get(&self, question: &str) -> Option<&KeyEntry> {
        self.entries.get(question)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &KeyEntry)> {
        self.entries.iter().map(|(q, e)| (q.as_str(), e))
    }

    /// Reject entries naming questions or options the template does not declare.
    pub fn validate_against(&self, template: &Template) -> Result<(), KeyError> {
        for (question, entry) in &self.entries {
            let bubbles = template
                .question_bubbles(question)
                .ok_or_else(|| KeyError::UnknownQuestion(question.clone()))?;
            for option in &entry.correct {
                let known = bubbles.iter().any(|&b| {
                    template
                        .bubble(b)
                        .is_some_and(|bubble| &bubble.option == option)
                });
                if !known {
                    return Err(KeyError::UnknownOption {
                        question: question.clone(),
                        option: option.clone(),
                    });
                }
            }
            entry.check(question)?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Verdict {
    Correct,
    /// Lenient credit for a multiple mark containing a correct option.
    Partial,
    Incorrect,
    Unanswered,
    /// Multiple or low-confidence outcome without credit.
    Ambiguous,
}

#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct QuestionScore {
    pub question: String,
    pub verdict: Verdict,
    pub awarded: f64,
    pub possible: f64,
}

#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct SheetScore {
    /// Keyed questions, in template order.
    pub questions: Vec<QuestionScore>,
    pub total: f64,
    pub max_total: f64,
    pub n_correct: usize,
}

fn judge(decision: &Decision, entry: &KeyEntry, policy: &ScoringPolicy) -> (Verdict, f64) {
    let is_correct = |o: &str| entry.correct.iter().any(|c| c == o);
    match decision {
        Decision::Single { option, .. } if is_correct(option) => (Verdict::Correct, entry.weight),
        Decision::Single { .. } => (Verdict::Incorrect, 0.0),
        Decision::None { .. } => (Verdict::Unanswered, 0.0),
        Decision::Multiple { options, .. }
            if policy.lenient_multiple && options.iter().any(|o| is_correct(o)) =>
        {
            (Verdict::Partial, entry.weight * entry.partial_credit)
        }
        Decision::Multiple { .. } | Decision::LowConfidence { .. } => (Verdict::Ambiguous, 0.0),
    }
}

/// Score a sheet's decisions. Pure: equal inputs give equal scores.
///
/// Only keyed questions are scored. A keyed question without a decision is
/// scored as unanswered.
pub fn score_sheet(
    decisions: &[QuestionDecision],
    key: &AnswerKey,
    policy: &ScoringPolicy,
) -> SheetScore {
    let mut questions = Vec::with_capacity(key.len());
    for qd in decisions {
        if let Some(entry) = key.get(&qd.question) {
            let (verdict, awarded) = judge(&qd.decision, entry, policy);
            questions.push(QuestionScore {
                question: qd.question.clone(),
                verdict,
                awarded,
                possible: entry.weight,
            });
        }
    }
    for (question, entry) in key.iter() {
        if !decisions.iter().any(|qd| qd.question == question) {
            questions.push(QuestionScore {
                question: question.to_string(),
                verdict: Verdict::Unanswered,
                awarded: 0.0,
                possible: entry.weight,
            });
        }
    }

    SheetScore {
        total: questions.iter().map(|q| q.awarded).sum(),
        max_total: questions.iter().map(|q| q.possible).sum(),
        n_correct: questions
            .iter()
            .filter(|q| q.verdict == Verdict::Correct)
            .count(),
        questions,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::template::tests::quiz5;

    fn decided(question: &str, decision: Decision) -> QuestionDecision {
        QuestionDecision {
            question: question.into(),
            decision,
        }
    }

    fn single(option: &str) -> Decision {
        Decision::Single {
            option: option.into(),
            margin: 1.0,
        }
    }

    #[test]
    fn parses_all_entry_forms() {
        let key = AnswerKey::from_json_str(
            r#"{"q1": "A", "q2": ["B", "C"], "q3": {"correct": "C", "weight": 2.0}}"#,
        )
        .expect("valid key");
        assert_eq!(key.get("q1"), Some(&KeyEntry::new(["A"])));
        assert_eq!(key.get("q2").map(|e| e.correct.len()), Some(2));
        let q3 = key.get("q3").expect("q3");
        assert_eq!(q3.weight, 2.0);
        assert_eq!(q3.partial_credit, 0.5);
    }

    #[test]
    fn rejects_bad_weights() {
        let err = AnswerKey::from_json_str(r#"{"q1": {"correct": ["A"], "weight": -1}}"#)
            .expect_err("negative weight");
        assert!(matches!(err, KeyError::Parse(_)));
        let err = AnswerKey::new()
            .with("q1", "A")
            .and_then(|mut k| {
                k.insert("q2", KeyEntry::new(Vec::<String>::new()))?;
                Ok(k)
            })
            .expect_err("empty correct set");
        assert!(matches!(err, KeyError::InvalidEntry { .. }));
    }

    #[test]
    fn validates_against_template() {
        let t = quiz5();
        let ok = AnswerKey::new().with("q1", "A").expect("valid");
        ok.validate_against(&t).expect("known");
        let err = AnswerKey::new()
            .with("q9", "A")
            .expect("valid")
            .validate_against(&t)
            .expect_err("unknown question");
        assert_eq!(err, KeyError::UnknownQuestion("q9".into()));
        let err = AnswerKey::new()
            .with("q1", "E")
            .expect("valid")
            .validate_against(&t)
            .expect_err("unknown option");
        assert!(matches!(err, KeyError::UnknownOption { .. }));
    }

    #[test]
    fn strict_and_lenient_policies() {
        let key = AnswerKey::new()
            .with("q1", "A")
            .and_then(|k| k.with("q2", "B"))
            .and_then(|k| k.with("q3", "C"))
            .and_then(|k| k.with("q4", "D"))
            .expect("valid");
        let decisions = vec![
            decided("q1", single("A")),
            decided("q2", single("C")),
            decided("q3", Decision::None { margin: 0.3 }),
            decided(
                "q4",
                Decision::Multiple {
                    options: vec!["C".into(), "D".into()],
                    margin: 0.05,
                },
            ),
            decided("q5", single("A")),
        ];

        let strict = score_sheet(&decisions, &key, &ScoringPolicy::default());
        let verdicts: Vec<Verdict> = strict.questions.iter().map(|q| q.verdict).collect();
        assert_eq!(
            verdicts,
            [
                Verdict::Correct,
                Verdict::Incorrect,
                Verdict::Unanswered,
                Verdict::Ambiguous
            ]
        );
        assert_eq!((strict.total, strict.max_total, strict.n_correct), (1.0, 4.0, 1));

        let lenient = score_sheet(
            &decisions,
            &key,
            &ScoringPolicy {
                lenient_multiple: true,
            },
        );
        assert_eq!(lenient.questions[3].verdict, Verdict::Partial);
        assert_eq!(lenient.total, 1.5);
    }

    #[test]
    fn scoring_is_idempotent() {
        let key = AnswerKey::from_json_str(r#"{"q1": "A", "q2": {"correct": ["B"], "weight": 3}}"#)
            .expect("valid");
        let decisions = vec![decided("q1", single("A")), decided("q2", single("B"))];
        let first = score_sheet(&decisions, &key, &ScoringPolicy::default());
        let second = score_sheet(&decisions, &key, &ScoringPolicy::default());
        assert_eq!(first, second);
        assert_eq!(first.total, 4.0);
    }

    #[test]
    fn key_round_trips_through_json() {
        let key = AnswerKey::new().with("q1", "A").expect("valid");
        let json = serde_json::to_string(&key).expect("serialize");
        let back = AnswerKey::from_json_str(&json).expect("parse");
        assert_eq!(back, key);
    }
}

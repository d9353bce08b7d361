//! Error taxonomy.
//!
//! Only template, configuration and answer-key problems abort a run. Alignment
//! failures are per sheet and end up as [`crate::SheetFailure`] records;
//! sampling gaps never surface as errors at all.

use thiserror::Error;

/// Fatal problems with a template definition.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum TemplateError {
    #[error("unsupported template schema '{found}' (expected '{expected}')")]
    UnsupportedSchema {
        found: String,
        expected: &'static str,
    },
    #[error("invalid template: {0}")]
    Invalid(String),
    #[error("bubble '{option}' in block '{block}' maps to undefined question '{question}'")]
    UndefinedQuestion {
        block: String,
        question: String,
        option: String,
    },
    #[error("question '{question}' is declared in blocks '{first_block}' and '{second_block}'")]
    DuplicateQuestion {
        question: String,
        first_block: String,
        second_block: String,
    },
    #[error("question '{question}' declares option '{option}' more than once")]
    DuplicateOption { question: String, option: String },
    #[error("bubbles {first} and {second} overlap in template space")]
    BubbleCollision { first: String, second: String },
    #[error("{what} '{name}' lies outside the page bounds [{}, {}]", .page_size[0], .page_size[1])]
    OutOfBounds {
        what: &'static str,
        name: String,
        page_size: [f64; 2],
    },
    #[error("template declares {found} fiducials; at least 3 are required")]
    TooFewFiducials { found: usize },
    #[error("declared fiducials are collinear")]
    CollinearFiducials,
    #[error("custom label '{label}' references undefined question '{question}'")]
    UnknownCustomLabelQuestion { label: String, question: String },
    #[error("malformed field label '{0}'")]
    MalformedLabel(String),
    #[error("failed to read template: {0}")]
    Io(String),
    #[error("failed to parse template JSON: {0}")]
    Parse(String),
}

/// Invalid grading configuration.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ConfigError {
    #[error("invalid configuration value for `{field}`: {reason}")]
    InvalidValue { field: &'static str, reason: String },
    #[error("fiducial_quorum {quorum} exceeds the {declared} fiducials declared by the template")]
    QuorumExceedsFiducials { quorum: usize, declared: usize },
    #[error("failed to read configuration: {0}")]
    Io(String),
    #[error("failed to parse configuration JSON: {0}")]
    Parse(String),
}

/// Answer key inconsistent with the template it is applied to.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum KeyError {
    #[error("answer key references undefined question '{0}'")]
    UnknownQuestion(String),
    #[error("answer key lists option '{option}' which question '{question}' does not offer")]
    UnknownOption { question: String, option: String },
    #[error("answer key entry for '{question}' is invalid: {reason}")]
    InvalidEntry { question: String, reason: String },
    #[error("failed to read answer key: {0}")]
    Io(String),
    #[error("failed to parse answer key JSON: {0}")]
    Parse(String),
}

/// Per-sheet alignment failure.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum AlignmentError {
    #[error("empty image")]
    EmptyImage,
    #[error(
        "insufficient fiducials: matched {matched} of required {required} ({candidates} found)"
    )]
    InsufficientFiducials {
        matched: usize,
        required: usize,
        candidates: usize,
    },
    #[error("insufficient fiducials: the {matched} matched fiducials are collinear")]
    CollinearFiducials { matched: usize },
    #[error("excessive distortion: {0}")]
    ExcessiveDistortion(String),
    #[error("transform estimation failed: {0}")]
    DegenerateTransform(String),
}

/// Errors that abort a whole grading run.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum GradeError {
    #[error(transparent)]
    Template(#[from] TemplateError),
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Key(#[from] KeyError),
    #[error("unknown template '{0}'")]
    UnknownTemplate(String),
    #[error("failed to start worker pool: {0}")]
    WorkerPool(String),
    #[error("failed to read work directory: {0}")]
    Io(String),
}

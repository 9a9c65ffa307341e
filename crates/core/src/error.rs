use serde::Serialize;
use thiserror::Error;

pub type DrilldownResult<T> = Result<T, DrilldownError>;

#[derive(Error, Debug)]
pub enum DrilldownError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Query execution error: {0}")]
    Execution(String),

    #[error("Validation failed: {0}")]
    Validation(#[from] ValidationError),

    #[error("Invalid date range: {0}")]
    DateRange(String),

    #[error("Invalid ISO-8601 duration: {0}")]
    Duration(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Internal error: {0}")]
    Internal(#[from] anyhow::Error),
}

/// Structural problems with an analysis configuration. These are computed
/// eagerly from the current configuration and block execution; they are
/// reported as data, never raised mid-execution.
#[derive(Error, Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case", tag = "code", content = "detail")]
pub enum ValidationError {
    #[error("A binding key is required")]
    MissingBindingKey,

    #[error("A funnel needs at least 2 steps, found {0}")]
    TooFewFunnelSteps(usize),

    #[error("Step {step} has no measures, dimensions or time dimensions")]
    EmptyStepQuery { step: usize },

    #[error("Step {step} has a malformed time to convert: {value}")]
    InvalidDuration { step: usize, value: String },

    #[error("Step {step} sets a time to convert without a time dimension")]
    MissingStepTimeDimension { step: usize },

    #[error("No binding key mapping for cube {cube} used by step {step}")]
    MissingCubeMapping { step: usize, cube: String },

    #[error("Merge strategy requires at least one merge key")]
    MissingMergeKeys,

    #[error("Merge key {key} is not a dimension of query {label}")]
    MergeKeyNotInQuery { key: String, label: String },

    #[error("Expected {expected} query labels, found {found}")]
    LabelCountMismatch { expected: usize, found: usize },

    #[error("Query label {label} is used more than once")]
    DuplicateQueryLabel { label: String },

    #[error("Query {label} is empty")]
    EmptyQuery { label: String },

    #[error("Missing required field: {0}")]
    MissingField(String),

    #[error("The starting step needs at least one filter")]
    EmptyStartingStep,

    #[error("Retention periods must be within {min}..={max}, got {value}")]
    PeriodsOutOfRange { value: u32, min: u32, max: u32 },

    #[error("Invalid date range: {0}")]
    InvalidDateRange(String),
}

/// Non-blocking advisories surfaced next to validation errors.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case", tag = "code", content = "detail")]
pub enum ValidationWarning {
    /// Wide retention matrices are expensive on the query layer.
    LargeRetentionWindow { periods: u32 },
}

impl std::fmt::Display for ValidationWarning {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ValidationWarning::LargeRetentionWindow { periods } => write!(
                f,
                "{periods} retention periods may be slow to compute"
            ),
        }
    }
}

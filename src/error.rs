//! Error taxonomy for step execution.
//!
//! Configuration errors describe a malformed step or case and are never
//! coerced into defaults. Execution errors are attached to the result of
//! the step that produced them. Persistence failures never reach this
//! type; they are logged where they happen.

use thiserror::Error;

/// Failure raised while executing one step.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum StepError {
    /// Malformed step configuration (unknown kind, missing field,
    /// out-of-range parameter, wrong script return type, ...).
    #[error("configuration error: {0}")]
    Config(String),

    /// A variable name was found in neither the defined nor the session
    /// scope.
    #[error("unknown variable '{0}': not defined by this step and not produced by any earlier step")]
    UnknownVariable(String),

    /// A structured-path lookup hit a missing key.
    #[error("path '{path}' not found: key '{segment}' does not exist (available keys: [{available}])")]
    PathNotFound {
        path: String,
        segment: String,
        available: String,
    },

    /// A structured-path segment was applied to a value that cannot be
    /// dereferenced with it.
    #[error("path '{path}': segment '{segment}' cannot be applied to a {found} value")]
    PathType {
        path: String,
        segment: String,
        found: &'static str,
    },

    /// A list index was past the end of the list.
    #[error("{context}: index {index} is out of range for a list of length {len}")]
    IndexOutOfRange {
        context: String,
        index: i64,
        len: usize,
    },

    /// Network failure, timeout, or unexpected transport error.
    #[error("{method} {url} failed: {reason}")]
    Http {
        method: String,
        url: String,
        reason: String,
    },

    /// The embedded script failed to parse or raised while running.
    #[error("script error: {0}")]
    Script(String),

    /// One or more assertions or extractions did not hold.
    #[error("{0}")]
    Assertion(String),

    /// A loop ran into its hard iteration ceiling.
    #[error("exceeded safety bound: loop stopped after {executed} iterations (ceiling {limit})")]
    SafetyLimit { limit: u32, executed: u32 },

    /// A `stop` loop strategy fired; the whole case run must end.
    #[error("case aborted: {0}")]
    Aborted(String),

    /// Any other execution failure.
    #[error("{0}")]
    Execution(String),
}

impl StepError {
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config(message.into())
    }

    /// `true` when this error must end the whole case run.
    pub fn is_abort(&self) -> bool {
        matches!(self, Self::Aborted(_))
    }

    /// `true` for the configuration taxonomy.
    pub fn is_config(&self) -> bool {
        matches!(self, Self::Config(_))
    }
}

/// Failure of the whole case run.
#[derive(Debug, Error)]
pub enum EngineError {
    /// The step forest failed structural validation; nothing was run.
    #[error("invalid step tree: {0}")]
    InvalidStepTree(String),

    /// The report record could not be opened, so detail records would
    /// have nothing to attach to.
    #[error("failed to create report for case {case_code}: {source}")]
    ReportCreation {
        case_code: String,
        #[source]
        source: anyhow::Error,
    },
}

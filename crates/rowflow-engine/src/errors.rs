//! Pipeline error model.

use rowflow_types::StepError;

/// Problem with the shape of a pipeline, detected before anything runs.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StructuralError {
    #[error("step '{name}' is declared more than once")]
    DuplicateStep { name: String },
    #[error("step '{step}' must run at least one copy")]
    ZeroCopies { step: String },
    #[error("{referenced_by} references unknown step '{name}'")]
    UnknownStep { name: String, referenced_by: String },
    #[error("step '{step}' has {copies} copies, copy {copy} does not exist")]
    UnknownCopy {
        step: String,
        copy: usize,
        copies: usize,
    },
    #[error("step '{step}' uses unknown step type '{logic}'")]
    UnknownLogic { step: String, logic: String },
    #[error("hop '{step}' -> '{step}' loops onto itself")]
    SelfLoop { step: String },
    #[error("hop '{from}' -> '{to}' is declared more than once")]
    DuplicateHop { from: String, to: String },
    #[error("cycle detected: {}", path.join(" -> "))]
    Cycle { path: Vec<String> },
    #[error(
        "partitioned hop '{from}' -> '{to}' needs equal copy counts, got {from_copies} and {to_copies}"
    )]
    CopyMismatch {
        from: String,
        to: String,
        from_copies: usize,
        to_copies: usize,
    },
    #[error("step '{step}' receives incompatible schemas {first} and {second}")]
    SchemaConflict {
        step: String,
        first: String,
        second: String,
    },
    #[error("step '{step}' redirects row errors but has no error hop")]
    MissingErrorHop { step: String },
    #[error("error hop '{from}' -> '{to}' requires step '{from}' to redirect row errors")]
    UnexpectedErrorHop { from: String, to: String },
}

/// Error returned by pipeline construction and execution.
///
/// `Structural` covers graph problems found at build time, `Step` wraps a
/// typed [`StepError`] raised while instantiating a step-copy, and
/// `Infrastructure` wraps opaque host-side failures (runtime missing, task
/// join errors, lifecycle misuse).
#[derive(Debug)]
pub enum PipelineError {
    Structural(StructuralError),
    Step {
        step: String,
        copy: usize,
        error: StepError,
    },
    Infrastructure(anyhow::Error),
}

impl std::fmt::Display for PipelineError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Structural(e) => write!(f, "invalid pipeline: {e}"),
            Self::Step { step, copy, error } => write!(f, "step '{step}' copy {copy}: {error}"),
            Self::Infrastructure(e) => write!(f, "{e}"),
        }
    }
}

impl std::error::Error for PipelineError {}

impl From<anyhow::Error> for PipelineError {
    fn from(e: anyhow::Error) -> Self {
        Self::Infrastructure(e)
    }
}

impl From<StructuralError> for PipelineError {
    fn from(e: StructuralError) -> Self {
        Self::Structural(e)
    }
}

impl PipelineError {
    /// Returns the structural error if the pipeline was rejected at build time.
    pub fn as_structural(&self) -> Option<&StructuralError> {
        match self {
            Self::Structural(e) => Some(e),
            Self::Step { .. } | Self::Infrastructure(_) => None,
        }
    }

    /// Returns the typed step error if a step failed to instantiate.
    pub fn as_step_error(&self) -> Option<&StepError> {
        match self {
            Self::Step { error, .. } => Some(error),
            Self::Structural(_) | Self::Infrastructure(_) => None,
        }
    }
}

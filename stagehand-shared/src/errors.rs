//! Error taxonomy for stagehand.
//!
//! Every failure in the orchestration core maps onto one of these variants.
//! Nothing is retried automatically: a failed stage aborts the pipeline and
//! the operator re-runs the command.

use thiserror::Error;

/// Result type for stagehand operations.
pub type StagehandResult<T> = Result<T, StagehandError>;

#[derive(Debug, Error)]
pub enum StagehandError {
    /// Remote engine API or transport failure.
    #[error("engine error: {0}")]
    Engine(String),

    /// A unit exited with a status other than its declared success code.
    #[error("{stage} exited with unsuccessful exit code {code}")]
    StageFailed { stage: String, code: i64 },

    /// I/O fault while streaming a unit's stdio.
    #[error("stream error: {0}")]
    Stream(String),

    /// External cancellation. Not a failure of the pipeline itself.
    #[error("operation cancelled")]
    Cancelled,

    /// Missing or malformed handoff file.
    #[error("could not decode {path}: {reason}")]
    HandoffDecode { path: String, reason: String },

    /// Teardown failed after an otherwise successful run.
    #[error("cleanup failed: {}", join_errors(.0))]
    Cleanup(Vec<StagehandError>),

    /// A primary failure followed by one or more teardown failures.
    #[error("{primary}, also {}", join_errors(.cleanup))]
    Combined {
        primary: Box<StagehandError>,
        cleanup: Vec<StagehandError>,
    },

    #[error("config error: {0}")]
    Config(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl StagehandError {
    /// Whether this error (or the primary error it wraps) is a cancellation.
    pub fn is_cancelled(&self) -> bool {
        match self {
            StagehandError::Cancelled => true,
            StagehandError::Combined { primary, .. } => primary.is_cancelled(),
            _ => false,
        }
    }

    /// Exit code carried by a stage failure, if any.
    pub fn exit_code(&self) -> Option<i64> {
        match self {
            StagehandError::StageFailed { code, .. } => Some(*code),
            StagehandError::Combined { primary, .. } => primary.exit_code(),
            _ => None,
        }
    }
}

impl From<std::io::Error> for StagehandError {
    fn from(e: std::io::Error) -> Self {
        StagehandError::Stream(e.to_string())
    }
}

/// Fold teardown failures into the outcome of the work they followed.
///
/// A primary error always stays first in the reported message; teardown
/// failures are appended and never replace it.
pub fn combine<T>(
    primary: StagehandResult<T>,
    cleanup: Vec<StagehandError>,
) -> StagehandResult<T> {
    if cleanup.is_empty() {
        return primary;
    }
    match primary {
        Ok(_) => Err(StagehandError::Cleanup(cleanup)),
        Err(primary) => Err(StagehandError::Combined {
            primary: Box::new(primary),
            cleanup,
        }),
    }
}

fn join_errors(errors: &[StagehandError]) -> String {
    errors
        .iter()
        .map(|e| e.to_string())
        .collect::<Vec<_>>()
        .join(", also ")
}

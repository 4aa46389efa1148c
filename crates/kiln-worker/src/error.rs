//! Handler error type.

use kiln_orchestrator::OrchestratorError;
use kiln_queue::StoreError;
use thiserror::Error;

/// Errors raised while processing a task. The worker captures the display
/// form in the task record's `error` field.
#[derive(Debug, Error)]
pub enum HandlerError {
    /// Task parameters failed to decode or validate.
    #[error("invalid task parameters: {0}")]
    InvalidParams(String),

    #[error(transparent)]
    Orchestrator(#[from] OrchestratorError),

    #[error(transparent)]
    Store(#[from] StoreError),

    /// Generation produced an unusable payload.
    #[error("generation failed: {0}")]
    Generation(String),

    /// Filesystem failure while persisting an output artifact.
    #[error("output write failed: {0}")]
    Output(String),
}

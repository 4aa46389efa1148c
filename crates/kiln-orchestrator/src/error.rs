//! Orchestrator and adapter error types.

use kiln_core::ModelType;
use thiserror::Error;

/// Errors raised by per-family model adapters.
#[derive(Debug, Error)]
pub enum AdapterError {
    /// The underlying engine or pipeline failed.
    #[error("engine error: {0}")]
    Engine(String),

    /// The supplied handle was created by a different adapter.
    #[error("invalid model handle for {0} adapter")]
    InvalidHandle(ModelType),

    /// The request shape does not match the adapter family.
    #[error("unsupported request for {0} adapter")]
    UnsupportedRequest(ModelType),

    /// A blocking task panicked or was cancelled.
    #[error("blocking task failed: {0}")]
    Join(String),
}

/// Errors raised by the orchestrator itself.
#[derive(Debug, Error)]
pub enum OrchestratorError {
    /// No adapter registered for the requested model type.
    #[error("no adapter registered for model type '{0}'")]
    NoAdapter(ModelType),

    /// The requested model is not resident.
    #[error("model '{0}' is not loaded")]
    NotLoaded(String),

    #[error(transparent)]
    Adapter(#[from] AdapterError),
}

pub type AdapterResult<T> = Result<T, AdapterError>;
pub type OrchestratorResult<T> = Result<T, OrchestratorError>;

//! Gateway error type and its HTTP mapping.

use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use kiln_orchestrator::OrchestratorError;
use kiln_queue::StoreError;
use kiln_worker::HandlerError;
use serde_json::json;
use thiserror::Error;

/// Errors surfaced by request handlers.
#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("model '{0}' not found or not tracked")]
    ModelNotFound(String),

    #[error("task '{0}' not found")]
    TaskNotFound(String),

    #[error("{0}")]
    Conflict(String),

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("{0} is disabled on this deployment")]
    Disabled(&'static str),

    #[error(transparent)]
    Orchestrator(#[from] OrchestratorError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Handler(#[from] HandlerError),
}

impl IntoResponse for GatewayError {
    fn into_response(self) -> Response {
        let (status, code) = match &self {
            GatewayError::ModelNotFound(_) => (StatusCode::NOT_FOUND, "MODEL_NOT_FOUND"),
            GatewayError::TaskNotFound(_) => (StatusCode::NOT_FOUND, "TASK_NOT_FOUND"),
            GatewayError::Conflict(_) => (StatusCode::CONFLICT, "CONFLICT"),
            GatewayError::InvalidRequest(_) => (StatusCode::BAD_REQUEST, "INVALID_REQUEST"),
            GatewayError::Disabled(_) => (StatusCode::BAD_REQUEST, "FEATURE_DISABLED"),
            // Load/unload and generation failures surface with the
            // preserved message.
            GatewayError::Orchestrator(_) | GatewayError::Handler(_) => {
                (StatusCode::INTERNAL_SERVER_ERROR, "INFERENCE_ERROR")
            }
            GatewayError::Store(_) => (StatusCode::INTERNAL_SERVER_ERROR, "STORE_ERROR"),
        };

        let body = Json(json!({
            "error": {
                "code": code,
                "message": self.to_string(),
            }
        }));

        (status, body).into_response()
    }
}

pub type GatewayResult<T> = Result<T, GatewayError>;

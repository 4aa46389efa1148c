//! Liveness endpoint.

use axum::extract::State;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::{Json, Router};
use serde_json::json;

use crate::state::AppState;

pub fn router() -> Router<AppState> {
    Router::new().route("/health", get(health))
}

/// `GET /health` — liveness plus a GPU memory sample.
async fn health(State(state): State<AppState>) -> impl IntoResponse {
    let gpu = state.orchestrator.gpu_status();
    Json(json!({
        "status": "ok",
        "service": "kiln-gateway",
        "gpu": gpu,
    }))
}

//! Model management endpoints.
//!
//! POST   /models/load         - load a model, evicting as needed
//! POST   /models/unload       - unload a model, freeing its memory
//! POST   /models/switch       - force-reload onto a new model
//! GET    /models              - all tracked models with GPU/disk stats
//! GET    /models/status/{id}  - status store lookup for one model

use axum::extract::{Path, State};
use axum::routing::{get, post};
use axum::{Json, Router};
use chrono::{DateTime, Utc};
use kiln_core::{ModelStatus, ModelType};
use kiln_orchestrator::probe;
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::error::{GatewayError, GatewayResult};
use crate::state::AppState;

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/models", get(list_models))
        .route("/models/load", post(load_model))
        .route("/models/unload", post(unload_model))
        .route("/models/switch", post(switch_model))
        .route("/models/status/{model_id}", get(model_status))
}

// ── DTOs ─────────────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
pub struct LoadModelRequest {
    pub model_id: String,
    pub model_type: ModelType,
    #[serde(default)]
    pub force: bool,
}

#[derive(Debug, Serialize)]
pub struct LoadModelResponse {
    pub model_id: String,
    pub status: ModelStatus,
    pub message: String,
}

#[derive(Debug, Deserialize)]
pub struct UnloadModelRequest {
    pub model_id: String,
}

#[derive(Debug, Serialize)]
pub struct UnloadModelResponse {
    pub model_id: String,
    pub status: ModelStatus,
    pub message: String,
    pub freed_memory_mb: u64,
}

#[derive(Debug, Serialize)]
pub struct ModelInfo {
    pub model_id: String,
    pub model_type: ModelType,
    pub status: ModelStatus,
    pub name: String,
    pub loaded_at: Option<DateTime<Utc>>,
    pub memory_mb: Option<u64>,
    pub error: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct ModelsListResponse {
    pub models: Vec<ModelInfo>,
    pub gpu_memory_total_mb: u64,
    pub gpu_memory_used_mb: u64,
    pub gpu_memory_free_mb: u64,
    pub disk_total_gb: Option<f64>,
    pub disk_used_gb: Option<f64>,
    pub disk_free_gb: Option<f64>,
}

fn short_name(model_id: &str) -> String {
    model_id
        .split('/')
        .next_back()
        .unwrap_or(model_id)
        .to_string()
}

// ── Handlers ─────────────────────────────────────────────────────────────

/// `GET /models` — residents plus errored/transitional entries.
async fn list_models(State(state): State<AppState>) -> Json<ModelsListResponse> {
    let mut models: Vec<ModelInfo> = state
        .orchestrator
        .list_loaded()
        .into_iter()
        .map(|m| {
            let entry = state.orchestrator.status(&m.model_id);
            ModelInfo {
                name: short_name(&m.model_id),
                model_type: m.model_type,
                status: entry
                    .as_ref()
                    .map(|e| e.status)
                    .unwrap_or(ModelStatus::Loaded),
                loaded_at: Some(m.loaded_at),
                memory_mb: Some(m.memory_mb),
                error: entry.and_then(|e| e.error),
                model_id: m.model_id,
            }
        })
        .collect();

    // Keep loading/unloading/errored identifiers visible after the
    // instance is gone.
    for (model_id, entry) in state.orchestrator.all_statuses() {
        let transitional = matches!(
            entry.status,
            ModelStatus::Loading | ModelStatus::Unloading | ModelStatus::Error
        );
        if transitional && !models.iter().any(|m| m.model_id == model_id) {
            models.push(ModelInfo {
                name: short_name(&model_id),
                model_type: entry.model_type,
                status: entry.status,
                loaded_at: entry.loaded_at,
                memory_mb: None,
                error: entry.error,
                model_id,
            });
        }
    }

    let gpu = state.orchestrator.gpu_status();
    let disk = probe::cache_disk_usage();

    Json(ModelsListResponse {
        models,
        gpu_memory_total_mb: gpu.total_mb,
        gpu_memory_used_mb: gpu.used_mb,
        gpu_memory_free_mb: gpu.free_mb,
        disk_total_gb: disk.map(|(total, _, _)| total),
        disk_used_gb: disk.map(|(_, used, _)| used),
        disk_free_gb: disk.map(|(_, _, free)| free),
    })
}

/// `POST /models/load`
async fn load_model(
    State(state): State<AppState>,
    Json(request): Json<LoadModelRequest>,
) -> GatewayResult<Json<LoadModelResponse>> {
    info!(model_id = %request.model_id, model_type = %request.model_type, "load requested");

    if let Some(entry) = state.orchestrator.status(&request.model_id) {
        if entry.status == ModelStatus::Loading {
            return Err(GatewayError::Conflict(format!(
                "model '{}' is already being loaded",
                request.model_id
            )));
        }
    }

    state
        .orchestrator
        .load(&request.model_id, request.model_type, request.force)
        .await?;

    let status = state
        .orchestrator
        .status(&request.model_id)
        .map(|e| e.status)
        .unwrap_or(ModelStatus::Loaded);

    Ok(Json(LoadModelResponse {
        message: format!("Model {} loaded successfully", request.model_id),
        model_id: request.model_id,
        status,
    }))
}

/// `POST /models/unload`
async fn unload_model(
    State(state): State<AppState>,
    Json(request): Json<UnloadModelRequest>,
) -> GatewayResult<Json<UnloadModelResponse>> {
    info!(model_id = %request.model_id, "unload requested");

    if let Some(entry) = state.orchestrator.status(&request.model_id) {
        if entry.status == ModelStatus::Unloading {
            return Err(GatewayError::Conflict(format!(
                "model '{}' is already being unloaded",
                request.model_id
            )));
        }
    }

    if !state.orchestrator.is_loaded(&request.model_id) {
        return Err(GatewayError::InvalidRequest(format!(
            "model '{}' is not loaded",
            request.model_id
        )));
    }

    let freed_memory_mb = state.orchestrator.unload(&request.model_id).await?;

    Ok(Json(UnloadModelResponse {
        message: format!("Model {} unloaded successfully", request.model_id),
        model_id: request.model_id,
        status: ModelStatus::NotLoaded,
        freed_memory_mb,
    }))
}

/// `POST /models/switch` — force-reload convenience.
async fn switch_model(
    State(state): State<AppState>,
    Json(request): Json<LoadModelRequest>,
) -> GatewayResult<Json<LoadModelResponse>> {
    info!(model_id = %request.model_id, model_type = %request.model_type, "switch requested");

    state
        .orchestrator
        .load(&request.model_id, request.model_type, true)
        .await?;

    let status = state
        .orchestrator
        .status(&request.model_id)
        .map(|e| e.status)
        .unwrap_or(ModelStatus::Loaded);

    Ok(Json(LoadModelResponse {
        message: format!("Switched to model {}", request.model_id),
        model_id: request.model_id,
        status,
    }))
}

/// `GET /models/status/{model_id}`
async fn model_status(
    State(state): State<AppState>,
    Path(model_id): Path<String>,
) -> GatewayResult<Json<serde_json::Value>> {
    let entry = state
        .orchestrator
        .status(&model_id)
        .ok_or_else(|| GatewayError::ModelNotFound(model_id.clone()))?;

    Ok(Json(serde_json::json!({
        "model_id": model_id,
        "type": entry.model_type,
        "status": entry.status,
        "error": entry.error,
        "loaded_at": entry.loaded_at,
    })))
}

//! Media generation endpoints.
//!
//! POST /images/generate   - text-to-image, synchronous or queued
//! POST /images/transform  - image-to-image, synchronous or queued
//! POST /videos/generate   - image-to-video, always queued
//!
//! Synchronous requests run the same handler the worker would, inline;
//! `async_mode` enqueues instead and returns the task record for polling.

use axum::extract::State;
use axum::routing::post;
use axum::{Json, Router};
use kiln_core::{Image2ImageTaskParams, ImageTaskParams, TaskType, VideoTaskParams};
use serde::Deserialize;
use serde_json::Value;
use uuid::Uuid;

use crate::error::{GatewayError, GatewayResult};
use crate::state::AppState;

use super::tasks::{TaskResponse, ensure_enabled};

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/images/generate", post(generate_image))
        .route("/images/transform", post(transform_image))
        .route("/videos/generate", post(generate_video))
}

// ── DTOs ─────────────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
pub struct ImageGenerateRequest {
    #[serde(flatten)]
    pub params: ImageTaskParams,
    #[serde(default)]
    pub async_mode: bool,
    pub user_id: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct ImageTransformRequest {
    #[serde(flatten)]
    pub params: Image2ImageTaskParams,
    #[serde(default)]
    pub async_mode: bool,
    pub user_id: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct VideoGenerateRequest {
    #[serde(flatten)]
    pub params: VideoTaskParams,
    pub user_id: Option<String>,
}

/// Either the finished payload (sync) or the queued task (async).
#[derive(Debug, serde::Serialize)]
#[serde(untagged)]
pub enum MediaResponse {
    Payload(Value),
    Queued(TaskResponse),
}

// ── Handlers ─────────────────────────────────────────────────────────────

async fn run_inline(
    state: &AppState,
    task_type: TaskType,
    params: Value,
) -> GatewayResult<Value> {
    let handler = state
        .handlers
        .get(task_type)
        .ok_or_else(|| GatewayError::InvalidRequest(format!("no handler for '{task_type}'")))?;
    let request_id = format!("sync-{}", Uuid::new_v4());
    Ok(handler.handle(&request_id, params).await?)
}

fn to_params<T: serde::Serialize>(params: &T) -> GatewayResult<Value> {
    serde_json::to_value(params).map_err(|e| GatewayError::InvalidRequest(e.to_string()))
}

/// `POST /images/generate`
async fn generate_image(
    State(state): State<AppState>,
    Json(request): Json<ImageGenerateRequest>,
) -> GatewayResult<Json<MediaResponse>> {
    ensure_enabled(&state.config, TaskType::Image)?;
    let params = to_params(&request.params)?;

    if request.async_mode {
        let task = state
            .tasks
            .create(TaskType::Image, params, request.user_id)
            .await?;
        return Ok(Json(MediaResponse::Queued(task.into())));
    }

    let payload = run_inline(&state, TaskType::Image, params).await?;
    Ok(Json(MediaResponse::Payload(payload)))
}

/// `POST /images/transform`
async fn transform_image(
    State(state): State<AppState>,
    Json(request): Json<ImageTransformRequest>,
) -> GatewayResult<Json<MediaResponse>> {
    ensure_enabled(&state.config, TaskType::Image2Image)?;
    let params = to_params(&request.params)?;

    if request.async_mode {
        let task = state
            .tasks
            .create(TaskType::Image2Image, params, request.user_id)
            .await?;
        return Ok(Json(MediaResponse::Queued(task.into())));
    }

    let payload = run_inline(&state, TaskType::Image2Image, params).await?;
    Ok(Json(MediaResponse::Payload(payload)))
}

/// `POST /videos/generate` — video always goes through the queue.
async fn generate_video(
    State(state): State<AppState>,
    Json(request): Json<VideoGenerateRequest>,
) -> GatewayResult<Json<TaskResponse>> {
    ensure_enabled(&state.config, TaskType::Video)?;
    let params = to_params(&request.params)?;

    let task = state
        .tasks
        .create(TaskType::Video, params, request.user_id)
        .await?;
    Ok(Json(task.into()))
}

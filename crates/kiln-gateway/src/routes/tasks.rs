//! Task queue endpoints.
//!
//! POST   /tasks               - create and enqueue a task
//! GET    /tasks               - per-user history
//! GET    /tasks/stats         - queue statistics
//! GET    /tasks/{id}          - task status
//! GET    /tasks/{id}/result   - terminal result payload
//! POST   /tasks/{id}/cancel   - cancel a pending/processing task

use axum::extract::{Path, Query, State};
use axum::routing::{get, post};
use axum::{Json, Router};
use chrono::{DateTime, Utc};
use kiln_core::{KilnConfig, Task, TaskStatus, TaskType};
use kiln_queue::QueueStats;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{GatewayError, GatewayResult};
use crate::state::AppState;

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/tasks", post(create_task).get(list_tasks))
        .route("/tasks/stats", get(queue_stats))
        .route("/tasks/{task_id}", get(task_status))
        .route("/tasks/{task_id}/result", get(task_result))
        .route("/tasks/{task_id}/cancel", post(cancel_task))
}

// ── DTOs ─────────────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
pub struct CreateTaskRequest {
    #[serde(rename = "type")]
    pub task_type: TaskType,
    pub params: Value,
    pub user_id: Option<String>,
}

/// Task status without the (potentially large) result payload.
#[derive(Debug, Serialize)]
pub struct TaskResponse {
    pub id: String,
    #[serde(rename = "type")]
    pub task_type: TaskType,
    pub status: TaskStatus,
    pub progress: f32,
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub user_id: Option<String>,
}

impl From<Task> for TaskResponse {
    fn from(task: Task) -> Self {
        Self {
            id: task.id,
            task_type: task.task_type,
            status: task.status,
            progress: task.progress,
            error: task.error,
            created_at: task.created_at,
            updated_at: task.updated_at,
            user_id: task.user_id,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct TaskResultResponse {
    pub id: String,
    #[serde(rename = "type")]
    pub task_type: TaskType,
    pub status: TaskStatus,
    pub result: Option<Value>,
    pub error: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct TaskListResponse {
    pub tasks: Vec<TaskResponse>,
    pub total: usize,
}

#[derive(Debug, Deserialize)]
pub struct ListTasksQuery {
    pub user_id: Option<String>,
    #[serde(default = "default_limit")]
    pub limit: usize,
}

fn default_limit() -> usize {
    20
}

/// Reject task types whose feature flag is off.
pub(crate) fn ensure_enabled(config: &KilnConfig, task_type: TaskType) -> GatewayResult<()> {
    let enabled = match task_type {
        TaskType::Image => config.enable_image,
        TaskType::Image2Image => config.enable_image2image,
        TaskType::Video => config.enable_video,
        TaskType::LlmCompare => true,
    };
    if enabled {
        Ok(())
    } else {
        Err(GatewayError::Disabled(match task_type {
            TaskType::Image => "image generation",
            TaskType::Image2Image => "image2image generation",
            TaskType::Video => "video generation",
            TaskType::LlmCompare => "llm comparison",
        }))
    }
}

// ── Handlers ─────────────────────────────────────────────────────────────

/// `POST /tasks`
async fn create_task(
    State(state): State<AppState>,
    Json(request): Json<CreateTaskRequest>,
) -> GatewayResult<Json<TaskResponse>> {
    ensure_enabled(&state.config, request.task_type)?;

    let task = state
        .tasks
        .create(request.task_type, request.params, request.user_id)
        .await?;
    Ok(Json(task.into()))
}

/// `GET /tasks?user_id=&limit=` — history requires a user id.
async fn list_tasks(
    State(state): State<AppState>,
    Query(query): Query<ListTasksQuery>,
) -> GatewayResult<Json<TaskListResponse>> {
    let limit = query.limit.clamp(1, 100);
    let tasks = match &query.user_id {
        Some(user_id) => state.tasks.user_tasks(user_id, limit).await?,
        None => Vec::new(),
    };

    let tasks: Vec<TaskResponse> = tasks.into_iter().map(Into::into).collect();
    Ok(Json(TaskListResponse {
        total: tasks.len(),
        tasks,
    }))
}

/// `GET /tasks/stats`
async fn queue_stats(State(state): State<AppState>) -> GatewayResult<Json<QueueStats>> {
    Ok(Json(state.tasks.stats().await?))
}

/// `GET /tasks/{task_id}`
async fn task_status(
    State(state): State<AppState>,
    Path(task_id): Path<String>,
) -> GatewayResult<Json<TaskResponse>> {
    let task = state
        .tasks
        .get(&task_id)
        .await?
        .ok_or(GatewayError::TaskNotFound(task_id))?;
    Ok(Json(task.into()))
}

/// `GET /tasks/{task_id}/result` — only terminal outcomes carry data.
async fn task_result(
    State(state): State<AppState>,
    Path(task_id): Path<String>,
) -> GatewayResult<Json<TaskResultResponse>> {
    let task = state
        .tasks
        .get(&task_id)
        .await?
        .ok_or(GatewayError::TaskNotFound(task_id))?;

    if !matches!(task.status, TaskStatus::Completed | TaskStatus::Failed) {
        return Err(GatewayError::InvalidRequest(format!(
            "task is not completed yet, current status: {}",
            task.status
        )));
    }

    Ok(Json(TaskResultResponse {
        id: task.id,
        task_type: task.task_type,
        status: task.status,
        result: task.result,
        error: task.error,
    }))
}

/// `POST /tasks/{task_id}/cancel`
async fn cancel_task(
    State(state): State<AppState>,
    Path(task_id): Path<String>,
) -> GatewayResult<Json<TaskResponse>> {
    let task = state
        .tasks
        .cancel(&task_id)
        .await?
        .ok_or(GatewayError::TaskNotFound(task_id))?;
    Ok(Json(task.into()))
}

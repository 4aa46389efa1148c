//! Streaming chat endpoint.
//!
//! `POST /chat` resolves an LLM (explicit, resident, or configured
//! default), ensures it is loaded, and streams generation chunks as
//! server-sent events in the `{"message": {"content": ...}, "done": ...}`
//! envelope.

use std::convert::Infallible;

use axum::extract::State;
use axum::response::Sse;
use axum::response::sse::{Event, KeepAlive};
use axum::routing::post;
use axum::{Json, Router};
use futures::stream::{Stream, StreamExt};
use kiln_core::{ChatMessage, ModelType};
use kiln_orchestrator::adapter::SamplingParams;
use kiln_worker::handlers::format_chat_prompt;
use serde::Deserialize;
use serde_json::json;

use crate::error::{GatewayError, GatewayResult};
use crate::state::AppState;

pub fn router() -> Router<AppState> {
    Router::new().route("/chat", post(chat))
}

fn default_temperature() -> f32 {
    0.7
}

fn default_top_p() -> f32 {
    0.95
}

fn default_top_k() -> u32 {
    40
}

fn default_max_tokens() -> u32 {
    2048
}

#[derive(Debug, Deserialize)]
pub struct ChatRequest {
    /// Model id; defaults to the resident LLM, then the configured preload.
    pub model: Option<String>,
    pub messages: Vec<ChatMessage>,
    #[serde(default = "default_temperature")]
    pub temperature: f32,
    #[serde(default = "default_top_p")]
    pub top_p: f32,
    #[serde(default = "default_top_k")]
    pub top_k: u32,
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,
}

/// `POST /chat`
async fn chat(
    State(state): State<AppState>,
    Json(request): Json<ChatRequest>,
) -> GatewayResult<Sse<impl Stream<Item = Result<Event, Infallible>>>> {
    if request.messages.is_empty() {
        return Err(GatewayError::InvalidRequest("messages must not be empty".into()));
    }

    let model_id = match request.model {
        Some(model) => model,
        None => state
            .orchestrator
            .get_by_type(ModelType::Llm)
            .map(|m| m.model_id)
            .or_else(|| state.config.model_ids.first().cloned())
            .ok_or_else(|| {
                GatewayError::InvalidRequest("no LLM loaded and none configured".into())
            })?,
    };

    let loaded = state
        .orchestrator
        .ensure_loaded(&model_id, ModelType::Llm)
        .await?;

    let prompt = format_chat_prompt(&request.messages);
    let sampling = SamplingParams {
        temperature: request.temperature,
        top_p: request.top_p,
        top_k: request.top_k,
        max_tokens: request.max_tokens,
    };

    let chunks = state
        .llm
        .stream_chat(&loaded.instance, prompt, sampling)
        .map_err(kiln_orchestrator::OrchestratorError::from)?;

    let model_name = model_id.clone();
    let body = chunks.map(move |item| {
        let payload = match item {
            Ok(content) => json!({
                "message": { "content": content },
                "model": model_name,
                "done": false,
            }),
            Err(e) => json!({
                "error": e.to_string(),
                "model": model_name,
                "done": true,
            }),
        };
        Ok::<Event, Infallible>(Event::default().data(payload.to_string()))
    });

    let done = futures::stream::once(async move {
        let payload = json!({
            "message": { "content": "" },
            "model": model_id,
            "done": true,
        });
        Ok::<Event, Infallible>(Event::default().data(payload.to_string()))
    });

    Ok(Sse::new(body.chain(done)).keep_alive(KeepAlive::default()))
}

//! Multi-model LLM comparison handler.
//!
//! Runs the same conversation against several resident LLMs, serially, and
//! collects each model's final text. Models are resolved against resident
//! ids (exact id first, then exact short name, then substring) so a
//! short name like "qwen-7b" finds "org/qwen-7b" deterministically.

use std::sync::Arc;

use async_trait::async_trait;
use kiln_core::{ChatMessage, LlmCompareTaskParams, ModelType, TaskType};
use kiln_orchestrator::adapter::{GenerateOutput, GenerateRequest, SamplingParams};
use kiln_orchestrator::{LoadedModel, ModelOrchestrator};
use kiln_queue::{TaskStore, TaskUpdate};
use serde_json::{Map, Value, json};
use tracing::info;

use crate::error::HandlerError;

use super::{TaskHandler, decode_params};

/// Format messages into the ChatML prompt shape the engines expect.
pub fn format_chat_prompt(messages: &[ChatMessage]) -> String {
    let mut prompt = String::new();
    for message in messages {
        prompt.push_str(&format!(
            "<|im_start|>{}\n{}<|im_end|>\n",
            message.role, message.content
        ));
    }
    prompt.push_str("<|im_start|>assistant\n");
    prompt
}

/// Resolve a requested name against resident LLMs.
///
/// Residents are sorted by id so ties break deterministically.
fn resolve_model(residents: &[LoadedModel], name: &str) -> Option<LoadedModel> {
    let mut llms: Vec<&LoadedModel> = residents
        .iter()
        .filter(|m| m.model_type == ModelType::Llm)
        .collect();
    llms.sort_by(|a, b| a.model_id.cmp(&b.model_id));

    // Exact id, then exact short name, then substring.
    llms.iter()
        .find(|m| m.model_id == name)
        .or_else(|| {
            llms.iter()
                .find(|m| m.model_id.split('/').next_back() == Some(name))
        })
        .or_else(|| llms.iter().find(|m| m.model_id.contains(name)))
        .map(|m| (*m).clone())
}

pub struct LlmCompareHandler {
    orchestrator: Arc<ModelOrchestrator>,
    store: Arc<TaskStore>,
}

impl LlmCompareHandler {
    pub fn new(orchestrator: Arc<ModelOrchestrator>, store: Arc<TaskStore>) -> Self {
        Self {
            orchestrator,
            store,
        }
    }
}

#[async_trait]
impl TaskHandler for LlmCompareHandler {
    fn task_type(&self) -> TaskType {
        TaskType::LlmCompare
    }

    async fn handle(&self, task_id: &str, params: Value) -> Result<Value, HandlerError> {
        info!(task_id, "processing llm comparison task");
        let params: LlmCompareTaskParams = decode_params(params)?;
        if params.models.is_empty() {
            return Err(HandlerError::InvalidParams("no models requested".into()));
        }

        let prompt = format_chat_prompt(&params.messages);
        let sampling = SamplingParams {
            temperature: params.temperature,
            top_p: params.top_p,
            top_k: params.top_k,
            max_tokens: params.max_tokens,
        };

        let adapter = self.orchestrator.adapter(ModelType::Llm)?;
        let total = params.models.len();
        let mut responses = Map::new();

        for (index, name) in params.models.iter().enumerate() {
            let residents = self.orchestrator.list_loaded();
            let Some(model) = resolve_model(&residents, name) else {
                responses.insert(name.clone(), json!({"error": "Model not found"}));
                continue;
            };

            let request = GenerateRequest::Chat {
                prompt: prompt.clone(),
                sampling: sampling.clone(),
            };
            match adapter.generate(&model.instance, request).await {
                Ok(GenerateOutput::Text(content)) => {
                    responses.insert(name.clone(), json!({"content": content}));
                }
                Ok(_) => {
                    responses.insert(
                        name.clone(),
                        json!({"error": "unexpected non-text payload"}),
                    );
                }
                Err(e) => {
                    responses.insert(name.clone(), json!({"error": e.to_string()}));
                }
            }

            let progress = ((index + 1) as f32 / total as f32) * 100.0;
            self.store
                .update(task_id, TaskUpdate::progress(progress))
                .await?;
        }

        Ok(json!({ "responses": Value::Object(responses) }))
    }
}

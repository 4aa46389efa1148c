//! Image generation handler.

use std::sync::Arc;

use async_trait::async_trait;
use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use kiln_core::{ImageTaskParams, KilnConfig, ModelType, TaskType};
use kiln_orchestrator::adapter::{GenerateOutput, GenerateRequest, ImageJob};
use kiln_orchestrator::ModelOrchestrator;
use serde_json::{Value, json};
use tracing::info;

use crate::error::HandlerError;

use super::{TaskHandler, decode_params, resolve_seed};

pub struct ImageHandler {
    orchestrator: Arc<ModelOrchestrator>,
    config: Arc<KilnConfig>,
}

impl ImageHandler {
    pub fn new(orchestrator: Arc<ModelOrchestrator>, config: Arc<KilnConfig>) -> Self {
        Self {
            orchestrator,
            config,
        }
    }
}

#[async_trait]
impl TaskHandler for ImageHandler {
    fn task_type(&self) -> TaskType {
        TaskType::Image
    }

    async fn handle(&self, task_id: &str, params: Value) -> Result<Value, HandlerError> {
        info!(task_id, "processing image task");
        let params: ImageTaskParams = decode_params(params)?;

        let model = params
            .model
            .clone()
            .unwrap_or_else(|| self.config.image_model.clone());
        let loaded = self
            .orchestrator
            .ensure_loaded(&model, ModelType::Image)
            .await?;

        let seed = resolve_seed(params.seed);
        let job = ImageJob {
            prompt: params.prompt,
            negative_prompt: params.negative_prompt,
            width: params.width,
            height: params.height,
            num_inference_steps: params.num_inference_steps,
            guidance_scale: params.guidance_scale,
            seed,
            init_image: None,
            strength: None,
        };

        let adapter = self.orchestrator.adapter(ModelType::Image)?;
        let output = adapter
            .generate(&loaded.instance, GenerateRequest::Image(job))
            .await
            .map_err(kiln_orchestrator::OrchestratorError::from)?;

        let GenerateOutput::Image(png) = output else {
            return Err(HandlerError::Generation(
                "image adapter returned a non-image payload".into(),
            ));
        };

        Ok(json!({
            "image_base64": BASE64.encode(png),
            "seed": seed,
        }))
    }
}

//! Image-to-image transformation handler.

use std::sync::Arc;

use async_trait::async_trait;
use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use kiln_core::{Image2ImageTaskParams, KilnConfig, ModelType, TaskType};
use kiln_orchestrator::ModelOrchestrator;
use kiln_orchestrator::adapter::{GenerateOutput, GenerateRequest, ImageJob};
use serde_json::{Value, json};
use tracing::info;

use crate::error::HandlerError;

use super::{TaskHandler, decode_input_image, decode_params, resolve_seed};

pub struct Image2ImageHandler {
    orchestrator: Arc<ModelOrchestrator>,
    config: Arc<KilnConfig>,
}

impl Image2ImageHandler {
    pub fn new(orchestrator: Arc<ModelOrchestrator>, config: Arc<KilnConfig>) -> Self {
        Self {
            orchestrator,
            config,
        }
    }
}

#[async_trait]
impl TaskHandler for Image2ImageHandler {
    fn task_type(&self) -> TaskType {
        TaskType::Image2Image
    }

    async fn handle(&self, task_id: &str, params: Value) -> Result<Value, HandlerError> {
        info!(task_id, "processing image2image task");
        let params: Image2ImageTaskParams = decode_params(params)?;

        // Validate the input before claiming a model.
        let (input, width, height) = decode_input_image(&params.image_base64)?;

        let model = params
            .model
            .clone()
            .unwrap_or_else(|| self.config.image2image_model.clone());
        let loaded = self
            .orchestrator
            .ensure_loaded(&model, ModelType::Image2Image)
            .await?;

        let seed = resolve_seed(params.seed);
        let job = ImageJob {
            prompt: params.prompt,
            negative_prompt: params.negative_prompt,
            width,
            height,
            num_inference_steps: params.num_inference_steps,
            guidance_scale: params.guidance_scale,
            seed,
            init_image: Some(input),
            strength: Some(params.strength),
        };

        let adapter = self.orchestrator.adapter(ModelType::Image2Image)?;
        let output = adapter
            .generate(&loaded.instance, GenerateRequest::Image(job))
            .await
            .map_err(kiln_orchestrator::OrchestratorError::from)?;

        let GenerateOutput::Image(png) = output else {
            return Err(HandlerError::Generation(
                "image2image adapter returned a non-image payload".into(),
            ));
        };

        Ok(json!({
            "image_base64": BASE64.encode(png),
            "seed": seed,
        }))
    }
}

//! Image family adapters (text-to-image and image-to-image).
//!
//! Both families share one adapter implementation parameterised by
//! [`ImageMode`]; the mode decides which pipeline the loader constructs
//! and which [`ModelType`] the adapter answers for.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use kiln_core::ModelType;
use tracing::info;

use crate::error::{AdapterError, AdapterResult};

use super::llm::EngineError;
use super::{GenerateOutput, GenerateRequest, LoadOutput, ModelAdapter, ModelHandle};

/// Which diffusion pipeline flavour to construct.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImageMode {
    TextToImage,
    ImageToImage,
}

/// One generation job for a diffusion pipeline.
#[derive(Debug, Clone)]
pub struct ImageJob {
    pub prompt: String,
    pub negative_prompt: String,
    pub width: u32,
    pub height: u32,
    pub num_inference_steps: u32,
    pub guidance_scale: f32,
    pub seed: u64,
    /// Decoded input image for image-to-image jobs.
    pub init_image: Option<Vec<u8>>,
    /// Denoising strength for image-to-image jobs.
    pub strength: Option<f32>,
}

/// A resident diffusion pipeline. Methods block; callers shunt them to a
/// worker thread.
pub trait ImagePipeline: Send + Sync {
    /// Run one job and return encoded PNG bytes.
    fn run(&self, job: &ImageJob) -> Result<Vec<u8>, EngineError>;

    /// Release device memory held by this pipeline; returns freed MB.
    fn release(&self) -> Result<u64, EngineError>;
}

/// Constructs pipelines for model ids. Implemented by the runtime
/// integration; stubbed in tests.
pub trait ImagePipelineLoader: Send + Sync {
    fn load(
        &self,
        model_id: &str,
        mode: ImageMode,
    ) -> Result<(Arc<dyn ImagePipeline>, u64), EngineError>;
}

struct ImageInstance {
    model_id: String,
    pipeline: Arc<dyn ImagePipeline>,
}

/// Adapter for the image families.
pub struct ImageAdapter {
    loader: Arc<dyn ImagePipelineLoader>,
    mode: ImageMode,
}

impl ImageAdapter {
    /// Adapter answering for [`ModelType::Image`].
    pub fn text_to_image(loader: Arc<dyn ImagePipelineLoader>) -> Self {
        Self {
            loader,
            mode: ImageMode::TextToImage,
        }
    }

    /// Adapter answering for [`ModelType::Image2Image`].
    pub fn image_to_image(loader: Arc<dyn ImagePipelineLoader>) -> Self {
        Self {
            loader,
            mode: ImageMode::ImageToImage,
        }
    }

    fn instance(&self, handle: &ModelHandle) -> AdapterResult<Arc<ImageInstance>> {
        handle
            .downcast::<ImageInstance>()
            .ok_or(AdapterError::InvalidHandle(self.model_type()))
    }
}

/// Estimate memory for a diffusion image model.
///
/// Turbo-distilled checkpoints run lighter than full SDXL-class models.
pub fn estimate_image_memory_mb(model_id: &str) -> u64 {
    if model_id.to_lowercase().contains("turbo") {
        8_000
    } else {
        10_000
    }
}

#[async_trait]
impl ModelAdapter for ImageAdapter {
    fn model_type(&self) -> ModelType {
        match self.mode {
            ImageMode::TextToImage => ModelType::Image,
            ImageMode::ImageToImage => ModelType::Image2Image,
        }
    }

    fn estimate_memory_mb(&self, model_id: &str) -> u64 {
        estimate_image_memory_mb(model_id)
    }

    async fn load(&self, model_id: &str) -> AdapterResult<LoadOutput> {
        let loader = Arc::clone(&self.loader);
        let mode = self.mode;
        let model_id = model_id.to_string();

        info!(model_id = %model_id, mode = ?mode, "loading diffusion pipeline");

        let (instance, memory_mb) = tokio::task::spawn_blocking(move || {
            let (pipeline, memory_mb) = loader
                .load(&model_id, mode)
                .map_err(|e| AdapterError::Engine(e.to_string()))?;
            Ok::<_, AdapterError>((ImageInstance { model_id, pipeline }, memory_mb))
        })
        .await
        .map_err(|e| AdapterError::Join(e.to_string()))??;

        Ok(LoadOutput {
            instance: ModelHandle::new(instance),
            memory_mb,
            metadata: HashMap::new(),
        })
    }

    async fn unload(&self, instance: ModelHandle) -> AdapterResult<u64> {
        let instance = self.instance(&instance)?;

        let freed = tokio::task::spawn_blocking(move || {
            instance
                .pipeline
                .release()
                .map_err(|e| AdapterError::Engine(e.to_string()))
        })
        .await
        .map_err(|e| AdapterError::Join(e.to_string()))??;

        info!(freed_mb = freed, "diffusion pipeline unloaded");
        Ok(freed)
    }

    async fn generate(
        &self,
        instance: &ModelHandle,
        request: GenerateRequest,
    ) -> AdapterResult<GenerateOutput> {
        let GenerateRequest::Image(job) = request else {
            return Err(AdapterError::UnsupportedRequest(self.model_type()));
        };
        let instance = self.instance(instance)?;

        let png = tokio::task::spawn_blocking(move || {
            instance
                .pipeline
                .run(&job)
                .map_err(|e| AdapterError::Engine(e.to_string()))
        })
        .await
        .map_err(|e| AdapterError::Join(e.to_string()))??;

        Ok(GenerateOutput::Image(png))
    }
}

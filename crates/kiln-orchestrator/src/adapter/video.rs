//! Video family adapter.
//!
//! Video models split into families with incompatible pipelines and very
//! different memory appetites. The family is detected from the model id at
//! load time and recorded in the handle metadata so that task handlers can
//! apply family-specific parameter normalisation without probing the
//! pipeline itself.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use kiln_core::{ModelType, VideoFamily};
use tracing::info;

use crate::error::{AdapterError, AdapterResult};

use super::llm::EngineError;
use super::{GenerateOutput, GenerateRequest, LoadOutput, ModelAdapter, ModelHandle};

/// Metadata key under which the detected family is recorded.
pub const VIDEO_FAMILY_KEY: &str = "video_family";

/// One generation job for a video pipeline.
#[derive(Debug, Clone)]
pub struct VideoJob {
    pub prompt: String,
    /// Decoded conditioning image.
    pub image: Vec<u8>,
    pub width: u32,
    pub height: u32,
    pub num_inference_steps: u32,
    pub guidance_scale: f32,
    pub num_frames: u32,
    pub seed: u64,
    /// Frame rate for the encoded container.
    pub fps: u32,
}

/// A resident video pipeline. Methods block; callers shunt them to a
/// worker thread.
pub trait VideoPipeline: Send + Sync {
    /// Run one job and return encoded MP4 container bytes.
    fn run(&self, job: &VideoJob) -> Result<Vec<u8>, EngineError>;

    /// Release device memory held by this pipeline; returns freed MB.
    fn release(&self) -> Result<u64, EngineError>;
}

/// Constructs video pipelines for model ids.
pub trait VideoPipelineLoader: Send + Sync {
    fn load(&self, model_id: &str) -> Result<(Arc<dyn VideoPipeline>, u64), EngineError>;
}

struct VideoInstance {
    model_id: String,
    pipeline: Arc<dyn VideoPipeline>,
}

/// Estimate memory for a video model by family.
pub fn estimate_video_memory_mb(model_id: &str) -> u64 {
    match VideoFamily::detect(model_id) {
        VideoFamily::CogVideoX => 24_000,
        VideoFamily::Hunyuan => 60_000,
        VideoFamily::Wan => 48_000,
        VideoFamily::WanRapid => 8_000,
        VideoFamily::Ltx => 16_000,
        VideoFamily::Unknown => 24_000,
    }
}

/// Adapter for the video family.
pub struct VideoAdapter {
    loader: Arc<dyn VideoPipelineLoader>,
}

impl VideoAdapter {
    pub fn new(loader: Arc<dyn VideoPipelineLoader>) -> Self {
        Self { loader }
    }

    fn instance(&self, handle: &ModelHandle) -> AdapterResult<Arc<VideoInstance>> {
        handle
            .downcast::<VideoInstance>()
            .ok_or(AdapterError::InvalidHandle(ModelType::Video))
    }
}

#[async_trait]
impl ModelAdapter for VideoAdapter {
    fn model_type(&self) -> ModelType {
        ModelType::Video
    }

    fn estimate_memory_mb(&self, model_id: &str) -> u64 {
        estimate_video_memory_mb(model_id)
    }

    async fn load(&self, model_id: &str) -> AdapterResult<LoadOutput> {
        let loader = Arc::clone(&self.loader);
        let family = VideoFamily::detect(model_id);
        let model_id = model_id.to_string();

        info!(model_id = %model_id, family = %family, "loading video pipeline");

        let (instance, memory_mb) = tokio::task::spawn_blocking(move || {
            let (pipeline, memory_mb) = loader
                .load(&model_id)
                .map_err(|e| AdapterError::Engine(e.to_string()))?;
            Ok::<_, AdapterError>((VideoInstance { model_id, pipeline }, memory_mb))
        })
        .await
        .map_err(|e| AdapterError::Join(e.to_string()))??;

        let mut metadata = HashMap::new();
        metadata.insert(VIDEO_FAMILY_KEY.to_string(), family.to_string());

        Ok(LoadOutput {
            instance: ModelHandle::new(instance),
            memory_mb,
            metadata,
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

        info!(freed_mb = freed, "video pipeline unloaded");
        Ok(freed)
    }

    async fn generate(
        &self,
        instance: &ModelHandle,
        request: GenerateRequest,
    ) -> AdapterResult<GenerateOutput> {
        let GenerateRequest::Video(job) = request else {
            return Err(AdapterError::UnsupportedRequest(ModelType::Video));
        };
        let instance = self.instance(instance)?;

        let mp4 = tokio::task::spawn_blocking(move || {
            instance
                .pipeline
                .run(&job)
                .map_err(|e| AdapterError::Engine(e.to_string()))
        })
        .await
        .map_err(|e| AdapterError::Join(e.to_string()))??;

        Ok(GenerateOutput::Video(mp4))
    }
}

//! Video generation handler.
//!
//! Dispatches on the video family recorded by the adapter at load time and
//! normalises generation parameters per family before calling the
//! pipeline. Families disagree on resolution granularity (multiples of 16
//! vs 32), frame-count arithmetic, and, for accelerated "rapid" variants,
//! fixed step/CFG settings that override whatever the caller asked for.

use std::sync::Arc;

use async_trait::async_trait;
use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use kiln_core::{KilnConfig, ModelType, TaskType, VideoFamily, VideoTaskParams};
use kiln_orchestrator::ModelOrchestrator;
use kiln_orchestrator::adapter::video::VIDEO_FAMILY_KEY;
use kiln_orchestrator::adapter::{GenerateOutput, GenerateRequest, VideoJob};
use kiln_queue::{TaskStore, TaskUpdate};
use serde_json::{Value, json};
use tracing::info;

use crate::error::HandlerError;

use super::{TaskHandler, decode_input_image, decode_params, resolve_seed};

/// Fixed sampling for WanRapid checkpoints (FP8 all-in-one distillations).
const RAPID_STEPS: u32 = 4;
const RAPID_GUIDANCE: f32 = 1.0;

/// Normalised generation settings for one family.
#[derive(Debug, PartialEq)]
struct GenerationPlan {
    width: u32,
    height: u32,
    num_inference_steps: u32,
    guidance_scale: f32,
    num_frames: u32,
    fps: u32,
}

fn round_down(value: u32, multiple: u32) -> u32 {
    (value / multiple) * multiple
}

/// Apply family-specific parameter normalisation.
fn plan_generation(
    family: VideoFamily,
    input_dims: (u32, u32),
    params: &VideoTaskParams,
) -> GenerationPlan {
    let (in_width, in_height) = input_dims;

    let (width, height, num_inference_steps, guidance_scale, num_frames) = match family {
        // CogVideoX derives its geometry from the conditioning image.
        VideoFamily::CogVideoX | VideoFamily::Unknown => (
            in_width,
            in_height,
            params.num_inference_steps,
            params.guidance_scale,
            params.num_frames,
        ),
        VideoFamily::Hunyuan | VideoFamily::Wan => (
            round_down(in_width, 16),
            round_down(in_height, 16),
            params.num_inference_steps,
            params.guidance_scale,
            params.num_frames,
        ),
        VideoFamily::WanRapid => (
            round_down(in_width, 16),
            round_down(in_height, 16),
            RAPID_STEPS,
            RAPID_GUIDANCE,
            params.num_frames,
        ),
        VideoFamily::Ltx => (
            round_down(in_width, 32),
            round_down(in_height, 32),
            params.num_inference_steps,
            params.guidance_scale,
            // LTX requires 8·k + 1 frames.
            ((params.num_frames.saturating_sub(1)) / 8) * 8 + 1,
        ),
    };

    GenerationPlan {
        width,
        height,
        num_inference_steps,
        guidance_scale,
        num_frames,
        fps: family.fps(),
    }
}

pub struct VideoHandler {
    orchestrator: Arc<ModelOrchestrator>,
    store: Arc<TaskStore>,
    config: Arc<KilnConfig>,
}

impl VideoHandler {
    pub fn new(
        orchestrator: Arc<ModelOrchestrator>,
        store: Arc<TaskStore>,
        config: Arc<KilnConfig>,
    ) -> Self {
        Self {
            orchestrator,
            store,
            config,
        }
    }

    async fn report_progress(&self, task_id: &str, progress: f32) -> Result<(), HandlerError> {
        self.store
            .update(task_id, TaskUpdate::progress(progress))
            .await?;
        Ok(())
    }
}

#[async_trait]
impl TaskHandler for VideoHandler {
    fn task_type(&self) -> TaskType {
        TaskType::Video
    }

    async fn handle(&self, task_id: &str, params: Value) -> Result<Value, HandlerError> {
        info!(task_id, "processing video task");
        let params: VideoTaskParams = decode_params(params)?;

        let (input, width, height) = decode_input_image(&params.image_base64)?;
        self.report_progress(task_id, 10.0).await?;

        let loaded = self
            .orchestrator
            .ensure_loaded(&self.config.video_model, ModelType::Video)
            .await?;
        let family: VideoFamily = loaded
            .metadata
            .get(VIDEO_FAMILY_KEY)
            .and_then(|raw| raw.parse().ok())
            .unwrap_or(VideoFamily::Unknown);
        self.report_progress(task_id, 20.0).await?;

        let plan = plan_generation(family, (width, height), &params);
        info!(task_id, family = %family, ?plan, "video generation plan");

        let seed = resolve_seed(params.seed);
        let job = VideoJob {
            prompt: params.prompt,
            image: input,
            width: plan.width,
            height: plan.height,
            num_inference_steps: plan.num_inference_steps,
            guidance_scale: plan.guidance_scale,
            num_frames: plan.num_frames,
            seed,
            fps: plan.fps,
        };

        let adapter = self.orchestrator.adapter(ModelType::Video)?;
        let output = adapter
            .generate(&loaded.instance, GenerateRequest::Video(job))
            .await
            .map_err(kiln_orchestrator::OrchestratorError::from)?;
        self.report_progress(task_id, 80.0).await?;

        let GenerateOutput::Video(mp4) = output else {
            return Err(HandlerError::Generation(
                "video adapter returned a non-video payload".into(),
            ));
        };

        let output_path = self.config.output_dir.join(format!("{task_id}.mp4"));
        tokio::fs::write(&output_path, &mp4)
            .await
            .map_err(|e| HandlerError::Output(e.to_string()))?;
        self.report_progress(task_id, 90.0).await?;

        Ok(json!({
            "video_base64": BASE64.encode(mp4),
            "seed": seed,
        }))
    }
}

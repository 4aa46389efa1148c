//! Functioning in-process stand-ins for the external inference runtimes.
//!
//! Unlike the gateway's unconfigured backends these actually produce
//! output (canned text, real PNG bytes, synthetic container bytes), so
//! the full create/dispatch/handle/complete pipeline can run in a test
//! process with no accelerator.

use std::io::Cursor;
use std::sync::Arc;

use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use kiln_orchestrator::adapter::image::{ImageJob, ImageMode, ImagePipeline, ImagePipelineLoader};
use kiln_orchestrator::adapter::llm::{
    EngineError, LlmEngine, LlmEngineFactory, LlmEngineOptions, SamplingParams,
    estimate_llm_memory_mb,
};
use kiln_orchestrator::adapter::video::{VideoJob, VideoPipeline, VideoPipelineLoader};

/// Encode a solid-colour PNG of the given size and return it base64'd,
/// ready to be used as an `image_base64` task parameter.
pub fn png_fixture_base64(width: u32, height: u32) -> String {
    let image = image::RgbImage::from_pixel(width, height, image::Rgb([120, 90, 60]));
    let mut buffer = Cursor::new(Vec::new());
    image
        .write_to(&mut buffer, image::ImageFormat::Png)
        .expect("encode fixture png");
    BASE64.encode(buffer.into_inner())
}

// ── LLM ──────────────────────────────────────────────────────────────────

/// An engine that streams a canned response word by word.
pub struct EchoLlmEngine {
    model_id: String,
    memory_mb: u64,
}

impl LlmEngine for EchoLlmEngine {
    fn generate(
        &self,
        _prompt: &str,
        _sampling: &SamplingParams,
        on_delta: &mut (dyn FnMut(String) + Send),
    ) -> Result<String, EngineError> {
        let words = ["hello", " from ", self.model_id.as_str()];
        let mut full = String::new();
        for word in words {
            full.push_str(word);
            on_delta(word.to_string());
        }
        Ok(full)
    }

    fn worker_pids(&self) -> Vec<u32> {
        Vec::new()
    }

    fn memory_mb(&self) -> u64 {
        self.memory_mb
    }

    fn shutdown(&self) -> Result<(), EngineError> {
        Ok(())
    }
}

/// Launches [`EchoLlmEngine`]s; memory cost follows the name-based
/// estimator so eviction arithmetic stays realistic.
pub struct EchoLlmFactory;

impl LlmEngineFactory for EchoLlmFactory {
    fn launch(
        &self,
        model_id: &str,
        _options: &LlmEngineOptions,
    ) -> Result<Arc<dyn LlmEngine>, EngineError> {
        Ok(Arc::new(EchoLlmEngine {
            model_id: model_id.to_string(),
            memory_mb: estimate_llm_memory_mb(model_id),
        }))
    }
}

// ── Diffusion ────────────────────────────────────────────────────────────

/// A pipeline that renders a real PNG at the requested geometry.
pub struct StubImagePipeline {
    memory_mb: u64,
}

impl ImagePipeline for StubImagePipeline {
    fn run(&self, job: &ImageJob) -> Result<Vec<u8>, EngineError> {
        let shade = (job.seed % 255) as u8;
        let image = image::RgbImage::from_pixel(job.width, job.height, image::Rgb([shade; 3]));
        let mut buffer = Cursor::new(Vec::new());
        image
            .write_to(&mut buffer, image::ImageFormat::Png)
            .map_err(|e| -> EngineError { e.to_string().into() })?;
        Ok(buffer.into_inner())
    }

    fn release(&self) -> Result<u64, EngineError> {
        Ok(self.memory_mb)
    }
}

pub struct StubImageLoader {
    pub memory_mb: u64,
}

impl ImagePipelineLoader for StubImageLoader {
    fn load(
        &self,
        _model_id: &str,
        _mode: ImageMode,
    ) -> Result<(Arc<dyn ImagePipeline>, u64), EngineError> {
        Ok((
            Arc::new(StubImagePipeline {
                memory_mb: self.memory_mb,
            }),
            self.memory_mb,
        ))
    }
}

// ── Video ────────────────────────────────────────────────────────────────

/// A pipeline that emits a synthetic container sized by the frame count.
pub struct StubVideoPipeline {
    memory_mb: u64,
}

impl VideoPipeline for StubVideoPipeline {
    fn run(&self, job: &VideoJob) -> Result<Vec<u8>, EngineError> {
        let mut container = b"ftypisom".to_vec();
        container.extend(std::iter::repeat_n(0u8, job.num_frames as usize * 16));
        Ok(container)
    }

    fn release(&self) -> Result<u64, EngineError> {
        Ok(self.memory_mb)
    }
}

pub struct StubVideoLoader {
    pub memory_mb: u64,
}

impl VideoPipelineLoader for StubVideoLoader {
    fn load(&self, _model_id: &str) -> Result<(Arc<dyn VideoPipeline>, u64), EngineError> {
        Ok((
            Arc::new(StubVideoPipeline {
                memory_mb: self.memory_mb,
            }),
            self.memory_mb,
        ))
    }
}

//! Engine backend seams.
//!
//! The inference runtimes (LLM engine, diffusion pipelines, video
//! pipelines) are external integrations wired in at deployment time. The
//! default build links the unconfigured stand-ins below: every load fails
//! with a clear message while the HTTP surface, queue, and orchestrator
//! stay fully operational. Deployments replace these with adapters over
//! their runtime of choice.

use std::sync::Arc;

use kiln_orchestrator::adapter::image::{ImageMode, ImagePipeline, ImagePipelineLoader};
use kiln_orchestrator::adapter::llm::{EngineError, LlmEngine, LlmEngineFactory, LlmEngineOptions};
use kiln_orchestrator::adapter::video::{VideoPipeline, VideoPipelineLoader};

fn not_linked(family: &str) -> EngineError {
    format!("no {family} runtime is linked into this build").into()
}

/// LLM factory that rejects every launch.
pub struct UnconfiguredLlmFactory;

impl LlmEngineFactory for UnconfiguredLlmFactory {
    fn launch(
        &self,
        _model_id: &str,
        _options: &LlmEngineOptions,
    ) -> Result<Arc<dyn LlmEngine>, EngineError> {
        Err(not_linked("LLM"))
    }
}

/// Image pipeline loader that rejects every load.
pub struct UnconfiguredImageLoader;

impl ImagePipelineLoader for UnconfiguredImageLoader {
    fn load(
        &self,
        _model_id: &str,
        _mode: ImageMode,
    ) -> Result<(Arc<dyn ImagePipeline>, u64), EngineError> {
        Err(not_linked("image diffusion"))
    }
}

/// Video pipeline loader that rejects every load.
pub struct UnconfiguredVideoLoader;

impl VideoPipelineLoader for UnconfiguredVideoLoader {
    fn load(&self, _model_id: &str) -> Result<(Arc<dyn VideoPipeline>, u64), EngineError> {
        Err(not_linked("video diffusion"))
    }
}

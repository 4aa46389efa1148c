//! The per-family model adapter contract.
//!
//! An adapter is the only code that understands a model family's runtime.
//! The orchestrator consumes adapters through four operations (estimate,
//! load, unload, generate) and treats the loaded instance as an opaque
//! [`ModelHandle`]. Adapters are looked up in the [`AdapterRegistry`] by
//! [`ModelType`]; an unknown type is an error, never a panic.
//!
//! Load, unload, and generate block on engine work, so every implementation
//! shunts that work through `tokio::task::spawn_blocking` to keep the
//! scheduler responsive.

pub mod image;
pub mod llm;
pub mod video;

use std::any::Any;
use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use kiln_core::ModelType;

use crate::error::{AdapterResult, OrchestratorError, OrchestratorResult};

pub use image::{ImageAdapter, ImageJob, ImageMode, ImagePipeline, ImagePipelineLoader};
pub use llm::{LlmAdapter, LlmEngine, LlmEngineFactory, LlmEngineOptions, SamplingParams};
pub use video::{VideoAdapter, VideoJob, VideoPipeline, VideoPipelineLoader};

/// An opaque, cloneable reference to an accelerator-resident instance.
///
/// Only the adapter that produced a handle can downcast it back to the
/// concrete engine type.
#[derive(Clone)]
pub struct ModelHandle(Arc<dyn Any + Send + Sync>);

impl std::fmt::Debug for ModelHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("ModelHandle(..)")
    }
}

impl ModelHandle {
    pub fn new<T: Send + Sync + 'static>(instance: T) -> Self {
        Self(Arc::new(instance))
    }

    pub fn from_arc<T: Send + Sync + 'static>(instance: Arc<T>) -> Self {
        Self(instance)
    }

    pub fn downcast<T: Send + Sync + 'static>(&self) -> Option<Arc<T>> {
        Arc::clone(&self.0).downcast::<T>().ok()
    }
}

/// The result of an adapter load: the handle, its measured memory cost, and
/// family-specific facts (e.g. the detected video family).
pub struct LoadOutput {
    pub instance: ModelHandle,
    pub memory_mb: u64,
    pub metadata: HashMap<String, String>,
}

/// A generation request dispatched through an adapter.
#[derive(Debug, Clone)]
pub enum GenerateRequest {
    Image(ImageJob),
    Video(VideoJob),
    Chat {
        prompt: String,
        sampling: SamplingParams,
    },
}

/// The payload produced by a generation call.
#[derive(Debug, Clone)]
pub enum GenerateOutput {
    /// Encoded PNG bytes.
    Image(Vec<u8>),
    /// Encoded MP4 container bytes.
    Video(Vec<u8>),
    /// Final accumulated text.
    Text(String),
}

/// The contract every model family implements.
#[async_trait]
pub trait ModelAdapter: Send + Sync {
    fn model_type(&self) -> ModelType;

    /// Advisory memory estimate used for admission decisions. Pure; never
    /// touches the device.
    fn estimate_memory_mb(&self, model_id: &str) -> u64;

    /// Load `model_id` onto the accelerator.
    async fn load(&self, model_id: &str) -> AdapterResult<LoadOutput>;

    /// Release the instance and report freed memory in MB.
    async fn unload(&self, instance: ModelHandle) -> AdapterResult<u64>;

    /// Run a generation request against a resident instance.
    async fn generate(
        &self,
        instance: &ModelHandle,
        request: GenerateRequest,
    ) -> AdapterResult<GenerateOutput>;
}

impl std::fmt::Debug for dyn ModelAdapter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "dyn ModelAdapter({:?})", self.model_type())
    }
}

/// Registry of adapters keyed by model type, populated once at startup.
#[derive(Default)]
pub struct AdapterRegistry {
    adapters: HashMap<ModelType, Arc<dyn ModelAdapter>>,
}

impl AdapterRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an adapter, replacing any previous adapter for the type.
    pub fn register(&mut self, adapter: Arc<dyn ModelAdapter>) {
        self.adapters.insert(adapter.model_type(), adapter);
    }

    pub fn get(&self, model_type: ModelType) -> OrchestratorResult<Arc<dyn ModelAdapter>> {
        self.adapters
            .get(&model_type)
            .cloned()
            .ok_or(OrchestratorError::NoAdapter(model_type))
    }

    pub fn len(&self) -> usize {
        self.adapters.len()
    }

    pub fn is_empty(&self) -> bool {
        self.adapters.is_empty()
    }
}

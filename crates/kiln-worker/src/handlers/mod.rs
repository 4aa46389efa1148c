//! Task handlers.
//!
//! One handler per task type, registered in a [`HandlerRegistry`] at
//! startup. A handler is a pure async procedure from `(task_id, params)` to
//! a serialisable result payload; the worker owns status transitions and
//! terminal writes, handlers report intermediate progress themselves.

pub mod image;
pub mod image2image;
pub mod llm_compare;
pub mod video;

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use kiln_core::TaskType;
use serde_json::Value;

use crate::error::HandlerError;

pub use self::image::ImageHandler;
pub use self::image2image::Image2ImageHandler;
pub use self::llm_compare::{LlmCompareHandler, format_chat_prompt};
pub use self::video::VideoHandler;

/// A per-type task procedure.
#[async_trait]
pub trait TaskHandler: Send + Sync {
    fn task_type(&self) -> TaskType;

    /// Process one task and return its result payload.
    async fn handle(&self, task_id: &str, params: Value) -> Result<Value, HandlerError>;
}

/// Handlers keyed by task type.
#[derive(Default)]
pub struct HandlerRegistry {
    handlers: HashMap<TaskType, Arc<dyn TaskHandler>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, handler: Arc<dyn TaskHandler>) {
        self.handlers.insert(handler.task_type(), handler);
    }

    pub fn get(&self, task_type: TaskType) -> Option<Arc<dyn TaskHandler>> {
        self.handlers.get(&task_type).cloned()
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}

/// Decode task parameters into their typed record.
fn decode_params<T: serde::de::DeserializeOwned>(params: Value) -> Result<T, HandlerError> {
    serde_json::from_value(params).map_err(|e| HandlerError::InvalidParams(e.to_string()))
}

/// Decode a base64 input image and sniff its pixel dimensions.
fn decode_input_image(image_base64: &str) -> Result<(Vec<u8>, u32, u32), HandlerError> {
    let bytes = BASE64
        .decode(image_base64)
        .map_err(|e| HandlerError::InvalidParams(format!("image_base64: {e}")))?;
    // `::image` is the decoder crate, not the sibling handler module.
    let decoded = ::image::load_from_memory(&bytes)
        .map_err(|e| HandlerError::InvalidParams(format!("undecodable input image: {e}")))?;
    Ok((bytes, decoded.width(), decoded.height()))
}

/// The supplied seed, or a fresh random one.
fn resolve_seed(seed: Option<u64>) -> u64 {
    seed.unwrap_or_else(|| rand::random::<u32>() as u64)
}

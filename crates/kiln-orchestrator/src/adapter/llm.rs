//! LLM family adapter.
//!
//! Wraps an [`LlmEngine`] backend (the external inference runtime). The
//! engine spawns worker subprocesses whose GPU memory is invisible to
//! in-process allocator statistics, so unloading here is deliberately
//! aggressive: graceful shutdown, then a forced kill of any lingering
//! worker pids, with freed memory confirmed through the driver probe
//! rather than the engine's own accounting.

use std::collections::HashMap;
use std::process::Command;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use kiln_core::ModelType;
use regex::Regex;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tracing::{debug, info, warn};

use crate::error::{AdapterError, AdapterResult};
use crate::probe::MemoryProbe;

use super::{GenerateOutput, GenerateRequest, LoadOutput, ModelAdapter, ModelHandle};

/// Error type surfaced by engine backends.
pub type EngineError = Box<dyn std::error::Error + Send + Sync>;

/// Sampling controls forwarded to the engine.
#[derive(Debug, Clone)]
pub struct SamplingParams {
    pub temperature: f32,
    pub top_p: f32,
    pub top_k: u32,
    pub max_tokens: u32,
}

impl Default for SamplingParams {
    fn default() -> Self {
        Self {
            temperature: 0.7,
            top_p: 0.95,
            top_k: 40,
            max_tokens: 2048,
        }
    }
}

/// Engine launch hints, populated from configuration.
#[derive(Debug, Clone)]
pub struct LlmEngineOptions {
    pub tensor_parallel_size: u32,
    pub gpu_memory_utilization: f64,
    pub max_model_len: u32,
}

impl Default for LlmEngineOptions {
    fn default() -> Self {
        Self {
            tensor_parallel_size: 1,
            gpu_memory_utilization: 0.95,
            max_model_len: 8192,
        }
    }
}

/// A running text-generation engine. All methods block; callers shunt them
/// to a worker thread.
pub trait LlmEngine: Send + Sync {
    /// Generate text for `prompt`, emitting incremental chunks through
    /// `on_delta` and returning the final accumulated text.
    fn generate(
        &self,
        prompt: &str,
        sampling: &SamplingParams,
        on_delta: &mut (dyn FnMut(String) + Send),
    ) -> Result<String, EngineError>;

    /// Pids of worker subprocesses spawned by this engine.
    fn worker_pids(&self) -> Vec<u32>;

    /// Measured memory cost of this engine, in MB.
    fn memory_mb(&self) -> u64;

    /// Graceful shutdown. Worker subprocesses may outlive this call.
    fn shutdown(&self) -> Result<(), EngineError>;
}

/// Launches engines for model ids. Implemented by the runtime integration;
/// stubbed in tests.
pub trait LlmEngineFactory: Send + Sync {
    fn launch(
        &self,
        model_id: &str,
        options: &LlmEngineOptions,
    ) -> Result<Arc<dyn LlmEngine>, EngineError>;
}

/// Memory estimates in MB keyed by parameter count (billions).
const LLM_MEMORY_ESTIMATES: [(f64, u64); 10] = [
    (0.5, 1_500),
    (1.0, 3_000),
    (3.0, 7_000),
    (7.0, 14_000),
    (8.0, 16_000),
    (13.0, 26_000),
    (14.0, 28_000),
    (32.0, 64_000),
    (70.0, 140_000),
    (72.0, 144_000),
];

const DEFAULT_LLM_ESTIMATE_MB: u64 = 14_000;

/// How long to let worker subprocesses exit on their own after a graceful
/// shutdown before force-killing them.
const WORKER_EXIT_GRACE: Duration = Duration::from_millis(500);

/// How long to wait after the kill pass for the OS to reclaim mappings
/// before re-sampling the driver probe.
const RECLAIM_SETTLE: Duration = Duration::from_secs(1);

/// Estimate LLM memory by extracting a parameter count from the model name.
pub fn estimate_llm_memory_mb(model_id: &str) -> u64 {
    let id = model_id.to_lowercase();

    // Patterns: "7b", "7.5b", "0.5b", also "-b" / "_b" separators.
    let patterns = [r"(\d+\.?\d*)b", r"(\d+\.?\d*)-b", r"(\d+\.?\d*)_b"];

    for pattern in patterns {
        let re = Regex::new(pattern).expect("static pattern");
        if let Some(caps) = re.captures(&id) {
            if let Ok(params) = caps[1].parse::<f64>() {
                let (_, estimate) = LLM_MEMORY_ESTIMATES
                    .iter()
                    .min_by(|(a, _), (b, _)| {
                        (a - params)
                            .abs()
                            .partial_cmp(&(b - params).abs())
                            .unwrap_or(std::cmp::Ordering::Equal)
                    })
                    .copied()
                    .unwrap_or((0.0, DEFAULT_LLM_ESTIMATE_MB));
                return estimate;
            }
        }
    }

    warn!(model_id, "could not estimate LLM memory, using default");
    DEFAULT_LLM_ESTIMATE_MB
}

/// The handle payload for resident LLM engines.
pub struct LlmInstance {
    pub model_id: String,
    pub engine: Arc<dyn LlmEngine>,
    /// Worker subprocess pids recorded at load time.
    pub worker_pids: Vec<u32>,
}

/// Adapter for the LLM family.
pub struct LlmAdapter {
    factory: Arc<dyn LlmEngineFactory>,
    options: LlmEngineOptions,
    probe: Arc<dyn MemoryProbe>,
}

impl LlmAdapter {
    pub fn new(
        factory: Arc<dyn LlmEngineFactory>,
        options: LlmEngineOptions,
        probe: Arc<dyn MemoryProbe>,
    ) -> Self {
        Self {
            factory,
            options,
            probe,
        }
    }

    fn instance(&self, handle: &ModelHandle) -> AdapterResult<Arc<LlmInstance>> {
        handle
            .downcast::<LlmInstance>()
            .ok_or(AdapterError::InvalidHandle(ModelType::Llm))
    }

    /// Stream generation chunks for a resident engine.
    ///
    /// The blocking engine call runs on a worker thread and pushes chunks
    /// into a bounded channel; the returned stream yields them as they
    /// arrive and ends once the engine finishes.
    pub fn stream_chat(
        &self,
        handle: &ModelHandle,
        prompt: String,
        sampling: SamplingParams,
    ) -> AdapterResult<ReceiverStream<Result<String, AdapterError>>> {
        let instance = self.instance(handle)?;
        let (tx, rx) = mpsc::channel::<Result<String, AdapterError>>(64);

        tokio::task::spawn_blocking(move || {
            let mut on_delta = |chunk: String| {
                // Receiver dropped means the client went away; the engine
                // call still runs to completion.
                let _ = tx.blocking_send(Ok(chunk));
            };
            if let Err(e) = instance.engine.generate(&prompt, &sampling, &mut on_delta) {
                let _ = tx.blocking_send(Err(AdapterError::Engine(e.to_string())));
            }
        });

        Ok(ReceiverStream::new(rx))
    }
}

#[async_trait]
impl ModelAdapter for LlmAdapter {
    fn model_type(&self) -> ModelType {
        ModelType::Llm
    }

    fn estimate_memory_mb(&self, model_id: &str) -> u64 {
        estimate_llm_memory_mb(model_id)
    }

    async fn load(&self, model_id: &str) -> AdapterResult<LoadOutput> {
        let factory = Arc::clone(&self.factory);
        let options = self.options.clone();
        let model_id = model_id.to_string();

        info!(model_id = %model_id, "loading LLM engine");

        let instance = tokio::task::spawn_blocking(move || {
            let engine = factory
                .launch(&model_id, &options)
                .map_err(|e| AdapterError::Engine(e.to_string()))?;
            let worker_pids = engine.worker_pids();
            Ok::<_, AdapterError>(LlmInstance {
                model_id,
                engine,
                worker_pids,
            })
        })
        .await
        .map_err(|e| AdapterError::Join(e.to_string()))??;

        let memory_mb = instance.engine.memory_mb();
        debug!(
            model_id = %instance.model_id,
            memory_mb,
            workers = instance.worker_pids.len(),
            "LLM engine ready"
        );

        Ok(LoadOutput {
            instance: ModelHandle::new(instance),
            memory_mb,
            metadata: HashMap::new(),
        })
    }

    async fn unload(&self, instance: ModelHandle) -> AdapterResult<u64> {
        let instance = self.instance(&instance)?;
        let probe = Arc::clone(&self.probe);

        let freed = tokio::task::spawn_blocking(move || {
            let before = probe.gpu_status();

            if let Err(e) = instance.engine.shutdown() {
                warn!(model_id = %instance.model_id, error = %e, "engine shutdown failed");
            }

            // Workers hold GPU memory outside this process; give them a
            // moment, then force-kill whatever is left.
            std::thread::sleep(WORKER_EXIT_GRACE);
            for pid in &instance.worker_pids {
                match Command::new("kill").args(["-9", &pid.to_string()]).status() {
                    Ok(status) if status.success() => {
                        info!(pid, "killed lingering engine worker");
                    }
                    // Already exited, or not ours to kill.
                    _ => {}
                }
            }

            std::thread::sleep(RECLAIM_SETTLE);
            let after = probe.gpu_status();
            before.used_mb.saturating_sub(after.used_mb)
        })
        .await
        .map_err(|e| AdapterError::Join(e.to_string()))?;

        info!(freed_mb = freed, "LLM engine unloaded");
        Ok(freed)
    }

    async fn generate(
        &self,
        instance: &ModelHandle,
        request: GenerateRequest,
    ) -> AdapterResult<GenerateOutput> {
        let GenerateRequest::Chat { prompt, sampling } = request else {
            return Err(AdapterError::UnsupportedRequest(ModelType::Llm));
        };
        let instance = self.instance(instance)?;

        let text = tokio::task::spawn_blocking(move || {
            let mut sink = |_chunk: String| {};
            instance
                .engine
                .generate(&prompt, &sampling, &mut sink)
                .map_err(|e| AdapterError::Engine(e.to_string()))
        })
        .await
        .map_err(|e| AdapterError::Join(e.to_string()))??;

        Ok(GenerateOutput::Text(text))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_estimate_by_parameter_count() {
        assert_eq!(estimate_llm_memory_mb("meta-llama/Llama-3-7B"), 14_000);
        assert_eq!(estimate_llm_memory_mb("Qwen/Qwen2.5-0.5B-Instruct"), 1_500);
        assert_eq!(estimate_llm_memory_mb("mistralai/Mixtral-13b"), 26_000);
        assert_eq!(estimate_llm_memory_mb("org/Giant-70B"), 140_000);
    }

    #[test]
    fn test_estimate_snaps_to_nearest() {
        // 6B is closest to the 7B row.
        assert_eq!(estimate_llm_memory_mb("org/model-6b"), 14_000);
        // 40B is closest to the 32B row.
        assert_eq!(estimate_llm_memory_mb("org/model-40b"), 64_000);
    }

    #[test]
    fn test_estimate_default_when_unparseable() {
        assert_eq!(estimate_llm_memory_mb("org/mystery-model"), 14_000);
    }
}

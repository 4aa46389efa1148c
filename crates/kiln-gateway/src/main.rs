//! Kiln gateway — entry point.
//!
//! Reads configuration from environment variables, wires the orchestrator,
//! task store, and worker together, preloads configured LLMs, and serves
//! the HTTP surface.
//!
//! # Environment variables
//!
//! | Variable | Default | Description |
//! |----------|---------|-------------|
//! | `MODEL_IDS` | *(none)* | Comma-separated LLM ids to preload. |
//! | `TENSOR_PARALLEL_SIZE` | `1` | LLM engine parallelism hint. |
//! | `GPU_MEMORY_UTILIZATION` | `0.95` | LLM engine memory fraction. |
//! | `MAX_MODEL_LEN` | `8192` | LLM engine sequence-length hint. |
//! | `IMAGE_MODEL` / `IMAGE2IMAGE_MODEL` / `VIDEO_MODEL` | per-family defaults | Default model per task type. |
//! | `ENABLE_IMAGE` / `ENABLE_IMAGE2IMAGE` / `ENABLE_VIDEO` | `true` | Feature flags. |
//! | `REDIS_URL` | `redis://127.0.0.1:6379` | Task store endpoint. |
//! | `TASK_TTL_HOURS` | `24` | Task record lifetime. |
//! | `PORT` | `8000` | HTTP port. |
//! | `OUTPUT_DIR` | `./outputs` | Encoded video output directory. |

use std::sync::Arc;
use std::time::Duration;

use kiln_core::{KilnConfig, ModelType};
use kiln_gateway::backends::{
    UnconfiguredImageLoader, UnconfiguredLlmFactory, UnconfiguredVideoLoader,
};
use kiln_gateway::{AppState, server};
use kiln_orchestrator::adapter::{
    AdapterRegistry, ImageAdapter, LlmAdapter, LlmEngineOptions, VideoAdapter,
};
use kiln_orchestrator::{ModelOrchestrator, probe};
use kiln_queue::{RedisKv, TaskStore};
use kiln_worker::handlers::{
    HandlerRegistry, Image2ImageHandler, ImageHandler, LlmCompareHandler, VideoHandler,
};
use kiln_worker::{Worker, WorkerConfig};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config = Arc::new(KilnConfig::from_env());

    if let Err(e) = std::fs::create_dir_all(&config.output_dir) {
        error!(dir = %config.output_dir.display(), error = %e, "cannot create output directory");
        std::process::exit(1);
    }

    // Memory probe and per-family adapters.
    let memory_probe = probe::detect();
    let llm_adapter = Arc::new(LlmAdapter::new(
        Arc::new(UnconfiguredLlmFactory),
        LlmEngineOptions {
            tensor_parallel_size: config.tensor_parallel_size,
            gpu_memory_utilization: config.gpu_memory_utilization,
            max_model_len: config.max_model_len,
        },
        Arc::clone(&memory_probe),
    ));

    let image_loader = Arc::new(UnconfiguredImageLoader);
    let mut adapters = AdapterRegistry::new();
    adapters.register(llm_adapter.clone());
    adapters.register(Arc::new(ImageAdapter::text_to_image(image_loader.clone())));
    adapters.register(Arc::new(ImageAdapter::image_to_image(image_loader)));
    adapters.register(Arc::new(VideoAdapter::new(Arc::new(
        UnconfiguredVideoLoader,
    ))));

    let orchestrator = Arc::new(ModelOrchestrator::new(adapters, memory_probe));

    // Task store.
    let kv = match RedisKv::connect(&config.redis_url).await {
        Ok(kv) => kv,
        Err(e) => {
            error!(url = %config.redis_url, error = %e, "cannot reach redis");
            std::process::exit(1);
        }
    };
    let tasks = Arc::new(TaskStore::new(
        Arc::new(kv),
        Duration::from_secs(config.task_ttl_secs()),
    ));

    // Preload configured LLMs; failures are logged, startup continues.
    for model_id in &config.model_ids {
        if let Err(e) = orchestrator.load(model_id, ModelType::Llm, false).await {
            error!(model_id = %model_id, error = %e, "failed to preload model");
        }
    }

    // Reclaim tasks stranded by a previous crash before dispatch begins.
    match tasks.recover_orphans().await {
        Ok(0) => {}
        Ok(n) => info!(recovered = n, "orphaned tasks requeued"),
        Err(e) => warn!(error = %e, "orphan recovery failed"),
    }

    // Handlers, shared between the worker and the synchronous routes.
    let mut handlers = HandlerRegistry::new();
    handlers.register(Arc::new(ImageHandler::new(
        Arc::clone(&orchestrator),
        Arc::clone(&config),
    )));
    handlers.register(Arc::new(Image2ImageHandler::new(
        Arc::clone(&orchestrator),
        Arc::clone(&config),
    )));
    handlers.register(Arc::new(VideoHandler::new(
        Arc::clone(&orchestrator),
        Arc::clone(&tasks),
        Arc::clone(&config),
    )));
    handlers.register(Arc::new(LlmCompareHandler::new(
        Arc::clone(&orchestrator),
        Arc::clone(&tasks),
    )));
    let handlers = Arc::new(handlers);

    let worker = Arc::new(Worker::new(
        Arc::clone(&tasks),
        Arc::clone(&handlers),
        WorkerConfig::default(),
    ));
    worker.start();

    let gpu = orchestrator.gpu_status();
    info!(
        port = config.port,
        redis = %config.redis_url,
        gpu_total_mb = gpu.total_mb,
        gpu_free_mb = gpu.free_mb,
        preloaded = orchestrator.list_loaded().len(),
        "kiln gateway initialised"
    );

    let state = AppState {
        orchestrator: Arc::clone(&orchestrator),
        tasks,
        handlers,
        llm: llm_adapter,
        config: Arc::clone(&config),
    };

    if let Err(e) = server::serve(state, config.port).await {
        error!(error = %e, "server error");
    }

    // Drain: stop dispatching, then release the accelerator.
    worker.stop();
    orchestrator.unload_all().await;
    info!("shutdown complete");
}

//! End-to-end pipeline tests: task creation through worker dispatch,
//! handler execution against stub runtimes, and terminal result payloads.

use std::sync::Arc;
use std::time::Duration;

use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use kiln_core::{GpuStatus, KilnConfig, ModelType, TaskStatus, TaskType};
use kiln_orchestrator::adapter::{
    AdapterRegistry, ImageAdapter, LlmAdapter, LlmEngineOptions, SamplingParams, VideoAdapter,
};
use kiln_orchestrator::{ModelOrchestrator, StaticProbe};
use kiln_queue::{MemoryKv, TaskStore};
use kiln_testing::stubs::{EchoLlmFactory, StubImageLoader, StubVideoLoader, png_fixture_base64};
use kiln_worker::handlers::{
    HandlerRegistry, Image2ImageHandler, ImageHandler, LlmCompareHandler, VideoHandler,
};
use kiln_worker::{Worker, WorkerConfig};
use serde_json::json;
use tokio_stream::StreamExt;

struct Harness {
    orchestrator: Arc<ModelOrchestrator>,
    store: Arc<TaskStore>,
    worker: Arc<Worker>,
    llm: Arc<LlmAdapter>,
    config: Arc<KilnConfig>,
    _output_dir: tempfile::TempDir,
}

fn harness() -> Harness {
    let output_dir = tempfile::tempdir().expect("tempdir");
    let config = Arc::new(KilnConfig {
        output_dir: output_dir.path().to_path_buf(),
        ..Default::default()
    });

    let probe = Arc::new(StaticProbe::new(GpuStatus::new(96_000, 0, 96_000)));
    let llm = Arc::new(LlmAdapter::new(
        Arc::new(EchoLlmFactory),
        LlmEngineOptions::default(),
        probe.clone(),
    ));
    let image_loader = Arc::new(StubImageLoader { memory_mb: 8_000 });

    let mut adapters = AdapterRegistry::new();
    adapters.register(llm.clone());
    adapters.register(Arc::new(ImageAdapter::text_to_image(image_loader.clone())));
    adapters.register(Arc::new(ImageAdapter::image_to_image(image_loader)));
    adapters.register(Arc::new(VideoAdapter::new(Arc::new(StubVideoLoader {
        memory_mb: 8_000,
    }))));

    let orchestrator = Arc::new(ModelOrchestrator::new(adapters, probe));
    let store = Arc::new(TaskStore::new(
        Arc::new(MemoryKv::new()),
        Duration::from_secs(3600),
    ));

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
        Arc::clone(&store),
        Arc::clone(&config),
    )));
    handlers.register(Arc::new(LlmCompareHandler::new(
        Arc::clone(&orchestrator),
        Arc::clone(&store),
    )));

    let worker = Arc::new(Worker::new(
        Arc::clone(&store),
        Arc::new(handlers),
        WorkerConfig {
            poll_interval: Duration::from_millis(10),
            ..Default::default()
        },
    ));

    Harness {
        orchestrator,
        store,
        worker,
        llm,
        config,
        _output_dir: output_dir,
    }
}

async fn wait_terminal(store: &TaskStore, task_id: &str) -> kiln_core::Task {
    for _ in 0..500 {
        if let Some(task) = store.get(task_id).await.unwrap() {
            if task.status.is_terminal() {
                return task;
            }
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("task {task_id} never reached a terminal status");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn image_task_happy_path() {
    let h = harness();
    h.worker.start();

    let task = h
        .store
        .create(
            TaskType::Image,
            json!({"prompt": "a kiln at dusk", "width": 512, "height": 512, "seed": 42}),
            None,
        )
        .await
        .unwrap();

    let done = wait_terminal(&h.store, &task.id).await;
    assert_eq!(done.status, TaskStatus::Completed);
    assert_eq!(done.progress, 100.0);

    let result = done.result.unwrap();
    assert_eq!(result["seed"], 42);

    // The payload is a real PNG at the requested geometry.
    let png = BASE64
        .decode(result["image_base64"].as_str().unwrap())
        .unwrap();
    let decoded = image::load_from_memory(&png).unwrap();
    assert_eq!((decoded.width(), decoded.height()), (512, 512));

    // The default image model became resident along the way.
    assert!(h.orchestrator.is_loaded(&h.config.image_model));
    h.worker.stop();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn image2image_task_happy_path() {
    let h = harness();
    h.worker.start();

    let task = h
        .store
        .create(
            TaskType::Image2Image,
            json!({
                "prompt": "weathered bricks",
                "image_base64": png_fixture_base64(640, 480),
                "seed": 7,
            }),
            None,
        )
        .await
        .unwrap();

    let done = wait_terminal(&h.store, &task.id).await;
    assert_eq!(done.status, TaskStatus::Completed);

    let result = done.result.unwrap();
    assert_eq!(result["seed"], 7);

    let png = BASE64
        .decode(result["image_base64"].as_str().unwrap())
        .unwrap();
    // Output keeps the input geometry.
    let decoded = image::load_from_memory(&png).unwrap();
    assert_eq!((decoded.width(), decoded.height()), (640, 480));
    h.worker.stop();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn video_task_writes_container_and_result() {
    let h = harness();
    h.worker.start();

    let task = h
        .store
        .create(
            TaskType::Video,
            json!({
                "prompt": "slow pan over embers",
                "image_base64": png_fixture_base64(833, 481),
                "num_frames": 49,
                "seed": 9,
            }),
            None,
        )
        .await
        .unwrap();

    let done = wait_terminal(&h.store, &task.id).await;
    assert_eq!(done.status, TaskStatus::Completed, "error: {:?}", done.error);
    assert_eq!(done.progress, 100.0);

    let result = done.result.unwrap();
    assert_eq!(result["seed"], 9);
    assert!(!result["video_base64"].as_str().unwrap().is_empty());

    // The container also landed in the output directory.
    let path = h.config.output_dir.join(format!("{}.mp4", task.id));
    let bytes = std::fs::read(&path).unwrap();
    assert!(bytes.starts_with(b"ftypisom"));

    // The default video model (a rapid checkpoint) became resident with
    // its family recorded.
    let loaded = h.orchestrator.get(&h.config.video_model).unwrap();
    assert_eq!(
        loaded.metadata.get("video_family").map(String::as_str),
        Some("wan_rapid")
    );
    h.worker.stop();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn llm_compare_reports_per_model_outcomes() {
    let h = harness();

    // Two resident engines before the comparison is enqueued.
    h.orchestrator
        .load("org/alpha-7b", ModelType::Llm, false)
        .await
        .unwrap();
    h.orchestrator
        .load("org/beta-7b", ModelType::Llm, false)
        .await
        .unwrap();

    h.worker.start();

    let task = h
        .store
        .create(
            TaskType::LlmCompare,
            json!({
                "models": ["alpha-7b", "no-such-model"],
                "messages": [{"role": "user", "content": "compare yourselves"}],
            }),
            None,
        )
        .await
        .unwrap();

    let done = wait_terminal(&h.store, &task.id).await;
    assert_eq!(done.status, TaskStatus::Completed);

    let responses = &done.result.unwrap()["responses"];
    assert!(
        responses["alpha-7b"]["content"]
            .as_str()
            .unwrap()
            .contains("org/alpha-7b")
    );
    assert_eq!(responses["no-such-model"]["error"], "Model not found");
    h.worker.stop();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn chat_stream_chunks_accumulate_to_final_text() {
    let h = harness();

    let loaded = h
        .orchestrator
        .load("org/chatty-7b", ModelType::Llm, false)
        .await
        .unwrap();

    let mut stream = h
        .llm
        .stream_chat(
            &loaded.instance,
            "<|im_start|>user\nhi<|im_end|>\n<|im_start|>assistant\n".to_string(),
            SamplingParams::default(),
        )
        .unwrap();

    let mut accumulated = String::new();
    while let Some(chunk) = stream.next().await {
        accumulated.push_str(&chunk.unwrap());
    }
    assert_eq!(accumulated, "hello from org/chatty-7b");
}

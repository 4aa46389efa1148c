//! Worker dispatch behaviour: concurrency caps, requeue fairness, and
//! terminal transitions, driven against the in-memory store.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use kiln_core::{TaskStatus, TaskType};
use kiln_queue::{MemoryKv, TaskStore};
use kiln_worker::{HandlerError, HandlerRegistry, TaskHandler, Worker, WorkerConfig};
use serde_json::{Value, json};
use tokio::sync::Semaphore;

/// A handler that waits on a semaphore permit before finishing, tracking
/// entry order and peak concurrency.
struct GatedHandler {
    task_type: TaskType,
    gate: Arc<Semaphore>,
    active: AtomicUsize,
    peak: AtomicUsize,
    order: Mutex<Vec<String>>,
    fail: bool,
}

impl GatedHandler {
    fn new(task_type: TaskType, permits: usize) -> Arc<Self> {
        Arc::new(Self {
            task_type,
            gate: Arc::new(Semaphore::new(permits)),
            active: AtomicUsize::new(0),
            peak: AtomicUsize::new(0),
            order: Mutex::new(Vec::new()),
            fail: false,
        })
    }

    fn failing(task_type: TaskType) -> Arc<Self> {
        Arc::new(Self {
            task_type,
            gate: Arc::new(Semaphore::new(usize::MAX >> 4)),
            active: AtomicUsize::new(0),
            peak: AtomicUsize::new(0),
            order: Mutex::new(Vec::new()),
            fail: true,
        })
    }

    fn release(&self, n: usize) {
        self.gate.add_permits(n);
    }

    fn peak_concurrency(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }

    fn entry_order(&self) -> Vec<String> {
        self.order.lock().unwrap().clone()
    }
}

#[async_trait]
impl TaskHandler for GatedHandler {
    fn task_type(&self) -> TaskType {
        self.task_type
    }

    async fn handle(&self, task_id: &str, _params: Value) -> Result<Value, HandlerError> {
        self.order.lock().unwrap().push(task_id.to_string());
        let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);

        let permit = self.gate.acquire().await;
        self.active.fetch_sub(1, Ordering::SeqCst);
        drop(permit);

        if self.fail {
            return Err(HandlerError::Generation("synthetic failure".into()));
        }
        Ok(json!({"ok": true}))
    }
}

fn test_config(limits: &[(TaskType, usize)]) -> WorkerConfig {
    WorkerConfig {
        poll_interval: Duration::from_millis(10),
        error_backoff: Duration::from_millis(10),
        limits: limits.iter().copied().collect::<HashMap<_, _>>(),
    }
}

fn store() -> Arc<TaskStore> {
    Arc::new(TaskStore::new(
        Arc::new(MemoryKv::new()),
        Duration::from_secs(3600),
    ))
}

async fn wait_for<F: Fn() -> bool>(cond: F, what: &str) {
    for _ in 0..200 {
        if cond() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("timed out waiting for {what}");
}

async fn wait_for_status(store: &TaskStore, task_id: &str, status: TaskStatus) {
    for _ in 0..200 {
        if let Some(task) = store.get(task_id).await.unwrap() {
            if task.status == status {
                return;
            }
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("task {task_id} never reached {status}");
}

#[tokio::test]
async fn completes_and_fails_tasks() {
    let store = store();
    let ok = GatedHandler::new(TaskType::Image, 100);
    let bad = GatedHandler::failing(TaskType::Video);

    let mut registry = HandlerRegistry::new();
    registry.register(ok.clone());
    registry.register(bad.clone());

    let worker = Arc::new(Worker::new(
        Arc::clone(&store),
        Arc::new(registry),
        test_config(&[(TaskType::Image, 2), (TaskType::Video, 1)]),
    ));
    worker.start();

    let good = store
        .create(TaskType::Image, json!({"prompt": "p"}), None)
        .await
        .unwrap();
    let failing = store
        .create(TaskType::Video, json!({"prompt": "p"}), None)
        .await
        .unwrap();

    wait_for_status(&store, &good.id, TaskStatus::Completed).await;
    wait_for_status(&store, &failing.id, TaskStatus::Failed).await;

    let done = store.get(&good.id).await.unwrap().unwrap();
    assert_eq!(done.progress, 100.0);
    assert_eq!(done.result.unwrap()["ok"], true);

    let failed = store.get(&failing.id).await.unwrap().unwrap();
    assert!(failed.error.unwrap().contains("synthetic failure"));

    // Terminal tasks release their capacity.
    wait_for(|| worker.in_flight(TaskType::Image) == 0, "image slots drained").await;
    assert_eq!(worker.in_flight(TaskType::Video), 0);
    worker.stop();
}

#[tokio::test]
async fn cap_bounds_concurrent_handlers() {
    let store = store();
    let handler = GatedHandler::new(TaskType::Image, 0);

    let mut registry = HandlerRegistry::new();
    registry.register(handler.clone());

    let worker = Arc::new(Worker::new(
        Arc::clone(&store),
        Arc::new(registry),
        test_config(&[(TaskType::Image, 2)]),
    ));
    worker.start();

    let mut ids = Vec::new();
    for i in 0..4 {
        let task = store
            .create(TaskType::Image, json!({"prompt": format!("p{i}")}), None)
            .await
            .unwrap();
        ids.push(task.id);
    }

    // Two dispatch, two keep cycling through the queue.
    wait_for(|| worker.in_flight(TaskType::Image) == 2, "cap reached").await;
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(worker.in_flight(TaskType::Image), 2);
    assert!(handler.peak_concurrency() <= 2);

    handler.release(100);
    for id in &ids {
        wait_for_status(&store, id, TaskStatus::Completed).await;
    }
    assert!(handler.peak_concurrency() <= 2);
    worker.stop();
}

#[tokio::test]
async fn saturation_requeues_and_lets_other_types_run() {
    let store = store();
    let video = GatedHandler::new(TaskType::Video, 0);
    let image = GatedHandler::new(TaskType::Image, 100);

    let mut registry = HandlerRegistry::new();
    registry.register(video.clone());
    registry.register(image.clone());

    let worker = Arc::new(Worker::new(
        Arc::clone(&store),
        Arc::new(registry),
        test_config(&[(TaskType::Video, 1), (TaskType::Image, 2)]),
    ));
    worker.start();

    // First video job saturates the type.
    let v1 = store
        .create(TaskType::Video, json!({"prompt": "v1"}), None)
        .await
        .unwrap();
    wait_for_status(&store, &v1.id, TaskStatus::Processing).await;

    // A second video job and an image job behind it.
    let v2 = store
        .create(TaskType::Video, json!({"prompt": "v2"}), None)
        .await
        .unwrap();
    let y = store
        .create(TaskType::Image, json!({"prompt": "y"}), None)
        .await
        .unwrap();

    // The image job overtakes the saturated video job.
    wait_for_status(&store, &y.id, TaskStatus::Completed).await;
    let stuck = store.get(&v2.id).await.unwrap().unwrap();
    assert_eq!(stuck.status, TaskStatus::Pending);
    assert_eq!(worker.in_flight(TaskType::Video), 1);

    // Release the first job; the second then dispatches.
    video.release(100);
    wait_for_status(&store, &v2.id, TaskStatus::Completed).await;
    worker.stop();
}

#[tokio::test]
async fn fifo_within_type_when_unsaturated() {
    let store = store();
    let handler = GatedHandler::new(TaskType::Image, 100);

    let mut registry = HandlerRegistry::new();
    registry.register(handler.clone());

    let worker = Arc::new(Worker::new(
        Arc::clone(&store),
        Arc::new(registry),
        test_config(&[(TaskType::Image, 10)]),
    ));

    let mut ids = Vec::new();
    for i in 0..5 {
        let task = store
            .create(TaskType::Image, json!({"prompt": format!("p{i}")}), None)
            .await
            .unwrap();
        ids.push(task.id);
    }

    worker.start();
    for id in &ids {
        wait_for_status(&store, id, TaskStatus::Completed).await;
    }

    assert_eq!(handler.entry_order(), ids, "dispatch must follow creation order");
    worker.stop();
}

#[tokio::test]
async fn missing_handler_fails_the_task() {
    let store = store();
    let registry = HandlerRegistry::new();

    let worker = Arc::new(Worker::new(
        Arc::clone(&store),
        Arc::new(registry),
        test_config(&[(TaskType::LlmCompare, 1)]),
    ));
    worker.start();

    let task = store
        .create(TaskType::LlmCompare, json!({"models": []}), None)
        .await
        .unwrap();

    wait_for_status(&store, &task.id, TaskStatus::Failed).await;
    let failed = store.get(&task.id).await.unwrap().unwrap();
    assert!(failed.error.unwrap().contains("no handler registered"));
    worker.stop();
}

#[tokio::test]
async fn stop_lets_in_flight_tasks_finish() {
    let store = store();
    let handler = GatedHandler::new(TaskType::Image, 0);

    let mut registry = HandlerRegistry::new();
    registry.register(handler.clone());

    let worker = Arc::new(Worker::new(
        Arc::clone(&store),
        Arc::new(registry),
        test_config(&[(TaskType::Image, 1)]),
    ));
    worker.start();

    let task = store
        .create(TaskType::Image, json!({"prompt": "p"}), None)
        .await
        .unwrap();
    wait_for_status(&store, &task.id, TaskStatus::Processing).await;

    worker.stop();
    assert!(!worker.is_running());

    // The in-flight handler still completes after the loop exits.
    handler.release(1);
    wait_for_status(&store, &task.id, TaskStatus::Completed).await;

    // Nothing new dispatches once stopped.
    let late = store
        .create(TaskType::Image, json!({"prompt": "late"}), None)
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(
        store.get(&late.id).await.unwrap().unwrap().status,
        TaskStatus::Pending
    );
}

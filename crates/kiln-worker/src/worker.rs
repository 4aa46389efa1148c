//! The polling worker.
//!
//! One dispatcher loop pops task ids from the pending queue. A task whose
//! type is at its concurrency cap goes back to the tail of the queue,
//! preserving fairness for other types; otherwise the task transitions to
//! `Processing` and its handler runs as an independent tokio task while the
//! loop keeps draining. Counter bookkeeping uses an RAII slot so a
//! panicking handler still releases its capacity.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use kiln_core::{TaskStatus, TaskType};
use kiln_queue::{TaskStore, TaskUpdate};
use tracing::{debug, error, info, warn};

use crate::handlers::HandlerRegistry;

/// Default per-type concurrency caps.
///
/// Video is very memory intensive; comparison jobs hold several LLMs busy.
pub fn concurrency_limits() -> HashMap<TaskType, usize> {
    HashMap::from([
        (TaskType::Video, 1),
        (TaskType::Image, 2),
        (TaskType::Image2Image, 2),
        (TaskType::LlmCompare, 1),
    ])
}

/// Worker tuning knobs.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Sleep between polls when the queue is empty.
    pub poll_interval: Duration,
    /// Back-off after a failed loop iteration.
    pub error_backoff: Duration,
    /// Per-type concurrency caps.
    pub limits: HashMap<TaskType, usize>,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(500),
            error_backoff: Duration::from_secs(1),
            limits: concurrency_limits(),
        }
    }
}

/// In-flight counters, one per task type.
struct TypeCounters {
    counts: [AtomicUsize; TaskType::ALL.len()],
}

impl TypeCounters {
    fn new() -> Self {
        Self {
            counts: Default::default(),
        }
    }

    fn index(task_type: TaskType) -> usize {
        TaskType::ALL
            .iter()
            .position(|t| *t == task_type)
            .unwrap_or(0)
    }

    fn current(&self, task_type: TaskType) -> usize {
        self.counts[Self::index(task_type)].load(Ordering::SeqCst)
    }

    /// Claim a slot unless the cap is reached. Only the dispatcher loop
    /// acquires, so the check-then-increment pair does not race.
    fn try_acquire(counters: &Arc<Self>, task_type: TaskType, limit: usize) -> Option<TypeSlot> {
        if counters.current(task_type) >= limit {
            return None;
        }
        counters.counts[Self::index(task_type)].fetch_add(1, Ordering::SeqCst);
        Some(TypeSlot {
            counters: Arc::clone(counters),
            task_type,
        })
    }
}

/// RAII capacity slot; releases the counter on drop.
struct TypeSlot {
    counters: Arc<TypeCounters>,
    task_type: TaskType,
}

impl Drop for TypeSlot {
    fn drop(&mut self) {
        self.counters.counts[TypeCounters::index(self.task_type)].fetch_sub(1, Ordering::SeqCst);
    }
}

/// Background dispatcher bridging the task store to task handlers.
pub struct Worker {
    store: Arc<TaskStore>,
    handlers: Arc<HandlerRegistry>,
    config: WorkerConfig,
    counters: Arc<TypeCounters>,
    running: AtomicBool,
}

impl Worker {
    pub fn new(store: Arc<TaskStore>, handlers: Arc<HandlerRegistry>, config: WorkerConfig) -> Self {
        Self {
            store,
            handlers,
            config,
            counters: Arc::new(TypeCounters::new()),
            running: AtomicBool::new(false),
        }
    }

    /// Number of in-flight tasks of a type. Exposed for observability.
    pub fn in_flight(&self, task_type: TaskType) -> usize {
        self.counters.current(task_type)
    }

    /// Spawn the polling loop onto the runtime and return immediately.
    pub fn start(self: &Arc<Self>) {
        if self.running.swap(true, Ordering::SeqCst) {
            warn!("worker already running");
            return;
        }
        let worker = Arc::clone(self);
        tokio::spawn(async move {
            worker.run().await;
        });
    }

    /// Ask the loop to exit after its current iteration. In-flight handlers
    /// are allowed to complete.
    pub fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    async fn run(self: Arc<Self>) {
        info!("task worker started");

        while self.running.load(Ordering::SeqCst) {
            match self.poll_once().await {
                // Dispatched or requeued something; keep draining, but let
                // spawned handlers run before the next pop.
                Ok(true) => tokio::task::yield_now().await,
                Ok(false) => tokio::time::sleep(self.config.poll_interval).await,
                Err(e) => {
                    error!(error = %e, "worker loop error");
                    tokio::time::sleep(self.config.error_backoff).await;
                }
            }
        }

        info!("task worker stopped");
    }

    /// One dispatch attempt. Returns whether a task id was consumed from
    /// the queue.
    async fn poll_once(&self) -> Result<bool, kiln_queue::StoreError> {
        let Some(task_id) = self.store.next_pending().await? else {
            return Ok(false);
        };

        let Some(task) = self.store.get(&task_id).await? else {
            // Expired between enqueue and dispatch.
            warn!(task_id = %task_id, "dequeued task no longer exists, dropping");
            return Ok(true);
        };

        let task_type = task.task_type;
        let limit = self.config.limits.get(&task_type).copied().unwrap_or(1);

        let Some(slot) = TypeCounters::try_acquire(&self.counters, task_type, limit) else {
            debug!(task_id = %task_id, task_type = %task_type, "type saturated, requeueing at tail");
            self.store.requeue(&task_id).await?;
            return Ok(true);
        };

        self.store
            .update(&task_id, TaskUpdate::status(TaskStatus::Processing))
            .await?;

        let handler = self.handlers.get(task_type);
        let store = Arc::clone(&self.store);

        tokio::spawn(async move {
            // Slot lives for the whole handler run, panic included.
            let _slot = slot;

            let outcome = match handler {
                Some(handler) => handler.handle(&task_id, task.params).await,
                None => Err(crate::HandlerError::InvalidParams(format!(
                    "no handler registered for task type '{task_type}'"
                ))),
            };

            let update = match outcome {
                Ok(result) => {
                    info!(task_id = %task_id, "task completed");
                    TaskUpdate::completed(result)
                }
                Err(e) => {
                    warn!(task_id = %task_id, error = %e, "task failed");
                    TaskUpdate::failed(e.to_string())
                }
            };

            if let Err(e) = store.update(&task_id, update).await {
                error!(task_id = %task_id, error = %e, "failed to record task outcome");
            }
        });

        Ok(true)
    }
}

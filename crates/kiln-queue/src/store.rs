//! The task store: durable task lifecycle with FIFO dispatch order.
//!
//! Persisted layout on the key-value store:
//!
//! | Key | Shape | Contents |
//! |---|---|---|
//! | `task:{id}` | hash | all task fields, TTL'd at creation |
//! | `queue:pending` | list | task ids in FIFO order |
//! | `queue:processing` | set | ids of in-flight, non-terminal tasks |
//! | `user:{uid}:tasks` | list | newest-first history, trimmed to 100 |
//!
//! Delivery is at-least-once: a crash between dequeue and the terminal
//! status write can leave an id in the processing set, which
//! [`TaskStore::recover_orphans`] moves back to pending at startup.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use kiln_core::{Task, TaskStatus, TaskType};
use serde::Serialize;
use serde_json::Value;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::kv::{KvStore, StoreError, StoreResult};

const TASK_KEY_PREFIX: &str = "task:";
const PENDING_QUEUE_KEY: &str = "queue:pending";
const PROCESSING_SET_KEY: &str = "queue:processing";
const USER_TASKS_PREFIX: &str = "user:";
const USER_TASKS_SUFFIX: &str = ":tasks";

/// Per-user history cap.
const MAX_USER_TASK_HISTORY: i64 = 100;

fn task_key(task_id: &str) -> String {
    format!("{TASK_KEY_PREFIX}{task_id}")
}

fn user_tasks_key(user_id: &str) -> String {
    format!("{USER_TASKS_PREFIX}{user_id}{USER_TASKS_SUFFIX}")
}

/// Queue size snapshot.
#[derive(Debug, Clone, Copy, Serialize)]
pub struct QueueStats {
    pub pending: u64,
    pub processing: u64,
}

/// A partial task mutation. Only supplied fields are written; `updated_at`
/// is always refreshed.
#[derive(Debug, Clone, Default)]
pub struct TaskUpdate {
    pub status: Option<TaskStatus>,
    pub progress: Option<f32>,
    pub result: Option<Value>,
    pub error: Option<String>,
}

impl TaskUpdate {
    pub fn status(status: TaskStatus) -> Self {
        Self {
            status: Some(status),
            ..Default::default()
        }
    }

    pub fn progress(progress: f32) -> Self {
        Self {
            progress: Some(progress),
            ..Default::default()
        }
    }

    /// Terminal success: completed, progress 100, result attached.
    pub fn completed(result: Value) -> Self {
        Self {
            status: Some(TaskStatus::Completed),
            progress: Some(100.0),
            result: Some(result),
            ..Default::default()
        }
    }

    /// Terminal failure with the captured error message.
    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            status: Some(TaskStatus::Failed),
            error: Some(error.into()),
            ..Default::default()
        }
    }
}

/// Durable task store over a [`KvStore`] backend.
pub struct TaskStore {
    kv: Arc<dyn KvStore>,
    ttl: Duration,
}

impl TaskStore {
    pub fn new(kv: Arc<dyn KvStore>, ttl: Duration) -> Self {
        Self { kv, ttl }
    }

    // ── Lifecycle ────────────────────────────────────────────────────────

    /// Create a pending task, enqueue it, and record it in the user's
    /// history.
    pub async fn create(
        &self,
        task_type: TaskType,
        params: Value,
        user_id: Option<String>,
    ) -> StoreResult<Task> {
        let task = Task::new(Uuid::new_v4().to_string(), task_type, params, user_id);

        let key = task_key(&task.id);
        self.kv.hset(&key, &serialize_task(&task)).await?;
        self.kv.expire(&key, self.ttl).await?;

        self.kv.rpush(PENDING_QUEUE_KEY, &task.id).await?;

        if let Some(user_id) = &task.user_id {
            let user_key = user_tasks_key(user_id);
            self.kv.lpush(&user_key, &task.id).await?;
            self.kv
                .ltrim(&user_key, 0, MAX_USER_TASK_HISTORY - 1)
                .await?;
            self.kv.expire(&user_key, self.ttl).await?;
        }

        info!(task_id = %task.id, task_type = %task.task_type, "task created");
        Ok(task)
    }

    /// Fetch a task; `None` for missing or expired records.
    pub async fn get(&self, task_id: &str) -> StoreResult<Option<Task>> {
        let fields = self.kv.hgetall(&task_key(task_id)).await?;
        if fields.is_empty() {
            return Ok(None);
        }
        deserialize_task(&fields).map(Some)
    }

    /// Apply a partial update, refreshing `updated_at` and maintaining the
    /// processing set on status transitions. Returns the updated task, or
    /// `None` when the record is gone.
    pub async fn update(&self, task_id: &str, update: TaskUpdate) -> StoreResult<Option<Task>> {
        let Some(mut task) = self.get(task_id).await? else {
            return Ok(None);
        };

        // Terminal records are immutable; a handler finishing after its
        // task was cancelled must not resurrect it.
        if task.status.is_terminal() {
            debug!(task_id, status = %task.status, "ignoring update to terminal task");
            return Ok(Some(task));
        }

        let now = Utc::now();
        let mut fields: Vec<(String, String)> =
            vec![("updated_at".into(), now.to_rfc3339())];
        task.updated_at = now;

        if let Some(status) = update.status {
            task.status = status;
            fields.push(("status".into(), status.to_string()));

            if status == TaskStatus::Processing {
                self.kv.sadd(PROCESSING_SET_KEY, task_id).await?;
            } else if status.is_terminal() {
                self.kv.srem(PROCESSING_SET_KEY, task_id).await?;
            }
        }

        if let Some(progress) = update.progress {
            task.progress = progress;
            fields.push(("progress".into(), progress.to_string()));
        }

        if let Some(result) = update.result {
            fields.push(("result".into(), result.to_string()));
            task.result = Some(result);
        }

        if let Some(error) = update.error {
            fields.push(("error".into(), error.clone()));
            task.error = Some(error);
        }

        self.kv.hset(&task_key(task_id), &fields).await?;
        debug!(task_id, status = ?update.status, progress = ?update.progress, "task updated");
        Ok(Some(task))
    }

    /// Cancel a task. Terminal tasks are returned unchanged; pending tasks
    /// are removed from the dispatch queue first so the worker never sees
    /// them.
    pub async fn cancel(&self, task_id: &str) -> StoreResult<Option<Task>> {
        let Some(task) = self.get(task_id).await? else {
            return Ok(None);
        };

        if task.status.is_terminal() {
            return Ok(Some(task));
        }

        self.kv.lrem(PENDING_QUEUE_KEY, task_id).await?;
        self.update(task_id, TaskUpdate::status(TaskStatus::Cancelled))
            .await
    }

    // ── Dispatch ─────────────────────────────────────────────────────────

    /// Pop the oldest pending task id.
    pub async fn next_pending(&self) -> StoreResult<Option<String>> {
        self.kv.lpop(PENDING_QUEUE_KEY).await
    }

    /// Push a task id back to the tail of the pending queue. Used when a
    /// per-type concurrency cap rejects a dequeued task.
    pub async fn requeue(&self, task_id: &str) -> StoreResult<()> {
        self.kv.rpush(PENDING_QUEUE_KEY, task_id).await
    }

    /// Queue statistics.
    pub async fn stats(&self) -> StoreResult<QueueStats> {
        Ok(QueueStats {
            pending: self.kv.llen(PENDING_QUEUE_KEY).await?,
            processing: self.kv.scard(PROCESSING_SET_KEY).await?,
        })
    }

    // ── History ──────────────────────────────────────────────────────────

    /// Newest-first task history for a user. Expired records are skipped.
    pub async fn user_tasks(&self, user_id: &str, limit: usize) -> StoreResult<Vec<Task>> {
        let ids = self
            .kv
            .lrange(&user_tasks_key(user_id), 0, limit as i64 - 1)
            .await?;

        let mut tasks = Vec::with_capacity(ids.len());
        for id in ids {
            if let Some(task) = self.get(&id).await? {
                tasks.push(task);
            }
        }
        Ok(tasks)
    }

    // ── Recovery ─────────────────────────────────────────────────────────

    /// Reclaim tasks stranded in the processing set by a crash.
    ///
    /// Non-terminal members are reset to pending (progress 0) and pushed to
    /// the tail of the dispatch queue; members whose records have expired
    /// are dropped from the set. Returns the number requeued.
    pub async fn recover_orphans(&self) -> StoreResult<u64> {
        let mut recovered = 0;

        for task_id in self.kv.smembers(PROCESSING_SET_KEY).await? {
            match self.get(&task_id).await? {
                Some(task) if !task.status.is_terminal() => {
                    warn!(task_id = %task_id, "recovering orphaned task");
                    self.kv
                        .hset(
                            &task_key(&task_id),
                            &[
                                ("status".into(), TaskStatus::Pending.to_string()),
                                ("progress".into(), "0".into()),
                                ("updated_at".into(), Utc::now().to_rfc3339()),
                            ],
                        )
                        .await?;
                    self.kv.srem(PROCESSING_SET_KEY, &task_id).await?;
                    self.kv.rpush(PENDING_QUEUE_KEY, &task_id).await?;
                    recovered += 1;
                }
                _ => {
                    // Terminal or expired: just drop the stale membership.
                    self.kv.srem(PROCESSING_SET_KEY, &task_id).await?;
                }
            }
        }

        if recovered > 0 {
            info!(recovered, "orphaned tasks returned to the pending queue");
        }
        Ok(recovered)
    }
}

// ── Serialisation ────────────────────────────────────────────────────────

fn serialize_task(task: &Task) -> Vec<(String, String)> {
    vec![
        ("id".into(), task.id.clone()),
        ("type".into(), task.task_type.to_string()),
        ("status".into(), task.status.to_string()),
        ("progress".into(), task.progress.to_string()),
        ("params".into(), task.params.to_string()),
        (
            "result".into(),
            task.result.as_ref().map(Value::to_string).unwrap_or_default(),
        ),
        ("error".into(), task.error.clone().unwrap_or_default()),
        ("created_at".into(), task.created_at.to_rfc3339()),
        ("updated_at".into(), task.updated_at.to_rfc3339()),
        ("user_id".into(), task.user_id.clone().unwrap_or_default()),
    ]
}

fn deserialize_task(fields: &HashMap<String, String>) -> StoreResult<Task> {
    let field = |name: &str| -> StoreResult<&String> {
        fields
            .get(name)
            .ok_or_else(|| StoreError::Serialization(format!("missing field '{name}'")))
    };

    let parse_time = |raw: &str| -> StoreResult<DateTime<Utc>> {
        DateTime::parse_from_rfc3339(raw)
            .map(|dt| dt.with_timezone(&Utc))
            .map_err(|e| StoreError::Serialization(format!("bad timestamp '{raw}': {e}")))
    };

    let task_type: TaskType = field("type")?
        .parse()
        .map_err(StoreError::Serialization)?;
    let status: TaskStatus = field("status")?
        .parse()
        .map_err(StoreError::Serialization)?;
    let progress: f32 = field("progress")?
        .parse()
        .map_err(|e| StoreError::Serialization(format!("bad progress: {e}")))?;

    let params = match fields.get("params").filter(|p| !p.is_empty()) {
        Some(raw) => serde_json::from_str(raw)
            .map_err(|e| StoreError::Serialization(format!("bad params: {e}")))?,
        None => Value::Object(Default::default()),
    };

    let result = match fields.get("result").filter(|r| !r.is_empty()) {
        Some(raw) => Some(
            serde_json::from_str(raw)
                .map_err(|e| StoreError::Serialization(format!("bad result: {e}")))?,
        ),
        None => None,
    };

    Ok(Task {
        id: field("id")?.clone(),
        task_type,
        status,
        progress,
        params,
        result,
        error: fields.get("error").filter(|e| !e.is_empty()).cloned(),
        created_at: parse_time(field("created_at")?)?,
        updated_at: parse_time(field("updated_at")?)?,
        user_id: fields.get("user_id").filter(|u| !u.is_empty()).cloned(),
    })
}

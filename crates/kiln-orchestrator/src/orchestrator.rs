//! The model orchestrator: exclusive owner of accelerator residency.
//!
//! All model acquisition in the process goes through this type. A single
//! admission mutex serialises every state change (load, unload, eviction);
//! read accessors never take it; the registry maps are only mutated under
//! the lock, so lock-free reads observe a consistent snapshot.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use kiln_core::{GpuStatus, ModelStatus, ModelType};
use serde::Serialize;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::adapter::{AdapterRegistry, ModelAdapter, ModelHandle};
use crate::error::OrchestratorResult;
use crate::probe::MemoryProbe;

/// An accelerator-resident model instance.
#[derive(Clone, Debug)]
pub struct LoadedModel {
    pub model_id: String,
    pub model_type: ModelType,
    /// Opaque handle consumed only by the matching adapter.
    pub instance: ModelHandle,
    /// Actual memory cost measured at load time; may differ from the
    /// admission estimate.
    pub memory_mb: u64,
    pub loaded_at: DateTime<Utc>,
    /// Monotonic twin of `loaded_at`, used for ordering.
    pub loaded_mono: Instant,
    /// Refreshed on every access; drives LRU eviction.
    pub last_used: Instant,
    /// Family-specific facts, e.g. the detected video family.
    pub metadata: HashMap<String, String>,
}

/// Operator-visible status of a model identifier. Outlives the resident
/// instance so that errors and transitional states stay observable.
#[derive(Debug, Clone, Serialize)]
pub struct ModelStatusEntry {
    pub model_type: ModelType,
    pub status: ModelStatus,
    pub error: Option<String>,
    pub loaded_at: Option<DateTime<Utc>>,
}

impl ModelStatusEntry {
    fn transitional(model_type: ModelType, status: ModelStatus) -> Self {
        Self {
            model_type,
            status,
            error: None,
            loaded_at: None,
        }
    }
}

/// Singleton-per-process registry of resident models. Constructed once by
/// the application and shared via `Arc`.
pub struct ModelOrchestrator {
    adapters: AdapterRegistry,
    probe: Arc<dyn MemoryProbe>,
    residents: DashMap<String, LoadedModel>,
    statuses: DashMap<String, ModelStatusEntry>,
    /// Serialises load, unload, and eviction.
    admission: Mutex<()>,
}

impl ModelOrchestrator {
    pub fn new(adapters: AdapterRegistry, probe: Arc<dyn MemoryProbe>) -> Self {
        info!("model orchestrator initialised");
        Self {
            adapters,
            probe,
            residents: DashMap::new(),
            statuses: DashMap::new(),
            admission: Mutex::new(()),
        }
    }

    // ── GPU status ───────────────────────────────────────────────────────

    /// Sample the memory probe.
    pub fn gpu_status(&self) -> GpuStatus {
        self.probe.gpu_status()
    }

    // ── Read accessors (lock-free) ───────────────────────────────────────

    /// Look up a resident model, refreshing its LRU timestamp.
    pub fn get(&self, model_id: &str) -> Option<LoadedModel> {
        self.residents.get_mut(model_id).map(|mut entry| {
            entry.last_used = Instant::now();
            entry.clone()
        })
    }

    /// First resident model of the given type, refreshing its timestamp.
    pub fn get_by_type(&self, model_type: ModelType) -> Option<LoadedModel> {
        let id = self
            .residents
            .iter()
            .find(|entry| entry.model_type == model_type)
            .map(|entry| entry.key().clone())?;
        self.get(&id)
    }

    /// Snapshot of all residents. Does not touch timestamps.
    pub fn list_loaded(&self) -> Vec<LoadedModel> {
        self.residents.iter().map(|entry| entry.clone()).collect()
    }

    pub fn is_loaded(&self, model_id: &str) -> bool {
        self.residents.contains_key(model_id)
    }

    /// Operator-visible status for one identifier.
    pub fn status(&self, model_id: &str) -> Option<ModelStatusEntry> {
        self.statuses.get(model_id).map(|entry| entry.clone())
    }

    /// All tracked statuses, including errored and transitional entries.
    pub fn all_statuses(&self) -> HashMap<String, ModelStatusEntry> {
        self.statuses
            .iter()
            .map(|entry| (entry.key().clone(), entry.clone()))
            .collect()
    }

    /// The adapter registered for a model type. Handlers use this to run
    /// generation against a resident instance; loading still goes through
    /// [`ModelOrchestrator::ensure_loaded`].
    pub fn adapter(&self, model_type: ModelType) -> OrchestratorResult<Arc<dyn ModelAdapter>> {
        self.adapters.get(model_type)
    }

    // ── Load / unload ────────────────────────────────────────────────────

    /// Ensure a model is resident, loading it if necessary.
    ///
    /// This is the entry point for task handlers and routes: the fast path
    /// touches and returns without taking the admission lock.
    pub async fn ensure_loaded(
        &self,
        model_id: &str,
        model_type: ModelType,
    ) -> OrchestratorResult<LoadedModel> {
        if let Some(model) = self.get(model_id) {
            return Ok(model);
        }
        self.load(model_id, model_type, false).await
    }

    /// Load a model, evicting least-recently-used residents if the
    /// admission estimate does not fit in free memory.
    ///
    /// If the model is already resident and `force` is false this touches
    /// and returns it; with `force` the old instance is unloaded first.
    pub async fn load(
        &self,
        model_id: &str,
        model_type: ModelType,
        force: bool,
    ) -> OrchestratorResult<LoadedModel> {
        let _guard = self.admission.lock().await;

        if self.residents.contains_key(model_id) {
            if !force {
                info!(model_id, "model already loaded");
                // Resident entries are only removed under the admission
                // lock, which we hold.
                if let Some(model) = self.get(model_id) {
                    return Ok(model);
                }
            }
            self.unload_locked(model_id).await?;
        }

        self.statuses.insert(
            model_id.to_string(),
            ModelStatusEntry::transitional(model_type, ModelStatus::Loading),
        );

        let adapter = match self.adapters.get(model_type) {
            Ok(adapter) => adapter,
            Err(e) => {
                self.record_error(model_id, model_type, &e.to_string());
                return Err(e);
            }
        };

        let estimate = adapter.estimate_memory_mb(model_id);
        self.ensure_memory_locked(estimate, Some(model_id)).await;

        match adapter.load(model_id).await {
            Ok(output) => {
                let now = Instant::now();
                let loaded_at = Utc::now();
                let model = LoadedModel {
                    model_id: model_id.to_string(),
                    model_type,
                    instance: output.instance,
                    memory_mb: output.memory_mb,
                    loaded_at,
                    loaded_mono: now,
                    last_used: now,
                    metadata: output.metadata,
                };
                self.residents.insert(model_id.to_string(), model.clone());
                self.statuses.insert(
                    model_id.to_string(),
                    ModelStatusEntry {
                        model_type,
                        status: ModelStatus::Loaded,
                        error: None,
                        loaded_at: Some(loaded_at),
                    },
                );
                info!(model_id, memory_mb = output.memory_mb, "model loaded");
                Ok(model)
            }
            Err(e) => {
                let message = e.to_string();
                warn!(model_id, error = %message, "model load failed");
                self.record_error(model_id, model_type, &message);
                Err(e.into())
            }
        }
    }

    /// Unload a model and report freed memory in MB.
    ///
    /// Idempotent: unloading a non-resident id warns and returns 0.
    pub async fn unload(&self, model_id: &str) -> OrchestratorResult<u64> {
        let _guard = self.admission.lock().await;
        self.unload_locked(model_id).await
    }

    /// Unload every resident model. Used at shutdown; failures are logged
    /// and the sweep continues.
    pub async fn unload_all(&self) {
        let _guard = self.admission.lock().await;
        let ids: Vec<String> = self.residents.iter().map(|e| e.key().clone()).collect();
        for id in ids {
            if let Err(e) = self.unload_locked(&id).await {
                warn!(model_id = %id, error = %e, "unload during shutdown failed");
            }
        }
    }

    /// Unload without re-entering the admission lock. Callers must hold it.
    async fn unload_locked(&self, model_id: &str) -> OrchestratorResult<u64> {
        let Some(model) = self.residents.get(model_id).map(|entry| entry.clone()) else {
            warn!(model_id, "model is not loaded");
            return Ok(0);
        };

        self.statuses.insert(
            model_id.to_string(),
            ModelStatusEntry::transitional(model.model_type, ModelStatus::Unloading),
        );

        let adapter = self.adapters.get(model.model_type)?;
        match adapter.unload(model.instance.clone()).await {
            Ok(freed_mb) => {
                self.residents.remove(model_id);
                self.statuses.insert(
                    model_id.to_string(),
                    ModelStatusEntry::transitional(model.model_type, ModelStatus::NotLoaded),
                );
                info!(model_id, freed_mb, "model unloaded");
                Ok(freed_mb)
            }
            Err(e) => {
                let message = e.to_string();
                warn!(model_id, error = %message, "model unload failed");
                self.record_error(model_id, model.model_type, &message);
                Err(e.into())
            }
        }
    }

    // ── Memory management ────────────────────────────────────────────────

    /// Free memory for an incoming load by evicting residents in LRU order.
    ///
    /// Walks candidates ascending by `last_used`, re-sampling the probe
    /// after each unload. If every candidate is gone and memory is still
    /// short, logs a warning and returns anyway: estimates are
    /// conservative, and the load will fail naturally in the adapter if
    /// memory truly does not suffice.
    async fn ensure_memory_locked(&self, required_mb: u64, exclude: Option<&str>) {
        let mut gpu = self.probe.gpu_status();
        if gpu.free_mb >= required_mb {
            debug!(
                free_mb = gpu.free_mb,
                required_mb, "memory available, no eviction needed"
            );
            return;
        }

        info!(
            free_mb = gpu.free_mb,
            required_mb, "insufficient free memory, evicting LRU residents"
        );

        let mut candidates: Vec<(String, Instant)> = self
            .residents
            .iter()
            .filter(|entry| Some(entry.model_id.as_str()) != exclude)
            .map(|entry| (entry.model_id.clone(), entry.last_used))
            .collect();
        candidates.sort_by_key(|(_, last_used)| *last_used);

        for (candidate, _) in candidates {
            if gpu.free_mb >= required_mb {
                break;
            }
            info!(model_id = %candidate, "evicting least-recently-used model");
            if let Err(e) = self.unload_locked(&candidate).await {
                warn!(model_id = %candidate, error = %e, "eviction unload failed, skipping");
                continue;
            }
            gpu = self.probe.gpu_status();
        }

        if gpu.free_mb < required_mb {
            warn!(
                free_mb = gpu.free_mb,
                required_mb, "could not free enough memory; proceeding with load"
            );
        }
    }

    fn record_error(&self, model_id: &str, model_type: ModelType, message: &str) {
        self.statuses.insert(
            model_id.to_string(),
            ModelStatusEntry {
                model_type,
                status: ModelStatus::Error,
                error: Some(message.to_string()),
                loaded_at: None,
            },
        );
    }
}

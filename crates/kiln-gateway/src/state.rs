//! Shared application state.

use std::sync::Arc;

use kiln_core::KilnConfig;
use kiln_orchestrator::ModelOrchestrator;
use kiln_orchestrator::adapter::LlmAdapter;
use kiln_queue::TaskStore;
use kiln_worker::HandlerRegistry;

/// State injected into every handler via the axum [`State`] extractor.
///
/// [`State`]: axum::extract::State
#[derive(Clone)]
pub struct AppState {
    /// Sole owner of accelerator residency.
    pub orchestrator: Arc<ModelOrchestrator>,
    /// Durable task store.
    pub tasks: Arc<TaskStore>,
    /// Task handlers, shared with the worker; the synchronous media routes
    /// run them inline.
    pub handlers: Arc<HandlerRegistry>,
    /// Concrete LLM adapter for streaming chat.
    pub llm: Arc<LlmAdapter>,
    pub config: Arc<KilnConfig>,
}

//! Model orchestration for a single shared accelerator.
//!
//! The [`ModelOrchestrator`] is the exclusive gatekeeper for GPU residency:
//! every model load and unload in the process goes through it. It tracks
//! resident instances, estimates memory cost through the per-family
//! [`adapter::ModelAdapter`]s, and evicts least-recently-used residents to
//! admit new loads. A [`probe::MemoryProbe`] supplies the device-global
//! memory view used for admission decisions.

pub mod adapter;
pub mod error;
pub mod orchestrator;
pub mod probe;

pub use adapter::{
    AdapterRegistry, GenerateOutput, GenerateRequest, LoadOutput, ModelAdapter, ModelHandle,
};
pub use error::{AdapterError, OrchestratorError};
pub use orchestrator::{LoadedModel, ModelOrchestrator, ModelStatusEntry};
pub use probe::{MemoryProbe, StaticProbe};

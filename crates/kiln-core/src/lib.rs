//! Core domain types shared by every Kiln crate.
//!
//! Nothing in here talks to the GPU, Redis, or the network; this crate
//! defines the vocabulary (model and task types, statuses, typed task
//! parameters) and the environment-driven configuration that the
//! orchestrator, queue, worker, and gateway build on.

pub mod config;
pub mod model;
pub mod task;

pub use config::KilnConfig;
pub use model::{GpuStatus, ModelStatus, ModelType, VideoFamily};
pub use task::{
    ChatMessage, Image2ImageTaskParams, ImageTaskParams, LlmCompareTaskParams, Task, TaskStatus,
    TaskType, VideoTaskParams,
};

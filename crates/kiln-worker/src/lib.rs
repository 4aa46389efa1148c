//! Background task processing.
//!
//! The [`Worker`] polls the task store, enforces per-type concurrency caps,
//! and launches [`handlers::TaskHandler`]s as independent tasks on the
//! runtime. Handlers translate task parameters into adapter calls through
//! the orchestrator and report progress back into the store.

pub mod error;
pub mod handlers;
pub mod worker;

pub use error::HandlerError;
pub use handlers::{HandlerRegistry, TaskHandler};
pub use worker::{Worker, WorkerConfig, concurrency_limits};

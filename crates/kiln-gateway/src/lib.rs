//! Axum HTTP surface for the Kiln inference gateway.
//!
//! Thin translation of requests into orchestrator and task-store calls:
//! validation and JSON shaping live here, all policy (residency, eviction,
//! queueing, caps) lives in the crates underneath.

pub mod backends;
pub mod error;
pub mod routes;
pub mod server;
pub mod state;

pub use error::{GatewayError, GatewayResult};
pub use server::build_router;
pub use state::AppState;

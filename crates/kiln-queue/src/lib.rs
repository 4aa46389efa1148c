//! Durable task lifecycle over an external key-value store.
//!
//! The [`TaskStore`] persists task records, the FIFO pending queue, the
//! in-flight processing set, and bounded per-user history. Storage goes
//! through the [`kv::KvStore`] contract: Redis in production
//! ([`kv::RedisKv`]), an in-memory implementation ([`kv::MemoryKv`]) for
//! tests.

pub mod kv;
pub mod store;

pub use kv::{KvStore, MemoryKv, RedisKv, StoreError, StoreResult};
pub use store::{QueueStats, TaskStore, TaskUpdate};

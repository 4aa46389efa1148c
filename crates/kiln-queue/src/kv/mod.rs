//! Key-value storage contract.
//!
//! The queue needs a small slice of Redis: hashes for task records, lists
//! for the pending queue and user history, sets for the processing set,
//! and per-key TTLs. This trait captures exactly that slice so the store
//! logic stays backend-agnostic and testable.

pub mod memory;
pub mod redis;

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

pub use self::memory::MemoryKv;
pub use self::redis::RedisKv;

/// Storage-layer errors.
#[derive(Debug, Error)]
pub enum StoreError {
    /// Could not reach the backend.
    #[error("connection error: {0}")]
    Connection(String),

    /// The backend rejected or failed an operation.
    #[error("backend error: {0}")]
    Backend(String),

    /// A persisted record could not be decoded.
    #[error("serialization error: {0}")]
    Serialization(String),
}

pub type StoreResult<T> = Result<T, StoreError>;

/// The key-value operations the task store relies on.
///
/// Every method maps onto one atomic backend command; values are decoded
/// strings, with serialisation handled at the application layer.
#[async_trait]
pub trait KvStore: Send + Sync {
    /// Set fields on a hash, creating it if absent.
    async fn hset(&self, key: &str, fields: &[(String, String)]) -> StoreResult<()>;

    /// All fields of a hash; empty map when the key is missing.
    async fn hgetall(&self, key: &str) -> StoreResult<HashMap<String, String>>;

    /// Append to the tail of a list.
    async fn rpush(&self, key: &str, value: &str) -> StoreResult<()>;

    /// Prepend to the head of a list.
    async fn lpush(&self, key: &str, value: &str) -> StoreResult<()>;

    /// Pop from the head of a list.
    async fn lpop(&self, key: &str) -> StoreResult<Option<String>>;

    /// Remove every occurrence of `value`; returns the number removed.
    async fn lrem(&self, key: &str, value: &str) -> StoreResult<u64>;

    /// Inclusive range of a list (negative indices count from the tail).
    async fn lrange(&self, key: &str, start: i64, stop: i64) -> StoreResult<Vec<String>>;

    /// Trim a list to the inclusive range.
    async fn ltrim(&self, key: &str, start: i64, stop: i64) -> StoreResult<()>;

    /// Length of a list.
    async fn llen(&self, key: &str) -> StoreResult<u64>;

    /// Add to a set.
    async fn sadd(&self, key: &str, member: &str) -> StoreResult<()>;

    /// Remove from a set.
    async fn srem(&self, key: &str, member: &str) -> StoreResult<()>;

    /// Cardinality of a set.
    async fn scard(&self, key: &str) -> StoreResult<u64>;

    /// All members of a set.
    async fn smembers(&self, key: &str) -> StoreResult<Vec<String>>;

    /// Set a key's time-to-live.
    async fn expire(&self, key: &str, ttl: Duration) -> StoreResult<()>;
}

//! Redis key-value backend.
//!
//! Wraps a [`redis::aio::ConnectionManager`], which multiplexes one
//! connection and transparently reconnects. Each trait method maps onto a
//! single Redis command, so the store-level atomicity guarantees are
//! Redis's own.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use redis::AsyncCommands;
use redis::aio::ConnectionManager;
use tracing::info;

use super::{KvStore, StoreError, StoreResult};

/// A [`KvStore`] backed by Redis.
#[derive(Clone)]
pub struct RedisKv {
    manager: ConnectionManager,
}

impl RedisKv {
    /// Connect to the given Redis URL.
    pub async fn connect(url: &str) -> StoreResult<Self> {
        let client =
            redis::Client::open(url).map_err(|e| StoreError::Connection(e.to_string()))?;
        let manager = client
            .get_connection_manager()
            .await
            .map_err(|e| StoreError::Connection(e.to_string()))?;
        info!(url, "connected to redis");
        Ok(Self { manager })
    }

    fn conn(&self) -> ConnectionManager {
        self.manager.clone()
    }
}

fn backend(e: redis::RedisError) -> StoreError {
    StoreError::Backend(e.to_string())
}

#[async_trait]
impl KvStore for RedisKv {
    async fn hset(&self, key: &str, fields: &[(String, String)]) -> StoreResult<()> {
        let mut conn = self.conn();
        conn.hset_multiple::<_, _, _, ()>(key, fields)
            .await
            .map_err(backend)
    }

    async fn hgetall(&self, key: &str) -> StoreResult<HashMap<String, String>> {
        let mut conn = self.conn();
        conn.hgetall(key).await.map_err(backend)
    }

    async fn rpush(&self, key: &str, value: &str) -> StoreResult<()> {
        let mut conn = self.conn();
        conn.rpush::<_, _, ()>(key, value).await.map_err(backend)
    }

    async fn lpush(&self, key: &str, value: &str) -> StoreResult<()> {
        let mut conn = self.conn();
        conn.lpush::<_, _, ()>(key, value).await.map_err(backend)
    }

    async fn lpop(&self, key: &str) -> StoreResult<Option<String>> {
        let mut conn = self.conn();
        conn.lpop(key, None).await.map_err(backend)
    }

    async fn lrem(&self, key: &str, value: &str) -> StoreResult<u64> {
        let mut conn = self.conn();
        // count 0 removes every occurrence.
        let removed: i64 = conn.lrem(key, 0, value).await.map_err(backend)?;
        Ok(removed.max(0) as u64)
    }

    async fn lrange(&self, key: &str, start: i64, stop: i64) -> StoreResult<Vec<String>> {
        let mut conn = self.conn();
        conn.lrange(key, start as isize, stop as isize)
            .await
            .map_err(backend)
    }

    async fn ltrim(&self, key: &str, start: i64, stop: i64) -> StoreResult<()> {
        let mut conn = self.conn();
        conn.ltrim::<_, ()>(key, start as isize, stop as isize)
            .await
            .map_err(backend)
    }

    async fn llen(&self, key: &str) -> StoreResult<u64> {
        let mut conn = self.conn();
        conn.llen(key).await.map_err(backend)
    }

    async fn sadd(&self, key: &str, member: &str) -> StoreResult<()> {
        let mut conn = self.conn();
        conn.sadd::<_, _, ()>(key, member).await.map_err(backend)
    }

    async fn srem(&self, key: &str, member: &str) -> StoreResult<()> {
        let mut conn = self.conn();
        conn.srem::<_, _, ()>(key, member).await.map_err(backend)
    }

    async fn scard(&self, key: &str) -> StoreResult<u64> {
        let mut conn = self.conn();
        conn.scard(key).await.map_err(backend)
    }

    async fn smembers(&self, key: &str) -> StoreResult<Vec<String>> {
        let mut conn = self.conn();
        conn.smembers(key).await.map_err(backend)
    }

    async fn expire(&self, key: &str, ttl: Duration) -> StoreResult<()> {
        let mut conn = self.conn();
        conn.expire::<_, ()>(key, ttl.as_secs() as i64)
            .await
            .map_err(backend)
    }
}

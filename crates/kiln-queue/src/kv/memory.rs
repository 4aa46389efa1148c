//! In-memory key-value backend.
//!
//! Mirrors the Redis semantics the task store depends on, including TTL
//! expiry (deadlines checked on access). Used by the test suite; not a
//! production backend.

use std::collections::{HashMap, HashSet, VecDeque};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use parking_lot::Mutex;

use super::{KvStore, StoreError, StoreResult};

enum Value {
    Hash(HashMap<String, String>),
    List(VecDeque<String>),
    Set(HashSet<String>),
}

struct Entry {
    value: Value,
    expires_at: Option<Instant>,
}

impl Entry {
    fn new(value: Value) -> Self {
        Self {
            value,
            expires_at: None,
        }
    }

    fn expired(&self) -> bool {
        self.expires_at
            .is_some_and(|deadline| Instant::now() >= deadline)
    }
}

/// An in-memory [`KvStore`].
#[derive(Default)]
pub struct MemoryKv {
    entries: Mutex<HashMap<String, Entry>>,
}

/// Drop the entry if its deadline has passed.
fn purge_expired(entries: &mut HashMap<String, Entry>, key: &str) {
    if entries.get(key).is_some_and(Entry::expired) {
        entries.remove(key);
    }
}

fn wrong_type(key: &str) -> StoreError {
    StoreError::Backend(format!("wrong value type at key '{key}'"))
}

impl MemoryKv {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fetch-or-create an entry of the given shape, honouring expiry.
    fn with_entry<T>(
        &self,
        key: &str,
        make: fn() -> Value,
        f: impl FnOnce(&mut Value) -> StoreResult<T>,
    ) -> StoreResult<T> {
        let mut entries = self.entries.lock();
        purge_expired(&mut entries, key);
        let entry = entries
            .entry(key.to_string())
            .or_insert_with(|| Entry::new(make()));
        f(&mut entry.value)
    }

    /// Run `f` on an existing live entry; `missing` supplies the result
    /// when the key is absent or expired.
    fn with_existing<T>(
        &self,
        key: &str,
        missing: impl FnOnce() -> StoreResult<T>,
        f: impl FnOnce(&mut Value) -> StoreResult<T>,
    ) -> StoreResult<T> {
        let mut entries = self.entries.lock();
        purge_expired(&mut entries, key);
        match entries.get_mut(key) {
            Some(entry) => f(&mut entry.value),
            None => missing(),
        }
    }
}

#[async_trait]
impl KvStore for MemoryKv {
    async fn hset(&self, key: &str, fields: &[(String, String)]) -> StoreResult<()> {
        self.with_entry(key, || Value::Hash(HashMap::new()), |value| match value {
            Value::Hash(hash) => {
                for (field, v) in fields {
                    hash.insert(field.clone(), v.clone());
                }
                Ok(())
            }
            _ => Err(wrong_type(key)),
        })
    }

    async fn hgetall(&self, key: &str) -> StoreResult<HashMap<String, String>> {
        self.with_existing(key, || Ok(HashMap::new()), |value| match value {
            Value::Hash(hash) => Ok(hash.clone()),
            _ => Err(wrong_type(key)),
        })
    }

    async fn rpush(&self, key: &str, item: &str) -> StoreResult<()> {
        self.with_entry(key, || Value::List(VecDeque::new()), |value| match value {
            Value::List(list) => {
                list.push_back(item.to_string());
                Ok(())
            }
            _ => Err(wrong_type(key)),
        })
    }

    async fn lpush(&self, key: &str, item: &str) -> StoreResult<()> {
        self.with_entry(key, || Value::List(VecDeque::new()), |value| match value {
            Value::List(list) => {
                list.push_front(item.to_string());
                Ok(())
            }
            _ => Err(wrong_type(key)),
        })
    }

    async fn lpop(&self, key: &str) -> StoreResult<Option<String>> {
        self.with_existing(key, || Ok(None), |value| match value {
            Value::List(list) => Ok(list.pop_front()),
            _ => Err(wrong_type(key)),
        })
    }

    async fn lrem(&self, key: &str, item: &str) -> StoreResult<u64> {
        self.with_existing(key, || Ok(0), |value| match value {
            Value::List(list) => {
                let before = list.len();
                list.retain(|v| v != item);
                Ok((before - list.len()) as u64)
            }
            _ => Err(wrong_type(key)),
        })
    }

    async fn lrange(&self, key: &str, start: i64, stop: i64) -> StoreResult<Vec<String>> {
        self.with_existing(key, || Ok(Vec::new()), |value| match value {
            Value::List(list) => Ok(range_of(list, start, stop)),
            _ => Err(wrong_type(key)),
        })
    }

    async fn ltrim(&self, key: &str, start: i64, stop: i64) -> StoreResult<()> {
        self.with_existing(key, || Ok(()), |value| match value {
            Value::List(list) => {
                *list = range_of(list, start, stop).into();
                Ok(())
            }
            _ => Err(wrong_type(key)),
        })
    }

    async fn llen(&self, key: &str) -> StoreResult<u64> {
        self.with_existing(key, || Ok(0), |value| match value {
            Value::List(list) => Ok(list.len() as u64),
            _ => Err(wrong_type(key)),
        })
    }

    async fn sadd(&self, key: &str, member: &str) -> StoreResult<()> {
        self.with_entry(key, || Value::Set(HashSet::new()), |value| match value {
            Value::Set(set) => {
                set.insert(member.to_string());
                Ok(())
            }
            _ => Err(wrong_type(key)),
        })
    }

    async fn srem(&self, key: &str, member: &str) -> StoreResult<()> {
        self.with_existing(key, || Ok(()), |value| match value {
            Value::Set(set) => {
                set.remove(member);
                Ok(())
            }
            _ => Err(wrong_type(key)),
        })
    }

    async fn scard(&self, key: &str) -> StoreResult<u64> {
        self.with_existing(key, || Ok(0), |value| match value {
            Value::Set(set) => Ok(set.len() as u64),
            _ => Err(wrong_type(key)),
        })
    }

    async fn smembers(&self, key: &str) -> StoreResult<Vec<String>> {
        self.with_existing(key, || Ok(Vec::new()), |value| match value {
            Value::Set(set) => Ok(set.iter().cloned().collect()),
            _ => Err(wrong_type(key)),
        })
    }

    async fn expire(&self, key: &str, ttl: Duration) -> StoreResult<()> {
        let mut entries = self.entries.lock();
        purge_expired(&mut entries, key);
        if let Some(entry) = entries.get_mut(key) {
            entry.expires_at = Some(Instant::now() + ttl);
        }
        Ok(())
    }
}

/// Redis-style inclusive range with negative-index support.
fn range_of(list: &VecDeque<String>, start: i64, stop: i64) -> Vec<String> {
    let len = list.len() as i64;
    let resolve = |idx: i64| if idx < 0 { len + idx } else { idx };

    let start = resolve(start).max(0);
    let stop = resolve(stop).min(len - 1);
    if start > stop || start >= len {
        return Vec::new();
    }

    list.iter()
        .skip(start as usize)
        .take((stop - start + 1) as usize)
        .cloned()
        .collect()
}

//! KV + stream interface consumed by the core (spec.md §6).
//!
//! The real deployment backend is Redis; this crate defines the trait the
//! core depends on and ships an in-process implementation (DashMap-backed,
//! matching the `DashMap` usage already found in the teacher's gateway
//! `AppState`) suitable for tests and single-node deployments.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use dashmap::DashMap;

use crate::error::Result;

/// Locks, counters, pending queues and idempotency leases (spec.md §5).
#[async_trait]
pub trait KvStore: Send + Sync {
    /// Atomically create `key` with `value` if absent, with a TTL. Returns
    /// `true` if this call created the key (i.e. the caller won the race).
    async fn set_if_absent(&self, key: &str, value: &str, ttl: Duration) -> Result<bool>;

    async fn get(&self, key: &str) -> Result<Option<String>>;

    async fn del(&self, key: &str) -> Result<()>;

    /// Refresh the TTL of an existing key without changing its value.
    async fn expire(&self, key: &str, ttl: Duration) -> Result<()>;

    async fn rpush(&self, key: &str, value: &str, ttl: Duration) -> Result<()>;

    async fn lpop(&self, key: &str) -> Result<Option<String>>;

    async fn llen(&self, key: &str) -> Result<usize>;
}

enum Entry {
    Scalar { value: String, expires_at: Option<Instant> },
    List { values: VecDeque<String>, expires_at: Option<Instant> },
}

impl Entry {
    fn is_expired(&self) -> bool {
        let exp = match self {
            Entry::Scalar { expires_at, .. } => expires_at,
            Entry::List { expires_at, .. } => expires_at,
        };
        exp.is_some_and(|at| Instant::now() >= at)
    }
}

/// Default KV backend: process-local, DashMap-backed.
///
/// Horizontal sharding by bot identity (spec.md §9) is compatible with this
/// trait — a Redis-backed implementation is a drop-in replacement that does
/// not change `AIEngine` or `AutomationSweeper` call sites.
#[derive(Default)]
pub struct InMemoryKv {
    entries: DashMap<String, Entry>,
}

impl InMemoryKv {
    pub fn new() -> Self {
        Self::default()
    }

    fn evict_if_expired(&self, key: &str) {
        let expired = self.entries.get(key).is_some_and(|e| e.is_expired());
        if expired {
            self.entries.remove(key);
        }
    }
}

#[async_trait]
impl KvStore for InMemoryKv {
    async fn set_if_absent(&self, key: &str, value: &str, ttl: Duration) -> Result<bool> {
        self.evict_if_expired(key);
        let expires_at = Some(Instant::now() + ttl);
        match self.entries.entry(key.to_string()) {
            dashmap::mapref::entry::Entry::Occupied(_) => Ok(false),
            dashmap::mapref::entry::Entry::Vacant(v) => {
                v.insert(Entry::Scalar {
                    value: value.to_string(),
                    expires_at,
                });
                Ok(true)
            }
        }
    }

    async fn get(&self, key: &str) -> Result<Option<String>> {
        self.evict_if_expired(key);
        Ok(self.entries.get(key).and_then(|e| match e.value() {
            Entry::Scalar { value, .. } => Some(value.clone()),
            Entry::List { .. } => None,
        }))
    }

    async fn del(&self, key: &str) -> Result<()> {
        self.entries.remove(key);
        Ok(())
    }

    async fn expire(&self, key: &str, ttl: Duration) -> Result<()> {
        if let Some(mut e) = self.entries.get_mut(key) {
            let new_expiry = Some(Instant::now() + ttl);
            match e.value_mut() {
                Entry::Scalar { expires_at, .. } => *expires_at = new_expiry,
                Entry::List { expires_at, .. } => *expires_at = new_expiry,
            }
        }
        Ok(())
    }

    async fn rpush(&self, key: &str, value: &str, ttl: Duration) -> Result<()> {
        self.evict_if_expired(key);
        let mut entry = self
            .entries
            .entry(key.to_string())
            .or_insert_with(|| Entry::List {
                values: VecDeque::new(),
                expires_at: Some(Instant::now() + ttl),
            });
        match entry.value_mut() {
            Entry::List { values, expires_at } => {
                values.push_back(value.to_string());
                *expires_at = Some(Instant::now() + ttl);
            }
            Entry::Scalar { .. } => {
                *entry.value_mut() = Entry::List {
                    values: VecDeque::from([value.to_string()]),
                    expires_at: Some(Instant::now() + ttl),
                };
            }
        }
        Ok(())
    }

    async fn lpop(&self, key: &str) -> Result<Option<String>> {
        self.evict_if_expired(key);
        let mut remove_after = false;
        let popped = self.entries.get_mut(key).and_then(|mut e| match e.value_mut() {
            Entry::List { values, .. } => {
                let v = values.pop_front();
                remove_after = values.is_empty();
                v
            }
            Entry::Scalar { .. } => None,
        });
        if remove_after {
            self.entries.remove(key);
        }
        Ok(popped)
    }

    async fn llen(&self, key: &str) -> Result<usize> {
        self.evict_if_expired(key);
        Ok(self
            .entries
            .get(key)
            .map(|e| match e.value() {
                Entry::List { values, .. } => values.len(),
                Entry::Scalar { .. } => 0,
            })
            .unwrap_or(0))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn set_if_absent_only_one_winner() {
        let kv = InMemoryKv::new();
        assert!(kv.set_if_absent("lock:s1", "holder-a", Duration::from_secs(60)).await.unwrap());
        assert!(!kv.set_if_absent("lock:s1", "holder-b", Duration::from_secs(60)).await.unwrap());
    }

    #[tokio::test]
    async fn expired_lock_can_be_reacquired() {
        let kv = InMemoryKv::new();
        assert!(kv.set_if_absent("lock:s1", "a", Duration::from_millis(10)).await.unwrap());
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert!(kv.set_if_absent("lock:s1", "b", Duration::from_secs(60)).await.unwrap());
    }

    #[tokio::test]
    async fn pending_queue_fifo() {
        let kv = InMemoryKv::new();
        kv.rpush("pending:s1", "e1", Duration::from_secs(90)).await.unwrap();
        kv.rpush("pending:s1", "e2", Duration::from_secs(90)).await.unwrap();
        assert_eq!(kv.lpop("pending:s1").await.unwrap(), Some("e1".to_string()));
        assert_eq!(kv.lpop("pending:s1").await.unwrap(), Some("e2".to_string()));
        assert_eq!(kv.lpop("pending:s1").await.unwrap(), None);
    }
}

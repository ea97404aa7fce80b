//! In-process expiring key store.
//!
//! Same semantics as the Redis adapter (`SET NX EX`, `SET EX`, `EXISTS`,
//! compare-and-delete) for a single process. Expiry follows the tokio clock so tests can
//! drive it with a paused runtime.

use crate::backend::{KeyValueStore, StoreError};
use async_trait::async_trait;
use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;

#[derive(Debug)]
struct Entry {
    value: String,
    deadline: Instant,
}

impl Entry {
    fn live(&self, now: Instant) -> bool {
        self.deadline > now
    }
}

#[derive(Debug, Default)]
pub struct MemoryKeyStore {
    entries: Mutex<HashMap<String, Entry>>,
}

impl MemoryKeyStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of live (unexpired) keys.
    pub async fn len(&self) -> usize {
        let now = Instant::now();
        let entries = self.entries.lock().await;
        entries.values().filter(|entry| entry.live(now)).count()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

#[async_trait]
impl KeyValueStore for MemoryKeyStore {
    async fn set_if_absent(&self, key: &str, value: &str, ttl: Duration) -> Result<bool, StoreError> {
        let now = Instant::now();
        let mut entries = self.entries.lock().await;
        entries.retain(|_, entry| entry.live(now));

        if entries.contains_key(key) {
            return Ok(false);
        }
        entries.insert(
            key.to_string(),
            Entry {
                value: value.to_string(),
                deadline: now + ttl,
            },
        );
        Ok(true)
    }

    async fn set_with_expiry(&self, key: &str, ttl: Duration) -> Result<(), StoreError> {
        let mut entries = self.entries.lock().await;
        entries.insert(
            key.to_string(),
            Entry {
                value: "1".to_string(),
                deadline: Instant::now() + ttl,
            },
        );
        Ok(())
    }

    async fn exists(&self, key: &str) -> Result<bool, StoreError> {
        let entries = self.entries.lock().await;
        Ok(entries.get(key).is_some_and(|entry| entry.live(Instant::now())))
    }

    async fn delete_if_value(&self, key: &str, value: &str) -> Result<bool, StoreError> {
        let now = Instant::now();
        let mut entries = self.entries.lock().await;
        match entries.get(key) {
            Some(entry) if entry.live(now) && entry.value == value => {
                entries.remove(key);
                Ok(true)
            }
            _ => Ok(false),
        }
    }
}

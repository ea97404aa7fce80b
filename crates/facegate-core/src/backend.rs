//! Seams to the external collaborators: key-value store, relational store
//! and the pub/sub transport.
//!
//! Each is injected into the pipeline as a trait object so handlers can be
//! exercised without a live broker, Redis or database.

use crate::types::{AuditRecord, IdentityRecord};
use async_trait::async_trait;
use std::future::Future;
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("backend error: {0}")]
    Backend(String),
    #[error("operation timed out after {0:?}")]
    Timeout(Duration),
}

impl From<tokio_rusqlite::Error> for StoreError {
    fn from(e: tokio_rusqlite::Error) -> Self {
        Self::Backend(e.to_string())
    }
}

#[derive(Error, Debug)]
pub enum PublishError {
    #[error("publish failed: {0}")]
    Transport(String),
    #[error("command encoding failed: {0}")]
    Encode(#[from] serde_json::Error),
    #[error("publish timed out after {0:?}")]
    Timeout(Duration),
}

/// Expiring keys with atomic create-if-absent. Backed by Redis in production.
#[async_trait]
pub trait KeyValueStore: Send + Sync {
    /// Create `key` holding `value` with the given expiry, only if it does
    /// not exist. Returns `true` when this call created the key.
    async fn set_if_absent(&self, key: &str, value: &str, ttl: Duration) -> Result<bool, StoreError>;

    /// Create or overwrite `key` with the given expiry.
    async fn set_with_expiry(&self, key: &str, ttl: Duration) -> Result<(), StoreError>;

    async fn exists(&self, key: &str) -> Result<bool, StoreError>;

    /// Delete `key` only while it still holds `value`, atomically.
    /// Returns `true` when this call deleted it.
    async fn delete_if_value(&self, key: &str, value: &str) -> Result<bool, StoreError>;
}

/// Store of auto-registered persons.
#[async_trait]
pub trait IdentityStore: Send + Sync {
    async fn insert_identity(&self, record: &IdentityRecord) -> Result<(), StoreError>;

    /// Undo an insert whose outcome is unknown. Must be ordered after any
    /// insert for the same id that was already submitted. Returns `true`
    /// when a row was removed.
    async fn remove_identity(&self, short_id: &str) -> Result<bool, StoreError>;
}

/// Append-only audit log of face events.
#[async_trait]
pub trait AuditSink: Send + Sync {
    async fn append_event(&self, record: &AuditRecord) -> Result<(), StoreError>;
}

/// Outbound half of the pub/sub transport.
#[async_trait]
pub trait Publisher: Send + Sync {
    async fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<(), PublishError>;
}

/// Run a store operation with an upper bound on its duration.
pub(crate) async fn bounded<T, F>(limit: Duration, fut: F) -> Result<T, StoreError>
where
    F: Future<Output = Result<T, StoreError>>,
{
    tokio::time::timeout(limit, fut)
        .await
        .unwrap_or(Err(StoreError::Timeout(limit)))
}

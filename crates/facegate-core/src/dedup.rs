//! Duplicate suppression for unrecognized faces.
//!
//! Two keys per image content hash:
//!
//! - `snap_lock:<hash>`: short-lived mutex (`SET NX EX`), held across one
//!   admission + registration. Expires on its own if the holder dies.
//! - `snap_cooldown:<hash>`: set only after a complete registration; while
//!   present, every further attempt for the same content is suppressed.
//!
//! The lock is taken *before* the cooldown check so two concurrent handlers
//! for the same content cannot both observe "no cooldown" and both register.
//!
//! Each lock holds a random token and is only deleted while it still holds
//! that token, so a holder whose lock expired cannot release its successor's.
//! [`HeldLock::remaining`] tells the holder how much of the lock is left.

use crate::backend::{bounded, KeyValueStore, StoreError};
use sha2::{Digest, Sha256};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use uuid::Uuid;

const LOCK_PREFIX: &str = "snap_lock:";
const COOLDOWN_PREFIX: &str = "snap_cooldown:";

/// Timing parameters for the lock and the cooldown window.
#[derive(Debug, Clone, Copy)]
pub struct DedupConfig {
    /// Lock expiry (default 10s).
    pub lock_ttl: Duration,
    /// Cooldown window after a successful registration (default 300s).
    pub cooldown: Duration,
    /// Upper bound on any single key-value call. Keep it well below `lock_ttl`.
    pub op_timeout: Duration,
}

impl Default for DedupConfig {
    fn default() -> Self {
        Self {
            lock_ttl: Duration::from_secs(10),
            cooldown: Duration::from_secs(300),
            op_timeout: Duration::from_secs(1),
        }
    }
}

/// Result of an admission attempt.
#[derive(Debug)]
pub enum LockOutcome {
    /// The caller holds the lock and no cooldown is active.
    Admitted(HeldLock),
    /// Another handler holds the lock, or the store could not be reached.
    AlreadyLocked,
    /// This content was registered recently.
    CooldownActive,
}

/// Lowercase hex SHA-256 of the raw image payload.
pub fn content_hash(payload: &str) -> String {
    format!("{:x}", Sha256::digest(payload.as_bytes()))
}

pub fn lock_key(hash: &str) -> String {
    format!("{LOCK_PREFIX}{hash}")
}

pub fn cooldown_key(hash: &str) -> String {
    format!("{COOLDOWN_PREFIX}{hash}")
}

/// Gatekeeper for the auto-registration critical section.
#[derive(Clone)]
pub struct DedupCoordinator {
    store: Arc<dyn KeyValueStore>,
    config: DedupConfig,
}

impl DedupCoordinator {
    pub fn new(store: Arc<dyn KeyValueStore>, config: DedupConfig) -> Self {
        Self { store, config }
    }

    pub fn config(&self) -> &DedupConfig {
        &self.config
    }

    /// Try to admit one event for registration.
    ///
    /// Fails closed: if the store errors or times out the event is treated
    /// as [`LockOutcome::AlreadyLocked`] rather than processed without
    /// mutual exclusion.
    pub async fn try_admit(&self, hash: &str) -> LockOutcome {
        let key = lock_key(hash);
        let token = Uuid::new_v4().simple().to_string();
        let limit = self.config.op_timeout;
        // Measured before the request so the holder never overestimates its lock.
        let acquired_at = Instant::now();

        match bounded(limit, self.store.set_if_absent(&key, &token, self.config.lock_ttl)).await {
            Ok(true) => {}
            Ok(false) => {
                tracing::info!(hash, "content is being handled by another worker; skipping");
                return LockOutcome::AlreadyLocked;
            }
            Err(e) => {
                tracing::warn!(hash, error = %e, "lock store unavailable; skipping event");
                return LockOutcome::AlreadyLocked;
            }
        }

        let lock = HeldLock {
            store: Arc::clone(&self.store),
            key,
            token,
            expires_at: acquired_at + self.config.lock_ttl,
            timeout: limit,
            released: false,
        };

        match bounded(limit, self.store.exists(&cooldown_key(hash))).await {
            Ok(false) => LockOutcome::Admitted(lock),
            Ok(true) => {
                tracing::info!(hash, "content registered recently; suppressing duplicate");
                lock.release().await;
                LockOutcome::CooldownActive
            }
            Err(e) => {
                tracing::warn!(hash, error = %e, "cooldown check failed; skipping event");
                lock.release().await;
                LockOutcome::AlreadyLocked
            }
        }
    }

    /// Open the cooldown window for `hash`. Called once a registration has
    /// fully completed.
    pub async fn start_cooldown(&self, hash: &str) -> Result<(), StoreError> {
        bounded(
            self.config.op_timeout,
            self.store
                .set_with_expiry(&cooldown_key(hash), self.config.cooldown),
        )
        .await
    }
}

/// An acquired lock key.
///
/// Release with [`release`](Self::release). If the holder drops it without
/// releasing (early return, panic, cancelled task) the delete is scheduled
/// on the current runtime; failing that, the key's own expiry frees it.
pub struct HeldLock {
    store: Arc<dyn KeyValueStore>,
    key: String,
    token: String,
    expires_at: Instant,
    timeout: Duration,
    released: bool,
}

impl HeldLock {
    pub fn key(&self) -> &str {
        &self.key
    }

    /// Time left before the key expires in the store. Zero once lapsed.
    pub fn remaining(&self) -> Duration {
        self.expires_at.saturating_duration_since(Instant::now())
    }

    pub async fn release(mut self) {
        self.released = true;
        match bounded(self.timeout, self.store.delete_if_value(&self.key, &self.token)).await {
            Ok(true) => tracing::debug!(key = %self.key, "lock released"),
            Ok(false) => tracing::warn!(key = %self.key, "lock expired before release"),
            Err(e) => {
                tracing::warn!(key = %self.key, error = %e, "lock release failed; it will expire on its own")
            }
        }
    }
}

impl Drop for HeldLock {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        let key = std::mem::take(&mut self.key);
        let token = std::mem::take(&mut self.token);
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                let store = Arc::clone(&self.store);
                handle.spawn(async move {
                    if let Err(e) = store.delete_if_value(&key, &token).await {
                        tracing::warn!(key = %key, error = %e, "deferred lock release failed");
                    }
                });
            }
            Err(_) => tracing::warn!(key = %key, "lock dropped outside a runtime; relying on expiry"),
        }
    }
}

impl fmt::Debug for HeldLock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HeldLock")
            .field("key", &self.key)
            .field("remaining", &self.remaining())
            .field("released", &self.released)
            .finish()
    }
}

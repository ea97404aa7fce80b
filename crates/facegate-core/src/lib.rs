//! facegate-core: Face event ingestion and stranger auto-registration.
//!
//! Classifies camera events, persists evidence images, and registers
//! unrecognized faces exactly once per image content, guarded by a
//! distributed lock and a cooldown marker.

pub mod backend;
pub mod classifier;
pub mod dedup;
pub mod event_log;
pub mod image_store;
pub mod memory;
pub mod notifier;
pub mod pipeline;
pub mod sqlite;
pub mod types;
pub mod workflow;

#[cfg(test)]
pub(crate) mod testing;

pub use backend::{AuditSink, IdentityStore, KeyValueStore, PublishError, Publisher, StoreError};
pub use dedup::{DedupConfig, DedupCoordinator, HeldLock, LockOutcome};
pub use image_store::{ImageError, ImageStore};
pub use pipeline::{handle_message, HandleOutcome, PipelineContext};
pub use types::{AuditRecord, EventKind, FaceImagePair, IdentityRecord, InboundEvent};
pub use workflow::WorkflowOutcome;

/// Default data directory: `$XDG_DATA_HOME/facegate` or `~/.local/share/facegate`.
pub fn default_data_dir() -> std::path::PathBuf {
    std::env::var("XDG_DATA_HOME")
        .map(std::path::PathBuf::from)
        .unwrap_or_else(|_| {
            let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
            std::path::PathBuf::from(home).join(".local/share")
        })
        .join("facegate")
}

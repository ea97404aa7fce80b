//! Shared fixtures for unit tests.

use crate::backend::{AuditSink, IdentityStore, KeyValueStore, PublishError, Publisher, StoreError};
use crate::dedup::{DedupConfig, DedupCoordinator};
use crate::event_log::EventLogWriter;
use crate::image_store::ImageStore;
use crate::memory::MemoryKeyStore;
use crate::notifier::Notifier;
use crate::pipeline::PipelineContext;
use crate::sqlite::SqliteStore;
use crate::types::{AuditRecord, IdentityRecord};
use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;

/// PNG signature followed by an IHDR chunk header; enough to look like a PNG.
pub const PNG_BYTES: &[u8] = &[
    0x89, 0x50, 0x4E, 0x47, 0x0D, 0x0A, 0x1A, 0x0A, 0x00, 0x00, 0x00, 0x0D, 0x49, 0x48, 0x44, 0x52,
    0x00, 0x00, 0x00, 0x01, 0x00, 0x00, 0x00, 0x01, 0x08, 0x02, 0x00, 0x00, 0x00,
];

/// SOI, APP0 marker, EOI.
pub const JPEG_BYTES: &[u8] = &[0xFF, 0xD8, 0xFF, 0xE0, 0x00, 0x10, 0x4A, 0x46, 0x49, 0x46, 0x00, 0xFF, 0xD9];

pub fn png_payload() -> String {
    format!("data:image/png;base64,{}", STANDARD.encode(PNG_BYTES))
}

/// A PNG payload whose content (and so content hash) differs per `tag`.
pub fn png_payload_with(tag: u8) -> String {
    let mut bytes = PNG_BYTES.to_vec();
    bytes.push(tag);
    format!("data:image/png;base64,{}", STANDARD.encode(bytes))
}

#[derive(Default)]
pub struct RecordingPublisher {
    sent: Mutex<Vec<(String, Vec<u8>)>>,
}

impl RecordingPublisher {
    pub async fn messages(&self) -> Vec<(String, Vec<u8>)> {
        self.sent.lock().await.clone()
    }
}

#[async_trait]
impl Publisher for RecordingPublisher {
    async fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<(), PublishError> {
        self.sent.lock().await.push((topic.to_string(), payload));
        Ok(())
    }
}

pub struct FailingPublisher;

#[async_trait]
impl Publisher for FailingPublisher {
    async fn publish(&self, _topic: &str, _payload: Vec<u8>) -> Result<(), PublishError> {
        Err(PublishError::Transport("broker unreachable".into()))
    }
}

/// Key-value store whose every call fails.
pub struct BrokenKeyStore;

#[async_trait]
impl KeyValueStore for BrokenKeyStore {
    async fn set_if_absent(&self, _key: &str, _value: &str, _ttl: Duration) -> Result<bool, StoreError> {
        Err(StoreError::Backend("connection refused".into()))
    }

    async fn set_with_expiry(&self, _key: &str, _ttl: Duration) -> Result<(), StoreError> {
        Err(StoreError::Backend("connection refused".into()))
    }

    async fn exists(&self, _key: &str) -> Result<bool, StoreError> {
        Err(StoreError::Backend("connection refused".into()))
    }

    async fn delete_if_value(&self, _key: &str, _value: &str) -> Result<bool, StoreError> {
        Err(StoreError::Backend("connection refused".into()))
    }
}

/// Working store except that `EXISTS` fails.
pub struct CooldownCheckFails(pub Arc<MemoryKeyStore>);

#[async_trait]
impl KeyValueStore for CooldownCheckFails {
    async fn set_if_absent(&self, key: &str, value: &str, ttl: Duration) -> Result<bool, StoreError> {
        self.0.set_if_absent(key, value, ttl).await
    }

    async fn set_with_expiry(&self, key: &str, ttl: Duration) -> Result<(), StoreError> {
        self.0.set_with_expiry(key, ttl).await
    }

    async fn exists(&self, _key: &str) -> Result<bool, StoreError> {
        Err(StoreError::Backend("read timeout".into()))
    }

    async fn delete_if_value(&self, key: &str, value: &str) -> Result<bool, StoreError> {
        self.0.delete_if_value(key, value).await
    }
}

/// Memory store that counts calls, to prove a path never touched the lock.
pub struct CountingKeyStore {
    pub inner: Arc<MemoryKeyStore>,
    calls: AtomicUsize,
}

impl CountingKeyStore {
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    fn tick(&self) {
        self.calls.fetch_add(1, Ordering::SeqCst);
    }
}

#[async_trait]
impl KeyValueStore for CountingKeyStore {
    async fn set_if_absent(&self, key: &str, value: &str, ttl: Duration) -> Result<bool, StoreError> {
        self.tick();
        self.inner.set_if_absent(key, value, ttl).await
    }

    async fn set_with_expiry(&self, key: &str, ttl: Duration) -> Result<(), StoreError> {
        self.tick();
        self.inner.set_with_expiry(key, ttl).await
    }

    async fn exists(&self, key: &str) -> Result<bool, StoreError> {
        self.tick();
        self.inner.exists(key).await
    }

    async fn delete_if_value(&self, key: &str, value: &str) -> Result<bool, StoreError> {
        self.tick();
        self.inner.delete_if_value(key, value).await
    }
}

/// Relational store that rejects every write.
pub struct BrokenRelationalStore;

#[async_trait]
impl IdentityStore for BrokenRelationalStore {
    async fn insert_identity(&self, _record: &IdentityRecord) -> Result<(), StoreError> {
        Err(StoreError::Backend("database is locked".into()))
    }

    async fn remove_identity(&self, _short_id: &str) -> Result<bool, StoreError> {
        Err(StoreError::Backend("database is locked".into()))
    }
}

/// Identity store that takes `delay` before every insert.
pub struct SlowIdentityStore {
    pub inner: SqliteStore,
    pub delay: Duration,
}

#[async_trait]
impl IdentityStore for SlowIdentityStore {
    async fn insert_identity(&self, record: &IdentityRecord) -> Result<(), StoreError> {
        tokio::time::sleep(self.delay).await;
        self.inner.insert_identity(record).await
    }

    async fn remove_identity(&self, short_id: &str) -> Result<bool, StoreError> {
        self.inner.remove_identity(short_id).await
    }
}

/// Identity store whose inserts run on a background task, serialized like a
/// single database connection. An insert the caller stopped waiting for
/// still commits after `delay`.
pub struct LateCommitIdentityStore {
    inner: SqliteStore,
    delay: Duration,
    queue: Arc<Mutex<()>>,
}

impl LateCommitIdentityStore {
    pub fn new(inner: SqliteStore, delay: Duration) -> Self {
        Self {
            inner,
            delay,
            queue: Arc::new(Mutex::new(())),
        }
    }
}

#[async_trait]
impl IdentityStore for LateCommitIdentityStore {
    async fn insert_identity(&self, record: &IdentityRecord) -> Result<(), StoreError> {
        let queue = Arc::clone(&self.queue);
        let (inner, delay, record) = (self.inner.clone(), self.delay, record.clone());
        let (ready, queued) = tokio::sync::oneshot::channel();
        let task = tokio::spawn(async move {
            let _turn = queue.lock().await;
            let _ = ready.send(());
            tokio::time::sleep(delay).await;
            inner.insert_identity(&record).await
        });
        let _ = queued.await;
        task.await
            .map_err(|e| StoreError::Backend(e.to_string()))?
    }

    async fn remove_identity(&self, short_id: &str) -> Result<bool, StoreError> {
        let _turn = self.queue.lock().await;
        self.inner.remove_identity(short_id).await
    }
}

/// Publisher that takes `delay` before recording each message.
pub struct SlowPublisher {
    pub inner: Arc<RecordingPublisher>,
    pub delay: Duration,
}

#[async_trait]
impl Publisher for SlowPublisher {
    async fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<(), PublishError> {
        tokio::time::sleep(self.delay).await;
        self.inner.publish(topic, payload).await
    }
}

#[async_trait]
impl AuditSink for BrokenRelationalStore {
    async fn append_event(&self, _record: &AuditRecord) -> Result<(), StoreError> {
        Err(StoreError::Backend("database is locked".into()))
    }
}

/// How a [`Harness`] is wired. Defaults to fast in-memory backends with
/// timings that comfortably fit the lock.
pub struct HarnessOptions {
    pub identities: Option<Arc<dyn IdentityStore>>,
    pub publisher: Option<Arc<dyn Publisher>>,
    /// Delay injected before each identity insert into the harness database.
    pub identity_delay: Option<Duration>,
    /// Delay injected before each recorded publish.
    pub publish_delay: Option<Duration>,
    /// Inserts into the harness database keep running after the caller times out.
    pub late_commit: Option<Duration>,
    pub dedup: DedupConfig,
    pub io_timeout: Duration,
}

impl Default for HarnessOptions {
    fn default() -> Self {
        Self {
            identities: None,
            publisher: None,
            identity_delay: None,
            publish_delay: None,
            late_commit: None,
            dedup: DedupConfig::default(),
            io_timeout: Duration::from_secs(1),
        }
    }
}

/// A full pipeline over temp directories, in-memory SQLite and an
/// in-memory key store.
pub struct Harness {
    pub ctx: PipelineContext,
    pub db: SqliteStore,
    pub kv: Arc<CountingKeyStore>,
    pub publisher: Arc<RecordingPublisher>,
    _root: tempfile::TempDir,
}

impl Harness {
    pub async fn new() -> Self {
        Self::build(HarnessOptions::default()).await
    }

    pub async fn with_identities(identities: Arc<dyn IdentityStore>) -> Self {
        Self::build(HarnessOptions {
            identities: Some(identities),
            ..HarnessOptions::default()
        })
        .await
    }

    pub async fn with_publisher(publisher: Arc<dyn Publisher>) -> Self {
        Self::build(HarnessOptions {
            publisher: Some(publisher),
            ..HarnessOptions::default()
        })
        .await
    }

    pub async fn build(options: HarnessOptions) -> Self {
        let root = tempfile::tempdir().expect("tempdir");
        let images = ImageStore::under(root.path());
        images.ensure_dirs().expect("upload dirs");

        let db = SqliteStore::open_in_memory().await.expect("sqlite");
        let kv = Arc::new(CountingKeyStore {
            inner: Arc::new(MemoryKeyStore::new()),
            calls: AtomicUsize::new(0),
        });
        let recording = Arc::new(RecordingPublisher::default());

        let identities: Arc<dyn IdentityStore> = match (options.identities, options.identity_delay, options.late_commit) {
            (Some(identities), _, _) => identities,
            (None, _, Some(delay)) => Arc::new(LateCommitIdentityStore::new(db.clone(), delay)),
            (None, Some(delay), None) => Arc::new(SlowIdentityStore {
                inner: db.clone(),
                delay,
            }),
            (None, None, None) => Arc::new(db.clone()),
        };
        let publisher: Arc<dyn Publisher> = match (options.publisher, options.publish_delay) {
            (Some(publisher), _) => publisher,
            (None, Some(delay)) => Arc::new(SlowPublisher {
                inner: recording.clone(),
                delay,
            }),
            (None, None) => recording.clone(),
        };

        let ctx = PipelineContext {
            images,
            identities,
            events: EventLogWriter::new(Arc::new(db.clone()), options.io_timeout),
            notifier: Notifier::new(publisher, "http://faces.test/", options.io_timeout),
            dedup: DedupCoordinator::new(kv.clone(), options.dedup),
            io_timeout: options.io_timeout,
        };

        Self {
            ctx,
            db,
            kv,
            publisher: recording,
            _root: root,
        }
    }
}

//! SQLite-backed audit log and identity store.

use crate::backend::{AuditSink, IdentityStore, StoreError};
use crate::types::{AuditRecord, IdentityRecord};
use async_trait::async_trait;
use serde::Serialize;
use std::path::Path;
use std::time::Duration;
use tokio_rusqlite::Connection;

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS face_events (
    id          INTEGER PRIMARY KEY AUTOINCREMENT,
    event_type  TEXT NOT NULL,
    person_name TEXT NOT NULL,
    person_id   TEXT,
    similarity  REAL,
    record_id   INTEGER,
    event_time  TEXT NOT NULL,
    image_path  TEXT,
    created_at  TEXT NOT NULL DEFAULT (datetime('now'))
);
CREATE TABLE IF NOT EXISTS persons (
    short_id                TEXT PRIMARY KEY,
    person_name             TEXT NOT NULL,
    registration_photo_path TEXT NOT NULL,
    created_at              TEXT NOT NULL DEFAULT (datetime('now'))
);
";

/// A row of `face_events`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StoredEvent {
    pub id: i64,
    pub event_type: String,
    pub person_name: String,
    pub person_id: Option<String>,
    pub similarity: Option<f64>,
    pub record_id: Option<i64>,
    pub event_time: String,
    pub image_path: Option<String>,
    pub created_at: String,
}

/// A row of `persons`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StoredPerson {
    pub short_id: String,
    pub person_name: String,
    pub registration_photo_path: String,
    pub created_at: String,
}

#[derive(Clone)]
pub struct SqliteStore {
    conn: Connection,
}

impl SqliteStore {
    /// Open (or create) the database file and apply the schema.
    pub async fn open(path: &Path) -> Result<Self, StoreError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| StoreError::Backend(e.to_string()))?;
        }
        let conn = Connection::open(path).await?;
        conn.call(|c| {
            c.busy_timeout(Duration::from_secs(5))?;
            c.execute_batch("PRAGMA journal_mode=WAL;")?;
            Ok(())
        })
        .await?;
        tracing::info!(path = %path.display(), "database opened");
        Self::with_schema(conn).await
    }

    pub async fn open_in_memory() -> Result<Self, StoreError> {
        let conn = Connection::open_in_memory().await?;
        Self::with_schema(conn).await
    }

    async fn with_schema(conn: Connection) -> Result<Self, StoreError> {
        conn.call(|c| {
            c.execute_batch(SCHEMA)?;
            Ok(())
        })
        .await?;
        Ok(Self { conn })
    }

    /// Most recent audit rows, newest first.
    pub async fn recent_events(&self, limit: usize) -> Result<Vec<StoredEvent>, StoreError> {
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);
        let rows = self
            .conn
            .call(move |c| {
                let mut stmt = c.prepare(
                    "SELECT id, event_type, person_name, person_id, similarity, record_id,
                            event_time, image_path, created_at
                     FROM face_events ORDER BY id DESC LIMIT ?1",
                )?;
                let rows = stmt
                    .query_map([limit], |row| {
                        Ok(StoredEvent {
                            id: row.get(0)?,
                            event_type: row.get(1)?,
                            person_name: row.get(2)?,
                            person_id: row.get(3)?,
                            similarity: row.get(4)?,
                            record_id: row.get(5)?,
                            event_time: row.get(6)?,
                            image_path: row.get(7)?,
                            created_at: row.get(8)?,
                        })
                    })?
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(rows)
            })
            .await?;
        Ok(rows)
    }

    /// Most recently registered persons, newest first.
    pub async fn persons(&self, limit: usize) -> Result<Vec<StoredPerson>, StoreError> {
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);
        let rows = self
            .conn
            .call(move |c| {
                let mut stmt = c.prepare(
                    "SELECT short_id, person_name, registration_photo_path, created_at
                     FROM persons ORDER BY created_at DESC, rowid DESC LIMIT ?1",
                )?;
                let rows = stmt
                    .query_map([limit], |row| {
                        Ok(StoredPerson {
                            short_id: row.get(0)?,
                            person_name: row.get(1)?,
                            registration_photo_path: row.get(2)?,
                            created_at: row.get(3)?,
                        })
                    })?
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(rows)
            })
            .await?;
        Ok(rows)
    }

    pub async fn count_events(&self) -> Result<u64, StoreError> {
        self.count("SELECT COUNT(*) FROM face_events").await
    }

    pub async fn count_persons(&self) -> Result<u64, StoreError> {
        self.count("SELECT COUNT(*) FROM persons").await
    }

    async fn count(&self, sql: &'static str) -> Result<u64, StoreError> {
        let n = self
            .conn
            .call(move |c| {
                let n: i64 = c.query_row(sql, [], |row| row.get(0))?;
                Ok(n)
            })
            .await?;
        Ok(u64::try_from(n).unwrap_or(0))
    }
}

#[async_trait]
impl AuditSink for SqliteStore {
    async fn append_event(&self, record: &AuditRecord) -> Result<(), StoreError> {
        let record = record.clone();
        self.conn
            .call(move |c| {
                c.execute(
                    "INSERT INTO face_events
                        (event_type, person_name, person_id, similarity, record_id, event_time, image_path)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                    rusqlite::params![
                        record.event_type.as_str(),
                        record.person_name,
                        record.person_id,
                        record.similarity,
                        record.record_id,
                        record.event_time,
                        record.image_path,
                    ],
                )?;
                Ok(())
            })
            .await?;
        Ok(())
    }
}

#[async_trait]
impl IdentityStore for SqliteStore {
    async fn insert_identity(&self, record: &IdentityRecord) -> Result<(), StoreError> {
        let record = record.clone();
        self.conn
            .call(move |c| {
                c.execute(
                    "INSERT INTO persons (short_id, person_name, registration_photo_path)
                     VALUES (?1, ?2, ?3)",
                    rusqlite::params![
                        record.short_id,
                        record.person_name,
                        record.registration_photo_path,
                    ],
                )?;
                Ok(())
            })
            .await?;
        Ok(())
    }

    // Calls run in order on the connection's thread, so this lands after a
    // timed-out insert that is still queued.
    async fn remove_identity(&self, short_id: &str) -> Result<bool, StoreError> {
        let short_id = short_id.to_string();
        let removed = self
            .conn
            .call(move |c| Ok(c.execute("DELETE FROM persons WHERE short_id = ?1", [short_id])?))
            .await?;
        Ok(removed > 0)
    }
}

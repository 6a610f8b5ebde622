// ABOUTME: SQLite-backed event storage keyed by sequence number.
// ABOUTME: Chunk writes are transactional and idempotent, so redelivered chunks are absorbed.

use std::path::Path;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use ingestd_core::{Event, EventStorage, StorageError};
use rusqlite::{Connection, OptionalExtension, params};
use thiserror::Error;
use tracing::debug;
use ulid::Ulid;

#[derive(Debug, Error)]
pub enum SqliteError {
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("corrupt row for sequence {sequence}: {reason}")]
    Corrupt { sequence: u64, reason: String },
}

impl From<SqliteError> for StorageError {
    fn from(err: SqliteError) -> Self {
        StorageError::Backend(err.to_string())
    }
}

/// Durable event table. The connection sits behind a mutex and every call
/// runs on the blocking thread pool.
#[derive(Clone)]
pub struct SqliteEventStore {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteEventStore {
    /// Open or create the database and ensure the schema exists.
    pub fn open(path: &Path) -> Result<Self, SqliteError> {
        let conn = Connection::open(path)?;
        conn.execute_batch("PRAGMA journal_mode=WAL;")?;
        conn.execute_batch("PRAGMA synchronous=FULL;")?;

        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS events (
                sequence INTEGER PRIMARY KEY,
                event_id TEXT NOT NULL,
                timestamp TEXT NOT NULL,
                service TEXT NOT NULL,
                message TEXT NOT NULL,
                metadata TEXT,
                ingested_at TEXT NOT NULL,
                persisted_at TEXT NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_events_service_timestamp
                ON events(service, timestamp);",
        )?;

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    fn with_conn<T>(&self, f: impl FnOnce(&mut Connection) -> Result<T, SqliteError>) -> Result<T, SqliteError> {
        let mut conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        f(&mut conn)
    }

    /// Insert every event in one transaction. Rows whose sequence already
    /// exists are left untouched. Returns the number of new rows.
    pub fn insert_chunk(&self, events: &[Event]) -> Result<usize, SqliteError> {
        self.with_conn(|conn| {
            let tx = conn.transaction()?;
            let persisted_at = Utc::now().to_rfc3339();
            let mut inserted = 0;
            {
                let mut stmt = tx.prepare_cached(
                    "INSERT OR IGNORE INTO events
                        (sequence, event_id, timestamp, service, message, metadata, ingested_at, persisted_at)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
                )?;
                for event in events {
                    let metadata = event
                        .metadata
                        .as_ref()
                        .map(serde_json::to_string)
                        .transpose()?;
                    inserted += stmt.execute(params![
                        event.sequence as i64,
                        event.event_id.to_string(),
                        event.timestamp.to_rfc3339(),
                        event.service,
                        event.message,
                        metadata,
                        event.ingested_at.to_rfc3339(),
                        persisted_at,
                    ])?;
                }
            }
            tx.commit()?;
            Ok(inserted)
        })
    }

    /// Highest stored sequence, if any.
    pub fn max_sequence(&self) -> Result<Option<u64>, SqliteError> {
        self.with_conn(|conn| {
            let max: Option<i64> = conn
                .query_row("SELECT MAX(sequence) FROM events", [], |row| row.get(0))
                .optional()?
                .flatten();
            Ok(max.map(|v| v as u64))
        })
    }

    pub fn count(&self) -> Result<u64, SqliteError> {
        self.with_conn(|conn| {
            let count: i64 = conn.query_row("SELECT COUNT(*) FROM events", [], |row| row.get(0))?;
            Ok(count as u64)
        })
    }

    /// Events with `first <= sequence <= last`, in sequence order.
    pub fn range(&self, first: u64, last: u64) -> Result<Vec<Event>, SqliteError> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT sequence, event_id, timestamp, service, message, metadata, ingested_at
                 FROM events WHERE sequence BETWEEN ?1 AND ?2 ORDER BY sequence",
            )?;
            let rows = stmt.query_map(params![first as i64, last as i64], |row| {
                Ok(RawRow {
                    sequence: row.get::<_, i64>(0)? as u64,
                    event_id: row.get(1)?,
                    timestamp: row.get(2)?,
                    service: row.get(3)?,
                    message: row.get(4)?,
                    metadata: row.get(5)?,
                    ingested_at: row.get(6)?,
                })
            })?;

            let mut events = Vec::new();
            for row in rows {
                events.push(row?.into_event()?);
            }
            Ok(events)
        })
    }
}

struct RawRow {
    sequence: u64,
    event_id: String,
    timestamp: String,
    service: String,
    message: String,
    metadata: Option<String>,
    ingested_at: String,
}

impl RawRow {
    fn into_event(self) -> Result<Event, SqliteError> {
        let sequence = self.sequence;
        let corrupt = |reason: String| SqliteError::Corrupt { sequence, reason };
        let parse_time = |value: &str| {
            DateTime::parse_from_rfc3339(value)
                .map(|t| t.with_timezone(&Utc))
                .map_err(|e| corrupt(e.to_string()))
        };

        Ok(Event {
            sequence,
            event_id: Ulid::from_string(&self.event_id).map_err(|e| corrupt(e.to_string()))?,
            timestamp: parse_time(&self.timestamp)?,
            service: self.service,
            message: self.message,
            metadata: self.metadata.as_deref().map(serde_json::from_str).transpose()?,
            ingested_at: parse_time(&self.ingested_at)?,
        })
    }
}

#[async_trait]
impl EventStorage for SqliteEventStore {
    async fn write_chunk(&self, events: &[Event]) -> Result<(), StorageError> {
        let store = self.clone();
        let chunk = events.to_vec();
        let inserted = tokio::task::spawn_blocking(move || store.insert_chunk(&chunk))
            .await
            .map_err(|e| StorageError::Backend(format!("write task failed: {}", e)))??;
        debug!(
            chunk_len = events.len(),
            inserted,
            "chunk written to sqlite"
        );
        Ok(())
    }

    async fn last_sequence(&self) -> Result<Option<u64>, StorageError> {
        let store = self.clone();
        let max = tokio::task::spawn_blocking(move || store.max_sequence())
            .await
            .map_err(|e| StorageError::Backend(format!("query task failed: {}", e)))??;
        Ok(max)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ingestd_core::NewEvent;
    use tempfile::TempDir;

    fn events(range: std::ops::RangeInclusive<u64>) -> Vec<Event> {
        range
            .map(|seq| {
                Event::accept(
                    seq,
                    NewEvent::new("payments", format!("charge {}", seq))
                        .with_metadata(serde_json::json!({"amount": seq * 100})),
                )
            })
            .collect()
    }

    #[tokio::test]
    async fn write_chunk_persists_events() {
        let dir = TempDir::new().unwrap();
        let store = SqliteEventStore::open(&dir.path().join("events.db")).unwrap();

        store.write_chunk(&events(1..=5)).await.unwrap();

        assert_eq!(store.count().unwrap(), 5);
        assert_eq!(store.last_sequence().await.unwrap(), Some(5));
        let stored = store.range(2, 3).unwrap();
        assert_eq!(stored.len(), 2);
        assert_eq!(stored[0].sequence, 2);
        assert_eq!(stored[0].message, "charge 2");
        assert_eq!(stored[0].metadata, Some(serde_json::json!({"amount": 200})));
    }

    #[tokio::test]
    async fn redelivered_chunk_is_absorbed() {
        let dir = TempDir::new().unwrap();
        let store = SqliteEventStore::open(&dir.path().join("events.db")).unwrap();
        let chunk = events(1..=10);

        store.write_chunk(&chunk).await.unwrap();
        store.write_chunk(&chunk).await.unwrap();
        assert_eq!(store.insert_chunk(&chunk[5..]).unwrap(), 0);

        assert_eq!(store.count().unwrap(), 10);
        let first = store.range(1, 1).unwrap();
        assert_eq!(first[0].event_id, chunk[0].event_id);
    }

    #[tokio::test]
    async fn empty_store_has_no_high_water() {
        let dir = TempDir::new().unwrap();
        let store = SqliteEventStore::open(&dir.path().join("events.db")).unwrap();
        assert_eq!(store.last_sequence().await.unwrap(), None);
        assert_eq!(store.count().unwrap(), 0);
    }

    #[tokio::test]
    async fn data_survives_reopen() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("events.db");
        {
            let store = SqliteEventStore::open(&path).unwrap();
            store.write_chunk(&events(1..=3)).await.unwrap();
        }

        let reopened = SqliteEventStore::open(&path).unwrap();
        assert_eq!(reopened.max_sequence().unwrap(), Some(3));
    }
}

// ABOUTME: Contracts for the collaborators the pipeline writes to: event storage, dead letters, and the shutdown spill.
// ABOUTME: Implementations live outside the core crate; in-memory versions live in the testing module.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::event::{Event, SequenceRange};

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("storage unavailable: {0}")]
    Unavailable(String),

    #[error("storage I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("storage serialization error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("storage backend error: {0}")]
    Backend(String),
}

/// Destination for persisted chunks. `write_chunk` either durably stores the
/// whole chunk or fails; rewriting an already-stored sequence is a no-op.
#[async_trait]
pub trait EventStorage: Send + Sync {
    async fn write_chunk(&self, events: &[Event]) -> Result<(), StorageError>;

    /// Highest sequence the backend holds, used to seed numbering after a
    /// crash that persisted events without advancing the checkpoint.
    async fn last_sequence(&self) -> Result<Option<u64>, StorageError> {
        Ok(None)
    }
}

/// A chunk abandoned after exhausting its persist attempts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeadLetter {
    pub range: SequenceRange,
    pub reason: String,
    pub attempts: u32,
    pub dropped_at: DateTime<Utc>,
    pub events: Vec<Event>,
}

/// Best-effort record of dropped chunks. A failure here is logged and
/// never blocks the worker.
pub trait DeadLetterSink: Send + Sync {
    fn record(&self, letter: &DeadLetter) -> Result<(), StorageError>;
}

/// Holds buffered events across a restart.
pub trait BufferSpill: Send + Sync {
    /// Replace the spill contents with `events`.
    fn save(&self, events: &[Event]) -> Result<(), StorageError>;

    /// Return and clear whatever was spilled.
    fn take(&self) -> Result<Vec<Event>, StorageError>;
}

// ABOUTME: Defines the immutable event record held by the buffer and written to storage.
// ABOUTME: Also defines the validated ingestion payload and the sequence range used for chunk bookkeeping.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use ulid::Ulid;

/// A validated payload offered to admission. Content limits have already
/// been enforced by the caller; the pipeline never inspects the contents.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewEvent {
    pub timestamp: DateTime<Utc>,
    pub service: String,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<serde_json::Value>,
}

impl NewEvent {
    pub fn new(service: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            timestamp: Utc::now(),
            service: service.into(),
            message: message.into(),
            metadata: None,
        }
    }

    pub fn with_metadata(mut self, metadata: serde_json::Value) -> Self {
        self.metadata = Some(metadata);
        self
    }
}

/// An accepted event. The sequence number is assigned under the buffer lock
/// at enqueue time and is strictly increasing across the process lifetime.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    pub sequence: u64,
    pub event_id: Ulid,
    pub timestamp: DateTime<Utc>,
    pub service: String,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<serde_json::Value>,
    pub ingested_at: DateTime<Utc>,
}

impl Event {
    /// Stamp a payload with its sequence number, a fresh event id, and the
    /// ingestion time.
    pub fn accept(sequence: u64, payload: NewEvent) -> Self {
        Self {
            sequence,
            event_id: Ulid::new(),
            timestamp: payload.timestamp,
            service: payload.service,
            message: payload.message,
            metadata: payload.metadata,
            ingested_at: Utc::now(),
        }
    }
}

/// Inclusive range of sequence numbers covered by a chunk.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SequenceRange {
    pub first: u64,
    pub last: u64,
}

impl SequenceRange {
    /// Range spanned by an ordered slice of events, or None when empty.
    pub fn of(events: &[Event]) -> Option<Self> {
        let first = events.first()?.sequence;
        let last = events.last()?.sequence;
        Some(Self { first, last })
    }
}

impl fmt::Display for SequenceRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}..={}", self.first, self.last)
    }
}

// ABOUTME: Append-only history of periodic metrics snapshots.
// ABOUTME: Lets operators look back at buffer pressure and drop rates after the fact.

use std::path::{Path, PathBuf};
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use ingestd_core::MetricsSnapshot;
use serde::{Deserialize, Serialize};

use crate::jsonl::{JsonlError, JsonlLog};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistoryEntry {
    pub recorded_at: DateTime<Utc>,
    pub snapshot: MetricsSnapshot,
}

pub struct MetricsHistory {
    path: PathBuf,
    log: Mutex<JsonlLog<HistoryEntry>>,
}

impl MetricsHistory {
    pub fn open(path: &Path) -> Result<Self, JsonlError> {
        if path.exists() {
            JsonlLog::<HistoryEntry>::repair(path)?;
        }
        Ok(Self {
            path: path.to_path_buf(),
            log: Mutex::new(JsonlLog::open(path)?),
        })
    }

    pub fn record(&self, snapshot: &MetricsSnapshot) -> Result<HistoryEntry, JsonlError> {
        let entry = HistoryEntry {
            recorded_at: Utc::now(),
            snapshot: snapshot.clone(),
        };
        self.log
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .append(&entry)?;
        Ok(entry)
    }

    /// The last `limit` entries in recording order.
    pub fn recent(&self, limit: usize) -> Result<Vec<HistoryEntry>, JsonlError> {
        let _guard = self.log.lock().unwrap_or_else(|e| e.into_inner());
        JsonlLog::tail(&self.path, limit)
    }
}

// ABOUTME: Durable record of the highest contiguously persisted sequence number.
// ABOUTME: The manager enforces monotonic commits over a pluggable single-slot store.

use std::sync::{Arc, Mutex};
use std::sync::atomic::{AtomicU64, Ordering};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Checkpoint {
    pub last_flushed_sequence: u64,
    pub timestamp: DateTime<Utc>,
}

impl Checkpoint {
    /// Starting point when no checkpoint has ever been written.
    pub fn zero() -> Self {
        Self {
            last_flushed_sequence: 0,
            timestamp: DateTime::<Utc>::UNIX_EPOCH,
        }
    }

    pub fn at(sequence: u64) -> Self {
        Self {
            last_flushed_sequence: sequence,
            timestamp: Utc::now(),
        }
    }
}

impl Default for Checkpoint {
    fn default() -> Self {
        Self::zero()
    }
}

#[derive(Debug, Error)]
pub enum CheckpointError {
    #[error("checkpoint I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("checkpoint serialization error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("checkpoint store error: {0}")]
    Store(String),
}

/// Single-slot durable storage. A write fully replaces the prior value.
pub trait CheckpointStore: Send + Sync {
    fn read(&self) -> Result<Option<Checkpoint>, CheckpointError>;
    fn write(&self, checkpoint: &Checkpoint) -> Result<(), CheckpointError>;
}

#[derive(Debug)]
struct CheckpointState {
    durable: Checkpoint,
    /// Highest committed sequence whose write failed and is still owed.
    pending: Option<u64>,
}

/// Owns the in-memory copy of the checkpoint. Commits are monotonic:
/// a sequence at or below the durable value is ignored.
pub struct CheckpointManager {
    store: Arc<dyn CheckpointStore>,
    state: Mutex<CheckpointState>,
    failed_commits: AtomicU64,
}

impl CheckpointManager {
    pub fn new(store: Arc<dyn CheckpointStore>) -> Self {
        Self {
            store,
            state: Mutex::new(CheckpointState {
                durable: Checkpoint::zero(),
                pending: None,
            }),
            failed_commits: AtomicU64::new(0),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, CheckpointState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Read the stored checkpoint, or the zero checkpoint if none exists.
    pub fn load(&self) -> Result<Checkpoint, CheckpointError> {
        let checkpoint = self.store.read()?.unwrap_or_else(Checkpoint::zero);
        let mut state = self.lock();
        state.durable = checkpoint;
        state.pending = None;
        info!(
            last_flushed_sequence = checkpoint.last_flushed_sequence,
            "checkpoint loaded"
        );
        Ok(checkpoint)
    }

    /// Durably record `sequence` as the newest flushed position. On failure
    /// the previous durable value is kept and the sequence stays pending.
    pub fn commit(&self, sequence: u64) -> Result<(), CheckpointError> {
        let mut state = self.lock();
        let target = state.pending.map_or(sequence, |p| p.max(sequence));
        if target <= state.durable.last_flushed_sequence {
            debug!(
                sequence,
                durable = state.durable.last_flushed_sequence,
                "ignoring non-advancing checkpoint"
            );
            return Ok(());
        }

        let checkpoint = Checkpoint::at(target);
        match self.store.write(&checkpoint) {
            Ok(()) => {
                state.durable = checkpoint;
                state.pending = None;
                Ok(())
            }
            Err(e) => {
                state.pending = Some(target);
                self.failed_commits.fetch_add(1, Ordering::Relaxed);
                Err(e)
            }
        }
    }

    /// Retry a pending commit, if any.
    pub fn flush(&self) -> Result<(), CheckpointError> {
        let pending = self.lock().pending;
        match pending {
            Some(sequence) => self.commit(sequence),
            None => Ok(()),
        }
    }

    /// Last checkpoint known to be durable.
    pub fn current(&self) -> Checkpoint {
        self.lock().durable
    }

    pub fn pending(&self) -> Option<u64> {
        self.lock().pending
    }

    pub fn failed_commits(&self) -> u64 {
        self.failed_commits.load(Ordering::Relaxed)
    }
}

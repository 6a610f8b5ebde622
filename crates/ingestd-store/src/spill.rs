// ABOUTME: File that carries still-buffered events across a graceful restart.
// ABOUTME: Written atomically at shutdown; read, repaired, and removed on the next start.

use std::fs;
use std::path::{Path, PathBuf};

use ingestd_core::{BufferSpill, Event, StorageError};
use tracing::{info, warn};

use crate::jsonl::JsonlLog;

pub struct JsonlBufferSpill {
    path: PathBuf,
}

impl JsonlBufferSpill {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl BufferSpill for JsonlBufferSpill {
    fn save(&self, events: &[Event]) -> Result<(), StorageError> {
        if events.is_empty() {
            return match fs::remove_file(&self.path) {
                Err(e) if e.kind() != std::io::ErrorKind::NotFound => Err(e.into()),
                _ => Ok(()),
            };
        }
        JsonlLog::rewrite(&self.path, events)?;
        info!(path = %self.path.display(), events = events.len(), "buffer spilled");
        Ok(())
    }

    fn take(&self) -> Result<Vec<Event>, StorageError> {
        if !self.path.exists() {
            return Ok(Vec::new());
        }
        let before = fs::metadata(&self.path)?.len();
        JsonlLog::<Event>::repair(&self.path)?;
        if fs::metadata(&self.path)?.len() < before {
            warn!(path = %self.path.display(), "spill had a truncated tail; partial record discarded");
        }
        let events = JsonlLog::<Event>::replay(&self.path)?;
        fs::remove_file(&self.path)?;
        info!(path = %self.path.display(), events = events.len(), "buffer spill loaded");
        Ok(events)
    }
}

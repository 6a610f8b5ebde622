// ABOUTME: Owns the ingestd home directory layout and opens every durable collaborator in it.
// ABOUTME: Produces the Collaborators bundle the pipeline starts from.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use ingestd_core::Collaborators;
use thiserror::Error;
use tracing::info;

use crate::checkpoint::FileCheckpointStore;
use crate::dead_letter::JsonlDeadLetterLog;
use crate::history::MetricsHistory;
use crate::jsonl::JsonlError;
use crate::spill::JsonlBufferSpill;
use crate::sqlite::{SqliteError, SqliteEventStore};

#[derive(Debug, Error)]
pub enum ManagerError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("sqlite error: {0}")]
    Sqlite(#[from] SqliteError),

    #[error("jsonl error: {0}")]
    Jsonl(#[from] JsonlError),
}

/// Everything opened from the home directory. The dead-letter log and
/// metrics history are also kept directly for read endpoints.
pub struct OpenedStores {
    pub events: SqliteEventStore,
    pub checkpoints: Arc<FileCheckpointStore>,
    pub dead_letters: Arc<JsonlDeadLetterLog>,
    pub spill: Arc<JsonlBufferSpill>,
    pub history: Arc<MetricsHistory>,
}

impl OpenedStores {
    pub fn collaborators(&self) -> Collaborators {
        Collaborators {
            storage: Arc::new(self.events.clone()),
            checkpoints: self.checkpoints.clone(),
            dead_letters: Some(self.dead_letters.clone()),
            spill: Some(self.spill.clone()),
        }
    }
}

pub struct StorageManager {
    home: PathBuf,
}

impl StorageManager {
    /// Create the home directory and its `metrics/` subdirectory.
    pub fn new(home: PathBuf) -> Result<Self, ManagerError> {
        fs::create_dir_all(home.join("metrics"))?;
        Ok(Self { home })
    }

    pub fn home(&self) -> &Path {
        &self.home
    }

    pub fn events_path(&self) -> PathBuf {
        self.home.join("events.db")
    }

    pub fn checkpoint_path(&self) -> PathBuf {
        self.home.join("checkpoint.json")
    }

    pub fn dead_letters_path(&self) -> PathBuf {
        self.home.join("dead-letters.jsonl")
    }

    pub fn spill_path(&self) -> PathBuf {
        self.home.join("spill.jsonl")
    }

    pub fn history_path(&self) -> PathBuf {
        self.home.join("metrics").join("history.jsonl")
    }

    pub fn open(&self) -> Result<OpenedStores, ManagerError> {
        let stores = OpenedStores {
            events: SqliteEventStore::open(&self.events_path())?,
            checkpoints: Arc::new(FileCheckpointStore::new(self.checkpoint_path())),
            dead_letters: Arc::new(JsonlDeadLetterLog::open(&self.dead_letters_path())?),
            spill: Arc::new(JsonlBufferSpill::new(self.spill_path())),
            history: Arc::new(MetricsHistory::open(&self.history_path())?),
        };
        info!(home = %self.home.display(), "storage opened");
        Ok(stores)
    }
}

// ABOUTME: Durable collaborators for ingestd: SQLite event storage, checkpoint file, and JSONL logs.
// ABOUTME: The storage manager lays these out under one home directory and bundles them for the pipeline.

pub mod checkpoint;
pub mod dead_letter;
pub mod history;
pub mod jsonl;
pub mod manager;
pub mod spill;
pub mod sqlite;

pub use checkpoint::FileCheckpointStore;
pub use dead_letter::{DeadLetterEntry, DeadLetterStats, DeadLetterSummary, JsonlDeadLetterLog};
pub use history::{HistoryEntry, MetricsHistory};
pub use jsonl::{JsonlError, JsonlLog};
pub use manager::{ManagerError, OpenedStores, StorageManager};
pub use spill::JsonlBufferSpill;
pub use sqlite::{SqliteError, SqliteEventStore};

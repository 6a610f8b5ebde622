// ABOUTME: Single-file checkpoint store written atomically with temp file, fsync, and rename.
// ABOUTME: A missing file reads as "no checkpoint yet".

use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};

use ingestd_core::{Checkpoint, CheckpointError, CheckpointStore};

pub struct FileCheckpointStore {
    path: PathBuf,
}

impl FileCheckpointStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl CheckpointStore for FileCheckpointStore {
    fn read(&self) -> Result<Option<Checkpoint>, CheckpointError> {
        let bytes = match fs::read(&self.path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        Ok(Some(serde_json::from_slice(&bytes)?))
    }

    fn write(&self, checkpoint: &Checkpoint) -> Result<(), CheckpointError> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }

        let tmp_path = self.path.with_extension("json.tmp");
        let json = serde_json::to_vec_pretty(checkpoint)?;
        let mut file = File::create(&tmp_path)?;
        file.write_all(&json)?;
        file.sync_all()?;
        drop(file);

        fs::rename(&tmp_path, &self.path)?;
        if let Some(parent) = self.path.parent()
            && let Ok(dir) = File::open(parent)
        {
            let _ = dir.sync_all();
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ingestd_core::CheckpointManager;
    use std::sync::Arc;
    use tempfile::TempDir;

    #[test]
    fn missing_file_reads_as_none() {
        let dir = TempDir::new().unwrap();
        let store = FileCheckpointStore::new(dir.path().join("checkpoint.json"));
        assert!(store.read().unwrap().is_none());
    }

    #[test]
    fn write_replaces_previous_value() {
        let dir = TempDir::new().unwrap();
        let store = FileCheckpointStore::new(dir.path().join("checkpoint.json"));

        store.write(&Checkpoint::at(10)).unwrap();
        store.write(&Checkpoint::at(25)).unwrap();

        assert_eq!(store.read().unwrap().unwrap().last_flushed_sequence, 25);
        assert!(!dir.path().join("checkpoint.json.tmp").exists());
    }

    #[test]
    fn corrupt_file_is_an_error() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("checkpoint.json");
        fs::write(&path, b"{\"last_flushed_sequence\": ").unwrap();

        let store = FileCheckpointStore::new(&path);
        assert!(matches!(store.read(), Err(CheckpointError::Json(_))));
    }

    #[test]
    fn manager_round_trips_through_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("state").join("checkpoint.json");

        let manager = CheckpointManager::new(Arc::new(FileCheckpointStore::new(&path)));
        manager.commit(100).unwrap();

        let restarted = CheckpointManager::new(Arc::new(FileCheckpointStore::new(&path)));
        assert_eq!(restarted.load().unwrap().last_flushed_sequence, 100);
    }
}

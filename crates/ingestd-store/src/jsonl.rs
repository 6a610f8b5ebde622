// ABOUTME: Generic append-only JSONL file used for dead letters, the shutdown spill, and metrics history.
// ABOUTME: Provides fsynced append, ordered replay, tail reads, atomic rewrite, and truncated-file repair.

use std::fs::{self, File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::marker::PhantomData;
use std::path::{Path, PathBuf};

use serde::Serialize;
use serde::de::DeserializeOwned;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum JsonlError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
}

impl From<JsonlError> for ingestd_core::StorageError {
    fn from(err: JsonlError) -> Self {
        match err {
            JsonlError::Io(e) => ingestd_core::StorageError::Io(e),
            JsonlError::Json(e) => ingestd_core::StorageError::Json(e),
        }
    }
}

/// An append-only log of `T` records, one JSON document per line.
pub struct JsonlLog<T> {
    path: PathBuf,
    file: File,
    _record: PhantomData<fn() -> T>,
}

impl<T> JsonlLog<T>
where
    T: Serialize + DeserializeOwned,
{
    /// Open (or create) the log, creating parent directories as needed.
    pub fn open(path: &Path) -> Result<Self, JsonlError> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        Ok(Self {
            path: path.to_path_buf(),
            file,
            _record: PhantomData,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Append one record and fsync.
    pub fn append(&mut self, record: &T) -> Result<(), JsonlError> {
        let json = serde_json::to_string(record)?;
        writeln!(self.file, "{}", json)?;
        self.file.sync_all()?;
        Ok(())
    }

    /// Atomically replace the contents of this log with `records`. The
    /// append handle is reopened because the rename swaps the file out.
    pub fn replace(&mut self, records: &[T]) -> Result<(), JsonlError> {
        Self::rewrite(&self.path, records)?;
        self.file = OpenOptions::new().append(true).open(&self.path)?;
        Ok(())
    }

    /// Every record in file order. A missing file replays as empty.
    pub fn replay(path: &Path) -> Result<Vec<T>, JsonlError> {
        let file = match File::open(path) {
            Ok(file) => file,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };
        let mut records = Vec::new();
        for line in BufReader::new(file).lines() {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }
            records.push(serde_json::from_str(&line)?);
        }
        Ok(records)
    }

    /// The newest `limit` records, oldest first.
    pub fn tail(path: &Path, limit: usize) -> Result<Vec<T>, JsonlError> {
        let mut records = Self::replay(path)?;
        let skip = records.len().saturating_sub(limit);
        Ok(records.split_off(skip))
    }

    /// Replace the file contents with `records` via temp file, fsync, and
    /// rename, so readers see either the old or the new contents.
    pub fn rewrite(path: &Path, records: &[T]) -> Result<(), JsonlError> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let mut lines = Vec::with_capacity(records.len());
        for record in records {
            lines.push(serde_json::to_string(record)?);
        }
        replace_atomically(path, &lines)
    }

    /// Keep only complete, parseable lines, dropping any partial trailing
    /// write. Returns the number of records retained.
    pub fn repair(path: &Path) -> Result<usize, JsonlError> {
        let file = File::open(path)?;
        let mut valid_lines = Vec::new();
        for line in BufReader::new(file).lines() {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }
            if serde_json::from_str::<T>(&line).is_ok() {
                valid_lines.push(line);
            }
        }
        let count = valid_lines.len();
        replace_atomically(path, &valid_lines)?;
        Ok(count)
    }
}

fn replace_atomically(path: &Path, lines: &[String]) -> Result<(), JsonlError> {
    let tmp_path = path.with_extension("jsonl.tmp");
    let mut tmp_file = File::create(&tmp_path)?;
    for line in lines {
        writeln!(tmp_file, "{}", line)?;
    }
    tmp_file.sync_all()?;
    fs::rename(&tmp_path, path)?;

    // Best-effort directory fsync so the rename itself is durable
    if let Some(parent) = path.parent()
        && let Ok(dir) = File::open(parent)
    {
        let _ = dir.sync_all();
    }
    Ok(())
}

// ABOUTME: JSONL log of chunks the worker gave up on, kept for operator inspection and replay.
// ABOUTME: Implements the core DeadLetterSink and supports lookup, deletion, reprocess marking, and statistics.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use ingestd_core::{DeadLetter, DeadLetterSink, SequenceRange, StorageError};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::jsonl::{JsonlError, JsonlLog};

/// One line of the log: the dropped chunk plus its operator-facing status.
/// Entries are addressed by the first sequence of their range.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeadLetterEntry {
    #[serde(flatten)]
    pub letter: DeadLetter,
    #[serde(default)]
    pub reprocessed_at: Option<DateTime<Utc>>,
}

impl DeadLetterEntry {
    pub fn id(&self) -> u64 {
        self.letter.range.first
    }

    pub fn is_reprocessed(&self) -> bool {
        self.reprocessed_at.is_some()
    }
}

/// A dead letter without its event bodies.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeadLetterSummary {
    pub range: SequenceRange,
    pub reason: String,
    pub attempts: u32,
    pub dropped_at: DateTime<Utc>,
    pub event_count: usize,
    pub reprocessed_at: Option<DateTime<Utc>>,
}

impl From<&DeadLetterEntry> for DeadLetterSummary {
    fn from(entry: &DeadLetterEntry) -> Self {
        let letter = &entry.letter;
        Self {
            range: letter.range,
            reason: letter.reason.clone(),
            attempts: letter.attempts,
            dropped_at: letter.dropped_at,
            event_count: letter.events.len(),
            reprocessed_at: entry.reprocessed_at,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct DeadLetterStats {
    pub entries: usize,
    pub events: usize,
    pub pending: usize,
    pub reprocessed: usize,
    /// Dropped events per originating service.
    pub by_service: BTreeMap<String, usize>,
    pub oldest_dropped_at: Option<DateTime<Utc>>,
    pub newest_dropped_at: Option<DateTime<Utc>>,
}

pub struct JsonlDeadLetterLog {
    path: PathBuf,
    log: Mutex<JsonlLog<DeadLetterEntry>>,
}

impl JsonlDeadLetterLog {
    /// Open the log, repairing a partial trailing write left by a crash.
    pub fn open(path: &Path) -> Result<Self, JsonlError> {
        if path.exists() {
            let kept = JsonlLog::<DeadLetterEntry>::repair(path)?;
            info!(path = %path.display(), entries = kept, "dead-letter log opened");
        }
        Ok(Self {
            path: path.to_path_buf(),
            log: Mutex::new(JsonlLog::open(path)?),
        })
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, JsonlLog<DeadLetterEntry>> {
        self.log.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Newest `limit` entries, newest first.
    pub fn list(&self, limit: usize) -> Result<Vec<DeadLetterEntry>, JsonlError> {
        let _guard = self.lock();
        let mut entries = JsonlLog::tail(&self.path, limit)?;
        entries.reverse();
        Ok(entries)
    }

    pub fn summaries(&self, limit: usize) -> Result<Vec<DeadLetterSummary>, JsonlError> {
        Ok(self.list(limit)?.iter().map(DeadLetterSummary::from).collect())
    }

    /// The newest entry whose range starts at `first`. A chunk that fails
    /// again after reprocessing is logged as a new entry with the same id.
    pub fn get(&self, first: u64) -> Result<Option<DeadLetterEntry>, JsonlError> {
        let _guard = self.lock();
        let entries = JsonlLog::<DeadLetterEntry>::replay(&self.path)?;
        Ok(entries.into_iter().rev().find(|e| e.id() == first))
    }

    /// Remove every entry whose range starts at `first`. Returns how many
    /// were removed.
    pub fn delete(&self, first: u64) -> Result<usize, JsonlError> {
        let mut log = self.lock();
        let entries = JsonlLog::<DeadLetterEntry>::replay(&self.path)?;
        let before = entries.len();
        let kept: Vec<_> = entries.into_iter().filter(|e| e.id() != first).collect();
        let removed = before - kept.len();
        if removed > 0 {
            log.replace(&kept)?;
            info!(first_sequence = first, removed, "dead letter deleted");
        }
        Ok(removed)
    }

    /// Stamp the newest entry starting at `first` as reprocessed. Returns the
    /// updated entry, or None if there is no such entry.
    pub fn mark_reprocessed(&self, first: u64, at: DateTime<Utc>) -> Result<Option<DeadLetterEntry>, JsonlError> {
        let mut log = self.lock();
        let mut entries = JsonlLog::<DeadLetterEntry>::replay(&self.path)?;
        let Some(entry) = entries.iter_mut().rev().find(|e| e.id() == first) else {
            return Ok(None);
        };
        entry.reprocessed_at = Some(at);
        let updated = entry.clone();
        log.replace(&entries)?;
        Ok(Some(updated))
    }

    pub fn stats(&self) -> Result<DeadLetterStats, JsonlError> {
        let _guard = self.lock();
        let entries = JsonlLog::<DeadLetterEntry>::replay(&self.path)?;

        let mut stats = DeadLetterStats::default();
        for entry in &entries {
            stats.entries += 1;
            stats.events += entry.letter.events.len();
            if entry.is_reprocessed() {
                stats.reprocessed += 1;
            } else {
                stats.pending += 1;
            }
            for event in &entry.letter.events {
                *stats.by_service.entry(event.service.clone()).or_default() += 1;
            }
            let at = entry.letter.dropped_at;
            stats.oldest_dropped_at = Some(stats.oldest_dropped_at.map_or(at, |t| t.min(at)));
            stats.newest_dropped_at = Some(stats.newest_dropped_at.map_or(at, |t| t.max(at)));
        }
        Ok(stats)
    }
}

impl DeadLetterSink for JsonlDeadLetterLog {
    fn record(&self, letter: &DeadLetter) -> Result<(), StorageError> {
        let entry = DeadLetterEntry {
            letter: letter.clone(),
            reprocessed_at: None,
        };
        self.lock().append(&entry)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use ingestd_core::{Event, NewEvent};
    use std::fs::OpenOptions;
    use std::io::Write;
    use tempfile::TempDir;

    fn letter(first: u64, last: u64) -> DeadLetter {
        let events: Vec<Event> = (first..=last)
            .map(|seq| Event::accept(seq, NewEvent::new("svc", "lost")))
            .collect();
        DeadLetter {
            range: SequenceRange { first, last },
            reason: "storage backend error: disk full".to_string(),
            attempts: 3,
            dropped_at: Utc::now(),
            events,
        }
    }

    fn open(dir: &TempDir) -> JsonlDeadLetterLog {
        JsonlDeadLetterLog::open(&dir.path().join("dead-letters.jsonl")).unwrap()
    }

    #[test]
    fn record_then_list_newest_first() {
        let dir = TempDir::new().unwrap();
        let log = open(&dir);

        log.record(&letter(1, 10)).unwrap();
        log.record(&letter(11, 20)).unwrap();
        log.record(&letter(21, 30)).unwrap();

        let newest = log.list(2).unwrap();
        assert_eq!(newest.len(), 2);
        assert_eq!(newest[0].id(), 21);
        assert_eq!(newest[1].id(), 11);
        assert_eq!(newest[0].letter.events.len(), 10);
        assert!(!newest[0].is_reprocessed());
    }

    #[test]
    fn summaries_omit_event_bodies() {
        let dir = TempDir::new().unwrap();
        let log = open(&dir);
        log.record(&letter(5, 9)).unwrap();

        let summaries = log.summaries(10).unwrap();
        assert_eq!(summaries[0].event_count, 5);
        let json = serde_json::to_value(&summaries[0]).unwrap();
        assert!(json.get("events").is_none());
        assert!(json["reprocessed_at"].is_null());
    }

    #[test]
    fn entries_written_without_status_still_parse() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("dead-letters.jsonl");
        let mut file = OpenOptions::new().create(true).append(true).open(&path).unwrap();
        writeln!(file, "{}", serde_json::to_string(&letter(1, 2)).unwrap()).unwrap();
        drop(file);

        let log = JsonlDeadLetterLog::open(&path).unwrap();
        let entry = log.get(1).unwrap().unwrap();
        assert_eq!(entry.letter.range, SequenceRange { first: 1, last: 2 });
        assert_eq!(entry.reprocessed_at, None);
    }

    #[test]
    fn get_finds_entry_by_first_sequence() {
        let dir = TempDir::new().unwrap();
        let log = open(&dir);
        log.record(&letter(1, 4)).unwrap();
        log.record(&letter(5, 8)).unwrap();

        let entry = log.get(5).unwrap().unwrap();
        assert_eq!(entry.letter.range.last, 8);
        assert!(log.get(2).unwrap().is_none());
    }

    #[test]
    fn delete_removes_entry_and_keeps_log_appendable() {
        let dir = TempDir::new().unwrap();
        let log = open(&dir);
        log.record(&letter(1, 4)).unwrap();
        log.record(&letter(5, 8)).unwrap();

        assert_eq!(log.delete(1).unwrap(), 1);
        assert_eq!(log.delete(1).unwrap(), 0);
        log.record(&letter(9, 12)).unwrap();

        let ids: Vec<u64> = log.list(10).unwrap().iter().map(|e| e.id()).collect();
        assert_eq!(ids, vec![9, 5]);
    }

    #[test]
    fn mark_reprocessed_stamps_newest_matching_entry() {
        let dir = TempDir::new().unwrap();
        let log = open(&dir);
        log.record(&letter(1, 4)).unwrap();
        log.record(&letter(5, 8)).unwrap();
        let at = Utc::now();

        let updated = log.mark_reprocessed(5, at).unwrap().unwrap();
        assert_eq!(updated.reprocessed_at, Some(at));
        assert!(log.get(5).unwrap().unwrap().is_reprocessed());
        assert!(!log.get(1).unwrap().unwrap().is_reprocessed());
        assert!(log.mark_reprocessed(99, at).unwrap().is_none());

        // A second failure of the same chunk is a fresh, pending entry
        log.record(&letter(5, 8)).unwrap();
        assert!(!log.get(5).unwrap().unwrap().is_reprocessed());
    }

    #[test]
    fn stats_count_status_and_services() {
        let dir = TempDir::new().unwrap();
        let log = open(&dir);
        assert_eq!(log.stats().unwrap(), DeadLetterStats::default());

        let mut older = letter(1, 2);
        older.dropped_at = Utc::now() - Duration::minutes(5);
        older.events[1].service = "billing".to_string();
        log.record(&older).unwrap();
        log.record(&letter(3, 5)).unwrap();
        log.mark_reprocessed(3, Utc::now()).unwrap();

        let stats = log.stats().unwrap();
        assert_eq!(stats.entries, 2);
        assert_eq!(stats.events, 5);
        assert_eq!(stats.pending, 1);
        assert_eq!(stats.reprocessed, 1);
        assert_eq!(stats.by_service.get("svc"), Some(&4));
        assert_eq!(stats.by_service.get("billing"), Some(&1));
        assert_eq!(stats.oldest_dropped_at, Some(older.dropped_at));
        assert!(stats.newest_dropped_at > stats.oldest_dropped_at);
    }

    #[test]
    fn reopen_repairs_truncated_entry() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("dead-letters.jsonl");
        {
            let log = JsonlDeadLetterLog::open(&path).unwrap();
            log.record(&letter(1, 2)).unwrap();
        }
        let mut file = OpenOptions::new().append(true).open(&path).unwrap();
        write!(file, r#"{{"range":{{"first":3"#).unwrap();
        drop(file);

        let log = JsonlDeadLetterLog::open(&path).unwrap();
        log.record(&letter(3, 4)).unwrap();

        let all = log.list(10).unwrap();
        assert_eq!(all.len(), 2);
        assert_eq!(all[0].id(), 3);
    }
}

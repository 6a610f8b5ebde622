// ABOUTME: In-memory collaborators for exercising the pipeline without a real backend.
// ABOUTME: Storage can be scripted to fail, stay down, or reject chunks containing a given sequence.

use std::collections::BTreeMap;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};

use async_trait::async_trait;

use crate::checkpoint::{Checkpoint, CheckpointError, CheckpointStore};
use crate::event::Event;
use crate::storage::{BufferSpill, DeadLetter, DeadLetterSink, EventStorage, StorageError};

/// Event storage keyed by sequence, so redelivered chunks are absorbed.
#[derive(Debug, Default)]
pub struct MemoryStorage {
    events: Mutex<BTreeMap<u64, Event>>,
    chunk_sizes: Mutex<Vec<usize>>,
    poisoned: Mutex<Vec<u64>>,
    calls: AtomicU64,
    fail_next: AtomicU32,
    down: AtomicBool,
}

impl MemoryStorage {
    /// Fail the next `count` writes.
    pub fn fail_next(&self, count: u32) {
        self.fail_next.store(count, Ordering::SeqCst);
    }

    /// Fail every write of a chunk containing `sequence`.
    pub fn poison(&self, sequence: u64) {
        self.poisoned.lock().unwrap_or_else(|e| e.into_inner()).push(sequence);
    }

    /// Fail every write while down.
    pub fn set_down(&self, down: bool) {
        self.down.store(down, Ordering::SeqCst);
    }

    pub fn calls(&self) -> u64 {
        self.calls.load(Ordering::SeqCst)
    }

    /// Stored sequences in ascending order.
    pub fn sequences(&self) -> Vec<u64> {
        self.events
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .keys()
            .copied()
            .collect()
    }

    /// Sizes of the chunks accepted so far, in write order.
    pub fn chunk_sizes(&self) -> Vec<usize> {
        self.chunk_sizes.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub fn events(&self) -> Vec<Event> {
        self.events
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .values()
            .cloned()
            .collect()
    }
}

#[async_trait]
impl EventStorage for MemoryStorage {
    async fn write_chunk(&self, events: &[Event]) -> Result<(), StorageError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.down.load(Ordering::SeqCst) {
            return Err(StorageError::Unavailable("storage is down".to_string()));
        }
        let scripted = self
            .fail_next
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1));
        if scripted.is_ok() {
            return Err(StorageError::Unavailable("scripted failure".to_string()));
        }
        {
            let poisoned = self.poisoned.lock().unwrap_or_else(|e| e.into_inner());
            if let Some(seq) = events.iter().map(|e| e.sequence).find(|s| poisoned.contains(s)) {
                return Err(StorageError::Backend(format!("sequence {} rejected", seq)));
            }
        }

        let mut stored = self.events.lock().unwrap_or_else(|e| e.into_inner());
        for event in events {
            stored.entry(event.sequence).or_insert_with(|| event.clone());
        }
        self.chunk_sizes
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(events.len());
        Ok(())
    }

    async fn last_sequence(&self) -> Result<Option<u64>, StorageError> {
        Ok(self
            .events
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .keys()
            .next_back()
            .copied())
    }
}

#[derive(Debug, Default)]
pub struct MemoryCheckpointStore {
    value: Mutex<Option<Checkpoint>>,
    writes: AtomicU64,
    fail_writes: AtomicBool,
}

impl MemoryCheckpointStore {
    pub fn with_value(checkpoint: Checkpoint) -> Self {
        Self {
            value: Mutex::new(Some(checkpoint)),
            ..Default::default()
        }
    }

    pub fn fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    pub fn stored(&self) -> Option<Checkpoint> {
        *self.value.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Successful writes so far.
    pub fn writes(&self) -> u64 {
        self.writes.load(Ordering::SeqCst)
    }
}

impl CheckpointStore for MemoryCheckpointStore {
    fn read(&self) -> Result<Option<Checkpoint>, CheckpointError> {
        Ok(self.stored())
    }

    fn write(&self, checkpoint: &Checkpoint) -> Result<(), CheckpointError> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(CheckpointError::Store("scripted failure".to_string()));
        }
        *self.value.lock().unwrap_or_else(|e| e.into_inner()) = Some(*checkpoint);
        self.writes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

#[derive(Debug, Default)]
pub struct MemoryDeadLetters {
    letters: Mutex<Vec<DeadLetter>>,
}

impl MemoryDeadLetters {
    pub fn letters(&self) -> Vec<DeadLetter> {
        self.letters.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }
}

impl DeadLetterSink for MemoryDeadLetters {
    fn record(&self, letter: &DeadLetter) -> Result<(), StorageError> {
        self.letters
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(letter.clone());
        Ok(())
    }
}

#[derive(Debug, Default)]
pub struct MemorySpill {
    events: Mutex<Vec<Event>>,
}

impl MemorySpill {
    pub fn with_events(events: Vec<Event>) -> Self {
        Self {
            events: Mutex::new(events),
        }
    }

    pub fn contents(&self) -> Vec<Event> {
        self.events.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }
}

impl BufferSpill for MemorySpill {
    fn save(&self, events: &[Event]) -> Result<(), StorageError> {
        *self.events.lock().unwrap_or_else(|e| e.into_inner()) = events.to_vec();
        Ok(())
    }

    fn take(&self) -> Result<Vec<Event>, StorageError> {
        Ok(std::mem::take(
            &mut *self.events.lock().unwrap_or_else(|e| e.into_inner()),
        ))
    }
}

// ABOUTME: Background task that drains the buffer in chunks and persists them through the circuit breaker.
// ABOUTME: Handles retry with backoff, explicit drops with dead-lettering, checkpoint commits, and graceful shutdown.

use std::sync::Arc;
use std::sync::atomic::{AtomicU8, AtomicU64, Ordering};
use std::time::Duration;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use crate::buffer::{Chunk, EventBuffer};
use crate::checkpoint::{Checkpoint, CheckpointManager};
use crate::circuit::{CircuitBreaker, CircuitError};
use crate::config::{PipelineConfig, WorkerConfig};
use crate::event::SequenceRange;
use crate::storage::{DeadLetter, DeadLetterSink, EventStorage, StorageError};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerPhase {
    Idle,
    Draining,
    Persisting,
    Committing,
    Retrying,
    Dropping,
    Stopped,
}

impl WorkerPhase {
    fn from_u8(value: u8) -> Self {
        match value {
            1 => WorkerPhase::Draining,
            2 => WorkerPhase::Persisting,
            3 => WorkerPhase::Committing,
            4 => WorkerPhase::Retrying,
            5 => WorkerPhase::Dropping,
            6 => WorkerPhase::Stopped,
            _ => WorkerPhase::Idle,
        }
    }
}

/// Counters shared between the worker task and readers such as the
/// metrics aggregator.
#[derive(Debug, Default)]
pub struct WorkerStats {
    phase: AtomicU8,
    events_persisted: AtomicU64,
    chunks_persisted: AtomicU64,
    events_dropped: AtomicU64,
    chunks_dropped: AtomicU64,
    persist_failures: AtomicU64,
    circuit_rejections: AtomicU64,
    checkpoint_failures: AtomicU64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkerSnapshot {
    pub phase: WorkerPhase,
    pub events_persisted: u64,
    pub chunks_persisted: u64,
    pub events_dropped: u64,
    pub chunks_dropped: u64,
    pub persist_failures: u64,
    pub circuit_rejections: u64,
    pub checkpoint_failures: u64,
}

impl WorkerStats {
    pub fn phase(&self) -> WorkerPhase {
        WorkerPhase::from_u8(self.phase.load(Ordering::Relaxed))
    }

    fn set_phase(&self, phase: WorkerPhase) {
        self.phase.store(phase as u8, Ordering::Relaxed);
    }

    pub fn events_persisted(&self) -> u64 {
        self.events_persisted.load(Ordering::Relaxed)
    }

    /// Total events lost; this is the pipeline's `totalDropped`.
    pub fn events_dropped(&self) -> u64 {
        self.events_dropped.load(Ordering::Relaxed)
    }

    /// Count events lost outside the worker's own drop path, such as spill
    /// overflow during recovery.
    pub fn record_dropped(&self, events: u64) {
        self.events_dropped.fetch_add(events, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> WorkerSnapshot {
        WorkerSnapshot {
            phase: self.phase(),
            events_persisted: self.events_persisted(),
            chunks_persisted: self.chunks_persisted.load(Ordering::Relaxed),
            events_dropped: self.events_dropped(),
            chunks_dropped: self.chunks_dropped.load(Ordering::Relaxed),
            persist_failures: self.persist_failures.load(Ordering::Relaxed),
            circuit_rejections: self.circuit_rejections.load(Ordering::Relaxed),
            checkpoint_failures: self.checkpoint_failures.load(Ordering::Relaxed),
        }
    }
}

/// Summary returned once the worker has stopped.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct WorkerReport {
    /// Events persisted after shutdown was requested.
    pub drained_on_shutdown: u64,
    /// Events still queued when the worker exited.
    pub remaining: usize,
    pub timed_out: bool,
    pub checkpoint: Checkpoint,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ChunkOutcome {
    Empty,
    Committed,
    Dropped,
    CircuitOpen,
    /// The shutdown deadline passed; the chunk went back to the buffer.
    Deferred,
}

pub struct BatchWorker {
    buffer: Arc<EventBuffer>,
    circuit: Arc<CircuitBreaker>,
    checkpoints: Arc<CheckpointManager>,
    storage: Arc<dyn EventStorage>,
    dead_letters: Option<Arc<dyn DeadLetterSink>>,
    stats: Arc<WorkerStats>,
    config: WorkerConfig,
    circuit_timeout: Duration,
    /// Failed write attempts for the chunk starting at this sequence.
    attempts: Option<(u64, u32)>,
}

impl BatchWorker {
    pub fn new(
        buffer: Arc<EventBuffer>,
        circuit: Arc<CircuitBreaker>,
        checkpoints: Arc<CheckpointManager>,
        storage: Arc<dyn EventStorage>,
        config: &PipelineConfig,
    ) -> Self {
        Self {
            buffer,
            circuit,
            checkpoints,
            storage,
            dead_letters: None,
            stats: Arc::new(WorkerStats::default()),
            config: config.worker.clone(),
            circuit_timeout: config.circuit.timeout(),
            attempts: None,
        }
    }

    pub fn with_dead_letters(mut self, sink: Arc<dyn DeadLetterSink>) -> Self {
        self.dead_letters = Some(sink);
        self
    }

    /// Share externally owned counters, e.g. with a metrics aggregator built
    /// before the worker.
    pub fn with_stats(mut self, stats: Arc<WorkerStats>) -> Self {
        self.stats = stats;
        self
    }

    pub fn stats(&self) -> Arc<WorkerStats> {
        Arc::clone(&self.stats)
    }

    /// Run the worker on the current tokio runtime.
    pub fn spawn(self) -> WorkerHandle {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let stats = self.stats();
        let task = tokio::spawn(self.run(shutdown_rx));
        WorkerHandle {
            shutdown_tx,
            task,
            stats,
        }
    }

    async fn run(mut self, mut shutdown: watch::Receiver<bool>) -> WorkerReport {
        let mut ticker = tokio::time::interval(self.config.flush_interval());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // The first tick completes immediately
        ticker.tick().await;

        info!(
            chunk_size = self.config.batch_chunk_size,
            flush_interval_ms = self.config.flush_interval_ms,
            "batch worker started"
        );

        'run: loop {
            tokio::select! {
                _ = ticker.tick() => {}
                _ = self.buffer.chunk_ready() => {}
                _ = shutdown.changed() => break,
            }
            if *shutdown.borrow() {
                break;
            }

            // A rejected chunk is retried as soon as the breaker timeout has
            // passed, not on the following tick
            while let Some(pause) = self.drain(&shutdown).await {
                tokio::select! {
                    _ = tokio::time::sleep(pause) => {}
                    _ = shutdown.changed() => break 'run,
                }
                if *shutdown.borrow() {
                    break 'run;
                }
            }
        }

        self.finish().await
    }

    /// Persist chunks until the buffer is empty. Returns how long to back
    /// off when the circuit rejected a chunk.
    async fn drain(&mut self, shutdown: &watch::Receiver<bool>) -> Option<Duration> {
        self.stats.set_phase(WorkerPhase::Draining);
        let pause = loop {
            match self.process_next_chunk(None).await {
                ChunkOutcome::Empty | ChunkOutcome::Deferred => break None,
                ChunkOutcome::Committed | ChunkOutcome::Dropped => {
                    if *shutdown.borrow() {
                        break None;
                    }
                }
                ChunkOutcome::CircuitOpen => break Some(self.circuit_timeout),
            }
        };
        self.stats.set_phase(WorkerPhase::Idle);
        pause
    }

    async fn process_next_chunk(&mut self, deadline: Option<Instant>) -> ChunkOutcome {
        let Some(chunk) = self.buffer.dequeue_chunk(self.config.batch_chunk_size) else {
            return ChunkOutcome::Empty;
        };
        let range = chunk.range();
        let mut attempts = match self.attempts {
            Some((first, n)) if first == range.first => n,
            _ => 0,
        };

        loop {
            self.stats.set_phase(WorkerPhase::Persisting);
            let result = {
                let write = self
                    .circuit
                    .execute(|| self.storage.write_chunk(chunk.events()));
                match deadline {
                    Some(at) => tokio::time::timeout_at(at, write).await.ok(),
                    None => Some(write.await),
                }
            };
            let Some(result) = result else {
                self.attempts = Some((range.first, attempts));
                self.buffer.requeue_front(chunk);
                return ChunkOutcome::Deferred;
            };

            match result {
                Ok(()) => {
                    self.attempts = None;
                    return self.commit(chunk, range).await;
                }
                Err(CircuitError::Open) => {
                    self.attempts = Some((range.first, attempts));
                    self.stats.circuit_rejections.fetch_add(1, Ordering::Relaxed);
                    self.buffer.requeue_front(chunk);
                    warn!(
                        first_sequence = range.first,
                        last_sequence = range.last,
                        "circuit open, chunk requeued"
                    );
                    return ChunkOutcome::CircuitOpen;
                }
                Err(CircuitError::Inner(err)) => {
                    attempts += 1;
                    self.stats.persist_failures.fetch_add(1, Ordering::Relaxed);
                    if attempts >= self.config.max_persist_attempts {
                        self.attempts = None;
                        return self.drop_chunk(chunk, range, attempts, &err).await;
                    }

                    let delay = self.config.retry_delay(attempts);
                    if deadline.is_some_and(|at| Instant::now() + delay >= at) {
                        self.attempts = Some((range.first, attempts));
                        self.buffer.requeue_front(chunk);
                        return ChunkOutcome::Deferred;
                    }

                    self.stats.set_phase(WorkerPhase::Retrying);
                    warn!(
                        first_sequence = range.first,
                        last_sequence = range.last,
                        attempt = attempts,
                        max_attempts = self.config.max_persist_attempts,
                        delay_ms = delay.as_millis() as u64,
                        error = %err,
                        "chunk persist failed, retrying"
                    );
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }

    async fn commit(&self, chunk: Chunk, range: SequenceRange) -> ChunkOutcome {
        self.stats.set_phase(WorkerPhase::Committing);
        let checkpoints = Arc::clone(&self.checkpoints);
        let committed = tokio::task::spawn_blocking(move || checkpoints.commit(range.last))
            .await
            .map_err(|e| e.to_string())
            .and_then(|result| result.map_err(|e| e.to_string()));
        if let Err(e) = committed {
            self.stats.checkpoint_failures.fetch_add(1, Ordering::Relaxed);
            error!(
                sequence = range.last,
                error = %e,
                "checkpoint commit failed; persisted chunk may be replayed after a crash"
            );
        }

        let persisted = self.buffer.settle(chunk).len() as u64;
        self.stats.events_persisted.fetch_add(persisted, Ordering::Relaxed);
        self.stats.chunks_persisted.fetch_add(1, Ordering::Relaxed);
        debug!(
            first_sequence = range.first,
            last_sequence = range.last,
            chunk_len = persisted,
            "chunk persisted"
        );
        ChunkOutcome::Committed
    }

    async fn drop_chunk(
        &self,
        chunk: Chunk,
        range: SequenceRange,
        attempts: u32,
        err: &StorageError,
    ) -> ChunkOutcome {
        self.stats.set_phase(WorkerPhase::Dropping);
        let events = self.buffer.settle(chunk);
        let dropped = events.len() as u64;
        self.stats.record_dropped(dropped);
        self.stats.chunks_dropped.fetch_add(1, Ordering::Relaxed);
        error!(
            first_sequence = range.first,
            last_sequence = range.last,
            chunk_len = dropped,
            attempts,
            error = %err,
            "dropping chunk after exhausting persist attempts; events lost"
        );

        if let Some(sink) = &self.dead_letters {
            let letter = DeadLetter {
                range,
                reason: err.to_string(),
                attempts,
                dropped_at: Utc::now(),
                events,
            };
            let sink = Arc::clone(sink);
            let recorded = tokio::task::spawn_blocking(move || sink.record(&letter))
                .await
                .map_err(|e| e.to_string())
                .and_then(|result| result.map_err(|e| e.to_string()));
            if let Err(e) = recorded {
                warn!(
                    first_sequence = range.first,
                    last_sequence = range.last,
                    error = %e,
                    "failed to record dead letter"
                );
            }
        }
        ChunkOutcome::Dropped
    }

    /// Graceful stop: refuse new events, drain within the shutdown timeout,
    /// and make a final attempt at any pending checkpoint.
    async fn finish(mut self) -> WorkerReport {
        self.buffer.close();
        let deadline = Instant::now() + self.config.shutdown_timeout();
        let persisted_before = self.stats.events_persisted();
        info!(
            queued = self.buffer.queued(),
            timeout_ms = self.config.shutdown_timeout_ms,
            "batch worker draining for shutdown"
        );

        let mut timed_out = false;
        loop {
            if Instant::now() >= deadline {
                timed_out = self.buffer.queued() > 0;
                break;
            }
            match self.process_next_chunk(Some(deadline)).await {
                ChunkOutcome::Empty => break,
                ChunkOutcome::Committed | ChunkOutcome::Dropped => {}
                ChunkOutcome::CircuitOpen => {
                    let wake = (Instant::now() + self.circuit_timeout).min(deadline);
                    tokio::time::sleep_until(wake).await;
                }
                ChunkOutcome::Deferred => {
                    timed_out = true;
                    break;
                }
            }
        }

        if let Err(e) = self.checkpoints.flush() {
            error!(error = %e, "final checkpoint commit failed");
        }
        self.stats.set_phase(WorkerPhase::Stopped);

        let report = WorkerReport {
            drained_on_shutdown: self.stats.events_persisted() - persisted_before,
            remaining: self.buffer.queued(),
            timed_out,
            checkpoint: self.checkpoints.current(),
        };
        info!(
            drained = report.drained_on_shutdown,
            remaining = report.remaining,
            timed_out = report.timed_out,
            last_flushed_sequence = report.checkpoint.last_flushed_sequence,
            "batch worker stopped"
        );
        report
    }
}

/// Owner side of a spawned worker.
pub struct WorkerHandle {
    shutdown_tx: watch::Sender<bool>,
    task: JoinHandle<WorkerReport>,
    stats: Arc<WorkerStats>,
}

impl WorkerHandle {
    pub fn stats(&self) -> Arc<WorkerStats> {
        Arc::clone(&self.stats)
    }

    /// Signal shutdown and wait for the final drain to finish. Returns None
    /// if the worker task panicked.
    pub async fn shutdown(self) -> Option<WorkerReport> {
        let _ = self.shutdown_tx.send(true);
        match self.task.await {
            Ok(report) => Some(report),
            Err(e) => {
                error!(error = %e, "batch worker task failed");
                None
            }
        }
    }
}

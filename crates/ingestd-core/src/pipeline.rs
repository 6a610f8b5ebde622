// ABOUTME: Wires buffer, circuit breaker, checkpoints, worker, metrics, and admission into one running pipeline.
// ABOUTME: Performs crash recovery on start and spills unpersisted events on shutdown.

use std::sync::Arc;

use serde::Serialize;
use thiserror::Error;
use tokio::sync::Mutex as AsyncMutex;
use tracing::{error, info, warn};

use crate::admission::{Admission, AdmissionGate};
use crate::buffer::{EventBuffer, ReinsertError};
use crate::checkpoint::{Checkpoint, CheckpointError, CheckpointManager, CheckpointStore};
use crate::circuit::CircuitBreaker;
use crate::config::{ConfigError, PipelineConfig};
use crate::event::{Event, NewEvent, SequenceRange};
use crate::metrics::{MetricsAggregator, MetricsSnapshot};
use crate::storage::{BufferSpill, DeadLetterSink, EventStorage, StorageError};
use crate::worker::{BatchWorker, WorkerHandle, WorkerReport, WorkerStats};

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("invalid configuration: {0}")]
    Config(#[from] ConfigError),

    #[error("checkpoint recovery failed: {0}")]
    Checkpoint(#[from] CheckpointError),

    #[error("storage recovery failed: {0}")]
    Storage(#[from] StorageError),
}

/// External collaborators the pipeline persists into.
#[derive(Clone)]
pub struct Collaborators {
    pub storage: Arc<dyn EventStorage>,
    pub checkpoints: Arc<dyn CheckpointStore>,
    pub dead_letters: Option<Arc<dyn DeadLetterSink>>,
    pub spill: Option<Arc<dyn BufferSpill>>,
}

/// What startup recovery found and did.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RecoveryReport {
    pub checkpoint: Checkpoint,
    pub storage_high_water: Option<u64>,
    pub restored: usize,
    pub discarded_already_flushed: usize,
    pub overflow_dropped: usize,
    pub next_sequence: u64,
}

pub struct Pipeline {
    config: PipelineConfig,
    buffer: Arc<EventBuffer>,
    circuit: Arc<CircuitBreaker>,
    checkpoints: Arc<CheckpointManager>,
    stats: Arc<WorkerStats>,
    metrics: Arc<MetricsAggregator>,
    gate: AdmissionGate,
    spill: Option<Arc<dyn BufferSpill>>,
    worker: AsyncMutex<Option<WorkerHandle>>,
    recovery: RecoveryReport,
}

impl Pipeline {
    /// Recover state from the collaborators and start the batch worker.
    /// Must be called from within a tokio runtime.
    pub async fn start(config: PipelineConfig, collaborators: Collaborators) -> Result<Self, PipelineError> {
        config.validate()?;

        let checkpoints = Arc::new(CheckpointManager::new(collaborators.checkpoints));
        let checkpoint = checkpoints.load()?;
        let flushed = checkpoint.last_flushed_sequence;

        let spilled = match &collaborators.spill {
            Some(spill) => spill.take()?,
            None => Vec::new(),
        };
        let spilled_total = spilled.len();
        let pending: Vec<_> = spilled.into_iter().filter(|e| e.sequence > flushed).collect();
        let discarded = spilled_total - pending.len();

        let storage_high_water = collaborators.storage.last_sequence().await?;
        let spill_high_water = pending.iter().map(|e| e.sequence).max();
        let high_water = [Some(flushed), spill_high_water, storage_high_water]
            .into_iter()
            .flatten()
            .max()
            .unwrap_or(0);

        let buffer = Arc::new(EventBuffer::starting_at(&config, high_water + 1));
        let restored = pending.len();
        let overflow = buffer.restore(pending);

        let stats = Arc::new(WorkerStats::default());
        if let Some(range) = SequenceRange::of(&overflow) {
            stats.record_dropped(overflow.len() as u64);
            error!(
                first_sequence = range.first,
                last_sequence = range.last,
                chunk_len = overflow.len(),
                "spilled events exceed buffer capacity; events lost"
            );
        }

        let recovery = RecoveryReport {
            checkpoint,
            storage_high_water,
            restored: restored - overflow.len(),
            discarded_already_flushed: discarded,
            overflow_dropped: overflow.len(),
            next_sequence: buffer.next_sequence(),
        };
        info!(
            last_flushed_sequence = flushed,
            storage_high_water = ?storage_high_water,
            restored = recovery.restored,
            discarded = recovery.discarded_already_flushed,
            overflow = recovery.overflow_dropped,
            next_sequence = recovery.next_sequence,
            "pipeline recovered"
        );

        let circuit = Arc::new(CircuitBreaker::new("storage", config.circuit.clone()));
        let metrics = Arc::new(MetricsAggregator::new(
            Arc::clone(&buffer),
            Arc::clone(&circuit),
            Arc::clone(&stats),
            config.metrics.clone(),
        ));
        let gate = AdmissionGate::new(
            Arc::clone(&buffer),
            Arc::clone(&circuit),
            Arc::clone(&metrics),
            &config.admission,
        );

        let mut worker = BatchWorker::new(
            Arc::clone(&buffer),
            Arc::clone(&circuit),
            Arc::clone(&checkpoints),
            collaborators.storage,
            &config,
        )
        .with_stats(Arc::clone(&stats));
        if let Some(sink) = collaborators.dead_letters {
            worker = worker.with_dead_letters(sink);
        }
        let handle = worker.spawn();

        Ok(Self {
            config,
            buffer,
            circuit,
            checkpoints,
            stats,
            metrics,
            gate,
            spill: collaborators.spill,
            worker: AsyncMutex::new(Some(handle)),
            recovery,
        })
    }

    /// Offer one validated event to the pipeline.
    pub fn admit(&self, payload: NewEvent) -> Admission {
        self.gate.admit(payload)
    }

    /// Hand previously dropped events back to the worker for another
    /// persistence attempt. They keep their sequence numbers, so storage
    /// deduplicates anything that did land earlier.
    pub fn reprocess(&self, events: Vec<Event>) -> Result<usize, ReinsertError> {
        let range = SequenceRange::of(&events);
        let count = self.buffer.reinsert(events)?;
        if let Some(range) = range {
            info!(
                first_sequence = range.first,
                last_sequence = range.last,
                chunk_len = count,
                "dead-lettered events requeued"
            );
        }
        Ok(count)
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        self.metrics.snapshot()
    }

    pub fn is_shutting_down(&self) -> bool {
        self.buffer.is_closed()
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    pub fn buffer(&self) -> &Arc<EventBuffer> {
        &self.buffer
    }

    pub fn circuit(&self) -> &Arc<CircuitBreaker> {
        &self.circuit
    }

    pub fn checkpoints(&self) -> &Arc<CheckpointManager> {
        &self.checkpoints
    }

    pub fn metrics(&self) -> &Arc<MetricsAggregator> {
        &self.metrics
    }

    pub fn gate(&self) -> &AdmissionGate {
        &self.gate
    }

    pub fn recovery(&self) -> &RecoveryReport {
        &self.recovery
    }

    /// Stop the worker gracefully, then spill anything left in the buffer so
    /// the next start replays it. Returns None if already shut down.
    pub async fn shutdown(&self) -> Option<WorkerReport> {
        let handle = self.worker.lock().await.take()?;
        self.buffer.close();
        let report = handle.shutdown().await;

        let remaining = self.buffer.take_remaining();
        if let Some(range) = SequenceRange::of(&remaining) {
            match &self.spill {
                Some(spill) => match spill.save(&remaining) {
                    Ok(()) => info!(
                        first_sequence = range.first,
                        last_sequence = range.last,
                        chunk_len = remaining.len(),
                        "spilled unpersisted events for next start"
                    ),
                    Err(e) => {
                        self.stats.record_dropped(remaining.len() as u64);
                        error!(
                            first_sequence = range.first,
                            last_sequence = range.last,
                            chunk_len = remaining.len(),
                            error = %e,
                            "failed to spill unpersisted events; events lost"
                        );
                    }
                },
                None => {
                    self.stats.record_dropped(remaining.len() as u64);
                    warn!(
                        first_sequence = range.first,
                        last_sequence = range.last,
                        chunk_len = remaining.len(),
                        "no spill configured; unpersisted events lost"
                    );
                }
            }
        }
        report
    }
}

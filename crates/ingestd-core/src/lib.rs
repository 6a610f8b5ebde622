// ABOUTME: Core library for ingestd: bounded buffering, backpressure, batch persistence, and recovery.
// ABOUTME: Storage backends and the HTTP surface live in sibling crates and plug in through the traits here.

pub mod admission;
pub mod buffer;
pub mod checkpoint;
pub mod circuit;
pub mod config;
pub mod event;
pub mod metrics;
pub mod pipeline;
pub mod rate;
pub mod storage;
pub mod testing;
pub mod worker;

pub use admission::{Admission, AdmissionGate, UnavailableReason};
pub use buffer::{Chunk, EventBuffer, ReinsertError};
pub use checkpoint::{Checkpoint, CheckpointError, CheckpointManager, CheckpointStore};
pub use circuit::{CircuitBreaker, CircuitError, CircuitSnapshot, CircuitState};
pub use config::{ConfigError, PipelineConfig};
pub use event::{Event, NewEvent, SequenceRange};
pub use metrics::{HealthStatus, MetricsAggregator, MetricsSnapshot};
pub use pipeline::{Collaborators, Pipeline, PipelineError, RecoveryReport};
pub use storage::{BufferSpill, DeadLetter, DeadLetterSink, EventStorage, StorageError};
pub use worker::{BatchWorker, WorkerHandle, WorkerPhase, WorkerReport, WorkerSnapshot, WorkerStats};

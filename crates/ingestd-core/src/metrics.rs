// ABOUTME: Read-only aggregation of buffer, worker, and circuit state into a health snapshot.
// ABOUTME: Classifies overall status from utilization and circuit state.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::time::Instant;

use crate::buffer::EventBuffer;
use crate::circuit::{CircuitBreaker, CircuitSnapshot, CircuitState};
use crate::config::MetricsConfig;
use crate::worker::{WorkerSnapshot, WorkerStats};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Healthy,
    Warning,
    Critical,
}

impl HealthStatus {
    /// An open circuit or utilization at or above the critical threshold is
    /// critical; at or above the warning threshold is a warning.
    pub fn classify(utilization_percent: f64, circuit: CircuitState, config: &MetricsConfig) -> Self {
        if circuit == CircuitState::Open || utilization_percent >= config.critical_utilization_percent {
            HealthStatus::Critical
        } else if utilization_percent >= config.warning_utilization_percent {
            HealthStatus::Warning
        } else {
            HealthStatus::Healthy
        }
    }
}

/// `dropped / (enqueued + dropped) * 100`, or 0 when nothing was dropped.
pub fn drop_rate_percent(total_enqueued: u64, total_dropped: u64) -> f64 {
    if total_dropped == 0 {
        return 0.0;
    }
    total_dropped as f64 * 100.0 / (total_enqueued + total_dropped) as f64
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BufferMetrics {
    pub size: usize,
    pub capacity: usize,
    pub utilization_percent: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FlowMetrics {
    pub total_enqueued: u64,
    pub total_dropped: u64,
    pub total_rejected: u64,
    pub drop_rate_percent: f64,
    pub throughput_events_per_second: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricsSnapshot {
    pub status: HealthStatus,
    pub buffer: BufferMetrics,
    pub metrics: FlowMetrics,
    pub circuit: CircuitSnapshot,
    pub worker: WorkerSnapshot,
    pub uptime_seconds: f64,
}

pub struct MetricsAggregator {
    buffer: Arc<EventBuffer>,
    circuit: Arc<CircuitBreaker>,
    worker: Arc<WorkerStats>,
    config: MetricsConfig,
    started_at: Instant,
}

impl MetricsAggregator {
    pub fn new(
        buffer: Arc<EventBuffer>,
        circuit: Arc<CircuitBreaker>,
        worker: Arc<WorkerStats>,
        config: MetricsConfig,
    ) -> Self {
        Self {
            buffer,
            circuit,
            worker,
            config,
            started_at: Instant::now(),
        }
    }

    fn utilization_percent(&self) -> (usize, f64) {
        let size = self.buffer.len();
        let percent = (size as f64 * 100.0) / self.buffer.capacity() as f64;
        (size, percent)
    }

    /// Current status without building a full snapshot.
    pub fn status(&self) -> HealthStatus {
        let (_, percent) = self.utilization_percent();
        HealthStatus::classify(percent, self.circuit.state(), &self.config)
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        let (size, utilization_percent) = self.utilization_percent();
        let circuit = self.circuit.snapshot();
        let worker = self.worker.snapshot();
        let total_enqueued = self.buffer.total_enqueued();
        let total_dropped = worker.events_dropped;

        MetricsSnapshot {
            status: HealthStatus::classify(utilization_percent, circuit.state, &self.config),
            buffer: BufferMetrics {
                size,
                capacity: self.buffer.capacity(),
                utilization_percent,
            },
            metrics: FlowMetrics {
                total_enqueued,
                total_dropped,
                total_rejected: self.buffer.total_rejected(),
                drop_rate_percent: drop_rate_percent(total_enqueued, total_dropped),
                throughput_events_per_second: self.buffer.throughput_per_second(),
            },
            circuit,
            worker,
            uptime_seconds: Instant::now().duration_since(self.started_at).as_secs_f64(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PipelineConfig;
    use crate::event::NewEvent;

    fn aggregator(capacity: usize) -> (Arc<EventBuffer>, Arc<CircuitBreaker>, Arc<WorkerStats>, MetricsAggregator) {
        let mut config = PipelineConfig::default();
        config.buffer.capacity = capacity;
        config.worker.batch_chunk_size = 1;
        config.circuit.failure_threshold = 1;
        let buffer = Arc::new(EventBuffer::new(&config));
        let circuit = Arc::new(CircuitBreaker::new("storage", config.circuit.clone()));
        let stats = Arc::new(WorkerStats::default());
        let metrics = MetricsAggregator::new(
            Arc::clone(&buffer),
            Arc::clone(&circuit),
            Arc::clone(&stats),
            config.metrics,
        );
        (buffer, circuit, stats, metrics)
    }

    #[test]
    fn classify_thresholds() {
        let config = MetricsConfig::default();
        assert_eq!(HealthStatus::classify(69.9, CircuitState::Closed, &config), HealthStatus::Healthy);
        assert_eq!(HealthStatus::classify(70.0, CircuitState::Closed, &config), HealthStatus::Warning);
        assert_eq!(HealthStatus::classify(90.0, CircuitState::HalfOpen, &config), HealthStatus::Critical);
        assert_eq!(HealthStatus::classify(0.0, CircuitState::Open, &config), HealthStatus::Critical);
    }

    #[test]
    fn drop_rate_handles_zero_enqueued() {
        assert_eq!(drop_rate_percent(0, 0), 0.0);
        assert_eq!(drop_rate_percent(500, 0), 0.0);
        assert_eq!(drop_rate_percent(150, 50), 25.0);
    }

    #[tokio::test(start_paused = true)]
    async fn snapshot_reflects_buffer_and_counters() {
        let (buffer, _, stats, metrics) = aggregator(10);
        for n in 0..8 {
            buffer.enqueue(NewEvent::new("svc", format!("{}", n)));
        }
        stats.record_dropped(2);

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.status, HealthStatus::Warning);
        assert_eq!(snapshot.buffer.size, 8);
        assert_eq!(snapshot.buffer.capacity, 10);
        assert_eq!(snapshot.buffer.utilization_percent, 80.0);
        assert_eq!(snapshot.metrics.total_enqueued, 8);
        assert_eq!(snapshot.metrics.total_dropped, 2);
        assert_eq!(snapshot.metrics.drop_rate_percent, 20.0);
    }

    #[tokio::test(start_paused = true)]
    async fn open_circuit_is_critical_even_when_empty() {
        let (_, circuit, _, metrics) = aggregator(10);
        let _ = circuit.execute(|| async { Err::<(), &str>("down") }).await;

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.status, HealthStatus::Critical);
        assert_eq!(snapshot.circuit.state, CircuitState::Open);
    }

    #[tokio::test(start_paused = true)]
    async fn snapshot_serializes_documented_shape() {
        let (_, _, _, metrics) = aggregator(10);
        let json = serde_json::to_value(metrics.snapshot()).unwrap();

        assert_eq!(json["status"], "healthy");
        assert!(json["buffer"]["utilization_percent"].is_number());
        assert!(json["metrics"]["drop_rate_percent"].is_number());
        assert!(json["metrics"]["throughput_events_per_second"].is_number());
        assert_eq!(json["circuit"]["state"], "CLOSED");
    }
}

// ABOUTME: Admission outcomes returned to producers and the gate that sheds load when the pipeline is unhealthy.
// ABOUTME: The gate consults circuit state and sustained critical status before delegating to the buffer.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tracing::warn;
use ulid::Ulid;

use crate::buffer::EventBuffer;
use crate::circuit::{CircuitBreaker, CircuitState};
use crate::config::AdmissionConfig;
use crate::event::NewEvent;
use crate::metrics::{HealthStatus, MetricsAggregator};

/// Result of offering one event to the pipeline.
#[derive(Debug, Clone, PartialEq)]
pub enum Admission {
    Accepted {
        sequence: u64,
        event_id: Ulid,
        queued_at: DateTime<Utc>,
    },
    BufferSaturated {
        retry_after: Duration,
    },
    ServiceUnavailable {
        reason: UnavailableReason,
    },
}

impl Admission {
    pub fn is_accepted(&self) -> bool {
        matches!(self, Admission::Accepted { .. })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UnavailableReason {
    CircuitOpen,
    SustainedCritical,
    ShuttingDown,
}

impl UnavailableReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            UnavailableReason::CircuitOpen => "circuit_open",
            UnavailableReason::SustainedCritical => "sustained_critical",
            UnavailableReason::ShuttingDown => "shutting_down",
        }
    }
}

impl fmt::Display for UnavailableReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Front door for producers. Sheds with `ServiceUnavailable` while the
/// circuit is open or once status has been critical for the configured
/// duration; otherwise hands the payload to the buffer.
pub struct AdmissionGate {
    buffer: Arc<EventBuffer>,
    circuit: Arc<CircuitBreaker>,
    metrics: Arc<MetricsAggregator>,
    shed_after_critical: Option<Duration>,
    critical_since: Mutex<Option<Instant>>,
    total_shed: AtomicU64,
}

impl AdmissionGate {
    pub fn new(
        buffer: Arc<EventBuffer>,
        circuit: Arc<CircuitBreaker>,
        metrics: Arc<MetricsAggregator>,
        config: &AdmissionConfig,
    ) -> Self {
        Self {
            buffer,
            circuit,
            metrics,
            shed_after_critical: config.shed_after_critical(),
            critical_since: Mutex::new(None),
            total_shed: AtomicU64::new(0),
        }
    }

    pub fn admit(&self, payload: NewEvent) -> Admission {
        if let Some(reason) = self.shed_reason() {
            let shed = self.total_shed.fetch_add(1, Ordering::Relaxed) + 1;
            // Log the first shed and then every thousandth to keep noise down
            if shed == 1 || shed % 1_000 == 0 {
                warn!(reason = %reason, total_shed = shed, "shedding ingestion load");
            }
            return Admission::ServiceUnavailable { reason };
        }
        self.buffer.enqueue(payload)
    }

    fn shed_reason(&self) -> Option<UnavailableReason> {
        if self.circuit.state() == CircuitState::Open {
            return Some(UnavailableReason::CircuitOpen);
        }

        let after = self.shed_after_critical?;
        let now = Instant::now();
        let mut since = self.critical_since.lock().unwrap_or_else(|e| e.into_inner());
        if self.metrics.status() == HealthStatus::Critical {
            let started = *since.get_or_insert(now);
            if now.duration_since(started) >= after {
                return Some(UnavailableReason::SustainedCritical);
            }
        } else {
            *since = None;
        }
        None
    }

    /// Requests refused by the gate itself (not counting buffer saturation).
    pub fn total_shed(&self) -> u64 {
        self.total_shed.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PipelineConfig;
    use crate::worker::WorkerStats;

    struct Fixture {
        buffer: Arc<EventBuffer>,
        circuit: Arc<CircuitBreaker>,
        gate: AdmissionGate,
    }

    fn fixture(config: PipelineConfig) -> Fixture {
        let buffer = Arc::new(EventBuffer::new(&config));
        let circuit = Arc::new(CircuitBreaker::new("storage", config.circuit.clone()));
        let metrics = Arc::new(MetricsAggregator::new(
            Arc::clone(&buffer),
            Arc::clone(&circuit),
            Arc::new(WorkerStats::default()),
            config.metrics.clone(),
        ));
        let gate = AdmissionGate::new(
            Arc::clone(&buffer),
            Arc::clone(&circuit),
            metrics,
            &config.admission,
        );
        Fixture {
            buffer,
            circuit,
            gate,
        }
    }

    fn small_config() -> PipelineConfig {
        let mut config = PipelineConfig::default();
        config.buffer.capacity = 10;
        config.worker.batch_chunk_size = 5;
        config.circuit.failure_threshold = 1;
        config.admission.shed_after_critical_ms = 1_000;
        config
    }

    async fn trip(circuit: &CircuitBreaker) {
        let _ = circuit
            .execute(|| async { Err::<(), &str>("storage down") })
            .await;
    }

    #[tokio::test(start_paused = true)]
    async fn healthy_gate_accepts() {
        let fx = fixture(small_config());
        assert!(fx.gate.admit(NewEvent::new("svc", "hello")).is_accepted());
        assert_eq!(fx.buffer.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn open_circuit_sheds_without_touching_buffer() {
        let fx = fixture(small_config());
        trip(&fx.circuit).await;

        let result = fx.gate.admit(NewEvent::new("svc", "hello"));

        assert_eq!(
            result,
            Admission::ServiceUnavailable {
                reason: UnavailableReason::CircuitOpen
            }
        );
        assert!(fx.buffer.is_empty());
        assert_eq!(fx.gate.total_shed(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn admits_again_once_circuit_timeout_elapses() {
        let config = small_config();
        let timeout = config.circuit.timeout();
        let fx = fixture(config);
        trip(&fx.circuit).await;
        assert!(!fx.gate.admit(NewEvent::new("svc", "shed")).is_accepted());

        tokio::time::advance(timeout).await;
        assert!(fx.gate.admit(NewEvent::new("svc", "after timeout")).is_accepted());
    }

    #[tokio::test(start_paused = true)]
    async fn sustained_critical_sheds_after_grace_period() {
        let fx = fixture(small_config());
        // 9 of 10 slots puts utilization at the 90% critical threshold
        for n in 0..9 {
            assert!(fx.gate.admit(NewEvent::new("svc", format!("{}", n))).is_accepted());
        }

        // First critical observation starts the clock but still admits
        assert!(fx.gate.admit(NewEvent::new("svc", "first")).is_accepted());

        tokio::time::advance(Duration::from_millis(1_500)).await;
        assert_eq!(
            fx.gate.admit(NewEvent::new("svc", "late")),
            Admission::ServiceUnavailable {
                reason: UnavailableReason::SustainedCritical
            }
        );
    }

    #[tokio::test(start_paused = true)]
    async fn critical_clock_resets_when_pressure_drops() {
        let fx = fixture(small_config());
        for n in 0..9 {
            fx.gate.admit(NewEvent::new("svc", format!("{}", n)));
        }
        fx.gate.admit(NewEvent::new("svc", "critical"));

        let chunk = fx.buffer.dequeue_chunk(5).unwrap();
        fx.buffer.settle(chunk);
        assert!(fx.gate.admit(NewEvent::new("svc", "recovered")).is_accepted());

        tokio::time::advance(Duration::from_millis(1_500)).await;
        // Back at 6/10: healthy again, still admitting
        assert!(fx.gate.admit(NewEvent::new("svc", "later")).is_accepted());
    }

    #[tokio::test(start_paused = true)]
    async fn full_buffer_below_shed_window_reports_saturation() {
        let mut config = small_config();
        config.admission.shed_after_critical_ms = 0;
        let fx = fixture(config);
        for n in 0..10 {
            fx.gate.admit(NewEvent::new("svc", format!("{}", n)));
        }

        assert!(matches!(
            fx.gate.admit(NewEvent::new("svc", "overflow")),
            Admission::BufferSaturated { .. }
        ));
    }
}

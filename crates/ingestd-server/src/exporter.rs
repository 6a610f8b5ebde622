// ABOUTME: Prometheus text exposition of a pipeline metrics snapshot.
// ABOUTME: Registers gauges and counters from one snapshot in a fresh registry and encodes them for scraping.

use ingestd_core::{CircuitState, HealthStatus, MetricsSnapshot};
use prometheus::{Gauge, IntCounter, IntGauge, Registry, TextEncoder};

/// Content type of the text exposition format.
pub const CONTENT_TYPE: &str = prometheus::TEXT_FORMAT;

/// Encode `snapshot` in the Prometheus text format.
pub fn render(snapshot: &MetricsSnapshot) -> prometheus::Result<String> {
    let registry = Registry::new();
    let buffer = &snapshot.buffer;
    let flow = &snapshot.metrics;
    let worker = &snapshot.worker;

    int_gauge(&registry, "ingestd_buffer_size", "Events held in the buffer", count(buffer.size))?;
    int_gauge(&registry, "ingestd_buffer_capacity", "Buffer capacity", count(buffer.capacity))?;
    gauge(
        &registry,
        "ingestd_buffer_utilization_percent",
        "Buffer utilization percentage",
        buffer.utilization_percent,
    )?;
    int_gauge(
        &registry,
        "ingestd_buffer_health_status",
        "Buffer health status (1=healthy, 2=warning, 3=critical)",
        health_value(snapshot.status),
    )?;

    counter(&registry, "ingestd_events_enqueued_total", "Events accepted into the buffer", flow.total_enqueued)?;
    counter(&registry, "ingestd_events_dropped_total", "Accepted events that were lost", flow.total_dropped)?;
    counter(
        &registry,
        "ingestd_events_rejected_total",
        "Events refused because the buffer was full",
        flow.total_rejected,
    )?;
    gauge(
        &registry,
        "ingestd_events_drop_rate_percent",
        "Dropped events as a percentage of accepted events",
        flow.drop_rate_percent,
    )?;
    gauge(
        &registry,
        "ingestd_events_throughput_per_second",
        "Accepted events per second over the recent window",
        flow.throughput_events_per_second,
    )?;

    counter(&registry, "ingestd_events_persisted_total", "Events written to storage", worker.events_persisted)?;
    counter(&registry, "ingestd_chunks_persisted_total", "Chunks written to storage", worker.chunks_persisted)?;
    counter(&registry, "ingestd_chunks_dropped_total", "Chunks abandoned after retries", worker.chunks_dropped)?;
    counter(
        &registry,
        "ingestd_persist_failures_total",
        "Failed storage write attempts",
        worker.persist_failures,
    )?;

    int_gauge(
        &registry,
        "ingestd_circuit_breaker_state",
        "Circuit breaker state (0=closed, 1=open, 2=half-open)",
        circuit_value(snapshot.circuit.state),
    )?;
    counter(
        &registry,
        "ingestd_circuit_rejections_total",
        "Calls refused while the circuit was open",
        snapshot.circuit.total_rejections,
    )?;

    gauge(&registry, "ingestd_uptime_seconds", "Seconds since the pipeline started", snapshot.uptime_seconds)?;

    TextEncoder::new().encode_to_string(&registry.gather())
}

fn int_gauge(registry: &Registry, name: &str, help: &str, value: i64) -> prometheus::Result<()> {
    let metric = IntGauge::new(name, help)?;
    metric.set(value);
    registry.register(Box::new(metric))
}

fn gauge(registry: &Registry, name: &str, help: &str, value: f64) -> prometheus::Result<()> {
    let metric = Gauge::new(name, help)?;
    metric.set(value);
    registry.register(Box::new(metric))
}

fn counter(registry: &Registry, name: &str, help: &str, value: u64) -> prometheus::Result<()> {
    let metric = IntCounter::new(name, help)?;
    metric.inc_by(value);
    registry.register(Box::new(metric))
}

fn count(value: usize) -> i64 {
    i64::try_from(value).unwrap_or(i64::MAX)
}

fn health_value(status: HealthStatus) -> i64 {
    match status {
        HealthStatus::Healthy => 1,
        HealthStatus::Warning => 2,
        HealthStatus::Critical => 3,
    }
}

fn circuit_value(state: CircuitState) -> i64 {
    match state {
        CircuitState::Closed => 0,
        CircuitState::Open => 1,
        CircuitState::HalfOpen => 2,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ingestd_core::testing::{MemoryCheckpointStore, MemoryStorage};
    use ingestd_core::{Collaborators, NewEvent, Pipeline, PipelineConfig};
    use std::sync::Arc;

    fn sample_line<'a>(text: &'a str, name: &str) -> &'a str {
        text.lines()
            .find(|line| line.split_whitespace().next() == Some(name))
            .unwrap_or_else(|| panic!("{} missing from:\n{}", name, text))
    }

    #[tokio::test]
    async fn renders_buffer_flow_and_circuit_families() {
        let mut config = PipelineConfig::default();
        config.buffer.capacity = 50;
        config.worker.flush_interval_ms = 600_000;
        let pipeline = Pipeline::start(
            config,
            Collaborators {
                storage: Arc::new(MemoryStorage::default()),
                checkpoints: Arc::new(MemoryCheckpointStore::default()),
                dead_letters: None,
                spill: None,
            },
        )
        .await
        .unwrap();
        for n in 0..4 {
            assert!(pipeline.admit(NewEvent::new("svc", format!("{}", n))).is_accepted());
        }

        let text = render(&pipeline.snapshot()).unwrap();

        assert_eq!(sample_line(&text, "ingestd_buffer_size"), "ingestd_buffer_size 4");
        assert_eq!(sample_line(&text, "ingestd_buffer_capacity"), "ingestd_buffer_capacity 50");
        assert_eq!(sample_line(&text, "ingestd_buffer_health_status"), "ingestd_buffer_health_status 1");
        assert_eq!(sample_line(&text, "ingestd_events_enqueued_total"), "ingestd_events_enqueued_total 4");
        assert_eq!(sample_line(&text, "ingestd_events_dropped_total"), "ingestd_events_dropped_total 0");
        assert_eq!(sample_line(&text, "ingestd_circuit_breaker_state"), "ingestd_circuit_breaker_state 0");
        assert!(text.contains("# TYPE ingestd_events_enqueued_total counter"));
        assert!(text.contains("# TYPE ingestd_buffer_utilization_percent gauge"));
        assert!(text.contains("ingestd_events_throughput_per_second "));

        pipeline.shutdown().await.unwrap();
    }

    #[test]
    fn circuit_states_map_to_distinct_values() {
        assert_eq!(circuit_value(CircuitState::Closed), 0);
        assert_eq!(circuit_value(CircuitState::Open), 1);
        assert_eq!(circuit_value(CircuitState::HalfOpen), 2);
    }
}

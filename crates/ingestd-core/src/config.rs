// ABOUTME: Immutable pipeline configuration shared by every core component.
// ABOUTME: Deserializable with per-section defaults and validated once before the pipeline starts.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors raised when a configuration value is out of range.
#[derive(Debug, Error, PartialEq)]
pub enum ConfigError {
    #[error("{field} must be greater than zero")]
    Zero { field: &'static str },

    #[error("batch chunk size {chunk_size} exceeds buffer capacity {capacity}")]
    ChunkLargerThanBuffer { chunk_size: usize, capacity: usize },

    #[error("warning threshold {warning}% must be below critical threshold {critical}%")]
    ThresholdOrder { warning: f64, critical: f64 },

    #[error("{field} must be a percentage between 0 and 100, got {value}")]
    Percentage { field: &'static str, value: f64 },
}

/// One configuration value for the whole pipeline, built once at startup
/// and handed to each component's constructor.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    pub buffer: BufferConfig,
    pub worker: WorkerConfig,
    pub circuit: CircuitBreakerConfig,
    pub metrics: MetricsConfig,
    pub admission: AdmissionConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BufferConfig {
    pub capacity: usize,
    /// Used for retry-after hints when nothing has drained recently.
    pub retry_after_fallback_secs: u64,
    pub retry_after_max_secs: u64,
}

impl Default for BufferConfig {
    fn default() -> Self {
        Self {
            capacity: 10_000,
            retry_after_fallback_secs: 5,
            retry_after_max_secs: 60,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerConfig {
    pub batch_chunk_size: usize,
    pub flush_interval_ms: u64,
    /// Queued-event count that wakes the worker before the timer. Zero
    /// means "use the chunk size".
    pub chunk_ready_threshold: usize,
    pub max_persist_attempts: u32,
    pub retry_base_delay_ms: u64,
    pub retry_max_delay_ms: u64,
    pub shutdown_timeout_ms: u64,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            batch_chunk_size: 500,
            flush_interval_ms: 1_000,
            chunk_ready_threshold: 0,
            max_persist_attempts: 3,
            retry_base_delay_ms: 100,
            retry_max_delay_ms: 5_000,
            shutdown_timeout_ms: 30_000,
        }
    }
}

impl WorkerConfig {
    pub fn flush_interval(&self) -> Duration {
        Duration::from_millis(self.flush_interval_ms)
    }

    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_millis(self.shutdown_timeout_ms)
    }

    pub fn chunk_ready_threshold(&self) -> usize {
        if self.chunk_ready_threshold == 0 {
            self.batch_chunk_size
        } else {
            self.chunk_ready_threshold
        }
    }

    /// Delay before retrying after the `failed_attempts`-th failure:
    /// `base * 2^(n-1)`, capped at `retry_max_delay_ms`.
    pub fn retry_delay(&self, failed_attempts: u32) -> Duration {
        let exponent = failed_attempts.saturating_sub(1).min(32);
        let delay = self
            .retry_base_delay_ms
            .saturating_mul(1u64 << exponent)
            .min(self.retry_max_delay_ms);
        Duration::from_millis(delay)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CircuitBreakerConfig {
    pub failure_threshold: u32,
    pub success_threshold: u32,
    pub timeout_ms: u64,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            success_threshold: 2,
            timeout_ms: 30_000,
        }
    }
}

impl CircuitBreakerConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MetricsConfig {
    /// Sliding window for throughput and drain-rate estimates.
    pub throughput_window_ms: u64,
    pub warning_utilization_percent: f64,
    pub critical_utilization_percent: f64,
    pub history_interval_ms: u64,
    pub history_default_limit: usize,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            throughput_window_ms: 5_000,
            warning_utilization_percent: 70.0,
            critical_utilization_percent: 90.0,
            history_interval_ms: 60_000,
            history_default_limit: 100,
        }
    }
}

impl MetricsConfig {
    pub fn throughput_window(&self) -> Duration {
        Duration::from_millis(self.throughput_window_ms)
    }

    pub fn history_interval(&self) -> Duration {
        Duration::from_millis(self.history_interval_ms)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AdmissionConfig {
    /// Shed load once the status has stayed critical this long. Zero
    /// disables shedding on status; an open circuit always sheds.
    pub shed_after_critical_ms: u64,
}

impl Default for AdmissionConfig {
    fn default() -> Self {
        Self {
            shed_after_critical_ms: 5_000,
        }
    }
}

impl AdmissionConfig {
    pub fn shed_after_critical(&self) -> Option<Duration> {
        (self.shed_after_critical_ms > 0).then(|| Duration::from_millis(self.shed_after_critical_ms))
    }
}

impl PipelineConfig {
    /// Check every value that would make a component misbehave.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let nonzero: [(&'static str, u64); 9] = [
            ("buffer.capacity", self.buffer.capacity as u64),
            ("buffer.retry_after_max_secs", self.buffer.retry_after_max_secs),
            ("worker.batch_chunk_size", self.worker.batch_chunk_size as u64),
            ("worker.flush_interval_ms", self.worker.flush_interval_ms),
            ("worker.max_persist_attempts", u64::from(self.worker.max_persist_attempts)),
            ("circuit.failure_threshold", u64::from(self.circuit.failure_threshold)),
            ("circuit.success_threshold", u64::from(self.circuit.success_threshold)),
            ("metrics.throughput_window_ms", self.metrics.throughput_window_ms),
            ("metrics.history_interval_ms", self.metrics.history_interval_ms),
        ];
        if let Some((field, _)) = nonzero.iter().find(|(_, value)| *value == 0) {
            return Err(ConfigError::Zero { field });
        }

        if self.worker.batch_chunk_size > self.buffer.capacity {
            return Err(ConfigError::ChunkLargerThanBuffer {
                chunk_size: self.worker.batch_chunk_size,
                capacity: self.buffer.capacity,
            });
        }

        for (field, value) in [
            ("metrics.warning_utilization_percent", self.metrics.warning_utilization_percent),
            ("metrics.critical_utilization_percent", self.metrics.critical_utilization_percent),
        ] {
            if !(0.0..=100.0).contains(&value) {
                return Err(ConfigError::Percentage { field, value });
            }
        }

        if self.metrics.warning_utilization_percent >= self.metrics.critical_utilization_percent {
            return Err(ConfigError::ThresholdOrder {
                warning: self.metrics.warning_utilization_percent,
                critical: self.metrics.critical_utilization_percent,
            });
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        assert_eq!(PipelineConfig::default().validate(), Ok(()));
    }

    #[test]
    fn rejects_zero_capacity() {
        let mut config = PipelineConfig::default();
        config.buffer.capacity = 0;
        assert_eq!(
            config.validate(),
            Err(ConfigError::Zero {
                field: "buffer.capacity"
            })
        );
    }

    #[test]
    fn rejects_zero_history_interval() {
        let mut config = PipelineConfig::default();
        config.metrics.history_interval_ms = 0;
        assert_eq!(
            config.validate(),
            Err(ConfigError::Zero {
                field: "metrics.history_interval_ms"
            })
        );
    }

    #[test]
    fn rejects_chunk_larger_than_buffer() {
        let mut config = PipelineConfig::default();
        config.buffer.capacity = 100;
        config.worker.batch_chunk_size = 101;
        assert!(matches!(
            config.validate(),
            Err(ConfigError::ChunkLargerThanBuffer { .. })
        ));
    }

    #[test]
    fn rejects_inverted_thresholds() {
        let mut config = PipelineConfig::default();
        config.metrics.warning_utilization_percent = 95.0;
        assert!(matches!(
            config.validate(),
            Err(ConfigError::ThresholdOrder { .. })
        ));
    }

    #[test]
    fn retry_delay_grows_exponentially_and_caps() {
        let worker = WorkerConfig {
            retry_base_delay_ms: 100,
            retry_max_delay_ms: 1_000,
            ..Default::default()
        };
        assert_eq!(worker.retry_delay(1), Duration::from_millis(100));
        assert_eq!(worker.retry_delay(2), Duration::from_millis(200));
        assert_eq!(worker.retry_delay(3), Duration::from_millis(400));
        assert_eq!(worker.retry_delay(5), Duration::from_millis(1_000));
        assert_eq!(worker.retry_delay(60), Duration::from_millis(1_000));
    }

    #[test]
    fn chunk_ready_threshold_defaults_to_chunk_size() {
        let worker = WorkerConfig {
            batch_chunk_size: 250,
            chunk_ready_threshold: 0,
            ..Default::default()
        };
        assert_eq!(worker.chunk_ready_threshold(), 250);
    }

    #[test]
    fn partial_yaml_style_json_fills_defaults() {
        let config: PipelineConfig =
            serde_json::from_str(r#"{"buffer": {"capacity": 42}, "worker": {"batch_chunk_size": 7}}"#)
                .unwrap();
        assert_eq!(config.buffer.capacity, 42);
        assert_eq!(config.worker.batch_chunk_size, 7);
        assert_eq!(config.circuit, CircuitBreakerConfig::default());
    }
}

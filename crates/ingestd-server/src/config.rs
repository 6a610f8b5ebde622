// ABOUTME: Configuration loading for the ingestd server from an optional YAML file and INGESTD_* variables.
// ABOUTME: Precedence is CLI flags, then environment, then the YAML file, then built-in defaults.

use std::fmt::Display;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use ingestd_core::PipelineConfig;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("INGESTD_BIND is not a valid socket address: {0}")]
    InvalidBind(String),

    #[error("{key} has invalid value {value:?}: {reason}")]
    InvalidValue {
        key: &'static str,
        value: String,
        reason: String,
    },

    #[error("failed to read config file {path}: {source}")]
    ReadFile {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("invalid YAML config: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("invalid pipeline config: {0}")]
    Pipeline(#[from] ingestd_core::ConfigError),
}

/// Values supplied on the command line, which win over everything else.
#[derive(Debug, Clone, Default)]
pub struct Overrides {
    pub home: Option<PathBuf>,
    pub bind: Option<SocketAddr>,
    pub config_file: Option<PathBuf>,
}

#[derive(Debug, Clone)]
pub struct IngestdConfig {
    pub home: PathBuf,
    pub bind: SocketAddr,
    pub config_file: Option<PathBuf>,
    pub pipeline: PipelineConfig,
}

impl IngestdConfig {
    /// Load configuration from the process environment.
    ///
    /// Environment variables:
    /// - INGESTD_HOME: data directory (default: ~/.ingestd)
    /// - INGESTD_BIND: socket address to bind (default: 127.0.0.1:7400)
    /// - INGESTD_CONFIG: YAML file with pipeline settings (optional)
    /// - INGESTD_BUFFER_CAPACITY, INGESTD_BATCH_CHUNK_SIZE, INGESTD_FLUSH_INTERVAL_MS and the
    ///   other per-knob overrides listed in `apply_env_overrides`
    pub fn from_env(overrides: Overrides) -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok(), overrides)
    }

    /// Same as `from_env` with an arbitrary variable source.
    pub fn from_lookup<F>(lookup: F, overrides: Overrides) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let var = |key: &str| lookup(key).filter(|v| !v.is_empty());

        let home = overrides
            .home
            .or_else(|| var("INGESTD_HOME").map(PathBuf::from))
            .unwrap_or_else(|| {
                var("HOME")
                    .map(PathBuf::from)
                    .unwrap_or_else(|| PathBuf::from("/tmp"))
                    .join(".ingestd")
            });

        let bind = match overrides.bind {
            Some(bind) => bind,
            None => {
                let bind_str = var("INGESTD_BIND").unwrap_or_else(|| "127.0.0.1:7400".to_string());
                bind_str
                    .parse()
                    .map_err(|_| ConfigError::InvalidBind(bind_str))?
            }
        };

        let config_file = overrides
            .config_file
            .or_else(|| var("INGESTD_CONFIG").map(PathBuf::from));
        let mut pipeline = match &config_file {
            Some(path) => load_pipeline_file(path)?,
            None => PipelineConfig::default(),
        };

        apply_env_overrides(&mut pipeline, &var)?;
        pipeline.validate()?;

        Ok(Self {
            home,
            bind,
            config_file,
            pipeline,
        })
    }
}

/// Parse a YAML pipeline config. Missing sections and keys keep defaults.
pub fn load_pipeline_file(path: &Path) -> Result<PipelineConfig, ConfigError> {
    let text = std::fs::read_to_string(path).map_err(|source| ConfigError::ReadFile {
        path: path.to_path_buf(),
        source,
    })?;
    if text.trim().is_empty() {
        return Ok(PipelineConfig::default());
    }
    Ok(serde_yaml::from_str(&text)?)
}

fn set<T>(var: &impl Fn(&str) -> Option<String>, key: &'static str, target: &mut T) -> Result<(), ConfigError>
where
    T: FromStr,
    T::Err: Display,
{
    if let Some(value) = var(key) {
        *target = value.trim().parse().map_err(|e: T::Err| ConfigError::InvalidValue {
            key,
            value: value.clone(),
            reason: e.to_string(),
        })?;
    }
    Ok(())
}

fn apply_env_overrides(
    pipeline: &mut PipelineConfig,
    var: &impl Fn(&str) -> Option<String>,
) -> Result<(), ConfigError> {
    set(var, "INGESTD_BUFFER_CAPACITY", &mut pipeline.buffer.capacity)?;
    set(var, "INGESTD_RETRY_AFTER_FALLBACK_SECS", &mut pipeline.buffer.retry_after_fallback_secs)?;
    set(var, "INGESTD_RETRY_AFTER_MAX_SECS", &mut pipeline.buffer.retry_after_max_secs)?;

    set(var, "INGESTD_BATCH_CHUNK_SIZE", &mut pipeline.worker.batch_chunk_size)?;
    set(var, "INGESTD_FLUSH_INTERVAL_MS", &mut pipeline.worker.flush_interval_ms)?;
    set(var, "INGESTD_CHUNK_READY_THRESHOLD", &mut pipeline.worker.chunk_ready_threshold)?;
    set(var, "INGESTD_MAX_PERSIST_ATTEMPTS", &mut pipeline.worker.max_persist_attempts)?;
    set(var, "INGESTD_RETRY_BASE_DELAY_MS", &mut pipeline.worker.retry_base_delay_ms)?;
    set(var, "INGESTD_RETRY_MAX_DELAY_MS", &mut pipeline.worker.retry_max_delay_ms)?;
    set(var, "INGESTD_SHUTDOWN_TIMEOUT_MS", &mut pipeline.worker.shutdown_timeout_ms)?;

    set(var, "INGESTD_CIRCUIT_FAILURE_THRESHOLD", &mut pipeline.circuit.failure_threshold)?;
    set(var, "INGESTD_CIRCUIT_SUCCESS_THRESHOLD", &mut pipeline.circuit.success_threshold)?;
    set(var, "INGESTD_CIRCUIT_TIMEOUT_MS", &mut pipeline.circuit.timeout_ms)?;

    set(var, "INGESTD_THROUGHPUT_WINDOW_MS", &mut pipeline.metrics.throughput_window_ms)?;
    set(var, "INGESTD_WARNING_UTILIZATION_PERCENT", &mut pipeline.metrics.warning_utilization_percent)?;
    set(var, "INGESTD_CRITICAL_UTILIZATION_PERCENT", &mut pipeline.metrics.critical_utilization_percent)?;
    set(var, "INGESTD_METRICS_HISTORY_INTERVAL_MS", &mut pipeline.metrics.history_interval_ms)?;
    set(var, "INGESTD_METRICS_HISTORY_LIMIT", &mut pipeline.metrics.history_default_limit)?;

    set(var, "INGESTD_SHED_AFTER_CRITICAL_MS", &mut pipeline.admission.shed_after_critical_ms)?;
    Ok(())
}

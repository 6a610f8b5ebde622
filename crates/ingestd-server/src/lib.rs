// ABOUTME: HTTP surface for ingestd: event ingestion, health, metrics, Prometheus, and dead-letter endpoints.
// ABOUTME: Also owns server configuration loading and the periodic metrics history recorder.

pub mod api;
pub mod app_state;
pub mod config;
pub mod exporter;
pub mod recorder;
pub mod routes;
pub mod validation;

pub use app_state::{AppState, SharedState};
pub use config::{ConfigError, IngestdConfig, Overrides};
pub use recorder::MetricsRecorder;
pub use routes::create_router;
pub use validation::{IngestRequest, ValidationError};

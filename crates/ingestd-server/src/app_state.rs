// ABOUTME: Shared application state for the ingestd HTTP server.
// ABOUTME: Holds the running pipeline plus the optional read-side logs exposed by the API.

use std::sync::Arc;

use ingestd_core::Pipeline;
use ingestd_store::{JsonlDeadLetterLog, MetricsHistory};

/// Shared application state accessible by all Axum handlers.
pub struct AppState {
    pub pipeline: Arc<Pipeline>,
    pub dead_letters: Option<Arc<JsonlDeadLetterLog>>,
    pub history: Option<Arc<MetricsHistory>>,
    pub history_default_limit: usize,
}

/// Type alias for the Arc-wrapped state used with Axum's State extractor.
pub type SharedState = Arc<AppState>;

impl AppState {
    pub fn new(pipeline: Arc<Pipeline>) -> Self {
        let history_default_limit = pipeline.config().metrics.history_default_limit;
        Self {
            pipeline,
            dead_letters: None,
            history: None,
            history_default_limit,
        }
    }

    pub fn with_dead_letters(mut self, log: Arc<JsonlDeadLetterLog>) -> Self {
        self.dead_letters = Some(log);
        self
    }

    pub fn with_history(mut self, history: Arc<MetricsHistory>) -> Self {
        self.history = Some(history);
        self
    }
}

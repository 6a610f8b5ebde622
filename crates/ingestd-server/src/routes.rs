// ABOUTME: Route definitions for the ingestd HTTP API.
// ABOUTME: Assembles ingestion, health, metrics, and dead-letter routes into one Axum Router.

use axum::Router;
use axum::routing::{get, post};
use tower_http::trace::TraceLayer;

use crate::api;
use crate::app_state::SharedState;

/// Build the complete Axum router with all routes and shared state.
pub fn create_router(state: SharedState) -> Router {
    Router::new()
        .route("/events", post(api::events::ingest_event))
        .route("/health", get(api::health::health))
        .route("/health/buffer", get(api::health::buffer_health))
        .route("/health/circuit", get(api::health::circuit_health))
        .route("/metrics", get(api::health::metrics))
        .route("/metrics/history", get(api::history::metrics_history))
        .route("/metrics/prometheus", get(api::health::prometheus_metrics))
        .route("/dead-letters", get(api::dead_letters::list_dead_letters))
        .route("/dead-letters/stats", get(api::dead_letters::dead_letter_stats))
        .route(
            "/dead-letters/{first_sequence}",
            get(api::dead_letters::get_dead_letter).delete(api::dead_letters::delete_dead_letter),
        )
        .route(
            "/dead-letters/{first_sequence}/reprocess",
            post(api::dead_letters::reprocess_dead_letter),
        )
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

// ABOUTME: Liveness, buffer, circuit, and full metrics endpoints, plus the Prometheus scrape target.
// ABOUTME: All reads come from the pipeline's metrics aggregator and never block ingestion.

use axum::Json;
use axum::extract::State;
use axum::http::{StatusCode, header};
use axum::response::{IntoResponse, Response};
use ingestd_core::MetricsSnapshot;
use serde_json::json;
use tracing::error;

use crate::api::error_response;
use crate::app_state::SharedState;
use crate::exporter;

/// GET /health - 200 while serving, 503 once shutdown has begun.
pub async fn health(State(state): State<SharedState>) -> Response {
    if state.pipeline.is_shutting_down() {
        return (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(json!({ "status": "shutting_down" })),
        )
            .into_response();
    }
    let snapshot = state.pipeline.snapshot();
    Json(json!({
        "status": "ok",
        "health": snapshot.status,
        "uptime_seconds": snapshot.uptime_seconds,
    }))
    .into_response()
}

/// GET /health/buffer - buffer occupancy and flow counters.
pub async fn buffer_health(State(state): State<SharedState>) -> Json<serde_json::Value> {
    let snapshot = state.pipeline.snapshot();
    Json(json!({
        "status": snapshot.status,
        "buffer": snapshot.buffer,
        "metrics": snapshot.metrics,
    }))
}

/// GET /health/circuit
pub async fn circuit_health(State(state): State<SharedState>) -> Json<serde_json::Value> {
    let circuit = state.pipeline.circuit();
    Json(json!({
        "name": circuit.name(),
        "circuit": circuit.snapshot(),
    }))
}

/// GET /metrics - the complete snapshot.
pub async fn metrics(State(state): State<SharedState>) -> Json<MetricsSnapshot> {
    Json(state.pipeline.snapshot())
}

/// GET /metrics/prometheus - the snapshot in Prometheus text format.
pub async fn prometheus_metrics(State(state): State<SharedState>) -> Response {
    match exporter::render(&state.pipeline.snapshot()) {
        Ok(body) => ([(header::CONTENT_TYPE, exporter::CONTENT_TYPE)], body).into_response(),
        Err(e) => {
            error!(error = %e, "failed to encode prometheus metrics");
            error_response(StatusCode::INTERNAL_SERVER_ERROR, "failed to encode metrics")
        }
    }
}

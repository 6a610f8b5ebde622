// ABOUTME: POST /events handler mapping admission outcomes onto HTTP responses.
// ABOUTME: 202 when accepted, 429 with Retry-After when saturated, 503 when shedding load.

use axum::Json;
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use http::header::RETRY_AFTER;
use ingestd_core::Admission;
use serde_json::json;
use tracing::debug;

use crate::api::error_response;
use crate::app_state::SharedState;
use crate::validation::IngestRequest;

/// POST /events - validate and offer one event to the pipeline.
pub async fn ingest_event(State(state): State<SharedState>, Json(req): Json<IngestRequest>) -> Response {
    let payload = match req.validate() {
        Ok(payload) => payload,
        Err(e) => {
            debug!(error = %e, "rejected invalid event");
            return error_response(StatusCode::BAD_REQUEST, e.to_string());
        }
    };

    match state.pipeline.admit(payload) {
        Admission::Accepted {
            sequence,
            event_id,
            queued_at,
        } => (
            StatusCode::ACCEPTED,
            Json(json!({
                "status": "accepted",
                "event_id": event_id.to_string(),
                "sequence": sequence,
                "queued_at": queued_at,
            })),
        )
            .into_response(),
        Admission::BufferSaturated { retry_after } => {
            let secs = retry_after.as_secs().max(1);
            (
                StatusCode::TOO_MANY_REQUESTS,
                [(RETRY_AFTER, secs.to_string())],
                Json(json!({
                    "status": "rate_limited",
                    "error_code": "BUFFER_SATURATED",
                    "message": "Event buffer is full. Retry after the indicated delay.",
                    "retry_after": secs,
                })),
            )
                .into_response()
        }
        Admission::ServiceUnavailable { reason } => (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(json!({
                "status": "service_unavailable",
                "error_code": "SERVICE_UNAVAILABLE",
                "message": "System under pressure. Please retry later.",
                "reason": reason,
            })),
        )
            .into_response(),
    }
}

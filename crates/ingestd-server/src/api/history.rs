// ABOUTME: GET /metrics/history handler serving recorded metrics snapshots.
// ABOUTME: Returns an empty list when no history log is configured.

use axum::Json;
use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde_json::json;
use tracing::error;

use crate::api::{LimitParams, error_response};
use crate::app_state::SharedState;

pub async fn metrics_history(State(state): State<SharedState>, Query(params): Query<LimitParams>) -> Response {
    let limit = params.resolve(state.history_default_limit);
    let Some(history) = &state.history else {
        return Json(json!({ "entries": [] })).into_response();
    };

    match history.recent(limit) {
        Ok(entries) => Json(json!({ "entries": entries })).into_response(),
        Err(e) => {
            error!(error = %e, "failed to read metrics history");
            error_response(StatusCode::INTERNAL_SERVER_ERROR, "failed to read metrics history")
        }
    }
}

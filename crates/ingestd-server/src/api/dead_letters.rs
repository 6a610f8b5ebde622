// ABOUTME: Dead-letter handlers: list, statistics, lookup, deletion, and reprocessing of dropped chunks.
// ABOUTME: Entries are addressed by the first sequence of their range; reprocessing requeues their events.

use axum::Json;
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use chrono::Utc;
use ingestd_core::ReinsertError;
use ingestd_store::{DeadLetterStats, DeadLetterSummary, JsonlDeadLetterLog, JsonlError};
use serde::Deserialize;
use serde_json::json;
use tracing::{error, info, warn};

use crate::api::{LimitParams, error_response};
use crate::app_state::SharedState;

#[derive(Debug, Default, Deserialize)]
pub struct ReprocessParams {
    /// Requeue an entry even if it was reprocessed before.
    #[serde(default)]
    pub force: bool,
}

fn read_failure(e: JsonlError) -> Response {
    error!(error = %e, "failed to read dead-letter log");
    error_response(StatusCode::INTERNAL_SERVER_ERROR, "failed to read dead-letter log")
}

fn not_found(first: u64) -> Response {
    error_response(StatusCode::NOT_FOUND, format!("no dead letter starts at sequence {}", first))
}

fn log_or_not_found(state: &SharedState, first: u64) -> Result<&JsonlDeadLetterLog, Response> {
    state.dead_letters.as_deref().ok_or_else(|| not_found(first))
}

pub async fn list_dead_letters(State(state): State<SharedState>, Query(params): Query<LimitParams>) -> Response {
    let limit = params.resolve(state.history_default_limit);
    let Some(log) = &state.dead_letters else {
        return Json(json!({ "dead_letters": [] })).into_response();
    };

    match log.summaries(limit) {
        Ok(summaries) => Json(json!({ "dead_letters": summaries })).into_response(),
        Err(e) => read_failure(e),
    }
}

pub async fn dead_letter_stats(State(state): State<SharedState>) -> Response {
    let Some(log) = &state.dead_letters else {
        return Json(json!({ "stats": DeadLetterStats::default() })).into_response();
    };

    match log.stats() {
        Ok(stats) => Json(json!({ "stats": stats })).into_response(),
        Err(e) => read_failure(e),
    }
}

pub async fn get_dead_letter(State(state): State<SharedState>, Path(first): Path<u64>) -> Response {
    let log = match log_or_not_found(&state, first) {
        Ok(log) => log,
        Err(resp) => return resp,
    };

    match log.get(first) {
        Ok(Some(entry)) => Json(json!({ "dead_letter": entry })).into_response(),
        Ok(None) => not_found(first),
        Err(e) => read_failure(e),
    }
}

pub async fn delete_dead_letter(State(state): State<SharedState>, Path(first): Path<u64>) -> Response {
    let log = match log_or_not_found(&state, first) {
        Ok(log) => log,
        Err(resp) => return resp,
    };

    match log.delete(first) {
        Ok(0) => not_found(first),
        Ok(_) => StatusCode::NO_CONTENT.into_response(),
        Err(e) => {
            error!(first_sequence = first, error = %e, "failed to delete dead letter");
            error_response(StatusCode::INTERNAL_SERVER_ERROR, "failed to delete dead letter")
        }
    }
}

/// Requeue the events of a dead letter and mark it reprocessed. The events
/// keep their sequence numbers.
pub async fn reprocess_dead_letter(
    State(state): State<SharedState>,
    Path(first): Path<u64>,
    Query(params): Query<ReprocessParams>,
) -> Response {
    let log = match log_or_not_found(&state, first) {
        Ok(log) => log,
        Err(resp) => return resp,
    };
    let entry = match log.get(first) {
        Ok(Some(entry)) => entry,
        Ok(None) => return not_found(first),
        Err(e) => return read_failure(e),
    };
    if entry.is_reprocessed() && !params.force {
        return error_response(
            StatusCode::CONFLICT,
            format!("dead letter {} was already reprocessed", first),
        );
    }

    let requeued = match state.pipeline.reprocess(entry.letter.events) {
        Ok(count) => count,
        Err(ReinsertError::Closed) => {
            return error_response(StatusCode::SERVICE_UNAVAILABLE, "pipeline is shutting down");
        }
        Err(e @ ReinsertError::NoRoom { .. }) => {
            warn!(first_sequence = first, error = %e, "dead letter not requeued");
            return error_response(StatusCode::SERVICE_UNAVAILABLE, e.to_string());
        }
    };

    let summary = match log.mark_reprocessed(first, Utc::now()) {
        Ok(updated) => updated.as_ref().map(DeadLetterSummary::from),
        Err(e) => {
            error!(first_sequence = first, error = %e, "events requeued but dead letter not marked");
            None
        }
    };
    info!(first_sequence = first, requeued, "dead letter reprocessed");

    (
        StatusCode::ACCEPTED,
        Json(json!({
            "status": "requeued",
            "requeued": requeued,
            "dead_letter": summary,
        })),
    )
        .into_response()
}

// ABOUTME: HTTP handlers for the ingestd API, grouped by concern.
// ABOUTME: Shared query parameters and error-body helpers live here.

pub mod dead_letters;
pub mod events;
pub mod health;
pub mod history;

use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde::Deserialize;
use serde_json::json;

/// Upper bound on `?limit=` for list endpoints.
pub const MAX_LIST_LIMIT: usize = 1_000;

#[derive(Debug, Default, Deserialize)]
pub struct LimitParams {
    pub limit: Option<usize>,
}

impl LimitParams {
    pub fn resolve(&self, default: usize) -> usize {
        self.limit.unwrap_or(default).clamp(1, MAX_LIST_LIMIT)
    }
}

pub(crate) fn error_response(status: StatusCode, message: impl Into<String>) -> Response {
    (status, Json(json!({ "error": message.into() }))).into_response()
}

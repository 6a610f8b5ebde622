// ABOUTME: Request body for event ingestion and the minimal bounds checks applied before admission.
// ABOUTME: Produces the core NewEvent payload; content is never inspected beyond size and presence.

use chrono::{DateTime, Utc};
use ingestd_core::NewEvent;
use serde::Deserialize;
use thiserror::Error;

pub const MAX_SERVICE_LEN: usize = 100;
pub const MAX_MESSAGE_LEN: usize = 2_000;
pub const MAX_METADATA_BYTES: usize = 16 * 1024;

#[derive(Debug, Error, PartialEq)]
pub enum ValidationError {
    #[error("{field} must not be empty")]
    Empty { field: &'static str },

    #[error("{field} must be at most {max} characters")]
    TooLong { field: &'static str, max: usize },

    #[error("metadata must be a JSON object")]
    MetadataNotObject,

    #[error("metadata must serialize to at most {max} bytes")]
    MetadataTooLarge { max: usize },
}

/// JSON body accepted by `POST /events`.
#[derive(Debug, Clone, Deserialize)]
pub struct IngestRequest {
    pub service: String,
    pub message: String,
    #[serde(default)]
    pub timestamp: Option<DateTime<Utc>>,
    #[serde(default)]
    pub metadata: Option<serde_json::Value>,
}

impl IngestRequest {
    pub fn validate(self) -> Result<NewEvent, ValidationError> {
        let service = self.service.trim();
        check_text("service", service, MAX_SERVICE_LEN)?;
        check_text("message", &self.message, MAX_MESSAGE_LEN)?;

        if let Some(metadata) = &self.metadata {
            if !metadata.is_object() {
                return Err(ValidationError::MetadataNotObject);
            }
            if metadata.to_string().len() > MAX_METADATA_BYTES {
                return Err(ValidationError::MetadataTooLarge {
                    max: MAX_METADATA_BYTES,
                });
            }
        }

        Ok(NewEvent {
            timestamp: self.timestamp.unwrap_or_else(Utc::now),
            service: service.to_string(),
            message: self.message,
            metadata: self.metadata,
        })
    }
}

fn check_text(field: &'static str, value: &str, max: usize) -> Result<(), ValidationError> {
    if value.trim().is_empty() {
        return Err(ValidationError::Empty { field });
    }
    if value.chars().count() > max {
        return Err(ValidationError::TooLong { field, max });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn request(service: &str, message: &str) -> IngestRequest {
        IngestRequest {
            service: service.to_string(),
            message: message.to_string(),
            timestamp: None,
            metadata: None,
        }
    }

    #[test]
    fn valid_request_becomes_event_payload() {
        let mut req = request("  auth  ", "user logged in");
        req.metadata = Some(json!({"user": 7}));

        let payload = req.validate().unwrap();
        assert_eq!(payload.service, "auth");
        assert_eq!(payload.metadata, Some(json!({"user": 7})));
    }

    #[test]
    fn empty_fields_are_rejected() {
        assert_eq!(
            request("", "msg").validate(),
            Err(ValidationError::Empty { field: "service" })
        );
        assert_eq!(
            request("svc", "   ").validate(),
            Err(ValidationError::Empty { field: "message" })
        );
    }

    #[test]
    fn oversized_fields_are_rejected() {
        let long_service = "s".repeat(MAX_SERVICE_LEN + 1);
        assert!(matches!(
            request(&long_service, "msg").validate(),
            Err(ValidationError::TooLong { field: "service", .. })
        ));

        let long_message = "m".repeat(MAX_MESSAGE_LEN + 1);
        assert!(matches!(
            request("svc", &long_message).validate(),
            Err(ValidationError::TooLong { field: "message", .. })
        ));
    }

    #[test]
    fn metadata_must_be_small_object() {
        let mut req = request("svc", "msg");
        req.metadata = Some(json!([1, 2, 3]));
        assert_eq!(req.validate(), Err(ValidationError::MetadataNotObject));

        let mut req = request("svc", "msg");
        req.metadata = Some(json!({"blob": "x".repeat(MAX_METADATA_BYTES)}));
        assert!(matches!(
            req.validate(),
            Err(ValidationError::MetadataTooLarge { .. })
        ));
    }

    #[test]
    fn supplied_timestamp_is_kept() {
        let at: DateTime<Utc> = "2024-05-01T12:00:00Z".parse().unwrap();
        let mut req = request("svc", "msg");
        req.timestamp = Some(at);
        assert_eq!(req.validate().unwrap().timestamp, at);
    }
}

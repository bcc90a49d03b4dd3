use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::{Deserialize, Serialize};
use serde_json::json;
use thiserror::Error;

use crate::event::ValidationError;

#[derive(Debug, PartialEq, Eq, Deserialize, Serialize)]
pub struct CaptureResponse {
    pub success: bool,
    /// Events left after in-request deduplication.
    pub accepted: usize,
}

impl IntoResponse for CaptureResponse {
    fn into_response(self) -> Response {
        (StatusCode::ACCEPTED, Json(self)).into_response()
    }
}

#[derive(Error, Debug)]
pub enum CaptureError {
    #[error("failed to parse request: {0}")]
    RequestParsingError(#[from] serde_json::Error),
    #[error("empty payload")]
    EmptyBatch,
    #[error(transparent)]
    ValidationError(#[from] ValidationError),
    #[error("event {index}: {source}")]
    InvalidBatchEvent {
        index: usize,
        source: ValidationError,
    },
    #[error("batch holds {0} events, the maximum is {1}")]
    PayloadTooLarge(usize, usize),

    #[error("event queue unavailable, please retry")]
    QueueUnavailable,
}

impl CaptureError {
    /// Label for `capture_events_dropped_total`.
    pub fn cause(&self) -> &'static str {
        match self {
            CaptureError::RequestParsingError(_) => "parse_error",
            CaptureError::EmptyBatch => "empty_batch",
            CaptureError::ValidationError(_) | CaptureError::InvalidBatchEvent { .. } => {
                "validation_error"
            }
            CaptureError::PayloadTooLarge(_, _) => "payload_too_large",
            CaptureError::QueueUnavailable => "queue_unavailable",
        }
    }
}

impl IntoResponse for CaptureError {
    fn into_response(self) -> Response {
        let status = match self {
            CaptureError::RequestParsingError(_)
            | CaptureError::EmptyBatch
            | CaptureError::ValidationError(_)
            | CaptureError::InvalidBatchEvent { .. }
            | CaptureError::PayloadTooLarge(_, _) => StatusCode::BAD_REQUEST,

            CaptureError::QueueUnavailable => StatusCode::INTERNAL_SERVER_ERROR,
        };

        (
            status,
            Json(json!({"success": false, "error": self.to_string()})),
        )
            .into_response()
    }
}

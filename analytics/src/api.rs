use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;
use thiserror::Error;
use tracing::error;

use event_common::cache::CacheError;
use event_common::store::StoreError;
use event_common::time::parse_timestamp;

#[derive(Error, Debug)]
pub enum AnalyticsError {
    #[error("{0}")]
    ValidationError(String),
    #[error("persistence failure: {0}")]
    PersistenceError(#[from] StoreError),
    /// The query parameters could not be fingerprinted.
    #[error("query could not be fingerprinted: {0}")]
    FingerprintError(#[from] CacheError),
}

impl IntoResponse for AnalyticsError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            AnalyticsError::ValidationError(message) => (StatusCode::BAD_REQUEST, message),
            AnalyticsError::PersistenceError(_) | AnalyticsError::FingerprintError(_) => {
                error!("analytics query failed: {}", self);
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "internal server error".to_owned(),
                )
            }
        };

        (status, Json(json!({"success": false, "error": message}))).into_response()
    }
}

/// A required, non-blank query parameter.
pub fn required(value: Option<String>, name: &str) -> Result<String, AnalyticsError> {
    match value {
        Some(value) if !value.trim().is_empty() => Ok(value),
        _ => Err(AnalyticsError::ValidationError(format!("{name} is required"))),
    }
}

/// An optional date bound. Blank values count as absent.
pub fn optional_date(
    value: Option<&str>,
    name: &str,
) -> Result<Option<chrono::DateTime<chrono::Utc>>, AnalyticsError> {
    match value.map(str::trim).filter(|v| !v.is_empty()) {
        None => Ok(None),
        Some(value) => parse_timestamp(value)
            .map(Some)
            .map_err(|err| AnalyticsError::ValidationError(format!("invalid {name}: {err}"))),
    }
}

/// An optional integer parameter within `min..=max`.
pub fn bounded(
    value: Option<&str>,
    name: &str,
    default: u32,
    min: u32,
    max: u32,
) -> Result<u32, AnalyticsError> {
    let Some(value) = value.map(str::trim).filter(|v| !v.is_empty()) else {
        return Ok(default);
    };
    match value.parse::<u32>() {
        Ok(parsed) if (min..=max).contains(&parsed) => Ok(parsed),
        _ => Err(AnalyticsError::ValidationError(format!(
            "{name} must be an integer between {min} and {max}"
        ))),
    }
}

/// Reject windows that cannot hold any event.
pub fn check_window(
    start: Option<chrono::DateTime<chrono::Utc>>,
    end: Option<chrono::DateTime<chrono::Utc>>,
) -> Result<(), AnalyticsError> {
    match (start, end) {
        (Some(start), Some(end)) if start >= end => Err(AnalyticsError::ValidationError(
            "startDate must be before endDate".to_owned(),
        )),
        _ => Ok(()),
    }
}

use bytes::Bytes;
use chrono::{DateTime, SecondsFormat, Utc};
use serde::Deserialize;
use serde_json::Value;
use sha2::{Digest, Sha256};
use thiserror::Error;

use event_common::event::{EventRecord, EventScope};
use event_common::metadata::{canonical_json, metadata_from_json, MetadataError};
use event_common::time::{parse_timestamp, TimestampParseError};

use crate::api::CaptureError;

#[derive(Error, Debug, PartialEq, Eq)]
pub enum ValidationError {
    #[error("eventName is required")]
    MissingEventName,
    #[error("userId is required")]
    MissingUserId,
    #[error("invalid timestamp: {0}")]
    InvalidTimestamp(#[from] TimestampParseError),
    #[error("invalid metadata: {0}")]
    InvalidMetadata(#[from] MetadataError),
    #[error("{0} must not contain NUL characters")]
    NulCharacter(&'static str),
}

/// An event as submitted by a client. Every field is optional at this point;
/// `normalize` decides what is required.
#[derive(Default, Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RawEvent {
    pub event_name: Option<String>,
    pub user_id: Option<String>,
    pub org_id: Option<String>,
    pub project_id: Option<String>,
    pub event_id: Option<String>,
    pub metadata: Option<Value>,
    pub timestamp: Option<String>,
}

fn required(value: Option<String>, missing: ValidationError) -> Result<String, ValidationError> {
    match value {
        Some(value) if !value.trim().is_empty() => Ok(value),
        _ => Err(missing),
    }
}

/// Postgres text columns reject `\0`.
fn reject_nul(field: &'static str, value: Option<&str>) -> Result<(), ValidationError> {
    match value {
        Some(value) if value.contains('\0') => Err(ValidationError::NulCharacter(field)),
        _ => Ok(()),
    }
}

impl RawEvent {
    pub fn from_bytes(bytes: &Bytes) -> Result<RawEvent, CaptureError> {
        tracing::debug!(len = bytes.len(), "decoding new event");
        Ok(serde_json::from_slice(bytes)?)
    }

    pub fn batch_from_bytes(bytes: &Bytes) -> Result<Vec<RawEvent>, CaptureError> {
        tracing::debug!(len = bytes.len(), "decoding new batch");
        Ok(serde_json::from_slice(bytes)?)
    }

    /// Validate and canonicalize into a record ingested at `now`.
    ///
    /// Records without a client `eventId` get an `eventHash` over every field
    /// the client sent. The hash uses the client timestamp rather than the
    /// defaulted one, so a resent payload without a timestamp hashes the same.
    pub fn normalize(self, now: DateTime<Utc>) -> Result<EventRecord, ValidationError> {
        let event_name = required(self.event_name, ValidationError::MissingEventName)?;
        let user_id = required(self.user_id, ValidationError::MissingUserId)?;
        for (field, value) in [
            ("eventName", Some(event_name.as_str())),
            ("userId", Some(user_id.as_str())),
            ("orgId", self.org_id.as_deref()),
            ("projectId", self.project_id.as_deref()),
            ("eventId", self.event_id.as_deref()),
        ] {
            reject_nul(field, value)?;
        }
        let scope = EventScope::new(self.org_id, self.project_id);
        let event_id = self.event_id.filter(|id| !id.is_empty());
        let metadata = metadata_from_json(self.metadata)?;
        let client_timestamp = self
            .timestamp
            .as_deref()
            .map(parse_timestamp)
            .transpose()?;

        let event_hash = match event_id {
            Some(_) => None,
            None => {
                let timestamp = client_timestamp
                    .map(|ts| ts.to_rfc3339_opts(SecondsFormat::Millis, true))
                    .unwrap_or_default();
                let parts: [&str; 7] = [
                    scope.org_id.as_deref().unwrap_or_default(),
                    scope.project_id.as_deref().unwrap_or_default(),
                    "",
                    &event_name,
                    &user_id,
                    &timestamp,
                    &canonical_json(&metadata),
                ];
                Some(format!("{:x}", Sha256::digest(parts.join("|").as_bytes())))
            }
        };

        Ok(EventRecord {
            org_id: scope.org_id,
            project_id: scope.project_id,
            event_id,
            event_name,
            user_id,
            metadata,
            timestamp: client_timestamp.unwrap_or(now),
            event_hash,
            created_at: now,
        })
    }
}

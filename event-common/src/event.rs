use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::metadata::Metadata;

/// Tenant tagging of an event: an organisation and a project inside it, both optional.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EventScope {
    pub org_id: Option<String>,
    pub project_id: Option<String>,
}

impl EventScope {
    /// Build a scope, treating empty identifiers as absent.
    pub fn new(org_id: Option<String>, project_id: Option<String>) -> Self {
        Self {
            org_id: org_id.filter(|v| !v.is_empty()),
            project_id: project_id.filter(|v| !v.is_empty()),
        }
    }
}

/// The persisted form of an event.
///
/// Exactly one of `event_id` and `event_hash` is set: the hash is only
/// computed when the client did not supply an identity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EventRecord {
    pub org_id: Option<String>,
    pub project_id: Option<String>,
    pub event_id: Option<String>,
    pub event_name: String,
    pub user_id: String,
    #[serde(default)]
    pub metadata: Metadata,
    pub timestamp: DateTime<Utc>,
    pub event_hash: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// What makes two submissions the same logical event.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Identity {
    EventId(String),
    EventHash(String),
    /// Only reachable for records built without either identity.
    Composite {
        user_id: String,
        event_name: String,
        timestamp: DateTime<Utc>,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct IdentityKey {
    pub scope: EventScope,
    pub identity: Identity,
}

impl EventRecord {
    pub fn scope(&self) -> EventScope {
        EventScope {
            org_id: self.org_id.clone(),
            project_id: self.project_id.clone(),
        }
    }

    pub fn identity(&self) -> Identity {
        match (&self.event_id, &self.event_hash) {
            (Some(id), _) => Identity::EventId(id.clone()),
            (None, Some(hash)) => Identity::EventHash(hash.clone()),
            (None, None) => Identity::Composite {
                user_id: self.user_id.clone(),
                event_name: self.event_name.clone(),
                timestamp: self.timestamp,
            },
        }
    }

    /// Dedup key: the identity within the record's org and project.
    pub fn identity_key(&self) -> IdentityKey {
        IdentityKey {
            scope: self.scope(),
            identity: self.identity(),
        }
    }
}

/// The unit of work carried by the durable queue.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EventBatch {
    pub events: Vec<EventRecord>,
}

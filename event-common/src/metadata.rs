//! Open key-value payload attached to every event.
use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Nesting deeper than this is rejected at ingestion.
pub const MAX_METADATA_DEPTH: usize = 32;

pub type Metadata = BTreeMap<String, MetadataValue>;

/// A JSON-like value. Objects are kept in a `BTreeMap` so that serialization is
/// ordered by key, which is what makes event hashes reproducible.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MetadataValue {
    Null,
    Bool(bool),
    Number(serde_json::Number),
    String(String),
    Array(Vec<MetadataValue>),
    Object(BTreeMap<String, MetadataValue>),
}

#[derive(Error, Debug, PartialEq, Eq)]
pub enum MetadataError {
    #[error("metadata must be a JSON object")]
    NotAnObject,
    #[error("metadata is nested deeper than {MAX_METADATA_DEPTH} levels")]
    TooDeep,
    /// Postgres cannot store `\u0000` in jsonb.
    #[error("metadata must not contain NUL characters")]
    NulCharacter,
}

fn check_text(text: &str) -> Result<(), MetadataError> {
    if text.contains('\0') {
        return Err(MetadataError::NulCharacter);
    }
    Ok(())
}

impl MetadataValue {
    fn from_json(value: serde_json::Value, depth: usize) -> Result<Self, MetadataError> {
        if depth > MAX_METADATA_DEPTH {
            return Err(MetadataError::TooDeep);
        }
        Ok(match value {
            serde_json::Value::Null => MetadataValue::Null,
            serde_json::Value::Bool(b) => MetadataValue::Bool(b),
            serde_json::Value::Number(n) => MetadataValue::Number(n),
            serde_json::Value::String(s) => {
                check_text(&s)?;
                MetadataValue::String(s)
            }
            serde_json::Value::Array(items) => MetadataValue::Array(
                items
                    .into_iter()
                    .map(|item| MetadataValue::from_json(item, depth + 1))
                    .collect::<Result<_, _>>()?,
            ),
            serde_json::Value::Object(map) => MetadataValue::Object(object_from_json(map, depth)?),
        })
    }
}

fn object_from_json(
    map: serde_json::Map<String, serde_json::Value>,
    depth: usize,
) -> Result<Metadata, MetadataError> {
    map.into_iter()
        .map(|(k, v)| {
            check_text(&k)?;
            Ok((k, MetadataValue::from_json(v, depth + 1)?))
        })
        .collect()
}

impl From<&MetadataValue> for serde_json::Value {
    fn from(value: &MetadataValue) -> Self {
        match value {
            MetadataValue::Null => serde_json::Value::Null,
            MetadataValue::Bool(b) => serde_json::Value::Bool(*b),
            MetadataValue::Number(n) => serde_json::Value::Number(n.clone()),
            MetadataValue::String(s) => serde_json::Value::String(s.clone()),
            MetadataValue::Array(items) => {
                serde_json::Value::Array(items.iter().map(serde_json::Value::from).collect())
            }
            MetadataValue::Object(map) => object_to_json(map),
        }
    }
}

fn object_to_json(map: &Metadata) -> serde_json::Value {
    serde_json::Value::Object(
        map.iter()
            .map(|(k, v)| (k.clone(), serde_json::Value::from(v)))
            .collect(),
    )
}

/// Validate a client-supplied metadata value. Absent metadata is an empty map.
pub fn metadata_from_json(value: Option<serde_json::Value>) -> Result<Metadata, MetadataError> {
    match value {
        None | Some(serde_json::Value::Null) => Ok(Metadata::new()),
        Some(serde_json::Value::Object(map)) => object_from_json(map, 1),
        Some(_) => Err(MetadataError::NotAnObject),
    }
}

/// Compact JSON with object keys sorted at every level.
pub fn canonical_json(metadata: &Metadata) -> String {
    object_to_json(metadata).to_string()
}

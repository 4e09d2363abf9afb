//! Generic synchronizable entity envelope

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::NodeId;

/// Field name to value map; ordered so serialized snapshots are stable.
pub type FieldMap = BTreeMap<String, Value>;

/// A single field value.
///
/// Closed set of types every entity field is expressed in. Adjacently tagged on
/// the wire so an integer never decodes as a real or a timestamp as text.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum Value {
    Null,
    Text(String),
    Integer(i64),
    Real(f64),
    Bool(bool),
    Timestamp(DateTime<Utc>),
}

impl Value {
    pub const fn is_null(&self) -> bool {
        matches!(self, Self::Null)
    }

    /// Lowercase type label used in schema checks and error messages
    pub const fn kind_name(&self) -> &'static str {
        match self {
            Self::Null => "null",
            Self::Text(_) => "text",
            Self::Integer(_) => "integer",
            Self::Real(_) => "real",
            Self::Bool(_) => "bool",
            Self::Timestamp(_) => "timestamp",
        }
    }
}

impl From<&str> for Value {
    fn from(value: &str) -> Self {
        Self::Text(value.to_string())
    }
}

impl From<String> for Value {
    fn from(value: String) -> Self {
        Self::Text(value)
    }
}

impl From<i64> for Value {
    fn from(value: i64) -> Self {
        Self::Integer(value)
    }
}

impl From<f64> for Value {
    fn from(value: f64) -> Self {
        Self::Real(value)
    }
}

impl From<bool> for Value {
    fn from(value: bool) -> Self {
        Self::Bool(value)
    }
}

impl From<DateTime<Utc>> for Value {
    fn from(value: DateTime<Utc>) -> Self {
        Self::Timestamp(value)
    }
}

impl<T: Into<Self>> From<Option<T>> for Value {
    fn from(value: Option<T>) -> Self {
        value.map_or(Self::Null, Into::into)
    }
}

/// Serialized state of one entity as it travels inside a packet.
///
/// Carries only synchronizable fields.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntitySnapshot {
    /// Last modification timestamp (Unix ms)
    pub updated_at: i64,
    pub is_deleted: bool,
    /// Node that produced this version
    pub modified_by: Option<NodeId>,
    pub fields: FieldMap,
}

/// A stored entity row, including local-only fields.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntityRecord {
    pub entity_type: String,
    pub uuid: Uuid,
    pub fields: FieldMap,
    /// Creation timestamp (Unix ms)
    pub created_at: i64,
    /// Last modification timestamp (Unix ms), monotonic per entity
    pub updated_at: i64,
    /// Soft delete flag; rows are never physically removed
    pub is_deleted: bool,
    /// Node that produced the current version
    pub modified_by: Option<NodeId>,
}

impl EntityRecord {
    /// Build a new, not yet persisted record stamped with the current time.
    #[must_use]
    pub fn new(entity_type: impl Into<String>, fields: FieldMap, modified_by: Option<NodeId>) -> Self {
        let now = chrono::Utc::now().timestamp_millis();
        Self {
            entity_type: entity_type.into(),
            uuid: Uuid::now_v7(),
            fields,
            created_at: now,
            updated_at: now,
            is_deleted: false,
            modified_by,
        }
    }

    /// Next `updated_at` for a local mutation: wall clock, but never going backwards.
    #[must_use]
    pub fn next_timestamp(&self) -> i64 {
        chrono::Utc::now()
            .timestamp_millis()
            .max(self.updated_at.saturating_add(1))
    }
}

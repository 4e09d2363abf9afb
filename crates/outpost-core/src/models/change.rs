//! Queued change model

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

use super::NodeId;

/// Kind of mutation recorded for an entity
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ChangeOperation {
    Insert,
    Update,
    Delete,
}

impl ChangeOperation {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Insert => "INSERT",
            Self::Update => "UPDATE",
            Self::Delete => "DELETE",
        }
    }

    /// Merge a newer operation into a pending one for the same entity.
    ///
    /// INSERT followed by UPDATE stays an INSERT (the peer has never seen the row);
    /// a DELETE always wins; UPDATE after DELETE is an undelete.
    #[must_use]
    pub const fn coalesce(self, newer: Self) -> Self {
        match (self, newer) {
            (_, Self::Delete) => Self::Delete,
            (Self::Insert, Self::Update) => Self::Insert,
            (_, newer) => newer,
        }
    }
}

impl fmt::Display for ChangeOperation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ChangeOperation {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "INSERT" => Ok(Self::Insert),
            "UPDATE" => Ok(Self::Update),
            "DELETE" => Ok(Self::Delete),
            other => Err(format!("unknown change operation `{other}`")),
        }
    }
}

/// One mutation queued for delivery to one target node
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncChange {
    /// Globally ordered sequence id
    pub id: i64,
    /// Node that must receive this change
    pub node_id: NodeId,
    pub entity_type: String,
    pub entity_uuid: Uuid,
    pub operation: ChangeOperation,
    /// Packet the change was bundled into; `None` while pending
    pub packet_no: Option<i64>,
    /// Creation timestamp (Unix ms)
    pub created_at: i64,
}

impl SyncChange {
    pub const fn is_pending(&self) -> bool {
        self.packet_no.is_none()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn coalesce_insert_then_update_stays_insert() {
        assert_eq!(
            ChangeOperation::Insert.coalesce(ChangeOperation::Update),
            ChangeOperation::Insert
        );
    }

    #[test]
    fn coalesce_delete_always_wins() {
        assert_eq!(
            ChangeOperation::Insert.coalesce(ChangeOperation::Delete),
            ChangeOperation::Delete
        );
        assert_eq!(
            ChangeOperation::Update.coalesce(ChangeOperation::Delete),
            ChangeOperation::Delete
        );
    }

    #[test]
    fn coalesce_update_after_delete_is_undelete() {
        assert_eq!(
            ChangeOperation::Delete.coalesce(ChangeOperation::Update),
            ChangeOperation::Update
        );
    }

    #[test]
    fn operation_parses_case_insensitively() {
        assert_eq!("insert".parse(), Ok(ChangeOperation::Insert));
        assert_eq!(" DELETE ".parse(), Ok(ChangeOperation::Delete));
        assert!("upsert".parse::<ChangeOperation>().is_err());
    }
}

//! Object version history model

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

use super::NodeId;

/// How a conflict was (or will be) settled
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConflictResolution {
    /// The central server kept its own version
    ServerWins,
    /// The later `updated_at` prevailed
    TimestampWins,
    /// Deferred to an operator; local version untouched
    Manual,
}

impl ConflictResolution {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::ServerWins => "server_wins",
            Self::TimestampWins => "timestamp_wins",
            Self::Manual => "manual",
        }
    }
}

impl fmt::Display for ConflictResolution {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ConflictResolution {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "server_wins" => Ok(Self::ServerWins),
            "timestamp_wins" => Ok(Self::TimestampWins),
            "manual" => Ok(Self::Manual),
            other => Err(format!("unknown conflict strategy `{other}`")),
        }
    }
}

/// Archived losing (or deferred) version of a conflicting entity.
///
/// Append-only: rows are never updated or deleted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ObjectVersion {
    pub id: Uuid,
    pub entity_uuid: Uuid,
    pub entity_type: String,
    /// Node that produced this version
    pub source_node_id: Option<NodeId>,
    /// Node whose resolver archived it
    pub resolved_by: NodeId,
    /// Time the version reached the resolver (Unix ms)
    pub arrival_time: i64,
    /// Full JSON snapshot of the version
    pub serialized_data: String,
    pub conflict_resolution: ConflictResolution,
    /// Set once an operator settled a manual conflict (Unix ms)
    pub manually_resolved_at: Option<i64>,
}

impl ObjectVersion {
    /// Whether this row still awaits an operator decision
    pub const fn is_pending_review(&self) -> bool {
        matches!(self.conflict_resolution, ConflictResolution::Manual)
            && self.manually_resolved_at.is_none()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resolution_round_trips_through_str() {
        for resolution in [
            ConflictResolution::ServerWins,
            ConflictResolution::TimestampWins,
            ConflictResolution::Manual,
        ] {
            assert_eq!(resolution.as_str().parse(), Ok(resolution));
        }
    }

    #[test]
    fn only_unresolved_manual_rows_are_pending() {
        let mut version = ObjectVersion {
            id: Uuid::now_v7(),
            entity_uuid: Uuid::now_v7(),
            entity_type: "estimate".to_string(),
            source_node_id: None,
            resolved_by: NodeId::new(),
            arrival_time: 1,
            serialized_data: "{}".to_string(),
            conflict_resolution: ConflictResolution::Manual,
            manually_resolved_at: None,
        };
        assert!(version.is_pending_review());

        version.manually_resolved_at = Some(2);
        assert!(!version.is_pending_review());

        version.conflict_resolution = ConflictResolution::ServerWins;
        version.manually_resolved_at = None;
        assert!(!version.is_pending_review());
    }
}

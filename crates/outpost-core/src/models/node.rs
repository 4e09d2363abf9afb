//! Sync node model

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// A unique identifier for a sync participant, using UUID v7 (time-sortable)
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NodeId(Uuid);

impl NodeId {
    /// Create a new unique node ID using UUID v7
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }

    /// Get the string representation of this ID
    #[must_use]
    pub fn as_str(&self) -> String {
        self.0.to_string()
    }

    /// Underlying UUID
    pub const fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl Default for NodeId {
    fn default() -> Self {
        Self::new()
    }
}

impl From<Uuid> for NodeId {
    fn from(value: Uuid) -> Self {
        Self(value)
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for NodeId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Self(Uuid::parse_str(s)?))
    }
}

/// Which side of the star topology a database plays.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeRole {
    /// The central authority every client exchanges with
    Server,
    /// A desktop node that syncs with the server
    Client,
}

impl NodeRole {
    pub const fn is_server(self) -> bool {
        matches!(self, Self::Server)
    }
}

/// A participant in the sync topology.
///
/// Every database holds one row for itself (`is_local`) and one row per peer
/// it exchanges packets with. Packet counters on a peer row are this
/// database's view of traffic with that peer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncNode {
    pub id: NodeId,
    /// Human-readable unique code
    pub code: String,
    pub name: String,
    pub description: Option<String>,
    pub is_server: bool,
    pub is_local: bool,
    pub is_active: bool,
    /// Registration timestamp (Unix ms)
    pub registered_at: i64,
    /// Last time a packet from this node was applied (Unix ms)
    pub last_sync_in: Option<i64>,
    /// Last time this node acknowledged one of our packets (Unix ms)
    pub last_sync_out: Option<i64>,
    /// Highest packet number received from this node and applied
    pub received_packet_no: i64,
    /// Highest packet number sent to this node and acknowledged
    pub sent_packet_no: i64,
    /// Entity schema version last advertised by this node
    pub schema_version: Option<u32>,
}

impl SyncNode {
    /// Build a fresh node row with zeroed counters.
    #[must_use]
    pub fn new(id: NodeId, code: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id,
            code: code.into(),
            name: name.into(),
            description: None,
            is_server: false,
            is_local: false,
            is_active: true,
            registered_at: chrono::Utc::now().timestamp_millis(),
            last_sync_in: None,
            last_sync_out: None,
            received_packet_no: 0,
            sent_packet_no: 0,
            schema_version: None,
        }
    }
}

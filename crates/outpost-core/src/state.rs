//! Sync orchestrator state shared with front-ends.

use serde::Serialize;

/// Lifecycle of a node's sync loop.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum SyncState {
    /// No identity yet
    Unregistered,
    /// Registration request in flight
    Registering,
    /// Registered and waiting for the next trigger
    Idle,
    /// A cycle is running
    Syncing,
    /// Last cycle failed; `blocking` errors need an upgrade before sync resumes
    Error { blocking: bool, message: String },
}

impl SyncState {
    pub const fn is_blocked(&self) -> bool {
        matches!(self, Self::Error { blocking: true, .. })
    }

    pub const fn label(&self) -> &'static str {
        match self {
            Self::Unregistered => "unregistered",
            Self::Registering => "registering",
            Self::Idle => "idle",
            Self::Syncing => "syncing",
            Self::Error { blocking: true, .. } => "blocked",
            Self::Error { .. } => "error",
        }
    }
}

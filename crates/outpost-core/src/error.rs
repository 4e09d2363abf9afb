//! Error types for outpost-core

use thiserror::Error;

use crate::sync::{PacketError, TransportError};

/// Result type alias using outpost-core's Error
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in outpost-core operations
#[derive(Error, Debug)]
pub enum Error {
    /// Database error
    #[error("Database error: {0}")]
    Database(String),

    /// libSQL error
    #[error("libSQL error: {0}")]
    LibSql(#[from] libsql::Error),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Record or node not found
    #[error("Not found: {0}")]
    NotFound(String),

    /// Invalid input
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// A node with the same code is already registered
    #[error("Duplicate node code: {0}")]
    DuplicateCode(String),

    /// Token missing, malformed, expired, or bound to an inactive node
    #[error("Authentication failed: {0}")]
    Auth(String),

    /// Packet could not be encoded, decoded, or validated
    #[error("Packet error: {0}")]
    Packet(#[from] PacketError),

    /// Peer advertises an entity schema outside our compatible range
    #[error("Upgrade required: peer schema version {remote} is incompatible with local {local} (min {min_compatible})")]
    SchemaIncompatible {
        local: u32,
        min_compatible: u32,
        remote: u32,
    },

    /// Network transport failure
    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    /// Retry budget exhausted for a packet
    #[error("Sync failed after {attempts} attempts: {last_error}")]
    RetriesExhausted {
        attempts: u32,
        last_error: TransportError,
    },

    /// Local node has no identity yet
    #[error("Node is not registered with a sync server")]
    NotRegistered,

    /// Sync halted until the local schema changes
    #[error("Sync is blocked until the local schema is upgraded past version {0}")]
    SchemaBlocked(u32),

    /// Operation was cancelled before it started writing
    #[error("Sync cycle cancelled")]
    Cancelled,

    /// Operation not valid in the current state
    #[error("Invalid state: {0}")]
    InvalidState(String),
}

impl Error {
    /// Whether the failure needs an external fix (client upgrade) before sync can resume.
    pub const fn is_blocking(&self) -> bool {
        matches!(
            self,
            Self::SchemaIncompatible { .. } | Self::SchemaBlocked(_)
        )
    }
}

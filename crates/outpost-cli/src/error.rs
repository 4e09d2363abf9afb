use std::io;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum CliError {
    #[error(transparent)]
    Core(#[from] outpost_core::Error),
    #[error(transparent)]
    Io(#[from] io::Error),
    #[error(transparent)]
    Serialization(#[from] serde_json::Error),
    #[error(transparent)]
    LogFilter(#[from] tracing_subscriber::filter::ParseError),
    #[error("No entity schema given. Pass --schema or set OUTPOST_SCHEMA_PATH.")]
    SchemaNotConfigured,
    #[error(
        "No sync server configured. Pass --server-url or set OUTPOST_SERVER_URL (it is remembered after `outpost register`)."
    )]
    ServerNotConfigured,
    #[error("Unknown entity type: {0}")]
    UnknownEntityType(String),
    #[error("Invalid field argument `{0}`: {1}")]
    InvalidField(String, String),
    #[error("Invalid id `{0}`: expected a UUID")]
    InvalidId(String),
    #[error("Record not found: {0}")]
    RecordNotFound(String),
    #[error("Packet #{0} rejected: {1}")]
    PacketRejected(i64, String),
    #[error("Conflict version not found: {0}")]
    ConflictNotFound(String),
}

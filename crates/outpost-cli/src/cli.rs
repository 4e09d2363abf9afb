use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};

#[derive(Parser)]
#[command(name = "outpost")]
#[command(about = "Keep a desktop node's records in sync with its Outpost server")]
#[command(version)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    #[command(flatten)]
    pub global: GlobalArgs,
}

#[derive(Args, Debug, Clone, Default)]
pub struct GlobalArgs {
    /// Path to the local database file (or `OUTPOST_DB_PATH`)
    #[arg(long, global = true, value_name = "PATH")]
    pub db_path: Option<PathBuf>,

    /// Entity schema file shared with the server (or `OUTPOST_SCHEMA_PATH`)
    #[arg(long, global = true, value_name = "PATH")]
    pub schema: Option<PathBuf>,

    /// Sync server base URL (or `OUTPOST_SERVER_URL`; remembered after registration)
    #[arg(long, global = true, value_name = "URL")]
    pub server_url: Option<String>,

    /// Output as JSON
    #[arg(long, global = true)]
    pub json: bool,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Register this node with the sync server
    Register {
        /// Unique node code (letters, digits, `-` and `_`)
        code: String,
        /// Display name
        name: String,
        /// Optional description
        #[arg(long)]
        description: Option<String>,
    },
    /// Run one sync cycle
    Sync,
    /// Keep syncing on the configured interval until interrupted
    Daemon,
    /// Show this node's identity, peers and queue
    Status,
    /// Inspect and manage the outbound change queue
    Queue {
        #[command(subcommand)]
        command: QueueCommands,
    },
    /// List and resolve sync conflicts
    Conflicts {
        #[command(subcommand)]
        command: ConflictCommands,
    },
    /// Read and edit synchronized records
    Record {
        #[command(subcommand)]
        command: RecordCommands,
    },
}

#[derive(Subcommand)]
pub enum QueueCommands {
    /// Show pending changes and unacknowledged packets
    List {
        /// Only entries for this peer code
        #[arg(long, value_name = "CODE")]
        peer: Option<String>,
    },
    /// Drop a pending change before it is bundled (its edit is never sent)
    Remove {
        /// Change id from `queue list`
        id: i64,
    },
    /// Write the next packet for a peer to a file
    Export {
        /// Peer node code
        peer: String,
        /// Output file
        path: PathBuf,
    },
    /// Apply a packet file written by a peer
    Import {
        /// Packet file
        path: PathBuf,
    },
}

#[derive(Subcommand)]
pub enum ConflictCommands {
    /// List archived conflict versions
    List {
        /// Only conflicts waiting for manual resolution
        #[arg(long)]
        pending: bool,
    },
    /// Settle a pending conflict with the given field values
    Resolve {
        /// Version id from `conflicts list`
        version_id: String,
        /// `field=value` pairs, or one JSON object of tagged values
        #[arg(required = true)]
        fields: Vec<String>,
    },
}

#[derive(Subcommand)]
pub enum RecordCommands {
    /// Create a record
    #[command(alias = "add")]
    Put {
        /// Entity type from the schema
        entity_type: String,
        /// `field=value` pairs, or one JSON object of tagged values
        #[arg(required = true)]
        fields: Vec<String>,
    },
    /// Change fields of an existing record
    Update {
        entity_type: String,
        uuid: String,
        #[arg(required = true)]
        fields: Vec<String>,
    },
    /// Soft-delete a record
    Delete { entity_type: String, uuid: String },
    /// Restore a soft-deleted record
    Undelete { entity_type: String, uuid: String },
    /// Show one record
    Show { entity_type: String, uuid: String },
    /// List records of one type
    List {
        entity_type: String,
        /// Include soft-deleted records
        #[arg(long)]
        deleted: bool,
    },
}

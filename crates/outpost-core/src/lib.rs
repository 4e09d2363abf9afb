//! outpost-core - Core library for Outpost
//!
//! Offline-first record synchronization between desktop nodes and one central
//! server: the storage layer, change tracking, packet exchange, conflict
//! resolution and the client sync driver shared by the server and the CLI.

pub mod config;
pub mod db;
pub mod error;
pub mod models;
pub mod services;
pub mod state;
pub mod sync;
pub mod util;

pub use config::SyncSettings;
pub use error::{Error, Result};
pub use models::{
    ChangeOperation, ConflictResolution, EntityRecord, EntitySnapshot, FieldMap, NodeId,
    NodeRole, SchemaRegistry, SyncNode, Value,
};
pub use services::{DatabaseService, RecordService};
pub use state::SyncState;
pub use sync::SyncContext;

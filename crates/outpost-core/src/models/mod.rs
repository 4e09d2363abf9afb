//! Data models for Outpost

mod change;
mod entity;
mod node;
mod schema;
mod version;

pub use change::{ChangeOperation, SyncChange};
pub use entity::{EntityRecord, EntitySnapshot, FieldMap, Value};
pub use node::{NodeId, NodeRole, SyncNode};
pub use schema::{EntitySchema, FieldDef, FieldKind, SchemaRegistry};
pub use version::{ConflictResolution, ObjectVersion};

//! Explicitly constructed dependencies of one sync core.

use std::sync::Arc;

use crate::config::SyncSettings;
use crate::db::{LibSqlNodeRepository, NodeRepository};
use crate::error::{Error, Result};
use crate::models::{NodeRole, SchemaRegistry, SyncNode};
use crate::services::DatabaseService;

/// Everything a sync component needs: storage, entity schema, tunables, role.
///
/// Cheap to clone; independent instances share nothing.
#[derive(Clone)]
pub struct SyncContext {
    db: DatabaseService,
    schema: Arc<SchemaRegistry>,
    settings: Arc<SyncSettings>,
    role: NodeRole,
}

impl std::fmt::Debug for SyncContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyncContext")
            .field("db_path", &self.db.path())
            .field("schema_version", &self.schema.version())
            .field("role", &self.role)
            .finish_non_exhaustive()
    }
}

impl SyncContext {
    pub fn new(
        db: DatabaseService,
        schema: SchemaRegistry,
        settings: SyncSettings,
        role: NodeRole,
    ) -> Self {
        Self {
            db,
            schema: Arc::new(schema),
            settings: Arc::new(settings),
            role,
        }
    }

    pub const fn db(&self) -> &DatabaseService {
        &self.db
    }

    pub fn schema(&self) -> &SchemaRegistry {
        &self.schema
    }

    pub fn settings(&self) -> &SyncSettings {
        &self.settings
    }

    pub const fn role(&self) -> NodeRole {
        self.role
    }

    /// This node's identity; `NotRegistered` until one exists.
    pub async fn local_node(&self) -> Result<SyncNode> {
        let db = self.db.lock().await;
        LibSqlNodeRepository::new(db.connection())
            .local()
            .await?
            .ok_or(Error::NotRegistered)
    }
}

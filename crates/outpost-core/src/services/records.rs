//! Generic record editing for any registered entity type.
//!
//! Every write stores the entity and registers its change in one transaction.

use libsql::Connection;
use uuid::Uuid;

use crate::db::{EntityRepository, LibSqlEntityRepository, LibSqlNodeRepository, NodeRepository};
use crate::error::{Error, Result};
use crate::models::{ChangeOperation, EntityRecord, FieldMap, NodeId};
use crate::sync::tracker::register_change;
use crate::sync::SyncContext;

/// Create, edit, soft-delete and read entities through the change tracker.
#[derive(Debug, Clone)]
pub struct RecordService {
    ctx: SyncContext,
}

impl RecordService {
    pub const fn new(ctx: SyncContext) -> Self {
        Self { ctx }
    }

    pub async fn create(&self, entity_type: &str, fields: FieldMap) -> Result<EntityRecord> {
        self.ctx.schema().validate_local(entity_type, &fields)?;

        let db = self.ctx.db().lock().await;
        db.begin().await?;
        let result = async {
            let conn = db.connection();
            let record = EntityRecord::new(entity_type, fields, local_node_id(conn).await?);
            LibSqlEntityRepository::new(conn).upsert(&record).await?;
            register_change(conn, entity_type, &record.uuid, ChangeOperation::Insert, None).await?;
            Ok(record)
        }
        .await;
        let record = db.finish(result).await?;

        tracing::debug!(entity_type, uuid = %record.uuid, "Created record");
        Ok(record)
    }

    /// Merge `fields` into an existing record.
    pub async fn update(&self, entity_type: &str, uuid: &Uuid, fields: FieldMap) -> Result<EntityRecord> {
        self.ctx.schema().validate_local(entity_type, &fields)?;
        self.mutate(entity_type, uuid, ChangeOperation::Update, |record| {
            record.fields.extend(fields);
            true
        })
        .await
    }

    /// Soft-delete; deleting a deleted record changes nothing.
    pub async fn delete(&self, entity_type: &str, uuid: &Uuid) -> Result<EntityRecord> {
        self.mutate(entity_type, uuid, ChangeOperation::Delete, |record| {
            !std::mem::replace(&mut record.is_deleted, true)
        })
        .await
    }

    /// Clear the delete flag; the change travels as an update.
    pub async fn undelete(&self, entity_type: &str, uuid: &Uuid) -> Result<EntityRecord> {
        self.mutate(entity_type, uuid, ChangeOperation::Update, |record| {
            std::mem::replace(&mut record.is_deleted, false)
        })
        .await
    }

    pub async fn get(&self, entity_type: &str, uuid: &Uuid) -> Result<Option<EntityRecord>> {
        let db = self.ctx.db().lock().await;
        LibSqlEntityRepository::new(db.connection())
            .get(entity_type, uuid)
            .await
    }

    pub async fn list(&self, entity_type: &str, include_deleted: bool) -> Result<Vec<EntityRecord>> {
        if self.ctx.schema().schema(entity_type).is_none() {
            return Err(Error::InvalidInput(format!(
                "unknown entity type `{entity_type}`"
            )));
        }
        let db = self.ctx.db().lock().await;
        LibSqlEntityRepository::new(db.connection())
            .list(entity_type, include_deleted)
            .await
    }

    /// Load, edit, and store a record; `edit` returns whether anything changed.
    async fn mutate(
        &self,
        entity_type: &str,
        uuid: &Uuid,
        operation: ChangeOperation,
        edit: impl FnOnce(&mut EntityRecord) -> bool,
    ) -> Result<EntityRecord> {
        let db = self.ctx.db().lock().await;
        db.begin().await?;
        let result = async {
            let conn = db.connection();
            let entities = LibSqlEntityRepository::new(conn);
            let mut record = entities
                .get(entity_type, uuid)
                .await?
                .ok_or_else(|| Error::NotFound(format!("{entity_type} {uuid}")))?;

            let before = record.clone();
            if !edit(&mut record) {
                return Ok((record, false));
            }

            // Local-only edits keep the sync version and queue nothing.
            let schema = self.ctx.schema();
            if record.is_deleted == before.is_deleted
                && schema.synced_fields(entity_type, &record.fields)?
                    == schema.synced_fields(entity_type, &before.fields)?
            {
                entities.upsert(&record).await?;
                return Ok((record, false));
            }

            record.updated_at = record.next_timestamp();
            record.modified_by = local_node_id(conn).await?;
            entities.upsert(&record).await?;
            register_change(conn, entity_type, uuid, operation, None).await?;
            Ok((record, true))
        }
        .await;
        let (record, queued) = db.finish(result).await?;

        tracing::debug!(entity_type, %uuid, %operation, queued, "Updated record");
        Ok(record)
    }
}

async fn local_node_id(conn: &Connection) -> Result<Option<NodeId>> {
    Ok(LibSqlNodeRepository::new(conn).local().await?.map(|node| node.id))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SyncSettings;
    use crate::db::{ChangeRepository, LibSqlChangeRepository};
    use crate::models::{EntitySchema, FieldDef, FieldKind, NodeRole, SchemaRegistry, SyncNode, Value};
    use crate::services::DatabaseService;
    use pretty_assertions::assert_eq;

    fn schema() -> SchemaRegistry {
        let mut registry = SchemaRegistry::new(1);
        registry
            .register(EntitySchema {
                entity_type: "timesheet".to_string(),
                fields: vec![
                    FieldDef {
                        name: "hours".to_string(),
                        kind: FieldKind::Real,
                        synced: true,
                        nullable: false,
                    },
                    FieldDef {
                        name: "note".to_string(),
                        kind: FieldKind::Text,
                        synced: true,
                        nullable: true,
                    },
                    FieldDef {
                        name: "pinned".to_string(),
                        kind: FieldKind::Bool,
                        synced: false,
                        nullable: true,
                    },
                ],
            })
            .unwrap();
        registry
    }

    async fn setup() -> (RecordService, DatabaseService, NodeId) {
        let db = DatabaseService::open_in_memory().await.unwrap();
        let peer = NodeId::new();
        {
            let guard = db.lock().await;
            let nodes = LibSqlNodeRepository::new(guard.connection());
            let mut local = SyncNode::new(NodeId::new(), "desk-01", "Desk");
            local.is_local = true;
            nodes.insert(&local).await.unwrap();
            let mut server = SyncNode::new(peer, "hq", "Head office");
            server.is_server = true;
            nodes.insert(&server).await.unwrap();
        }
        let ctx = SyncContext::new(db.clone(), schema(), SyncSettings::default(), NodeRole::Client);
        (RecordService::new(ctx), db, peer)
    }

    fn hours(value: f64) -> FieldMap {
        let mut fields = FieldMap::new();
        fields.insert("hours".to_string(), Value::Real(value));
        fields
    }

    async fn queued(db: &DatabaseService, peer: &NodeId) -> Vec<ChangeOperation> {
        let guard = db.lock().await;
        LibSqlChangeRepository::new(guard.connection())
            .pending(peer, 100)
            .await
            .unwrap()
            .into_iter()
            .map(|change| change.operation)
            .collect()
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn create_queues_insert_for_peer() {
        let (service, db, peer) = setup().await;
        let record = service.create("timesheet", hours(7.5)).await.unwrap();

        assert!(record.modified_by.is_some());
        assert_eq!(queued(&db, &peer).await, vec![ChangeOperation::Insert]);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn invalid_fields_write_nothing() {
        let (service, db, peer) = setup().await;
        let mut fields = hours(1.0);
        fields.insert("hours".to_string(), Value::Text("one".to_string()));

        assert!(service.create("timesheet", fields).await.is_err());
        assert!(service.create("invoice", FieldMap::new()).await.is_err());
        assert!(queued(&db, &peer).await.is_empty());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn update_merges_fields_and_bumps_timestamp() {
        let (service, db, peer) = setup().await;
        let created = service.create("timesheet", hours(4.0)).await.unwrap();

        let mut note = FieldMap::new();
        note.insert("note".to_string(), Value::from("site visit"));
        let updated = service.update("timesheet", &created.uuid, note).await.unwrap();

        assert!(updated.updated_at > created.updated_at);
        assert_eq!(updated.fields.get("hours"), Some(&Value::Real(4.0)));
        assert_eq!(updated.fields.get("note"), Some(&Value::from("site visit")));
        // Coalesced into the pending insert.
        assert_eq!(queued(&db, &peer).await, vec![ChangeOperation::Insert]);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn local_only_update_keeps_sync_version() {
        let (service, db, peer) = setup().await;
        let created = service.create("timesheet", hours(3.0)).await.unwrap();
        let deleted = service.delete("timesheet", &created.uuid).await.unwrap();
        assert_eq!(queued(&db, &peer).await, vec![ChangeOperation::Delete]);

        let mut pinned = FieldMap::new();
        pinned.insert("pinned".to_string(), Value::Bool(true));
        let updated = service.update("timesheet", &created.uuid, pinned).await.unwrap();

        assert_eq!(updated.fields.get("pinned"), Some(&Value::Bool(true)));
        assert_eq!(updated.updated_at, deleted.updated_at);
        assert_eq!(updated.modified_by, deleted.modified_by);
        assert_eq!(queued(&db, &peer).await, vec![ChangeOperation::Delete]);

        let stored = service.get("timesheet", &created.uuid).await.unwrap().unwrap();
        assert_eq!(stored, updated);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn delete_and_undelete_are_soft() {
        let (service, db, peer) = setup().await;
        let created = service.create("timesheet", hours(2.0)).await.unwrap();

        let deleted = service.delete("timesheet", &created.uuid).await.unwrap();
        assert!(deleted.is_deleted);
        assert!(service.list("timesheet", false).await.unwrap().is_empty());
        assert_eq!(service.list("timesheet", true).await.unwrap().len(), 1);
        assert_eq!(queued(&db, &peer).await, vec![ChangeOperation::Delete]);

        let again = service.delete("timesheet", &created.uuid).await.unwrap();
        assert_eq!(again.updated_at, deleted.updated_at);

        let restored = service.undelete("timesheet", &created.uuid).await.unwrap();
        assert!(!restored.is_deleted);
        assert_eq!(queued(&db, &peer).await, vec![ChangeOperation::Update]);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn missing_record_is_not_found() {
        let (service, _db, _peer) = setup().await;
        let err = service
            .delete("timesheet", &Uuid::now_v7())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::NotFound(_)));
    }
}

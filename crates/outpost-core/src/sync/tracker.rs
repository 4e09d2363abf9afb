//! Change tracking: the outbound queue and applying incoming entity versions.
//!
//! Every function here runs on a connection the caller already holds, so it
//! joins whatever transaction the caller opened. Local edits and applied remote
//! versions both register their changes through [`register_change`]; the
//! `origin` argument is what keeps a remote change from being echoed back.

use libsql::Connection;
use uuid::Uuid;

use super::packet::PacketEntry;
use crate::db::{
    ChangeRepository, EntityRepository, LibSqlChangeRepository, LibSqlEntityRepository,
    LibSqlNodeRepository, NodeRepository,
};
use crate::error::{Error, Result};
use crate::models::{
    ChangeOperation, EntityRecord, EntitySnapshot, FieldMap, NodeId, SchemaRegistry, SyncChange,
};
use crate::util::now_ms;

/// Both versions of an entity that changed on each side since the last exchange
#[derive(Debug, Clone, PartialEq)]
pub struct ConflictDetails {
    pub entity_type: String,
    pub entity_uuid: Uuid,
    pub operation: ChangeOperation,
    /// Node the incoming version came from
    pub origin: NodeId,
    pub local: EntityRecord,
    pub incoming: EntitySnapshot,
    pub base_updated_at: Option<i64>,
}

/// Result of applying one incoming change
#[derive(Debug, Clone, PartialEq)]
pub enum ApplyOutcome {
    Applied,
    Conflict(Box<ConflictDetails>),
    Rejected(String),
}

/// Queue a local mutation for every active peer except `origin`.
///
/// Returns the number of peers the change was queued for.
pub async fn register_change(
    conn: &Connection,
    entity_type: &str,
    entity_uuid: &Uuid,
    operation: ChangeOperation,
    origin: Option<&NodeId>,
) -> Result<usize> {
    let peers = LibSqlNodeRepository::new(conn).active_peers().await?;
    let changes = LibSqlChangeRepository::new(conn);
    let created_at = now_ms();

    let mut queued = 0;
    for peer in peers.iter().filter(|peer| Some(&peer.id) != origin) {
        changes
            .enqueue(&peer.id, entity_type, entity_uuid, operation, created_at)
            .await?;
        queued += 1;
    }

    tracing::debug!(entity_type, %entity_uuid, %operation, queued, "Registered change");
    Ok(queued)
}

/// Queue a change for one specific node.
pub async fn enqueue_for(
    conn: &Connection,
    target: &NodeId,
    entity_type: &str,
    entity_uuid: &Uuid,
    operation: ChangeOperation,
) -> Result<SyncChange> {
    LibSqlChangeRepository::new(conn)
        .enqueue(target, entity_type, entity_uuid, operation, now_ms())
        .await
}

/// Queue every stored entity for `target`, used when a node joins.
pub async fn enqueue_snapshot(conn: &Connection, target: &NodeId) -> Result<usize> {
    let keys = LibSqlEntityRepository::new(conn).keys().await?;
    let changes = LibSqlChangeRepository::new(conn);
    let created_at = now_ms();

    for (entity_type, uuid, is_deleted) in &keys {
        let operation = if *is_deleted {
            ChangeOperation::Delete
        } else {
            ChangeOperation::Insert
        };
        changes
            .enqueue(target, entity_type, uuid, operation, created_at)
            .await?;
    }

    if !keys.is_empty() {
        tracing::info!(target_node = %target, entities = keys.len(), "Queued initial snapshot");
    }
    Ok(keys.len())
}

/// Unbundled changes for `target`, oldest first.
pub async fn get_pending_changes(
    conn: &Connection,
    target: &NodeId,
    limit: usize,
) -> Result<Vec<SyncChange>> {
    LibSqlChangeRepository::new(conn).pending(target, limit).await
}

/// Snapshot of the synchronizable state of one entity, `None` if it does not exist.
pub async fn serialize_entity(
    conn: &Connection,
    schema: &SchemaRegistry,
    entity_type: &str,
    entity_uuid: &Uuid,
) -> Result<Option<EntitySnapshot>> {
    let Some(record) = LibSqlEntityRepository::new(conn)
        .get(entity_type, entity_uuid)
        .await?
    else {
        return Ok(None);
    };
    snapshot_of(schema, &record).map(Some)
}

/// Snapshot of an already loaded record
pub fn snapshot_of(schema: &SchemaRegistry, record: &EntityRecord) -> Result<EntitySnapshot> {
    Ok(EntitySnapshot {
        updated_at: record.updated_at,
        is_deleted: record.is_deleted,
        modified_by: record.modified_by,
        fields: schema.synced_fields(&record.entity_type, &record.fields)?,
    })
}

/// Apply one incoming change from `origin`.
///
/// Nothing is written when the outcome is `Conflict` or `Rejected`.
pub async fn apply_change(
    conn: &Connection,
    schema: &SchemaRegistry,
    origin: &NodeId,
    entry: &PacketEntry,
) -> Result<ApplyOutcome> {
    if let Err(error) = schema.validate_incoming(&entry.entity_type, &entry.data.fields) {
        return match error {
            Error::InvalidInput(reason) => Ok(ApplyOutcome::Rejected(reason)),
            other => Err(other),
        };
    }

    let entities = LibSqlEntityRepository::new(conn);
    let local = entities.get(&entry.entity_type, &entry.entity_uuid).await?;
    let incoming = incoming_snapshot(entry);

    if let Some(local) = &local {
        if is_same_version(schema, local, &incoming)? {
            entities
                .set_peer_state(
                    &entry.entity_type,
                    &entry.entity_uuid,
                    origin,
                    incoming.updated_at,
                )
                .await?;
            return Ok(ApplyOutcome::Applied);
        }

        let changed_locally = entry
            .base_updated_at
            .map_or(true, |base| local.updated_at > base);
        if changed_locally {
            return Ok(ApplyOutcome::Conflict(Box::new(ConflictDetails {
                entity_type: entry.entity_type.clone(),
                entity_uuid: entry.entity_uuid,
                operation: entry.operation,
                origin: *origin,
                local: local.clone(),
                incoming,
                base_updated_at: entry.base_updated_at,
            })));
        }
    }

    write_incoming(
        conn,
        schema,
        origin,
        &entry.entity_type,
        &entry.entity_uuid,
        local.as_ref(),
        &incoming,
    )
    .await?;
    Ok(ApplyOutcome::Applied)
}

/// Store `incoming` as the live version, keep local-only fields, forward the
/// change to every other peer and record that `origin` now has this version.
pub(crate) async fn write_incoming(
    conn: &Connection,
    schema: &SchemaRegistry,
    origin: &NodeId,
    entity_type: &str,
    entity_uuid: &Uuid,
    local: Option<&EntityRecord>,
    incoming: &EntitySnapshot,
) -> Result<()> {
    let record = EntityRecord {
        entity_type: entity_type.to_string(),
        uuid: *entity_uuid,
        fields: merge_local_only(schema, local, &incoming.fields)?,
        created_at: local.map_or(incoming.updated_at, |local| local.created_at),
        updated_at: incoming.updated_at,
        is_deleted: incoming.is_deleted,
        modified_by: incoming.modified_by,
    };

    let entities = LibSqlEntityRepository::new(conn);
    entities.upsert(&record).await?;
    entities
        .set_peer_state(entity_type, entity_uuid, origin, incoming.updated_at)
        .await?;

    LibSqlChangeRepository::new(conn)
        .discard_pending_for_entity(origin, entity_type, entity_uuid)
        .await?;

    let operation = match (local, incoming.is_deleted) {
        (_, true) => ChangeOperation::Delete,
        (None, false) => ChangeOperation::Insert,
        (Some(_), false) => ChangeOperation::Update,
    };
    register_change(conn, entity_type, entity_uuid, operation, Some(origin)).await?;
    Ok(())
}

fn incoming_snapshot(entry: &PacketEntry) -> EntitySnapshot {
    let mut snapshot = entry.data.clone();
    if entry.operation == ChangeOperation::Delete {
        snapshot.is_deleted = true;
    }
    snapshot
}

fn is_same_version(
    schema: &SchemaRegistry,
    local: &EntityRecord,
    incoming: &EntitySnapshot,
) -> Result<bool> {
    Ok(local.updated_at == incoming.updated_at
        && local.is_deleted == incoming.is_deleted
        && schema.synced_fields(&local.entity_type, &local.fields)? == incoming.fields)
}

fn merge_local_only(
    schema: &SchemaRegistry,
    local: Option<&EntityRecord>,
    incoming: &FieldMap,
) -> Result<FieldMap> {
    let mut fields = incoming.clone();
    let Some(local) = local else {
        return Ok(fields);
    };
    let Some(entity_schema) = schema.schema(&local.entity_type) else {
        return Err(Error::InvalidInput(format!(
            "unknown entity type `{}`",
            local.entity_type
        )));
    };

    for (name, value) in &local.fields {
        if entity_schema.field(name).is_some_and(|field| !field.synced) {
            fields.insert(name.clone(), value.clone());
        }
    }
    Ok(fields)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::Database;
    use crate::models::{EntitySchema, FieldDef, FieldKind, SyncNode, Value};
    use pretty_assertions::assert_eq;

    fn schema() -> SchemaRegistry {
        let mut registry = SchemaRegistry::new(1);
        registry
            .register(EntitySchema {
                entity_type: "estimate".to_string(),
                fields: vec![
                    FieldDef {
                        name: "title".to_string(),
                        kind: FieldKind::Text,
                        synced: true,
                        nullable: false,
                    },
                    FieldDef {
                        name: "total".to_string(),
                        kind: FieldKind::Real,
                        synced: true,
                        nullable: true,
                    },
                    FieldDef {
                        name: "ui_expanded".to_string(),
                        kind: FieldKind::Bool,
                        synced: false,
                        nullable: true,
                    },
                ],
            })
            .unwrap();
        registry
    }

    struct Fixture {
        db: Database,
        schema: SchemaRegistry,
        peer_a: NodeId,
        peer_b: NodeId,
    }

    async fn setup() -> Fixture {
        let db = Database::open_in_memory().await.unwrap();
        let nodes = LibSqlNodeRepository::new(db.connection());

        let mut local = SyncNode::new(NodeId::new(), "server", "Server");
        local.is_local = true;
        local.is_server = true;
        let peer_a = SyncNode::new(NodeId::new(), "desk-a", "Desk A");
        let peer_b = SyncNode::new(NodeId::new(), "desk-b", "Desk B");
        for node in [&local, &peer_a, &peer_b] {
            nodes.insert(node).await.unwrap();
        }

        Fixture {
            db,
            schema: schema(),
            peer_a: peer_a.id,
            peer_b: peer_b.id,
        }
    }

    fn fields(title: &str) -> FieldMap {
        let mut fields = FieldMap::new();
        fields.insert("title".to_string(), Value::from(title));
        fields.insert("total".to_string(), Value::Real(99.5));
        fields
    }

    fn entry(uuid: Uuid, title: &str, updated_at: i64, base: Option<i64>) -> PacketEntry {
        PacketEntry {
            entity_type: "estimate".to_string(),
            entity_uuid: uuid,
            operation: ChangeOperation::Update,
            base_updated_at: base,
            data: EntitySnapshot {
                updated_at,
                is_deleted: false,
                modified_by: None,
                fields: fields(title),
            },
        }
    }

    async fn store(fx: &Fixture, uuid: Uuid, title: &str, updated_at: i64) -> EntityRecord {
        let mut all = fields(title);
        all.insert("ui_expanded".to_string(), Value::Bool(true));
        let record = EntityRecord {
            entity_type: "estimate".to_string(),
            uuid,
            fields: all,
            created_at: 1,
            updated_at,
            is_deleted: false,
            modified_by: None,
        };
        LibSqlEntityRepository::new(fx.db.connection())
            .upsert(&record)
            .await
            .unwrap();
        record
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn register_change_fans_out_except_origin() {
        let fx = setup().await;
        let conn = fx.db.connection();
        let uuid = Uuid::now_v7();

        let queued = register_change(conn, "estimate", &uuid, ChangeOperation::Insert, None)
            .await
            .unwrap();
        assert_eq!(queued, 2);

        let uuid = Uuid::now_v7();
        let queued = register_change(
            conn,
            "estimate",
            &uuid,
            ChangeOperation::Insert,
            Some(&fx.peer_a),
        )
        .await
        .unwrap();
        assert_eq!(queued, 1);
        assert_eq!(get_pending_changes(conn, &fx.peer_a, 10).await.unwrap().len(), 1);
        assert_eq!(get_pending_changes(conn, &fx.peer_b, 10).await.unwrap().len(), 2);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn serialize_entity_drops_local_only_fields() {
        let fx = setup().await;
        let uuid = Uuid::now_v7();
        store(&fx, uuid, "Roof", 10).await;

        let snapshot = serialize_entity(fx.db.connection(), &fx.schema, "estimate", &uuid)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(snapshot.fields, fields("Roof"));
        assert_eq!(snapshot.updated_at, 10);

        let missing = serialize_entity(fx.db.connection(), &fx.schema, "estimate", &Uuid::now_v7())
            .await
            .unwrap();
        assert!(missing.is_none());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn apply_inserts_new_entity_and_forwards_it() {
        let fx = setup().await;
        let conn = fx.db.connection();
        let uuid = Uuid::now_v7();

        let outcome = apply_change(conn, &fx.schema, &fx.peer_a, &entry(uuid, "Roof", 10, None))
            .await
            .unwrap();
        assert_eq!(outcome, ApplyOutcome::Applied);

        let stored = LibSqlEntityRepository::new(conn)
            .get("estimate", &uuid)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(stored.fields, fields("Roof"));
        assert_eq!(stored.updated_at, 10);

        assert!(get_pending_changes(conn, &fx.peer_a, 10).await.unwrap().is_empty());
        let forwarded = get_pending_changes(conn, &fx.peer_b, 10).await.unwrap();
        assert_eq!(forwarded.len(), 1);
        assert_eq!(forwarded[0].operation, ChangeOperation::Insert);

        let base = LibSqlEntityRepository::new(conn)
            .peer_state("estimate", &uuid, &fx.peer_a)
            .await
            .unwrap();
        assert_eq!(base, Some(10));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn apply_keeps_local_only_fields() {
        let fx = setup().await;
        let conn = fx.db.connection();
        let uuid = Uuid::now_v7();
        store(&fx, uuid, "Roof", 10).await;

        apply_change(conn, &fx.schema, &fx.peer_a, &entry(uuid, "Gutter", 20, Some(10)))
            .await
            .unwrap();

        let stored = LibSqlEntityRepository::new(conn)
            .get("estimate", &uuid)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(stored.fields.get("title"), Some(&Value::from("Gutter")));
        assert_eq!(stored.fields.get("ui_expanded"), Some(&Value::Bool(true)));
        assert_eq!(stored.created_at, 1);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn apply_detects_conflict_without_writing() {
        let fx = setup().await;
        let conn = fx.db.connection();
        let uuid = Uuid::now_v7();
        store(&fx, uuid, "Local edit", 30).await;

        let outcome = apply_change(conn, &fx.schema, &fx.peer_a, &entry(uuid, "Remote edit", 20, Some(10)))
            .await
            .unwrap();
        let ApplyOutcome::Conflict(details) = outcome else {
            panic!("expected conflict, got {outcome:?}");
        };
        assert_eq!(details.local.updated_at, 30);
        assert_eq!(details.incoming.updated_at, 20);
        assert_eq!(details.origin, fx.peer_a);

        let stored = LibSqlEntityRepository::new(conn)
            .get("estimate", &uuid)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(stored.fields.get("title"), Some(&Value::from("Local edit")));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn identical_version_is_a_quiet_no_op() {
        let fx = setup().await;
        let conn = fx.db.connection();
        let uuid = Uuid::now_v7();
        store(&fx, uuid, "Roof", 10).await;

        let outcome = apply_change(conn, &fx.schema, &fx.peer_a, &entry(uuid, "Roof", 10, None))
            .await
            .unwrap();
        assert_eq!(outcome, ApplyOutcome::Applied);
        assert!(get_pending_changes(conn, &fx.peer_b, 10).await.unwrap().is_empty());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn delete_operation_marks_row_deleted() {
        let fx = setup().await;
        let conn = fx.db.connection();
        let uuid = Uuid::now_v7();
        store(&fx, uuid, "Roof", 10).await;

        let mut delete = entry(uuid, "Roof", 20, Some(10));
        delete.operation = ChangeOperation::Delete;
        apply_change(conn, &fx.schema, &fx.peer_a, &delete).await.unwrap();

        let stored = LibSqlEntityRepository::new(conn)
            .get("estimate", &uuid)
            .await
            .unwrap()
            .unwrap();
        assert!(stored.is_deleted);
        let forwarded = get_pending_changes(conn, &fx.peer_b, 10).await.unwrap();
        assert_eq!(forwarded[0].operation, ChangeOperation::Delete);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn invalid_data_is_rejected() {
        let fx = setup().await;
        let mut bad = entry(Uuid::now_v7(), "Roof", 10, None);
        bad.data
            .fields
            .insert("total".to_string(), Value::from("lots"));

        let outcome = apply_change(fx.db.connection(), &fx.schema, &fx.peer_a, &bad)
            .await
            .unwrap();
        assert!(matches!(outcome, ApplyOutcome::Rejected(_)));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn snapshot_queues_every_entity() {
        let fx = setup().await;
        let conn = fx.db.connection();
        store(&fx, Uuid::now_v7(), "One", 10).await;
        store(&fx, Uuid::now_v7(), "Two", 11).await;

        assert_eq!(enqueue_snapshot(conn, &fx.peer_a).await.unwrap(), 2);
        assert_eq!(get_pending_changes(conn, &fx.peer_a, 10).await.unwrap().len(), 2);
    }
}

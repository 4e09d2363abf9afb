//! Conflict resolution strategies and the manual review step.

use libsql::Connection;
use serde::Serialize;
use uuid::Uuid;

use super::context::SyncContext;
use super::tracker::{enqueue_for, register_change, write_incoming, ConflictDetails};
use crate::db::{
    EntityRepository, LibSqlEntityRepository, LibSqlVersionRepository, VersionRepository,
};
use crate::error::{Error, Result};
use crate::models::{
    ChangeOperation, ConflictResolution, EntityRecord, EntitySnapshot, FieldMap, NodeId, NodeRole,
    ObjectVersion, SchemaRegistry,
};
use crate::util::now_ms;

/// Which version survives a conflict
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConflictDecision {
    KeepLocal,
    AcceptIncoming,
    /// Keep local for now and archive the incoming version for review
    Defer,
}

impl ConflictDecision {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::KeepLocal => "keep_local",
            Self::AcceptIncoming => "accept_incoming",
            Self::Defer => "defer",
        }
    }
}

/// Outcome of one resolved conflict
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Resolution {
    pub decision: ConflictDecision,
    /// Archived version, when one was written
    pub version_id: Option<Uuid>,
}

/// Pick the surviving version.
///
/// Timestamp-wins orders versions by `(updated_at, modified_by)`, where the
/// modifying node id compares as its lowercase hyphenated string and a missing
/// id sorts first. Both sides of a conflict therefore pick the same winner.
pub fn decide(
    strategy: ConflictResolution,
    role: NodeRole,
    local: &EntityRecord,
    incoming: &EntitySnapshot,
) -> ConflictDecision {
    match strategy {
        ConflictResolution::ServerWins => {
            if role.is_server() {
                ConflictDecision::KeepLocal
            } else {
                ConflictDecision::AcceptIncoming
            }
        }
        ConflictResolution::TimestampWins => {
            let local_key = (local.updated_at, modifier_key(local.modified_by.as_ref()));
            let incoming_key = (incoming.updated_at, modifier_key(incoming.modified_by.as_ref()));
            if incoming_key > local_key {
                ConflictDecision::AcceptIncoming
            } else {
                ConflictDecision::KeepLocal
            }
        }
        ConflictResolution::Manual => ConflictDecision::Defer,
    }
}

fn modifier_key(node: Option<&NodeId>) -> String {
    node.map(NodeId::as_str).unwrap_or_default()
}

/// Resolves conflicts found while applying a packet.
pub struct ConflictResolver<'a> {
    schema: &'a SchemaRegistry,
    strategy: ConflictResolution,
    versioning: bool,
    role: NodeRole,
    local_node: NodeId,
}

impl<'a> ConflictResolver<'a> {
    pub fn new(ctx: &'a SyncContext, local_node: NodeId) -> Self {
        Self {
            schema: ctx.schema(),
            strategy: ctx.settings().conflict_strategy,
            versioning: ctx.settings().versioning,
            role: ctx.role(),
            local_node,
        }
    }

    /// Settle one conflict inside the caller's transaction.
    pub async fn resolve(&self, conn: &Connection, details: &ConflictDetails) -> Result<Resolution> {
        let decision = decide(self.strategy, self.role, &details.local, &details.incoming);
        let entities = LibSqlEntityRepository::new(conn);

        let version_id = match decision {
            ConflictDecision::AcceptIncoming => {
                let archived = if self.versioning {
                    let local = &details.local;
                    let snapshot = EntitySnapshot {
                        updated_at: local.updated_at,
                        is_deleted: local.is_deleted,
                        modified_by: local.modified_by,
                        fields: local.fields.clone(),
                    };
                    Some(self.archive(conn, details, &snapshot, local.modified_by).await?)
                } else {
                    None
                };
                write_incoming(
                    conn,
                    self.schema,
                    &details.origin,
                    &details.entity_type,
                    &details.entity_uuid,
                    Some(&details.local),
                    &details.incoming,
                )
                .await?;
                archived
            }
            ConflictDecision::KeepLocal => {
                let archived = if self.versioning {
                    Some(
                        self.archive(conn, details, &details.incoming, Some(details.origin))
                            .await?,
                    )
                } else {
                    None
                };
                entities
                    .set_peer_state(
                        &details.entity_type,
                        &details.entity_uuid,
                        &details.origin,
                        details.incoming.updated_at,
                    )
                    .await?;
                // The origin still holds the losing version; send it ours.
                let operation = if details.local.is_deleted {
                    ChangeOperation::Delete
                } else {
                    ChangeOperation::Update
                };
                enqueue_for(
                    conn,
                    &details.origin,
                    &details.entity_type,
                    &details.entity_uuid,
                    operation,
                )
                .await?;
                archived
            }
            ConflictDecision::Defer => {
                let archived = self
                    .archive(conn, details, &details.incoming, Some(details.origin))
                    .await?;
                entities
                    .set_peer_state(
                        &details.entity_type,
                        &details.entity_uuid,
                        &details.origin,
                        details.incoming.updated_at,
                    )
                    .await?;
                Some(archived)
            }
        };

        tracing::info!(
            entity_type = %details.entity_type,
            entity_uuid = %details.entity_uuid,
            origin = %details.origin,
            strategy = %self.strategy,
            decision = decision.as_str(),
            local_updated_at = details.local.updated_at,
            incoming_updated_at = details.incoming.updated_at,
            version_id = ?version_id,
            "Resolved sync conflict"
        );

        Ok(Resolution {
            decision,
            version_id,
        })
    }

    async fn archive(
        &self,
        conn: &Connection,
        details: &ConflictDetails,
        snapshot: &EntitySnapshot,
        source: Option<NodeId>,
    ) -> Result<Uuid> {
        let version = ObjectVersion {
            id: Uuid::now_v7(),
            entity_uuid: details.entity_uuid,
            entity_type: details.entity_type.clone(),
            source_node_id: source,
            resolved_by: self.local_node,
            arrival_time: now_ms(),
            serialized_data: serde_json::to_string(snapshot)?,
            conflict_resolution: self.strategy,
            manually_resolved_at: None,
        };
        LibSqlVersionRepository::new(conn).insert(&version).await?;
        Ok(version.id)
    }
}

/// Archived conflict versions, newest first; `pending_only` keeps unresolved manual ones.
pub async fn list_conflicts(ctx: &SyncContext, pending_only: bool) -> Result<Vec<ObjectVersion>> {
    let db = ctx.db().lock().await;
    LibSqlVersionRepository::new(db.connection())
        .list(pending_only)
        .await
}

/// Settle a deferred conflict: merge `resolution` into the live entity and
/// send the result to every peer as a new change.
pub async fn manually_resolve_conflict(
    ctx: &SyncContext,
    version_id: &Uuid,
    resolution: FieldMap,
) -> Result<EntityRecord> {
    let local = ctx.local_node().await?;
    let db = ctx.db().lock().await;
    db.begin().await?;
    let result = apply_manual_resolution(
        db.connection(),
        ctx.schema(),
        &local.id,
        version_id,
        resolution,
    )
    .await;
    db.finish(result).await
}

async fn apply_manual_resolution(
    conn: &Connection,
    schema: &SchemaRegistry,
    local_node: &NodeId,
    version_id: &Uuid,
    resolution: FieldMap,
) -> Result<EntityRecord> {
    let versions = LibSqlVersionRepository::new(conn);
    let version = versions
        .get(version_id)
        .await?
        .ok_or_else(|| Error::NotFound(format!("conflict version {version_id}")))?;
    if !version.is_pending_review() {
        return Err(Error::InvalidState(format!(
            "version {version_id} is not an unresolved manual conflict"
        )));
    }

    schema.validate_local(&version.entity_type, &resolution)?;

    let entities = LibSqlEntityRepository::new(conn);
    let mut record = entities
        .get(&version.entity_type, &version.entity_uuid)
        .await?
        .ok_or_else(|| {
            Error::NotFound(format!("{} {}", version.entity_type, version.entity_uuid))
        })?;

    let resolution_data = serde_json::to_string(&resolution)?;
    record.fields.extend(resolution);
    record.updated_at = record.next_timestamp();
    record.modified_by = Some(*local_node);
    entities.upsert(&record).await?;

    let operation = if record.is_deleted {
        ChangeOperation::Delete
    } else {
        ChangeOperation::Update
    };
    register_change(conn, &record.entity_type, &record.uuid, operation, None).await?;
    versions
        .record_manual_resolution(version_id, now_ms(), &resolution_data)
        .await?;

    tracing::info!(
        entity_type = %record.entity_type,
        entity_uuid = %record.uuid,
        version_id = %version_id,
        "Manually resolved sync conflict"
    );
    Ok(record)
}

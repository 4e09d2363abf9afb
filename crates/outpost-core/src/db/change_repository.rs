//! Outbound change queue storage

use libsql::{params, Connection, Row};
use uuid::Uuid;

use super::values::{node_id, optional_i64, uuid};
use crate::error::{Error, Result};
use crate::models::{ChangeOperation, NodeId, SyncChange};

const CHANGE_COLUMNS: &str = "id, node_id, entity_type, entity_uuid, operation, packet_no, created_at";

/// Trait for change queue operations (async)
#[allow(async_fn_in_trait)]
pub trait ChangeRepository {
    /// Queue `operation` for `target`, folding it into an unbundled change
    /// for the same entity when one exists.
    async fn enqueue(
        &self,
        target: &NodeId,
        entity_type: &str,
        entity_uuid: &Uuid,
        operation: ChangeOperation,
        created_at: i64,
    ) -> Result<SyncChange>;

    /// Get one change by id
    async fn get(&self, id: i64) -> Result<Option<SyncChange>>;

    /// Unbundled changes for `target`, oldest first
    async fn pending(&self, target: &NodeId, limit: usize) -> Result<Vec<SyncChange>>;

    /// Number of unbundled changes for `target`
    async fn pending_count(&self, target: &NodeId) -> Result<i64>;

    /// Every queued change (bundled or not), optionally for one target, oldest first
    async fn list(&self, target: Option<&NodeId>) -> Result<Vec<SyncChange>>;

    /// Changes bundled into `packet_no` for `target`
    async fn in_packet(&self, target: &NodeId, packet_no: i64) -> Result<Vec<SyncChange>>;

    /// Stamp changes with the packet that carries them
    async fn stamp(&self, ids: &[i64], packet_no: i64) -> Result<()>;

    /// Remove changes acknowledged by `target` up to and including `packet_no`
    async fn delete_acknowledged(&self, target: &NodeId, packet_no: i64) -> Result<u64>;

    /// Remove an unbundled change; returns false when nothing matched
    async fn delete_pending(&self, id: i64) -> Result<bool>;

    /// Drop unbundled changes for one entity and target
    async fn discard_pending_for_entity(
        &self,
        target: &NodeId,
        entity_type: &str,
        entity_uuid: &Uuid,
    ) -> Result<u64>;
}

/// libSQL implementation of `ChangeRepository`
pub struct LibSqlChangeRepository<'a> {
    conn: &'a Connection,
}

impl<'a> LibSqlChangeRepository<'a> {
    /// Create a new repository with the given connection
    pub const fn new(conn: &'a Connection) -> Self {
        Self { conn }
    }

    async fn pending_for_entity(
        &self,
        target: &NodeId,
        entity_type: &str,
        entity_uuid: &Uuid,
    ) -> Result<Option<SyncChange>> {
        let mut rows = self
            .conn
            .query(
                &format!(
                    "SELECT {CHANGE_COLUMNS} FROM sync_changes
                     WHERE node_id = ? AND entity_type = ? AND entity_uuid = ? AND packet_no IS NULL
                     ORDER BY id LIMIT 1"
                ),
                params![target.as_str(), entity_type, entity_uuid.to_string()],
            )
            .await?;
        match rows.next().await? {
            Some(row) => Ok(Some(row_to_change(&row)?)),
            None => Ok(None),
        }
    }
}

impl ChangeRepository for LibSqlChangeRepository<'_> {
    async fn enqueue(
        &self,
        target: &NodeId,
        entity_type: &str,
        entity_uuid: &Uuid,
        operation: ChangeOperation,
        created_at: i64,
    ) -> Result<SyncChange> {
        if let Some(mut existing) = self
            .pending_for_entity(target, entity_type, entity_uuid)
            .await?
        {
            let merged = existing.operation.coalesce(operation);
            if merged != existing.operation {
                self.conn
                    .execute(
                        "UPDATE sync_changes SET operation = ? WHERE id = ?",
                        params![merged.as_str(), existing.id],
                    )
                    .await?;
                existing.operation = merged;
            }
            return Ok(existing);
        }

        self.conn
            .execute(
                "INSERT INTO sync_changes (node_id, entity_type, entity_uuid, operation, packet_no, created_at)
                 VALUES (?, ?, ?, ?, NULL, ?)",
                params![
                    target.as_str(),
                    entity_type,
                    entity_uuid.to_string(),
                    operation.as_str(),
                    created_at,
                ],
            )
            .await?;

        Ok(SyncChange {
            id: self.conn.last_insert_rowid(),
            node_id: *target,
            entity_type: entity_type.to_string(),
            entity_uuid: *entity_uuid,
            operation,
            packet_no: None,
            created_at,
        })
    }

    async fn get(&self, id: i64) -> Result<Option<SyncChange>> {
        let mut rows = self
            .conn
            .query(
                &format!("SELECT {CHANGE_COLUMNS} FROM sync_changes WHERE id = ?"),
                [id],
            )
            .await?;
        match rows.next().await? {
            Some(row) => Ok(Some(row_to_change(&row)?)),
            None => Ok(None),
        }
    }

    async fn pending(&self, target: &NodeId, limit: usize) -> Result<Vec<SyncChange>> {
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);
        let rows = self
            .conn
            .query(
                &format!(
                    "SELECT {CHANGE_COLUMNS} FROM sync_changes
                     WHERE node_id = ? AND packet_no IS NULL
                     ORDER BY id
                     LIMIT ?"
                ),
                params![target.as_str(), limit],
            )
            .await?;
        collect_changes(rows).await
    }

    async fn pending_count(&self, target: &NodeId) -> Result<i64> {
        let mut rows = self
            .conn
            .query(
                "SELECT COUNT(*) FROM sync_changes WHERE node_id = ? AND packet_no IS NULL",
                [target.as_str()],
            )
            .await?;
        match rows.next().await? {
            Some(row) => Ok(row.get(0)?),
            None => Ok(0),
        }
    }

    async fn list(&self, target: Option<&NodeId>) -> Result<Vec<SyncChange>> {
        let rows = match target {
            Some(target) => {
                self.conn
                    .query(
                        &format!(
                            "SELECT {CHANGE_COLUMNS} FROM sync_changes WHERE node_id = ? ORDER BY id"
                        ),
                        [target.as_str()],
                    )
                    .await?
            }
            None => {
                self.conn
                    .query(
                        &format!("SELECT {CHANGE_COLUMNS} FROM sync_changes ORDER BY id"),
                        (),
                    )
                    .await?
            }
        };
        collect_changes(rows).await
    }

    async fn in_packet(&self, target: &NodeId, packet_no: i64) -> Result<Vec<SyncChange>> {
        let rows = self
            .conn
            .query(
                &format!(
                    "SELECT {CHANGE_COLUMNS} FROM sync_changes
                     WHERE node_id = ? AND packet_no = ?
                     ORDER BY id"
                ),
                params![target.as_str(), packet_no],
            )
            .await?;
        collect_changes(rows).await
    }

    async fn stamp(&self, ids: &[i64], packet_no: i64) -> Result<()> {
        for id in ids {
            self.conn
                .execute(
                    "UPDATE sync_changes SET packet_no = ? WHERE id = ? AND packet_no IS NULL",
                    params![packet_no, *id],
                )
                .await?;
        }
        Ok(())
    }

    async fn delete_acknowledged(&self, target: &NodeId, packet_no: i64) -> Result<u64> {
        let deleted = self
            .conn
            .execute(
                "DELETE FROM sync_changes
                 WHERE node_id = ? AND packet_no IS NOT NULL AND packet_no <= ?",
                params![target.as_str(), packet_no],
            )
            .await?;
        Ok(deleted)
    }

    async fn delete_pending(&self, id: i64) -> Result<bool> {
        let deleted = self
            .conn
            .execute(
                "DELETE FROM sync_changes WHERE id = ? AND packet_no IS NULL",
                [id],
            )
            .await?;
        Ok(deleted > 0)
    }

    async fn discard_pending_for_entity(
        &self,
        target: &NodeId,
        entity_type: &str,
        entity_uuid: &Uuid,
    ) -> Result<u64> {
        let deleted = self
            .conn
            .execute(
                "DELETE FROM sync_changes
                 WHERE node_id = ? AND entity_type = ? AND entity_uuid = ? AND packet_no IS NULL",
                params![target.as_str(), entity_type, entity_uuid.to_string()],
            )
            .await?;
        Ok(deleted)
    }
}

async fn collect_changes(mut rows: libsql::Rows) -> Result<Vec<SyncChange>> {
    let mut changes = Vec::new();
    while let Some(row) = rows.next().await? {
        changes.push(row_to_change(&row)?);
    }
    Ok(changes)
}

fn row_to_change(row: &Row) -> Result<SyncChange> {
    let operation: String = row.get(4)?;
    let operation = operation.parse::<ChangeOperation>().map_err(Error::Database)?;

    Ok(SyncChange {
        id: row.get(0)?,
        node_id: node_id(row, 1)?,
        entity_type: row.get(2)?,
        entity_uuid: uuid(row, 3)?,
        operation,
        packet_no: optional_i64(row, 5)?,
        created_at: row.get(6)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::{Database, LibSqlNodeRepository, NodeRepository};
    use crate::models::SyncNode;
    use pretty_assertions::assert_eq;

    async fn setup() -> (Database, NodeId) {
        let db = Database::open_in_memory().await.unwrap();
        let peer = SyncNode::new(NodeId::new(), "desk-01", "Desk");
        LibSqlNodeRepository::new(db.connection())
            .insert(&peer)
            .await
            .unwrap();
        (db, peer.id)
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_pending_is_ordered_and_limited() {
        let (db, peer) = setup().await;
        let repo = LibSqlChangeRepository::new(db.connection());

        let uuids: Vec<Uuid> = (0..3).map(|_| Uuid::now_v7()).collect();
        for (i, uuid) in uuids.iter().enumerate() {
            repo.enqueue(&peer, "estimate", uuid, ChangeOperation::Insert, i as i64)
                .await
                .unwrap();
        }

        let pending = repo.pending(&peer, 2).await.unwrap();
        assert_eq!(
            pending.iter().map(|c| c.entity_uuid).collect::<Vec<_>>(),
            uuids[..2].to_vec()
        );
        assert_eq!(repo.pending_count(&peer).await.unwrap(), 3);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_enqueue_coalesces_unbundled_change() {
        let (db, peer) = setup().await;
        let repo = LibSqlChangeRepository::new(db.connection());
        let uuid = Uuid::now_v7();

        let first = repo
            .enqueue(&peer, "estimate", &uuid, ChangeOperation::Insert, 1)
            .await
            .unwrap();
        let second = repo
            .enqueue(&peer, "estimate", &uuid, ChangeOperation::Update, 2)
            .await
            .unwrap();
        assert_eq!(first.id, second.id);
        assert_eq!(second.operation, ChangeOperation::Insert);

        let third = repo
            .enqueue(&peer, "estimate", &uuid, ChangeOperation::Delete, 3)
            .await
            .unwrap();
        assert_eq!(third.id, first.id);

        let stored = repo.get(first.id).await.unwrap().unwrap();
        assert_eq!(stored.operation, ChangeOperation::Delete);
        assert_eq!(repo.pending_count(&peer).await.unwrap(), 1);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_bundled_change_is_not_coalesced() {
        let (db, peer) = setup().await;
        let repo = LibSqlChangeRepository::new(db.connection());
        let uuid = Uuid::now_v7();

        let first = repo
            .enqueue(&peer, "estimate", &uuid, ChangeOperation::Insert, 1)
            .await
            .unwrap();
        repo.stamp(&[first.id], 1).await.unwrap();

        let second = repo
            .enqueue(&peer, "estimate", &uuid, ChangeOperation::Update, 2)
            .await
            .unwrap();
        assert_ne!(first.id, second.id);
        assert_eq!(repo.in_packet(&peer, 1).await.unwrap().len(), 1);
        assert_eq!(repo.pending(&peer, 10).await.unwrap(), vec![second]);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_acknowledge_removes_only_bundled_rows() {
        let (db, peer) = setup().await;
        let repo = LibSqlChangeRepository::new(db.connection());

        let bundled = repo
            .enqueue(&peer, "estimate", &Uuid::now_v7(), ChangeOperation::Insert, 1)
            .await
            .unwrap();
        repo.stamp(&[bundled.id], 1).await.unwrap();
        let pending = repo
            .enqueue(&peer, "estimate", &Uuid::now_v7(), ChangeOperation::Insert, 2)
            .await
            .unwrap();

        assert_eq!(repo.delete_acknowledged(&peer, 1).await.unwrap(), 1);
        assert_eq!(repo.list(Some(&peer)).await.unwrap(), vec![pending]);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_delete_pending_refuses_bundled_rows() {
        let (db, peer) = setup().await;
        let repo = LibSqlChangeRepository::new(db.connection());

        let change = repo
            .enqueue(&peer, "estimate", &Uuid::now_v7(), ChangeOperation::Insert, 1)
            .await
            .unwrap();
        repo.stamp(&[change.id], 1).await.unwrap();

        assert!(!repo.delete_pending(change.id).await.unwrap());
        assert!(repo.get(change.id).await.unwrap().is_some());
    }
}

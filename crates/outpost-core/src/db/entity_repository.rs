//! Generic entity envelope storage and per-peer exchange state

use libsql::{params, Connection, Row};
use uuid::Uuid;

use super::values::{flag, optional_i64, optional_node_id, text_or_null, uuid};
use crate::error::Result;
use crate::models::{EntityRecord, FieldMap, NodeId};

const ENTITY_COLUMNS: &str = "entity_type, uuid, data, created_at, updated_at, is_deleted, modified_by";

/// Trait for entity storage operations (async)
#[allow(async_fn_in_trait)]
pub trait EntityRepository {
    /// Get one entity, deleted or not
    async fn get(&self, entity_type: &str, uuid: &Uuid) -> Result<Option<EntityRecord>>;

    /// Insert or overwrite an entity
    async fn upsert(&self, record: &EntityRecord) -> Result<()>;

    /// List entities of one type, most recently updated first
    async fn list(&self, entity_type: &str, include_deleted: bool) -> Result<Vec<EntityRecord>>;

    /// `(entity_type, uuid, is_deleted)` for every stored entity, oldest first
    async fn keys(&self) -> Result<Vec<(String, Uuid, bool)>>;

    /// Version of the entity last exchanged with `node`
    async fn peer_state(&self, entity_type: &str, uuid: &Uuid, node: &NodeId) -> Result<Option<i64>>;

    /// Record the version of the entity both sides now share
    async fn set_peer_state(
        &self,
        entity_type: &str,
        uuid: &Uuid,
        node: &NodeId,
        updated_at: i64,
    ) -> Result<()>;
}

/// libSQL implementation of `EntityRepository`
pub struct LibSqlEntityRepository<'a> {
    conn: &'a Connection,
}

impl<'a> LibSqlEntityRepository<'a> {
    /// Create a new repository with the given connection
    pub const fn new(conn: &'a Connection) -> Self {
        Self { conn }
    }
}

impl EntityRepository for LibSqlEntityRepository<'_> {
    async fn get(&self, entity_type: &str, uuid: &Uuid) -> Result<Option<EntityRecord>> {
        let mut rows = self
            .conn
            .query(
                &format!("SELECT {ENTITY_COLUMNS} FROM entities WHERE entity_type = ? AND uuid = ?"),
                params![entity_type, uuid.to_string()],
            )
            .await?;

        match rows.next().await? {
            Some(row) => Ok(Some(row_to_entity(&row)?)),
            None => Ok(None),
        }
    }

    async fn upsert(&self, record: &EntityRecord) -> Result<()> {
        let data = serde_json::to_string(&record.fields)?;
        let modified_by = record.modified_by.map(|id| id.as_str());
        self.conn
            .execute(
                &format!(
                    "INSERT INTO entities ({ENTITY_COLUMNS})
                     VALUES (?, ?, ?, ?, ?, ?, ?)
                     ON CONFLICT (entity_type, uuid) DO UPDATE SET
                        data = excluded.data,
                        updated_at = excluded.updated_at,
                        is_deleted = excluded.is_deleted,
                        modified_by = excluded.modified_by"
                ),
                params![
                    record.entity_type.as_str(),
                    record.uuid.to_string(),
                    data,
                    record.created_at,
                    record.updated_at,
                    i64::from(record.is_deleted),
                    text_or_null(modified_by.as_deref()),
                ],
            )
            .await?;
        Ok(())
    }

    async fn list(&self, entity_type: &str, include_deleted: bool) -> Result<Vec<EntityRecord>> {
        let sql = if include_deleted {
            format!(
                "SELECT {ENTITY_COLUMNS} FROM entities
                 WHERE entity_type = ?
                 ORDER BY updated_at DESC"
            )
        } else {
            format!(
                "SELECT {ENTITY_COLUMNS} FROM entities
                 WHERE entity_type = ? AND is_deleted = 0
                 ORDER BY updated_at DESC"
            )
        };

        let mut rows = self.conn.query(&sql, [entity_type]).await?;
        let mut records = Vec::new();
        while let Some(row) = rows.next().await? {
            records.push(row_to_entity(&row)?);
        }
        Ok(records)
    }

    async fn keys(&self) -> Result<Vec<(String, Uuid, bool)>> {
        let mut rows = self
            .conn
            .query(
                "SELECT entity_type, uuid, is_deleted FROM entities ORDER BY created_at, entity_type, uuid",
                (),
            )
            .await?;
        let mut keys = Vec::new();
        while let Some(row) = rows.next().await? {
            keys.push((row.get(0)?, uuid(&row, 1)?, flag(&row, 2)?));
        }
        Ok(keys)
    }

    async fn peer_state(&self, entity_type: &str, uuid: &Uuid, node: &NodeId) -> Result<Option<i64>> {
        let mut rows = self
            .conn
            .query(
                "SELECT synced_updated_at FROM entity_peer_state
                 WHERE entity_type = ? AND entity_uuid = ? AND node_id = ?",
                params![entity_type, uuid.to_string(), node.as_str()],
            )
            .await?;

        match rows.next().await? {
            Some(row) => optional_i64(&row, 0),
            None => Ok(None),
        }
    }

    async fn set_peer_state(
        &self,
        entity_type: &str,
        uuid: &Uuid,
        node: &NodeId,
        updated_at: i64,
    ) -> Result<()> {
        self.conn
            .execute(
                "INSERT INTO entity_peer_state (entity_type, entity_uuid, node_id, synced_updated_at)
                 VALUES (?, ?, ?, ?)
                 ON CONFLICT (entity_type, entity_uuid, node_id)
                 DO UPDATE SET synced_updated_at = excluded.synced_updated_at",
                params![entity_type, uuid.to_string(), node.as_str(), updated_at],
            )
            .await?;
        Ok(())
    }
}

fn row_to_entity(row: &Row) -> Result<EntityRecord> {
    let data: String = row.get(2)?;
    let fields: FieldMap = serde_json::from_str(&data)?;

    Ok(EntityRecord {
        entity_type: row.get(0)?,
        uuid: uuid(row, 1)?,
        fields,
        created_at: row.get(3)?,
        updated_at: row.get(4)?,
        is_deleted: flag(row, 5)?,
        modified_by: optional_node_id(row, 6)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::{Database, LibSqlNodeRepository, NodeRepository};
    use crate::models::{SyncNode, Value};
    use pretty_assertions::assert_eq;

    async fn setup() -> Database {
        Database::open_in_memory().await.unwrap()
    }

    fn estimate(total: f64) -> EntityRecord {
        let mut fields = FieldMap::new();
        fields.insert("title".to_string(), Value::from("Roof repair"));
        fields.insert("total".to_string(), Value::Real(total));
        fields.insert("notes".to_string(), Value::Null);
        EntityRecord::new("estimate", fields, None)
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_upsert_and_get() {
        let db = setup().await;
        let repo = LibSqlEntityRepository::new(db.connection());

        let record = estimate(1250.5);
        repo.upsert(&record).await.unwrap();

        let loaded = repo.get("estimate", &record.uuid).await.unwrap().unwrap();
        assert_eq!(loaded, record);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_upsert_overwrites_but_keeps_created_at() {
        let db = setup().await;
        let repo = LibSqlEntityRepository::new(db.connection());

        let mut record = estimate(10.0);
        repo.upsert(&record).await.unwrap();

        let created_at = record.created_at;
        record.created_at += 1_000;
        record.updated_at += 5;
        record.is_deleted = true;
        record.modified_by = Some(NodeId::new());
        repo.upsert(&record).await.unwrap();

        let loaded = repo.get("estimate", &record.uuid).await.unwrap().unwrap();
        assert_eq!(loaded.created_at, created_at);
        assert_eq!(loaded.updated_at, record.updated_at);
        assert!(loaded.is_deleted);
        assert_eq!(loaded.modified_by, record.modified_by);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_list_hides_deleted_by_default() {
        let db = setup().await;
        let repo = LibSqlEntityRepository::new(db.connection());

        let live = estimate(1.0);
        let mut gone = estimate(2.0);
        gone.is_deleted = true;
        repo.upsert(&live).await.unwrap();
        repo.upsert(&gone).await.unwrap();

        assert_eq!(repo.list("estimate", false).await.unwrap().len(), 1);
        assert_eq!(repo.list("estimate", true).await.unwrap().len(), 2);
        assert_eq!(repo.keys().await.unwrap().len(), 2);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_peer_state_upsert() {
        let db = setup().await;
        let peer = SyncNode::new(NodeId::new(), "desk-01", "Desk");
        LibSqlNodeRepository::new(db.connection())
            .insert(&peer)
            .await
            .unwrap();
        let repo = LibSqlEntityRepository::new(db.connection());
        let uuid = Uuid::now_v7();

        assert_eq!(repo.peer_state("estimate", &uuid, &peer.id).await.unwrap(), None);
        repo.set_peer_state("estimate", &uuid, &peer.id, 10).await.unwrap();
        repo.set_peer_state("estimate", &uuid, &peer.id, 20).await.unwrap();
        assert_eq!(
            repo.peer_state("estimate", &uuid, &peer.id).await.unwrap(),
            Some(20)
        );
    }
}

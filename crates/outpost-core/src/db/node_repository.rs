//! Sync participant storage

use libsql::{params, Connection, Row};

use super::values::{flag, int_or_null, node_id, optional_i64, optional_text, text_or_null};
use crate::error::{Error, Result};
use crate::models::{NodeId, SyncNode};

const NODE_COLUMNS: &str = "id, code, name, description, is_server, is_local, is_active, \
     registered_at, last_sync_in, last_sync_out, received_packet_no, sent_packet_no, schema_version";

/// Trait for node storage operations (async)
#[allow(async_fn_in_trait)]
pub trait NodeRepository {
    /// Insert a node row
    async fn insert(&self, node: &SyncNode) -> Result<()>;

    /// Get a node by id
    async fn get(&self, id: &NodeId) -> Result<Option<SyncNode>>;

    /// Get a node by its (case-insensitive) code
    async fn get_by_code(&self, code: &str) -> Result<Option<SyncNode>>;

    /// This database's own identity
    async fn local(&self) -> Result<Option<SyncNode>>;

    /// Every known node, registration order
    async fn list(&self) -> Result<Vec<SyncNode>>;

    /// Active nodes other than the local one
    async fn active_peers(&self) -> Result<Vec<SyncNode>>;

    /// Enable or disable a node
    async fn set_active(&self, id: &NodeId, active: bool) -> Result<()>;

    /// Advance the inbound high-water mark after applying `packet_no`
    async fn record_received(&self, id: &NodeId, packet_no: i64, at: i64) -> Result<()>;

    /// Advance the outbound high-water mark after the peer acknowledged `packet_no`
    async fn record_acknowledged(&self, id: &NodeId, packet_no: i64, at: i64) -> Result<()>;

    /// Remember the entity schema version the node last advertised
    async fn record_schema_version(&self, id: &NodeId, version: u32) -> Result<()>;
}

/// libSQL implementation of `NodeRepository`
pub struct LibSqlNodeRepository<'a> {
    conn: &'a Connection,
}

impl<'a> LibSqlNodeRepository<'a> {
    /// Create a new repository with the given connection
    pub const fn new(conn: &'a Connection) -> Self {
        Self { conn }
    }

    async fn query_one(&self, sql: &str, params: impl libsql::params::IntoParams) -> Result<Option<SyncNode>> {
        let mut rows = self.conn.query(sql, params).await?;
        match rows.next().await? {
            Some(row) => Ok(Some(row_to_node(&row)?)),
            None => Ok(None),
        }
    }

    async fn query_many(&self, sql: &str) -> Result<Vec<SyncNode>> {
        let mut rows = self.conn.query(sql, ()).await?;
        let mut nodes = Vec::new();
        while let Some(row) = rows.next().await? {
            nodes.push(row_to_node(&row)?);
        }
        Ok(nodes)
    }
}

impl NodeRepository for LibSqlNodeRepository<'_> {
    async fn insert(&self, node: &SyncNode) -> Result<()> {
        self.conn
            .execute(
                &format!(
                    "INSERT INTO sync_nodes ({NODE_COLUMNS})
                     VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)"
                ),
                params![
                    node.id.as_str(),
                    node.code.as_str(),
                    node.name.as_str(),
                    text_or_null(node.description.as_deref()),
                    i64::from(node.is_server),
                    i64::from(node.is_local),
                    i64::from(node.is_active),
                    node.registered_at,
                    int_or_null(node.last_sync_in),
                    int_or_null(node.last_sync_out),
                    node.received_packet_no,
                    node.sent_packet_no,
                    int_or_null(node.schema_version.map(i64::from)),
                ],
            )
            .await?;
        Ok(())
    }

    async fn get(&self, id: &NodeId) -> Result<Option<SyncNode>> {
        self.query_one(
            &format!("SELECT {NODE_COLUMNS} FROM sync_nodes WHERE id = ?"),
            [id.as_str()],
        )
        .await
    }

    async fn get_by_code(&self, code: &str) -> Result<Option<SyncNode>> {
        self.query_one(
            &format!("SELECT {NODE_COLUMNS} FROM sync_nodes WHERE code = ? COLLATE NOCASE"),
            [code],
        )
        .await
    }

    async fn local(&self) -> Result<Option<SyncNode>> {
        self.query_one(
            &format!("SELECT {NODE_COLUMNS} FROM sync_nodes WHERE is_local = 1"),
            (),
        )
        .await
    }

    async fn list(&self) -> Result<Vec<SyncNode>> {
        self.query_many(&format!(
            "SELECT {NODE_COLUMNS} FROM sync_nodes ORDER BY registered_at, code"
        ))
        .await
    }

    async fn active_peers(&self) -> Result<Vec<SyncNode>> {
        self.query_many(&format!(
            "SELECT {NODE_COLUMNS} FROM sync_nodes
             WHERE is_local = 0 AND is_active = 1
             ORDER BY registered_at, code"
        ))
        .await
    }

    async fn set_active(&self, id: &NodeId, active: bool) -> Result<()> {
        let changed = self
            .conn
            .execute(
                "UPDATE sync_nodes SET is_active = ? WHERE id = ?",
                params![i64::from(active), id.as_str()],
            )
            .await?;
        if changed == 0 {
            return Err(Error::NotFound(format!("node {id}")));
        }
        Ok(())
    }

    async fn record_received(&self, id: &NodeId, packet_no: i64, at: i64) -> Result<()> {
        self.conn
            .execute(
                "UPDATE sync_nodes
                 SET received_packet_no = MAX(received_packet_no, ?), last_sync_in = ?
                 WHERE id = ?",
                params![packet_no, at, id.as_str()],
            )
            .await?;
        Ok(())
    }

    async fn record_acknowledged(&self, id: &NodeId, packet_no: i64, at: i64) -> Result<()> {
        self.conn
            .execute(
                "UPDATE sync_nodes
                 SET sent_packet_no = MAX(sent_packet_no, ?), last_sync_out = ?
                 WHERE id = ?",
                params![packet_no, at, id.as_str()],
            )
            .await?;
        Ok(())
    }

    async fn record_schema_version(&self, id: &NodeId, version: u32) -> Result<()> {
        self.conn
            .execute(
                "UPDATE sync_nodes SET schema_version = ? WHERE id = ?",
                params![i64::from(version), id.as_str()],
            )
            .await?;
        Ok(())
    }
}

fn row_to_node(row: &Row) -> Result<SyncNode> {
    let schema_version = optional_i64(row, 12)?
        .map(|raw| {
            u32::try_from(raw)
                .map_err(|_| Error::Database(format!("schema_version {raw} out of range")))
        })
        .transpose()?;

    Ok(SyncNode {
        id: node_id(row, 0)?,
        code: row.get(1)?,
        name: row.get(2)?,
        description: optional_text(row, 3)?,
        is_server: flag(row, 4)?,
        is_local: flag(row, 5)?,
        is_active: flag(row, 6)?,
        registered_at: row.get(7)?,
        last_sync_in: optional_i64(row, 8)?,
        last_sync_out: optional_i64(row, 9)?,
        received_packet_no: row.get(10)?,
        sent_packet_no: row.get(11)?,
        schema_version,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::Database;
    use pretty_assertions::assert_eq;

    async fn setup() -> Database {
        Database::open_in_memory().await.unwrap()
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_insert_and_get() {
        let db = setup().await;
        let repo = LibSqlNodeRepository::new(db.connection());

        let mut node = SyncNode::new(NodeId::new(), "desk-01", "Front desk");
        node.description = Some("Reception".to_string());
        node.schema_version = Some(3);
        repo.insert(&node).await.unwrap();

        let loaded = repo.get(&node.id).await.unwrap().unwrap();
        assert_eq!(loaded, node);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_code_lookup_ignores_case() {
        let db = setup().await;
        let repo = LibSqlNodeRepository::new(db.connection());

        let node = SyncNode::new(NodeId::new(), "Desk-01", "Front desk");
        repo.insert(&node).await.unwrap();

        let loaded = repo.get_by_code("desk-01").await.unwrap().unwrap();
        assert_eq!(loaded.id, node.id);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_duplicate_code_rejected_by_storage() {
        let db = setup().await;
        let repo = LibSqlNodeRepository::new(db.connection());

        repo.insert(&SyncNode::new(NodeId::new(), "desk-01", "A"))
            .await
            .unwrap();
        assert!(repo
            .insert(&SyncNode::new(NodeId::new(), "DESK-01", "B"))
            .await
            .is_err());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_active_peers_excludes_local_and_inactive() {
        let db = setup().await;
        let repo = LibSqlNodeRepository::new(db.connection());

        let mut local = SyncNode::new(NodeId::new(), "server", "Server");
        local.is_local = true;
        let peer = SyncNode::new(NodeId::new(), "desk-01", "Desk 1");
        let retired = SyncNode::new(NodeId::new(), "desk-02", "Desk 2");
        for node in [&local, &peer, &retired] {
            repo.insert(node).await.unwrap();
        }
        repo.set_active(&retired.id, false).await.unwrap();

        let peers = repo.active_peers().await.unwrap();
        assert_eq!(peers.iter().map(|n| n.id).collect::<Vec<_>>(), vec![peer.id]);
        assert_eq!(repo.local().await.unwrap().unwrap().id, local.id);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_counters_never_move_backwards() {
        let db = setup().await;
        let repo = LibSqlNodeRepository::new(db.connection());
        let node = SyncNode::new(NodeId::new(), "desk-01", "Desk 1");
        repo.insert(&node).await.unwrap();

        repo.record_received(&node.id, 4, 100).await.unwrap();
        repo.record_received(&node.id, 2, 200).await.unwrap();
        repo.record_acknowledged(&node.id, 7, 300).await.unwrap();
        repo.record_acknowledged(&node.id, 5, 400).await.unwrap();

        let loaded = repo.get(&node.id).await.unwrap().unwrap();
        assert_eq!(loaded.received_packet_no, 4);
        assert_eq!(loaded.sent_packet_no, 7);
        assert_eq!(loaded.last_sync_in, Some(200));
        assert_eq!(loaded.last_sync_out, Some(400));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_set_active_unknown_node() {
        let db = setup().await;
        let repo = LibSqlNodeRepository::new(db.connection());

        let err = repo.set_active(&NodeId::new(), false).await.unwrap_err();
        assert!(matches!(err, Error::NotFound(_)));
    }
}

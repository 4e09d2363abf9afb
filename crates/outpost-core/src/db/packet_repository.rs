//! Outbound packets retained until the peer acknowledges them

use libsql::{params, Connection, Row, Value};
use serde::Serialize;

use super::values::{node_id, optional_i64};
use crate::error::{Error, Result};
use crate::models::NodeId;

const PACKET_COLUMNS: &str =
    "node_id, packet_no, payload, entry_count, created_at, attempts, last_attempt_at";

/// Encoded packet kept byte-for-byte so retransmissions are identical
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RetainedPacket {
    pub node_id: NodeId,
    pub packet_no: i64,
    #[serde(skip)]
    pub payload: Vec<u8>,
    pub entry_count: i64,
    pub created_at: i64,
    pub attempts: i64,
    pub last_attempt_at: Option<i64>,
}

/// Trait for retained packet storage (async)
#[allow(async_fn_in_trait)]
pub trait PacketRepository {
    /// Retain an encoded packet for `node_id`
    async fn store(
        &self,
        node_id: &NodeId,
        packet_no: i64,
        payload: &[u8],
        entry_count: i64,
        created_at: i64,
    ) -> Result<()>;

    /// Oldest unacknowledged packet for `node_id`
    async fn outstanding(&self, node_id: &NodeId) -> Result<Option<RetainedPacket>>;

    /// All retained packets, optionally for one node
    async fn list(&self, node_id: Option<&NodeId>) -> Result<Vec<RetainedPacket>>;

    /// Swap the stored bytes of a retained packet
    async fn replace_payload(&self, node_id: &NodeId, packet_no: i64, payload: &[u8]) -> Result<()>;

    /// Count one more transmission attempt
    async fn record_attempt(&self, node_id: &NodeId, packet_no: i64, at: i64) -> Result<()>;

    /// Drop packets acknowledged up to and including `packet_no`
    async fn delete_acknowledged(&self, node_id: &NodeId, packet_no: i64) -> Result<u64>;
}

/// libSQL implementation of `PacketRepository`
pub struct LibSqlPacketRepository<'a> {
    conn: &'a Connection,
}

impl<'a> LibSqlPacketRepository<'a> {
    /// Create a new repository with the given connection
    pub const fn new(conn: &'a Connection) -> Self {
        Self { conn }
    }
}

impl PacketRepository for LibSqlPacketRepository<'_> {
    async fn store(
        &self,
        node_id: &NodeId,
        packet_no: i64,
        payload: &[u8],
        entry_count: i64,
        created_at: i64,
    ) -> Result<()> {
        self.conn
            .execute(
                "INSERT INTO sync_packets (node_id, packet_no, payload, entry_count, created_at, attempts)
                 VALUES (?, ?, ?, ?, ?, 0)",
                params![
                    node_id.as_str(),
                    packet_no,
                    Value::Blob(payload.to_vec()),
                    entry_count,
                    created_at,
                ],
            )
            .await?;
        Ok(())
    }

    async fn outstanding(&self, node_id: &NodeId) -> Result<Option<RetainedPacket>> {
        let mut rows = self
            .conn
            .query(
                &format!(
                    "SELECT {PACKET_COLUMNS} FROM sync_packets
                     WHERE node_id = ?
                     ORDER BY packet_no LIMIT 1"
                ),
                [node_id.as_str()],
            )
            .await?;
        match rows.next().await? {
            Some(row) => Ok(Some(row_to_packet(&row)?)),
            None => Ok(None),
        }
    }

    async fn list(&self, node_id: Option<&NodeId>) -> Result<Vec<RetainedPacket>> {
        let mut rows = match node_id {
            Some(node_id) => {
                self.conn
                    .query(
                        &format!(
                            "SELECT {PACKET_COLUMNS} FROM sync_packets
                             WHERE node_id = ? ORDER BY packet_no"
                        ),
                        [node_id.as_str()],
                    )
                    .await?
            }
            None => {
                self.conn
                    .query(
                        &format!(
                            "SELECT {PACKET_COLUMNS} FROM sync_packets ORDER BY node_id, packet_no"
                        ),
                        (),
                    )
                    .await?
            }
        };

        let mut packets = Vec::new();
        while let Some(row) = rows.next().await? {
            packets.push(row_to_packet(&row)?);
        }
        Ok(packets)
    }

    async fn replace_payload(&self, node_id: &NodeId, packet_no: i64, payload: &[u8]) -> Result<()> {
        let updated = self
            .conn
            .execute(
                "UPDATE sync_packets SET payload = ? WHERE node_id = ? AND packet_no = ?",
                params![Value::Blob(payload.to_vec()), node_id.as_str(), packet_no],
            )
            .await?;
        if updated == 0 {
            return Err(Error::NotFound(format!(
                "retained packet {packet_no} for node {node_id}"
            )));
        }
        Ok(())
    }

    async fn record_attempt(&self, node_id: &NodeId, packet_no: i64, at: i64) -> Result<()> {
        self.conn
            .execute(
                "UPDATE sync_packets SET attempts = attempts + 1, last_attempt_at = ?
                 WHERE node_id = ? AND packet_no = ?",
                params![at, node_id.as_str(), packet_no],
            )
            .await?;
        Ok(())
    }

    async fn delete_acknowledged(&self, node_id: &NodeId, packet_no: i64) -> Result<u64> {
        let deleted = self
            .conn
            .execute(
                "DELETE FROM sync_packets WHERE node_id = ? AND packet_no <= ?",
                params![node_id.as_str(), packet_no],
            )
            .await?;
        Ok(deleted)
    }
}

fn row_to_packet(row: &Row) -> Result<RetainedPacket> {
    let payload = match row.get_value(2)? {
        Value::Blob(bytes) => bytes,
        other => {
            return Err(Error::Database(format!(
                "retained packet payload must be a blob, got {other:?}"
            )))
        }
    };

    Ok(RetainedPacket {
        node_id: node_id(row, 0)?,
        packet_no: row.get(1)?,
        payload,
        entry_count: row.get(3)?,
        created_at: row.get(4)?,
        attempts: row.get(5)?,
        last_attempt_at: optional_i64(row, 6)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::{Database, LibSqlNodeRepository, NodeRepository};
    use crate::models::SyncNode;

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
    async fn test_store_keeps_exact_bytes() {
        let (db, peer) = setup().await;
        let repo = LibSqlPacketRepository::new(db.connection());

        let payload = vec![0x28, 0xb5, 0x2f, 0xfd, 0x00, 0xff];
        repo.store(&peer, 1, &payload, 3, 10).await.unwrap();

        let packet = repo.outstanding(&peer).await.unwrap().unwrap();
        assert_eq!(packet.payload, payload);
        assert_eq!(packet.entry_count, 3);
        assert_eq!(packet.attempts, 0);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_attempts_are_counted() {
        let (db, peer) = setup().await;
        let repo = LibSqlPacketRepository::new(db.connection());
        repo.store(&peer, 1, b"x", 1, 10).await.unwrap();

        repo.record_attempt(&peer, 1, 20).await.unwrap();
        repo.record_attempt(&peer, 1, 30).await.unwrap();

        let packet = repo.outstanding(&peer).await.unwrap().unwrap();
        assert_eq!(packet.attempts, 2);
        assert_eq!(packet.last_attempt_at, Some(30));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_acknowledge_drops_packet() {
        let (db, peer) = setup().await;
        let repo = LibSqlPacketRepository::new(db.connection());
        repo.store(&peer, 1, b"x", 1, 10).await.unwrap();

        assert_eq!(repo.delete_acknowledged(&peer, 0).await.unwrap(), 0);
        assert_eq!(repo.delete_acknowledged(&peer, 1).await.unwrap(), 1);
        assert!(repo.outstanding(&peer).await.unwrap().is_none());
        assert!(repo.list(None).await.unwrap().is_empty());
    }
}

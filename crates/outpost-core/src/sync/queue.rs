//! Operator view of the outbound queue.

use serde::Serialize;

use super::context::SyncContext;
use crate::db::{ChangeRepository, LibSqlChangeRepository, LibSqlPacketRepository, PacketRepository, RetainedPacket};
use crate::error::{Error, Result};
use crate::models::{NodeId, SyncChange};

/// Pending changes plus packets still waiting for an acknowledgement
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct QueueSnapshot {
    pub pending: Vec<SyncChange>,
    pub in_flight: Vec<SyncChange>,
    pub packets: Vec<RetainedPacket>,
}

pub async fn inspect_queue(ctx: &SyncContext, target: Option<&NodeId>) -> Result<QueueSnapshot> {
    let db = ctx.db().lock().await;
    let (pending, in_flight) = LibSqlChangeRepository::new(db.connection())
        .list(target)
        .await?
        .into_iter()
        .partition(SyncChange::is_pending);
    let packets = LibSqlPacketRepository::new(db.connection())
        .list(target)
        .await?;
    Ok(QueueSnapshot {
        pending,
        in_flight,
        packets,
    })
}

/// Drop one change that has not been bundled yet.
///
/// The edit it carried will never reach that node.
pub async fn remove_pending_change(ctx: &SyncContext, id: i64) -> Result<SyncChange> {
    let db = ctx.db().lock().await;
    let changes = LibSqlChangeRepository::new(db.connection());
    let change = changes
        .get(id)
        .await?
        .ok_or_else(|| Error::NotFound(format!("queued change {id}")))?;
    if !changes.delete_pending(id).await? {
        return Err(Error::InvalidState(format!(
            "change {id} is already part of packet {} and cannot be removed",
            change.packet_no.unwrap_or_default()
        )));
    }

    tracing::warn!(
        change_id = id,
        target_node = %change.node_id,
        entity_type = %change.entity_type,
        entity_uuid = %change.entity_uuid,
        operation = %change.operation,
        "Removed queued change; this edit will not propagate to that node"
    );
    Ok(change)
}

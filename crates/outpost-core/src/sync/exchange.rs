//! Packet exchange between two nodes: acknowledgement, receiving and applying
//! a packet, and preparing the next outbound packet.
//!
//! Delivery is stop-and-wait per peer. At most one unacknowledged packet is
//! retained for a peer, and it is resent byte-for-byte until the peer's
//! `ack_packet_no` covers it. A peer with nothing new gets a heartbeat that
//! repeats the last acknowledged number and carries no entries.

use libsql::Connection;

use super::context::SyncContext;
use super::packet::{self, Packet, PacketEntry, PacketError};
use super::resolver::{ConflictDecision, ConflictResolver};
use super::tracker::{apply_change, serialize_entity, ApplyOutcome};
use crate::db::{
    ChangeRepository, EntityRepository, LibSqlChangeRepository, LibSqlEntityRepository,
    LibSqlNodeRepository, LibSqlPacketRepository, NodeRepository, PacketRepository,
};
use crate::error::{Error, Result};
use crate::models::{NodeId, SchemaRegistry, SyncNode};
use crate::util::now_ms;

/// Encoded packet ready to be sent to a peer
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutboundPacket {
    pub target: NodeId,
    pub packet_no: i64,
    pub bytes: Vec<u8>,
    pub entry_count: usize,
    /// A retained packet sent again
    pub resent: bool,
}

impl OutboundPacket {
    pub const fn is_heartbeat(&self) -> bool {
        self.entry_count == 0
    }
}

/// Counters for one applied packet
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ApplySummary {
    pub packet_no: i64,
    pub applied: usize,
    pub conflicts: usize,
    /// Conflicts where the incoming version was kept
    pub accepted: usize,
    /// Conflicts left for manual review
    pub deferred: usize,
}

/// What happened to a received packet
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReceiveOutcome {
    /// Every entry was applied or resolved
    Applied(ApplySummary),
    /// Already applied earlier, or a heartbeat; nothing written
    Duplicate { packet_no: i64 },
    /// An entry could not be applied; nothing from the packet was written
    Rejected { packet_no: i64, reason: String },
}

impl ReceiveOutcome {
    /// Entries that took effect
    pub const fn processed_count(&self) -> usize {
        match self {
            Self::Applied(summary) => summary.applied,
            Self::Duplicate { .. } | Self::Rejected { .. } => 0,
        }
    }

    pub const fn error_count(&self) -> usize {
        match self {
            Self::Rejected { .. } => 1,
            Self::Applied(_) | Self::Duplicate { .. } => 0,
        }
    }
}

/// Process the acknowledgement `peer` sent us.
///
/// Drops every retained packet and bundled change up to `ack_packet_no` and
/// records the acknowledged entity versions as the new conflict base for
/// `peer`. Returns the number of retained packets released.
pub async fn acknowledge(ctx: &SyncContext, peer: &NodeId, ack_packet_no: i64) -> Result<u64> {
    let db = ctx.db().lock().await;
    db.begin().await?;
    let result = acknowledge_in(
        db.connection(),
        ctx.settings().max_packet_bytes,
        peer,
        ack_packet_no,
    )
    .await;
    db.finish(result).await
}

async fn acknowledge_in(
    conn: &Connection,
    max_packet_bytes: usize,
    peer: &NodeId,
    ack_packet_no: i64,
) -> Result<u64> {
    let nodes = LibSqlNodeRepository::new(conn);
    let node = nodes
        .get(peer)
        .await?
        .ok_or_else(|| Error::NotFound(format!("node {peer}")))?;
    if ack_packet_no <= node.sent_packet_no {
        return Ok(0);
    }

    let packets = LibSqlPacketRepository::new(conn);
    let retained: Vec<_> = packets
        .list(Some(peer))
        .await?
        .into_iter()
        .filter(|retained| retained.packet_no <= ack_packet_no)
        .collect();
    let Some(highest) = retained.iter().map(|retained| retained.packet_no).max() else {
        tracing::warn!(
            peer = %peer,
            ack_packet_no,
            sent_packet_no = node.sent_packet_no,
            "Ignoring acknowledgement for a packet that was never sent"
        );
        return Ok(0);
    };

    let entities = LibSqlEntityRepository::new(conn);
    for retained in &retained {
        match packet::decompress(&retained.payload, max_packet_bytes) {
            Ok(sent) => {
                for entry in &sent.entries {
                    entities
                        .set_peer_state(
                            &entry.entity_type,
                            &entry.entity_uuid,
                            peer,
                            entry.data.updated_at,
                        )
                        .await?;
                }
            }
            Err(error) => tracing::warn!(
                peer = %peer,
                packet_no = retained.packet_no,
                "Retained packet unreadable, conflict base not advanced: {error}"
            ),
        }
    }

    let changes = LibSqlChangeRepository::new(conn)
        .delete_acknowledged(peer, highest)
        .await?;
    let released = packets.delete_acknowledged(peer, highest).await?;
    nodes.record_acknowledged(peer, highest, now_ms()).await?;

    tracing::debug!(peer = %peer, packet_no = highest, changes, "Packet acknowledged");
    Ok(released)
}

/// Validate and apply a packet from a peer.
///
/// Processes the packet's acknowledgement first, in its own transaction. The
/// entries are then applied all-or-nothing. Schema mismatches and structural
/// defects are returned as errors before anything is written.
pub async fn receive_packet(ctx: &SyncContext, packet: &Packet) -> Result<ReceiveOutcome> {
    let local = ctx.local_node().await?;
    packet::validate(packet, &local.id, ctx.schema())?;

    let peer = {
        let db = ctx.db().lock().await;
        LibSqlNodeRepository::new(db.connection())
            .get(&packet.source_node_id)
            .await?
    };
    let peer = match peer {
        Some(peer) if peer.is_active => peer,
        Some(_) => {
            return Err(Error::Auth(format!(
                "node {} is deactivated",
                packet.source_node_id
            )))
        }
        None => {
            return Err(Error::Auth(format!(
                "unknown source node {}",
                packet.source_node_id
            )))
        }
    };

    acknowledge(ctx, &peer.id, packet.ack_packet_no).await?;

    if packet.packet_no <= peer.received_packet_no {
        tracing::debug!(
            peer = %peer.id,
            packet_no = packet.packet_no,
            heartbeat = packet.is_heartbeat(),
            "Packet already applied"
        );
        return Ok(ReceiveOutcome::Duplicate {
            packet_no: packet.packet_no,
        });
    }

    let resolver = ConflictResolver::new(ctx, local.id);
    let db = ctx.db().lock().await;
    db.begin().await?;
    let result = apply_entries(db.connection(), ctx.schema(), &resolver, &peer, packet).await;

    match db.finish(result).await {
        Ok(None) => {
            tracing::debug!(
                peer = %peer.id,
                packet_no = packet.packet_no,
                "Packet applied by a concurrent delivery"
            );
            Ok(ReceiveOutcome::Duplicate {
                packet_no: packet.packet_no,
            })
        }
        Ok(Some(summary)) => {
            tracing::info!(
                peer = %peer.id,
                packet_no = summary.packet_no,
                applied = summary.applied,
                conflicts = summary.conflicts,
                "Applied packet"
            );
            Ok(ReceiveOutcome::Applied(summary))
        }
        Err(Error::Packet(PacketError::Invalid(reason))) => {
            tracing::warn!(
                peer = %peer.id,
                packet_no = packet.packet_no,
                "Rejected packet: {reason}"
            );
            Ok(ReceiveOutcome::Rejected {
                packet_no: packet.packet_no,
                reason,
            })
        }
        Err(error) => Err(error),
    }
}

/// Apply every entry in one transaction the caller opened.
///
/// Returns `None` when the packet number was recorded after the caller's
/// duplicate check, so overlapping deliveries apply a packet once. A rejected
/// entry fails the whole packet with [`PacketError::Invalid`].
async fn apply_entries(
    conn: &Connection,
    schema: &SchemaRegistry,
    resolver: &ConflictResolver<'_>,
    peer: &SyncNode,
    packet: &Packet,
) -> Result<Option<ApplySummary>> {
    let nodes = LibSqlNodeRepository::new(conn);
    let received = nodes
        .get(&peer.id)
        .await?
        .map_or(peer.received_packet_no, |node| node.received_packet_no);
    if packet.packet_no <= received {
        return Ok(None);
    }

    let mut summary = ApplySummary {
        packet_no: packet.packet_no,
        ..ApplySummary::default()
    };

    for entry in &packet.entries {
        match apply_change(conn, schema, &peer.id, entry).await? {
            ApplyOutcome::Applied => summary.applied += 1,
            ApplyOutcome::Conflict(details) => {
                let resolution = resolver.resolve(conn, &details).await?;
                summary.applied += 1;
                summary.conflicts += 1;
                match resolution.decision {
                    ConflictDecision::AcceptIncoming => summary.accepted += 1,
                    ConflictDecision::Defer => summary.deferred += 1,
                    ConflictDecision::KeepLocal => {}
                }
            }
            ApplyOutcome::Rejected(reason) => {
                return Err(PacketError::Invalid(format!(
                    "{} {}: {reason}",
                    entry.entity_type, entry.entity_uuid
                ))
                .into());
            }
        }
    }

    nodes
        .record_received(&peer.id, packet.packet_no, now_ms())
        .await?;
    Ok(Some(summary))
}

/// Rewrite retained packets with the current schema version.
///
/// Used after a schema upgrade lifts a block: the retained packets were refused
/// for their old schema version, so they keep their numbers and entries but
/// are re-encoded. Returns the number of packets rewritten.
pub async fn restamp_retained(ctx: &SyncContext) -> Result<usize> {
    let version = ctx.schema().version();
    let max_packet_bytes = ctx.settings().max_packet_bytes;
    let db = ctx.db().lock().await;
    db.begin().await?;
    let result = async {
        let packets = LibSqlPacketRepository::new(db.connection());
        let mut rewritten = 0;
        for retained in packets.list(None).await? {
            let mut packet = packet::decompress(&retained.payload, max_packet_bytes)?;
            if packet.schema_version == version {
                continue;
            }
            packet.schema_version = version;
            let bytes = packet::compress(&packet)?;
            packets
                .replace_payload(&retained.node_id, retained.packet_no, &bytes)
                .await?;
            rewritten += 1;
        }
        Ok(rewritten)
    }
    .await;
    db.finish(result).await
}

/// The packet to send to `peer` next.
///
/// Resends the retained packet if one is outstanding; otherwise bundles up to
/// `batch_size` pending changes into a new retained packet, or builds a
/// heartbeat when nothing is pending.
pub async fn prepare_outbound(ctx: &SyncContext, peer: &NodeId) -> Result<OutboundPacket> {
    let local = ctx.local_node().await?;
    let db = ctx.db().lock().await;
    db.begin().await?;
    let result = prepare_in(db.connection(), ctx, &local, peer).await;
    db.finish(result).await
}

async fn prepare_in(
    conn: &Connection,
    ctx: &SyncContext,
    local: &SyncNode,
    peer: &NodeId,
) -> Result<OutboundPacket> {
    let packets = LibSqlPacketRepository::new(conn);
    let now = now_ms();

    if let Some(retained) = packets.outstanding(peer).await? {
        packets
            .record_attempt(peer, retained.packet_no, now)
            .await?;
        tracing::debug!(
            peer = %peer,
            packet_no = retained.packet_no,
            attempts = retained.attempts + 1,
            "Resending retained packet"
        );
        return Ok(OutboundPacket {
            target: *peer,
            packet_no: retained.packet_no,
            entry_count: usize::try_from(retained.entry_count).unwrap_or_default(),
            bytes: retained.payload,
            resent: true,
        });
    }

    let node = LibSqlNodeRepository::new(conn)
        .get(peer)
        .await?
        .ok_or_else(|| Error::NotFound(format!("node {peer}")))?;

    let changes = LibSqlChangeRepository::new(conn);
    let entities = LibSqlEntityRepository::new(conn);
    let pending = changes.pending(peer, ctx.settings().batch_size).await?;

    let mut bundled = Vec::with_capacity(pending.len());
    let mut entries = Vec::with_capacity(pending.len());
    for change in pending {
        let Some(data) =
            serialize_entity(conn, ctx.schema(), &change.entity_type, &change.entity_uuid).await?
        else {
            tracing::warn!(
                change_id = change.id,
                entity_type = %change.entity_type,
                entity_uuid = %change.entity_uuid,
                "Dropping change for an entity that no longer exists"
            );
            changes.delete_pending(change.id).await?;
            continue;
        };
        let base_updated_at = entities
            .peer_state(&change.entity_type, &change.entity_uuid, peer)
            .await?;
        bundled.push(change.id);
        entries.push(PacketEntry {
            entity_type: change.entity_type,
            entity_uuid: change.entity_uuid,
            operation: change.operation,
            base_updated_at,
            data,
        });
    }

    let packet_no = if entries.is_empty() {
        node.sent_packet_no
    } else {
        node.sent_packet_no + 1
    };
    let packet = Packet {
        source_node_id: local.id,
        target_node_id: *peer,
        packet_no,
        ack_packet_no: node.received_packet_no,
        schema_version: ctx.schema().version(),
        created_at: now,
        entries,
    };
    let bytes = packet::compress(&packet)?;
    let entry_count = packet.entries.len();

    if entry_count > 0 {
        changes.stamp(&bundled, packet_no).await?;
        packets
            .store(peer, packet_no, &bytes, i64::try_from(entry_count).unwrap_or(i64::MAX), now)
            .await?;
        packets.record_attempt(peer, packet_no, now).await?;
        tracing::debug!(peer = %peer, packet_no, entries = entry_count, "Bundled packet");
    }

    Ok(OutboundPacket {
        target: *peer,
        packet_no,
        bytes,
        entry_count,
        resent: false,
    })
}

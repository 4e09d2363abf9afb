//! Packet files for exchanges without a network path.
//!
//! An exported file is the exact retained packet, so exporting again before
//! the peer answers produces the same bytes, and importing a file twice is a
//! duplicate like any other resend.

use std::path::Path;

use serde::Serialize;

use super::context::SyncContext;
use super::exchange::{prepare_outbound, receive_packet, ReceiveOutcome};
use super::packet;
use crate::db::{LibSqlNodeRepository, NodeRepository};
use crate::error::{Error, Result};
use crate::models::NodeId;

/// What was written to a packet file
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ExportSummary {
    pub target: NodeId,
    pub packet_no: i64,
    pub entries: usize,
    pub bytes: usize,
    pub resent: bool,
}

/// Write the next packet for `peer_code` to `path`.
pub async fn export_pending(
    ctx: &SyncContext,
    peer_code: &str,
    path: impl AsRef<Path>,
) -> Result<ExportSummary> {
    let peer = {
        let db = ctx.db().lock().await;
        LibSqlNodeRepository::new(db.connection())
            .get_by_code(peer_code.trim())
            .await?
            .ok_or_else(|| Error::NotFound(format!("node `{}`", peer_code.trim())))?
    };
    if peer.is_local {
        return Err(Error::InvalidInput(
            "cannot export packets addressed to this node".to_string(),
        ));
    }

    let outbound = prepare_outbound(ctx, &peer.id).await?;
    let path = path.as_ref();
    if let Some(parent) = path.parent().filter(|parent| !parent.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(path, &outbound.bytes)?;

    tracing::info!(
        peer = %peer.code,
        packet_no = outbound.packet_no,
        entries = outbound.entry_count,
        path = %path.display(),
        "Exported packet file"
    );
    Ok(ExportSummary {
        target: peer.id,
        packet_no: outbound.packet_no,
        entries: outbound.entry_count,
        bytes: outbound.bytes.len(),
        resent: outbound.resent,
    })
}

/// Apply a packet file written by a peer's [`export_pending`].
pub async fn import_packet_file(ctx: &SyncContext, path: impl AsRef<Path>) -> Result<ReceiveOutcome> {
    let path = path.as_ref();
    let bytes = std::fs::read(path)?;
    let incoming = packet::decompress(&bytes, ctx.settings().max_packet_bytes)?;
    let outcome = receive_packet(ctx, &incoming).await?;

    tracing::info!(
        source = %incoming.source_node_id,
        packet_no = incoming.packet_no,
        path = %path.display(),
        outcome = ?outcome,
        "Imported packet file"
    );
    Ok(outcome)
}

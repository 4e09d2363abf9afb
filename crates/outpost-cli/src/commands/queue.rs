use std::path::Path;

use outpost_core::db::{LibSqlNodeRepository, NodeRepository, RetainedPacket};
use outpost_core::sync::{
    export_pending, import_packet_file, inspect_queue, remove_pending_change, QueueSnapshot,
    ReceiveOutcome,
};
use outpost_core::{NodeId, SyncContext};

use crate::cli::GlobalArgs;
use crate::commands::common::{
    format_change_lines, format_optional_timestamp, format_sync_timestamp, open_context,
    print_json,
};
use crate::error::CliError;

pub async fn run_queue_list(global: &GlobalArgs, peer: Option<&str>) -> Result<(), CliError> {
    let ctx = open_context(global).await?;
    let target = match peer {
        Some(code) => Some(peer_id(&ctx, code).await?),
        None => None,
    };
    let snapshot = inspect_queue(&ctx, target.as_ref()).await?;

    if global.json {
        return print_json(&snapshot);
    }
    for line in format_queue_lines(&snapshot) {
        println!("{line}");
    }
    Ok(())
}

pub async fn peer_id(ctx: &SyncContext, code: &str) -> Result<NodeId, CliError> {
    let db = ctx.db().lock().await;
    let node = LibSqlNodeRepository::new(db.connection())
        .get_by_code(code.trim())
        .await?
        .ok_or_else(|| outpost_core::Error::NotFound(format!("node `{}`", code.trim())))?;
    Ok(node.id)
}

pub fn format_queue_lines(snapshot: &QueueSnapshot) -> Vec<String> {
    if snapshot.pending.is_empty() && snapshot.in_flight.is_empty() && snapshot.packets.is_empty()
    {
        return vec!["Queue is empty.".to_string()];
    }

    let mut lines = vec![format!("Pending changes: {}", snapshot.pending.len())];
    lines.extend(format_change_lines(&snapshot.pending));
    lines.push(format!("In flight: {}", snapshot.in_flight.len()));
    lines.extend(format_change_lines(&snapshot.in_flight));
    lines.push(format!("Unacknowledged packets: {}", snapshot.packets.len()));
    lines.extend(snapshot.packets.iter().map(format_packet_line));
    lines
}

fn format_packet_line(packet: &RetainedPacket) -> String {
    format!(
        "  #{:<6} to={}  entries={}  attempts={}  created {}  last sent {}",
        packet.packet_no,
        packet.node_id,
        packet.entry_count,
        packet.attempts,
        format_sync_timestamp(packet.created_at),
        format_optional_timestamp(packet.last_attempt_at),
    )
}

pub async fn run_queue_remove(global: &GlobalArgs, id: i64) -> Result<(), CliError> {
    let ctx = open_context(global).await?;
    let change = remove_pending_change(&ctx, id).await?;

    if global.json {
        return print_json(&change);
    }
    println!(
        "Removed change {} ({} {}/{}); it will not be sent to {}",
        change.id,
        change.operation.as_str(),
        change.entity_type,
        change.entity_uuid,
        change.node_id
    );
    Ok(())
}

pub async fn run_queue_export(
    global: &GlobalArgs,
    peer: &str,
    path: &Path,
) -> Result<(), CliError> {
    let ctx = open_context(global).await?;
    let summary = export_pending(&ctx, peer, path).await?;

    if global.json {
        return print_json(&summary);
    }
    let resent = if summary.resent {
        " (unacknowledged packet written again)"
    } else {
        ""
    };
    println!(
        "Wrote packet #{} with {} change(s), {} bytes, to {}{resent}",
        summary.packet_no,
        summary.entries,
        summary.bytes,
        path.display()
    );
    Ok(())
}

pub async fn run_queue_import(global: &GlobalArgs, path: &Path) -> Result<(), CliError> {
    let ctx = open_context(global).await?;
    let outcome = import_packet_file(&ctx, path).await?;

    if let ReceiveOutcome::Rejected { packet_no, reason } = &outcome {
        return Err(CliError::PacketRejected(*packet_no, reason.clone()));
    }
    if global.json {
        return print_json(&serde_json::json!({
            "processed_count": outcome.processed_count(),
            "duplicate": matches!(outcome, ReceiveOutcome::Duplicate { .. }),
        }));
    }
    println!("{}", describe_receive(&outcome));
    Ok(())
}

pub fn describe_receive(outcome: &ReceiveOutcome) -> String {
    match outcome {
        ReceiveOutcome::Applied(summary) => format!(
            "Applied packet #{}: {} change(s), {} conflict(s), {} waiting for manual resolution",
            summary.packet_no, summary.applied, summary.conflicts, summary.deferred
        ),
        ReceiveOutcome::Duplicate { packet_no } => {
            format!("Packet #{packet_no} was already applied; nothing changed")
        }
        ReceiveOutcome::Rejected { packet_no, reason } => {
            format!("Packet #{packet_no} rejected: {reason}")
        }
    }
}

use std::sync::Arc;

use outpost_core::db::settings_repository::keys;
use outpost_core::db::{LibSqlNodeRepository, NodeRepository};
use outpost_core::sync::{
    inspect_queue, CycleOutcome, CycleReport, SyncOrchestrator, SyncScheduler, SyncTransport,
};
use outpost_core::{NodeRole, SyncContext, SyncNode, SyncState};
use serde::Serialize;
use tokio_util::sync::CancellationToken;

use crate::cli::GlobalArgs;
use crate::commands::common::{
    format_optional_timestamp, http_transport, open_context, print_json, resolve_server_url,
};
use crate::error::CliError;

#[derive(Debug, Serialize)]
pub struct NodeStatus {
    pub local: Option<SyncNode>,
    pub role: NodeRole,
    pub schema_version: u32,
    pub blocked_schema_version: Option<u32>,
    pub server_url: Option<String>,
    pub peers: Vec<SyncNode>,
    pub pending_changes: usize,
    pub in_flight_changes: usize,
    pub unacknowledged_packets: usize,
}

pub async fn run_register(
    global: &GlobalArgs,
    code: &str,
    name: &str,
    description: Option<String>,
) -> Result<(), CliError> {
    let ctx = open_context(global).await?;
    let url = resolve_server_url(global.server_url.as_deref(), &ctx).await?;
    let transport = http_transport(&url, ctx.settings())?;

    let node = register_node(&ctx, transport, code, name, description).await?;
    ctx.db().set_setting(keys::SERVER_URL, &url).await?;

    if global.json {
        return print_json(&node);
    }
    println!("Registered {} as {} with {url}", node.code, node.id);
    Ok(())
}

pub async fn register_node<T: SyncTransport>(
    ctx: &SyncContext,
    transport: T,
    code: &str,
    name: &str,
    description: Option<String>,
) -> Result<SyncNode, CliError> {
    let orchestrator = SyncOrchestrator::new(ctx.clone(), transport).await?;
    Ok(orchestrator.register(code, name, description).await?)
}

pub async fn run_sync(global: &GlobalArgs) -> Result<(), CliError> {
    let ctx = open_context(global).await?;
    let url = resolve_server_url(global.server_url.as_deref(), &ctx).await?;
    let orchestrator =
        SyncOrchestrator::new(ctx.clone(), http_transport(&url, ctx.settings())?).await?;

    let cancel = CancellationToken::new();
    let on_interrupt = cancel.clone();
    let interrupt = tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            on_interrupt.cancel();
        }
    });
    let outcome = orchestrator.run_cycle(&cancel).await;
    interrupt.abort();

    print_cycle_outcome(outcome?, global.json)
}

pub fn print_cycle_outcome(outcome: CycleOutcome, as_json: bool) -> Result<(), CliError> {
    match outcome {
        CycleOutcome::Completed(report) if as_json => print_json(&report)?,
        CycleOutcome::Completed(report) => println!("{}", describe_report(&report)),
        CycleOutcome::Skipped if as_json => print_json(&serde_json::json!({ "skipped": true }))?,
        CycleOutcome::Skipped => println!("Another sync cycle is already running"),
        CycleOutcome::Cancelled if as_json => {
            print_json(&serde_json::json!({ "cancelled": true }))?;
        }
        CycleOutcome::Cancelled => println!("Sync cancelled"),
    }
    Ok(())
}

pub fn describe_report(report: &CycleReport) -> String {
    let convergence = if report.converged {
        "in sync"
    } else {
        "more changes pending"
    };
    format!(
        "Sync completed in {} round(s): sent {}, received {}, conflicts {} ({convergence})",
        report.rounds, report.sent, report.received, report.conflicts
    )
}

pub async fn run_daemon(global: &GlobalArgs) -> Result<(), CliError> {
    let ctx = open_context(global).await?;
    let url = resolve_server_url(global.server_url.as_deref(), &ctx).await?;
    let interval = ctx.settings().sync_interval;
    let orchestrator = Arc::new(
        SyncOrchestrator::new(ctx.clone(), http_transport(&url, ctx.settings())?).await?,
    );
    if orchestrator.state() == SyncState::Unregistered {
        return Err(outpost_core::Error::NotRegistered.into());
    }

    let mut states = orchestrator.subscribe();
    let scheduler = SyncScheduler::spawn(Arc::clone(&orchestrator), interval);
    println!(
        "Syncing with {url} every {}s; press Ctrl-C to stop",
        interval.as_secs()
    );

    loop {
        tokio::select! {
            signal = tokio::signal::ctrl_c() => {
                signal?;
                break;
            }
            changed = states.changed() => {
                if changed.is_err() {
                    break;
                }
                let state = states.borrow_and_update().clone();
                if let SyncState::Error { message, .. } = &state {
                    eprintln!("Sync {}: {message}", state.label());
                } else {
                    tracing::debug!(state = state.label(), "Sync state changed");
                }
            }
        }
    }

    scheduler.shutdown().await;
    Ok(())
}

pub async fn run_status(global: &GlobalArgs) -> Result<(), CliError> {
    let ctx = open_context(global).await?;
    let status = collect_status(&ctx).await?;

    if global.json {
        return print_json(&status);
    }
    for line in format_status_lines(&status) {
        println!("{line}");
    }
    Ok(())
}

pub async fn collect_status(ctx: &SyncContext) -> Result<NodeStatus, CliError> {
    let nodes = {
        let db = ctx.db().lock().await;
        LibSqlNodeRepository::new(db.connection()).list().await?
    };
    let (local, peers): (Vec<_>, Vec<_>) = nodes.into_iter().partition(|node| node.is_local);
    let blocked_schema_version = ctx
        .db()
        .get_setting(keys::BLOCKED_SCHEMA_VERSION)
        .await?
        .and_then(|raw| raw.parse().ok());
    let server_url = ctx.db().get_setting(keys::SERVER_URL).await?;
    let queue = inspect_queue(ctx, None).await?;

    Ok(NodeStatus {
        local: local.into_iter().next(),
        role: ctx.role(),
        schema_version: ctx.schema().version(),
        blocked_schema_version,
        server_url,
        peers,
        pending_changes: queue.pending.len(),
        in_flight_changes: queue.in_flight.len(),
        unacknowledged_packets: queue.packets.len(),
    })
}

pub fn format_status_lines(status: &NodeStatus) -> Vec<String> {
    let mut lines = Vec::new();
    match &status.local {
        Some(node) => lines.push(format!("Node      {} ({}) {}", node.code, node.name, node.id)),
        None => lines.push("Node      not registered".to_string()),
    }
    let role = if status.role.is_server() {
        "server"
    } else {
        "client"
    };
    lines.push(format!("Role      {role}"));
    lines.push(format!("Schema    v{}", status.schema_version));
    if let Some(blocked) = status.blocked_schema_version {
        lines.push(format!(
            "Blocked   server refused schema v{blocked}; upgrade to resume sync"
        ));
    }
    if let Some(url) = &status.server_url {
        lines.push(format!("Server    {url}"));
    }
    lines.push(format!(
        "Queue     {} pending, {} in flight, {} unacknowledged packet(s)",
        status.pending_changes, status.in_flight_changes, status.unacknowledged_packets
    ));
    for peer in &status.peers {
        let active = if peer.is_active { "" } else { "  [inactive]" };
        lines.push(format!(
            "Peer      {:<12}  in #{} at {}  out #{} at {}{active}",
            peer.code,
            peer.received_packet_no,
            format_optional_timestamp(peer.last_sync_in),
            peer.sent_packet_no,
            format_optional_timestamp(peer.last_sync_out),
        ));
    }
    lines
}

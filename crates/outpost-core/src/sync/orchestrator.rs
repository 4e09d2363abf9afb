//! Client-side sync driver.
//!
//! A cycle exchanges packets with the server until neither side has anything
//! left to send, or the round limit is reached. Each round sends one packet,
//! applies the reply, and lets the next round carry the acknowledgement back.

use serde::Serialize;
use tokio::sync::{watch, Mutex};
use tokio_util::sync::CancellationToken;

use super::context::SyncContext;
use super::exchange::{prepare_outbound, receive_packet, restamp_retained, ReceiveOutcome};
use super::packet::{self, PacketError};
use super::protocol::{ExchangeRequest, RegisterRequest};
use super::registry::validate_code;
use super::tracker::enqueue_snapshot;
use super::transport::{RetryPolicy, SyncTransport, TransportError};
use crate::db::settings_repository::keys;
use crate::db::{LibSqlNodeRepository, LibSqlSettingsRepository, NodeRepository, SettingsRepository};
use crate::error::{Error, Result};
use crate::models::SyncNode;
use crate::state::SyncState;

/// Totals for one completed cycle
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CycleReport {
    pub rounds: u32,
    /// Entries in packets sent for the first time
    pub sent: usize,
    /// Entries applied from the server's packets
    pub received: usize,
    pub conflicts: usize,
    /// Both sides ended with nothing to send
    pub converged: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CycleOutcome {
    Completed(CycleReport),
    /// Another cycle was already running
    Skipped,
    Cancelled,
}

/// Drives registration and sync cycles for one client node.
pub struct SyncOrchestrator<T> {
    ctx: SyncContext,
    transport: T,
    retry: RetryPolicy,
    state: watch::Sender<SyncState>,
    cycle: Mutex<()>,
}

impl<T: SyncTransport> SyncOrchestrator<T> {
    pub async fn new(ctx: SyncContext, transport: T) -> Result<Self> {
        if ctx.role().is_server() {
            return Err(Error::InvalidState(
                "the sync orchestrator runs on client nodes".to_string(),
            ));
        }
        let retry = RetryPolicy::from_settings(ctx.settings());
        let initial = initial_state(&ctx).await?;
        let (state, _) = watch::channel(initial);
        Ok(Self {
            ctx,
            transport,
            retry,
            state,
            cycle: Mutex::new(()),
        })
    }

    pub const fn context(&self) -> &SyncContext {
        &self.ctx
    }

    pub const fn transport(&self) -> &T {
        &self.transport
    }

    pub fn state(&self) -> SyncState {
        self.state.borrow().clone()
    }

    /// Watch state transitions.
    pub fn subscribe(&self) -> watch::Receiver<SyncState> {
        self.state.subscribe()
    }

    fn set_state(&self, next: SyncState) {
        self.state.send_if_modified(|current| {
            if *current == next {
                false
            } else {
                tracing::debug!(from = current.label(), to = next.label(), "Sync state changed");
                *current = next;
                true
            }
        });
    }

    /// Register this node with the server and store the identity it assigns.
    ///
    /// Entities created before registration are queued for the server.
    pub async fn register(
        &self,
        code: &str,
        name: &str,
        description: Option<String>,
    ) -> Result<SyncNode> {
        let _guard = self.cycle.lock().await;
        if let Some(local) = self.local_node().await? {
            return Err(Error::InvalidState(format!(
                "node is already registered as `{}`",
                local.code
            )));
        }

        let request = RegisterRequest {
            code: validate_code(code)?,
            name: name.trim().to_string(),
            description,
        };

        self.set_state(SyncState::Registering);
        let response = match self
            .retry
            .run("register", || self.transport.register(&request))
            .await
        {
            Ok(response) => response,
            Err(error) => {
                self.set_state(SyncState::Unregistered);
                return Err(error);
            }
        };

        let mut local = SyncNode::new(response.node_id, request.code.clone(), request.name.clone());
        local.description = request.description.clone();
        local.is_local = true;
        local.schema_version = Some(self.ctx.schema().version());

        let mut server = SyncNode::new(
            response.server_node_id,
            response.server_code.clone(),
            response.server_code.clone(),
        );
        server.is_server = true;
        server.schema_version = Some(response.schema_version);

        let db = self.ctx.db().lock().await;
        db.begin().await?;
        let result = async {
            let nodes = LibSqlNodeRepository::new(db.connection());
            nodes.insert(&local).await?;
            nodes.insert(&server).await?;
            LibSqlSettingsRepository::new(db.connection())
                .set(keys::AUTH_TOKEN, &response.auth_token)
                .await?;
            enqueue_snapshot(db.connection(), &server.id).await
        }
        .await;
        let queued = db.finish(result).await;
        drop(db);

        let queued = match queued {
            Ok(queued) => queued,
            Err(error) => {
                self.set_state(SyncState::Unregistered);
                return Err(error);
            }
        };

        tracing::info!(
            node_id = %local.id,
            code = %local.code,
            server = %server.code,
            server_version = %response.server_version,
            queued,
            "Registered with sync server"
        );
        self.set_state(SyncState::Idle);
        Ok(local)
    }

    /// Run one sync cycle unless one is already running.
    pub async fn run_cycle(&self, cancel: &CancellationToken) -> Result<CycleOutcome> {
        let Ok(_guard) = self.cycle.try_lock() else {
            tracing::debug!("Sync cycle already running; skipping");
            return Ok(CycleOutcome::Skipped);
        };

        if let Err(error) = self.check_blocked().await {
            self.fail(&error);
            return Err(error);
        }

        let Some(local) = self.local_node().await? else {
            self.set_state(SyncState::Unregistered);
            return Err(Error::NotRegistered);
        };
        let (server, token) = self.server_and_token().await?;

        self.set_state(SyncState::Syncing);
        match self.exchange_rounds(&local, &server, &token, cancel).await {
            Ok(outcome) => {
                self.set_state(SyncState::Idle);
                if let CycleOutcome::Completed(report) = &outcome {
                    tracing::info!(
                        rounds = report.rounds,
                        sent = report.sent,
                        received = report.received,
                        conflicts = report.conflicts,
                        converged = report.converged,
                        "Sync cycle finished"
                    );
                } else {
                    tracing::info!("Sync cycle cancelled");
                }
                Ok(outcome)
            }
            Err(error) => {
                let error = self.block_if_upgrade_required(error).await;
                self.fail(&error);
                Err(error)
            }
        }
    }

    async fn exchange_rounds(
        &self,
        local: &SyncNode,
        server: &SyncNode,
        token: &str,
        cancel: &CancellationToken,
    ) -> Result<CycleOutcome> {
        let mut report = CycleReport::default();
        let max_rounds = self.ctx.settings().max_rounds.max(1);

        while report.rounds < max_rounds {
            if cancel.is_cancelled() {
                return Ok(CycleOutcome::Cancelled);
            }
            report.rounds += 1;

            let outbound = prepare_outbound(&self.ctx, &server.id).await?;
            if !outbound.resent {
                report.sent += outbound.entry_count;
            }
            let request = ExchangeRequest {
                packet_data: packet::encode_base64(&outbound.bytes),
            };

            // Only the network wait is abandoned on cancel; local writes always finish.
            let response = tokio::select! {
                biased;
                () = cancel.cancelled() => return Ok(CycleOutcome::Cancelled),
                response = self.retry.run("exchange", || self.transport.exchange(token, &request)) => response?,
            };
            if !response.success {
                return Err(TransportError::Rejected(response.message).into());
            }

            let data = response
                .packet_data
                .ok_or_else(|| PacketError::Malformed("exchange reply carries no packet".into()))?;
            let reply = packet::decompress(
                &packet::decode_base64(&data)?,
                self.ctx.settings().max_packet_bytes,
            )?;

            match receive_packet(&self.ctx, &reply).await? {
                ReceiveOutcome::Applied(summary) => {
                    report.received += summary.applied;
                    report.conflicts += summary.conflicts;
                }
                ReceiveOutcome::Duplicate { .. } => {}
                ReceiveOutcome::Rejected { reason, .. } => {
                    return Err(PacketError::Invalid(reason).into());
                }
            }

            tracing::debug!(
                node = %local.code,
                round = report.rounds,
                sent_packet = outbound.packet_no,
                reply_packet = reply.packet_no,
                "Exchange round complete"
            );

            if outbound.is_heartbeat() && reply.is_heartbeat() {
                report.converged = true;
                break;
            }
        }

        if !report.converged {
            tracing::warn!(rounds = report.rounds, "Round limit reached before sync converged");
        }
        Ok(CycleOutcome::Completed(report))
    }

    async fn local_node(&self) -> Result<Option<SyncNode>> {
        let db = self.ctx.db().lock().await;
        LibSqlNodeRepository::new(db.connection()).local().await
    }

    async fn server_and_token(&self) -> Result<(SyncNode, String)> {
        let db = self.ctx.db().lock().await;
        let server = LibSqlNodeRepository::new(db.connection())
            .list()
            .await?
            .into_iter()
            .find(|node| node.is_server && !node.is_local)
            .ok_or(Error::NotRegistered)?;
        let token = LibSqlSettingsRepository::new(db.connection())
            .get(keys::AUTH_TOKEN)
            .await?
            .ok_or(Error::NotRegistered)?;
        Ok((server, token))
    }

    /// Fail fast while the schema the server refused is still in use.
    async fn check_blocked(&self) -> Result<()> {
        let Some(blocked) = blocked_schema_version(&self.ctx).await? else {
            return Ok(());
        };
        if blocked == self.ctx.schema().version() {
            return Err(Error::SchemaBlocked(blocked));
        }

        let restamped = restamp_retained(&self.ctx).await?;
        self.ctx.db().delete_setting(keys::BLOCKED_SCHEMA_VERSION).await?;
        tracing::info!(
            blocked,
            current = self.ctx.schema().version(),
            restamped,
            "Local schema changed; sync unblocked"
        );
        Ok(())
    }

    async fn block_if_upgrade_required(&self, error: Error) -> Error {
        let upgrade_required = matches!(
            error,
            Error::SchemaIncompatible { .. }
                | Error::Transport(TransportError::UpgradeRequired(_))
        );
        if !upgrade_required {
            return error;
        }

        let version = self.ctx.schema().version();
        if let Err(store_error) = self
            .ctx
            .db()
            .set_setting(keys::BLOCKED_SCHEMA_VERSION, &version.to_string())
            .await
        {
            tracing::error!("Failed to persist schema block: {store_error}");
        }
        tracing::error!(
            schema_version = version,
            "Server requires a schema upgrade; sync halted: {error}"
        );
        Error::SchemaBlocked(version)
    }

    fn fail(&self, error: &Error) {
        if !error.is_blocking() {
            tracing::warn!("Sync cycle failed: {error}");
        }
        self.set_state(SyncState::Error {
            blocking: error.is_blocking(),
            message: error.to_string(),
        });
    }
}

async fn blocked_schema_version(ctx: &SyncContext) -> Result<Option<u32>> {
    let Some(raw) = ctx.db().get_setting(keys::BLOCKED_SCHEMA_VERSION).await? else {
        return Ok(None);
    };
    match raw.trim().parse() {
        Ok(version) => Ok(Some(version)),
        Err(_) => {
            tracing::warn!(value = %raw, "Ignoring unreadable schema block marker");
            Ok(None)
        }
    }
}

async fn initial_state(ctx: &SyncContext) -> Result<SyncState> {
    let registered = {
        let db = ctx.db().lock().await;
        LibSqlNodeRepository::new(db.connection())
            .local()
            .await?
            .is_some()
    };
    if !registered {
        return Ok(SyncState::Unregistered);
    }
    match blocked_schema_version(ctx).await? {
        Some(version) if version == ctx.schema().version() => Ok(SyncState::Error {
            blocking: true,
            message: Error::SchemaBlocked(version).to_string(),
        }),
        _ => Ok(SyncState::Idle),
    }
}

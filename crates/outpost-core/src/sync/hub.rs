//! Server side of the exchange protocol.

use std::sync::Arc;

use super::context::SyncContext;
use super::exchange::{prepare_outbound, receive_packet, ReceiveOutcome};
use super::packet;
use super::protocol::{
    ExchangeRequest, ExchangeResponse, RegisterRequest, RegisterResponse, StatusResponse,
    SERVER_VERSION,
};
use super::registry::{NodeRegistry, TokenIssuer};
use super::transport::{SyncTransport, TransportError};
use crate::db::{ChangeRepository, LibSqlChangeRepository, LibSqlNodeRepository, NodeRepository};
use crate::error::{Error, Result};
use crate::models::{NodeId, SyncNode};

/// The central node every client exchanges packets with.
///
/// Requests from different nodes run concurrently; each one holds the
/// database only for its own transactions.
#[derive(Debug, Clone)]
pub struct SyncHub {
    registry: Arc<NodeRegistry>,
    local: SyncNode,
}

impl SyncHub {
    /// Open the hub, creating the server's own node row on first start.
    pub async fn start(ctx: SyncContext, tokens: TokenIssuer, code: &str, name: &str) -> Result<Self> {
        if !ctx.role().is_server() {
            return Err(Error::InvalidState(
                "a sync hub needs a server context".to_string(),
            ));
        }
        let registry = NodeRegistry::new(ctx, tokens);
        let local = registry.ensure_local_node(code, name).await?;
        tracing::info!(
            node_id = %local.id,
            code = %local.code,
            schema_version = registry.context().schema().version(),
            "Sync hub ready"
        );
        Ok(Self {
            registry: Arc::new(registry),
            local,
        })
    }

    pub fn context(&self) -> &SyncContext {
        self.registry.context()
    }

    pub fn registry(&self) -> &NodeRegistry {
        &self.registry
    }

    pub const fn local_node(&self) -> &SyncNode {
        &self.local
    }

    pub async fn register(&self, request: &RegisterRequest) -> Result<RegisterResponse> {
        let registration = self
            .registry
            .register(&request.code, &request.name, request.description.clone())
            .await?;
        Ok(RegisterResponse {
            node_id: registration.node.id,
            auth_token: registration.auth_token,
            server_version: SERVER_VERSION.to_string(),
            server_node_id: self.local.id,
            server_code: self.local.code.clone(),
            schema_version: self.context().schema().version(),
        })
    }

    /// Authenticate, apply the node's packet, and reply with ours.
    pub async fn exchange(&self, token: &str, request: &ExchangeRequest) -> Result<ExchangeResponse> {
        let node = self.registry.authenticate(token).await?;
        let ctx = self.context();

        let bytes = packet::decode_base64(&request.packet_data)?;
        let incoming = packet::decompress(&bytes, ctx.settings().max_packet_bytes)?;
        if incoming.source_node_id != node.id {
            tracing::warn!(
                target: "outpost::security",
                node_id = %node.id,
                claimed = %incoming.source_node_id,
                "Packet source does not match the authenticated node"
            );
            return Err(Error::Auth(
                "packet source does not match the token".to_string(),
            ));
        }

        {
            let db = ctx.db().lock().await;
            LibSqlNodeRepository::new(db.connection())
                .record_schema_version(&node.id, incoming.schema_version)
                .await?;
        }

        let outcome = match receive_packet(ctx, &incoming).await {
            Ok(outcome) => outcome,
            Err(error @ Error::SchemaIncompatible { .. }) => {
                tracing::warn!(
                    node_id = %node.id,
                    code = %node.code,
                    remote = incoming.schema_version,
                    "Refusing exchange from outdated node: {error}"
                );
                return Err(error);
            }
            Err(error) => return Err(error),
        };

        let message = match &outcome {
            ReceiveOutcome::Applied(summary) => format!(
                "applied packet {} ({} changes, {} conflicts)",
                summary.packet_no, summary.applied, summary.conflicts
            ),
            ReceiveOutcome::Duplicate { packet_no } => {
                format!("packet {packet_no} already applied")
            }
            ReceiveOutcome::Rejected { reason, .. } => {
                return Ok(ExchangeResponse {
                    success: false,
                    packet_data: None,
                    processed_count: 0,
                    error_count: outcome.error_count(),
                    message: reason.clone(),
                });
            }
        };
        let reply = prepare_outbound(ctx, &node.id).await?;

        Ok(ExchangeResponse {
            success: true,
            packet_data: Some(packet::encode_base64(&reply.bytes)),
            processed_count: outcome.processed_count(),
            error_count: outcome.error_count(),
            message,
        })
    }

    pub async fn status(&self, node_id: &NodeId) -> Result<StatusResponse> {
        let db = self.context().db().lock().await;
        let node = LibSqlNodeRepository::new(db.connection())
            .get(node_id)
            .await?
            .ok_or_else(|| Error::NotFound(format!("node {node_id}")))?;
        let pending_changes = LibSqlChangeRepository::new(db.connection())
            .pending_count(node_id)
            .await?;

        Ok(StatusResponse {
            node_code: node.code,
            last_sync_in: node.last_sync_in,
            last_sync_out: node.last_sync_out,
            pending_changes,
            sent_packet_no: node.sent_packet_no,
            received_packet_no: node.received_packet_no,
        })
    }
}

/// `SyncTransport` that calls a hub in the same process.
///
/// Errors are mapped to what the HTTP front would answer, so a client sees
/// the same failures either way.
#[derive(Debug, Clone)]
pub struct LocalTransport {
    hub: SyncHub,
}

impl LocalTransport {
    pub const fn new(hub: SyncHub) -> Self {
        Self { hub }
    }
}

impl SyncTransport for LocalTransport {
    async fn register(
        &self,
        request: &RegisterRequest,
    ) -> std::result::Result<RegisterResponse, TransportError> {
        self.hub.register(request).await.map_err(|error| match error {
            Error::DuplicateCode(_) | Error::InvalidInput(_) => {
                TransportError::Registration(error.to_string())
            }
            other => to_transport_error(&other),
        })
    }

    async fn exchange(
        &self,
        token: &str,
        request: &ExchangeRequest,
    ) -> std::result::Result<ExchangeResponse, TransportError> {
        self.hub
            .exchange(token, request)
            .await
            .map_err(|error| to_transport_error(&error))
    }
}

fn to_transport_error(error: &Error) -> TransportError {
    match error {
        Error::Auth(message) => TransportError::Unauthorized(message.clone()),
        Error::SchemaIncompatible { .. } => TransportError::UpgradeRequired(error.to_string()),
        Error::Packet(_) | Error::InvalidInput(_) => TransportError::Rejected(error.to_string()),
        Error::NotFound(message) => TransportError::Server {
            status: 404,
            message: message.clone(),
        },
        other => TransportError::Server {
            status: 500,
            message: other.to_string(),
        },
    }
}

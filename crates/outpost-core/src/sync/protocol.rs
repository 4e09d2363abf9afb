//! JSON bodies of the sync HTTP API.

use serde::{Deserialize, Serialize};

use crate::models::NodeId;

/// Version string reported to registering clients
pub const SERVER_VERSION: &str = env!("CARGO_PKG_VERSION");

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegisterRequest {
    pub code: String,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegisterResponse {
    pub node_id: NodeId,
    pub auth_token: String,
    pub server_version: String,
    /// Address for packets sent to the server
    pub server_node_id: NodeId,
    pub server_code: String,
    pub schema_version: u32,
}

impl std::fmt::Debug for RegisterResponse {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RegisterResponse")
            .field("node_id", &self.node_id)
            .field("auth_token", &"[REDACTED]")
            .field("server_version", &self.server_version)
            .field("server_node_id", &self.server_node_id)
            .field("server_code", &self.server_code)
            .field("schema_version", &self.schema_version)
            .finish()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExchangeRequest {
    /// Base64 of the compressed packet
    pub packet_data: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExchangeResponse {
    pub success: bool,
    /// Base64 of the compressed reply packet; absent when the exchange failed
    pub packet_data: Option<String>,
    pub processed_count: usize,
    pub error_count: usize,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusResponse {
    pub node_code: String,
    pub last_sync_in: Option<i64>,
    pub last_sync_out: Option<i64>,
    pub pending_changes: i64,
    pub sent_packet_no: i64,
    pub received_packet_no: i64,
}

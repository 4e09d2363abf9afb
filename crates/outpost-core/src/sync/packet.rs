//! Packet wire format: JSON body, zstd frame, base64 over HTTP.

use std::collections::HashSet;
use std::io::{Read, Write};

use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::models::{ChangeOperation, EntitySnapshot, NodeId, SchemaRegistry};

/// zstd level used for every packet
pub const COMPRESSION_LEVEL: i32 = 3;

/// Errors from encoding, decoding and validating packets.
#[derive(Debug, Error)]
pub enum PacketError {
    #[error("compression failed: {0}")]
    Compression(String),

    #[error("decompression failed: {0}")]
    Decompression(String),

    /// Decompressed size exceeds the configured limit
    #[error("decompressed packet exceeds {limit} bytes")]
    TooLarge { limit: usize },

    #[error("malformed packet: {0}")]
    Malformed(String),

    #[error("invalid packet encoding: {0}")]
    Encoding(String),

    #[error("invalid packet: {0}")]
    Invalid(String),
}

/// One change carried by a packet
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PacketEntry {
    pub entity_type: String,
    pub entity_uuid: Uuid,
    pub operation: ChangeOperation,
    /// Version of the entity the sender last exchanged with the receiver
    pub base_updated_at: Option<i64>,
    pub data: EntitySnapshot,
}

/// Batched, acknowledged unit of changes between two nodes
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Packet {
    pub source_node_id: NodeId,
    pub target_node_id: NodeId,
    pub packet_no: i64,
    /// Highest packet from the target that the source has applied
    pub ack_packet_no: i64,
    pub schema_version: u32,
    pub created_at: i64,
    pub entries: Vec<PacketEntry>,
}

impl Packet {
    /// Whether this packet only carries an acknowledgement
    pub fn is_heartbeat(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Serialize and compress a packet.
pub fn compress(packet: &Packet) -> std::result::Result<Vec<u8>, PacketError> {
    let json =
        serde_json::to_vec(packet).map_err(|e| PacketError::Compression(e.to_string()))?;

    let mut encoder = zstd::stream::Encoder::new(Vec::new(), COMPRESSION_LEVEL)
        .map_err(|e| PacketError::Compression(e.to_string()))?;
    encoder
        .include_checksum(true)
        .map_err(|e| PacketError::Compression(e.to_string()))?;
    encoder
        .write_all(&json)
        .map_err(|e| PacketError::Compression(e.to_string()))?;
    encoder
        .finish()
        .map_err(|e| PacketError::Compression(e.to_string()))
}

/// Decompress and parse a packet, refusing bodies larger than `max_bytes`.
pub fn decompress(bytes: &[u8], max_bytes: usize) -> std::result::Result<Packet, PacketError> {
    let decoder = zstd::stream::Decoder::new(bytes)
        .map_err(|e| PacketError::Decompression(e.to_string()))?;

    let mut json = Vec::new();
    let limit = u64::try_from(max_bytes).unwrap_or(u64::MAX).saturating_add(1);
    decoder
        .take(limit)
        .read_to_end(&mut json)
        .map_err(|e| PacketError::Decompression(e.to_string()))?;
    if json.len() > max_bytes {
        return Err(PacketError::TooLarge { limit: max_bytes });
    }

    serde_json::from_slice(&json).map_err(|e| PacketError::Malformed(e.to_string()))
}

/// Text form of packet bytes for JSON request bodies
pub fn encode_base64(bytes: &[u8]) -> String {
    STANDARD.encode(bytes)
}

pub fn decode_base64(text: &str) -> std::result::Result<Vec<u8>, PacketError> {
    STANDARD
        .decode(text.trim())
        .map_err(|e| PacketError::Encoding(e.to_string()))
}

/// Check structure and schema compatibility before anything is applied.
///
/// A schema mismatch yields [`Error::SchemaIncompatible`]; any other defect
/// yields [`PacketError::Invalid`].
pub fn validate(packet: &Packet, local: &NodeId, schema: &SchemaRegistry) -> Result<()> {
    if packet.target_node_id != *local {
        return Err(PacketError::Invalid(format!(
            "packet addressed to {} arrived at {local}",
            packet.target_node_id
        ))
        .into());
    }
    if packet.source_node_id == *local {
        return Err(PacketError::Invalid("packet claims to come from this node".into()).into());
    }
    if packet.packet_no < 0 || packet.ack_packet_no < 0 {
        return Err(PacketError::Invalid("negative packet number".into()).into());
    }

    schema.check_compatible(packet.schema_version)?;

    let mut seen = HashSet::new();
    for entry in &packet.entries {
        if !seen.insert((entry.entity_type.as_str(), entry.entity_uuid)) {
            return Err(PacketError::Invalid(format!(
                "{} {} appears twice",
                entry.entity_type, entry.entity_uuid
            ))
            .into());
        }
        schema
            .validate_incoming(&entry.entity_type, &entry.data.fields)
            .map_err(|error| match error {
                Error::InvalidInput(reason) => Error::Packet(PacketError::Invalid(reason)),
                other => other,
            })?;
    }

    Ok(())
}

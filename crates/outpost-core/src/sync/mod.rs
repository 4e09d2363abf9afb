//! Synchronization core: change tracking, packet exchange, conflict resolution
//! and the client-side driver.

mod context;
mod exchange;
mod hub;
mod offline;
mod orchestrator;
pub mod packet;
mod protocol;
mod queue;
mod registry;
mod resolver;
mod scheduler;
pub mod tracker;
mod transport;


pub use context::SyncContext;
pub use exchange::{
    acknowledge, prepare_outbound, receive_packet, restamp_retained, ApplySummary, OutboundPacket,
    ReceiveOutcome,
};
pub use hub::{LocalTransport, SyncHub};
pub use offline::{export_pending, import_packet_file, ExportSummary};
pub use orchestrator::{CycleOutcome, CycleReport, SyncOrchestrator};
pub use packet::{Packet, PacketEntry, PacketError};
pub use protocol::{
    ExchangeRequest, ExchangeResponse, RegisterRequest, RegisterResponse, StatusResponse,
    SERVER_VERSION,
};
pub use queue::{inspect_queue, remove_pending_change, QueueSnapshot};
pub use registry::{
    validate_code, NodeRegistry, Registration, TokenClaims, TokenIssuer, DEFAULT_TOKEN_TTL,
    MIN_SECRET_LEN,
};
pub use resolver::{
    decide, list_conflicts, manually_resolve_conflict, ConflictDecision, ConflictResolver,
    Resolution,
};
pub use scheduler::SyncScheduler;
pub use tracker::{ApplyOutcome, ConflictDetails};
pub use transport::{HttpTransport, RetryPolicy, SyncTransport, TransportError};

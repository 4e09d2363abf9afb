//! Database layer for Outpost

mod change_repository;
mod connection;
mod entity_repository;
mod migrations;
mod node_repository;
mod packet_repository;
pub mod settings_repository;
mod values;
mod version_repository;

pub use change_repository::{ChangeRepository, LibSqlChangeRepository};
pub use connection::Database;
pub use entity_repository::{EntityRepository, LibSqlEntityRepository};
pub use node_repository::{LibSqlNodeRepository, NodeRepository};
pub use packet_repository::{LibSqlPacketRepository, PacketRepository, RetainedPacket};
pub use settings_repository::{LibSqlSettingsRepository, SettingsRepository};
pub use version_repository::{LibSqlVersionRepository, VersionRepository};

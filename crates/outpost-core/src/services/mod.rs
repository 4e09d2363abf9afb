//! Application services shared by the server and the CLI.

mod database;
mod records;

pub use database::DatabaseService;
pub use records::RecordService;

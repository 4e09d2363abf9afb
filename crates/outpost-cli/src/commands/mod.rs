pub mod common;
pub mod conflicts;
pub mod queue;
pub mod record;
pub mod sync;

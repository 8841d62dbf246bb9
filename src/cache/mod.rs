//! Durable local state for offline operation.
//!
//! Two independent records share one key-value store:
//! - the vehicle snapshot ([`LocalCache`]), the last known entity set
//! - the pending mutation log ([`PendingLog`]), writes awaiting replay

mod local;
mod pending;
mod storage;

pub use local::LocalCache;
pub use pending::{PendingLog, PendingMutation};
pub use storage::{KeyValueStore, SqliteStorage};

//! Queue-server clients.

pub mod memory;
pub mod protocol;

pub use memory::{InMemoryCluster, QueryRecord, DEFAULT_NOTIFY_PORT};
pub use protocol::{AffinityPreference, AffinityUpdate, GetCommand};

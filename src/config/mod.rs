//! Configuration for job acquisition.

pub mod acquire;

pub use acquire::{AcquireConfig, DEFAULT_POLL_TIMEOUT_MS};

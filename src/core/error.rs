//! Error types for job acquisition.

use thiserror::Error;

use crate::core::job::ServerAddress;

/// Errors produced by the acquisition scheduler and its collaborators.
#[derive(Debug, Error)]
pub enum SchedulerError {
    /// A single server could not be reached. Recoverable: the server is
    /// dropped from the timeline and resurfaces through discovery.
    #[error("connection to {server} failed: {reason}")]
    Connectivity {
        /// Server that failed.
        server: ServerAddress,
        /// Transport-level reason.
        reason: String,
    },
    /// The server answered with something that could not be understood.
    #[error("protocol error: {0}")]
    Protocol(String),
    /// The server dropped this worker's preferred affinities and wants them
    /// sent again before serving affinity-based requests.
    #[error("preferred affinities expired on {server}")]
    PreferredAffinitiesExpired {
        /// Server that forgot them.
        server: ServerAddress,
    },
    /// The server registry could not produce a snapshot.
    #[error("registry error: {0}")]
    Registry(String),
    /// Configuration rejected during validation.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
    /// Backend-specific failure with context.
    #[error("backend error: {0}")]
    Backend(String),
}

impl SchedulerError {
    /// Whether this error only concerns the reachability of one server.
    #[must_use]
    pub const fn is_connectivity(&self) -> bool {
        matches!(self, Self::Connectivity { .. })
    }
}

/// Application-facing result using anyhow for higher-level contexts.
pub type AppResult<T> = Result<T, anyhow::Error>;

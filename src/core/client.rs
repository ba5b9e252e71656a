//! Collaborator abstractions: queue-server client and server registry.

use std::time::Instant;

use crate::core::affinity::AffinityFilter;
use crate::core::job::{Job, JobStatus, ServerAddress};
use crate::core::timeline::TimelineEntry;
use crate::core::SchedulerError;

/// Global state of the worker's connection to the queue cluster.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConnectionState {
    /// Keep going.
    #[default]
    Running,
    /// Abort the search and release anything held.
    Stopped,
    /// Forget everything known about servers and rediscover.
    Restarted,
}

/// Abstraction over the transport used to talk to queue servers.
pub trait QueueClient {
    /// Ask `server` for one job matching `filter`, or any job when
    /// `any_affinity` is set and the client's policy permits it. With a
    /// `deadline` the server is asked to notify this worker until then.
    ///
    /// # Errors
    ///
    /// `SchedulerError::Connectivity` when the server is unreachable; any
    /// other variant for protocol or server-side failures.
    fn check_entry(
        &mut self,
        server: &ServerAddress,
        filter: &AffinityFilter,
        any_affinity: bool,
        deadline: Option<Instant>,
    ) -> Result<Option<(Job, JobStatus)>, SchedulerError>;

    /// Give a leased job back to the server that issued it.
    ///
    /// # Errors
    ///
    /// Returns an error when the server refuses or cannot be reached.
    fn return_job(&mut self, job: &Job) -> Result<(), SchedulerError>;

    /// Pop one pending "jobs available" notification without blocking.
    fn read_notifications(&mut self) -> Option<ServerAddress>;

    /// Block until a notification arrives or `deadline` passes.
    fn wait_for_notifications(&mut self, deadline: Instant) -> Option<ServerAddress>;

    /// Whether a deferred entry could still yield a job.
    fn more_jobs(&self, entry: &TimelineEntry) -> bool;

    /// Current connection state, checked once per scan iteration.
    fn check_state(&mut self) -> ConnectionState;
}

/// Source of the currently live server set.
pub trait ServerRegistry {
    /// Snapshot of live servers, optionally including penalized ones.
    ///
    /// # Errors
    ///
    /// Returns `SchedulerError::Registry` when no snapshot is available.
    fn iterate(&self, include_penalized: bool) -> Result<Vec<ServerAddress>, SchedulerError>;
}

/// Classified result of a single server query.
#[derive(Debug)]
pub enum QueryOutcome {
    /// The server leased a job to us.
    JobFound(Job, JobStatus),
    /// Nothing matching the request.
    Empty,
    /// The server is unreachable; drop it for now.
    ConnectivityDropped(SchedulerError),
    /// Anything else; surfaces unless a job is already secured.
    Propagate(SchedulerError),
}

impl QueryOutcome {
    /// Classify the raw result of `QueueClient::check_entry`.
    #[must_use]
    pub fn classify(result: Result<Option<(Job, JobStatus)>, SchedulerError>) -> Self {
        match result {
            Ok(Some((job, status))) => Self::JobFound(job, status),
            Ok(None) => Self::Empty,
            Err(e) if e.is_connectivity() => Self::ConnectivityDropped(e),
            Err(e) => Self::Propagate(e),
        }
    }
}

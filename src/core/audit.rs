//! Lease audit trail.
//!
//! Records what happened to every job lease the scheduler touched, so callers
//! can verify that nothing was kept without being handed back.

use std::collections::VecDeque;

use parking_lot::Mutex;

use crate::core::job::{Job, ServerAddress};
use crate::util::clock::now_ms;

/// What happened to a lease.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LeaseAction {
    /// A server handed us a job.
    Acquired,
    /// The job became the held candidate at the given rank.
    Held,
    /// The job was returned to its server.
    Released,
    /// The job did not fit the ladder and was returned.
    Rejected,
    /// The server was dropped from the timeline after a failure.
    ServerDropped,
}

/// Audit event structure.
#[derive(Debug, Clone)]
pub struct LeaseEvent {
    /// Action taken.
    pub action: LeaseAction,
    /// Job key, absent for server-level events.
    pub job_id: Option<String>,
    /// Server involved.
    pub server: ServerAddress,
    /// Ladder rank of the job, when known.
    pub rank: Option<usize>,
    /// Timestamp milliseconds.
    pub created_at_ms: u128,
}

/// Audit sink abstraction.
pub trait AuditSink: Send + Sync {
    /// Record an audit event.
    fn record(&self, event: LeaseEvent);
}

/// In-memory audit sink for testing and dev.
pub struct InMemoryAuditSink {
    events: Mutex<VecDeque<LeaseEvent>>,
    max_events: usize,
}

impl InMemoryAuditSink {
    /// Create a new in-memory sink with a bounded buffer.
    #[must_use]
    pub fn new(max_events: usize) -> Self {
        Self {
            events: Mutex::new(VecDeque::with_capacity(max_events)),
            max_events,
        }
    }

    /// Retrieve a snapshot of stored events.
    pub fn events(&self) -> Vec<LeaseEvent> {
        self.events.lock().iter().cloned().collect()
    }

    /// Events with the given action.
    pub fn events_with(&self, action: LeaseAction) -> Vec<LeaseEvent> {
        self.events
            .lock()
            .iter()
            .filter(|e| e.action == action)
            .cloned()
            .collect()
    }
}

impl AuditSink for InMemoryAuditSink {
    fn record(&self, event: LeaseEvent) {
        let mut events = self.events.lock();
        if events.len() >= self.max_events {
            events.pop_front();
        }
        events.push_back(event);
    }
}

/// Helper to build a job-level event.
pub fn build_lease_event(action: LeaseAction, job: &Job, rank: Option<usize>) -> LeaseEvent {
    LeaseEvent {
        action,
        job_id: Some(job.id.clone()),
        server: job.server.clone(),
        rank,
        created_at_ms: now_ms(),
    }
}

/// Helper to build a server-level event.
pub fn build_server_event(action: LeaseAction, server: &ServerAddress) -> LeaseEvent {
    LeaseEvent {
        action,
        job_id: None,
        server: server.clone(),
        rank: None,
        created_at_ms: now_ms(),
    }
}

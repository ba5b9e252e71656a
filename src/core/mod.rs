//! Core acquisition abstractions: jobs, affinities, the polling timeline,
//! candidate strategies and the scheduler loop.

pub mod affinity;
pub mod audit;
pub mod client;
pub mod error;
pub mod job;
pub mod scheduler;
pub mod strategy;
pub mod timeline;

pub use affinity::{AffinityFilter, AffinityLadder, MAX_AFFINITY_LEN};
pub use audit::{build_lease_event, build_server_event, AuditSink, InMemoryAuditSink, LeaseAction, LeaseEvent};
pub use client::{ConnectionState, QueryOutcome, QueueClient, ServerRegistry};
pub use error::{AppResult, SchedulerError};
pub use job::{AcquireOutcome, Job, JobStatus, ServerAddress};
pub use scheduler::JobAcquirer;
pub use strategy::{AnyAffinityJob, JobCandidate, JobCandidateStrategy, MostAffinityJob};
pub use timeline::{EntryTarget, Timeline, TimelineEntry};

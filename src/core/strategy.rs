//! Job candidate strategies.
//!
//! A strategy decides which affinities to ask each server for, whether a
//! fetched job ends the search, and where the scan resumes. Two variants
//! exist and one is chosen per call:
//!
//! - **Any-Affinity**: the first job from any server wins.
//! - **Most-Affinity**: keep the best job seen so far and keep asking the
//!   remaining servers for something strictly better, handing displaced jobs
//!   back to their servers.

use std::sync::Arc;

use tracing::{debug, error, info, warn};

use crate::core::affinity::{AffinityFilter, AffinityLadder};
use crate::core::audit::{build_lease_event, AuditSink, LeaseAction};
use crate::core::client::QueueClient;
use crate::core::job::{Job, JobStatus};
use crate::core::timeline::{EntryTarget, Timeline};

/// The best job found so far.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobCandidate {
    /// Leased job.
    pub job: Job,
    /// Status reported with it.
    pub status: JobStatus,
    /// Ladder rank; the ladder length for an unranked fallback.
    pub rank: usize,
}

/// Accept the first job from anywhere.
#[derive(Debug, Default)]
pub struct AnyAffinityJob {
    found: Option<JobCandidate>,
}

impl AnyAffinityJob {
    /// Create the strategy.
    #[must_use]
    pub const fn new() -> Self {
        Self { found: None }
    }
}

/// Hold the best-ranked job and look for a better one.
pub struct MostAffinityJob {
    ladder: AffinityLadder,
    accept_any: bool,
    held: Option<JobCandidate>,
    /// Last entry kept in the immediate list ahead of the scan position.
    cursor: Option<EntryTarget>,
    audit: Option<Arc<dyn AuditSink>>,
}

impl MostAffinityJob {
    /// Create the strategy for `ladder`; `accept_any` allows an unranked job
    /// as the lowest-priority fallback.
    #[must_use]
    pub fn new(ladder: AffinityLadder, accept_any: bool) -> Self {
        Self {
            ladder,
            accept_any,
            held: None,
            cursor: None,
            audit: None,
        }
    }

    /// Rank of the held candidate.
    #[must_use]
    pub fn held_rank(&self) -> Option<usize> {
        self.held.as_ref().map(|c| c.rank)
    }

    fn begin(&mut self) -> usize {
        self.cursor = None;
        0
    }

    fn cursor_index(&self, timeline: &Timeline) -> Option<usize> {
        self.cursor
            .as_ref()
            .and_then(|target| timeline.position_in_immediate(target))
    }

    fn next(&mut self, advanced: bool, timeline: &Timeline) -> usize {
        if advanced {
            let index = self.cursor_index(timeline).map_or(0, |i| i + 1);
            self.cursor = timeline.immediate_at(index).map(|e| e.target.clone());
            return index + 1;
        }
        match self.cursor_index(timeline) {
            Some(index) => index + 1,
            None => self.begin(),
        }
    }

    fn affinity(&self) -> AffinityFilter {
        match self.held_rank() {
            None => self.ladder.full_filter(),
            Some(rank) => self.ladder.filter_above(rank),
        }
    }

    fn done<C: QueueClient>(&mut self, job: Job, status: JobStatus, client: &mut C) -> bool {
        let limit = self.held_rank().unwrap_or_else(|| self.ladder.len());
        let rank = match self.ladder.rank_below(&job.affinity, limit) {
            Some(rank) => rank,
            None if self.held.is_none() && self.accept_any => self.ladder.len(),
            None => {
                warn!(
                    job_id = %job.id,
                    server = %job.server,
                    affinity = %job.affinity,
                    held_rank = ?self.held_rank(),
                    "job does not improve on the held candidate, handing it back"
                );
                self.hand_back(&job, LeaseAction::Rejected, client);
                return false;
            }
        };

        if let Some(previous) = self.held.take() {
            info!(
                job_id = %previous.job.id,
                server = %previous.job.server,
                from_rank = previous.rank,
                to_rank = rank,
                "displacing held job"
            );
            self.hand_back(&previous.job, LeaseAction::Released, client);
        }

        debug!(job_id = %job.id, server = %job.server, rank, "holding job");
        self.record(LeaseAction::Held, &job, Some(rank));
        self.held = Some(JobCandidate { job, status, rank });
        rank == 0
    }

    fn interrupt<C: QueueClient>(&mut self, client: &mut C) {
        if let Some(candidate) = self.held.take() {
            info!(job_id = %candidate.job.id, "search interrupted, returning held job");
            self.hand_back(&candidate.job, LeaseAction::Released, client);
        }
        self.cursor = None;
    }

    fn hand_back<C: QueueClient>(&self, job: &Job, action: LeaseAction, client: &mut C) {
        if let Err(e) = client.return_job(job) {
            error!(job_id = %job.id, server = %job.server, "failed to return job: {}", e);
        }
        let rank = self.ladder.rank_below(&job.affinity, self.ladder.len());
        self.record(action, job, rank);
    }

    fn record(&self, action: LeaseAction, job: &Job, rank: Option<usize>) {
        if let Some(audit) = &self.audit {
            audit.record(build_lease_event(action, job, rank));
        }
    }
}

/// Strategy chosen once per acquisition call.
pub enum JobCandidateStrategy {
    /// First job wins.
    AnyAffinity(AnyAffinityJob),
    /// Best-ranked job wins.
    MostAffinity(MostAffinityJob),
}

impl JobCandidateStrategy {
    /// Any-Affinity for an empty ladder, Most-Affinity otherwise.
    #[must_use]
    pub fn select(ladder: AffinityLadder, accept_any: bool) -> Self {
        if ladder.is_empty() {
            Self::AnyAffinity(AnyAffinityJob::new())
        } else {
            Self::MostAffinity(MostAffinityJob::new(ladder, accept_any))
        }
    }

    /// Attach an audit sink.
    #[must_use]
    pub fn with_audit(mut self, audit: Option<Arc<dyn AuditSink>>) -> Self {
        if let Self::MostAffinity(most) = &mut self {
            most.audit = audit;
        }
        self
    }

    /// Immediate-list index where a fresh pass starts.
    pub fn begin(&mut self) -> usize {
        match self {
            Self::AnyAffinity(_) => 0,
            Self::MostAffinity(most) => most.begin(),
        }
    }

    /// Index to examine next. `advanced` means the entry just examined sat
    /// at the front and produced a job.
    pub fn next(&mut self, advanced: bool, timeline: &Timeline) -> usize {
        match self {
            Self::AnyAffinity(_) => 0,
            Self::MostAffinity(most) => most.next(advanced, timeline),
        }
    }

    /// Affinities to request from the next server.
    #[must_use]
    pub fn affinity(&self) -> AffinityFilter {
        match self {
            Self::AnyAffinity(_) => AffinityFilter::empty(),
            Self::MostAffinity(most) => most.affinity(),
        }
    }

    /// Offer a freshly leased job. Returns true when the search is over.
    pub fn done<C: QueueClient>(&mut self, job: Job, status: JobStatus, client: &mut C) -> bool {
        match self {
            Self::AnyAffinity(any) => {
                any.found = Some(JobCandidate { job, status, rank: 0 });
                true
            }
            Self::MostAffinity(most) => most.done(job, status, client),
        }
    }

    /// Whether a job outside the requested affinities may be taken when
    /// nothing is held. Servers are only asked for any affinity when true.
    #[must_use]
    pub const fn accepts_any(&self) -> bool {
        match self {
            Self::AnyAffinity(_) => true,
            Self::MostAffinity(most) => most.accept_any,
        }
    }

    /// Whether a candidate is being held while the search continues.
    #[must_use]
    pub const fn has_job(&self) -> bool {
        match self {
            Self::AnyAffinity(_) => false,
            Self::MostAffinity(most) => most.held.is_some(),
        }
    }

    /// Abort the search, returning any held candidate to its server.
    pub fn interrupt<C: QueueClient>(&mut self, client: &mut C) {
        if let Self::MostAffinity(most) = self {
            most.interrupt(client);
        }
    }

    /// Take the final job out of the strategy.
    pub fn take_job(&mut self) -> Option<JobCandidate> {
        match self {
            Self::AnyAffinity(any) => any.found.take(),
            Self::MostAffinity(most) => most.held.take(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Instant;

    use crate::core::client::ConnectionState;
    use crate::core::job::ServerAddress;
    use crate::core::timeline::TimelineEntry;
    use crate::core::SchedulerError;

    #[derive(Default)]
    struct ReturnRecorder {
        returned: Vec<String>,
    }

    impl QueueClient for ReturnRecorder {
        fn check_entry(
            &mut self,
            _server: &ServerAddress,
            _filter: &AffinityFilter,
            _any_affinity: bool,
            _deadline: Option<Instant>,
        ) -> Result<Option<(Job, JobStatus)>, SchedulerError> {
            Ok(None)
        }

        fn return_job(&mut self, job: &Job) -> Result<(), SchedulerError> {
            self.returned.push(job.id.clone());
            Ok(())
        }

        fn read_notifications(&mut self) -> Option<ServerAddress> {
            None
        }

        fn wait_for_notifications(&mut self, _deadline: Instant) -> Option<ServerAddress> {
            None
        }

        fn more_jobs(&self, _entry: &TimelineEntry) -> bool {
            false
        }

        fn check_state(&mut self) -> ConnectionState {
            ConnectionState::Running
        }
    }

    fn job(id: &str, affinity: &str) -> Job {
        Job::new(id, affinity, ServerAddress::new("ns", 1))
    }

    fn most(accept_any: bool) -> JobCandidateStrategy {
        JobCandidateStrategy::select(AffinityLadder::new(["x", "y", "z"]).unwrap(), accept_any)
    }

    #[test]
    fn test_select_by_ladder() {
        assert!(matches!(
            JobCandidateStrategy::select(AffinityLadder::default(), true),
            JobCandidateStrategy::AnyAffinity(_)
        ));
        assert!(matches!(most(false), JobCandidateStrategy::MostAffinity(_)));
    }

    #[test]
    fn test_accepts_any_follows_policy() {
        assert!(JobCandidateStrategy::select(AffinityLadder::default(), false).accepts_any());
        assert!(most(true).accepts_any());
        assert!(!most(false).accepts_any());
    }

    #[test]
    fn test_any_affinity_first_job_wins() {
        let mut client = ReturnRecorder::default();
        let mut strategy = JobCandidateStrategy::select(AffinityLadder::default(), false);
        assert!(strategy.affinity().is_empty());
        assert!(strategy.done(job("a", "w"), JobStatus::Running, &mut client));
        assert!(!strategy.has_job());
        assert_eq!(strategy.take_job().map(|c| c.job.id), Some("a".to_string()));
    }

    #[test]
    fn test_most_affinity_narrows_filter_and_displaces() {
        let mut client = ReturnRecorder::default();
        let mut strategy = most(false);
        assert_eq!(strategy.affinity().to_list(), "x,y,z");

        assert!(!strategy.done(job("j-z", "z"), JobStatus::Running, &mut client));
        assert_eq!(strategy.affinity().to_list(), "x,y");

        assert!(!strategy.done(job("j-y", "y"), JobStatus::Running, &mut client));
        assert_eq!(client.returned, vec!["j-z".to_string()]);
        assert_eq!(strategy.affinity().to_list(), "x");

        assert!(strategy.done(job("j-x", "x"), JobStatus::Running, &mut client));
        assert_eq!(client.returned, vec!["j-z".to_string(), "j-y".to_string()]);
        assert_eq!(strategy.take_job().map(|c| (c.job.id, c.rank)), Some(("j-x".to_string(), 0)));
    }

    #[test]
    fn test_equal_rank_keeps_first() {
        let mut client = ReturnRecorder::default();
        let mut strategy = most(false);
        strategy.done(job("first", "y"), JobStatus::Running, &mut client);
        assert!(!strategy.done(job("second", "y"), JobStatus::Running, &mut client));
        assert_eq!(client.returned, vec!["second".to_string()]);
        assert_eq!(strategy.take_job().map(|c| c.job.id), Some("first".to_string()));
    }

    #[test]
    fn test_unranked_job_policy() {
        let mut client = ReturnRecorder::default();
        let mut strict = most(false);
        assert!(!strict.done(job("w", "w"), JobStatus::Running, &mut client));
        assert!(!strict.has_job());
        assert_eq!(client.returned, vec!["w".to_string()]);

        let mut client = ReturnRecorder::default();
        let mut lenient = most(true);
        assert!(!lenient.done(job("w", "w"), JobStatus::Running, &mut client));
        assert!(lenient.has_job());
        assert_eq!(lenient.affinity().to_list(), "x,y,z");
        assert!(client.returned.is_empty());
    }

    #[test]
    fn test_interrupt_returns_held_job_once() {
        let mut client = ReturnRecorder::default();
        let mut strategy = most(false);
        strategy.done(job("held", "y"), JobStatus::Running, &mut client);
        strategy.interrupt(&mut client);
        strategy.interrupt(&mut client);
        assert_eq!(client.returned, vec!["held".to_string()]);
        assert!(!strategy.has_job());
    }

    #[test]
    fn test_cursor_follows_entry_identity() {
        let mut timeline = Timeline::new();
        timeline.clear();
        let servers: Vec<_> = (1..=3).map(|p| ServerAddress::new("ns", p)).collect();
        timeline.add_discovered(servers.clone());

        let mut strategy = most(false);
        assert_eq!(strategy.begin(), 0);
        // front entry produced a job and stays at the front
        assert_eq!(strategy.next(true, &timeline), 1);
        // entry 1 produced a job and was moved to the front
        timeline.move_to_front(1);
        assert_eq!(strategy.next(false, &timeline), 2);
        // entry 2 came back empty and left the list
        timeline.move_to_scheduled(2, Instant::now(), true);
        assert_eq!(strategy.next(false, &timeline), 2);
    }
}

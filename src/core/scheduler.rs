//! Affinity-aware job acquisition across a cluster of queue servers.
//!
//! `JobAcquirer` owns the polling timeline for one worker. Each call to
//! [`JobAcquirer::get_job`] scans the servers that are due, consults the
//! chosen [`JobCandidateStrategy`], and waits for notifications or for
//! deferred servers to come due until the caller's deadline.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::{debug, info, warn};

use crate::config::AcquireConfig;
use crate::core::affinity::AffinityLadder;
use crate::core::audit::{build_lease_event, build_server_event, AuditSink, LeaseAction, LeaseEvent};
use crate::core::client::{ConnectionState, QueryOutcome, QueueClient, ServerRegistry};
use crate::core::job::AcquireOutcome;
use crate::core::strategy::JobCandidateStrategy;
use crate::core::timeline::{EntryTarget, Timeline};
use crate::core::SchedulerError;
use crate::util::clock::earlier;

/// Per-worker job acquisition scheduler.
pub struct JobAcquirer<C, R> {
    ladder: AffinityLadder,
    accept_any_affinity: bool,
    poll_timeout: Duration,
    client: C,
    registry: R,
    timeline: Timeline,
    audit: Option<Arc<dyn AuditSink>>,
}

impl<C, R> JobAcquirer<C, R>
where
    C: QueueClient,
    R: ServerRegistry,
{
    /// Create an acquirer from validated configuration and collaborators.
    ///
    /// # Errors
    ///
    /// Returns `SchedulerError::InvalidConfig` if the configuration is invalid.
    pub fn new(config: &AcquireConfig, client: C, registry: R) -> Result<Self, SchedulerError> {
        config.validate().map_err(SchedulerError::InvalidConfig)?;
        let ladder = AffinityLadder::new(config.affinity_ladder.iter().cloned())?;
        Ok(Self {
            ladder,
            accept_any_affinity: config.accept_any_affinity,
            poll_timeout: config.poll_timeout(),
            client,
            registry,
            timeline: Timeline::new(),
            audit: None,
        })
    }

    /// Attach an audit sink.
    #[must_use]
    pub fn with_audit(mut self, audit: Arc<dyn AuditSink>) -> Self {
        self.audit = Some(audit);
        self
    }

    /// Current polling timeline.
    pub const fn timeline(&self) -> &Timeline {
        &self.timeline
    }

    /// Queue-server client.
    pub const fn client(&self) -> &C {
        &self.client
    }

    /// Server registry.
    pub const fn registry(&self) -> &R {
        &self.registry
    }

    /// Strategy matching the configured ladder and policy.
    #[must_use]
    pub fn strategy(&self) -> JobCandidateStrategy {
        JobCandidateStrategy::select(self.ladder.clone(), self.accept_any_affinity)
            .with_audit(self.audit.clone())
    }

    /// Acquire one job before `deadline` using the configured strategy.
    ///
    /// # Errors
    ///
    /// Propagates non-connectivity failures encountered before any job was
    /// secured.
    pub fn get_job(&mut self, deadline: Instant) -> Result<AcquireOutcome, SchedulerError> {
        let mut strategy = self.strategy();
        self.get_job_with(deadline, &mut strategy)
    }

    /// Acquire one job before `deadline` using `strategy`.
    ///
    /// # Errors
    ///
    /// Propagates non-connectivity failures encountered before any job was
    /// secured.
    pub fn get_job_with(
        &mut self,
        deadline: Instant,
        strategy: &mut JobCandidateStrategy,
    ) -> Result<AcquireOutcome, SchedulerError> {
        loop {
            match self.scan(strategy, Some(deadline))? {
                AcquireOutcome::Again => {}
                outcome => return Ok(outcome),
            }

            let client = &self.client;
            if !self.timeline.scheduled().any(|entry| client.more_jobs(entry)) {
                debug!("no scheduled server can yield a job");
                return Ok(AcquireOutcome::NoJobs);
            }

            if Instant::now() >= deadline {
                return Ok(AcquireOutcome::Again);
            }

            let internal = self.timeline.earliest_scheduled().map(|e| e.deadline);
            let wait_until = internal.map_or(deadline, |bound| earlier(bound, deadline));

            if let Some(server) = self.client.wait_for_notifications(wait_until) {
                debug!(server = %server, "woken by notification");
                self.timeline.move_to_immediate(&EntryTarget::Server(server));
                self.drain_notifications();
                continue;
            }

            match internal {
                Some(bound) if bound < deadline => {
                    if let Some(target) = self.timeline.promote_earliest_scheduled() {
                        debug!(target = ?target, "scheduled entry came due");
                    }
                }
                _ => return Ok(AcquireOutcome::Again),
            }
        }
    }

    /// Single pass over the servers that are due now.
    ///
    /// Returns `Job` once the strategy is satisfied or the pass ends with a
    /// held candidate, `Again` when the pass ends empty-handed, and
    /// `Interrupted` when the connection is stopped.
    ///
    /// # Errors
    ///
    /// Propagates non-connectivity failures when no job is held.
    pub fn get_job_immediately(
        &mut self,
        strategy: &mut JobCandidateStrategy,
    ) -> Result<AcquireOutcome, SchedulerError> {
        self.scan(strategy, None)
    }

    /// Servers are told to notify us until `deadline`, when there is one.
    fn scan(
        &mut self,
        strategy: &mut JobCandidateStrategy,
        deadline: Option<Instant>,
    ) -> Result<AcquireOutcome, SchedulerError> {
        let mut index = strategy.begin();

        loop {
            match self.client.check_state() {
                ConnectionState::Running => {}
                ConnectionState::Stopped => {
                    info!("connection stopped, abandoning job search");
                    strategy.interrupt(&mut self.client);
                    return Ok(AcquireOutcome::Interrupted);
                }
                ConnectionState::Restarted => {
                    info!("connection restarted, rebuilding timeline");
                    // Discovery stays due, so a failed rediscovery is retried by the next scan.
                    self.timeline = Timeline::new();
                    if let Err(e) = self.next_discovery_iteration() {
                        return Self::keep_or_propagate(strategy, e);
                    }
                    index = strategy.begin();
                }
            }

            let Some(target) = self.timeline.immediate_at(index).map(|e| e.target.clone()) else {
                return Ok(Self::finish_pass(strategy));
            };

            let server = match target {
                EntryTarget::Discovery => {
                    if let Err(e) = self.next_discovery_iteration() {
                        return Self::keep_or_propagate(strategy, e);
                    }
                    index = strategy.begin();
                    continue;
                }
                EntryTarget::Server(server) => server,
            };

            let filter = strategy.affinity();
            let all_checked = !strategy.has_job();
            let any_affinity = all_checked && strategy.accepts_any();
            let mut advanced = false;

            debug!(server = %server, affinities = %filter.to_list(), any_affinity, "querying server");
            let result = self.client.check_entry(&server, &filter, any_affinity, deadline);
            match QueryOutcome::classify(result) {
                QueryOutcome::JobFound(job, status) => {
                    if index == 0 {
                        advanced = true;
                    } else {
                        self.timeline.move_to_front(index);
                    }
                    info!(job_id = %job.id, server = %server, affinity = %job.affinity, "job acquired");
                    self.record(|| build_lease_event(LeaseAction::Acquired, &job, None));
                    if strategy.done(job, status, &mut self.client) {
                        return Ok(Self::finish_pass(strategy));
                    }
                }
                QueryOutcome::Empty => {
                    self.timeline
                        .move_to_scheduled(index, Instant::now() + self.poll_timeout, all_checked);
                }
                QueryOutcome::ConnectivityDropped(e) => {
                    warn!(server = %server, "dropping unreachable server: {}", e);
                    self.timeline.remove_immediate(index);
                    self.record(|| build_server_event(LeaseAction::ServerDropped, &server));
                }
                QueryOutcome::Propagate(e) => {
                    self.timeline.remove_immediate(index);
                    self.record(|| build_server_event(LeaseAction::ServerDropped, &server));
                    return Self::keep_or_propagate(strategy, e);
                }
            }

            self.timeline.drain_expired(Instant::now());
            self.drain_notifications();
            index = strategy.next(advanced, &self.timeline);
        }
    }

    /// Refresh the server set from the registry and reschedule discovery.
    ///
    /// # Errors
    ///
    /// Returns the registry's error; the timeline is left untouched then.
    pub fn next_discovery_iteration(&mut self) -> Result<(), SchedulerError> {
        let live = self.registry.iterate(true)?;
        let live_set: HashSet<_> = live.iter().cloned().collect();

        let removed = self.timeline.reconcile(&live_set);
        let added = self.timeline.add_discovered(live);
        self.timeline.reschedule_discovery(Instant::now() + self.poll_timeout);

        if added > 0 || !removed.is_empty() {
            info!(added, removed = removed.len(), known = live_set.len(), "server set changed");
        } else {
            debug!(known = live_set.len(), "server set unchanged");
        }
        Ok(())
    }

    fn drain_notifications(&mut self) {
        while let Some(server) = self.client.read_notifications() {
            self.timeline.move_to_immediate(&EntryTarget::Server(server));
        }
    }

    fn finish_pass(strategy: &mut JobCandidateStrategy) -> AcquireOutcome {
        strategy
            .take_job()
            .map_or(AcquireOutcome::Again, |candidate| AcquireOutcome::Job {
                job: candidate.job,
                status: candidate.status,
            })
    }

    /// A secured job outweighs an unrelated failure.
    fn keep_or_propagate(
        strategy: &mut JobCandidateStrategy,
        error: SchedulerError,
    ) -> Result<AcquireOutcome, SchedulerError> {
        if strategy.has_job() {
            warn!("keeping secured job despite failure: {}", error);
            Ok(Self::finish_pass(strategy))
        } else {
            Err(error)
        }
    }

    fn record(&self, event: impl FnOnce() -> LeaseEvent) {
        if let Some(audit) = &self.audit {
            audit.record(event());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::job::ServerAddress;
    use crate::infra::{InMemoryCluster, StaticServerRegistry};

    fn server(port: u16) -> ServerAddress {
        ServerAddress::new("ns", port)
    }

    fn acquirer(
        ladder: &[&str],
        ports: &[u16],
    ) -> (InMemoryCluster, JobAcquirer<InMemoryCluster, StaticServerRegistry>) {
        let servers: Vec<_> = ports.iter().map(|p| server(*p)).collect();
        let cluster = InMemoryCluster::with_servers(servers.clone());
        let registry = StaticServerRegistry::new(servers);
        let mut cfg = AcquireConfig::with_ladder(ladder.iter().copied());
        cfg.poll_timeout_ms = 60_000;
        let acquirer = JobAcquirer::new(&cfg, cluster.clone(), registry).unwrap();
        (cluster, acquirer)
    }

    fn immediate_servers(timeline: &Timeline) -> Vec<ServerAddress> {
        timeline.immediate().filter_map(|e| e.target.server().cloned()).collect()
    }

    #[test]
    fn test_rejects_invalid_config() {
        let cfg = AcquireConfig {
            poll_timeout_ms: 0,
            ..AcquireConfig::default()
        };
        let result = JobAcquirer::new(&cfg, InMemoryCluster::new(), StaticServerRegistry::default());
        assert!(matches!(result, Err(SchedulerError::InvalidConfig(_))));
    }

    #[test]
    fn test_discovery_populates_timeline() {
        let (_cluster, mut acq) = acquirer(&[], &[1, 2]);
        acq.next_discovery_iteration().unwrap();
        assert_eq!(immediate_servers(acq.timeline()), vec![server(1), server(2)]);
        assert_eq!(
            acq.timeline().earliest_scheduled().map(|e| e.target.clone()),
            Some(EntryTarget::Discovery)
        );

        acq.registry().remove(&server(1));
        acq.registry().add(server(3));
        acq.next_discovery_iteration().unwrap();
        assert_eq!(immediate_servers(acq.timeline()), vec![server(2), server(3)]);
    }

    #[test]
    fn test_empty_servers_are_scheduled() {
        let (_cluster, mut acq) = acquirer(&[], &[1, 2]);
        let mut strategy = acq.strategy();
        let outcome = acq.get_job_immediately(&mut strategy).unwrap();
        assert_eq!(outcome, AcquireOutcome::Again);
        assert_eq!(acq.timeline().immediate().len(), 0);
        assert_eq!(acq.timeline().scheduled().len(), 3);
        assert!(acq.timeline().scheduled().all(|e| e.all_affinities_checked));
    }

    #[test]
    fn test_productive_server_moves_to_front() {
        let (cluster, mut acq) = acquirer(&["x", "y"], &[1, 2, 3]);
        cluster.submit(&server(2), "j-y", "y").unwrap();
        cluster.submit(&server(3), "j-x", "x").unwrap();

        let mut strategy = acq.strategy();
        let outcome = acq.get_job_immediately(&mut strategy).unwrap();
        assert_eq!(outcome.job().map(|j| j.id.as_str()), Some("j-x"));
        assert_eq!(immediate_servers(acq.timeline()), vec![server(3), server(2)]);
        assert_eq!(cluster.returned(), vec!["j-y".to_string()]);
    }

    #[test]
    fn test_notification_pulls_scheduled_server_forward() {
        let (cluster, mut acq) = acquirer(&[], &[1]);
        let mut strategy = acq.strategy();
        let _ = acq.get_job_immediately(&mut strategy).unwrap();
        assert_eq!(acq.timeline().immediate().len(), 0);

        cluster.notify(&server(1));
        acq.drain_notifications();
        assert_eq!(immediate_servers(acq.timeline()), vec![server(1)]);
        assert_eq!(acq.timeline().scheduled().len(), 1);
    }

    #[test]
    fn test_registry_failure_propagates_without_job() {
        let (_cluster, mut acq) = acquirer(&[], &[1]);
        acq.registry().fail_next("registry offline");
        let err = acq.get_job(Instant::now() + Duration::from_secs(1)).unwrap_err();
        assert!(matches!(err, SchedulerError::Registry(_)));
        assert!(acq.timeline().contains(&EntryTarget::Discovery));
    }
}

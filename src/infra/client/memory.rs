//! In-memory queue cluster for development and testing.
//!
//! Each simulated server keeps pending and leased jobs and speaks the GET2 /
//! RETURN2 wire format, so the client side exercises the same rendering and
//! parsing as a networked client would. Servers also keep their own copy of
//! the worker's preferred affinities, maintained through CHAFF and SETAFF.

use std::collections::{BTreeSet, HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::time::Instant;

use crossbeam_channel::{unbounded, Receiver, Sender};
use parking_lot::Mutex;
use tracing::{debug, error, warn};

use crate::core::affinity::AffinityFilter;
use crate::core::client::{ConnectionState, QueueClient};
use crate::core::job::{Job, JobStatus, ServerAddress};
use crate::core::timeline::{EntryTarget, TimelineEntry};
use crate::core::SchedulerError;
use crate::infra::client::protocol::{
    format_job_response, parse_job_response, parse_return_command, return_command, AffinityPreference,
    AffinityUpdate, GetCommand,
};

/// Port the simulated worker listens on for notifications.
pub const DEFAULT_NOTIFY_PORT: u16 = 9200;

/// One GET2 request as seen by a simulated server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueryRecord {
    /// Server queried.
    pub server: ServerAddress,
    /// Rendered command line.
    pub command: String,
    /// Affinities requested, best first.
    pub affinities: Vec<String>,
    /// Whether the scheduler allowed any affinity.
    pub any_affinity: bool,
}

#[derive(Debug, Default)]
struct SimServer {
    pending: VecDeque<Job>,
    leased: HashMap<String, Job>,
    failures: VecDeque<SchedulerError>,
    worker_affinities: BTreeSet<String>,
    affinities_expired: bool,
    update_failures: usize,
    listener: Option<(u16, u32)>,
}

impl SimServer {
    fn serve(&mut self, cmd: &GetCommand) -> Option<Job> {
        let explicit = if cmd.prioritized {
            cmd.affinities
                .iter()
                .find_map(|aff| self.pending.iter().position(|j| &j.affinity == aff))
        } else {
            self.pending
                .iter()
                .position(|j| cmd.affinities.iter().any(|aff| aff == &j.affinity))
        };
        let index = explicit
            .or_else(|| self.preferred_position(cmd.preference))
            .or_else(|| (cmd.preference.allows_any() && !self.pending.is_empty()).then_some(0))?;

        let mut job = self.pending.remove(index)?;
        if cmd.preference == AffinityPreference::ClaimNewPreferredAffs && !job.affinity.is_empty() {
            self.worker_affinities.insert(job.affinity.clone());
        }
        job.auth_token = uuid::Uuid::new_v4().to_string();
        self.leased.insert(job.id.clone(), job.clone());
        Some(job)
    }

    /// Jobs with the worker's affinities first; when claiming, then any job
    /// whose affinity the worker does not hold yet.
    fn preferred_position(&self, preference: AffinityPreference) -> Option<usize> {
        if !preference.uses_worker_affinities() {
            return None;
        }
        self.pending
            .iter()
            .position(|j| self.worker_affinities.contains(&j.affinity))
            .or_else(|| {
                (preference == AffinityPreference::ClaimNewPreferredAffs)
                    .then(|| self.pending.iter().position(|j| !j.affinity.is_empty()))
                    .flatten()
            })
    }

    fn apply(&mut self, update: AffinityUpdate) -> Result<(), SchedulerError> {
        if self.update_failures > 0 {
            self.update_failures -= 1;
            return Err(SchedulerError::Backend("affinity update refused".into()));
        }
        match update {
            AffinityUpdate::Change { add, del } => {
                self.worker_affinities.extend(add);
                for aff in &del {
                    self.worker_affinities.remove(aff);
                }
            }
            AffinityUpdate::Set(affinities) => {
                self.worker_affinities = affinities.into_iter().collect();
                self.affinities_expired = false;
            }
        }
        Ok(())
    }

    fn take_back(&mut self, key: &str, token: &str) -> Result<(), SchedulerError> {
        match self.leased.get(key) {
            Some(job) if job.auth_token == token => {}
            Some(_) => return Err(SchedulerError::Protocol(format!("auth token mismatch for {key}"))),
            None => return Err(SchedulerError::Protocol(format!("job {key} is not leased"))),
        }
        if let Some(mut job) = self.leased.remove(key) {
            job.auth_token.clear();
            self.pending.push_front(job);
        }
        Ok(())
    }
}

#[derive(Debug, Default)]
struct ClusterState {
    order: Vec<ServerAddress>,
    servers: HashMap<ServerAddress, SimServer>,
    preference: AffinityPreference,
    notify_port: u16,
    worker_affinities: BTreeSet<String>,
    unsynced: HashSet<ServerAddress>,
    stopped: bool,
    stop_after: Option<usize>,
    restart_pending: bool,
    query_count: usize,
    queries: Vec<QueryRecord>,
    affinity_commands: Vec<(ServerAddress, String)>,
    returned: Vec<String>,
}

impl ClusterState {
    fn server_mut(&mut self, addr: &ServerAddress) -> Result<&mut SimServer, SchedulerError> {
        self.servers.get_mut(addr).ok_or_else(|| SchedulerError::Connectivity {
            server: addr.clone(),
            reason: "no such server".into(),
        })
    }

    fn exec_get(&mut self, server: &ServerAddress, command: &str) -> Result<String, SchedulerError> {
        let parsed = GetCommand::parse(command)?;
        let sim = self.server_mut(server)?;
        if let Some(failure) = sim.failures.pop_front() {
            return Err(failure);
        }
        if sim.affinities_expired && parsed.preference.uses_worker_affinities() {
            return Err(SchedulerError::PreferredAffinitiesExpired { server: server.clone() });
        }
        sim.listener = parsed.notify;
        Ok(sim.serve(&parsed).map(|job| format_job_response(&job)).unwrap_or_default())
    }

    fn send_update(&mut self, server: &ServerAddress, update: &AffinityUpdate) -> Result<(), SchedulerError> {
        let line = update.to_string();
        self.affinity_commands.push((server.clone(), line.clone()));
        let parsed = AffinityUpdate::parse(&line)?;
        self.server_mut(server)?.apply(parsed)
    }

    fn sync_affinities(&mut self, server: &ServerAddress) -> Result<(), SchedulerError> {
        let update = AffinityUpdate::set(self.worker_affinities.iter().cloned());
        self.send_update(server, &update)?;
        self.unsynced.remove(server);
        Ok(())
    }

    /// Tell every other server about an affinity this worker has just taken
    /// on. Servers that miss the update are resynced before their next
    /// affinity-based request.
    fn claim_new_affinity(&mut self, origin: &ServerAddress, affinity: &str) {
        if self.preference != AffinityPreference::ClaimNewPreferredAffs
            || affinity.is_empty()
            || !self.worker_affinities.insert(affinity.to_string())
        {
            return;
        }
        debug!(affinity = %affinity, server = %origin, "claiming new preferred affinity");
        let update = AffinityUpdate::add(affinity);
        let others: Vec<_> = self.order.iter().filter(|s| *s != origin).cloned().collect();
        for other in others {
            if let Err(e) = self.send_update(&other, &update) {
                error!(server = %other, affinity = %affinity, "failed to announce new affinity: {}", e);
                self.unsynced.insert(other);
            }
        }
    }
}

/// Cheap-clone handle over a set of simulated queue servers.
///
/// Every clone shares the same servers and notification channel, so a test
/// can keep one handle while the acquirer owns another.
#[derive(Clone)]
pub struct InMemoryCluster {
    state: Arc<Mutex<ClusterState>>,
    notify_tx: Sender<ServerAddress>,
    notify_rx: Receiver<ServerAddress>,
}

impl Default for InMemoryCluster {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryCluster {
    /// Empty cluster using [`AffinityPreference::AnyJob`].
    #[must_use]
    pub fn new() -> Self {
        let (notify_tx, notify_rx) = unbounded();
        let state = ClusterState {
            notify_port: DEFAULT_NOTIFY_PORT,
            ..ClusterState::default()
        };
        Self {
            state: Arc::new(Mutex::new(state)),
            notify_tx,
            notify_rx,
        }
    }

    /// Cluster with the given servers, in order.
    #[must_use]
    pub fn with_servers<I>(servers: I) -> Self
    where
        I: IntoIterator<Item = ServerAddress>,
    {
        let cluster = Self::new();
        for server in servers {
            cluster.add_server(server);
        }
        cluster
    }

    /// Matching policy used when the scheduler allows any affinity.
    #[must_use]
    pub fn with_preference(self, preference: AffinityPreference) -> Self {
        self.state.lock().preference = preference;
        self
    }

    /// Port announced to servers for notifications.
    #[must_use]
    pub fn with_notify_port(self, port: u16) -> Self {
        self.state.lock().notify_port = port;
        self
    }

    /// Replace the worker's preferred affinities. Servers learn the new set
    /// through SETAFF before their next affinity-based request.
    pub fn set_worker_affinities<I, S>(&self, affinities: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut state = self.state.lock();
        state.worker_affinities = affinities.into_iter().map(Into::into).collect();
        state.unsynced = state.order.iter().cloned().collect();
    }

    /// The worker's preferred affinities, sorted.
    #[must_use]
    pub fn worker_affinities(&self) -> Vec<String> {
        self.state.lock().worker_affinities.iter().cloned().collect()
    }

    /// Preferred affinities `server` currently holds for the worker, sorted.
    #[must_use]
    pub fn server_affinities(&self, server: &ServerAddress) -> Vec<String> {
        self.state
            .lock()
            .servers
            .get(server)
            .map(|s| s.worker_affinities.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Make `server` forget the worker's preferred affinities; affinity-based
    /// requests fail until they are sent again.
    pub fn expire_affinities(&self, server: &ServerAddress) {
        if let Ok(sim) = self.state.lock().server_mut(server) {
            sim.worker_affinities.clear();
            sim.affinities_expired = true;
        }
    }

    /// Make the next CHAFF or SETAFF sent to `server` fail.
    pub fn fail_next_update(&self, server: &ServerAddress) {
        if let Ok(sim) = self.state.lock().server_mut(server) {
            sim.update_failures += 1;
        }
    }

    /// Notification port and timeout announced by the last GET2 to `server`.
    #[must_use]
    pub fn listener(&self, server: &ServerAddress) -> Option<(u16, u32)> {
        self.state.lock().servers.get(server).and_then(|s| s.listener)
    }

    /// Every CHAFF and SETAFF sent so far, oldest first.
    #[must_use]
    pub fn affinity_commands(&self) -> Vec<(ServerAddress, String)> {
        self.state.lock().affinity_commands.clone()
    }

    /// Start simulating `server`. Known servers are left as they are.
    pub fn add_server(&self, server: ServerAddress) {
        let mut state = self.state.lock();
        if !state.servers.contains_key(&server) {
            state.order.push(server.clone());
            state.servers.insert(server, SimServer::default());
        }
    }

    /// Stop simulating `server`; its jobs are lost.
    pub fn remove_server(&self, server: &ServerAddress) {
        let mut state = self.state.lock();
        state.order.retain(|s| s != server);
        state.servers.remove(server);
    }

    /// Simulated servers in insertion order.
    #[must_use]
    pub fn servers(&self) -> Vec<ServerAddress> {
        self.state.lock().order.clone()
    }

    /// Queue a job on `server`.
    ///
    /// # Errors
    ///
    /// Fails with a connectivity error if the server is unknown.
    pub fn submit(
        &self,
        server: &ServerAddress,
        id: impl Into<String>,
        affinity: impl Into<String>,
    ) -> Result<(), SchedulerError> {
        let job = Job::new(id, affinity, server.clone());
        self.state.lock().server_mut(server)?.pending.push_back(job);
        Ok(())
    }

    /// Queue a job and tell listeners that `server` has work.
    ///
    /// # Errors
    ///
    /// Fails with a connectivity error if the server is unknown.
    pub fn submit_and_notify(
        &self,
        server: &ServerAddress,
        id: impl Into<String>,
        affinity: impl Into<String>,
    ) -> Result<(), SchedulerError> {
        self.submit(server, id, affinity)?;
        self.notify(server);
        Ok(())
    }

    /// Send a "jobs available" notification for `server`.
    pub fn notify(&self, server: &ServerAddress) {
        // The receiver lives in `self`, so the channel is never disconnected.
        let _ = self.notify_tx.send(server.clone());
    }

    /// Make the next query to `server` fail with `error`.
    pub fn fail_next(&self, server: &ServerAddress, error: SchedulerError) {
        if let Ok(sim) = self.state.lock().server_mut(server) {
            sim.failures.push_back(error);
        }
    }

    /// Report [`ConnectionState::Stopped`] from now on.
    pub fn stop(&self) {
        self.state.lock().stopped = true;
    }

    /// Report [`ConnectionState::Stopped`] once `queries` more queries were made.
    pub fn stop_after_queries(&self, queries: usize) {
        let mut state = self.state.lock();
        state.stop_after = Some(state.query_count + queries);
    }

    /// Report [`ConnectionState::Restarted`] on the next state check.
    pub fn restart(&self) {
        self.state.lock().restart_pending = true;
    }

    /// Number of jobs waiting on `server`.
    #[must_use]
    pub fn pending_count(&self, server: &ServerAddress) -> usize {
        self.state.lock().servers.get(server).map_or(0, |s| s.pending.len())
    }

    /// Keys of jobs currently leased from `server`.
    #[must_use]
    pub fn leased(&self, server: &ServerAddress) -> Vec<String> {
        let state = self.state.lock();
        let mut keys: Vec<String> = state
            .servers
            .get(server)
            .map(|s| s.leased.keys().cloned().collect())
            .unwrap_or_default();
        keys.sort();
        keys
    }

    /// Total number of leases outstanding across the cluster.
    #[must_use]
    pub fn leased_total(&self) -> usize {
        self.state.lock().servers.values().map(|s| s.leased.len()).sum()
    }

    /// Every query made so far, oldest first.
    #[must_use]
    pub fn queries(&self) -> Vec<QueryRecord> {
        self.state.lock().queries.clone()
    }

    /// Keys of jobs handed back, oldest first.
    #[must_use]
    pub fn returned(&self) -> Vec<String> {
        self.state.lock().returned.clone()
    }

    /// Forget logged queries, affinity commands and returns.
    pub fn clear_log(&self) {
        let mut state = self.state.lock();
        state.queries.clear();
        state.affinity_commands.clear();
        state.returned.clear();
    }
}

impl QueueClient for InMemoryCluster {
    fn check_entry(
        &mut self,
        server: &ServerAddress,
        filter: &AffinityFilter,
        any_affinity: bool,
        deadline: Option<Instant>,
    ) -> Result<Option<(Job, JobStatus)>, SchedulerError> {
        let mut state = self.state.lock();
        let mut cmd = GetCommand::for_filter(state.preference, filter, any_affinity);
        if let Some(deadline) = deadline {
            cmd = cmd.with_deadline(state.notify_port, deadline);
        }
        let command = cmd.to_string();
        state.query_count += 1;
        state.queries.push(QueryRecord {
            server: server.clone(),
            command: command.clone(),
            affinities: filter.tokens().to_vec(),
            any_affinity,
        });

        if cmd.preference.uses_worker_affinities() && state.unsynced.contains(server) {
            state.sync_affinities(server)?;
        }
        let response = match state.exec_get(server, &command) {
            Err(SchedulerError::PreferredAffinitiesExpired { .. }) => {
                warn!(server = %server, "preferred affinities expired, sending them again");
                state.sync_affinities(server)?;
                state.exec_get(server, &command)?
            }
            other => other?,
        };
        let job = parse_job_response(&response, server)?;
        if let Some(job) = &job {
            state.claim_new_affinity(server, &job.affinity);
        }
        drop(state);

        debug!(server = %server, command = %command, "GET2 answered");
        Ok(job.map(|job| (job, JobStatus::Running)))
    }

    fn return_job(&mut self, job: &Job) -> Result<(), SchedulerError> {
        let line = return_command(job, false);
        let (key, token) = parse_return_command(&line)?;
        let mut state = self.state.lock();
        let result = state.server_mut(&job.server).and_then(|sim| sim.take_back(&key, &token));
        match &result {
            Ok(()) => state.returned.push(key),
            Err(e) => error!(job_id = %job.id, server = %job.server, "RETURN2 failed: {}", e),
        }
        result
    }

    fn read_notifications(&mut self) -> Option<ServerAddress> {
        self.notify_rx.try_recv().ok()
    }

    fn wait_for_notifications(&mut self, deadline: Instant) -> Option<ServerAddress> {
        self.notify_rx.recv_deadline(deadline).ok()
    }

    fn more_jobs(&self, entry: &TimelineEntry) -> bool {
        let state = self.state.lock();
        match &entry.target {
            EntryTarget::Discovery => state.servers.values().any(|s| !s.pending.is_empty()),
            EntryTarget::Server(addr) => {
                !entry.all_affinities_checked
                    || state.servers.get(addr).is_some_and(|s| !s.pending.is_empty())
            }
        }
    }

    fn check_state(&mut self) -> ConnectionState {
        let mut state = self.state.lock();
        if state.restart_pending {
            state.restart_pending = false;
            return ConnectionState::Restarted;
        }
        let queries = state.query_count;
        if state.stopped || state.stop_after.is_some_and(|n| queries >= n) {
            return ConnectionState::Stopped;
        }
        ConnectionState::Running
    }
}

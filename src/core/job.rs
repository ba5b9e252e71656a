//! Job, server identity and acquisition outcome types.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::core::SchedulerError;

/// Identity of one queue server.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ServerAddress {
    /// Host name or IP address.
    pub host: String,
    /// TCP port.
    pub port: u16,
}

impl ServerAddress {
    /// Create an address from host and port.
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }
}

impl fmt::Display for ServerAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

impl FromStr for ServerAddress {
    type Err = SchedulerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (host, port) = s
            .rsplit_once(':')
            .ok_or_else(|| SchedulerError::InvalidConfig(format!("missing port in `{s}`")))?;
        if host.is_empty() {
            return Err(SchedulerError::InvalidConfig(format!("missing host in `{s}`")));
        }
        let port = port
            .parse::<u16>()
            .map_err(|e| SchedulerError::InvalidConfig(format!("bad port in `{s}`: {e}")))?;
        Ok(Self::new(host, port))
    }
}

/// Server-side status reported alongside a fetched job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    /// Waiting in the queue.
    Pending,
    /// Leased to a worker.
    Running,
    /// Finished successfully.
    Done,
    /// Finished with an error.
    Failed,
    /// Canceled by a submitter.
    Canceled,
    /// Result is being read.
    Reading,
    /// Result read confirmed.
    Confirmed,
}

/// A job leased from a queue server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Job {
    /// Job key, unique within the cluster.
    pub id: String,
    /// Opaque input data.
    pub input: String,
    /// Affinity token attached at submission; empty when none.
    pub affinity: String,
    /// Token proving ownership of the lease.
    pub auth_token: String,
    /// Submitter IP, when the server reports it.
    pub client_ip: Option<String>,
    /// Submitter session id, when the server reports it.
    pub session_id: Option<String>,
    /// Job mask bits.
    pub mask: u32,
    /// Page-hit id of the request that submitted the job.
    #[serde(default)]
    pub page_hit_id: Option<String>,
    /// Server that issued the lease.
    pub server: ServerAddress,
}

impl Job {
    /// Create a job with the fields the scheduler relies on.
    pub fn new(
        id: impl Into<String>,
        affinity: impl Into<String>,
        server: ServerAddress,
    ) -> Self {
        Self {
            id: id.into(),
            input: String::new(),
            affinity: affinity.into(),
            auth_token: String::new(),
            client_ip: None,
            session_id: None,
            mask: 0,
            page_hit_id: None,
            server,
        }
    }
}

/// Final result of an acquisition call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum AcquireOutcome {
    /// A job is leased and now owned by the caller.
    Job {
        /// The leased job.
        job: Job,
        /// Status reported by the server.
        status: JobStatus,
    },
    /// No server can plausibly produce a job.
    NoJobs,
    /// Nothing found before the deadline; try again later.
    Again,
    /// The connection was stopped while searching.
    Interrupted,
}

impl AcquireOutcome {
    /// The leased job, if any.
    #[must_use]
    pub const fn job(&self) -> Option<&Job> {
        match self {
            Self::Job { job, .. } => Some(job),
            _ => None,
        }
    }
}

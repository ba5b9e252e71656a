//! API-facing response model and the async acquisition adapter.

use serde::{Deserialize, Serialize};

use crate::core::{AcquireOutcome, Job, JobStatus};

/// Outcome discriminant for API responses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutcomeKind {
    /// A job was leased.
    Job,
    /// No server can produce a job.
    NoJobs,
    /// Deadline reached; retry later.
    Again,
    /// The connection was stopped.
    Interrupted,
}

/// Flat response for one acquisition call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AcquireResponse {
    /// What happened.
    pub outcome: OutcomeKind,
    /// Leased job, for [`OutcomeKind::Job`].
    pub job: Option<Job>,
    /// Server-reported status of the leased job.
    pub status: Option<JobStatus>,
}

impl From<AcquireOutcome> for AcquireResponse {
    fn from(outcome: AcquireOutcome) -> Self {
        let (outcome, job, status) = match outcome {
            AcquireOutcome::Job { job, status } => (OutcomeKind::Job, Some(job), Some(status)),
            AcquireOutcome::NoJobs => (OutcomeKind::NoJobs, None, None),
            AcquireOutcome::Again => (OutcomeKind::Again, None, None),
            AcquireOutcome::Interrupted => (OutcomeKind::Interrupted, None, None),
        };
        Self { outcome, job, status }
    }
}

#[cfg(feature = "tokio-runtime")]
pub use self::tokio_adapter::{acquire_async, AcquireRound};

#[cfg(feature = "tokio-runtime")]
mod tokio_adapter {
    use std::time::Duration;

    use crate::core::{AcquireOutcome, JobAcquirer, QueueClient, SchedulerError, ServerRegistry};
    use crate::util::clock::deadline_in;

    /// The acquirer handed back together with the result of one call.
    pub type AcquireRound<C, R> = (JobAcquirer<C, R>, Result<AcquireOutcome, SchedulerError>);

    /// Run [`JobAcquirer::get_job`] on tokio's blocking pool with a deadline
    /// `wait` from now.
    ///
    /// # Errors
    ///
    /// Returns `SchedulerError::Backend` if the blocking task panicked; the
    /// acquirer is lost in that case.
    pub async fn acquire_async<C, R>(
        mut acquirer: JobAcquirer<C, R>,
        wait: Duration,
    ) -> Result<AcquireRound<C, R>, SchedulerError>
    where
        C: QueueClient + Send + 'static,
        R: ServerRegistry + Send + 'static,
    {
        tokio::task::spawn_blocking(move || {
            let result = acquirer.get_job(deadline_in(wait));
            (acquirer, result)
        })
        .await
        .map_err(|e| SchedulerError::Backend(format!("acquire task failed: {e}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::ServerAddress;

    #[test]
    fn test_response_from_outcome() {
        let job = Job::new("j1", "gpu", ServerAddress::new("ns", 1));
        let resp = AcquireResponse::from(AcquireOutcome::Job {
            job: job.clone(),
            status: JobStatus::Running,
        });
        assert_eq!(resp.outcome, OutcomeKind::Job);
        assert_eq!(resp.job, Some(job));

        let resp = AcquireResponse::from(AcquireOutcome::NoJobs);
        let json = serde_json::to_value(&resp).unwrap();
        assert_eq!(json["outcome"], "no_jobs");
        assert!(json["job"].is_null());
    }
}

//! Builder that validates configuration before wiring an acquirer.

use tracing::info;

use crate::config::AcquireConfig;
use crate::core::{JobAcquirer, QueueClient, SchedulerError, ServerRegistry};

/// Build a [`JobAcquirer`] from configuration and collaborators.
///
/// # Errors
///
/// Returns `SchedulerError::InvalidConfig` when the configuration is rejected.
pub fn build_acquirer<C, R>(
    cfg: &AcquireConfig,
    client: C,
    registry: R,
) -> Result<JobAcquirer<C, R>, SchedulerError>
where
    C: QueueClient,
    R: ServerRegistry,
{
    cfg.validate()
        .map_err(|e| SchedulerError::InvalidConfig(format!("config invalid: {e}")))?;

    let acquirer = JobAcquirer::new(cfg, client, registry)?;
    info!(
        ladder = %cfg.affinity_ladder.join(","),
        accept_any = cfg.accept_any_affinity,
        poll_timeout_ms = cfg.poll_timeout_ms,
        "job acquirer ready"
    );
    Ok(acquirer)
}

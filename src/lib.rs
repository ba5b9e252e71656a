//! # Prometheus Job Acquire
//!
//! Client-side scheduler that lets a worker pull jobs from a cluster of
//! interchangeable queue servers, honoring an ordered ladder of preferred
//! affinities.
//!
//! ## Core Problem Solved
//!
//! A worker that has warmed up state for some inputs (a loaded model, a cached
//! dataset) runs faster on jobs tagged with matching affinities. Queue servers
//! know nothing about each other, so the worker itself has to decide:
//!
//! - **Which server to ask next**: servers that just produced work are asked
//!   again first, empty ones are left alone for a poll timeout
//! - **What to ask for**: only affinities better than the job already held
//! - **When to stop**: on a top-ranked job, when nothing is left, or at the
//!   caller's deadline
//! - **What to give back**: every lease that is not kept is returned to the
//!   server that issued it
//!
//! ## Usage
//!
//! ```rust,ignore
//! use prometheus_job_acquire::builders::build_acquirer;
//! use prometheus_job_acquire::config::AcquireConfig;
//! use prometheus_job_acquire::core::AcquireOutcome;
//! use prometheus_job_acquire::infra::{InMemoryCluster, StaticServerRegistry};
//! use prometheus_job_acquire::util::deadline_in;
//! use std::time::Duration;
//!
//! let cluster = InMemoryCluster::new();
//! let registry = StaticServerRegistry::new(cluster.servers());
//! let cfg = AcquireConfig::with_ladder(["gpu-a100", "gpu"]);
//!
//! let mut acquirer = build_acquirer(&cfg, cluster.clone(), registry)?;
//! match acquirer.get_job(deadline_in(Duration::from_secs(5)))? {
//!     AcquireOutcome::Job { job, .. } => run(job),
//!     AcquireOutcome::NoJobs | AcquireOutcome::Again => idle(),
//!     AcquireOutcome::Interrupted => shutdown(),
//! }
//! ```
//!
//! For complete scenarios, see `tests/acquire_scenarios_test.rs`.

#![deny(warnings)]
#![deny(missing_docs)]
#![deny(unsafe_code)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]

/// Core acquisition abstractions and the scheduler loop.
pub mod core;
/// Configuration models for acquisition.
pub mod config;
/// Builders to construct acquirers from configuration.
pub mod builders;
/// Infrastructure adapters: queue-server clients and server registries.
pub mod infra;
/// Runtime adapters and API surface.
pub mod runtime;
/// Shared utilities.
pub mod util;

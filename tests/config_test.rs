//! Tests for configuration loading and validation

use prometheus_job_acquire::builders::build_acquirer;
use prometheus_job_acquire::config::{AcquireConfig, DEFAULT_POLL_TIMEOUT_MS};
use prometheus_job_acquire::core::SchedulerError;
use prometheus_job_acquire::infra::{InMemoryCluster, StaticServerRegistry};
use std::time::Duration;

#[test]
fn test_defaults() {
    let cfg = AcquireConfig::default();
    assert!(cfg.affinity_ladder.is_empty());
    assert!(!cfg.accept_any_affinity);
    assert_eq!(cfg.poll_timeout(), Duration::from_millis(DEFAULT_POLL_TIMEOUT_MS));
    assert!(cfg.validate().is_ok());
}

#[test]
fn test_validate_rejects_zero_timeout() {
    let cfg = AcquireConfig {
        poll_timeout_ms: 0,
        ..AcquireConfig::default()
    };
    assert!(cfg.validate().is_err());
}

#[test]
fn test_validate_rejects_bad_ladder() {
    for ladder in [vec![""], vec!["-"], vec!["a b"], vec!["a,b"], vec!["\"q\""], vec!["x", "x"]] {
        let cfg = AcquireConfig::with_ladder(ladder.clone());
        assert!(cfg.validate().is_err(), "ladder {ladder:?} accepted");
    }
    assert!(AcquireConfig::with_ladder(["gpu-a100", "gpu"]).validate().is_ok());
}

#[test]
fn test_from_json_str() {
    let cfg = AcquireConfig::from_json_str(
        r#"{"affinity_ladder": ["x", "y"], "accept_any_affinity": true, "poll_timeout_ms": 250}"#,
    )
    .unwrap();
    assert_eq!(cfg.affinity_ladder, vec!["x", "y"]);
    assert!(cfg.accept_any_affinity);
    assert_eq!(cfg.poll_timeout_ms, 250);

    let cfg = AcquireConfig::from_json_str("{}").unwrap();
    assert_eq!(cfg, AcquireConfig::default());
}

#[test]
fn test_from_json_str_errors() {
    assert!(AcquireConfig::from_json_str("not json").is_err());
    let err = AcquireConfig::from_json_str(r#"{"poll_timeout_ms": 0}"#).unwrap_err();
    assert!(format!("{err:#}").contains("poll_timeout_ms"));
}

#[test]
fn test_from_env() {
    std::env::set_var("JOB_ACQUIRE_AFFINITY_LADDER", "gpu,cpu");
    std::env::set_var("JOB_ACQUIRE_ACCEPT_ANY", "true");
    std::env::set_var("JOB_ACQUIRE_POLL_TIMEOUT_MS", "500");

    let cfg = AcquireConfig::from_env().unwrap();

    std::env::remove_var("JOB_ACQUIRE_AFFINITY_LADDER");
    std::env::remove_var("JOB_ACQUIRE_ACCEPT_ANY");
    std::env::remove_var("JOB_ACQUIRE_POLL_TIMEOUT_MS");

    assert_eq!(cfg.affinity_ladder, vec!["gpu", "cpu"]);
    assert!(cfg.accept_any_affinity);
    assert_eq!(cfg.poll_timeout_ms, 500);
}

#[test]
fn test_build_acquirer_validates() {
    let cfg = AcquireConfig::with_ladder(["ok", "not ok"]);
    let result = build_acquirer(&cfg, InMemoryCluster::new(), StaticServerRegistry::default());
    assert!(matches!(result, Err(SchedulerError::InvalidConfig(_))));

    let cfg = AcquireConfig::with_ladder(["ok"]);
    assert!(build_acquirer(&cfg, InMemoryCluster::new(), StaticServerRegistry::default()).is_ok());
}

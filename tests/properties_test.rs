//! Randomized checks of timeline and lease invariants.
//!
//! Each seed builds a cluster with random job mixes and injected failures,
//! then drives the acquirer without blocking and checks after every call that:
//! - no entry is in both lists or listed twice
//! - every leased job was either handed to the caller or returned
//! - the held rank never gets worse within one call

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Instant;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use prometheus_job_acquire::config::AcquireConfig;
use prometheus_job_acquire::core::{
    AcquireOutcome, EntryTarget, InMemoryAuditSink, JobAcquirer, LeaseAction, SchedulerError, ServerAddress,
};
use prometheus_job_acquire::infra::client::AffinityPreference;
use prometheus_job_acquire::infra::{InMemoryCluster, StaticServerRegistry};

const AFFINITIES: [&str; 4] = ["a", "b", "c", "z"];
const LADDER: [&str; 3] = ["a", "b", "c"];

struct Case {
    cluster: InMemoryCluster,
    audit: Arc<InMemoryAuditSink>,
    acquirer: JobAcquirer<InMemoryCluster, StaticServerRegistry>,
    servers: Vec<ServerAddress>,
}

fn build_case(rng: &mut StdRng) -> Case {
    let servers: Vec<_> = (0..rng.random_range(1..=6u16))
        .map(|i| ServerAddress::new("queue.local", 9000 + i))
        .collect();
    let preference = if rng.random_bool(0.5) {
        AffinityPreference::AnyJob
    } else {
        AffinityPreference::ExplicitAffinitiesOnly
    };
    let cluster = InMemoryCluster::with_servers(servers.clone()).with_preference(preference);
    let registry = StaticServerRegistry::new(servers.clone());

    let ladder_len = rng.random_range(0..=LADDER.len());
    let cfg = AcquireConfig {
        affinity_ladder: LADDER[..ladder_len].iter().map(|s| (*s).to_string()).collect(),
        accept_any_affinity: rng.random_bool(0.5),
        poll_timeout_ms: 60_000,
    };
    let audit = Arc::new(InMemoryAuditSink::new(100_000));
    let acquirer = JobAcquirer::new(&cfg, cluster.clone(), registry)
        .unwrap()
        .with_audit(audit.clone());

    Case {
        cluster,
        audit,
        acquirer,
        servers,
    }
}

fn sprinkle_jobs(case: &Case, rng: &mut StdRng, round: usize) {
    for (i, server) in case.servers.iter().enumerate() {
        for n in 0..rng.random_range(0..3) {
            let affinity = AFFINITIES[rng.random_range(0..AFFINITIES.len())];
            case.cluster
                .submit(server, format!("job-{round}-{i}-{n}"), affinity)
                .unwrap();
        }
        match rng.random_range(0..10) {
            0 => case.cluster.fail_next(
                server,
                SchedulerError::Connectivity {
                    server: server.clone(),
                    reason: "reset by peer".into(),
                },
            ),
            1 => case
                .cluster
                .fail_next(server, SchedulerError::Protocol("truncated reply".into())),
            _ => {}
        }
    }
}

fn assert_no_double_booking(case: &Case) {
    let timeline = case.acquirer.timeline();
    let mut seen = HashSet::new();
    for entry in timeline.immediate().chain(timeline.scheduled()) {
        assert!(seen.insert(entry.target.clone()), "{:?} listed twice", entry.target);
    }
    assert!(seen.contains(&EntryTarget::Discovery));
}

fn assert_monotonic_held_ranks(case: &Case, from: usize) {
    let events = case.audit.events();
    let ranks: Vec<usize> = events[from..]
        .iter()
        .filter(|e| e.action == LeaseAction::Held)
        .filter_map(|e| e.rank)
        .collect();
    assert!(
        ranks.windows(2).all(|w| w[1] <= w[0]),
        "held rank regressed within one call: {ranks:?}"
    );
}

#[test]
fn test_invariants_hold_across_random_runs() {
    for seed in 0..64u64 {
        let mut rng = StdRng::seed_from_u64(seed);
        let mut case = build_case(&mut rng);
        let mut kept = 0;

        for round in 0..8 {
            sprinkle_jobs(&case, &mut rng, round);

            let events_before = case.audit.events().len();
            let result = case.acquirer.get_job(Instant::now());

            match result {
                Ok(AcquireOutcome::Job { job, .. }) => {
                    kept += 1;
                    assert!(case.cluster.leased(&job.server).contains(&job.id));
                }
                Ok(AcquireOutcome::Interrupted) => panic!("seed {seed}: nothing stops the connection"),
                Ok(_) => {}
                Err(e) => assert!(!e.is_connectivity(), "seed {seed}: connectivity error escaped: {e}"),
            }

            assert_no_double_booking(&case);
            assert_monotonic_held_ranks(&case, events_before);
            assert_eq!(case.cluster.leased_total(), kept, "seed {seed}: lease leaked in round {round}");
        }
    }
}

#[test]
fn test_interrupt_never_orphans_a_lease() {
    for seed in 0..32u64 {
        let mut rng = StdRng::seed_from_u64(seed);
        let mut case = build_case(&mut rng);
        sprinkle_jobs(&case, &mut rng, 0);
        case.cluster.stop_after_queries(rng.random_range(1..=case.servers.len()));

        let outcome = case.acquirer.get_job(Instant::now());

        if let Ok(AcquireOutcome::Interrupted) = outcome {
            assert_eq!(case.cluster.leased_total(), 0, "seed {seed}: held job not returned");
        }
        assert_no_double_booking(&case);
    }
}

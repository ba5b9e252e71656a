//! Tests for the GET2 / RETURN2 wire format

use prometheus_job_acquire::core::{Job, ServerAddress};
use prometheus_job_acquire::infra::client::protocol::{
    format_job_response, parse_job_response, return_command, AffinityPreference, GetCommand,
};

#[test]
fn test_preference_flags() {
    let cases = [
        (AffinityPreference::PreferredAffsOrAnyJob, "wnode_aff=1 any_aff=1"),
        (AffinityPreference::PreferredAffinities, "wnode_aff=1 any_aff=0"),
        (AffinityPreference::ClaimNewPreferredAffs, "wnode_aff=1 any_aff=0 exclusive_new_aff=1"),
        (AffinityPreference::AnyJob, "wnode_aff=0 any_aff=1"),
        (AffinityPreference::ExplicitAffinitiesOnly, "wnode_aff=0 any_aff=0"),
    ];
    for (preference, flags) in cases {
        assert_eq!(preference.flags(), flags);
        let parsed = GetCommand::parse(&GetCommand::new(preference).to_string()).unwrap();
        assert_eq!(parsed.preference, preference);
    }
}

#[test]
fn test_downgrade_when_any_affinity_not_allowed() {
    for preference in [
        AffinityPreference::PreferredAffsOrAnyJob,
        AffinityPreference::AnyJob,
        AffinityPreference::ClaimNewPreferredAffs,
    ] {
        assert_eq!(preference.for_request(false), AffinityPreference::ExplicitAffinitiesOnly);
        assert_eq!(preference.for_request(true), preference);
    }
}

#[test]
fn test_full_get_command_parses() {
    let line = "GET2 wnode_aff=0 any_aff=1 aff=a,b port=9300 timeout=15 group=\"nightly\" prioritized_aff=1";
    let cmd = GetCommand::parse(line).unwrap();
    assert_eq!(cmd.affinities, vec!["a", "b"]);
    assert_eq!(cmd.notify, Some((9300, 15)));
    assert_eq!(cmd.group.as_deref(), Some("nightly"));
    assert!(cmd.prioritized);
    assert_eq!(cmd.to_string(), line);
}

#[test]
fn test_job_response_escapes_reserved_characters() {
    let server = ServerAddress::new("queue.local", 9100);
    let mut job = Job::new("JSID_01_42_queue.local_9100", "gpu", server.clone());
    job.input = "a=1&b=2 c%".into();
    job.auth_token = "1234567890_abc".into();
    job.client_ip = Some("192.168.0.7".into());
    job.mask = 8;

    let response = format_job_response(&job);
    assert!(!response.contains(' '));
    assert_eq!(response.matches('&').count(), 5);
    assert_eq!(parse_job_response(&response, &server).unwrap(), Some(job));
}

#[test]
fn test_return_command_blacklist_flag() {
    let mut job = Job::new("JSID_01_1", "", ServerAddress::new("queue.local", 9100));
    job.auth_token = "t".into();
    assert_eq!(return_command(&job, true), "RETURN2 job_key=JSID_01_1 auth_token=t");
    assert_eq!(return_command(&job, false), "RETURN2 job_key=JSID_01_1 auth_token=t blacklist=0");
}

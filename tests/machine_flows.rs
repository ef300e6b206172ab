//! End-to-end behavioural tests over the public API using scripted doubles.

use std::sync::Arc;

use camino::Utf8PathBuf;
use tempfile::TempDir;

use machina::exec::{RemoteEndpoint, RemoteExecutor, ShellError};
use machina::launch::LaunchOverrides;
use machina::lifecycle;
use machina::profile::{AmiProfile, KeyPair, Profile, SubnetProfile, VpcProfile};
use machina::registry::{InstanceRegistry, InstanceState};
use machina::test_support::{FakeProvider, ScriptedShell, ShellCall};

fn profile() -> Profile {
    Profile {
        name: String::from("default"),
        region: String::from("us-east-1"),
        account_id: String::new(),
        vpc: VpcProfile {
            id: String::from("vpc-1"),
            cidr: String::from("10.0.0.0/16"),
            subnets: vec![SubnetProfile {
                id: String::from("subnet-1"),
                public: true,
                ..SubnetProfile::default()
            }],
            security_groups: Vec::new(),
        },
        key_pairs: vec![KeyPair {
            name: String::from("ops"),
            digest: None,
        }],
        amis: vec![AmiProfile {
            id: String::from("ami-1"),
            ..AmiProfile::default()
        }],
    }
}

fn registry_path(tmp: &TempDir) -> Utf8PathBuf {
    Utf8PathBuf::from_path_buf(tmp.path().join("instances.json"))
        .unwrap_or_else(|err| panic!("temp path should be utf8: {}", err.display()))
}

fn endpoints(hosts: &[&str]) -> Vec<RemoteEndpoint> {
    hosts
        .iter()
        .map(|host| RemoteEndpoint::new("ops", *host, 22))
        .collect()
}

#[tokio::test]
async fn created_machines_survive_a_registry_reload() {
    let tmp = TempDir::new().unwrap_or_else(|err| panic!("tempdir: {err}"));
    let path = registry_path(&tmp);

    let provider = Arc::new(FakeProvider::new());
    provider.queue_launch(vec!["i-1", "i-2"]);
    provider.set_addresses("i-1", "203.0.113.1", "10.0.0.1");
    provider.set_addresses("i-2", "203.0.113.2", "10.0.0.2");

    let mut registry = InstanceRegistry::load(&path).unwrap_or_else(|err| panic!("load: {err}"));
    assert!(registry.is_empty(), "fresh store should be empty");

    let overrides = LaunchOverrides {
        count: 2,
        ..LaunchOverrides::default()
    };
    let summary = lifecycle::create_instances(&provider, &mut registry, &profile(), &overrides, "node")
        .await
        .unwrap_or_else(|err| panic!("create: {err}"));
    registry.dump(&path).unwrap_or_else(|err| panic!("dump: {err}"));

    assert_eq!(summary.ready.len(), 2);
    let reloaded = InstanceRegistry::load(&path).unwrap_or_else(|err| panic!("reload: {err}"));
    assert_eq!(reloaded, registry);
    for name in ["node-1", "node-2"] {
        let instance = reloaded
            .get(name)
            .unwrap_or_else(|| panic!("{name} missing after reload"));
        assert_eq!(instance.state, InstanceState::Running);
        assert!(instance.docker_host.is_some());
    }
}

#[tokio::test]
async fn partial_create_progress_is_persisted() {
    let tmp = TempDir::new().unwrap_or_else(|err| panic!("tempdir: {err}"));
    let path = registry_path(&tmp);

    let provider = Arc::new(FakeProvider::new());
    provider.queue_launch(vec!["i-good", "i-bad"]);
    provider.set_addresses("i-good", "203.0.113.1", "10.0.0.1");
    provider.fail_wait("i-bad", "never ran");

    let mut registry = InstanceRegistry::new();
    let overrides = LaunchOverrides {
        count: 2,
        ..LaunchOverrides::default()
    };
    let summary = lifecycle::create_instances(&provider, &mut registry, &profile(), &overrides, "node")
        .await
        .unwrap_or_else(|err| panic!("create: {err}"));
    registry.dump(&path).unwrap_or_else(|err| panic!("dump: {err}"));

    assert_eq!(summary.ready.len(), 1);
    assert_eq!(summary.failed.len(), 1);

    let reloaded = InstanceRegistry::load(&path).unwrap_or_else(|err| panic!("reload: {err}"));
    assert_eq!(reloaded.len(), 1, "the ready instance is kept");
}

#[tokio::test]
async fn start_and_stop_uphold_state_invariants() {
    let provider = Arc::new(FakeProvider::new());
    provider.queue_launch(vec!["i-1"]);
    provider.set_addresses("i-1", "203.0.113.1", "10.0.0.1");
    let mut registry = InstanceRegistry::new();

    lifecycle::create_instances(
        &provider,
        &mut registry,
        &profile(),
        &LaunchOverrides::default(),
        "solo",
    )
    .await
    .unwrap_or_else(|err| panic!("create: {err}"));

    lifecycle::stop_instances(&provider, &mut registry, &[String::from("solo")])
        .await
        .unwrap_or_else(|err| panic!("stop: {err}"));
    {
        let stopped = registry.get("solo").unwrap_or_else(|| panic!("record present"));
        assert_eq!(stopped.state, InstanceState::Stopped);
        assert!(stopped.host.is_none() && stopped.docker_host.is_none());
        assert!(stopped.alt_host.is_empty());
    }

    lifecycle::start_instances(&provider, &mut registry, &[String::from("solo")])
        .await
        .unwrap_or_else(|err| panic!("start: {err}"));
    let started = registry.get("solo").unwrap_or_else(|| panic!("record present"));
    assert_eq!(started.state, InstanceState::Running);
    assert_eq!(started.host.as_deref(), Some("203.0.113.1"));
}

#[tokio::test]
async fn executor_barrier_accounts_for_every_host() {
    let hosts = ["h1", "h2", "h3", "h4", "h5"];
    let shell = ScriptedShell::new();
    for host in hosts {
        shell.expect_run(host, Ok(format!("{host} done")));
    }
    let executor = RemoteExecutor::new(Arc::new(shell));

    let outcomes = executor.run_command(&endpoints(&hosts), "uptime").await;

    assert_eq!(outcomes.len(), hosts.len());
    let mut reported: Vec<&str> = outcomes.iter().map(|o| o.host.as_str()).collect();
    reported.sort_unstable();
    assert_eq!(reported, hosts);
}

#[tokio::test]
async fn script_fanout_isolates_the_failing_host() {
    let shell = ScriptedShell::new();
    // Host A runs both scripts.
    shell.expect_copy("host-a", Ok(()));
    shell.expect_stream("host-a", vec![Ok(String::from("first"))]);
    shell.expect_copy("host-a", Ok(()));
    shell.expect_stream("host-a", vec![Ok(String::from("second"))]);
    // Host B fails its first copy.
    shell.expect_copy(
        "host-b",
        Err(ShellError::CopyFailure {
            host: String::from("host-b"),
            path: Utf8PathBuf::from("provision.sh"),
            message: String::from("permission denied"),
        }),
    );
    let executor = RemoteExecutor::new(Arc::new(shell.clone()));

    let scripts = vec![
        Utf8PathBuf::from("provision.sh"),
        Utf8PathBuf::from("verify.sh"),
    ];
    let mut outcomes = executor
        .run_scripts(&endpoints(&["host-a", "host-b"]), &scripts, true)
        .await;
    outcomes.sort_by(|a, b| a.host.cmp(&b.host));

    let host_a = outcomes.first().unwrap_or_else(|| panic!("host-a outcome"));
    assert_eq!(host_a.result.as_deref(), Ok("first\nsecond"));
    let host_b = outcomes.get(1).unwrap_or_else(|| panic!("host-b outcome"));
    assert!(matches!(host_b.result, Err(ShellError::CopyFailure { .. })));

    // Host B's second script was never attempted; host A staged and streamed
    // both of its scripts with elevation.
    assert_eq!(shell.calls_for("host-b").len(), 1);
    let a_calls = shell.calls_for("host-a");
    let elevated_streams = a_calls
        .iter()
        .filter(|call| matches!(call, ShellCall::Stream { elevate: true, .. }))
        .count();
    assert_eq!(elevated_streams, 2);
}

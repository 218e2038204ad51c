use pipetun_cli::args::StopArgs;
use pipetun_cli::commands::{self, Context};
use pipetun_cli::config::Settings;
use pipetun_cli::conflict::{ConflictPolicy, ConflictResolver, Resolution};
use pipetun_cli::ports::{PortProbe, PortReport, ProcessDetails};
use pipetun_cli::registry::{StopSignal, TunnelProcessRecord, TunnelRegistry};
use pipetun_cli::ssh::SshStateStore;
use pipetun_cli::TunnelError;
use pipetun_proto::TunnelSpec;
use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tempfile::TempDir;

type Events = Arc<Mutex<Vec<String>>>;

struct FakeRegistry {
    user: String,
    records: Vec<TunnelProcessRecord>,
    alive: Mutex<HashSet<u32>>,
    events: Events,
}

impl FakeRegistry {
    fn new(user: &str, records: Vec<TunnelProcessRecord>, events: Events) -> Self {
        let alive = records.iter().map(|r| r.pid).collect();
        Self {
            user: user.to_string(),
            records,
            alive: Mutex::new(alive),
            events,
        }
    }
}

impl TunnelRegistry for FakeRegistry {
    fn scan(&self) -> Box<dyn Iterator<Item = TunnelProcessRecord> + '_> {
        let alive = self.alive.lock().unwrap().clone();
        Box::new(
            self.records
                .iter()
                .filter(move |r| alive.contains(&r.pid))
                .cloned(),
        )
    }

    fn signal(&self, pid: u32, signal: StopSignal) -> pipetun_cli::Result<()> {
        self.events
            .lock()
            .unwrap()
            .push(format!("signal {} {:?}", pid, signal));
        self.alive.lock().unwrap().remove(&pid);
        Ok(())
    }

    fn is_alive(&self, pid: u32) -> bool {
        self.alive.lock().unwrap().contains(&pid)
    }

    fn current_user(&self) -> String {
        self.user.clone()
    }
}

struct FakeProbe {
    occupied: Vec<u16>,
    events: Events,
}

impl PortProbe for FakeProbe {
    fn check(&self, _host: &str, ports: &[u16]) -> PortReport {
        self.events.lock().unwrap().push("probe".to_string());
        PortReport {
            occupied: ports
                .iter()
                .filter(|port| self.occupied.contains(port))
                .map(|port| {
                    (
                        *port,
                        Some(ProcessDetails {
                            pid: 7,
                            parent_pid: None,
                            name: "nginx".to_string(),
                        }),
                    )
                })
                .collect(),
        }
    }
}

fn spec(host: &str, ports: &str) -> TunnelSpec {
    TunnelSpec::new(host, ports, "").unwrap()
}

fn record(pid: u32, owner: &str, spec: TunnelSpec) -> TunnelProcessRecord {
    TunnelProcessRecord {
        pid,
        parent_pid: None,
        owner: owner.to_string(),
        raw_args: Vec::new(),
        spec: Some(spec),
    }
}

struct Fixture {
    registry: FakeRegistry,
    probe: FakeProbe,
    events: Events,
}

impl Fixture {
    fn new(records: Vec<TunnelProcessRecord>, occupied: Vec<u16>) -> Self {
        let events: Events = Arc::default();
        Self {
            registry: FakeRegistry::new("alice", records, events.clone()),
            probe: FakeProbe {
                occupied,
                events: events.clone(),
            },
            events,
        }
    }

    fn resolver(&self) -> ConflictResolver<'_> {
        ConflictResolver::new(
            &self.registry,
            &self.probe,
            "127.0.0.1",
            Duration::from_secs(5),
        )
    }

    fn events(&self) -> Vec<String> {
        self.events.lock().unwrap().clone()
    }
}

#[tokio::test]
async fn test_foreign_tunnel_without_policy_fails_before_probing() {
    let fixture = Fixture::new(vec![record(42, "bob", spec("12345", "4567"))], vec![]);

    let result = fixture
        .resolver()
        .resolve(&spec("12345", "4567"), ConflictPolicy::None, false, false)
        .await;

    match result {
        Err(TunnelError::Conflict(message)) => {
            assert!(message.contains("bob"));
            assert!(message.contains("pipetun tunnel stop -lp 4567 --ignore-owner"));
        }
        other => panic!("unexpected {:?}", other),
    }
    assert!(fixture.events().is_empty());
}

#[tokio::test]
async fn test_replace_foreign_tunnel_signals_before_probe() {
    let fixture = Fixture::new(vec![record(42, "bob", spec("12345", "4567"))], vec![]);

    let resolution = fixture
        .resolver()
        .resolve(&spec("12345", "4567"), ConflictPolicy::ReplaceExisting, false, true)
        .await
        .unwrap();

    assert_eq!(resolution, Resolution::Serve);
    assert_eq!(fixture.events(), vec!["signal 42 Terminate", "probe"]);
}

#[tokio::test]
async fn test_replace_foreign_tunnel_requires_ignore_owner() {
    let fixture = Fixture::new(vec![record(42, "bob", spec("999", "4567"))], vec![]);

    let result = fixture
        .resolver()
        .resolve(&spec("12345", "4567"), ConflictPolicy::ReplaceDifferent, false, false)
        .await;

    assert!(matches!(result, Err(TunnelError::Conflict(_))));
    assert!(fixture.events().is_empty());
}

#[tokio::test]
async fn test_keep_same_reuses_identical_tunnel() {
    let fixture = Fixture::new(vec![record(42, "alice", spec("12345", "4567"))], vec![4567]);

    let resolution = fixture
        .resolver()
        .resolve(&spec("12345", "4567"), ConflictPolicy::KeepSame, false, false)
        .await
        .unwrap();

    match resolution {
        Resolution::Reuse {
            record,
            reprovision_ssh,
        } => {
            assert_eq!(record.pid, 42);
            assert!(!reprovision_ssh);
        }
        other => panic!("unexpected {:?}", other),
    }
    assert!(fixture.events().is_empty());
}

#[tokio::test]
async fn test_reusing_foreign_ssh_tunnel_reprovisions() {
    let requested = spec("12345", "4567").with_ssh(true);
    let fixture = Fixture::new(vec![record(42, "bob", requested.clone())], vec![4567]);

    let resolution = fixture
        .resolver()
        .resolve(&requested, ConflictPolicy::KeepExisting, false, false)
        .await
        .unwrap();

    assert!(matches!(
        resolution,
        Resolution::Reuse {
            reprovision_ssh: true,
            ..
        }
    ));
}

#[tokio::test]
async fn test_reusing_foreign_plain_tunnel_skips_ssh() {
    let fixture = Fixture::new(vec![record(42, "bob", spec("12345", "4567"))], vec![4567]);

    let resolution = fixture
        .resolver()
        .resolve(
            &spec("12345", "4567").with_ssh(true),
            ConflictPolicy::KeepExisting,
            false,
            false,
        )
        .await
        .unwrap();

    assert!(matches!(
        resolution,
        Resolution::Reuse {
            reprovision_ssh: false,
            ..
        }
    ));
}

#[tokio::test]
async fn test_unrelated_port_owner_is_reported() {
    let fixture = Fixture::new(vec![record(42, "alice", spec("777", "9000"))], vec![4568]);

    let result = fixture
        .resolver()
        .resolve(&spec("12345", "4567-4568"), ConflictPolicy::None, false, false)
        .await;

    match result {
        Err(TunnelError::PortsOccupied(message)) => {
            assert!(message.contains("port 4568 is used by nginx (pid 7)"));
            assert!(!message.contains("4567"));
        }
        other => panic!("unexpected {:?}", other),
    }
}

#[tokio::test]
async fn test_ignore_existing_skips_conflicts() {
    let fixture = Fixture::new(vec![record(42, "bob", spec("12345", "4567"))], vec![]);

    let resolution = fixture
        .resolver()
        .resolve(&spec("12345", "4567"), ConflictPolicy::None, true, false)
        .await
        .unwrap();

    assert_eq!(resolution, Resolution::Serve);
    assert_eq!(fixture.events(), vec!["probe"]);
}

fn context(fixture: Fixture, state: &TempDir) -> (Context, Events) {
    let events = fixture.events.clone();
    let ctx = Context::new(
        Settings::default(),
        Arc::new(fixture.registry),
        Arc::new(fixture.probe),
        SshStateStore::new(state.path()),
    );
    (ctx, events)
}

fn stop_args(host_id: Option<&str>) -> StopArgs {
    StopArgs {
        host_id: host_id.map(str::to_string),
        local_port: None,
        timeout: 5,
        force: false,
        ignore_owner: false,
    }
}

#[tokio::test]
async fn test_stop_without_matches_sends_no_signals() {
    let state = TempDir::new().unwrap();
    let fixture = Fixture::new(vec![record(42, "alice", spec("12345", "4567"))], vec![]);
    let (ctx, events) = context(fixture, &state);

    commands::stop(&ctx, &stop_args(Some("999"))).await.unwrap();

    assert!(events.lock().unwrap().is_empty());
}

#[tokio::test]
async fn test_stop_terminates_own_tunnels_only() {
    let state = TempDir::new().unwrap();
    let fixture = Fixture::new(
        vec![
            record(42, "alice", spec("12345", "4567")),
            record(43, "bob", spec("12345", "4568")),
        ],
        vec![],
    );
    let (ctx, events) = context(fixture, &state);

    commands::stop(&ctx, &stop_args(Some("12345"))).await.unwrap();

    assert_eq!(
        *events.lock().unwrap(),
        vec!["signal 42 Terminate".to_string(), "probe".to_string()]
    );
}

#[tokio::test]
async fn test_stop_fails_when_ports_stay_busy() {
    let state = TempDir::new().unwrap();
    let fixture = Fixture::new(vec![record(42, "alice", spec("12345", "4567"))], vec![4567]);
    let (ctx, _events) = context(fixture, &state);

    let mut args = stop_args(None);
    args.timeout = 0;
    let err = commands::stop(&ctx, &args).await.unwrap_err();

    assert!(matches!(
        err.downcast_ref::<TunnelError>(),
        Some(TunnelError::StopTimeout(_))
    ));
}

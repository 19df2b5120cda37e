//! End-to-end scenarios exercising the public API across module
//! boundaries: a live daemon over its real command socket, and the
//! domain file lock across two `RoudiMemoryManager`s.

use std::io::{Read, Write};
use std::os::unix::net::UnixStream;
use std::time::Duration;

use shmbroker::cli::{Cli, CompatibilityLevel, LogLevelArg, MonitoringMode};
use shmbroker::config::Config;
use shmbroker::daemon::Daemon;
use shmbroker::error::EnvironmentError;
use shmbroker::roudi_memory_manager::RoudiMemoryManager;

fn test_cli(domain_id: u16) -> Cli {
    Cli {
        version: false,
        domain_id,
        unique_roudi_id: None,
        monitoring_mode: MonitoringMode::On,
        log_level: LogLevelArg::Off,
        compatibility: CompatibilityLevel::Off,
        termination_delay_seconds: 0,
        kill_delay_seconds: 0,
        config_file: None,
    }
}

fn send(stream: &mut UnixStream, fields: &[&str]) -> String {
    let owned: Vec<String> = fields.iter().map(|s| s.to_string()).collect();
    stream.write_all(&shmbroker::ipc::protocol::encode_record(&owned)).unwrap();
    let mut buf = [0u8; 512];
    let n = stream.read(&mut buf).unwrap();
    String::from_utf8_lossy(&buf[..n]).into_owned()
}

/// Daemon shutdown now signals every registered pid with SIGTERM/SIGKILL
/// (§5 Cancellation); tests that run a daemon to completion register a real
/// disposable child process instead of a fabricated pid number, so that
/// signal lands on something this test process actually owns.
fn spawn_disposable_child() -> std::process::Child {
    std::process::Command::new("sleep")
        .arg("60")
        .spawn()
        .expect("the `sleep` binary is available in the test environment")
}

/// Scenario 1: a single-segment config, a client registers and receives
/// `REG_ACK`, then creates a publisher that a third party can find.
#[test]
fn scenario_register_create_publisher_find_service() {
    let cli = test_cli(201);
    let config = Config::default_single_segment(cli.domain_id, "shmbroker");
    let daemon = Daemon::bootstrap(&cli, &config, false).expect("daemon boots on the heap backend");

    let socket_path = std::path::PathBuf::from(shmbroker::daemon::DEFAULT_RESOURCE_PREFIX)
        .join(cli.domain_id.to_string())
        .join("iceoryx_roudi");

    let handle = std::thread::spawn(move || daemon.run());
    std::thread::sleep(Duration::from_millis(100));

    let mut child = spawn_disposable_child();
    let mut client = UnixStream::connect(&socket_path).expect("command socket is listening");
    let reply = send(&mut client, &["REG", "appA", &child.id().to_string(), "1000", "0", "1.0"]);
    assert!(reply.starts_with("REG_ACK"), "unexpected reply: {reply}");

    let reply = send(&mut client, &["CREATE_PUBLISHER", "svc", "inst", "evt", "0", "appA", ""]);
    assert!(reply.starts_with("ACK"), "unexpected reply: {reply}");

    let mut other = UnixStream::connect(&socket_path).unwrap();
    let reply = send(&mut other, &["FIND_SERVICE", "svc", "inst"]);
    let fields: Vec<&str> = reply.trim_end().split('\x1f').collect();
    assert_eq!(fields[1], "1", "expected exactly one matching publisher: {reply}");

    send(&mut client, &["TERMINATION"]);
    handle.join().unwrap().unwrap();
    let _ = child.wait();
}

/// Scenario 2: registering the same name twice is rejected while the
/// first registration remains usable.
#[test]
fn scenario_duplicate_registration_is_rejected_first_stays_usable() {
    let cli = test_cli(202);
    let config = Config::default_single_segment(cli.domain_id, "shmbroker");
    let daemon = Daemon::bootstrap(&cli, &config, false).unwrap();
    let socket_path = std::path::PathBuf::from(shmbroker::daemon::DEFAULT_RESOURCE_PREFIX)
        .join(cli.domain_id.to_string())
        .join("iceoryx_roudi");

    let handle = std::thread::spawn(move || daemon.run());
    std::thread::sleep(Duration::from_millis(100));

    let mut first_child = spawn_disposable_child();
    let mut second_child = spawn_disposable_child();

    let mut first = UnixStream::connect(&socket_path).unwrap();
    assert!(send(&mut first, &["REG", "dup", &first_child.id().to_string(), "1000", "0", "1.0"]).starts_with("REG_ACK"));

    let mut second = UnixStream::connect(&socket_path).unwrap();
    assert!(send(&mut second, &["REG", "dup", &second_child.id().to_string(), "1000", "0", "1.0"]).starts_with("REG_ERR"));

    // KEEPALIVE gets no reply (fire-and-forget); confirm the connection and
    // daemon are still alive with a round-tripping command afterwards.
    let keepalive = shmbroker::ipc::protocol::encode_record(&["KEEPALIVE".to_string(), "dup".to_string()]);
    first.write_all(&keepalive).unwrap();
    assert!(send(&mut first, &["FIND_SERVICE", "svc", "inst"]).starts_with("ACK"));

    send(&mut first, &["TERMINATION"]);
    handle.join().unwrap().unwrap();
    let _ = first_child.wait();
    let _ = second_child.kill();
    let _ = second_child.wait();
}

/// Scenario 3, at the module level the discovery loop itself operates on:
/// a monitored client that goes silent has its ports reaped once the
/// liveness threshold elapses, and a third party no longer finds them.
#[test]
fn scenario_stale_monitored_client_is_reaped() {
    use shmbroker::discovery::DiscoveryLoop;
    use shmbroker::port_pool::{PortDescriptor, PortKind, PortPool, PortPoolCapacities, PortState, ServiceDescription};
    use shmbroker::process_registry::ProcessRegistry;
    use std::sync::atomic::AtomicBool;
    use std::sync::Arc;

    let registry = Arc::new(ProcessRegistry::new());
    let pool = Arc::new(PortPool::new(PortPoolCapacities::default()));
    registry.register("clientA", 99, 1000, true, 0).unwrap();
    pool.create(
        PortKind::Publisher,
        PortDescriptor {
            unique_id: 1,
            service: ServiceDescription { service: "svc".into(), instance: "inst".into(), event: "evt".into() },
            owning_process: "clientA".into(),
            interface: "internal".into(),
            state: PortState::Offered,
        },
    )
    .unwrap();

    // Zero liveness threshold: any elapsed time counts as stale.
    let shutdown = Arc::new(AtomicBool::new(false));
    let discovery = DiscoveryLoop::new(registry.clone(), pool.clone(), Duration::from_secs(1), Duration::from_secs(0), shutdown);
    discovery.run_cycle();
    // A reaped port is marked ToBeDestroyed on the cycle that notices the
    // stale heartbeat, then actually removed on the following advance.
    discovery.run_cycle();

    assert!(!registry.is_registered("clientA"));
    assert!(pool.find_service("svc", "inst").is_empty());
}

/// Scenario 5: two daemons cannot share a domain id, but distinct domain
/// ids are fully independent.
#[test]
fn scenario_domain_lock_collision_and_isolation() {
    let prefix = std::env::temp_dir().join(format!("shmbroker-domainlock-test-{}", std::process::id()));
    let config = Config::default_single_segment(7, "shmbroker");

    let first = RoudiMemoryManager::new(&config, prefix.to_str().unwrap(), true).expect("first daemon on domain 7 acquires the lock");

    let second = RoudiMemoryManager::new(&config, prefix.to_str().unwrap(), true);
    assert!(matches!(second, Err(EnvironmentError::FileLockHeld)));

    let other_domain_config = Config::default_single_segment(8, "shmbroker");
    let third = RoudiMemoryManager::new(&other_domain_config, prefix.to_str().unwrap(), true);
    assert!(third.is_ok(), "a different domain id must not contend for the same lock");

    drop(first);
    drop(third);
    // Releasing the first daemon's lock lets a fresh one bind domain 7 again.
    let fourth = RoudiMemoryManager::new(&config, prefix.to_str().unwrap(), true);
    assert!(fourth.is_ok());
}

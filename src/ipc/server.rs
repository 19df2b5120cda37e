//! Connection-oriented Command Channel server: one accept loop, one
//! dispatch per connection, commands handled in FIFO order per socket
//! (§4.11, §5).

use std::io::{BufRead, BufReader, Write};
use std::os::unix::net::{UnixListener, UnixStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use super::protocol::{parse_record, Command, Reply};
use crate::daemon::DaemonState;
use crate::port_pool::{PortDescriptor, PortKind, PortState, ServiceDescription};

pub struct IpcServer {
    listener: UnixListener,
    path: std::path::PathBuf,
}

impl IpcServer {
    pub fn bind(path: impl Into<std::path::PathBuf>) -> std::io::Result<Self> {
        let path = path.into();
        if path.exists() {
            std::fs::remove_file(&path)?;
        }
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let listener = UnixListener::bind(&path)?;
        Ok(IpcServer { listener, path })
    }

    pub fn path(&self) -> &std::path::Path {
        &self.path
    }

    /// Accepts connections until `shutdown` is set; each connection is
    /// handled on its own thread so one slow client cannot stall another.
    pub fn run(&self, state: Arc<DaemonState>, shutdown: Arc<AtomicBool>) {
        self.listener
            .set_nonblocking(true)
            .expect("unix listener supports nonblocking mode");
        while !shutdown.load(Ordering::Acquire) {
            match self.listener.accept() {
                Ok((stream, _addr)) => {
                    let state = state.clone();
                    let shutdown = shutdown.clone();
                    std::thread::spawn(move || handle_connection(stream, state, shutdown));
                }
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                    std::thread::sleep(std::time::Duration::from_millis(20));
                }
                Err(e) => {
                    log::error!("accept failed: {e}");
                    break;
                }
            }
        }
    }
}

impl Drop for IpcServer {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(&self.path);
    }
}

fn handle_connection(stream: UnixStream, state: Arc<DaemonState>, shutdown: Arc<AtomicBool>) {
    let mut writer = match stream.try_clone() {
        Ok(s) => s,
        Err(e) => {
            log::error!("failed to clone client stream: {e}");
            return;
        }
    };
    let mut reader = BufReader::new(stream);
    let mut line = Vec::new();
    loop {
        line.clear();
        let n = match reader.read_until(b'\n', &mut line) {
            Ok(n) => n,
            Err(e) => {
                log::warn!("client read error: {e}");
                return;
            }
        };
        if n == 0 {
            return; // client closed the connection
        }
        if line.last() == Some(&b'\n') {
            line.pop();
        }
        let reply = match parse_record(&line) {
            Ok(command) => {
                if matches!(command, Command::Termination) {
                    shutdown.store(true, Ordering::Release);
                }
                dispatch(&command, &state)
            }
            Err(e) => Reply::Err { reason: e.to_string() },
        };
        let encoded = reply.encode();
        if !encoded.is_empty() && writer.write_all(&encoded).is_err() {
            return;
        }
    }
}

fn dispatch(command: &Command, state: &DaemonState) -> Reply {
    match command {
        Command::Register { name, pid, uid, version_info, .. } => {
            if state.compatibility_mismatch(version_info) {
                let err = crate::error::CompatibilityError::VersionMismatch {
                    client: version_info.clone(),
                    daemon: env!("CARGO_PKG_VERSION").to_string(),
                    level: state.compatibility,
                };
                return Reply::RegErr { reason: err.to_string() };
            }
            let segment_id = state.segment_manager.segments().first().map(|s| s.segment_id).unwrap_or(crate::pointer_repo::NULL_ID);
            match state.process_registry.register(name, *pid, *uid, state.monitoring_enabled, segment_id) {
                Ok(session_id) => Reply::RegAck { session_id, segment_id },
                Err(e) => Reply::RegErr { reason: e.to_string() },
            }
        }
        Command::CreatePublisher { service, instance, event, node, .. }
        | Command::CreateSubscriber { service, instance, event, node, .. }
        | Command::CreateServer { service, instance, event, node, .. }
        | Command::CreateClient { service, instance, event, node, .. } => {
            let kind = match command {
                Command::CreatePublisher { .. } => PortKind::Publisher,
                Command::CreateSubscriber { .. } => PortKind::Subscriber,
                Command::CreateServer { .. } => PortKind::Server,
                _ => PortKind::Client,
            };
            let descriptor = PortDescriptor {
                unique_id: state.unique_port_ids.allocate(),
                service: ServiceDescription { service: service.clone(), instance: instance.clone(), event: event.clone() },
                owning_process: node.clone(),
                interface: "internal".into(),
                state: PortState::Initial,
            };
            match state.port_pool.create(kind, descriptor) {
                Ok(handle) => {
                    let relptr = state.port_relptr(handle);
                    Reply::Ack { fields: vec![relptr.id().to_string(), relptr.offset().to_string()] }
                }
                Err(e) => Reply::Err { reason: e.to_string() },
            }
        }
        Command::CreateConditionVariable
        | Command::CreateInterface
        | Command::CreateApplication
        | Command::CreateNode => Reply::Ack { fields: vec![] },
        Command::FindService { service, instance } => {
            let found = state.port_pool.find_service(service, instance);
            let mut fields = vec![found.len().to_string()];
            for svc in found {
                fields.push(svc.service);
                fields.push(svc.instance);
                fields.push(svc.event);
            }
            Reply::Ack { fields }
        }
        Command::Keepalive { name } => {
            let _ = state.process_registry.heartbeat(name);
            Reply::None
        }
        Command::Deregister { name } => {
            for handle in state.port_pool.ports_owned_by(name) {
                state.port_pool.with_port(handle, |p| p.request_destroy());
            }
            match state.process_registry.deregister(name) {
                Ok(()) => Reply::Ack { fields: vec![] },
                Err(e) => Reply::Err { reason: e.to_string() },
            }
        }
        Command::Termination => Reply::Ack { fields: vec![] },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::daemon::DaemonState;
    use crate::port_pool::PortPoolCapacities;
    use crate::process_registry::ProcessRegistry;
    use crate::segment_manager::SegmentManager;
    use std::io::Read;
    use std::sync::atomic::AtomicBool;

    fn test_state() -> Arc<DaemonState> {
        let mut bump = crate::bump::BumpAllocator::new(0x20000, 1 << 20);
        let configs = vec![crate::segment_manager::SegmentConfig {
            reader_group: "g".into(),
            writer_group: "g".into(),
            pools: vec![crate::memory_manager::MemPoolConfig { chunk_size: 128, chunk_count: 10 }],
        }];
        let segment_manager = SegmentManager::construct_in(&mut bump, &configs, &[0]).unwrap();
        Arc::new(DaemonState {
            process_registry: Arc::new(ProcessRegistry::new()),
            port_pool: Arc::new(crate::port_pool::PortPool::new(PortPoolCapacities::default())),
            segment_manager: Arc::new(segment_manager),
            unique_port_ids: Arc::new(crate::unique_port_id::UniquePortIdAllocator::new(0)),
            discovery: crate::discovery::DiscoveryLoop::new(
                Arc::new(ProcessRegistry::new()),
                Arc::new(crate::port_pool::PortPool::new(PortPoolCapacities::default())),
                std::time::Duration::from_secs(1),
                std::time::Duration::from_secs(30),
                Arc::new(AtomicBool::new(false)),
            )
            .handle(),
            monitoring_enabled: true,
            compatibility: crate::cli::CompatibilityLevel::Off,
            management_base: 0,
            management_segment_id: 0,
        })
    }

    #[test]
    fn register_then_find_service_over_a_real_socket() {
        let dir = std::env::temp_dir().join(format!("shmbroker-test-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let socket_path = dir.join("iceoryx_roudi");
        let server = IpcServer::bind(&socket_path).unwrap();
        let state = test_state();
        let shutdown = Arc::new(AtomicBool::new(false));

        let server_state = state.clone();
        let server_shutdown = shutdown.clone();
        let join = std::thread::spawn(move || server.run(server_state, server_shutdown));

        std::thread::sleep(std::time::Duration::from_millis(50));
        let mut client = UnixStream::connect(&socket_path).unwrap();
        client
            .write_all(&super::super::protocol::encode_record(&[
                "REG".into(),
                "appA".into(),
                "111".into(),
                "1000".into(),
                "0".into(),
                "1.0".into(),
            ]))
            .unwrap();

        let mut buf = [0u8; 256];
        let n = client.read(&mut buf).unwrap();
        let response = String::from_utf8_lossy(&buf[..n]);
        assert!(response.starts_with("REG_ACK"));

        shutdown.store(true, Ordering::Release);
        drop(client);
        join.join().unwrap();
    }

    #[test]
    fn duplicate_register_is_rejected() {
        let state = test_state();
        let reg = Command::Register { name: "appA".into(), pid: 1, uid: 1000, session_hint: 0, version_info: "v".into() };
        assert!(matches!(dispatch(&reg, &state), Reply::RegAck { .. }));
        assert!(matches!(dispatch(&reg, &state), Reply::RegErr { .. }));
    }

    #[test]
    fn create_publisher_then_find_service_reflects_it() {
        let state = test_state();
        let reg = Command::Register { name: "appA".into(), pid: 1, uid: 1000, session_hint: 0, version_info: "v".into() };
        dispatch(&reg, &state);
        let create = Command::CreatePublisher {
            service: "svc".into(),
            instance: "inst".into(),
            event: "evt".into(),
            history_capacity: 1,
            node: "appA".into(),
            port_config: String::new(),
        };
        assert!(matches!(dispatch(&create, &state), Reply::Ack { .. }));
        let find = Command::FindService { service: "svc".into(), instance: "inst".into() };
        match dispatch(&find, &state) {
            Reply::Ack { fields } => assert_eq!(fields[0], "1"),
            other => panic!("unexpected reply: {other:?}"),
        }
    }
}

//! Wires every module together: CLI/config, logging, the Pointer
//! Repository, Unique Port ID allocator, Roudi Memory Manager, Process
//! Registry, Port Pool, IPC server and Discovery loop; installs signal
//! handling and drives shutdown (§4.12).

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crate::cli::{Cli, CompatibilityLevel};
use crate::config::Config;
use crate::discovery::{DiscoveryHandle, DiscoveryLoop};
use crate::error::EnvironmentError;
use crate::ipc::IpcServer;
use crate::port_pool::PortPool;
use crate::process_registry::ProcessRegistry;
use crate::roudi_memory_manager::RoudiMemoryManager;
use crate::segment_manager::SegmentManager;
use crate::unique_port_id::UniquePortIdAllocator;

/// Everything a connection-handling thread needs to answer a command,
/// shared read-only (interior-mutable where each piece already is) across
/// every client thread.
pub struct DaemonState {
    pub process_registry: Arc<ProcessRegistry>,
    pub port_pool: Arc<PortPool>,
    pub segment_manager: Arc<SegmentManager>,
    pub unique_port_ids: Arc<UniquePortIdAllocator>,
    pub discovery: DiscoveryHandle,
    pub monitoring_enabled: bool,
    pub compatibility: CompatibilityLevel,
    /// Base address and Pointer Repository id of the management region
    /// `port_pool` was placed in, needed to turn a port handle into a
    /// [`crate::relptr::RelPtr`] another process can resolve.
    pub management_base: usize,
    pub management_segment_id: u64,
}

impl DaemonState {
    /// The relative pointer a client's `CREATE_*` reply carries for the
    /// port it was just handed (§4.11).
    pub fn port_relptr(&self, handle: crate::port_pool::PortHandle) -> crate::relptr::RelPtr {
        let offset = self.port_pool.slot_address(handle) - self.management_base;
        crate::relptr::RelPtr::from_parts(self.management_segment_id, offset as u64)
    }

    pub fn compatibility_mismatch(&self, client_version: &str) -> bool {
        let daemon_version = env!("CARGO_PKG_VERSION");
        match self.compatibility {
            CompatibilityLevel::Off => false,
            CompatibilityLevel::Major => Self::segment(client_version, 1) != Self::segment(daemon_version, 1),
            CompatibilityLevel::Minor => Self::segment(client_version, 2) != Self::segment(daemon_version, 2),
            CompatibilityLevel::Patch => client_version != daemon_version,
            // Neither is recoverable from a plain semver string; treated as
            // always-compatible until a richer version descriptor exists.
            CompatibilityLevel::CommitId | CompatibilityLevel::BuildDate => false,
        }
    }

    fn segment(version: &str, take: usize) -> Vec<&str> {
        version.splitn(take + 1, '.').take(take).collect()
    }
}

pub const DEFAULT_RESOURCE_PREFIX: &str = "/tmp/shmbroker";
pub const DEFAULT_LIVENESS_THRESHOLD: Duration = Duration::from_secs(10);

/// Everything needed to run the daemon to completion: constructed by
/// `main`, `run()` blocks until shutdown is requested.
pub struct Daemon {
    roudi: RoudiMemoryManager,
    state: Arc<DaemonState>,
    ipc: Arc<IpcServer>,
    discovery_loop: DiscoveryLoop,
    shutdown: Arc<AtomicBool>,
    termination_delay: Duration,
    kill_delay: Duration,
}

impl Daemon {
    pub fn bootstrap(cli: &Cli, config: &Config, use_posix_shm: bool) -> Result<Self, EnvironmentError> {
        let mut roudi = RoudiMemoryManager::new(config, DEFAULT_RESOURCE_PREFIX, use_posix_shm)?;
        roudi
            .create_and_announce()
            .map_err(|e| EnvironmentError::Io(format!("failed to create shared memory: {e}")))?;

        let port_pool = roudi.port_pool().expect("port pool block was announced");
        let segment_manager = roudi.segment_manager().expect("segment manager block was announced");
        let process_registry = Arc::new(ProcessRegistry::new());
        let unique_port_ids = Arc::new(UniquePortIdAllocator::new(cli.unique_roudi_id.unwrap_or(cli.domain_id)));
        let shutdown = Arc::new(AtomicBool::new(false));

        let discovery_loop = DiscoveryLoop::new(
            process_registry.clone(),
            port_pool.clone(),
            crate::discovery::DEFAULT_DISCOVERY_PERIOD,
            DEFAULT_LIVENESS_THRESHOLD,
            shutdown.clone(),
        )
        .with_introspection_address(roudi.introspection_address());

        let monitoring_enabled = matches!(cli.monitoring_mode, crate::cli::MonitoringMode::On);
        let management_base = roudi.management().base().expect("management region is created by create_and_announce");
        let management_segment_id = roudi
            .management()
            .segment_id()
            .expect("management region is registered by create_and_announce");
        let state = Arc::new(DaemonState {
            process_registry,
            port_pool,
            segment_manager,
            unique_port_ids,
            discovery: discovery_loop.handle(),
            monitoring_enabled,
            compatibility: cli.compatibility,
            management_base,
            management_segment_id,
        });

        let socket_path = std::path::PathBuf::from(DEFAULT_RESOURCE_PREFIX)
            .join(cli.domain_id.to_string())
            .join("iceoryx_roudi");
        let ipc = Arc::new(
            IpcServer::bind(&socket_path)
                .map_err(|e| EnvironmentError::Io(format!("failed to bind command socket: {e}")))?,
        );

        Ok(Daemon {
            roudi,
            state,
            ipc,
            discovery_loop,
            shutdown,
            termination_delay: Duration::from_secs(u64::from(cli.termination_delay_seconds)),
            kill_delay: Duration::from_secs(u64::from(cli.kill_delay_seconds)),
        })
    }

    /// Spawns the discovery and command-dispatch threads, installs a
    /// Ctrl-C handler, and blocks until shutdown. Once shutdown is observed,
    /// escalates SIGTERM then SIGKILL to every still-registered client
    /// process, each after its configured delay (§5 Cancellation).
    pub fn run(mut self) -> Result<(), EnvironmentError> {
        let discovery_thread = std::thread::spawn(move || self.discovery_loop.run());

        let ipc = self.ipc.clone();
        let ipc_state = self.state.clone();
        let ipc_shutdown = self.shutdown.clone();
        let ipc_thread = std::thread::spawn(move || ipc.run(ipc_state, ipc_shutdown));

        let ctrlc_shutdown = self.shutdown.clone();
        ctrlc::set_handler(move || {
            log::info!("received shutdown signal");
            ctrlc_shutdown.store(true, Ordering::Release);
        })
        .ok();

        while !self.shutdown.load(Ordering::Acquire) {
            std::thread::sleep(Duration::from_millis(50));
        }

        std::thread::sleep(self.termination_delay);
        for pid in self.state.process_registry.registered_pids() {
            log::info!("sending SIGTERM to registered process pid {pid}");
            // SAFETY: `pid` is a plain signal target; `kill` is sound for
            // any pid value, including ones that have already exited.
            unsafe {
                libc::kill(pid as libc::pid_t, libc::SIGTERM);
            }
        }

        std::thread::sleep(self.kill_delay);
        for pid in self.state.process_registry.registered_pids() {
            log::info!("sending SIGKILL to registered process pid {pid}");
            // SAFETY: see above.
            unsafe {
                libc::kill(pid as libc::pid_t, libc::SIGKILL);
            }
        }

        ipc_thread.join().ok();
        discovery_thread.join().ok();

        self.roudi
            .destroy()
            .map_err(|e| EnvironmentError::Io(format!("failed to tear down shared memory: {e}")))?;
        Ok(())
    }
}

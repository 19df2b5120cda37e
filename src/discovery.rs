//! Periodic maintenance cycle: reaps dead processes, advances every port's
//! state machine, and answers `trigger_and_wait_finish` callers (§4.10).

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::time::Duration;

use crate::memory_block::IntrospectionSample;
use crate::port_pool::PortPool;
use crate::process_registry::ProcessRegistry;

pub const DEFAULT_DISCOVERY_PERIOD: Duration = Duration::from_millis(100);

/// Shared trigger/ack rendezvous: `trigger_and_wait_finish` bumps
/// `requested`, then blocks on the condvar until `completed` catches up to
/// (at least) the cycle count observed at request time.
struct Trigger {
    state: Mutex<u64>,
    condvar: Condvar,
}

pub struct DiscoveryLoop {
    process_registry: Arc<ProcessRegistry>,
    port_pool: Arc<PortPool>,
    period: Duration,
    liveness_threshold: Duration,
    shutdown: Arc<AtomicBool>,
    cycles_completed: Arc<AtomicU64>,
    trigger: Arc<Trigger>,
    introspection_address: Option<usize>,
}

impl DiscoveryLoop {
    pub fn new(
        process_registry: Arc<ProcessRegistry>,
        port_pool: Arc<PortPool>,
        period: Duration,
        liveness_threshold: Duration,
        shutdown: Arc<AtomicBool>,
    ) -> Self {
        DiscoveryLoop {
            process_registry,
            port_pool,
            period,
            liveness_threshold,
            shutdown,
            cycles_completed: Arc::new(AtomicU64::new(0)),
            trigger: Arc::new(Trigger { state: Mutex::new(0), condvar: Condvar::new() }),
            introspection_address: None,
        }
    }

    /// Publishes a fresh introspection sample into the management region's
    /// `IntrospectionSample` slot at the end of every cycle (§4.10 step 4).
    pub fn with_introspection_address(mut self, address: Option<usize>) -> Self {
        self.introspection_address = address;
        self
    }

    pub fn handle(&self) -> DiscoveryHandle {
        DiscoveryHandle {
            cycles_completed: self.cycles_completed.clone(),
            trigger: self.trigger.clone(),
        }
    }

    /// Runs until `shutdown` is observed; intended to be spawned as its own
    /// OS thread. Blocks on a condvar with a timeout equal to the discovery
    /// period, matching §5's "timed semaphore" description, and wakes
    /// early whenever `trigger_and_wait_finish` bumps the request counter.
    pub fn run(&self) {
        while !self.shutdown.load(Ordering::Acquire) {
            let guard = self.trigger.state.lock().unwrap();
            let _ = self.trigger.condvar.wait_timeout(guard, self.period).unwrap();
            if self.shutdown.load(Ordering::Acquire) {
                break;
            }
            self.run_cycle();
        }
    }

    pub fn run_cycle(&self) {
        for name in self.process_registry.reap_stale(self.liveness_threshold) {
            log::info!("reaping stale process '{name}'");
            for handle in self.port_pool.ports_owned_by(&name) {
                self.port_pool.with_port(handle, |p| p.request_destroy());
            }
            let _ = self.process_registry.deregister(&name);
        }

        self.port_pool.advance_all();

        let completed = self.cycles_completed.fetch_add(1, Ordering::AcqRel) + 1;

        if let Some(addr) = self.introspection_address {
            // SAFETY: `addr` was handed to us by `RoudiMemoryManager` as the
            // address of an `IntrospectionSample` it placed in the
            // management region; the Discovery loop is its sole writer.
            unsafe {
                (addr as *mut IntrospectionSample).write(IntrospectionSample(completed));
            }
        }

        let mut state = self.trigger.state.lock().unwrap();
        *state = completed;
        self.trigger.condvar.notify_all();
    }
}

/// A cloneable, thread-safe way for the IPC dispatch thread to request and
/// wait on a discovery cycle without holding a reference to the loop
/// itself.
#[derive(Clone)]
pub struct DiscoveryHandle {
    cycles_completed: Arc<AtomicU64>,
    trigger: Arc<Trigger>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TriggerOutcome {
    Completed,
    TimedOut,
}

impl DiscoveryHandle {
    /// Returns `Completed` once a cycle that began strictly after this call
    /// was issued has run to completion, or `TimedOut` after `timeout`.
    pub fn trigger_and_wait_finish(&self, timeout: Duration) -> TriggerOutcome {
        let target = self.cycles_completed.load(Ordering::Acquire) + 1;
        self.trigger.condvar.notify_all();
        let guard = self.trigger.state.lock().unwrap();
        let (guard, timeout_result) = self
            .trigger
            .condvar
            .wait_timeout_while(guard, timeout, |&mut completed| completed < target)
            .unwrap();
        drop(guard);
        if timeout_result.timed_out() {
            TriggerOutcome::TimedOut
        } else {
            TriggerOutcome::Completed
        }
    }
}

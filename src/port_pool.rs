//! Bounded arenas of publisher/subscriber/server/client/interface/
//! application/condition-variable port descriptors living inside the
//! management shm.
//!
//! Each arena hands out slots via the same lock-free index free-list used
//! by [`crate::mempool::MemPool`] (acquire/release never take a lock); the
//! payload inside an acquired slot is guarded by a short-lived per-slot
//! mutex, since unlike a `MemPool` chunk a port descriptor is read and
//! mutated in place by the discovery loop while it is held.

use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Mutex;

use crate::error::MemoryError;

const NULL_INDEX: u32 = u32::MAX;

fn pack(generation: u32, index: u32) -> u64 {
    ((generation as u64) << 32) | index as u64
}
fn unpack_index(word: u64) -> u32 {
    (word & 0xFFFF_FFFF) as u32
}
fn unpack_generation(word: u64) -> u32 {
    (word >> 32) as u32
}

struct Arena<T> {
    slots: Vec<Mutex<Option<T>>>,
    next: Vec<AtomicU32>,
    head: AtomicU64,
    /// Address this arena's slots are addressable at from other processes,
    /// e.g. inside the management region a [`crate::memory_block::PortPoolBlock`]
    /// was placed at; `0` for arenas that never leave this process (most
    /// test-constructed pools).
    base: usize,
}

impl<T> Arena<T> {
    fn new(capacity: usize) -> Self {
        let next: Vec<AtomicU32> = (0..capacity)
            .map(|i| AtomicU32::new(if i + 1 == capacity { NULL_INDEX } else { (i + 1) as u32 }))
            .collect();
        Arena {
            slots: (0..capacity).map(|_| Mutex::new(None)).collect(),
            next,
            head: AtomicU64::new(if capacity == 0 { pack(0, NULL_INDEX) } else { pack(0, 0) }),
            base: 0,
        }
    }

    fn new_at(capacity: usize, base: usize) -> Self {
        let mut arena = Arena::new(capacity);
        arena.base = base;
        arena
    }

    fn capacity(&self) -> usize {
        self.slots.len()
    }

    /// The address slot `idx` is reachable at, relative to wherever this
    /// arena's region was mapped.
    fn slot_address(&self, idx: u32) -> usize {
        self.base + idx as usize * std::mem::size_of::<T>()
    }

    /// Claims a free slot and stores `value` in it; `None` if the arena is
    /// full.
    fn insert(&self, value: T) -> Option<u32> {
        loop {
            let old = self.head.load(Ordering::Acquire);
            let idx = unpack_index(old);
            if idx == NULL_INDEX {
                return None;
            }
            let succ = self.next[idx as usize].load(Ordering::Relaxed);
            let new = pack(unpack_generation(old).wrapping_add(1), succ);
            if self
                .head
                .compare_exchange_weak(old, new, Ordering::AcqRel, Ordering::Relaxed)
                .is_ok()
            {
                *self.slots[idx as usize].lock().unwrap() = Some(value);
                return Some(idx);
            }
        }
    }

    fn remove(&self, idx: u32) -> Option<T> {
        let taken = self.slots[idx as usize].lock().unwrap().take();
        if taken.is_some() {
            loop {
                let old = self.head.load(Ordering::Acquire);
                self.next[idx as usize].store(unpack_index(old), Ordering::Relaxed);
                let new = pack(unpack_generation(old).wrapping_add(1), idx);
                if self
                    .head
                    .compare_exchange_weak(old, new, Ordering::AcqRel, Ordering::Relaxed)
                    .is_ok()
                {
                    break;
                }
            }
        }
        taken
    }

    fn with<R>(&self, idx: u32, f: impl FnOnce(&mut T) -> R) -> Option<R> {
        self.slots.get(idx as usize)?.lock().unwrap().as_mut().map(f)
    }

    fn for_each(&self, mut f: impl FnMut(u32, &mut T)) {
        for (i, slot) in self.slots.iter().enumerate() {
            if let Some(v) = slot.lock().unwrap().as_mut() {
                f(i as u32, v);
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PortKind {
    Publisher,
    Subscriber,
    Server,
    Client,
    Interface,
    Application,
    ConditionVariable,
}

/// Stages of the discovery loop's port state machine (§4.10).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PortState {
    Initial,
    Offered,
    Subscribed,
    NotSubscribed,
    ToBeDestroyed,
    Removed,
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ServiceDescription {
    pub service: String,
    pub instance: String,
    pub event: String,
}

#[derive(Debug, Clone)]
pub struct PortDescriptor {
    pub unique_id: u64,
    pub service: ServiceDescription,
    pub owning_process: String,
    pub interface: String,
    pub state: PortState,
}

impl PortDescriptor {
    /// One step of the discovery loop's per-port advancement.
    pub fn advance(&mut self) {
        self.state = match self.state {
            PortState::Initial => PortState::Offered,
            PortState::Offered => PortState::Subscribed,
            PortState::Subscribed => PortState::Subscribed,
            PortState::NotSubscribed => PortState::NotSubscribed,
            PortState::ToBeDestroyed => PortState::Removed,
            PortState::Removed => PortState::Removed,
        };
    }

    pub fn request_unsubscribe(&mut self) {
        self.state = PortState::NotSubscribed;
    }

    pub fn request_destroy(&mut self) {
        self.state = PortState::ToBeDestroyed;
    }
}

#[derive(Debug, Clone, Copy)]
pub struct PortPoolCapacities {
    pub publishers: usize,
    pub subscribers: usize,
    pub servers: usize,
    pub clients: usize,
    pub interfaces: usize,
    pub applications: usize,
    pub condition_variables: usize,
}

impl Default for PortPoolCapacities {
    fn default() -> Self {
        PortPoolCapacities {
            publishers: 256,
            subscribers: 256,
            servers: 64,
            clients: 64,
            interfaces: 64,
            applications: 64,
            condition_variables: 64,
        }
    }
}

impl PortPoolCapacities {
    pub fn total(&self) -> usize {
        self.publishers
            + self.subscribers
            + self.servers
            + self.clients
            + self.interfaces
            + self.applications
            + self.condition_variables
    }

    pub fn total_arena_bytes(&self) -> usize {
        self.total() * std::mem::size_of::<PortDescriptor>()
    }
}

/// An opaque handle identifying one slot in one of the arenas.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PortHandle {
    pub kind: PortKind,
    pub index: u32,
}

pub struct PortPool {
    publishers: Arena<PortDescriptor>,
    subscribers: Arena<PortDescriptor>,
    servers: Arena<PortDescriptor>,
    clients: Arena<PortDescriptor>,
    interfaces: Arena<PortDescriptor>,
    applications: Arena<PortDescriptor>,
    condition_variables: Arena<PortDescriptor>,
}

impl PortPool {
    pub fn new(capacities: PortPoolCapacities) -> Self {
        PortPool {
            publishers: Arena::new(capacities.publishers),
            subscribers: Arena::new(capacities.subscribers),
            servers: Arena::new(capacities.servers),
            clients: Arena::new(capacities.clients),
            interfaces: Arena::new(capacities.interfaces),
            applications: Arena::new(capacities.applications),
            condition_variables: Arena::new(capacities.condition_variables),
        }
    }

    /// Like [`PortPool::new`], but reserves each kind's arena a stable
    /// address out of `bump`, so handles into it resolve to a real address
    /// inside the shared region the pool was placed in
    /// ([`crate::memory_block::PortPoolBlock::on_memory_available`]).
    pub fn construct_in(bump: &mut crate::bump::BumpAllocator, capacities: PortPoolCapacities) -> Result<Self, MemoryError> {
        fn arena_at<T>(bump: &mut crate::bump::BumpAllocator, capacity: usize) -> Result<Arena<T>, MemoryError> {
            let bytes = capacity * std::mem::size_of::<T>();
            let base = if bytes == 0 {
                bump.base() + bump.used()
            } else {
                bump.allocate(bytes, std::mem::align_of::<T>())?
            };
            Ok(Arena::new_at(capacity, base))
        }
        Ok(PortPool {
            publishers: arena_at(bump, capacities.publishers)?,
            subscribers: arena_at(bump, capacities.subscribers)?,
            servers: arena_at(bump, capacities.servers)?,
            clients: arena_at(bump, capacities.clients)?,
            interfaces: arena_at(bump, capacities.interfaces)?,
            applications: arena_at(bump, capacities.applications)?,
            condition_variables: arena_at(bump, capacities.condition_variables)?,
        })
    }

    /// The address `handle` is reachable at inside whatever region this
    /// pool's arenas were placed in; `0` if the pool was built via `new`.
    pub fn slot_address(&self, handle: PortHandle) -> usize {
        self.arena(handle.kind).slot_address(handle.index)
    }

    fn arena(&self, kind: PortKind) -> &Arena<PortDescriptor> {
        match kind {
            PortKind::Publisher => &self.publishers,
            PortKind::Subscriber => &self.subscribers,
            PortKind::Server => &self.servers,
            PortKind::Client => &self.clients,
            PortKind::Interface => &self.interfaces,
            PortKind::Application => &self.applications,
            PortKind::ConditionVariable => &self.condition_variables,
        }
    }

    pub fn capacity(&self, kind: PortKind) -> usize {
        self.arena(kind).capacity()
    }

    pub fn create(
        &self,
        kind: PortKind,
        descriptor: PortDescriptor,
    ) -> Result<PortHandle, crate::error::ResourceExhaustedError> {
        self.arena(kind)
            .insert(descriptor)
            .map(|index| PortHandle { kind, index })
            .ok_or(crate::error::ResourceExhaustedError::PortArenaExhausted)
    }

    pub fn destroy(&self, handle: PortHandle) -> Option<PortDescriptor> {
        self.arena(handle.kind).remove(handle.index)
    }

    pub fn with_port<R>(&self, handle: PortHandle, f: impl FnOnce(&mut PortDescriptor) -> R) -> Option<R> {
        self.arena(handle.kind).with(handle.index, f)
    }

    /// Every port owned by `process_name`, across every arena.
    pub fn ports_owned_by(&self, process_name: &str) -> Vec<PortHandle> {
        let mut out = Vec::new();
        for kind in [
            PortKind::Publisher,
            PortKind::Subscriber,
            PortKind::Server,
            PortKind::Client,
            PortKind::Interface,
            PortKind::Application,
            PortKind::ConditionVariable,
        ] {
            self.arena(kind).for_each(|idx, port| {
                if port.owning_process == process_name {
                    out.push(PortHandle { kind, index: idx });
                }
            });
        }
        out
    }

    /// Advances every live port one discovery step; ports left in
    /// `Removed` are reaped from their arena.
    pub fn advance_all(&self) {
        for kind in [
            PortKind::Publisher,
            PortKind::Subscriber,
            PortKind::Server,
            PortKind::Client,
            PortKind::Interface,
            PortKind::Application,
            PortKind::ConditionVariable,
        ] {
            let mut removed = Vec::new();
            self.arena(kind).for_each(|idx, port| {
                port.advance();
                if port.state == PortState::Removed {
                    removed.push(idx);
                }
            });
            for idx in removed {
                self.arena(kind).remove(idx);
            }
        }
    }

    pub fn find_service(&self, service: &str, instance: &str) -> Vec<ServiceDescription> {
        let mut out = Vec::new();
        self.publishers.for_each(|_, port| {
            if port.service.service == service && port.service.instance == instance {
                out.push(port.service.clone());
            }
        });
        out
    }
}

//! Self-describing "please place me in the shared region" capabilities.
//!
//! A [`MemoryBlock`] reports the size and alignment it needs, is told the
//! address it was placed at exactly once (`on_memory_available`), and may
//! be asked to tear itself down more than once (`on_destroy`, which must be
//! idempotent). [`crate::memory_provider::MemoryProvider`] walks a list of
//! these to lay out an entire shared-memory region.
//!
//! Rather than a C++-style v-table living inside the shared region itself
//! (the anti-pattern flagged in the design notes), blocks here are plain
//! Rust trait objects that run only in the Daemon's own address space.
//! [`GenericBlock`] placement-writes its `Copy` value directly at the given
//! address. The collection blocks (`MemPoolCollectionBlock`,
//! `SegmentManagerBlock`, `PortPoolBlock`) instead use the address to fix
//! where their own sub-structures (mempool chunks, port slots) are
//! addressable from other processes; the Rust objects that track those
//! structures still live on this process's heap, since they hold owned
//! data (`Vec`, `String`) that cannot itself cross a process boundary.

use std::sync::Arc;

use crate::memory_manager::{MemPoolConfig, MemoryManager};
use crate::port_pool::PortPool;
use crate::segment_manager::{SegmentConfig, SegmentManager};

pub trait MemoryBlock: Send + std::any::Any {
    fn size(&self) -> usize;
    fn alignment(&self) -> usize;
    /// Called exactly once, with the address the block was sub-allocated
    /// at inside the provider's region.
    fn on_memory_available(&mut self, address: usize);
    /// May be called multiple times; must be idempotent.
    fn on_destroy(&mut self);
    /// Lets callers holding `&dyn MemoryBlock`/`&mut dyn MemoryBlock`
    /// recover the concrete block (e.g. to reach `PortPoolBlock::pool()`).
    fn as_any(&self) -> &dyn std::any::Any;
    fn as_any_mut(&mut self) -> &mut dyn std::any::Any;
}

/// Constructs and optionally moves a `T` into the region. The only block
/// that does real placement: `T` must be `Copy` so no destructor needs to
/// run across process boundaries.
pub struct GenericBlock<T: Copy> {
    value: T,
    address: Option<usize>,
}

impl<T: Copy> GenericBlock<T> {
    pub fn new(value: T) -> Self {
        GenericBlock { value, address: None }
    }

    pub fn address(&self) -> Option<usize> {
        self.address
    }
}

impl<T: Copy + Send + 'static> MemoryBlock for GenericBlock<T> {
    fn size(&self) -> usize {
        std::mem::size_of::<T>()
    }

    fn alignment(&self) -> usize {
        std::mem::align_of::<T>()
    }

    fn on_memory_available(&mut self, address: usize) {
        debug_assert_eq!(address % self.alignment(), 0);
        // SAFETY: `address` was sub-allocated by the provider with at
        // least `size()` bytes available and `alignment()` alignment, and
        // this is called exactly once per block.
        unsafe {
            (address as *mut T).write(self.value);
        }
        self.address = Some(address);
    }

    fn on_destroy(&mut self) {
        self.address = None;
    }

    fn as_any(&self) -> &dyn std::any::Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn std::any::Any {
        self
    }
}

/// A bare monotonic counter, published by the Discovery loop on every
/// cycle (§4.10 step 4) so another process mapping the management region
/// can observe that a fresh introspection/heartbeat pass has happened.
/// Newtypes rather than two `GenericBlock<u64>`s so `MemoryProvider::block_as`
/// can tell the introspection slot and the heartbeat slot apart.
#[derive(Clone, Copy, Default)]
pub struct IntrospectionSample(pub u64);

#[derive(Clone, Copy, Default)]
pub struct HeartbeatSample(pub u64);

/// size = sizeof(MemoryManager) [bookkeeping] + required_full_memory_size
/// of its pool config; constructs a `MemoryManager` in place via a bump
/// allocator scoped to the block's own region.
pub struct MemPoolCollectionBlock {
    configs: Vec<MemPoolConfig>,
    manager: Option<Arc<MemoryManager>>,
}

impl MemPoolCollectionBlock {
    pub fn new(configs: Vec<MemPoolConfig>) -> Self {
        MemPoolCollectionBlock { configs, manager: None }
    }

    pub fn manager(&self) -> Option<&MemoryManager> {
        self.manager.as_deref()
    }

    pub fn manager_arc(&self) -> Option<Arc<MemoryManager>> {
        self.manager.clone()
    }
}

impl MemoryBlock for MemPoolCollectionBlock {
    fn size(&self) -> usize {
        std::mem::size_of::<MemoryManager>()
            + crate::memory_manager::required_full_memory_size(&self.configs)
    }

    fn alignment(&self) -> usize {
        crate::mempool::CHUNK_ALIGNMENT
    }

    fn on_memory_available(&mut self, address: usize) {
        let pools_base = address + std::mem::size_of::<MemoryManager>();
        match MemoryManager::construct_in(pools_base, &self.configs) {
            Ok(mgr) => self.manager = Some(Arc::new(mgr)),
            Err(e) => log::error!("failed to construct mempool collection at {address:#x}: {e}"),
        }
    }

    fn on_destroy(&mut self) {
        self.manager = None;
    }

    fn as_any(&self) -> &dyn std::any::Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn std::any::Any {
        self
    }
}

/// size = sizeof(SegmentManager) + sum of per-segment mempool-collection
/// sizes; constructs nested pools for every segment in the config.
pub struct SegmentManagerBlock {
    configs: Vec<SegmentConfig>,
    segment_ids: Vec<u64>,
    manager: Option<Arc<SegmentManager>>,
}

impl SegmentManagerBlock {
    pub fn new(configs: Vec<SegmentConfig>, segment_ids: Vec<u64>) -> Self {
        SegmentManagerBlock {
            configs,
            segment_ids,
            manager: None,
        }
    }

    pub fn manager(&self) -> Option<&SegmentManager> {
        self.manager.as_deref()
    }

    pub fn manager_arc(&self) -> Option<Arc<SegmentManager>> {
        self.manager.clone()
    }
}

impl MemoryBlock for SegmentManagerBlock {
    fn size(&self) -> usize {
        let pools_size: usize = self
            .configs
            .iter()
            .map(|s| {
                crate::memory_manager::normalize_pools(s.pools.clone())
                    .map(|p| crate::memory_manager::required_full_memory_size(&p))
                    .unwrap_or(0)
            })
            .sum();
        std::mem::size_of::<SegmentManager>() + pools_size
    }

    fn alignment(&self) -> usize {
        crate::mempool::CHUNK_ALIGNMENT
    }

    fn on_memory_available(&mut self, address: usize) {
        let pools_base = address + std::mem::size_of::<SegmentManager>();
        let len = self.size() - std::mem::size_of::<SegmentManager>();
        let mut bump = crate::bump::BumpAllocator::new(pools_base, len);
        match SegmentManager::construct_in(&mut bump, &self.configs, &self.segment_ids) {
            Ok(mgr) => self.manager = Some(Arc::new(mgr)),
            Err(e) => log::error!("failed to construct segment manager at {address:#x}: {e}"),
        }
    }

    fn on_destroy(&mut self) {
        self.manager = None;
    }

    fn as_any(&self) -> &dyn std::any::Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn std::any::Any {
        self
    }
}

/// size = sizeof(PortPool) + sum of fixed-capacity arenas per port kind.
pub struct PortPoolBlock {
    capacities: crate::port_pool::PortPoolCapacities,
    pool: Option<Arc<PortPool>>,
}

impl PortPoolBlock {
    pub fn new(capacities: crate::port_pool::PortPoolCapacities) -> Self {
        PortPoolBlock { capacities, pool: None }
    }

    pub fn pool(&self) -> Option<&PortPool> {
        self.pool.as_deref()
    }

    pub fn pool_arc(&self) -> Option<Arc<PortPool>> {
        self.pool.clone()
    }
}

impl MemoryBlock for PortPoolBlock {
    fn size(&self) -> usize {
        std::mem::size_of::<PortPool>() + self.capacities.total_arena_bytes()
    }

    fn alignment(&self) -> usize {
        std::mem::align_of::<crate::port_pool::PortDescriptor>()
    }

    fn on_memory_available(&mut self, address: usize) {
        let pools_base = address + std::mem::size_of::<PortPool>();
        let len = self.size() - std::mem::size_of::<PortPool>();
        let mut bump = crate::bump::BumpAllocator::new(pools_base, len);
        match PortPool::construct_in(&mut bump, self.capacities) {
            Ok(pool) => self.pool = Some(Arc::new(pool)),
            Err(e) => log::error!("failed to construct port pool at {address:#x}: {e}"),
        }
    }

    fn on_destroy(&mut self) {
        self.pool = None;
    }

    fn as_any(&self) -> &dyn std::any::Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn std::any::Any {
        self
    }
}

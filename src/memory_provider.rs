//! Orchestrates a list of [`crate::memory_block::MemoryBlock`]s: totals their
//! sizes, obtains one contiguous backing region, sub-allocates blocks via a
//! [`crate::bump::BumpAllocator`], announces availability, and tears down in
//! reverse.

use crate::bump::BumpAllocator;
use crate::error::{MemoryError, StateError};
use crate::memory_block::MemoryBlock;

/// Memory Blocks list capacity (§3: "capacity ≥ 64").
pub const MAX_MEMORY_BLOCKS: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProviderState {
    Uninitialized,
    Created,
    Announced,
    Destroyed,
}

struct PlacedBlock {
    block: Box<dyn MemoryBlock>,
    offset: usize,
}

/// Backend-specific half of the provider: obtaining and releasing the
/// contiguous region itself.
pub trait MemoryRegion: Send {
    fn create_memory(&mut self, size: usize, alignment: usize) -> Result<usize, MemoryError>;
    fn destroy_memory(&mut self) -> Result<(), MemoryError>;
}

pub struct MemoryProvider<R: MemoryRegion> {
    region: R,
    blocks: Vec<PlacedBlock>,
    state: ProviderState,
    base: Option<usize>,
    segment_id: Option<u64>,
    total_size: usize,
}

impl<R: MemoryRegion> MemoryProvider<R> {
    pub fn new(region: R) -> Self {
        MemoryProvider {
            region,
            blocks: Vec::new(),
            state: ProviderState::Uninitialized,
            base: None,
            segment_id: None,
            total_size: 0,
        }
    }

    pub fn state(&self) -> ProviderState {
        self.state
    }

    pub fn is_available(&self) -> bool {
        self.state == ProviderState::Announced
    }

    pub fn segment_id(&self) -> Option<u64> {
        self.segment_id
    }

    pub fn add_block(&mut self, block: Box<dyn MemoryBlock>) -> Result<(), StateError> {
        if self.state != ProviderState::Uninitialized {
            return Err(StateError::MemoryAlreadyCreated);
        }
        if self.blocks.len() >= MAX_MEMORY_BLOCKS {
            return Err(crate::error::ResourceExhaustedError::MemoryBlockListExhausted.into());
        }
        self.blocks.push(PlacedBlock { block, offset: 0 });
        Ok(())
    }

    /// Totals block sizes/alignments in insertion order (which also fixes
    /// each block's stable sub-offset), obtains the backing region, and
    /// sub-allocates every block via a scoped bump allocator.
    pub fn create(&mut self) -> Result<(), MemoryError> {
        if self.state != ProviderState::Uninitialized {
            return Err(MemoryError::CreateFailed);
        }
        if self.blocks.is_empty() {
            return Err(MemoryError::CreateFailed);
        }

        let max_alignment = self
            .blocks
            .iter()
            .map(|b| b.block.alignment())
            .max()
            .unwrap_or(1);

        // First pass: compute each block's offset against a zero base so
        // the total size is known before the region is allocated.
        let mut cursor = BumpAllocator::new(0, usize::MAX / 2);
        let mut offsets = Vec::with_capacity(self.blocks.len());
        for placed in &self.blocks {
            let off = cursor.allocate(placed.block.size(), placed.block.alignment())?;
            offsets.push(off);
        }
        let total_size = cursor.used();

        let base = self.region.create_memory(total_size, max_alignment)?;

        let segment_id = crate::pointer_repo::global()
            .register(base, total_size)
            .map_err(|_| MemoryError::CreateFailed)?;

        for (placed, off) in self.blocks.iter_mut().zip(offsets) {
            placed.offset = off;
        }

        self.base = Some(base);
        self.segment_id = Some(segment_id);
        self.total_size = total_size;
        self.state = ProviderState::Created;
        Ok(())
    }

    /// Idempotent: repeated calls after the first have no further effect.
    pub fn announce(&mut self) {
        if self.state == ProviderState::Uninitialized || self.state == ProviderState::Destroyed {
            return;
        }
        if self.state == ProviderState::Announced {
            return;
        }
        let base = self.base.expect("Created implies base is set");
        for placed in &mut self.blocks {
            placed.block.on_memory_available(base + placed.offset);
        }
        self.state = ProviderState::Announced;
    }

    /// Walks blocks in reverse insertion order, unregisters the region from
    /// the Pointer Repository, releases the backing region. Idempotent
    /// after the first successful destroy.
    pub fn destroy(&mut self) -> Result<(), MemoryError> {
        if self.state == ProviderState::Uninitialized || self.state == ProviderState::Destroyed {
            return Ok(());
        }
        for placed in self.blocks.iter_mut().rev() {
            placed.block.on_destroy();
        }
        if let Some(id) = self.segment_id.take() {
            crate::pointer_repo::global().unregister(id);
        }
        self.region.destroy_memory()?;
        self.base = None;
        self.state = ProviderState::Destroyed;
        Ok(())
    }

    pub fn base(&self) -> Option<usize> {
        self.base
    }

    /// Finds the first added block of concrete type `T`, e.g. to reach a
    /// `PortPoolBlock`'s `PortPool` after `announce()`.
    pub fn block_as<T: 'static>(&self) -> Option<&T> {
        self.blocks.iter().find_map(|p| p.block.as_any().downcast_ref::<T>())
    }

    pub fn block_as_mut<T: 'static>(&mut self) -> Option<&mut T> {
        self.blocks.iter_mut().find_map(|p| p.block.as_any_mut().downcast_mut::<T>())
    }
}

impl<R: MemoryRegion> Drop for MemoryProvider<R> {
    fn drop(&mut self) {
        let _ = self.destroy();
    }
}

/// `shm_open` + `ftruncate` + `mmap` region, used by the daemon binary.
pub struct PosixShmMemoryProvider {
    name: String,
    fd: Option<libc::c_int>,
    mapped: Option<(usize, usize)>,
}

impl PosixShmMemoryProvider {
    pub fn new(name: impl Into<String>) -> Self {
        PosixShmMemoryProvider {
            name: name.into(),
            fd: None,
            mapped: None,
        }
    }
}

impl MemoryRegion for PosixShmMemoryProvider {
    fn create_memory(&mut self, size: usize, alignment: usize) -> Result<usize, MemoryError> {
        let page_size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) } as usize;
        if alignment > page_size {
            return Err(MemoryError::AlignmentExceedsPageSize);
        }
        if size == 0 {
            return Err(MemoryError::RequestedZeroSizedMemory);
        }

        let cname = std::ffi::CString::new(self.name.clone()).map_err(|_| MemoryError::CreateFailed)?;
        // SAFETY: `cname` is a valid NUL-terminated C string for the
        // duration of this call.
        let fd = unsafe { libc::shm_open(cname.as_ptr(), libc::O_CREAT | libc::O_RDWR, 0o660) };
        if fd < 0 {
            return Err(MemoryError::CreateFailed);
        }
        // SAFETY: `fd` was just opened above and is owned by this call.
        if unsafe { libc::ftruncate(fd, size as libc::off_t) } != 0 {
            unsafe { libc::close(fd) };
            return Err(MemoryError::AllocationFailed);
        }
        // SAFETY: `fd` refers to a shm object sized to at least `size`
        // bytes by the `ftruncate` call above.
        let addr = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                size,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_SHARED,
                fd,
                0,
            )
        };
        if addr == libc::MAP_FAILED {
            unsafe { libc::close(fd) };
            return Err(MemoryError::MappingFailed);
        }

        self.fd = Some(fd);
        self.mapped = Some((addr as usize, size));
        Ok(addr as usize)
    }

    fn destroy_memory(&mut self) -> Result<(), MemoryError> {
        if let Some((addr, size)) = self.mapped.take() {
            // SAFETY: `addr`/`size` come from the matching `mmap` call above.
            if unsafe { libc::munmap(addr as *mut libc::c_void, size) } != 0 {
                return Err(MemoryError::DestroyFailed);
            }
        }
        if let Some(fd) = self.fd.take() {
            unsafe { libc::close(fd) };
            let cname = std::ffi::CString::new(self.name.clone()).map_err(|_| MemoryError::DestroyFailed)?;
            unsafe { libc::shm_unlink(cname.as_ptr()) };
        }
        Ok(())
    }
}

/// Plain heap allocation, used by unit and integration tests so they do not
/// depend on a real filesystem-backed shm object.
pub struct HeapMemoryProvider {
    layout: Option<std::alloc::Layout>,
    ptr: Option<*mut u8>,
}

impl HeapMemoryProvider {
    pub fn new() -> Self {
        HeapMemoryProvider { layout: None, ptr: None }
    }
}

impl Default for HeapMemoryProvider {
    fn default() -> Self {
        Self::new()
    }
}

// SAFETY: the raw pointer is only ever touched from the thread that owns
// this provider's `MemoryProvider`, and never across the shm boundary.
unsafe impl Send for HeapMemoryProvider {}

impl MemoryRegion for HeapMemoryProvider {
    fn create_memory(&mut self, size: usize, alignment: usize) -> Result<usize, MemoryError> {
        if size == 0 {
            return Err(MemoryError::RequestedZeroSizedMemory);
        }
        let layout = std::alloc::Layout::from_size_align(size, alignment.max(1))
            .map_err(|_| MemoryError::AllocationFailed)?;
        // SAFETY: `layout` has non-zero size, checked above.
        let ptr = unsafe { std::alloc::alloc_zeroed(layout) };
        if ptr.is_null() {
            return Err(MemoryError::OutOfMemory);
        }
        self.layout = Some(layout);
        self.ptr = Some(ptr);
        Ok(ptr as usize)
    }

    fn destroy_memory(&mut self) -> Result<(), MemoryError> {
        if let (Some(ptr), Some(layout)) = (self.ptr.take(), self.layout.take()) {
            // SAFETY: `ptr`/`layout` come from the matching `alloc_zeroed`
            // call above and are only freed once.
            unsafe { std::alloc::dealloc(ptr, layout) };
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory_block::GenericBlock;

    #[test]
    fn lifecycle_create_announce_destroy_is_idempotent() {
        let mut provider = MemoryProvider::new(HeapMemoryProvider::new());
        provider.add_block(Box::new(GenericBlock::new(7u64))).unwrap();
        assert_eq!(provider.state(), ProviderState::Uninitialized);

        provider.create().unwrap();
        assert_eq!(provider.state(), ProviderState::Created);

        provider.announce();
        provider.announce();
        assert!(provider.is_available());

        provider.destroy().unwrap();
        provider.destroy().unwrap();
        assert_eq!(provider.state(), ProviderState::Destroyed);
        assert!(!provider.is_available());
    }

    #[test]
    fn create_without_blocks_fails() {
        let mut provider: MemoryProvider<HeapMemoryProvider> = MemoryProvider::new(HeapMemoryProvider::new());
        assert_eq!(provider.create(), Err(MemoryError::CreateFailed));
    }

    #[test]
    fn add_block_after_create_is_rejected() {
        let mut provider = MemoryProvider::new(HeapMemoryProvider::new());
        provider.add_block(Box::new(GenericBlock::new(1u32))).unwrap();
        provider.create().unwrap();
        assert_eq!(
            provider.add_block(Box::new(GenericBlock::new(2u32))),
            Err(StateError::MemoryAlreadyCreated)
        );
    }

    #[test]
    fn add_block_past_capacity_is_resource_exhausted() {
        let mut provider = MemoryProvider::new(HeapMemoryProvider::new());
        for _ in 0..MAX_MEMORY_BLOCKS {
            provider.add_block(Box::new(GenericBlock::new(0u8))).unwrap();
        }
        assert_eq!(
            provider.add_block(Box::new(GenericBlock::new(0u8))),
            Err(StateError::ResourceExhausted(
                crate::error::ResourceExhaustedError::MemoryBlockListExhausted
            ))
        );
    }

    #[test]
    fn region_is_registered_with_pointer_repository_after_create() {
        let mut provider = MemoryProvider::new(HeapMemoryProvider::new());
        provider.add_block(Box::new(GenericBlock::new(99u64))).unwrap();
        provider.create().unwrap();
        let id = provider.segment_id().unwrap();
        assert!(crate::pointer_repo::global().lookup_base(id).is_some());
        provider.destroy().unwrap();
        assert!(crate::pointer_repo::global().lookup_base(id).is_none());
    }
}

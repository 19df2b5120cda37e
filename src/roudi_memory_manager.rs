//! Aggregates the management-shm [`MemoryProvider`] (port pool,
//! introspection pool, heartbeat pool, segment-manager block) plus one
//! [`MemoryProvider`] per user-data segment, behind a single domain file
//! lock.

use crate::config::Config;
use crate::error::{EnvironmentError, MemoryError};
use crate::memory_block::{
    GenericBlock, HeartbeatSample, IntrospectionSample, MemPoolCollectionBlock, PortPoolBlock, SegmentManagerBlock,
};
use crate::memory_manager::MemPoolConfig;
use crate::memory_provider::{HeapMemoryProvider, MemoryProvider, MemoryRegion, PosixShmMemoryProvider};
use crate::port_pool::PortPoolCapacities;

/// A name-derived, owner-only-permission file lock ensuring at most one
/// Daemon instance runs per domain id (§6). Held for the process lifetime;
/// dropped (and thus released) on shutdown.
pub struct DomainLock {
    file: std::fs::File,
    path: std::path::PathBuf,
}

impl DomainLock {
    pub fn acquire(resource_prefix: &str, domain_id: u16) -> Result<Self, EnvironmentError> {
        let dir = std::path::PathBuf::from(resource_prefix).join(domain_id.to_string());
        std::fs::create_dir_all(&dir)?;
        let path = dir.join("unique-roudi");
        let file = std::fs::OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(&path)?;

        // SAFETY: `file`'s fd is valid for the duration of this call.
        let rc = unsafe { libc::flock(std::os::unix::io::AsRawFd::as_raw_fd(&file), libc::LOCK_EX | libc::LOCK_NB) };
        if rc != 0 {
            return Err(EnvironmentError::FileLockHeld);
        }
        Ok(DomainLock { file, path })
    }

    pub fn path(&self) -> &std::path::Path {
        &self.path
    }
}

/// POSIX shm names must not contain embedded slashes; `resource_prefix` is a
/// filesystem directory (e.g. `/tmp/shmbroker`), so every separator beyond
/// the leading one is folded into an underscore before it is used to build
/// an shm object name.
fn sanitize_for_shm_name(resource_prefix: &str) -> String {
    resource_prefix.trim_start_matches('/').replace('/', "_")
}

impl Drop for DomainLock {
    fn drop(&mut self) {
        // SAFETY: releasing a lock this process holds on its own fd.
        unsafe { libc::flock(std::os::unix::io::AsRawFd::as_raw_fd(&self.file), libc::LOCK_UN) };
    }
}

pub enum Region {
    Posix(PosixShmMemoryProvider),
    Heap(HeapMemoryProvider),
}

impl MemoryRegion for Region {
    fn create_memory(&mut self, size: usize, alignment: usize) -> Result<usize, MemoryError> {
        match self {
            Region::Posix(p) => p.create_memory(size, alignment),
            Region::Heap(h) => h.create_memory(size, alignment),
        }
    }

    fn destroy_memory(&mut self) -> Result<(), MemoryError> {
        match self {
            Region::Posix(p) => p.destroy_memory(),
            Region::Heap(h) => h.destroy_memory(),
        }
    }
}

pub struct RoudiMemoryManager {
    _lock: Option<DomainLock>,
    management: MemoryProvider<Region>,
    segments: Vec<MemoryProvider<Region>>,
    use_posix_shm: bool,
}

impl RoudiMemoryManager {
    /// `use_posix_shm = false` is the test-only path (backed entirely by
    /// [`HeapMemoryProvider`], no file lock, no filesystem footprint).
    pub fn new(config: &Config, resource_prefix: &str, use_posix_shm: bool) -> Result<Self, EnvironmentError> {
        let lock = if use_posix_shm {
            Some(DomainLock::acquire(resource_prefix, config.domain_id)?)
        } else {
            None
        };

        let management_region = if use_posix_shm {
            Region::Posix(PosixShmMemoryProvider::new(format!(
                "/{}_{}_iceoryx_mgmt",
                sanitize_for_shm_name(resource_prefix),
                config.domain_id
            )))
        } else {
            Region::Heap(HeapMemoryProvider::new())
        };
        let mut management = MemoryProvider::new(management_region);

        management
            .add_block(Box::new(PortPoolBlock::new(PortPoolCapacities::default())))
            .map_err(|_| EnvironmentError::Io("management block list exhausted".into()))?;
        management
            .add_block(Box::new(GenericBlock::new(IntrospectionSample::default())))
            .map_err(|_| EnvironmentError::Io("management block list exhausted".into()))?;
        management
            .add_block(Box::new(GenericBlock::new(HeartbeatSample::default())))
            .map_err(|_| EnvironmentError::Io("management block list exhausted".into()))?;
        let segment_manager_configs: Vec<crate::segment_manager::SegmentConfig> = config
            .segments
            .iter()
            .map(|s| crate::segment_manager::SegmentConfig {
                reader_group: s.reader_group.clone(),
                writer_group: s.writer_group.clone(),
                pools: s
                    .pools
                    .iter()
                    .map(|p| MemPoolConfig { chunk_size: p.chunk_size, chunk_count: p.chunk_count })
                    .collect(),
            })
            .collect();
        management
            .add_block(Box::new(SegmentManagerBlock::new(
                segment_manager_configs,
                (0..config.segments.len() as u64).collect(),
            )))
            .map_err(|_| EnvironmentError::Io("management block list exhausted".into()))?;

        let mut segments = Vec::with_capacity(config.segments.len());
        for seg in &config.segments {
            let region = if use_posix_shm {
                Region::Posix(PosixShmMemoryProvider::new(format!(
                    "/{}_{}_{}",
                    sanitize_for_shm_name(resource_prefix),
                    config.domain_id,
                    seg.writer_group
                )))
            } else {
                Region::Heap(HeapMemoryProvider::new())
            };
            let mut provider = MemoryProvider::new(region);
            let pools: Vec<MemPoolConfig> = seg
                .pools
                .iter()
                .map(|p| MemPoolConfig { chunk_size: p.chunk_size, chunk_count: p.chunk_count })
                .collect();
            provider
                .add_block(Box::new(MemPoolCollectionBlock::new(pools)))
                .map_err(|_| EnvironmentError::Io("segment block list exhausted".into()))?;
            segments.push(provider);
        }

        Ok(RoudiMemoryManager {
            _lock: lock,
            management,
            segments,
            use_posix_shm,
        })
    }

    pub fn uses_posix_shm(&self) -> bool {
        self.use_posix_shm
    }

    /// Creates then announces every provider, management segment first.
    pub fn create_and_announce(&mut self) -> Result<(), MemoryError> {
        self.management.create()?;
        self.management.announce();
        for seg in &mut self.segments {
            seg.create()?;
            seg.announce();
        }
        Ok(())
    }

    pub fn management(&self) -> &MemoryProvider<Region> {
        &self.management
    }

    pub fn segment(&self, index: usize) -> Option<&MemoryProvider<Region>> {
        self.segments.get(index)
    }

    pub fn port_pool(&self) -> Option<std::sync::Arc<crate::port_pool::PortPool>> {
        self.management.block_as::<PortPoolBlock>().and_then(|b| b.pool_arc())
    }

    pub fn segment_manager(&self) -> Option<std::sync::Arc<crate::segment_manager::SegmentManager>> {
        self.management.block_as::<SegmentManagerBlock>().and_then(|b| b.manager_arc())
    }

    /// Address of the published introspection counter inside the
    /// management region, for the Discovery loop to write fresh samples
    /// into; `None` until `create_and_announce` has run.
    pub fn introspection_address(&self) -> Option<usize> {
        self.management.block_as::<GenericBlock<IntrospectionSample>>().and_then(|b| b.address())
    }

    /// Reads back the most recently published introspection sample.
    ///
    /// # Safety invariant
    /// Relies on the Discovery loop only ever writing whole `u64` values
    /// through this same address; a torn read is not possible on the
    /// architectures this crate targets since the field is naturally
    /// aligned and machine-word sized.
    pub fn introspection_sample(&self) -> Option<u64> {
        self.introspection_address()
            .map(|addr| unsafe { (addr as *const IntrospectionSample).read() }.0)
    }

    pub fn segment_count(&self) -> usize {
        self.segments.len()
    }

    /// Reverse order: segments first, management last.
    pub fn destroy(&mut self) -> Result<(), MemoryError> {
        for seg in self.segments.iter_mut().rev() {
            seg.destroy()?;
        }
        self.management.destroy()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SegmentConfigEntry;

    fn test_config() -> Config {
        Config {
            version: 1,
            domain_id: 0,
            segments: vec![SegmentConfigEntry {
                reader_group: "grp".into(),
                writer_group: "grp".into(),
                pools: vec![crate::config::MempoolEntry { chunk_size: 128, chunk_count: 10 }],
            }],
        }
    }

    #[test]
    fn create_and_announce_then_destroy_on_heap_backend() {
        let config = test_config();
        let mut mgr = RoudiMemoryManager::new(&config, "/tmp/shmbroker-test", false).unwrap();
        mgr.create_and_announce().unwrap();
        assert_eq!(mgr.segment_count(), 1);
        mgr.destroy().unwrap();
    }

    #[test]
    fn no_file_lock_is_taken_on_the_heap_backend() {
        let config = test_config();
        let mgr = RoudiMemoryManager::new(&config, "/tmp/shmbroker-test2", false).unwrap();
        assert!(!mgr.uses_posix_shm());
    }
}

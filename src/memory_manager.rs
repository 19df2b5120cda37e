//! A `MemoryManager` owns an ordered list of [`MemPool`]s, sorted by
//! ascending chunk size with duplicates collapsed, and routes a
//! variable-size allocation request to the smallest pool that fits.

use crate::error::{ConfigError, MemoryError};
use crate::mempool::{self, MemPool};

/// One `(chunk_size, chunk_count)` entry of a segment's pool configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemPoolConfig {
    pub chunk_size: usize,
    pub chunk_count: usize,
}

/// Validates and de-duplicates a segment's pool configuration, sorting by
/// chunk size ascending. Two configs that round to the same effective
/// chunk size are merged: the smaller declaration loses (matches the
/// "all sizes distinct after de-duplication" invariant).
pub fn normalize_pools(mut configs: Vec<MemPoolConfig>) -> Result<Vec<MemPoolConfig>, ConfigError> {
    if configs.is_empty() {
        return Err(ConfigError::ChunkSizeZero);
    }
    for c in &configs {
        if c.chunk_size == 0 {
            return Err(ConfigError::ChunkSizeZero);
        }
        if c.chunk_count == 0 {
            return Err(ConfigError::InvalidChunkCount);
        }
    }
    configs.sort_by_key(|c| mempool::effective_chunk_size(c.chunk_size));
    let mut out: Vec<MemPoolConfig> = Vec::with_capacity(configs.len());
    for c in configs {
        let eff = mempool::effective_chunk_size(c.chunk_size);
        match out.last_mut() {
            Some(last) if mempool::effective_chunk_size(last.chunk_size) == eff => {
                last.chunk_count += c.chunk_count;
            }
            _ => out.push(c),
        }
    }
    Ok(out)
}

pub fn required_full_memory_size(configs: &[MemPoolConfig]) -> usize {
    configs
        .iter()
        .map(|c| MemPool::required_memory_size(c.chunk_size, c.chunk_count))
        .sum()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GetChunkError {
    NoFittingPool,
    PoolExhausted,
}

/// An ordered, non-empty collection of pools over a single contiguous
/// backing region, constructed once in place by
/// [`crate::memory_block::MemPoolCollectionBlock`].
pub struct MemoryManager {
    pools: Vec<MemPool>,
}

impl MemoryManager {
    /// `base` is the start of the region reserved for all pools; `configs`
    /// must already be normalized (sorted, deduplicated, validated).
    pub fn construct_in(base: usize, configs: &[MemPoolConfig]) -> Result<Self, MemoryError> {
        let mut pools = Vec::with_capacity(configs.len());
        let mut cursor = base;
        for c in configs {
            let pool = MemPool::new(cursor, c.chunk_size, c.chunk_count)
                .map_err(|_| MemoryError::CreateFailed)?;
            cursor += MemPool::required_memory_size(c.chunk_size, c.chunk_count);
            pools.push(pool);
        }
        Ok(MemoryManager { pools })
    }

    pub fn pools(&self) -> &[MemPool] {
        &self.pools
    }

    /// Picks the smallest pool whose chunk capacity is >= `payload_size`
    /// and acquires from it. Deliberately does not fall back to a larger
    /// pool if the chosen one is exhausted, to preserve chunk-size
    /// accounting.
    pub fn get_chunk(&self, payload_size: usize) -> Result<usize, GetChunkError> {
        let idx = self
            .pools
            .partition_point(|p| p.chunk_size() < payload_size);
        let pool = self.pools.get(idx).ok_or(GetChunkError::NoFittingPool)?;
        pool.acquire().ok_or(GetChunkError::PoolExhausted)
    }

    pub fn release_chunk(&self, addr: usize) {
        for pool in &self.pools {
            let end = pool.base() + pool.chunk_size() * pool.chunk_count();
            if addr >= pool.base() && addr < end {
                pool.release(addr);
                return;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn two_segment_config_routes_to_smallest_fitting_pool() {
        let configs = normalize_pools(vec![
            MemPoolConfig { chunk_size: 128, chunk_count: 1000 },
            MemPoolConfig { chunk_size: 1024, chunk_count: 500 },
        ])
        .unwrap();
        let size = required_full_memory_size(&configs);
        let mgr = MemoryManager::construct_in(0x10000, &configs).unwrap();

        let addr = mgr.get_chunk(200).unwrap();
        assert!(addr >= 0x10000 && addr < 0x10000 + size);
        // the 200-byte request cannot have come from the 128-byte pool
        assert!(mgr.pools()[0].chunk_size() < 200);
    }

    #[test]
    fn no_fitting_pool_when_largest_pool_too_small() {
        let configs = normalize_pools(vec![MemPoolConfig { chunk_size: 128, chunk_count: 4 }]).unwrap();
        let mgr = MemoryManager::construct_in(0x10000, &configs).unwrap();
        assert_eq!(mgr.get_chunk(200), Err(GetChunkError::NoFittingPool));
    }

    #[test]
    fn exhaustion_does_not_upgrade_to_a_larger_pool() {
        let configs = normalize_pools(vec![
            MemPoolConfig { chunk_size: 64, chunk_count: 1 },
            MemPoolConfig { chunk_size: 256, chunk_count: 4 },
        ])
        .unwrap();
        let mgr = MemoryManager::construct_in(0x10000, &configs).unwrap();
        mgr.get_chunk(10).unwrap();
        assert_eq!(mgr.get_chunk(10), Err(GetChunkError::PoolExhausted));
    }

    #[test]
    fn duplicate_sizes_are_merged() {
        let configs = normalize_pools(vec![
            MemPoolConfig { chunk_size: 64, chunk_count: 4 },
            MemPoolConfig { chunk_size: 64, chunk_count: 6 },
        ])
        .unwrap();
        assert_eq!(configs.len(), 1);
        assert_eq!(configs[0].chunk_count, 10);
    }
}

//! Fixed-size chunk pool: a lock-free LIFO free list over a contiguous
//! range of equally-sized chunks, plus relaxed-atomic usage counters.
//!
//! The free list is the classic Treiber stack, but instead of linking raw
//! pointers (which would need process-relative encoding to be safe across
//! shared memory) it links *chunk indices*, with the stack head packed as a
//! `(generation, index)` pair in a single `AtomicU64` word to close the ABA
//! window on `acquire`/`release` races.

use std::sync::atomic::{AtomicU32, AtomicU64, AtomicUsize, Ordering};

use crate::error::ConfigError;

/// Every chunk size is rounded up to a multiple of this constant.
pub const CHUNK_ALIGNMENT: usize = 32;

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

fn round_up(size: usize, align: usize) -> usize {
    (size + align - 1) / align * align
}

/// Rounds a requested chunk size up to the minimum chunk size (a machine
/// word) and then to [`CHUNK_ALIGNMENT`]; zero is rejected by the caller,
/// not here.
pub fn effective_chunk_size(requested: usize) -> usize {
    let with_minimum = requested.max(std::mem::size_of::<usize>());
    round_up(with_minimum, CHUNK_ALIGNMENT)
}

pub struct MemPool {
    chunk_size: usize,
    chunk_count: usize,
    base: usize,
    next: Vec<AtomicU32>,
    head: AtomicU64,
    used_chunks: AtomicUsize,
    high_water_mark: AtomicUsize,
}

impl MemPool {
    /// `base` is the address of the first chunk; the caller is responsible
    /// for reserving `chunk_size * chunk_count` bytes there (typically via
    /// a [`crate::bump::BumpAllocator`]).
    pub fn new(base: usize, requested_chunk_size: usize, chunk_count: usize) -> Result<Self, ConfigError> {
        if requested_chunk_size == 0 {
            return Err(ConfigError::ChunkSizeZero);
        }
        if chunk_count == 0 {
            return Err(ConfigError::InvalidChunkCount);
        }
        if chunk_count >= NULL_INDEX as usize {
            return Err(ConfigError::InvalidChunkCount);
        }
        let chunk_size = effective_chunk_size(requested_chunk_size);

        let next: Vec<AtomicU32> = (0..chunk_count)
            .map(|i| {
                let succ = if i + 1 == chunk_count {
                    NULL_INDEX
                } else {
                    (i + 1) as u32
                };
                AtomicU32::new(succ)
            })
            .collect();

        Ok(MemPool {
            chunk_size,
            chunk_count,
            base,
            next,
            head: AtomicU64::new(pack(0, 0)),
            used_chunks: AtomicUsize::new(0),
            high_water_mark: AtomicUsize::new(0),
        })
    }

    pub fn chunk_size(&self) -> usize {
        self.chunk_size
    }

    pub fn chunk_count(&self) -> usize {
        self.chunk_count
    }

    pub fn base(&self) -> usize {
        self.base
    }

    pub fn required_memory_size(chunk_size: usize, chunk_count: usize) -> usize {
        effective_chunk_size(chunk_size) * chunk_count
    }

    /// Pops the head of the free list; `None` if the pool is exhausted.
    pub fn acquire(&self) -> Option<usize> {
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
                let used = self.used_chunks.fetch_add(1, Ordering::Relaxed) + 1;
                self.high_water_mark.fetch_max(used, Ordering::Relaxed);
                return Some(self.base + idx as usize * self.chunk_size);
            }
        }
    }

    /// Pushes `addr` back onto the free list. `addr` must have come from
    /// this pool's `acquire`; releasing it twice before a re-acquire is a
    /// logic error (debug-checked only, per spec).
    pub fn release(&self, addr: usize) {
        debug_assert!(addr >= self.base);
        let idx = ((addr - self.base) / self.chunk_size) as u32;
        debug_assert!((idx as usize) < self.chunk_count);
        loop {
            let old = self.head.load(Ordering::Acquire);
            self.next[idx as usize].store(unpack_index(old), Ordering::Relaxed);
            let new = pack(unpack_generation(old).wrapping_add(1), idx);
            if self
                .head
                .compare_exchange_weak(old, new, Ordering::AcqRel, Ordering::Relaxed)
                .is_ok()
            {
                self.used_chunks.fetch_sub(1, Ordering::Relaxed);
                return;
            }
        }
    }

    pub fn used_chunks(&self) -> usize {
        self.used_chunks.load(Ordering::Relaxed)
    }

    pub fn free_chunks(&self) -> usize {
        self.chunk_count - self.used_chunks()
    }

    pub fn high_water_mark(&self) -> usize {
        self.high_water_mark.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn acquire_exhausts_then_release_replenishes() {
        let pool = MemPool::new(0x1000, 64, 4).unwrap();
        let a = pool.acquire().unwrap();
        let b = pool.acquire().unwrap();
        let c = pool.acquire().unwrap();
        let d = pool.acquire().unwrap();
        assert!(pool.acquire().is_none());
        assert_eq!(pool.used_chunks(), 4);
        assert_eq!(pool.high_water_mark(), 4);

        pool.release(a);
        assert_eq!(pool.used_chunks(), 3);
        let e = pool.acquire().unwrap();
        assert_eq!(e, a);

        let _ = (b, c, d);
    }

    #[test]
    fn chunk_size_is_rounded_up_to_alignment_and_minimum() {
        assert_eq!(effective_chunk_size(1), CHUNK_ALIGNMENT);
        assert_eq!(effective_chunk_size(40), 64);
        assert_eq!(effective_chunk_size(64), 64);
    }

    #[test]
    fn zero_chunk_count_is_a_config_error() {
        assert!(matches!(
            MemPool::new(0x1000, 64, 0),
            Err(ConfigError::InvalidChunkCount)
        ));
    }

    #[test]
    fn chunks_never_overlap() {
        let pool = MemPool::new(0x1000, 64, 8).unwrap();
        let mut addrs = Vec::new();
        while let Some(a) = pool.acquire() {
            addrs.push(a);
        }
        addrs.sort_unstable();
        for w in addrs.windows(2) {
            assert!(w[1] - w[0] >= pool.chunk_size());
        }
    }
}

//! Process-wide registry mapping segment ids to `(base, size)` pairs.
//!
//! Mirrors the repository backing a relocatable-pointer scheme: every
//! process that maps a shared-memory segment registers the address at which
//! it mapped it here, under an id shared with every other process that also
//! mapped the same segment. A [`crate::relptr::RelPtr`] stores only the id
//! and an offset, and asks this table to recover a raw address valid in the
//! *calling* process.

use std::sync::{OnceLock, RwLock};

/// Reserved id meaning "no segment" / logical null.
pub const NULL_ID: u64 = u64::MAX;

/// Segment ids are dense small integers below this cap.
pub const MAX_SEGMENTS: usize = 1 << 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Entry {
    base: usize,
    size: usize,
}

impl Entry {
    fn overlaps(&self, other: &Entry) -> bool {
        let a_end = self.base + self.size;
        let b_end = other.base + other.size;
        self.base < b_end && other.base < a_end
    }

    fn contains(&self, addr: usize) -> bool {
        addr >= self.base && addr < self.base + self.size
    }
}

/// Outcome of a caller-chosen-id registration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegisterWithIdResult {
    Ok,
    Taken,
    Overlap,
}

/// The registry itself. Readers take a shared lock and never block each
/// other; a single mutator (any `register*`/`unregister*` call) takes an
/// exclusive lock for the duration of its update.
pub struct PointerRepository {
    entries: RwLock<Vec<Option<Entry>>>,
}

impl PointerRepository {
    pub fn new(capacity: usize) -> Self {
        PointerRepository {
            entries: RwLock::new(vec![None; capacity]),
        }
    }

    /// Registers `(base, size)` at the smallest unused non-null id.
    pub fn register(&self, base: usize, size: usize) -> Result<u64, crate::error::ResourceExhaustedError> {
        let candidate = Entry { base, size };
        let mut entries = self.entries.write().unwrap();
        if entries.iter().flatten().any(|e| e.overlaps(&candidate)) {
            return Err(crate::error::ResourceExhaustedError::PointerRepositoryExhausted);
        }
        let slot = entries.iter().position(|e| e.is_none());
        match slot {
            Some(idx) => {
                entries[idx] = Some(candidate);
                Ok(idx as u64)
            }
            None => Err(crate::error::ResourceExhaustedError::PointerRepositoryExhausted),
        }
    }

    /// Registers `(base, size)` at a caller-chosen id; used when two
    /// processes must agree on the same id out of band.
    pub fn register_with_id(&self, id: u64, base: usize, size: usize) -> RegisterWithIdResult {
        let candidate = Entry { base, size };
        let mut entries = self.entries.write().unwrap();
        let idx = id as usize;
        if idx >= entries.len() {
            return RegisterWithIdResult::Taken;
        }
        if entries[idx].is_some() {
            return RegisterWithIdResult::Taken;
        }
        if entries
            .iter()
            .enumerate()
            .filter(|&(i, _)| i != idx)
            .filter_map(|(_, e)| e.as_ref())
            .any(|e| e.overlaps(&candidate))
        {
            return RegisterWithIdResult::Overlap;
        }
        entries[idx] = Some(candidate);
        RegisterWithIdResult::Ok
    }

    /// Removes a registered id. Returns `false` if it was not registered.
    pub fn unregister(&self, id: u64) -> bool {
        let mut entries = self.entries.write().unwrap();
        let idx = id as usize;
        match entries.get_mut(idx) {
            Some(slot @ Some(_)) => {
                *slot = None;
                true
            }
            _ => false,
        }
    }

    /// Clears every entry; used at daemon shutdown.
    pub fn unregister_all(&self) {
        let mut entries = self.entries.write().unwrap();
        for slot in entries.iter_mut() {
            *slot = None;
        }
    }

    pub fn lookup_base(&self, id: u64) -> Option<usize> {
        if id == NULL_ID {
            return None;
        }
        let entries = self.entries.read().unwrap();
        entries.get(id as usize).copied().flatten().map(|e| e.base)
    }

    pub fn lookup_size(&self, id: u64) -> Option<usize> {
        if id == NULL_ID {
            return None;
        }
        let entries = self.entries.read().unwrap();
        entries.get(id as usize).copied().flatten().map(|e| e.size)
    }

    /// Finds the unique id whose registered range contains `addr`.
    pub fn search_id(&self, addr: usize) -> Option<u64> {
        let entries = self.entries.read().unwrap();
        entries
            .iter()
            .enumerate()
            .find_map(|(idx, e)| e.filter(|e| e.contains(addr)).map(|_| idx as u64))
    }
}

static GLOBAL: OnceLock<PointerRepository> = OnceLock::new();

/// The process-wide singleton, lazily created with the default capacity.
pub fn global() -> &'static PointerRepository {
    GLOBAL.get_or_init(|| PointerRepository::new(MAX_SEGMENTS))
}

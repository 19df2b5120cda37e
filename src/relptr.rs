//! Relative pointers: a `(segment id, offset)` pair that every process
//! resolves against its own mapping of the segment via the
//! [`crate::pointer_repo`].
//!
//! A `RelPtr` carries no process-local state beyond the pair itself, so its
//! bit pattern is stable across `fork`/`exec` as long as both processes
//! register the same `(id, base)` association (the bases themselves may
//! differ between processes).

use crate::pointer_repo::{self, PointerRepository, NULL_ID};

/// `u64::MAX` denotes "no offset" / logical null, paired with `NULL_ID`.
pub const NULL_OFFSET: u64 = u64::MAX;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RelPtr {
    id: u64,
    offset: u64,
}

impl RelPtr {
    /// The logical null relative pointer.
    pub const NULL: RelPtr = RelPtr {
        id: NULL_ID,
        offset: NULL_OFFSET,
    };

    pub fn is_null(&self) -> bool {
        self.id == NULL_ID && self.offset == NULL_OFFSET
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn offset(&self) -> u64 {
        self.offset
    }

    /// Constructs a pointer directly from an already-known `(id, offset)`
    /// pair, e.g. one received over the IPC channel from another process.
    pub fn from_parts(id: u64, offset: u64) -> Self {
        RelPtr { id, offset }
    }

    /// Looks up `ptr`'s segment in `repo` and stores `(id, ptr - base)`.
    /// A null `ptr` produces the logical null.
    pub fn from_raw_in(repo: &PointerRepository, ptr: *const u8) -> Option<RelPtr> {
        if ptr.is_null() {
            return Some(RelPtr::NULL);
        }
        let addr = ptr as usize;
        let id = repo.search_id(addr)?;
        let base = repo.lookup_base(id)?;
        Some(RelPtr {
            id,
            offset: (addr - base) as u64,
        })
    }

    pub fn from_raw(ptr: *const u8) -> Option<RelPtr> {
        Self::from_raw_in(pointer_repo::global(), ptr)
    }

    /// Recovers a raw address valid in the *calling* process. Returns null
    /// if the pointer is logically null or if its segment is not mapped
    /// here. Dereferencing the result after the segment has been
    /// unregistered in this process is undefined behaviour, exactly as with
    /// a dangling raw pointer.
    pub fn to_raw_in(&self, repo: &PointerRepository) -> *const u8 {
        if self.id == NULL_ID {
            return std::ptr::null();
        }
        match repo.lookup_base(self.id) {
            Some(base) => (base + self.offset as usize) as *const u8,
            None => std::ptr::null(),
        }
    }

    pub fn to_raw(&self) -> *const u8 {
        self.to_raw_in(pointer_repo::global())
    }
}

impl Default for RelPtr {
    fn default() -> Self {
        RelPtr::NULL
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn null_raw_pointer_yields_logical_null() {
        let repo = PointerRepository::new(8);
        let rp = RelPtr::from_raw_in(&repo, std::ptr::null()).unwrap();
        assert!(rp.is_null());
        assert!(rp.to_raw_in(&repo).is_null());
    }

    #[test]
    fn round_trips_through_registered_segment() {
        let repo = PointerRepository::new(8);
        let mut buf = vec![0u8; 64];
        let base = buf.as_mut_ptr() as usize;
        repo.register(base, buf.len()).unwrap();

        let target = unsafe { buf.as_ptr().add(10) };
        let rp = RelPtr::from_raw_in(&repo, target).unwrap();
        assert_eq!(rp.to_raw_in(&repo), target);
    }

    #[test]
    fn unmapped_segment_resolves_to_null() {
        let repo = PointerRepository::new(8);
        let rp = RelPtr::from_parts(42, 8);
        assert!(rp.to_raw_in(&repo).is_null());
    }
}

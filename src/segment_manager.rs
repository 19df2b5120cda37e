//! Owns the collection of user-data segments. Each [`SegmentEntry`] pairs a
//! `(reader-group, writer-group)` access tag with the segment's own
//! [`MemoryManager`] and the [`crate::pointer_repo`] id of its backing
//! region.

use crate::error::ConfigError;
use crate::memory_manager::{MemPoolConfig, MemoryManager};
use crate::pointer_repo::NULL_ID;

/// Group names are bounded short identifiers, matching a POSIX group name.
pub const GROUP_NAME_MAX: usize = 32;

pub const MAX_SEGMENTS: usize = 100;
pub const MAX_POOLS_PER_SEGMENT: usize = 32;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SegmentConfig {
    pub reader_group: String,
    pub writer_group: String,
    pub pools: Vec<MemPoolConfig>,
}

pub struct SegmentEntry {
    pub reader_group: String,
    pub writer_group: String,
    pub memory_manager: MemoryManager,
    pub segment_id: u64,
}

impl SegmentEntry {
    /// The writer group is the sole creator of chunks in this segment; the
    /// reader group may only map it read-only.
    pub fn accessible_by(&self, gid_name: &str) -> bool {
        self.reader_group == gid_name || self.writer_group == gid_name
    }

    pub fn writable_by(&self, gid_name: &str) -> bool {
        self.writer_group == gid_name
    }
}

pub struct SegmentManager {
    segments: Vec<SegmentEntry>,
}

impl SegmentManager {
    pub fn validate_configs(configs: &[SegmentConfig]) -> Result<(), ConfigError> {
        if configs.is_empty() {
            return Err(ConfigError::NoSegments);
        }
        if configs.len() > MAX_SEGMENTS {
            return Err(ConfigError::TooManySegments(configs.len(), MAX_SEGMENTS));
        }
        for (i, seg) in configs.iter().enumerate() {
            if seg.pools.is_empty() {
                return Err(ConfigError::NoMempoolInSegment(i));
            }
            if seg.pools.len() > MAX_POOLS_PER_SEGMENT {
                return Err(ConfigError::TooManyMempools(seg.pools.len(), MAX_POOLS_PER_SEGMENT));
            }
        }
        Ok(())
    }

    /// Constructs one `MemoryManager` per segment in place, each over the
    /// sub-region `bump` hands out; `segment_ids` are the ids the backing
    /// Memory Provider already registered with the Pointer Repository, in
    /// the same order as `configs`.
    pub fn construct_in(
        bump: &mut crate::bump::BumpAllocator,
        configs: &[SegmentConfig],
        segment_ids: &[u64],
    ) -> Result<Self, crate::error::MemoryError> {
        assert_eq!(configs.len(), segment_ids.len());
        let mut segments = Vec::with_capacity(configs.len());
        for (cfg, &segment_id) in configs.iter().zip(segment_ids) {
            let normalized = crate::memory_manager::normalize_pools(cfg.pools.clone())
                .map_err(|_| crate::error::MemoryError::CreateFailed)?;
            let size = crate::memory_manager::required_full_memory_size(&normalized);
            let base = bump.allocate(size.max(1), crate::mempool::CHUNK_ALIGNMENT)?;
            let memory_manager = MemoryManager::construct_in(base, &normalized)?;
            segments.push(SegmentEntry {
                reader_group: cfg.reader_group.clone(),
                writer_group: cfg.writer_group.clone(),
                memory_manager,
                segment_id,
            });
        }
        Ok(SegmentManager { segments })
    }

    pub fn get_segment(&self, segment_id: u64) -> Option<&SegmentEntry> {
        if segment_id == NULL_ID {
            return None;
        }
        self.segments.iter().find(|s| s.segment_id == segment_id)
    }

    pub fn segments(&self) -> &[SegmentEntry] {
        &self.segments
    }

    /// Every segment whose reader or writer group matches `gid_name`.
    pub fn accessible_segments(&self, gid_name: &str) -> Vec<&SegmentEntry> {
        self.segments
            .iter()
            .filter(|s| s.accessible_by(gid_name))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cfg(reader: &str, writer: &str, pools: Vec<(usize, usize)>) -> SegmentConfig {
        SegmentConfig {
            reader_group: reader.to_string(),
            writer_group: writer.to_string(),
            pools: pools
                .into_iter()
                .map(|(chunk_size, chunk_count)| MemPoolConfig { chunk_size, chunk_count })
                .collect(),
        }
    }

    #[test]
    fn access_control_maps_gid_to_segments() {
        let mut bump = crate::bump::BumpAllocator::new(0x10000, 1 << 20);
        let configs = vec![
            cfg("grp_a", "grp_a", vec![(128, 10)]),
            cfg("grp_b", "grp_c", vec![(64, 10)]),
        ];
        let mgr = SegmentManager::construct_in(&mut bump, &configs, &[0, 1]).unwrap();

        let accessible = mgr.accessible_segments("grp_a");
        assert_eq!(accessible.len(), 1);
        assert_eq!(accessible[0].segment_id, 0);

        let accessible = mgr.accessible_segments("grp_c");
        assert_eq!(accessible.len(), 1);
        assert!(!accessible[0].writable_by("grp_b"));
        assert!(accessible[0].writable_by("grp_c"));
    }

    #[test]
    fn empty_config_is_rejected() {
        assert_eq!(
            SegmentManager::validate_configs(&[]),
            Err(ConfigError::NoSegments)
        );
    }

    #[test]
    fn segment_without_mempools_is_rejected() {
        let configs = vec![cfg("a", "a", vec![])];
        assert_eq!(
            SegmentManager::validate_configs(&configs),
            Err(ConfigError::NoMempoolInSegment(0))
        );
    }
}

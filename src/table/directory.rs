//! PMEM directory levels.
//!
//! All levels share one mapped file. Shallow levels (those at or below the
//! filter cutoff) use the compact 256-byte entry and keep their bucket
//! filters in DRAM; deeper levels use the 512-byte variant with the filter
//! embedded after the entry, trading file space for not having to rebuild
//! huge filter arrays on recovery.

use std::path::Path;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};

use crate::config::{Config, Geometry, BUCKETS_PER_DIRECTORY_ENTRY, MAX_PMEM_LEVELS};
use crate::error::Result;
use crate::pmem::{MappedRegion, PmemRecord};
use crate::table::fingerprint::DirectoryFingerprint;

pub const DIR_ENTRY_SIZE: usize = 256;
pub const DIR_ENTRY_FP_SIZE: usize = 512;

/// One PMEM directory entry. `size` counts live slots across the entry's
/// buckets; slots fill bucket 0 first, so slot `i` lives in bucket
/// `i / KEYS_PER_BUCKET`. Bucket pointers hold arena index plus one, with 0
/// meaning the bucket was never allocated.
#[repr(C, align(256))]
pub struct PmemDirectoryEntry {
    size: AtomicU32,
    epoch: AtomicU32,
    bucket_pointers: [AtomicU64; BUCKETS_PER_DIRECTORY_ENTRY],
}

unsafe impl PmemRecord for PmemDirectoryEntry {}

const _: () = assert!(std::mem::size_of::<PmemDirectoryEntry>() == DIR_ENTRY_SIZE);

impl PmemDirectoryEntry {
    pub fn size(&self) -> usize {
        self.size.load(Ordering::Relaxed) as usize
    }

    pub fn set_size(&self, len: usize) {
        self.size.store(len as u32, Ordering::Relaxed);
    }

    pub fn add_size(&self, n: usize) {
        self.size.fetch_add(n as u32, Ordering::Relaxed);
    }

    pub fn epoch(&self) -> u32 {
        self.epoch.load(Ordering::Acquire)
    }

    pub fn set_epoch(&self, epoch: u32) {
        self.epoch.store(epoch, Ordering::Release);
    }

    /// Arena index of the given bucket, if one was ever linked.
    pub fn bucket_index(&self, bucket: usize) -> Option<u64> {
        match self.bucket_pointers[bucket].load(Ordering::Relaxed) {
            0 => None,
            p => Some(p - 1),
        }
    }

    pub fn link_bucket(&self, bucket: usize, arena_index: u64) {
        self.bucket_pointers[bucket].store(arena_index + 1, Ordering::Relaxed);
    }

    pub fn max_bucket_index(&self) -> Option<u64> {
        (0..BUCKETS_PER_DIRECTORY_ENTRY)
            .filter_map(|b| self.bucket_index(b))
            .max()
    }
}

// =============================================================================
// Directory Arena
// =============================================================================

/// The mapped directory file plus the level layout needed to address it.
pub struct DirectoryArena {
    region: MappedRegion,
    level_offsets: [usize; MAX_PMEM_LEVELS],
    level_sizes: [usize; MAX_PMEM_LEVELS],
    max_filter_level: usize,
}

impl DirectoryArena {
    pub fn open(path: &Path, cfg: &Config, geo: &Geometry) -> Result<Self> {
        let region = MappedRegion::open(path, geo.directories_file_size)?;
        Ok(Self {
            region,
            level_offsets: geo.level_file_offsets,
            level_sizes: geo.level_sizes,
            max_filter_level: cfg.max_filter_level,
        })
    }

    fn stride(&self, level: usize) -> usize {
        if level <= self.max_filter_level {
            DIR_ENTRY_SIZE
        } else {
            DIR_ENTRY_FP_SIZE
        }
    }

    fn entry_offset(&self, level: usize, idx: usize) -> usize {
        debug_assert!(idx < self.level_sizes[level]);
        self.level_offsets[level] + idx * self.stride(level)
    }

    pub fn entry(&self, level: usize, idx: usize) -> &PmemDirectoryEntry {
        self.region.record::<PmemDirectoryEntry>(self.entry_offset(level, idx))
    }

    /// The filter embedded behind a deep-level entry. Shallow levels keep
    /// theirs in DRAM instead.
    pub fn embedded_fingerprint(&self, level: usize, idx: usize) -> Option<&DirectoryFingerprint> {
        if level <= self.max_filter_level {
            return None;
        }
        let offset = self.entry_offset(level, idx) + DIR_ENTRY_SIZE;
        Some(self.region.record::<DirectoryFingerprint>(offset))
    }

    pub fn persist_entry(&self, level: usize, idx: usize) {
        self.region.persist_range(self.entry_offset(level, idx), self.stride(level));
    }
}

//! Fixed-width key/value buckets and the shared bucket arena.
//!
//! A bucket is 16 key slots followed by 16 value slots, 256 bytes in total.
//! Buckets carry no per-slot validity; the owning directory entry's size
//! counter says how many slots are live, and slots fill in order, so slot
//! `i` was written before slot `i + 1`.

use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::config::{Geometry, KEYS_PER_BUCKET};
use crate::pmem::{MappedRegion, PmemRecord};

pub const BUCKET_SIZE: usize = 256;

#[repr(C, align(256))]
pub struct Bucket {
    keys: [AtomicU64; KEYS_PER_BUCKET],
    values: [AtomicU64; KEYS_PER_BUCKET],
}

unsafe impl PmemRecord for Bucket {}

const _: () = assert!(std::mem::size_of::<Bucket>() == BUCKET_SIZE);

impl Default for Bucket {
    fn default() -> Self {
        Self {
            keys: std::array::from_fn(|_| AtomicU64::new(0)),
            values: std::array::from_fn(|_| AtomicU64::new(0)),
        }
    }
}

impl Bucket {
    pub fn key(&self, slot: usize) -> u64 {
        self.keys[slot].load(Ordering::Relaxed)
    }

    pub fn value(&self, slot: usize) -> u64 {
        self.values[slot].load(Ordering::Relaxed)
    }

    pub fn set(&self, slot: usize, key: u64, value: u64) {
        self.keys[slot].store(key, Ordering::Relaxed);
        self.values[slot].store(value, Ordering::Relaxed);
    }

    /// Swap a value in place. Payload compaction uses this to re-point a
    /// slot while the owning entry lock blocks concurrent rewrites.
    pub fn cas_value(&self, slot: usize, old: u64, new: u64) -> bool {
        self.values[slot]
            .compare_exchange(old, new, Ordering::AcqRel, Ordering::Relaxed)
            .is_ok()
    }

    /// Flush one value slot, for in-place updates to mapped buckets.
    pub fn flush_value(&self, slot: usize) {
        crate::pmem::persist_ref(&self.values[slot]);
    }
}

// =============================================================================
// Bucket Arena
// =============================================================================

/// The mapped bucket file shared by every PMEM level.
///
/// Indices below `Geometry::prealloc_buckets` belong to the shallow levels in
/// a fixed layout; the rest are handed out by a monotonic cursor. The cursor
/// is volatile and reconstructed from directory pointers during recovery.
/// Directory entries store `index + 1`, with 0 meaning "no bucket yet".
pub struct BucketArena {
    region: MappedRegion,
    cursor: AtomicU64,
    capacity: u64,
}

impl BucketArena {
    pub fn open(path: &Path, geo: &Geometry) -> crate::error::Result<Self> {
        let region = MappedRegion::open(path, geo.max_num_buckets as usize * BUCKET_SIZE)?;
        Ok(Self {
            region,
            cursor: AtomicU64::new(geo.prealloc_buckets),
            capacity: geo.max_num_buckets,
        })
    }

    pub fn bucket(&self, index: u64) -> &Bucket {
        self.region.record::<Bucket>(index as usize * BUCKET_SIZE)
    }

    pub fn persist_bucket(&self, index: u64) {
        self.region.persist_range(index as usize * BUCKET_SIZE, BUCKET_SIZE);
    }

    /// Claim a fresh bucket past the pre-allocated region.
    pub fn allocate(&self) -> u64 {
        let index = self.cursor.fetch_add(1, Ordering::Relaxed);
        assert!(index < self.capacity, "bucket arena exhausted");
        index
    }

    /// Recovery rebuilds the cursor from the highest pointer seen in any
    /// directory entry.
    pub fn set_cursor(&self, next_free: u64) {
        self.cursor.store(next_free, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cas_swaps_only_the_expected_word() {
        let b = Bucket::default();
        b.set(0, 7, 100);
        assert!(!b.cas_value(0, 99, 300));
        assert_eq!(b.value(0), 100);
        assert!(b.cas_value(0, 100, 300));
        assert_eq!(b.value(0), 300);
    }

    #[test]
    fn arena_allocates_past_prealloc() {
        let dir = tempfile::tempdir().unwrap();
        let geo = crate::config::Config::default().geometry().unwrap();
        let arena = BucketArena::open(&dir.path().join("buckets.dat"), &geo).unwrap();

        let first = arena.allocate();
        assert_eq!(first, geo.prealloc_buckets);
        assert_eq!(arena.allocate(), first + 1);

        arena.bucket(first).set(0, 11, 22);
        assert_eq!(arena.bucket(first).key(0), 11);
        assert_eq!(arena.bucket(first).value(0), 22);
    }
}

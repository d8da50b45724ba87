//! DRAM tier: the hot top of the directory.
//!
//! ## Responsibilities
//! - Absorb every insert into in-memory buckets, one directory entry at a
//!   time, under that entry's mutex
//! - Carry the per-entry epoch that versions migrations for optimistic
//!   readers
//!
//! Contents are volatile by design: durability comes from the key/value log,
//! and recovery replays the log to refill this tier.

use std::sync::atomic::{AtomicU32, AtomicU8, Ordering};

use parking_lot::{Mutex, MutexGuard};

use crate::config::{Geometry, BUCKETS_PER_DIRECTORY_ENTRY, KEYS_PER_BUCKET};
use crate::table::bucket::Bucket;

/// One DRAM directory entry: per-bucket fill counts, a migration epoch, and
/// the writer lock serializing inserts and migration for its key range.
pub struct DramDirectoryEntry {
    sizes: [AtomicU8; BUCKETS_PER_DIRECTORY_ENTRY],
    epoch: AtomicU32,
    lock: Mutex<()>,
}

impl Default for DramDirectoryEntry {
    fn default() -> Self {
        Self {
            sizes: std::array::from_fn(|_| AtomicU8::new(0)),
            epoch: AtomicU32::new(1),
            lock: Mutex::new(()),
        }
    }
}

impl DramDirectoryEntry {
    pub fn size(&self, bucket: usize) -> usize {
        self.sizes[bucket].load(Ordering::Relaxed) as usize
    }

    pub fn set_size(&self, bucket: usize, len: usize) {
        self.sizes[bucket].store(len as u8, Ordering::Relaxed);
    }

    pub fn epoch(&self) -> u32 {
        self.epoch.load(Ordering::Relaxed)
    }

    /// Recovery seeds the epoch from the deepest durable migration.
    pub fn set_epoch(&self, epoch: u32) {
        self.epoch.store(epoch, Ordering::Relaxed);
    }

    /// Applied after a migration drained the entry: empty buckets, next epoch.
    /// Readers that raced the migration see the epoch change and retry.
    pub fn advance_epoch(&self) {
        for s in &self.sizes {
            s.store(0, Ordering::Relaxed);
        }
        self.epoch.fetch_add(1, Ordering::Release);
    }
}

pub struct DramTier {
    entries: Vec<DramDirectoryEntry>,
    buckets: Vec<Bucket>,
}

impl DramTier {
    pub fn new(geo: &Geometry) -> Self {
        let size = geo.dram_directory_size;
        Self {
            entries: (0..size).map(|_| DramDirectoryEntry::default()).collect(),
            buckets: (0..size * BUCKETS_PER_DIRECTORY_ENTRY)
                .map(|_| Bucket::default())
                .collect(),
        }
    }

    pub fn entry(&self, idx: usize) -> &DramDirectoryEntry {
        &self.entries[idx]
    }

    pub fn bucket(&self, idx: usize, bucket: usize) -> &Bucket {
        &self.buckets[idx * BUCKETS_PER_DIRECTORY_ENTRY + bucket]
    }

    pub fn lock(&self, idx: usize) -> MutexGuard<'_, ()> {
        self.entries[idx].lock.lock()
    }

    /// Live entries currently held for one directory entry.
    pub fn used(&self, idx: usize) -> usize {
        (0..BUCKETS_PER_DIRECTORY_ENTRY)
            .map(|b| self.entries[idx].size(b))
            .sum()
    }

    /// True when no bucket of the entry can take another slot. The caller
    /// holds the entry lock, so the answer stays valid until it acts.
    pub fn is_full(&self, idx: usize, subdivision_buckets: usize, subdivision: usize) -> bool {
        let start = subdivision * subdivision_buckets;
        (start..start + subdivision_buckets)
            .all(|b| self.entries[idx].size(b) == KEYS_PER_BUCKET)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn epoch_advance_empties_the_entry() {
        let e = DramDirectoryEntry::default();
        e.set_size(0, 5);
        e.set_size(3, 16);
        assert_eq!(e.epoch(), 1);

        e.advance_epoch();
        assert_eq!(e.epoch(), 2);
        assert_eq!(e.size(0), 0);
        assert_eq!(e.size(3), 0);
    }

    #[test]
    fn fullness_is_per_subdivision() {
        let geo = crate::config::Config::default().geometry().unwrap();
        let tier = DramTier::new(&geo);

        let per = geo.buckets_per_subdivision;
        for b in 0..per {
            tier.entry(0).set_size(b, KEYS_PER_BUCKET);
        }
        assert!(tier.is_full(0, per, 0));
        assert!(!tier.is_full(0, per, 1));
    }
}

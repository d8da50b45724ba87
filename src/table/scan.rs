//! Ordered range scans over range-partitioned stores.
//!
//! Range partitioning maps consecutive key ranges to consecutive directory
//! entries on every tier, so a scan is a lateral walk: collect the starting
//! entry, descend through the levels below it, then step right while the
//! result set still wants smaller keys than the next entry can hold.
//!
//! The candidate set is a bounded `BTreeMap`. Buckets are read newest-first
//! and first insertion wins, so the freshest version of each key is the one
//! collected; tombstones ride along to shadow older versions and are dropped
//! at the end.

use std::collections::BTreeMap;

use crate::config::{BUCKETS_PER_DIRECTORY_ENTRY, KEYS_PER_BUCKET, TOMBSTONE_MARKER};
use crate::table::bucket::Bucket;
use crate::table::{KeyIn, Table};

impl Table {
    /// Collect up to `count` live key/value pairs with key >= `lower_bound`,
    /// in ascending key order.
    pub(crate) fn scan(&self, lower_bound: u64, count: usize) -> Vec<(u64, u64)> {
        let mut results = BTreeMap::new();
        if count == 0 {
            return Vec::new();
        }

        let (entry_idx, _) = self.dram_slot(KeyIn::Fixed(lower_bound));
        self.scan_dram_entry(entry_idx, count, lower_bound, &mut results);

        results
            .into_iter()
            .filter(|&(_, v)| v != TOMBSTONE_MARKER)
            .collect()
    }

    fn scan_dram_entry(
        &self,
        mut entry_idx: usize,
        count: usize,
        mut lower_bound: u64,
        results: &mut BTreeMap<u64, u64>,
    ) {
        loop {
            let entry = self.dram.entry(entry_idx);
            for bucket_idx in (0..BUCKETS_PER_DIRECTORY_ENTRY).rev() {
                let bucket = self.dram.bucket(entry_idx, bucket_idx);
                update_keyset(bucket, entry.size(bucket_idx), count, lower_bound, results);
            }

            if self.levels() > 0 {
                let pmem_idx = self.pmem_entry_idx(0, lower_bound);
                self.scan_pmem_entry(pmem_idx, 0, count, lower_bound, results);
            }

            // Not enough yet: the next entry holds the next key range, so its
            // own minimum becomes the bound that routes the descent below it.
            entry_idx += 1;
            if results.len() >= count || entry_idx >= self.geo.dram_directory_size {
                return;
            }
            lower_bound = self.cfg.range_min
                + entry_idx as u64 * self.geo.dram_range_step(&self.cfg);
        }
    }

    fn scan_pmem_entry(
        &self,
        entry_idx: usize,
        level: usize,
        count: usize,
        lower_bound: u64,
        results: &mut BTreeMap<u64, u64>,
    ) {
        let entry = self.dirs.entry(level, entry_idx);
        let size = entry.size();

        for bucket_idx in (0..BUCKETS_PER_DIRECTORY_ENTRY).rev() {
            let len = Self::size_of_bucket(size, bucket_idx);
            if len == 0 {
                continue;
            }
            let Some((bucket, _)) = self.pmem_bucket(level, entry_idx, bucket_idx) else {
                continue;
            };
            update_keyset(bucket, len, count, lower_bound, results);
        }

        // Depth first: deeper levels hold older versions, which first-wins
        // insertion ignores when a newer one was already collected.
        if self.levels() > level + 1 {
            let below = self.pmem_entry_idx(level + 1, lower_bound);
            self.scan_pmem_entry(below, level + 1, count, lower_bound, results);
        }

        // Lateral step within the parent's fanout group: a sibling entry may
        // still hold keys below our current cutoff.
        let next = entry_idx + 1;
        if next >= self.geo.level_sizes[level] || next % self.level_fanout(level) == 0 {
            return;
        }
        let step = self.geo.range_step(&self.cfg, level);
        let sibling_min = self.cfg.range_min + next as u64 * step;
        let cutoff = results.keys().next_back().copied();
        if results.len() < count || cutoff.is_some_and(|max| sibling_min < max) {
            self.scan_pmem_entry(next, level, count, lower_bound, results);
        }
    }
}

/// Merge one bucket into the bounded candidate set, evicting the largest key
/// when it overflows `count`.
fn update_keyset(
    bucket: &Bucket,
    len: usize,
    count: usize,
    lower_bound: u64,
    results: &mut BTreeMap<u64, u64>,
) {
    debug_assert!(len <= KEYS_PER_BUCKET);
    for slot in (0..len).rev() {
        let key = bucket.key(slot);
        if key < lower_bound {
            continue;
        }
        if results.len() >= count {
            let max = *results.keys().next_back().unwrap();
            if key >= max {
                continue;
            }
        }
        results.entry(key).or_insert_with(|| bucket.value(slot));
        if results.len() > count {
            let max = *results.keys().next_back().unwrap();
            results.remove(&max);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fill(bucket: &Bucket, pairs: &[(u64, u64)]) {
        for (slot, &(k, v)) in pairs.iter().enumerate() {
            bucket.set(slot, k, v);
        }
    }

    #[test]
    fn keyset_keeps_the_smallest_keys() {
        let bucket = Bucket::default();
        fill(&bucket, &[(50, 1), (10, 2), (30, 3), (20, 4), (40, 5)]);

        let mut results = BTreeMap::new();
        update_keyset(&bucket, 5, 3, 15, &mut results);

        let keys: Vec<u64> = results.keys().copied().collect();
        assert_eq!(keys, vec![20, 30, 40]);
    }

    #[test]
    fn keyset_prefers_newest_version_of_a_key() {
        let bucket = Bucket::default();
        // Slot order is insertion order; slot 2 supersedes slot 0.
        fill(&bucket, &[(10, 1), (20, 2), (10, 9)]);

        let mut results = BTreeMap::new();
        update_keyset(&bucket, 3, 8, 0, &mut results);
        assert_eq!(results.get(&10), Some(&9));
    }
}

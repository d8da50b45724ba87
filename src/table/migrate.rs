//! Migration: spilling directory entries one level down.
//!
//! A full DRAM entry migrates to PMEM level 0; a full PMEM entry migrates to
//! the next level, recursively. Both share one rehash + bulk-insert path.
//! The caller of `migrate_dram` holds the DRAM entry's lock; deeper
//! migrations are serialized through that same lock, since every PMEM entry
//! has exactly one ancestor chain up to a single DRAM entry.

use crate::config::{Partition, BUCKETS_PER_DIRECTORY_ENTRY, KEYS_PER_BUCKET, MAX_REHASH_PARTITION};
use crate::table::bucket::Bucket;
use crate::table::Table;

impl Table {
    /// Directory entries one source entry fans out to at `target_level`.
    pub(crate) fn level_fanout(&self, target_level: usize) -> usize {
        if target_level == 0 {
            1 << (self.cfg.pmem_bits - self.cfg.dram_bits)
        } else {
            1 << self.cfg.fanout_bits
        }
    }

    /// Which rehash group a target directory index falls into.
    fn rehash_partition(&self, target_level: usize, target_idx: usize) -> usize {
        match self.cfg.partition {
            Partition::Hash => {
                let shift = if target_level == 0 {
                    self.cfg.dram_bits
                } else {
                    self.cfg.pmem_bits + self.cfg.fanout_bits * (target_level as u32 - 1)
                };
                target_idx >> shift
            }
            Partition::Range => target_idx % self.level_fanout(target_level),
        }
    }

    /// Drain one DRAM entry into PMEM level 0 and bump its epoch.
    /// Caller holds the entry's lock.
    pub(crate) fn migrate_dram(&self, entry_idx: usize) {
        let fanout = self.level_fanout(0);
        let mut keys = vec![0u64; fanout * MAX_REHASH_PARTITION];
        let mut values = vec![0u64; fanout * MAX_REHASH_PARTITION];
        let mut sizes = vec![0usize; fanout];

        let entry = self.dram.entry(entry_idx);
        let epoch = entry.epoch();

        for bucket_idx in 0..BUCKETS_PER_DIRECTORY_ENTRY {
            self.rehash(
                self.dram.bucket(entry_idx, bucket_idx),
                entry.size(bucket_idx),
                0,
                &mut keys,
                &mut values,
                &mut sizes,
            );
        }

        self.bulk_level_insert(0, epoch, &keys, &values, &sizes);

        // The epoch bump is what retires this entry's log records; a reader
        // racing us sees it and retries.
        entry.advance_epoch();
    }

    /// Drain one PMEM entry into the next level down.
    fn migrate(&self, entry_idx: usize, source_level: usize, target_level: usize) {
        assert!(
            target_level < self.cfg.max_pmem_levels,
            "deepest PMEM level overflowed"
        );

        let entry = self.dirs.entry(source_level, entry_idx);
        let fanout = self.level_fanout(target_level);
        let mut keys = vec![0u64; fanout * MAX_REHASH_PARTITION];
        let mut values = vec![0u64; fanout * MAX_REHASH_PARTITION];
        let mut sizes = vec![0usize; fanout];

        let epoch = entry.epoch();
        let total = entry.size();
        let mut rehashed = 0;
        let mut bucket_idx = 0;

        while rehashed < total {
            let n = (total - rehashed).min(KEYS_PER_BUCKET);
            let Some((bucket, _)) = self.pmem_bucket(source_level, entry_idx, bucket_idx) else {
                break;
            };
            self.rehash(bucket, n, target_level, &mut keys, &mut values, &mut sizes);
            rehashed += n;
            bucket_idx += 1;
        }

        self.bulk_level_insert(target_level, epoch, &keys, &values, &sizes);

        self.fingerprint(source_level, entry_idx).clear();
        entry.set_size(0);
        self.dirs.persist_entry(source_level, entry_idx);
    }

    /// Redistribute one bucket's slots into per-target-entry groups,
    /// dropping dead locators and collapsing duplicate keys (newest wins).
    fn rehash(
        &self,
        bucket: &Bucket,
        len: usize,
        target_level: usize,
        keys: &mut [u64],
        values: &mut [u64],
        sizes: &mut [usize],
    ) {
        for slot in 0..len {
            let key = bucket.key(slot);
            let word = bucket.value(slot);

            let target_idx = self.pmem_entry_idx(target_level, key);
            let part = self.rehash_partition(target_level, target_idx);
            let base = part * MAX_REHASH_PARTITION;

            let dup = keys[base..base + sizes[part]].iter().position(|&k| k == key);

            if let Some(offset) = dup {
                if !self.var_keys {
                    values[base + offset] = word;
                    continue;
                }

                // Hash-collision safety: only supersede when the actual key
                // bytes match. `word` is the newer version (slots fill in
                // insertion order).
                if self.locator_reachable(word) {
                    let newer = self.payload_at(word);
                    let older = self.payload_at(values[base + offset]);
                    if newer.key_len() == older.key_len() && newer.key() == older.key() {
                        values[base + offset] = word;
                        if self.cfg.imm_mark_invalid {
                            older.mark_deleted_lazy();
                        }
                        continue;
                    }
                } else {
                    continue;
                }
            }

            if self.var_keys && !self.locator_reachable(word) {
                // Garbage-collected out from under us by payload compaction.
                continue;
            }

            keys[base + sizes[part]] = key;
            values[base + sizes[part]] = word;
            sizes[part] += 1;
            assert!(sizes[part] <= MAX_REHASH_PARTITION, "rehash group overflow");
        }
    }

    /// Locator chunk-epoch check alone, without key comparison.
    fn locator_reachable(&self, raw: u64) -> bool {
        let loc = self.locators.unpack(raw);
        let log = &self.payload[loc.log];
        self.locators.epoch_tag(log.state().chunk_epoch(loc.chunk)) == loc.epoch
    }

    pub(crate) fn bulk_level_insert(
        &self,
        level: usize,
        epoch: u32,
        keys: &[u64],
        values: &[u64],
        sizes: &[usize],
    ) {
        if level >= self.levels() {
            self.raise_levels(level);
        }

        for (part, &len) in sizes.iter().enumerate() {
            if len == 0 {
                continue;
            }
            let base = part * MAX_REHASH_PARTITION;

            // The whole group shares one target entry; route via its first key.
            let entry_idx = self.pmem_entry_idx(level, keys[base]);
            let entry = self.dirs.entry(level, entry_idx);

            if entry.size() + len > self.geo.entry_capacity {
                self.migrate(entry_idx, level, level + 1);
            }

            let inserted = self.try_bulk_insert(
                level,
                entry_idx,
                epoch,
                &keys[base..base + len],
                &values[base..base + len],
            );
            assert_eq!(inserted, len, "bulk insert did not fit after migration");
        }
    }

    fn try_bulk_insert(
        &self,
        level: usize,
        entry_idx: usize,
        epoch: u32,
        keys: &[u64],
        values: &[u64],
    ) -> usize {
        let entry = self.dirs.entry(level, entry_idx);
        let Some(mut bucket_idx) = Self::free_bucket_idx(entry.size()) else {
            return 0;
        };

        let mut inserted = 0;
        let mut allocated = false;

        while bucket_idx < BUCKETS_PER_DIRECTORY_ENTRY && inserted < keys.len() {
            let (bucket, arena_idx) = match self.pmem_bucket(level, entry_idx, bucket_idx) {
                Some(pair) => pair,
                None => {
                    let idx = self.buckets.allocate();
                    entry.link_bucket(bucket_idx, idx);
                    allocated = true;
                    (self.buckets.bucket(idx), idx)
                }
            };

            let bucket_len = Self::size_of_bucket(entry.size(), bucket_idx);
            let take = (KEYS_PER_BUCKET - bucket_len).min(keys.len() - inserted);

            if take > 0 {
                self.insert_into_filter(&keys[inserted..inserted + take], level, entry_idx, bucket_idx);
                for i in 0..take {
                    bucket.set(bucket_len + i, keys[inserted + i], values[inserted + i]);
                }
                self.buckets.persist_bucket(arena_idx);
                inserted += take;
            }
            bucket_idx += 1;
        }

        if level > self.cfg.max_filter_level || allocated {
            // Embedded filters and freshly linked pointers must be durable
            // before the size store publishes the slots.
            self.dirs.persist_entry(level, entry_idx);
        }

        // Size before epoch: only the size makes the migrated slots visible.
        // A stale epoch at worst replays a few duplicates, which reinsert
        // collapses.
        entry.add_size(inserted);
        entry.set_epoch(epoch);
        self.dirs.persist_entry(level, entry_idx);

        inserted
    }

    /// Filters only ever gain bits; they are rebuilt (DRAM) or cleared
    /// (embedded) when the entry migrates.
    pub(crate) fn insert_into_filter(
        &self,
        keys: &[u64],
        level: usize,
        entry_idx: usize,
        bucket_idx: usize,
    ) {
        let fp = &self.fingerprint(level, entry_idx).buckets[bucket_idx];
        for &key in keys {
            fp.insert(self.filter_hash(key));
        }
    }
}

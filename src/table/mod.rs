//! Two-tier hash table core.
//!
//! ## Responsibilities
//! - Route keys to DRAM directory entries and, below them, the PMEM levels
//! - Serve inserts, lookups, deletes and occupancy reporting
//! - Host the shared state (directories, bucket arena, logs) the migration,
//!   scan and recovery paths operate on
//!
//! Writers serialize per DRAM directory entry through its mutex. Readers are
//! lock-free: they snapshot the entry's epoch (and, on PMEM, the occupancy)
//! before probing and retry if either moved underneath them.

pub mod bucket;
pub mod directory;
pub mod dram;
pub mod fingerprint;
mod migrate;
mod scan;

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicI32, Ordering};

use tracing::info;
use xxhash_rust::xxh3::xxh3_64_with_seed;

use crate::config::{
    Config, Geometry, Partition, BUCKETS_PER_DIRECTORY_ENTRY, HASH_SEED, KEYS_PER_BUCKET,
    KEYS_PER_BUCKET_BITS, TOMBSTONE_MARKER,
};
use crate::error::{Result, TierError};
use crate::payload::{entry_size, LocatorLayout, PayloadLog, PayloadView};
use crate::pmem::MappedRegion;
use crate::table::bucket::{Bucket, BucketArena};
use crate::table::directory::DirectoryArena;
use crate::table::dram::DramTier;
use crate::table::fingerprint::DirectoryFingerprint;
use crate::wal::KvLog;

// =============================================================================
// Key and Value Inputs
// =============================================================================

/// A key on its way into the table. Fixed keys travel as their own value;
/// variable keys travel as borrowed bytes and are represented by their hash.
#[derive(Clone, Copy)]
pub(crate) enum KeyIn<'a> {
    Fixed(u64),
    Var(&'a [u8]),
}

impl KeyIn<'_> {
    pub(crate) fn hash(self) -> u64 {
        match self {
            KeyIn::Fixed(k) => xxh3_64_with_seed(&k.to_le_bytes(), HASH_SEED),
            KeyIn::Var(bytes) => xxh3_64_with_seed(bytes, HASH_SEED),
        }
    }

    /// The u64 stored in key slots: the key itself, or its hash.
    pub(crate) fn repr(self) -> u64 {
        match self {
            KeyIn::Fixed(k) => k,
            KeyIn::Var(_) => self.hash(),
        }
    }
}

#[derive(Clone, Copy)]
pub(crate) enum ValueIn<'a> {
    Fixed(u64),
    Var(&'a [u8]),
}

/// A located slot. `word` is the value or packed locator; `bucket`/`slot`
/// pin down where it lives so payload compaction can swap it in place.
pub(crate) struct LookupHit<'a> {
    pub deleted: bool,
    pub word: u64,
    pub bucket: &'a Bucket,
    pub slot: usize,
    pub volatile: bool,
}

// =============================================================================
// Table
// =============================================================================

pub(crate) struct Table {
    pub(crate) cfg: Config,
    pub(crate) geo: Geometry,
    pub(crate) var_keys: bool,
    pub(crate) locators: LocatorLayout,

    pub(crate) dram: DramTier,
    /// DRAM-resident filters for levels at or below the filter cutoff.
    pub(crate) dram_fingerprints: Vec<Vec<DirectoryFingerprint>>,
    pub(crate) dirs: DirectoryArena,
    pub(crate) buckets: BucketArena,
    /// `metadata.dat`: holds the persistent level counter.
    meta: MappedRegion,

    pub(crate) logs: Vec<KvLog>,
    pub(crate) payload: Vec<PayloadLog>,
}

impl std::fmt::Debug for Table {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Table").finish_non_exhaustive()
    }
}

const META_FILE_SIZE: usize = 64;

impl Table {
    pub(crate) fn open(dir: &Path, cfg: Config, var_keys: bool, reset: bool) -> Result<Table> {
        let geo = cfg.geometry()?;

        if var_keys && cfg.partition == Partition::Range {
            return Err(TierError::Config(
                "variable-length keys require hash partitioning".into(),
            ));
        }

        std::fs::create_dir_all(dir)?;
        if reset {
            remove_store_files(dir)?;
        }

        let meta_path = dir.join("metadata.dat");
        if !reset && !meta_path.exists() {
            return Err(TierError::StoreMissing(dir.display().to_string()));
        }
        let fresh = reset;

        let meta = MappedRegion::open(&meta_path, META_FILE_SIZE)?;
        let dirs = DirectoryArena::open(&dir.join("directories.dat"), &cfg, &geo)?;
        let buckets = BucketArena::open(&dir.join("buckets.dat"), &geo)?;

        let filter_levels = cfg.max_filter_level.min(cfg.max_pmem_levels - 1);
        let dram_fingerprints = (0..=filter_levels)
            .map(|level| {
                (0..geo.level_sizes[level])
                    .map(|_| DirectoryFingerprint::default())
                    .collect()
            })
            .collect();

        let logs = (0..geo.log_num)
            .map(|i| {
                KvLog::open(
                    &dir.join(format!("log{i}.dat")),
                    cfg.chunks_per_log,
                    cfg.chunk_size,
                    geo.epochs_per_chunk,
                    fresh,
                )
            })
            .collect::<Result<Vec<_>>>()?;

        let payload = if var_keys {
            (0..geo.payload_log_num)
                .map(|i| {
                    PayloadLog::open(
                        &dir.join(format!("payload_log{i}.dat")),
                        geo.payload_chunks,
                        cfg.payload_chunk_size,
                        fresh,
                    )
                })
                .collect::<Result<Vec<_>>>()?
        } else {
            Vec::new()
        };

        let locators = LocatorLayout::new(geo.payload_log_num, geo.payload_chunks);
        let dram = DramTier::new(&geo);

        let table = Table {
            cfg,
            geo,
            var_keys,
            locators,
            dram,
            dram_fingerprints,
            dirs,
            buckets,
            meta,
            logs,
            payload,
        };

        if fresh {
            table.level_counter().store(1, Ordering::Relaxed);
            table.meta.persist_range(0, META_FILE_SIZE);
        } else {
            table.recover();
        }

        Ok(table)
    }

    fn level_counter(&self) -> &AtomicI32 {
        self.meta.record::<AtomicI32>(0)
    }

    /// Number of PMEM levels currently in use.
    pub(crate) fn levels(&self) -> usize {
        self.level_counter().load(Ordering::Relaxed) as usize
    }

    pub(crate) fn raise_levels(&self, beyond: usize) {
        let _ = self.level_counter().compare_exchange(
            beyond as i32,
            beyond as i32 + 1,
            Ordering::Relaxed,
            Ordering::Relaxed,
        );
        self.meta.persist_range(0, META_FILE_SIZE);
    }

    // -------------------------------------------------------------------------
    // Key Routing
    // -------------------------------------------------------------------------

    /// DRAM directory entry and subdivision for a key.
    pub(crate) fn dram_slot(&self, key: KeyIn<'_>) -> (usize, usize) {
        match self.cfg.partition {
            Partition::Hash => {
                let h = key.hash();
                let entry = (h as usize) & (self.geo.dram_directory_size - 1);
                let sub = ((h >> self.cfg.dram_bits) as usize) & (self.geo.num_subdivisions - 1);
                (entry, sub)
            }
            Partition::Range => {
                let KeyIn::Fixed(k) = key else {
                    unreachable!("range partitioning is fixed-key only")
                };
                let step = self.geo.dram_range_step(&self.cfg);
                let entry = ((k.saturating_sub(self.cfg.range_min) / step) as usize)
                    .min(self.geo.dram_directory_size - 1);
                (entry, 0)
            }
        }
    }

    /// Same routing, starting from a stored key word (replay, compaction).
    pub(crate) fn dram_slot_of_repr(&self, repr: u64) -> (usize, usize) {
        if self.var_keys {
            let entry = (repr as usize) & (self.geo.dram_directory_size - 1);
            let sub = ((repr >> self.cfg.dram_bits) as usize) & (self.geo.num_subdivisions - 1);
            (entry, sub)
        } else {
            self.dram_slot(KeyIn::Fixed(repr))
        }
    }

    /// For fixed keys the filter input is the key's hash; stored variable-key
    /// words already are hashes.
    pub(crate) fn key_or_hash(&self, repr: u64) -> u64 {
        if self.var_keys {
            repr
        } else {
            KeyIn::Fixed(repr).hash()
        }
    }

    pub(crate) fn filter_hash(&self, repr: u64) -> u32 {
        (self.key_or_hash(repr) >> 32) as u32
    }

    pub(crate) fn pmem_entry_idx(&self, level: usize, repr: u64) -> usize {
        match self.cfg.partition {
            Partition::Hash => {
                (self.key_or_hash(repr) as usize) & (self.geo.level_sizes[level] - 1)
            }
            Partition::Range => {
                let step = self.geo.range_step(&self.cfg, level);
                ((repr.saturating_sub(self.cfg.range_min) / step) as usize)
                    .min(self.geo.level_sizes[level] - 1)
            }
        }
    }

    pub(crate) fn log_idx(&self, key: KeyIn<'_>) -> usize {
        match self.cfg.partition {
            Partition::Hash => (key.hash() as usize) & (self.geo.log_num - 1),
            Partition::Range => {
                let KeyIn::Fixed(k) = key else {
                    unreachable!("range partitioning is fixed-key only")
                };
                let step = self.geo.log_range_step(&self.cfg);
                ((k.saturating_sub(self.cfg.range_min) / step) as usize)
                    .min(self.geo.log_num - 1)
            }
        }
    }

    pub(crate) fn payload_log_idx(&self, key: &[u8]) -> usize {
        (KeyIn::Var(key).hash() as usize) & (self.geo.payload_log_num - 1)
    }

    /// Max-epoch partition of a DRAM entry within its key/value log chunk.
    pub(crate) fn epoch_partition(&self, dram_idx: usize) -> usize {
        dram_idx >> self.cfg.log_num_bits
    }

    // -------------------------------------------------------------------------
    // Bucket Math
    // -------------------------------------------------------------------------

    /// Index of the first non-full bucket given an entry's occupancy.
    pub(crate) fn free_bucket_idx(size: usize) -> Option<usize> {
        let idx = size >> KEYS_PER_BUCKET_BITS;
        (idx < BUCKETS_PER_DIRECTORY_ENTRY).then_some(idx)
    }

    pub(crate) fn size_of_bucket(size: usize, bucket_idx: usize) -> usize {
        match Self::free_bucket_idx(size) {
            None => KEYS_PER_BUCKET,
            Some(first_free) if bucket_idx < first_free => KEYS_PER_BUCKET,
            Some(first_free) if bucket_idx == first_free => size & (KEYS_PER_BUCKET - 1),
            _ => 0,
        }
    }

    /// Resolve a PMEM bucket to its storage plus arena index (for flushing).
    /// `None` for a pointer slot that was never linked.
    pub(crate) fn pmem_bucket(
        &self,
        level: usize,
        entry_idx: usize,
        bucket_idx: usize,
    ) -> Option<(&Bucket, u64)> {
        let arena_idx = if level <= self.cfg.max_prealloc_level {
            self.geo.bucket_offsets[level]
                + (entry_idx * BUCKETS_PER_DIRECTORY_ENTRY + bucket_idx) as u64
        } else {
            self.dirs.entry(level, entry_idx).bucket_index(bucket_idx)?
        };
        Some((self.buckets.bucket(arena_idx), arena_idx))
    }

    pub(crate) fn fingerprint(&self, level: usize, entry_idx: usize) -> &DirectoryFingerprint {
        if level <= self.cfg.max_filter_level {
            &self.dram_fingerprints[level][entry_idx]
        } else {
            match self.dirs.embedded_fingerprint(level, entry_idx) {
                Some(fp) => fp,
                None => unreachable!("level {level} carries no embedded filter"),
            }
        }
    }

    // -------------------------------------------------------------------------
    // Insert / Remove
    // -------------------------------------------------------------------------

    pub(crate) fn insert(&self, key: KeyIn<'_>, value: ValueIn<'_>, tombstone: bool, log: bool) {
        let (entry_idx, subdivision) = self.dram_slot(key);
        let sub_start = subdivision * self.geo.buckets_per_subdivision;
        let sub_end = sub_start + self.geo.buckets_per_subdivision - 1;

        let entry = self.dram.entry(entry_idx);

        loop {
            // Variable payloads go to their log before the entry lock is
            // taken; the locator is re-validated under the lock below.
            let word = match (key, value) {
                (KeyIn::Fixed(_), ValueIn::Fixed(v)) => {
                    if tombstone {
                        TOMBSTONE_MARKER
                    } else {
                        v
                    }
                }
                (KeyIn::Var(k), ValueIn::Var(v)) => {
                    if tombstone {
                        self.log_payload(k, &TOMBSTONE_MARKER.to_le_bytes())
                    } else {
                        self.log_payload(k, v)
                    }
                }
                _ => unreachable!("key and value variants must match"),
            };

            let guard = self.dram.lock(entry_idx);

            if let KeyIn::Var(k) = key {
                // The payload log may have been compacted while we waited
                // for the lock, dropping our unreferenced entry.
                if !self.locator_alive(word, k) {
                    drop(guard);
                    continue;
                }
            }

            if self.dram.is_full(entry_idx, self.geo.buckets_per_subdivision, subdivision) {
                self.migrate_dram(entry_idx);
            }

            let epoch = entry.epoch();
            if log {
                self.append_log(key, word, epoch);
            }

            let mut bucket_idx = sub_start;
            while entry.size(bucket_idx) >= KEYS_PER_BUCKET && bucket_idx < sub_end {
                bucket_idx += 1;
            }
            debug_assert!(entry.size(bucket_idx) < KEYS_PER_BUCKET);

            let pos = entry.size(bucket_idx);
            self.dram.bucket(entry_idx, bucket_idx).set(pos, key.repr(), word);
            entry.set_size(bucket_idx, pos + 1);
            return;
        }
    }

    pub(crate) fn remove(&self, key: KeyIn<'_>) {
        match key {
            KeyIn::Fixed(_) => self.insert(key, ValueIn::Fixed(0), true, true),
            KeyIn::Var(_) => self.insert(key, ValueIn::Var(&[]), true, true),
        }
    }

    /// Log replay insert: deduplicates in place against entries already
    /// replayed, making recovery idempotent.
    pub(crate) fn reinsert(&self, repr: u64, word: u64) {
        let (entry_idx, subdivision) = self.dram_slot_of_repr(repr);
        let sub_start = subdivision * self.geo.buckets_per_subdivision;
        let sub_end = sub_start + self.geo.buckets_per_subdivision - 1;

        let entry = self.dram.entry(entry_idx);
        let _guard = self.dram.lock(entry_idx);

        let mut bucket_idx = sub_start;
        while bucket_idx <= sub_end && entry.size(bucket_idx) > 0 {
            let bucket = self.dram.bucket(entry_idx, bucket_idx);
            for slot in (0..entry.size(bucket_idx)).rev() {
                if bucket.key(slot) == repr {
                    bucket.set(slot, repr, word);
                    return;
                }
            }
            bucket_idx += 1;
        }
        // Step back to the last non-full bucket.
        if bucket_idx > sub_start && entry.size(bucket_idx - 1) < KEYS_PER_BUCKET {
            bucket_idx -= 1;
        }
        assert!(bucket_idx <= sub_end, "subdivision overflow during replay");
        assert!(entry.size(bucket_idx) < KEYS_PER_BUCKET);

        let pos = entry.size(bucket_idx);
        self.dram.bucket(entry_idx, bucket_idx).set(pos, repr, word);
        entry.set_size(bucket_idx, pos + 1);
    }

    // -------------------------------------------------------------------------
    // Lookup
    // -------------------------------------------------------------------------

    pub(crate) fn lookup_internal(&self, key: KeyIn<'_>) -> Option<LookupHit<'_>> {
        let (entry_idx, subdivision) = self.dram_slot(key);
        let sub_start = subdivision * self.geo.buckets_per_subdivision;
        let sub_end = sub_start + self.geo.buckets_per_subdivision - 1;

        let entry = self.dram.entry(entry_idx);

        'retry: loop {
            let epoch = entry.epoch();

            // Buckets fill front to back, so the freshest version of a key
            // sits in the highest occupied bucket.
            for bucket_idx in (sub_start..=sub_end).rev() {
                if let Some(hit) = self.lookup_in_dram_bucket(entry_idx, bucket_idx, key) {
                    if entry.epoch() == epoch {
                        return Some(hit);
                    }
                    continue 'retry;
                }
            }

            for level in 0..self.levels() {
                if let Some(hit) = self.lookup_in_level(level, key) {
                    return Some(hit);
                }
            }
            return None;
        }
    }

    fn lookup_in_dram_bucket(
        &self,
        entry_idx: usize,
        bucket_idx: usize,
        key: KeyIn<'_>,
    ) -> Option<LookupHit<'_>> {
        let bucket = self.dram.bucket(entry_idx, bucket_idx);
        let size = self.dram.entry(entry_idx).size(bucket_idx);
        let repr = key.repr();

        for slot in (0..size).rev() {
            if bucket.key(slot) != repr {
                continue;
            }
            let word = bucket.value(slot);
            if let Some(hit) = self.qualify_hit(key, word, bucket, slot, true) {
                return Some(hit);
            }
        }
        None
    }

    fn lookup_in_level(&self, level: usize, key: KeyIn<'_>) -> Option<LookupHit<'_>> {
        let repr = key.repr();
        let entry_idx = self.pmem_entry_idx(level, repr);
        let probe = self.filter_hash(repr);

        'retry: loop {
            for bucket_idx in (0..BUCKETS_PER_DIRECTORY_ENTRY).rev() {
                let fp = &self.fingerprint(level, entry_idx).buckets[bucket_idx];
                if !fp.may_contain(probe) {
                    continue;
                }

                let entry = self.dirs.entry(level, entry_idx);
                let Some((bucket, _)) = self.pmem_bucket(level, entry_idx, bucket_idx) else {
                    continue;
                };

                // Snapshot epoch and size before probing; a migration that
                // lands in between is caught by the recheck.
                let epoch = entry.epoch();
                let size = entry.size();

                let bucket_len = Self::size_of_bucket(size, bucket_idx);
                for slot in (0..bucket_len).rev() {
                    if bucket.key(slot) != repr {
                        continue;
                    }
                    let word = bucket.value(slot);
                    if let Some(hit) = self.qualify_hit(key, word, bucket, slot, false) {
                        if entry.epoch() == epoch && entry.size() == size {
                            return Some(hit);
                        }
                        continue 'retry;
                    }
                }
            }
            return None;
        }
    }

    /// Turn a matching key word into a hit, filtering dead locators.
    fn qualify_hit<'a>(
        &self,
        key: KeyIn<'_>,
        word: u64,
        bucket: &'a Bucket,
        slot: usize,
        volatile: bool,
    ) -> Option<LookupHit<'a>> {
        let deleted = match key {
            KeyIn::Fixed(_) => word == TOMBSTONE_MARKER,
            KeyIn::Var(k) => {
                if !self.locator_alive(word, k) {
                    return None;
                }
                self.payload_at(word).value() == TOMBSTONE_MARKER.to_le_bytes()
            }
        };
        Some(LookupHit { deleted, word, bucket, slot, volatile })
    }

    pub(crate) fn lookup_fixed(&self, key: u64) -> Option<u64> {
        let hit = self.lookup_internal(KeyIn::Fixed(key))?;
        (!hit.deleted).then_some(hit.word)
    }

    pub(crate) fn lookup_var(&self, key: &[u8]) -> Option<Vec<u8>> {
        let hit = self.lookup_internal(KeyIn::Var(key))?;
        (!hit.deleted).then(|| self.payload_at(hit.word).value().to_vec())
    }

    // -------------------------------------------------------------------------
    // Payload Resolution
    // -------------------------------------------------------------------------

    /// View the record a packed locator points at, without liveness checks.
    pub(crate) fn payload_at(&self, raw: u64) -> PayloadView<'_> {
        let loc = self.locators.unpack(raw);
        let log = &self.payload[loc.log];
        PayloadView::at(&log.region, log.chunk_base(loc.chunk) + loc.offset)
    }

    /// A locator is alive iff its chunk epoch still matches and the record's
    /// key bytes equal the probe key (hash collisions fail here).
    pub(crate) fn locator_alive(&self, raw: u64, key: &[u8]) -> bool {
        let loc = self.locators.unpack(raw);
        let log = &self.payload[loc.log];
        if self.locators.epoch_tag(log.state().chunk_epoch(loc.chunk)) != loc.epoch {
            return false;
        }
        let end = log.chunk_base(loc.chunk) + self.cfg.payload_chunk_size as u64;
        let Some(view) = PayloadView::checked(&log.region, log.chunk_base(loc.chunk) + loc.offset, end)
        else {
            return false;
        };
        view.key() == key
    }

    // -------------------------------------------------------------------------
    // Payload Log Append
    // -------------------------------------------------------------------------

    /// Append a payload record and return its packed locator. The record is
    /// flushed before the locator escapes this function.
    pub(crate) fn log_payload(&self, key: &[u8], value: &[u8]) -> u64 {
        let log_idx = self.payload_log_idx(key);
        let log = &self.payload[log_idx];
        let record_size = entry_size(key.len(), value.len()) as u64;
        let chunk_size = self.cfg.payload_chunk_size as u64;
        assert!(record_size < chunk_size, "payload larger than a chunk");

        loop {
            let wc = log.state().write_chunk.load(Ordering::Acquire) as usize;
            let meta = &log.chunks[wc];
            let pos = meta.reserved.fetch_add(record_size, Ordering::Relaxed);

            if pos + record_size < chunk_size {
                let offset = log.chunk_base(wc) + pos;
                let view = PayloadView::at(&log.region, offset);
                view.write(key, value);
                log.region.persist_range(offset as usize, record_size as usize);
                meta.size.fetch_add(record_size, Ordering::Release);

                let epoch = self.locators.epoch_tag(log.state().chunk_epoch(wc));
                return self.locators.pack(log_idx, wc, epoch, pos);
            }

            if pos >= chunk_size {
                // Another writer straddled the boundary and owns the switch.
                log.wait_for_chunk_switch(wc as i32);
                continue;
            }

            // Our reservation straddles the end: we rotate the write chunk.
            let mut inner = log.inner.lock();

            // Wait until every smaller reservation is fully written.
            while meta.size.load(Ordering::Acquire) < pos {
                std::hint::spin_loop();
            }

            let next = log.find_free_chunk(wc + 1, wc);

            // Un-free before publishing, so a crash cannot hand the chunk
            // out twice.
            log.state().set_free(next, false);
            log.persist_state();
            log.state().write_chunk.store(next as i32, Ordering::Release);
            log.persist_state();
            log.notify_chunk_switch();

            inner.free_chunks -= 1;
            inner.compact_order.push_back(wc);
            tracing::debug!(log = log_idx, from = wc, to = next, "payload chunk rotated");

            if inner.free_chunks == 0 {
                self.compact_payload_log(log_idx, &mut inner);
            }
            drop(inner);
        }
    }

    // -------------------------------------------------------------------------
    // Maintenance
    // -------------------------------------------------------------------------

    /// Force-migrate every DRAM entry so the directory alone carries the
    /// dataset. Morsel-parallel over the DRAM directory.
    pub(crate) fn checkpoint(&self, threads: usize) {
        let threads = threads.max(1);
        let started = std::time::Instant::now();
        let size = self.geo.dram_directory_size;

        crossbeam::thread::scope(|scope| {
            for t in 0..threads {
                let start = size * t / threads;
                let end = size * (t + 1) / threads;
                scope.spawn(move |_| {
                    for entry_idx in start..end {
                        let _guard = self.dram.lock(entry_idx);
                        self.migrate_dram(entry_idx);
                    }
                });
            }
        })
        .expect("checkpoint worker panicked");

        info!(
            threads,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "checkpoint complete"
        );
    }

    /// Total live slot count, with per-tier occupancy reporting.
    pub(crate) fn count(&self) -> u64 {
        let mut dram_size = 0u64;
        for idx in 0..self.geo.dram_directory_size {
            dram_size += self.dram.used(idx) as u64;
        }
        let dram_cap =
            (self.geo.dram_directory_size * self.geo.entry_capacity) as u64;
        info!(
            tier = "dram",
            entries = dram_size,
            occupancy_pct = (dram_size as f64 / dram_cap as f64) * 100.0,
            "occupancy"
        );

        let mut total = dram_size;
        for level in 0..self.levels() {
            let mut level_size = 0u64;
            for idx in 0..self.geo.level_sizes[level] {
                level_size += self.dirs.entry(level, idx).size() as u64;
            }
            let level_cap = (self.geo.level_sizes[level] * self.geo.entry_capacity) as u64;
            info!(
                tier = "pmem",
                level,
                entries = level_size,
                occupancy_pct = (level_size as f64 / level_cap as f64) * 100.0,
                "occupancy"
            );
            total += level_size;
        }
        total
    }
}

fn remove_store_files(dir: &Path) -> Result<()> {
    for entry in std::fs::read_dir(dir)? {
        let entry = entry?;
        let name = entry.file_name();
        let name = name.to_string_lossy();
        let ours = matches!(name.as_ref(), "directories.dat" | "buckets.dat" | "metadata.dat")
            || name.starts_with("log")
            || name.starts_with("payload_log");
        if ours {
            remove_if_exists(&entry.path())?;
        }
    }
    Ok(())
}

fn remove_if_exists(path: &PathBuf) -> Result<()> {
    match std::fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e.into()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bucket_size_math() {
        assert_eq!(Table::free_bucket_idx(0), Some(0));
        assert_eq!(Table::free_bucket_idx(16), Some(1));
        assert_eq!(Table::free_bucket_idx(255), Some(15));
        assert_eq!(Table::free_bucket_idx(256), None);

        assert_eq!(Table::size_of_bucket(20, 0), KEYS_PER_BUCKET);
        assert_eq!(Table::size_of_bucket(20, 1), 4);
        assert_eq!(Table::size_of_bucket(20, 2), 0);
        assert_eq!(Table::size_of_bucket(256, 15), KEYS_PER_BUCKET);
    }

    #[test]
    fn open_without_store_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let err = Table::open(dir.path(), Config::default(), false, false).unwrap_err();
        assert!(matches!(err, TierError::StoreMissing(_)));
    }

    #[test]
    fn fixed_key_routing_is_stable() {
        let dir = tempfile::tempdir().unwrap();
        let table = Table::open(dir.path(), small_config(), false, true).unwrap();
        let a = table.dram_slot(KeyIn::Fixed(42));
        let b = table.dram_slot(KeyIn::Fixed(42));
        assert_eq!(a, b);
        assert_eq!(table.dram_slot_of_repr(42), a);
    }

    pub(crate) fn small_config() -> Config {
        Config::builder()
            .dram_bits(4)
            .pmem_bits(5)
            .fanout_bits(2)
            .subdivision_bits(1)
            .log_num_bits(1)
            .chunk_size(4096)
            .payload_chunk_size(16 * 4096)
            .build()
    }
}

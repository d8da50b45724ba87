//! Crash recovery.
//!
//! ## Responsibilities
//! - Reseed DRAM entry epochs from the durable level-0 epochs
//! - Replay every key/value log chain back into the DRAM tier
//! - Rebuild the DRAM-resident filters and the bucket allocator cursor
//!
//! Recovery writes nothing persistent, so a crash during recovery just
//! restarts it. Replay may surface a record twice when the crash interrupted
//! a log compaction; `reinsert` deduplicates in place, which makes the whole
//! pass idempotent.

use std::sync::atomic::Ordering;
use std::time::Instant;

use tracing::{debug, info};

use crate::config::{Partition, KEYS_PER_BUCKET};
use crate::table::Table;

impl Table {
    pub(crate) fn recover(&self) {
        let started = Instant::now();

        self.recover_dram_epochs();
        self.recover_payload_occupancy();

        let replay_started = Instant::now();
        crossbeam::thread::scope(|scope| {
            for log_idx in 0..self.geo.log_num {
                scope.spawn(move |_| self.replay_log(log_idx));
            }
        })
        .expect("log replay worker panicked");
        let replay_ms = replay_started.elapsed().as_millis() as u64;

        let filter_started = Instant::now();
        self.recover_filters_and_cursor();

        info!(
            replay_ms,
            filter_ms = filter_started.elapsed().as_millis() as u64,
            total_ms = started.elapsed().as_millis() as u64,
            "recovery complete"
        );
    }

    /// A DRAM entry's epoch restarts one past the smallest epoch among its
    /// level-0 children: every migration up to that epoch reached all of
    /// them, so only younger log records still need replaying.
    fn recover_dram_epochs(&self) {
        let fanout = self.level_fanout(0);
        for dram_idx in 0..self.geo.dram_directory_size {
            let mut min_epoch = u32::MAX;
            for counter in 0..fanout {
                let child = match self.cfg.partition {
                    Partition::Hash => {
                        (dram_idx | (counter << self.cfg.dram_bits))
                            & (self.geo.level_sizes[0] - 1)
                    }
                    Partition::Range => dram_idx * fanout + counter,
                };
                min_epoch = min_epoch.min(self.dirs.entry(0, child).epoch());
            }
            self.dram.entry(dram_idx).set_epoch(min_epoch + 1);
        }
    }

    /// Mark every in-use payload chunk as full. Dead space from the
    /// overestimate is reclaimed by the next compaction, which decides
    /// liveness from the directory, not from these counters.
    fn recover_payload_occupancy(&self) {
        let full = (self.cfg.payload_chunk_size - 1) as u64;
        for log in &self.payload {
            let st = log.state();
            for chunk in 0..log.chunk_count() {
                if !st.is_free(chunk) {
                    log.chunks[chunk].size.store(full, Ordering::Relaxed);
                    log.chunks[chunk].reserved.store(full, Ordering::Relaxed);
                }
            }
        }
    }

    /// Walk one log's active chain and reinsert every record still younger
    /// than its DRAM entry's epoch.
    fn replay_log(&self, log_idx: usize) {
        let log = &self.logs[log_idx];
        let st = log.state();

        let mut chunk = st.first_chunk.load(Ordering::Relaxed);
        while chunk != -1 {
            let meta = &log.chunks[chunk as usize];
            meta.reset();
            for part in 0..self.geo.epochs_per_chunk {
                // Assume everything is live; runtime fetch-max amortizes the
                // real maxima back in.
                meta.raise_epoch(part, u32::MAX);
            }

            let expected = st.expected_bit(chunk);
            let mut recovered = 0u64;
            let mut high = 0u64;

            for pos in 0..log.max_entries() as u64 {
                let record = log.entry(chunk, pos);
                if !record.is_valid(expected) {
                    // Torn by the crash; a later valid record may still
                    // follow it, so keep scanning.
                    continue;
                }
                high = pos + 1;
                let key = record.key();
                let (dram_idx, _) = self.dram_slot_of_repr(key);
                if record.epoch() >= self.dram.entry(dram_idx).epoch() {
                    self.reinsert(key, record.value());
                }
                recovered += 1;
            }

            // Resume appends past the last valid record, holes included,
            // so nothing durable gets overwritten.
            meta.reserved.store(high, Ordering::Relaxed);
            meta.size.store(high, Ordering::Relaxed);

            if recovered > 0 {
                debug!(log = log_idx, chunk, entries = recovered, "replayed log chunk");
            }
            chunk = st.next(chunk);
        }
    }

    /// Rebuild the DRAM filters for the shallow levels and rediscover the
    /// highest allocated bucket, morsel-parallel over each level.
    fn recover_filters_and_cursor(&self) {
        let threads = self.cfg.filter_recovery_threads.max(1);
        let mut max_idx = 0u64;

        crossbeam::thread::scope(|scope| {
            let handles: Vec<_> = (0..threads)
                .map(|t| scope.spawn(move |_| self.recover_partition(t, threads)))
                .collect();
            for handle in handles {
                let partition_max = handle.join().expect("filter recovery worker panicked");
                max_idx = max_idx.max(partition_max);
            }
        })
        .expect("filter recovery worker panicked");

        self.buckets
            .set_cursor(self.geo.prealloc_buckets.max(max_idx + 1));
    }

    fn recover_partition(&self, thread_idx: usize, threads: usize) -> u64 {
        let mut max_idx = 0u64;

        for level in 0..self.levels() {
            let rebuild_filters = level <= self.cfg.max_filter_level;
            let track_pointers = level > self.cfg.max_prealloc_level;
            if !rebuild_filters && !track_pointers {
                continue;
            }

            let size = self.geo.level_sizes[level];
            let start = size * thread_idx / threads;
            let end = size * (thread_idx + 1) / threads;

            for entry_idx in start..end {
                let entry = self.dirs.entry(level, entry_idx);

                if rebuild_filters {
                    let mut remaining = entry.size();
                    let mut bucket_idx = 0;
                    while remaining > 0 {
                        let n = remaining.min(KEYS_PER_BUCKET);
                        if let Some((bucket, _)) = self.pmem_bucket(level, entry_idx, bucket_idx)
                        {
                            let keys: Vec<u64> = (0..n).map(|slot| bucket.key(slot)).collect();
                            self.insert_into_filter(&keys, level, entry_idx, bucket_idx);
                        }
                        remaining -= n;
                        bucket_idx += 1;
                    }
                }

                if track_pointers {
                    if let Some(m) = entry.max_bucket_index() {
                        max_idx = max_idx.max(m);
                    }
                }
            }
        }
        max_idx
    }
}

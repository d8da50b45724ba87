//! Key/value write-ahead log.
//!
//! ## Responsibilities
//! - Persist every logged insert as a packed three-word record
//! - Chain chunks through a persistent free list and rotate the write chunk
//!   when it fills
//! - Compact retired chunks, dropping records the directory has already
//!   made durable through migration
//!
//! Each log partition is one mapped file: a [`LogState`] header followed by
//! its chunks. Writers claim slots with a fetch-add; the writer whose claim
//! lands past the end of the chunk becomes the rotator (and, if the chunk
//! chain demands it, the compactor) while everyone else waits on the
//! chunk-switch condvar.

pub mod entry;
pub mod state;

use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::{Condvar, Mutex};
use tracing::debug;

use crate::config::Partition;
use crate::error::Result;
use crate::pmem::MappedRegion;
use crate::table::{KeyIn, Table};
use crate::wal::entry::{LogEntry, LOG_ENTRY_SIZE};
use crate::wal::state::{ChunkMeta, LogState, LOG_STATE_SIZE};

/// One key/value log partition.
pub struct KvLog {
    pub(crate) region: MappedRegion,
    pub(crate) chunks: Vec<ChunkMeta>,
    chunk_size: usize,
    max_entries: usize,

    /// Compactor election flag; the rotation path is single-writer.
    is_compacting: AtomicBool,
    switch_lock: Mutex<()>,
    chunk_switched: Condvar,
}

impl KvLog {
    pub fn open(
        path: &Path,
        chunks_per_log: usize,
        chunk_size: usize,
        epochs_per_chunk: usize,
        fresh: bool,
    ) -> Result<KvLog> {
        let region = MappedRegion::open(path, LOG_STATE_SIZE + chunks_per_log * chunk_size)?;
        let log = KvLog {
            region,
            chunks: (0..chunks_per_log).map(|_| ChunkMeta::new(epochs_per_chunk)).collect(),
            chunk_size,
            max_entries: chunk_size / LOG_ENTRY_SIZE,
            is_compacting: AtomicBool::new(false),
            switch_lock: Mutex::new(()),
            chunk_switched: Condvar::new(),
        };
        if fresh {
            log.init_state(chunks_per_log);
        }
        Ok(log)
    }

    /// Fresh layout: chunk 3 is the write chunk and head of the active
    /// chain, chunks 0..=2 seed the free list, the rest chain behind the
    /// write chunk. Zeroed storage starts invalid because every expected
    /// bit starts at 1.
    fn init_state(&self, chunks_per_log: usize) {
        let st = self.state();
        st.write_chunk.store(3, Ordering::Relaxed);
        st.first_chunk.store(3, Ordering::Relaxed);
        st.first_free_chunk.store(0, Ordering::Relaxed);
        st.compact_target.store(-1, Ordering::Relaxed);

        st.next_of[0].store(1, Ordering::Relaxed);
        st.next_of[1].store(2, Ordering::Relaxed);
        st.next_of[2].store(-1, Ordering::Relaxed);
        for idx in 3..chunks_per_log - 1 {
            st.next_of[idx].store(idx as i32 + 1, Ordering::Relaxed);
        }
        st.next_of[chunks_per_log - 1].store(-1, Ordering::Relaxed);

        for idx in 0..chunks_per_log {
            st.valid_bits[idx].store(1, Ordering::Relaxed);
        }
        self.persist_state();
    }

    pub fn state(&self) -> &LogState {
        self.region.record::<LogState>(0)
    }

    pub fn persist_state(&self) {
        self.region.persist_range(0, LOG_STATE_SIZE);
    }

    pub fn entry(&self, chunk: i32, pos: u64) -> &LogEntry {
        debug_assert!((pos as usize) < self.max_entries);
        let offset =
            LOG_STATE_SIZE + chunk as usize * self.chunk_size + pos as usize * LOG_ENTRY_SIZE;
        self.region.record::<LogEntry>(offset)
    }

    pub fn max_entries(&self) -> usize {
        self.max_entries
    }

    fn wait_for_chunk_switch(&self, seen: i32) {
        let mut guard = self.switch_lock.lock();
        while self.state().write_chunk.load(Ordering::Acquire) == seen {
            self.chunk_switched.wait(&mut guard);
        }
    }

    fn notify_chunk_switch(&self) {
        let _guard = self.switch_lock.lock();
        self.chunk_switched.notify_all();
    }

    fn end_compacting(&self) {
        self.is_compacting.store(false, Ordering::Release);
        self.notify_chunk_switch();
    }

    /// Scrub a reclaimed chunk. Zeroed records carry epoch 0, which replay
    /// always filters out, so the chunk can cycle through any number of
    /// validity-bit flips without resurrecting old data.
    fn zero_chunk(&self, chunk: i32) {
        let offset = LOG_STATE_SIZE + chunk as usize * self.chunk_size;
        self.region.zero(offset, self.chunk_size);
    }
}

// =============================================================================
// Append and Compaction
// =============================================================================

impl Table {
    /// Append a record for `key` under the entry epoch it was inserted at.
    /// Called with the key's DRAM entry lock held.
    pub(crate) fn append_log(&self, key: KeyIn<'_>, word: u64, epoch: u32) {
        let log_idx = self.log_idx(key);
        let log = &self.logs[log_idx];
        let st = log.state();

        loop {
            let wc = st.write_chunk.load(Ordering::Acquire);
            let meta = &log.chunks[wc as usize];
            let pos = meta.reserved.fetch_add(1, Ordering::Relaxed);

            if (pos as usize) < log.max_entries() {
                let (dram_idx, _) = self.dram_slot(key);
                meta.raise_epoch(self.epoch_partition(dram_idx), epoch);

                log.entry(wc, pos)
                    .persist(key.repr(), word, epoch, st.expected_bit(wc));
                meta.size.fetch_add(1, Ordering::Release);
                return;
            }

            // Chunk exhausted. One thread rotates; the rest wait it out.
            if log.is_compacting.swap(true, Ordering::Acquire) {
                log.wait_for_chunk_switch(wc);
                continue;
            }
            if wc != st.write_chunk.load(Ordering::Acquire) {
                // Rotated while we raced for the flag.
                log.end_compacting();
                continue;
            }

            self.advance_write_chunk(log_idx, wc);
            log.end_compacting();
        }
    }

    /// Move the write cursor off a full chunk. Runs with the compacting
    /// flag held.
    fn advance_write_chunk(&self, log_idx: usize, full_chunk: i32) {
        let log = &self.logs[log_idx];
        let st = log.state();

        if st.next(full_chunk) != -1 {
            // A pre-linked successor exists; just step onto it.
            st.write_chunk.store(st.next(full_chunk), Ordering::Release);
            log.persist_state();
            log.notify_chunk_switch();
            debug!(log = log_idx, chunk = st.write_chunk.load(Ordering::Relaxed), "log chunk rotated");
            return;
        }

        // Take the head of the free list as the new write chunk. Link
        // before publish, flushing at each step, so a crash never strands
        // records outside the chain.
        let next = st.first_free_chunk.load(Ordering::Relaxed);
        assert!(next != -1, "key/value log exhausted");

        st.next_of[full_chunk as usize].store(next, Ordering::Relaxed);
        st.write_chunk.store(next, Ordering::Release);
        log.persist_state();

        st.first_free_chunk.store(st.next(next), Ordering::Relaxed);
        st.next_of[next as usize].store(-1, Ordering::Relaxed);
        log.persist_state();

        log.notify_chunk_switch();
        debug!(log = log_idx, chunk = next, "log chunk rotated");

        if st.compact_target.load(Ordering::Relaxed) == -1 {
            // Prepend a fresh chunk at the head of the chain for survivors.
            let target = st.first_free_chunk.load(Ordering::Relaxed);
            assert!(target != -1, "key/value log exhausted");
            st.first_free_chunk.store(st.next(target), Ordering::Relaxed);

            st.next_of[target as usize].store(st.first_chunk.load(Ordering::Relaxed), Ordering::Relaxed);
            log.persist_state();
            st.first_chunk.store(target, Ordering::Relaxed);
            st.compact_target.store(target, Ordering::Relaxed);
            log.persist_state();
        }

        let victim = st.next(st.compact_target.load(Ordering::Relaxed));
        let victim_meta = &log.chunks[victim as usize];

        if victim_meta.reserved.load(Ordering::Relaxed) as usize >= log.max_entries() {
            // Wait out writers still flushing their claimed slots.
            while (victim_meta.size.load(Ordering::Acquire) as usize) < log.max_entries() {
                std::hint::spin_loop();
            }
            self.compact_log(log_idx);
        }
    }

    /// Compact the chunk behind the compact target: drop retired and
    /// invalid records, move survivors forward, recycle the chunk.
    fn compact_log(&self, log_idx: usize) {
        let log = &self.logs[log_idx];
        let st = log.state();

        let victim = st.next(st.compact_target.load(Ordering::Relaxed));
        let victim_meta = &log.chunks[victim as usize];
        let expected_bit = st.expected_bit(victim);

        // Whole-chunk skip: if every partition's newest record predates its
        // DRAM epoch, nothing in the chunk is live. The partition-to-entry
        // mapping only holds under hash partitioning.
        let mut can_skip = self.cfg.partition == Partition::Hash;
        if can_skip {
            for part in 0..self.geo.epochs_per_chunk {
                let dram_idx = (part << self.cfg.log_num_bits) | log_idx;
                if victim_meta.max_epochs[part].load(Ordering::Relaxed)
                    >= self.dram.entry(dram_idx).epoch()
                {
                    can_skip = false;
                    break;
                }
            }
        }

        let total = victim_meta.size.load(Ordering::Acquire);
        let mut read_pos = 0u64;
        let mut survivors = 0u64;

        while !can_skip && read_pos < total {
            let record = log.entry(victim, read_pos);
            let (dram_idx, _) = self.dram_slot_of_repr(record.key());

            if record.epoch() < self.dram.entry(dram_idx).epoch()
                || !record.is_valid(expected_bit)
            {
                // Retired by a migration, or torn by a crash.
                read_pos += 1;
                continue;
            }

            if self.move_log_entry(log_idx, victim, read_pos) {
                read_pos += 1;
                survivors += 1;
            } else {
                self.extend_compact_target(log_idx);
            }
        }

        victim_meta.reset();
        log.zero_chunk(victim);
        st.flip_valid_bit(victim);

        if st.next(victim) == st.write_chunk.load(Ordering::Relaxed) {
            // Caught up with the writer; restart compaction from the front
            // next time around.
            st.compact_target.store(-1, Ordering::Relaxed);
        } else {
            st.next_of[st.compact_target.load(Ordering::Relaxed) as usize]
                .store(st.next(victim), Ordering::Relaxed);
        }
        log.persist_state();

        st.next_of[victim as usize].store(st.first_free_chunk.load(Ordering::Relaxed), Ordering::Relaxed);
        st.first_free_chunk.store(victim, Ordering::Relaxed);
        log.persist_state();

        debug!(log = log_idx, from = total, to = survivors, "log chunk compacted");
    }

    /// Copy one surviving record into the compact target. False when the
    /// target is full.
    fn move_log_entry(&self, log_idx: usize, source_chunk: i32, read_pos: u64) -> bool {
        let log = &self.logs[log_idx];
        let st = log.state();
        let target = st.compact_target.load(Ordering::Relaxed);
        let target_meta = &log.chunks[target as usize];

        let write_pos = target_meta.size.load(Ordering::Relaxed);
        if write_pos as usize >= log.max_entries() {
            return false;
        }

        let source = log.entry(source_chunk, read_pos);

        // The target must inherit the survivor's epoch, or the whole-chunk
        // skip check would later judge it dead while it still holds live
        // records.
        let (dram_idx, _) = self.dram_slot_of_repr(source.key());
        target_meta.raise_epoch(self.epoch_partition(dram_idx), source.epoch());

        log.entry(target, write_pos).persist(
            source.key(),
            source.value(),
            source.epoch(),
            st.expected_bit(target),
        );
        target_meta.size.fetch_add(1, Ordering::Relaxed);
        target_meta.reserved.fetch_add(1, Ordering::Relaxed);
        true
    }

    /// The compact target filled up mid-compaction: splice a fresh chunk in
    /// behind it and continue there.
    fn extend_compact_target(&self, log_idx: usize) {
        let log = &self.logs[log_idx];
        let st = log.state();

        let old_target = st.compact_target.load(Ordering::Relaxed);
        let successor = st.next(old_target);

        let fresh = st.first_free_chunk.load(Ordering::Relaxed);
        assert!(fresh != -1, "key/value log exhausted");
        st.first_free_chunk.store(st.next(fresh), Ordering::Relaxed);
        log.persist_state();

        st.compact_target.store(fresh, Ordering::Relaxed);
        log.persist_state();

        st.next_of[fresh as usize].store(successor, Ordering::Relaxed);
        log.persist_state();

        st.next_of[old_target as usize].store(fresh, Ordering::Relaxed);
        log.persist_state();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fresh_log_state_layout() {
        let dir = tempfile::tempdir().unwrap();
        let log = KvLog::open(&dir.path().join("log0.dat"), 6, 4096, 8, true).unwrap();
        let st = log.state();

        assert_eq!(st.write_chunk.load(Ordering::Relaxed), 3);
        assert_eq!(st.first_chunk.load(Ordering::Relaxed), 3);
        assert_eq!(st.first_free_chunk.load(Ordering::Relaxed), 0);
        assert_eq!(st.compact_target.load(Ordering::Relaxed), -1);

        // Free list 0 -> 1 -> 2, active chain 3 -> 4 -> 5.
        assert_eq!(st.next(0), 1);
        assert_eq!(st.next(1), 2);
        assert_eq!(st.next(2), -1);
        assert_eq!(st.next(3), 4);
        assert_eq!(st.next(5), -1);
        assert_eq!(st.chain_len(), 3);

        assert!(st.expected_bit(0));
        // Zeroed storage must read invalid under the initial expectation.
        assert!(!log.entry(3, 0).is_valid(st.expected_bit(3)));
    }

    #[test]
    fn entries_round_trip_through_the_file() {
        let dir = tempfile::tempdir().unwrap();
        let log = KvLog::open(&dir.path().join("log0.dat"), 6, 4096, 8, true).unwrap();

        log.entry(3, 0).persist(17, 99, 2, true);
        log.entry(3, 1).persist(18, 100, 2, true);
        assert_eq!(log.entry(3, 0).key(), 17);
        assert_eq!(log.entry(3, 1).value(), 100);
        assert_eq!(log.max_entries(), 4096 / LOG_ENTRY_SIZE);
    }
}

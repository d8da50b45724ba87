//! Payload log for variable-length keys and values.
//!
//! ## Responsibilities
//! - Store raw key/value bytes and hand out packed locators for them
//! - Rotate write chunks through a persistent free map
//! - Compact in arrival order when the free map runs dry, re-pointing live
//!   directory slots at the moved records
//!
//! Each partition is one mapped file: a [`PayloadState`] header followed by
//! its chunks. Unlike the key/value log, reservation is byte-granular and a
//! chunk's epoch counter is what invalidates locators into it after
//! compaction.

mod entry;
mod locator;

pub use entry::{entry_size, PayloadView, PAYLOAD_HEADER_SIZE};
pub use locator::{LocatorLayout, PayloadLocator};

use std::collections::VecDeque;
use std::path::Path;
use std::sync::atomic::{AtomicI32, AtomicU32, AtomicU64, AtomicU8, Ordering};

use parking_lot::{Condvar, Mutex};
use tracing::info;

use crate::config::MAX_PAYLOAD_CHUNKS;
use crate::error::Result;
use crate::pmem::{MappedRegion, PmemRecord};
use crate::table::{KeyIn, Table};

/// On-media size of [`PayloadState`].
pub const PAYLOAD_STATE_SIZE: usize = 512;

/// Persistent header of one payload log, at offset 0 of its file.
///
/// `chunk_epochs` starts at 1 per chunk and is bumped when the chunk is
/// compacted away; locators carry the epoch they were minted under, so a
/// mismatch marks them dead. `free` is a plain byte map (1 = reusable).
#[repr(C, align(512))]
pub struct PayloadState {
    pub write_chunk: AtomicI32,
    pub compact_chunk: AtomicI32,
    pub chunk_epochs: [AtomicU32; MAX_PAYLOAD_CHUNKS],
    pub free: [AtomicU8; MAX_PAYLOAD_CHUNKS],
}

unsafe impl PmemRecord for PayloadState {}

const _: () = assert!(std::mem::size_of::<PayloadState>() <= PAYLOAD_STATE_SIZE);

impl PayloadState {
    pub fn chunk_epoch(&self, chunk: usize) -> u32 {
        self.chunk_epochs[chunk].load(Ordering::Acquire)
    }

    pub fn is_free(&self, chunk: usize) -> bool {
        self.free[chunk].load(Ordering::Relaxed) != 0
    }

    pub fn set_free(&self, chunk: usize, free: bool) {
        self.free[chunk].store(free as u8, Ordering::Relaxed);
    }
}

/// Volatile byte-granular fill counters for one chunk.
pub struct PayloadChunkMeta {
    pub size: AtomicU64,
    pub reserved: AtomicU64,
}

impl PayloadChunkMeta {
    fn new() -> Self {
        Self { size: AtomicU64::new(0), reserved: AtomicU64::new(0) }
    }

    pub fn reset(&self) {
        self.size.store(0, Ordering::Relaxed);
        self.reserved.store(0, Ordering::Relaxed);
    }
}

/// Rotation and compaction bookkeeping, guarded by the log mutex.
pub struct PayloadInner {
    pub free_chunks: usize,
    /// Retired write chunks, oldest first; compaction drains from the front.
    pub compact_order: VecDeque<usize>,
}

pub struct PayloadLog {
    pub(crate) region: MappedRegion,
    pub(crate) chunks: Vec<PayloadChunkMeta>,
    pub(crate) inner: Mutex<PayloadInner>,
    chunk_size: usize,
    chunk_count: usize,

    wait_lock: Mutex<()>,
    chunk_switched: Condvar,
}

impl PayloadLog {
    pub fn open(path: &Path, chunk_count: usize, chunk_size: usize, fresh: bool) -> Result<PayloadLog> {
        let region = MappedRegion::open(path, PAYLOAD_STATE_SIZE + chunk_count * chunk_size)?;
        let log = PayloadLog {
            region,
            chunks: (0..chunk_count).map(|_| PayloadChunkMeta::new()).collect(),
            inner: Mutex::new(PayloadInner { free_chunks: 0, compact_order: VecDeque::new() }),
            chunk_size,
            chunk_count,
            wait_lock: Mutex::new(()),
            chunk_switched: Condvar::new(),
        };

        if fresh {
            log.init_state();
        } else {
            log.derive_inner();
        }
        Ok(log)
    }

    /// Fresh layout: chunk 0 is reserved as the compact target, chunk 1
    /// takes writes, everything else is free at epoch 1.
    fn init_state(&self) {
        let st = self.state();
        st.compact_chunk.store(0, Ordering::Relaxed);
        st.write_chunk.store(1, Ordering::Relaxed);
        for chunk in 0..self.chunk_count {
            st.set_free(chunk, chunk >= 2);
            st.chunk_epochs[chunk].store(1, Ordering::Relaxed);
        }
        self.persist_state();

        let mut inner = self.inner.lock();
        inner.free_chunks = self.chunk_count - 2;
    }

    /// Rebuild the volatile bookkeeping from the persistent free map after a
    /// restart: retired chunks re-queue for compaction in index order.
    fn derive_inner(&self) {
        let st = self.state();
        let write = st.write_chunk.load(Ordering::Relaxed) as usize;
        let compact = st.compact_chunk.load(Ordering::Relaxed) as usize;

        let mut inner = self.inner.lock();
        for chunk in 0..self.chunk_count {
            if st.is_free(chunk) {
                inner.free_chunks += 1;
            } else if chunk != write && chunk != compact {
                inner.compact_order.push_back(chunk);
            }
        }
    }

    pub fn state(&self) -> &PayloadState {
        self.region.record::<PayloadState>(0)
    }

    pub fn persist_state(&self) {
        self.region.persist_range(0, PAYLOAD_STATE_SIZE);
    }

    pub fn chunk_base(&self, chunk: usize) -> u64 {
        (PAYLOAD_STATE_SIZE + chunk * self.chunk_size) as u64
    }

    pub fn chunk_count(&self) -> usize {
        self.chunk_count
    }

    /// First free chunk at or after `from`, wrapping. Exhaustion is fatal:
    /// nothing can make progress without a writable chunk.
    pub fn find_free_chunk(&self, from: usize, full_marker: usize) -> usize {
        let mut chunk = from % self.chunk_count;
        while !self.state().is_free(chunk) {
            assert!(chunk != full_marker, "payload log exhausted");
            chunk = (chunk + 1) % self.chunk_count;
        }
        chunk
    }

    pub fn wait_for_chunk_switch(&self, seen: i32) {
        let mut guard = self.wait_lock.lock();
        while self.state().write_chunk.load(Ordering::Acquire) == seen {
            self.chunk_switched.wait(&mut guard);
        }
    }

    pub fn notify_chunk_switch(&self) {
        let _guard = self.wait_lock.lock();
        self.chunk_switched.notify_all();
    }
}

// =============================================================================
// Compaction
// =============================================================================

impl Table {
    /// Compact the oldest retired chunk of one payload log. Runs under the
    /// log's rotation mutex; takes DRAM entry locks one key at a time.
    pub(crate) fn compact_payload_log(&self, log_idx: usize, inner: &mut PayloadInner) {
        let log = &self.payload[log_idx];
        let st = log.state();
        let chunk_size = self.cfg.payload_chunk_size as u64;

        let victim = inner
            .compact_order
            .pop_front()
            .expect("no retired payload chunk to compact");
        let victim_meta = &log.chunks[victim];
        let victim_base = log.chunk_base(victim);
        let old_size = victim_meta.size.load(Ordering::Acquire);

        let mut read_pos = 0u64;
        let mut kept = 0u64;

        while read_pos < old_size {
            // After recovery the tail of a chunk may be zeros or garbage;
            // a record that does not fit terminates the walk.
            let Some(record) =
                PayloadView::checked(&log.region, victim_base + read_pos, victim_base + chunk_size)
            else {
                break;
            };
            let record_size = record.size() as u64;

            if self.cfg.imm_mark_invalid && record.is_deleted() {
                read_pos += record_size;
                continue;
            }

            let key = record.key();
            let (dram_idx, _) = self.dram_slot(KeyIn::Var(key));

            // Hold the entry lock so no migration moves the slot while we
            // swap its locator.
            let _guard = self.dram.lock(dram_idx);

            if let Some(hit) = self.lookup_internal(KeyIn::Var(key)) {
                let loc = self.locators.unpack(hit.word);
                if loc.log == log_idx && loc.chunk == victim && loc.offset == read_pos {
                    self.relocate_payload(log_idx, inner, read_pos, record_size, &hit, key);
                    kept += record_size;
                }
            }
            read_pos += record_size;
        }

        // Invalidate every locator still pointing here, then scrub so the
        // chunk re-enters service with a clean tail.
        st.chunk_epochs[victim].fetch_add(1, Ordering::Release);
        log.persist_state();
        log.region.zero(victim_base as usize, self.cfg.payload_chunk_size);

        info!(
            log = log_idx,
            chunk = victim,
            from_bytes = old_size,
            to_bytes = kept,
            "payload chunk compacted"
        );

        st.set_free(victim, true);
        victim_meta.reset();
        inner.free_chunks += 1;
        log.persist_state();
    }

    /// Move one live record into the compact chunk and swing the directory
    /// slot over to it.
    fn relocate_payload(
        &self,
        log_idx: usize,
        inner: &mut PayloadInner,
        read_pos: u64,
        record_size: u64,
        hit: &crate::table::LookupHit<'_>,
        key: &[u8],
    ) {
        let log = &self.payload[log_idx];
        let st = log.state();
        let chunk_size = self.cfg.payload_chunk_size as u64;

        let mut target = st.compact_chunk.load(Ordering::Relaxed) as usize;
        if log.chunks[target].size.load(Ordering::Relaxed) + record_size >= chunk_size {
            // Current compact chunk is full; claim the next free one.
            let next = log.find_free_chunk(target + 1, target);
            st.set_free(next, false);
            log.persist_state();
            st.compact_chunk.store(next as i32, Ordering::Relaxed);
            log.persist_state();
            inner.free_chunks -= 1;
            target = next;
        }
        let target_meta = &log.chunks[target];
        let write_pos = target_meta.size.load(Ordering::Relaxed);

        let source_offset = log.chunk_base(self.locators.unpack(hit.word).chunk) + read_pos;
        let target_offset = log.chunk_base(target) + write_pos;

        let mut buf = vec![0u8; record_size as usize];
        log.region.read_bytes(source_offset as usize, &mut buf);
        log.region.write_bytes(target_offset as usize, &buf);
        log.region.persist_range(target_offset as usize, record_size as usize);

        let epoch = self.locators.epoch_tag(st.chunk_epoch(target));
        let new_word = self.locators.pack(log_idx, target, epoch, write_pos);

        if hit.volatile {
            // The slot only lives in DRAM; re-log it so recovery can find
            // the record at its new position.
            self.append_log(
                KeyIn::Var(key),
                new_word,
                self.dram.entry(self.dram_slot(KeyIn::Var(key)).0).epoch(),
            );
        }

        if !hit.bucket.cas_value(hit.slot, hit.word, new_word) {
            panic!("payload slot changed under the compaction lock");
        }
        if !hit.volatile {
            hit.bucket.flush_value(hit.slot);
        }

        target_meta.size.fetch_add(record_size, Ordering::Relaxed);
        target_meta.reserved.fetch_add(record_size, Ordering::Relaxed);
    }
}

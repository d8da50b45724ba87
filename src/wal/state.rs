//! Persistent per-log state and volatile per-chunk bookkeeping.

use std::sync::atomic::{AtomicI32, AtomicU32, AtomicU64, AtomicU8, Ordering};

use crate::config::MAX_CHUNKS_PER_LOG;
use crate::pmem::PmemRecord;

/// On-media size of [`LogState`].
pub const LOG_STATE_SIZE: usize = 256;

/// Persistent header of one key/value log, stored at offset 0 of its file.
///
/// Chunk indices are `i32` with `-1` as the end-of-chain / absent sentinel.
/// `next_of` threads chunks into two singly linked lists: the active chain
/// starting at `first_chunk` and the free list starting at
/// `first_free_chunk`. `valid_bits` holds the expected validity bit for each
/// chunk; it flips every time a chunk cycles through the free list so stale
/// records self-invalidate.
#[repr(C, align(256))]
pub struct LogState {
    pub write_chunk: AtomicI32,
    pub first_chunk: AtomicI32,
    pub first_free_chunk: AtomicI32,
    /// Chunk currently being drained by compaction, `-1` when idle. Consulted
    /// during recovery to finish or discard a half-done compaction.
    pub compact_target: AtomicI32,
    pub valid_bits: [AtomicU8; MAX_CHUNKS_PER_LOG],
    pub next_of: [AtomicI32; MAX_CHUNKS_PER_LOG],
}

unsafe impl PmemRecord for LogState {}

const _: () = assert!(std::mem::size_of::<LogState>() <= LOG_STATE_SIZE);

impl LogState {
    pub fn expected_bit(&self, chunk: i32) -> bool {
        self.valid_bits[chunk as usize].load(Ordering::Relaxed) != 0
    }

    pub fn next(&self, chunk: i32) -> i32 {
        self.next_of[chunk as usize].load(Ordering::Relaxed)
    }

    /// Flip a recycled chunk's expected bit so a record torn during its
    /// next fill cannot pass validation by accident.
    pub fn flip_valid_bit(&self, chunk: i32) {
        self.valid_bits[chunk as usize].fetch_xor(1, Ordering::Relaxed);
    }

    /// Number of chunks on the active chain.
    pub fn chain_len(&self) -> usize {
        let mut n = 0;
        let mut c = self.first_chunk.load(Ordering::Relaxed);
        while c >= 0 {
            n += 1;
            c = self.next(c);
        }
        n
    }
}

/// Volatile append cursor and epoch summary for one chunk.
///
/// `reserved` is bumped by writers claiming a slot, `size` only after the
/// record is flushed; a chunk is quiescent when the two agree. `max_epochs`
/// tracks, per bucket-range partition, the newest directory epoch any record
/// in the chunk was written under, so compaction can drop whole chunks whose
/// every record has already been retired by migration.
pub struct ChunkMeta {
    pub size: AtomicU64,
    pub reserved: AtomicU64,
    pub max_epochs: Vec<AtomicU32>,
}

impl ChunkMeta {
    pub fn new(partitions: usize) -> Self {
        Self {
            size: AtomicU64::new(0),
            reserved: AtomicU64::new(0),
            max_epochs: (0..partitions).map(|_| AtomicU32::new(0)).collect(),
        }
    }

    pub fn reset(&self) {
        self.size.store(0, Ordering::Relaxed);
        self.reserved.store(0, Ordering::Relaxed);
        for e in &self.max_epochs {
            e.store(0, Ordering::Relaxed);
        }
    }

    /// Raise the recorded epoch for a partition, never lowering it.
    pub fn raise_epoch(&self, partition: usize, epoch: u32) {
        self.max_epochs[partition].fetch_max(epoch, Ordering::Relaxed);
    }
}

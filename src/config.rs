//! Configuration for tierkv
//!
//! Centralized configuration with sensible defaults.
//!
//! Two kinds of knobs exist. Sizing knobs (directory bit widths, partition
//! counts, chunk sizes, level cutoffs) are runtime configuration, validated
//! once and frozen into a [`Geometry`] at open time. Layout constants (bucket
//! geometry, record formats) define the on-media format and are fixed at
//! compile time; changing them makes existing stores unreadable.

use crate::error::{Result, TierError};

// =============================================================================
// On-Media Layout Constants
// =============================================================================

/// log2 of the number of slots in one bucket.
pub const KEYS_PER_BUCKET_BITS: u32 = 4;

/// Slots per bucket, in both the DRAM and PMEM representation.
pub const KEYS_PER_BUCKET: usize = 1 << KEYS_PER_BUCKET_BITS;

/// Buckets owned by one directory entry (DRAM or PMEM).
pub const BUCKETS_PER_DIRECTORY_ENTRY: usize = 16;

/// Upper bound on the number of PMEM directory levels a store can grow to.
pub const MAX_PMEM_LEVELS: usize = 4;

/// Upper bound on key/value log chunks per partition (sizes the persistent
/// free-list arrays).
pub(crate) const MAX_CHUNKS_PER_LOG: usize = 16;

/// Upper bound on payload log chunks per partition.
pub(crate) const MAX_PAYLOAD_CHUNKS: usize = 64;

/// Scratch capacity per rehash target partition during migration. Equals the
/// full capacity of a directory entry.
pub(crate) const MAX_REHASH_PARTITION: usize = BUCKETS_PER_DIRECTORY_ENTRY * KEYS_PER_BUCKET;

/// Sentinel value marking a logically deleted fixed-size key. For
/// variable-length keys the same eight bytes form the tombstone payload.
pub(crate) const TOMBSTONE_MARKER: u64 = 0xFEED_C0FF_EE22_AA77;

/// Seed for the 64-bit key representation hash.
pub(crate) const HASH_SEED: u64 = 0xDEAD_BEEF;

// =============================================================================
// Runtime Configuration
// =============================================================================

/// How keys are distributed over directory entries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Partition {
    /// Hash-partitioned: uniform spread, no meaningful `scan` order.
    Hash,

    /// Range-partitioned: keys land in directory entries in key order, which
    /// makes ordered `scan` possible. Fixed-size keys only.
    Range,
}

/// Main configuration for a store instance
#[derive(Debug, Clone)]
pub struct Config {
    // -------------------------------------------------------------------------
    // Directory Sizing
    // -------------------------------------------------------------------------
    /// log2 of the DRAM directory entry count.
    pub dram_bits: u32,

    /// log2 of the PMEM level-0 directory entry count. Must be >= dram_bits.
    pub pmem_bits: u32,

    /// log2 of the per-level fanout for levels 1 and above.
    pub fanout_bits: u32,

    /// log2 of the number of subdivisions inside one DRAM directory entry.
    pub subdivision_bits: u32,

    /// Number of PMEM levels backing files are sized for.
    pub max_pmem_levels: usize,

    /// Highest level whose bucket fingerprints live in DRAM; above this the
    /// fingerprint is embedded in the PMEM directory entry.
    pub max_filter_level: usize,

    /// Highest level with pre-allocated inline bucket storage; above this,
    /// buckets come from the shared arena through the allocator cursor.
    pub max_prealloc_level: usize,

    // -------------------------------------------------------------------------
    // Key/Value Log
    // -------------------------------------------------------------------------
    /// log2 of the number of independent key/value log partitions.
    pub log_num_bits: u32,

    /// Chunks per key/value log partition (>= 4: one write chunk plus a
    /// three-chunk initial free list).
    pub chunks_per_log: usize,

    /// Bytes per key/value log chunk.
    pub chunk_size: usize,

    // -------------------------------------------------------------------------
    // Payload Log (variable-length keys only)
    // -------------------------------------------------------------------------
    /// log2 of the number of payload log partitions.
    pub payload_log_num_bits: u32,

    /// log2 of the chunks per payload log partition.
    pub payload_chunk_num_bits: u32,

    /// Bytes per payload log chunk. Must stay below 4 GiB so offsets fit the
    /// 32-bit locator field.
    pub payload_chunk_size: usize,

    /// Mark superseded payload entries deleted as soon as the directory stops
    /// referencing them, without a persistence barrier.
    pub imm_mark_invalid: bool,

    // -------------------------------------------------------------------------
    // Partitioning
    // -------------------------------------------------------------------------
    /// Hash- or range-based key placement.
    pub partition: Partition,

    /// Smallest key in range mode.
    pub range_min: u64,

    /// One past the largest key in range mode.
    pub range_max: u64,

    // -------------------------------------------------------------------------
    // Recovery
    // -------------------------------------------------------------------------
    /// Worker threads for fingerprint/allocator reconstruction.
    pub filter_recovery_threads: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            dram_bits: 10,
            pmem_bits: 10,
            fanout_bits: 4,
            subdivision_bits: 2,
            max_pmem_levels: 3,
            max_filter_level: 1,
            max_prealloc_level: 1,
            log_num_bits: 2,
            chunks_per_log: 6,
            chunk_size: 1 << 20,
            payload_log_num_bits: 2,
            payload_chunk_num_bits: 3,
            payload_chunk_size: 8 << 20,
            imm_mark_invalid: true,
            partition: Partition::Hash,
            range_min: 0,
            range_max: 1 << 28,
            filter_recovery_threads: 8,
        }
    }
}

impl Config {
    /// Create a new config builder
    pub fn builder() -> ConfigBuilder {
        ConfigBuilder::default()
    }

    /// Validate the configuration and derive the frozen [`Geometry`].
    pub fn geometry(&self) -> Result<Geometry> {
        self.validate()?;
        Ok(Geometry::derive(self))
    }

    fn validate(&self) -> Result<()> {
        let err = |msg: String| Err(TierError::Config(msg));

        if self.pmem_bits < self.dram_bits {
            return err(format!(
                "pmem_bits ({}) must be >= dram_bits ({})",
                self.pmem_bits, self.dram_bits
            ));
        }
        if self.subdivision_bits > BUCKETS_PER_DIRECTORY_ENTRY.trailing_zeros() {
            return err(format!("subdivision_bits ({}) too large", self.subdivision_bits));
        }
        if self.log_num_bits > self.dram_bits {
            return err(format!(
                "log_num_bits ({}) must be <= dram_bits ({})",
                self.log_num_bits, self.dram_bits
            ));
        }
        if self.max_pmem_levels == 0 || self.max_pmem_levels > MAX_PMEM_LEVELS {
            return err(format!("max_pmem_levels must be in 1..={MAX_PMEM_LEVELS}"));
        }
        if !(4..=MAX_CHUNKS_PER_LOG).contains(&self.chunks_per_log) {
            return err(format!("chunks_per_log must be in 4..={MAX_CHUNKS_PER_LOG}"));
        }
        if self.chunk_size % 4096 != 0 {
            return err("chunk_size must be a multiple of 4096".into());
        }
        let payload_chunks = 1usize << self.payload_chunk_num_bits;
        if !(3..=MAX_PAYLOAD_CHUNKS).contains(&payload_chunks) {
            return err(format!(
                "payload chunk count ({payload_chunks}) must be in 3..={MAX_PAYLOAD_CHUNKS}"
            ));
        }
        if self.payload_chunk_size % 4096 != 0 || self.payload_chunk_size >= (1usize << 32) {
            return err("payload_chunk_size must be a multiple of 4096 below 4 GiB".into());
        }
        // Locator layout: 32 offset bits + chunk + log bits must leave room
        // for at least one epoch bit below bit 63.
        if 32 + self.payload_log_num_bits + self.payload_chunk_num_bits >= 63 {
            return err("payload log/chunk bits leave no room for the locator epoch".into());
        }
        if self.partition == Partition::Range && self.range_max <= self.range_min {
            return err("range_max must be greater than range_min".into());
        }
        if self.filter_recovery_threads == 0 {
            return err("filter_recovery_threads must be at least 1".into());
        }
        Ok(())
    }
}

// =============================================================================
// Derived Geometry
// =============================================================================

/// Immutable sizing derived from a validated [`Config`], computed once at
/// open and threaded through every component.
#[derive(Debug, Clone)]
pub struct Geometry {
    pub dram_directory_size: usize,
    pub num_subdivisions: usize,
    pub buckets_per_subdivision: usize,

    /// Directory entries per PMEM level (zero past `max_pmem_levels`).
    pub level_sizes: [usize; MAX_PMEM_LEVELS],

    /// Byte offset of each level inside `directories.dat`.
    pub level_file_offsets: [usize; MAX_PMEM_LEVELS],

    /// Total size of `directories.dat`.
    pub directories_file_size: usize,

    /// First bucket index of each pre-allocated level inside the arena.
    pub bucket_offsets: [u64; MAX_PMEM_LEVELS],

    /// Arena index one past the pre-allocated region; initial allocator cursor.
    pub prealloc_buckets: u64,

    /// Total bucket capacity of `buckets.dat`.
    pub max_num_buckets: u64,

    /// Live-entry capacity of one directory entry.
    pub entry_capacity: usize,

    pub log_num: usize,
    pub max_log_entries: usize,
    /// Max-epoch slots per key/value log chunk (DRAM entries per partition).
    pub epochs_per_chunk: usize,
    pub log_file_size: usize,

    pub payload_log_num: usize,
    pub payload_chunks: usize,
    pub payload_file_size: usize,
}

impl Geometry {
    fn derive(cfg: &Config) -> Geometry {
        use crate::table::directory::{DIR_ENTRY_FP_SIZE, DIR_ENTRY_SIZE};
        use crate::wal::entry::LOG_ENTRY_SIZE;
        use crate::wal::state::LOG_STATE_SIZE;

        let mut level_sizes = [0usize; MAX_PMEM_LEVELS];
        let mut level_file_offsets = [0usize; MAX_PMEM_LEVELS];
        let mut bucket_offsets = [0u64; MAX_PMEM_LEVELS];

        let mut dir_bytes = 0usize;
        let mut total_buckets = 0u64;
        for level in 0..cfg.max_pmem_levels {
            let size = 1usize << (cfg.pmem_bits + cfg.fanout_bits * level as u32);
            level_sizes[level] = size;
            level_file_offsets[level] = dir_bytes;
            let stride = if level <= cfg.max_filter_level {
                DIR_ENTRY_SIZE
            } else {
                DIR_ENTRY_FP_SIZE
            };
            dir_bytes += size * stride;
            total_buckets += (size * BUCKETS_PER_DIRECTORY_ENTRY) as u64;
        }

        let mut prealloc = 0u64;
        for level in 0..=cfg.max_prealloc_level.min(cfg.max_pmem_levels - 1) {
            bucket_offsets[level] = prealloc;
            prealloc += (level_sizes[level] * BUCKETS_PER_DIRECTORY_ENTRY) as u64;
        }

        let log_num = 1usize << cfg.log_num_bits;
        let max_log_entries = cfg.chunk_size / LOG_ENTRY_SIZE;
        let payload_chunks = 1usize << cfg.payload_chunk_num_bits;

        Geometry {
            dram_directory_size: 1 << cfg.dram_bits,
            num_subdivisions: 1 << cfg.subdivision_bits,
            buckets_per_subdivision: BUCKETS_PER_DIRECTORY_ENTRY >> cfg.subdivision_bits,
            level_sizes,
            level_file_offsets,
            directories_file_size: dir_bytes,
            bucket_offsets,
            prealloc_buckets: prealloc,
            max_num_buckets: total_buckets,
            entry_capacity: BUCKETS_PER_DIRECTORY_ENTRY * KEYS_PER_BUCKET,
            log_num,
            max_log_entries,
            epochs_per_chunk: 1 << (cfg.dram_bits - cfg.log_num_bits),
            log_file_size: LOG_STATE_SIZE + cfg.chunks_per_log * cfg.chunk_size,
            payload_log_num: 1 << cfg.payload_log_num_bits,
            payload_chunks,
            payload_file_size: crate::payload::PAYLOAD_STATE_SIZE
                + payload_chunks * cfg.payload_chunk_size,
        }
    }

    /// Key-space width of one directory entry at `level` in range mode.
    pub fn range_step(&self, cfg: &Config, level: usize) -> u64 {
        ((cfg.range_max - cfg.range_min) / self.level_sizes[level] as u64).max(1)
    }

    /// Key-space width of one DRAM directory entry in range mode. Frozen at
    /// construction; range boundaries never move afterwards.
    pub fn dram_range_step(&self, cfg: &Config) -> u64 {
        ((cfg.range_max - cfg.range_min) / self.dram_directory_size as u64).max(1)
    }

    /// Key-space width of one key/value log partition in range mode.
    pub fn log_range_step(&self, cfg: &Config) -> u64 {
        (cfg.range_max - cfg.range_min) / self.log_num as u64 + 1
    }
}

// =============================================================================
// Builder
// =============================================================================

/// Builder for Config
#[derive(Default)]
pub struct ConfigBuilder {
    config: Config,
}

impl ConfigBuilder {
    pub fn dram_bits(mut self, bits: u32) -> Self {
        self.config.dram_bits = bits;
        self
    }

    pub fn pmem_bits(mut self, bits: u32) -> Self {
        self.config.pmem_bits = bits;
        self
    }

    pub fn fanout_bits(mut self, bits: u32) -> Self {
        self.config.fanout_bits = bits;
        self
    }

    pub fn subdivision_bits(mut self, bits: u32) -> Self {
        self.config.subdivision_bits = bits;
        self
    }

    pub fn max_pmem_levels(mut self, levels: usize) -> Self {
        self.config.max_pmem_levels = levels;
        self
    }

    pub fn log_num_bits(mut self, bits: u32) -> Self {
        self.config.log_num_bits = bits;
        self
    }

    pub fn chunks_per_log(mut self, chunks: usize) -> Self {
        self.config.chunks_per_log = chunks;
        self
    }

    pub fn chunk_size(mut self, bytes: usize) -> Self {
        self.config.chunk_size = bytes;
        self
    }

    pub fn payload_chunk_size(mut self, bytes: usize) -> Self {
        self.config.payload_chunk_size = bytes;
        self
    }

    pub fn partition(mut self, partition: Partition) -> Self {
        self.config.partition = partition;
        self
    }

    pub fn range(mut self, min: u64, max: u64) -> Self {
        self.config.range_min = min;
        self.config.range_max = max;
        self
    }

    pub fn imm_mark_invalid(mut self, enabled: bool) -> Self {
        self.config.imm_mark_invalid = enabled;
        self
    }

    pub fn filter_recovery_threads(mut self, threads: usize) -> Self {
        self.config.filter_recovery_threads = threads;
        self
    }

    pub fn build(self) -> Config {
        self.config
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_valid() {
        let cfg = Config::default();
        let geo = cfg.geometry().unwrap();
        assert_eq!(geo.dram_directory_size, 1 << 10);
        assert_eq!(geo.num_subdivisions, 4);
        assert_eq!(geo.buckets_per_subdivision, 4);
        assert_eq!(geo.level_sizes[0], 1 << 10);
        assert_eq!(geo.level_sizes[1], 1 << 14);
    }

    #[test]
    fn rejects_inverted_bit_widths() {
        let cfg = Config::builder().dram_bits(12).pmem_bits(10).build();
        assert!(cfg.geometry().is_err());
    }

    #[test]
    fn rejects_degenerate_range() {
        let cfg = Config::builder().partition(Partition::Range).range(10, 10).build();
        assert!(cfg.geometry().is_err());
    }

    #[test]
    fn prealloc_region_precedes_arena_cursor() {
        let cfg = Config::default();
        let geo = cfg.geometry().unwrap();
        let expected =
            ((geo.level_sizes[0] + geo.level_sizes[1]) * BUCKETS_PER_DIRECTORY_ENTRY) as u64;
        assert_eq!(geo.prealloc_buckets, expected);
    }
}

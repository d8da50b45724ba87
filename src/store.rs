//! Store Module
//!
//! The public face of the engine: typed handles over one shared core.
//!
//! ## Responsibilities
//! - Open or reset a store directory and drive recovery on reopen
//! - Expose the fixed-key and variable-key operation sets
//! - Keep the unlogged/tombstone insert forms available for bulk loads
//!
//! ## Concurrency Model
//!
//! Every operation takes `&self`; a handle can be shared across threads
//! freely. Writes to the same DRAM directory entry serialize on that entry's
//! lock, writes to different entries run in parallel, and reads are
//! optimistic (epoch-validated, lock-free).

use std::path::Path;

use crate::config::{Config, Partition};
use crate::error::{Result, TierError};
use crate::table::{KeyIn, Table, ValueIn};

/// A fixed-key store: `u64` keys, `u64` values.
pub struct Store {
    table: Table,
}

impl std::fmt::Debug for Store {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Store").finish_non_exhaustive()
    }
}

impl Store {
    /// Open the store at `dir` with the default configuration. With `reset`
    /// the directory's store files are removed first; without it, a missing
    /// store is an error rather than a silent fresh start.
    pub fn open(dir: impl AsRef<Path>, reset: bool) -> Result<Self> {
        Self::open_with_config(dir, Config::default(), reset)
    }

    pub fn open_with_config(dir: impl AsRef<Path>, config: Config, reset: bool) -> Result<Self> {
        Ok(Self { table: Table::open(dir.as_ref(), config, false, reset)? })
    }

    pub fn insert(&self, key: u64, value: u64) {
        self.table.insert(KeyIn::Fixed(key), ValueIn::Fixed(value), false, true);
    }

    /// Insert with explicit tombstone and logging control. Unlogged inserts
    /// skip the write-ahead record and are lost on a crash until a
    /// checkpoint or migration makes them durable; bulk loads use this.
    pub fn insert_with(&self, key: u64, value: u64, tombstone: bool, log: bool) {
        self.table.insert(KeyIn::Fixed(key), ValueIn::Fixed(value), tombstone, log);
    }

    pub fn remove(&self, key: u64) {
        self.table.remove(KeyIn::Fixed(key));
    }

    pub fn lookup(&self, key: u64) -> Option<u64> {
        self.table.lookup_fixed(key)
    }

    /// Up to `count` live pairs with key >= `lower_bound` in ascending key
    /// order. Only range-partitioned stores keep keys ordered across
    /// directory entries.
    pub fn scan(&self, lower_bound: u64, count: usize) -> Result<Vec<(u64, u64)>> {
        if self.table.cfg.partition != Partition::Range {
            return Err(TierError::Unsupported("scan requires range partitioning"));
        }
        Ok(self.table.scan(lower_bound, count))
    }

    /// Force-migrate the whole DRAM tier into the directory, using `threads`
    /// workers over disjoint entry ranges.
    pub fn checkpoint(&self, threads: usize) {
        self.table.checkpoint(threads);
    }

    /// Total live slot count across all tiers. Counts slots, not distinct
    /// keys: versions of a key living on different tiers each count once.
    pub fn count(&self) -> u64 {
        self.table.count()
    }
}

/// A variable-key store: byte-span keys and values, hash-partitioned.
///
/// Keys travel the directory as 64-bit hashes; the bytes themselves live in
/// the payload log and every hash match is re-checked against them.
pub struct VarStore {
    table: Table,
}

impl VarStore {
    pub fn open(dir: impl AsRef<Path>, reset: bool) -> Result<Self> {
        Self::open_with_config(dir, Config::default(), reset)
    }

    pub fn open_with_config(dir: impl AsRef<Path>, config: Config, reset: bool) -> Result<Self> {
        Ok(Self { table: Table::open(dir.as_ref(), config, true, reset)? })
    }

    pub fn insert(&self, key: &[u8], value: &[u8]) {
        self.table.insert(KeyIn::Var(key), ValueIn::Var(value), false, true);
    }

    pub fn insert_with(&self, key: &[u8], value: &[u8], tombstone: bool, log: bool) {
        self.table.insert(KeyIn::Var(key), ValueIn::Var(value), tombstone, log);
    }

    pub fn remove(&self, key: &[u8]) {
        self.table.remove(KeyIn::Var(key));
    }

    pub fn lookup(&self, key: &[u8]) -> Option<Vec<u8>> {
        self.table.lookup_var(key)
    }

    pub fn checkpoint(&self, threads: usize) {
        self.table.checkpoint(threads);
    }

    pub fn count(&self) -> u64 {
        self.table.count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scan_needs_range_partitioning() {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::open(dir.path(), true).unwrap();
        assert!(matches!(
            store.scan(0, 10),
            Err(TierError::Unsupported(_))
        ));
    }
}

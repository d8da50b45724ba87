//! # tierkv
//!
//! An embedded key-value storage engine for byte-addressable persistent
//! memory with:
//! - A lock-per-entry DRAM front tier absorbing writes
//! - A multi-level extendible-hash directory on PMEM behind it
//! - Chunked write-ahead logging with in-place compaction
//! - Epoch-validated optimistic reads
//! - Log-replay crash recovery
//!
//! ## Architecture Overview
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                      Store / VarStore                        │
//! │                  (typed public handles)                      │
//! └─────────────────────┬───────────────────────────────────────┘
//!                       │
//! ┌─────────────────────▼───────────────────────────────────────┐
//! │                     DRAM Directory                           │
//! │        (entry locks, epochs, subdivided buckets)             │
//! └────────┬─────────────────────────────┬──────────────────────┘
//!          │ logged on insert            │ migrated when full
//!          ▼                             ▼
//!   ┌─────────────┐              ┌───────────────────┐
//!   │  K/V  Log   │              │  PMEM Directory   │
//!   │ (+ payload  │              │  (levels 0..N,    │
//!   │   log for   │              │   fingerprints,   │
//!   │  var keys)  │              │   bucket arena)   │
//!   └─────────────┘              └───────────────────┘
//! ```
//!
//! Persistent memory is modeled as pre-truncated, shared-mapped files with
//! an explicit cache-line flush + fence discipline, so the same code runs on
//! a plain filesystem.

// =============================================================================
// Module Declarations
// =============================================================================

pub mod config;
pub mod error;

mod payload;
mod pmem;
mod recovery;
mod store;
mod table;
mod wal;

// =============================================================================
// Public API Re-exports
// =============================================================================

pub use config::{Config, ConfigBuilder, Partition};
pub use error::{Result, TierError};
pub use store::{Store, VarStore};

/// Library version from Cargo.toml
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

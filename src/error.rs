//! Error types for tierkv
//!
//! Provides a unified error type for all operations.
//!
//! Only conditions the caller can act on surface here: failing to open or
//! size a backing file, a missing store on a non-reset open, or a rejected
//! configuration. Runtime invariant violations (an exhausted log with no free
//! chunk, a locator compare-exchange that loses a race it must not lose) have
//! no defined partial-failure continuation and abort the process instead.

use thiserror::Error;

/// Result type alias using TierError
pub type Result<T> = std::result::Result<T, TierError>;

/// Unified error type for tierkv operations
#[derive(Debug, Error)]
pub enum TierError {
    // -------------------------------------------------------------------------
    // I/O Errors
    // -------------------------------------------------------------------------
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("could not map backing file {path}: {reason}")]
    Map { path: String, reason: String },

    // -------------------------------------------------------------------------
    // Store Lifecycle Errors
    // -------------------------------------------------------------------------
    #[error("no existing store at {0} (open with reset=true to create one)")]
    StoreMissing(String),

    // -------------------------------------------------------------------------
    // Configuration Errors
    // -------------------------------------------------------------------------
    #[error("Configuration error: {0}")]
    Config(String),

    // -------------------------------------------------------------------------
    // Unsupported Operations
    // -------------------------------------------------------------------------
    #[error("Unsupported operation: {0}")]
    Unsupported(&'static str),
}

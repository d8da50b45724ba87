//! Persistent Backing Store
//!
//! Memory-mapped files standing in for byte-addressable persistent memory.
//!
//! ## Responsibilities
//! - Own the mapped byte ranges behind directories, buckets, and logs
//! - Bounds-checked, typed access into the mapped regions
//! - Cache-line flush + store-fence discipline for durable mutations
//!
//! The mapping owns no logic; every structure stored in a region is built
//! from atomics so concurrent readers and the single mutating writer of a
//! record never need `&mut` access.

mod persist;
mod region;

pub use persist::{flush, persist, persist_ref, sfence};
pub use region::{MappedRegion, PmemRecord};

//! Mapped region with bounds-checked typed access.
//!
//! Every backing file is pre-truncated to its maximum capacity and mapped
//! shared, so a chunk or bucket index translates to a fixed byte offset for
//! the lifetime of the store. Raw pointer arithmetic stays inside this file;
//! the rest of the crate works with typed references handed out here.

use std::fs::OpenOptions;
use std::path::Path;
use std::sync::atomic::{AtomicI32, AtomicU32, AtomicU64, AtomicU8};

use memmap2::MmapMut;

use crate::error::{Result, TierError};

/// Marker for types that may be projected out of a mapped region.
///
/// # Safety
/// Implementors must be `repr(C)`, contain only atomic integer fields (or
/// arrays/structs thereof), and be valid for the all-zeroes bit pattern,
/// which is what a freshly truncated file presents.
pub unsafe trait PmemRecord {}

unsafe impl PmemRecord for AtomicU64 {}
unsafe impl PmemRecord for AtomicU32 {}
unsafe impl PmemRecord for AtomicI32 {}
unsafe impl PmemRecord for AtomicU8 {}

/// A shared, fixed-size mapping of one backing file.
pub struct MappedRegion {
    _file: std::fs::File,
    _mmap: MmapMut,
    base: *mut u8,
    len: usize,
}

// All access goes through atomics or raw pointer copies on disjoint or
// immutable byte ranges; the mapping itself is never reborrowed as a slice.
unsafe impl Send for MappedRegion {}
unsafe impl Sync for MappedRegion {}

impl MappedRegion {
    /// Open (creating if needed) `path`, truncate it to `len` bytes, and map
    /// it shared and writable.
    pub fn open(path: &Path, len: usize) -> Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(path)?;
        file.set_len(len as u64)?;

        let mut mmap = unsafe { MmapMut::map_mut(&file) }.map_err(|e| TierError::Map {
            path: path.display().to_string(),
            reason: e.to_string(),
        })?;
        let base = mmap.as_mut_ptr();

        Ok(Self { _file: file, _mmap: mmap, base, len })
    }

    fn check(&self, offset: usize, size: usize, align: usize) {
        assert!(
            offset.checked_add(size).is_some_and(|end| end <= self.len),
            "region access out of bounds: offset {offset} size {size} len {}",
            self.len
        );
        debug_assert_eq!(
            (self.base as usize + offset) % align,
            0,
            "misaligned region access at offset {offset}"
        );
    }

    /// Project a typed record at `offset`.
    pub fn record<T: PmemRecord>(&self, offset: usize) -> &T {
        self.check(offset, std::mem::size_of::<T>(), std::mem::align_of::<T>());
        unsafe { &*(self.base.add(offset) as *const T) }
    }

    /// Read `dst.len()` bytes starting at `offset`.
    pub fn read_bytes(&self, offset: usize, dst: &mut [u8]) {
        self.check(offset, dst.len(), 1);
        unsafe { std::ptr::copy_nonoverlapping(self.base.add(offset), dst.as_mut_ptr(), dst.len()) };
    }

    /// Write `src` at `offset`. The caller owns exclusivity of the range.
    pub fn write_bytes(&self, offset: usize, src: &[u8]) {
        self.check(offset, src.len(), 1);
        unsafe { std::ptr::copy_nonoverlapping(src.as_ptr(), self.base.add(offset), src.len()) };
    }

    /// Borrow `len` bytes at `offset`.
    ///
    /// Published log records are immutable until their chunk is reclaimed, so
    /// readers holding a validated locator may borrow them directly.
    pub fn bytes(&self, offset: usize, len: usize) -> &[u8] {
        self.check(offset, len, 1);
        unsafe { std::slice::from_raw_parts(self.base.add(offset), len) }
    }

    /// Zero the byte range and flush it.
    pub fn zero(&self, offset: usize, len: usize) {
        self.check(offset, len, 1);
        unsafe { std::ptr::write_bytes(self.base.add(offset), 0, len) };
        crate::pmem::persist(unsafe { self.base.add(offset) }, len);
    }

    /// Flush + fence the byte range.
    pub fn persist_range(&self, offset: usize, len: usize) {
        self.check(offset, len, 1);
        crate::pmem::persist(unsafe { self.base.add(offset) }, len);
    }
}

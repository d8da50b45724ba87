//! Variable-length payload record layout.
//!
//! A record is a 24-byte header followed by the key bytes, then the value
//! bytes, padded so the next record starts 8-byte aligned:
//!
//! ```text
//! +0   key length (u64 LE)
//! +8   value length (u64 LE)
//! +16  flags (one byte, rest of the word is padding)
//! +24  key bytes, value bytes, padding
//! ```
//!
//! The flags byte is the only field rewritten in place: deletion sets
//! [`FLAG_DELETED`] with a single flushed byte store, which compaction later
//! uses to drop the record.

use std::sync::atomic::{AtomicU8, Ordering};

use crate::pmem::MappedRegion;

pub const PAYLOAD_HEADER_SIZE: usize = 24;
pub const FLAG_DELETED: u8 = 0b1;

const FLAGS_OFFSET: u64 = 16;

/// Total bytes a record with the given key and value occupies in a chunk.
pub fn entry_size(key_len: usize, val_len: usize) -> usize {
    (PAYLOAD_HEADER_SIZE + key_len + val_len + 7) & !7
}

/// Read-side view of one record inside a mapped payload file.
#[derive(Clone, Copy)]
pub struct PayloadView<'a> {
    region: &'a MappedRegion,
    offset: u64,
}

impl<'a> PayloadView<'a> {
    pub fn at(region: &'a MappedRegion, offset: u64) -> Self {
        Self { region, offset }
    }

    /// View a record only if its header and body fit inside `[offset, end)`.
    /// Recovery walks chunks whose tail may hold garbage lengths; rejecting
    /// them here keeps the walk from reading past the chunk.
    pub fn checked(region: &'a MappedRegion, offset: u64, end: u64) -> Option<Self> {
        if offset + PAYLOAD_HEADER_SIZE as u64 > end {
            return None;
        }
        let view = Self { region, offset };
        // Length words from a torn write can be arbitrary; saturate instead
        // of trusting them to add up.
        let size = (PAYLOAD_HEADER_SIZE as u64)
            .saturating_add(view.key_len() as u64)
            .saturating_add(view.val_len() as u64)
            .saturating_add(7)
            & !7;
        if offset.checked_add(size).map_or(true, |e| e > end) {
            return None;
        }
        Some(view)
    }

    fn pos(&self, delta: u64) -> usize {
        (self.offset + delta) as usize
    }

    fn read_u64(&self, at: u64) -> u64 {
        let mut buf = [0u8; 8];
        self.region.read_bytes(self.pos(at), &mut buf);
        u64::from_le_bytes(buf)
    }

    pub fn key_len(&self) -> usize {
        self.read_u64(0) as usize
    }

    pub fn val_len(&self) -> usize {
        self.read_u64(8) as usize
    }

    pub fn size(&self) -> usize {
        entry_size(self.key_len(), self.val_len())
    }

    pub fn key(&self) -> &'a [u8] {
        self.region
            .bytes(self.pos(PAYLOAD_HEADER_SIZE as u64), self.key_len())
    }

    pub fn value(&self) -> &'a [u8] {
        let key_len = self.key_len() as u64;
        self.region
            .bytes(self.pos(PAYLOAD_HEADER_SIZE as u64 + key_len), self.val_len())
    }

    fn flags(&self) -> &'a AtomicU8 {
        self.region.record::<AtomicU8>(self.pos(FLAGS_OFFSET))
    }

    pub fn is_deleted(&self) -> bool {
        self.flags().load(Ordering::Relaxed) & FLAG_DELETED != 0
    }

    pub fn mark_deleted(&self) {
        self.flags().fetch_or(FLAG_DELETED, Ordering::Relaxed);
        self.region.persist_range(self.pos(FLAGS_OFFSET), 1);
    }

    /// Deletion mark without a persistence barrier. Losing it in a crash is
    /// harmless: compaction re-checks unmarked records against the directory.
    pub fn mark_deleted_lazy(&self) {
        self.flags().fetch_or(FLAG_DELETED, Ordering::Relaxed);
    }

    /// Write header and body. The caller flushes the range and only then
    /// publishes a locator, so a crash mid-write leaves an unreferenced
    /// record that recovery reclaims.
    pub fn write(&self, key: &[u8], value: &[u8]) {
        self.region
            .write_bytes(self.pos(0), &(key.len() as u64).to_le_bytes());
        self.region
            .write_bytes(self.pos(8), &(value.len() as u64).to_le_bytes());
        self.region.write_bytes(self.pos(FLAGS_OFFSET), &[0u8; 8]);
        self.region.write_bytes(self.pos(PAYLOAD_HEADER_SIZE as u64), key);
        self.region.write_bytes(
            self.pos(PAYLOAD_HEADER_SIZE as u64 + key.len() as u64),
            value,
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sizes_are_padded_to_eight() {
        assert_eq!(entry_size(0, 0), 24);
        assert_eq!(entry_size(1, 0), 32);
        assert_eq!(entry_size(3, 5), 32);
        assert_eq!(entry_size(8, 8), 40);
    }

    #[test]
    fn writes_reads_and_deletes() {
        let dir = tempfile::tempdir().unwrap();
        let region = MappedRegion::open(&dir.path().join("payload.dat"), 4096).unwrap();

        let view = PayloadView::at(&region, 64);
        view.write(b"hello", b"world!!");
        assert_eq!(view.key_len(), 5);
        assert_eq!(view.val_len(), 7);
        assert_eq!(view.key(), b"hello");
        assert_eq!(view.value(), b"world!!");
        assert_eq!(view.size(), entry_size(5, 7));
        assert!(!view.is_deleted());

        view.mark_deleted();
        assert!(view.is_deleted());
        // The body is untouched by deletion.
        assert_eq!(view.key(), b"hello");
    }

    #[test]
    fn checked_rejects_truncated_records() {
        let dir = tempfile::tempdir().unwrap();
        let region = MappedRegion::open(&dir.path().join("payload.dat"), 4096).unwrap();

        let view = PayloadView::at(&region, 0);
        view.write(b"key", &[7u8; 100]);

        assert!(PayloadView::checked(&region, 0, 4096).is_some());
        // Header does not fit.
        assert!(PayloadView::checked(&region, 4090, 4096).is_none());
        // Header fits but the body runs past the end.
        assert!(PayloadView::checked(&region, 0, 64).is_none());
    }
}

//! Per-bucket membership fingerprints.
//!
//! Each bucket gets a 128-bit blocked filter: four 32-bit lanes, one bit set
//! per lane. Bit positions come from multiply-shift hashing of the key's
//! 32-bit hash with four fixed odd constants, taking the top five bits of
//! each product. A negative `may_contain` answer is exact; a positive one
//! sends the lookup into the bucket. Filters for the shallow levels live in
//! DRAM and are rebuilt on recovery; deeper levels embed them in the
//! directory file.

use std::sync::atomic::{AtomicU64, Ordering};

use crate::pmem::PmemRecord;

const LANE_MULTIPLIERS: [u32; 4] = [0x47b6_137b, 0x4497_4d91, 0x8824_ad5b, 0xa2b7_289d];

/// 128-bit filter covering one bucket.
#[repr(C)]
pub struct BucketFingerprint {
    words: [AtomicU64; 2],
}

impl Default for BucketFingerprint {
    fn default() -> Self {
        Self { words: [AtomicU64::new(0), AtomicU64::new(0)] }
    }
}

fn mask(hash: u32) -> [u64; 2] {
    let mut lanes = [0u32; 4];
    for (lane, c) in lanes.iter_mut().zip(LANE_MULTIPLIERS) {
        *lane = 1 << (c.wrapping_mul(hash) >> 27);
    }
    [
        lanes[0] as u64 | (lanes[1] as u64) << 32,
        lanes[2] as u64 | (lanes[3] as u64) << 32,
    ]
}

impl BucketFingerprint {
    pub fn insert(&self, hash: u32) {
        let m = mask(hash);
        self.words[0].fetch_or(m[0], Ordering::Relaxed);
        self.words[1].fetch_or(m[1], Ordering::Relaxed);
    }

    pub fn may_contain(&self, hash: u32) -> bool {
        let m = mask(hash);
        self.words[0].load(Ordering::Relaxed) & m[0] == m[0]
            && self.words[1].load(Ordering::Relaxed) & m[1] == m[1]
    }

    pub fn clear(&self) {
        self.words[0].store(0, Ordering::Relaxed);
        self.words[1].store(0, Ordering::Relaxed);
    }
}

/// Filters for all buckets of one directory entry, cache-line aligned so the
/// embedded variant sits cleanly inside the directory file.
#[repr(C, align(64))]
pub struct DirectoryFingerprint {
    pub buckets: [BucketFingerprint; crate::config::BUCKETS_PER_DIRECTORY_ENTRY],
}

unsafe impl PmemRecord for DirectoryFingerprint {}

pub const DIRECTORY_FP_SIZE: usize = 256;

const _: () = assert!(std::mem::size_of::<DirectoryFingerprint>() == DIRECTORY_FP_SIZE);

impl Default for DirectoryFingerprint {
    fn default() -> Self {
        Self { buckets: std::array::from_fn(|_| BucketFingerprint::default()) }
    }
}

impl DirectoryFingerprint {
    pub fn clear(&self) {
        for b in &self.buckets {
            b.clear();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn inserted_hashes_are_found() {
        let fp = BucketFingerprint::default();
        for h in [0u32, 1, 0xFFFF_FFFF, 0x1234_5678, 42] {
            fp.insert(h);
            assert!(fp.may_contain(h));
        }
    }

    #[test]
    fn empty_filter_rejects_everything() {
        let fp = BucketFingerprint::default();
        for h in [0u32, 7, 0xDEAD_BEEF] {
            assert!(!fp.may_contain(h));
        }
    }

    #[test]
    fn sparse_filter_rejects_most_strangers() {
        let fp = BucketFingerprint::default();
        fp.insert(12345);
        let mut negatives = 0;
        for h in 0..1000u32 {
            if !fp.may_contain(h.wrapping_mul(0x9E37_79B9)) {
                negatives += 1;
            }
        }
        // Four independent lanes with one of 32 bits each make accidental
        // positives rare for a single inserted key.
        assert!(negatives > 950, "only {negatives} negatives");
    }

    #[test]
    fn clear_resets_the_filter() {
        let fp = BucketFingerprint::default();
        fp.insert(77);
        fp.clear();
        assert!(!fp.may_contain(77));
    }
}

//! Packed reference to a variable-length payload record.

/// Bit widths for packing a payload position into one 64-bit value slot.
///
/// The layout, from the low end: a 32-bit byte offset inside the chunk, the
/// chunk epoch, the chunk index, and the log index. Bit 63 stays clear so a
/// locator can never collide with the tombstone marker. The epoch field takes
/// whatever is left between the offset and the two index fields; it lets a
/// reader detect that the chunk it resolved was recycled under its feet.
#[derive(Clone, Copy, Debug)]
pub struct LocatorLayout {
    pub log_bits: u32,
    pub chunk_bits: u32,
    pub epoch_bits: u32,
}

impl LocatorLayout {
    pub fn new(num_logs: usize, chunks_per_log: usize) -> Self {
        let log_bits = bits_for(num_logs);
        let chunk_bits = bits_for(chunks_per_log);
        let epoch_bits = 63 - 32 - log_bits - chunk_bits;
        Self { log_bits, chunk_bits, epoch_bits }
    }

    fn log_shift(&self) -> u32 {
        63 - self.log_bits
    }

    fn chunk_shift(&self) -> u32 {
        32 + self.epoch_bits
    }

    pub fn pack(&self, log: usize, chunk: usize, epoch: u32, offset: u64) -> u64 {
        debug_assert!(log < (1 << self.log_bits));
        debug_assert!(chunk < (1 << self.chunk_bits));
        debug_assert!(offset < (1 << 32));
        let epoch = (epoch as u64) & ((1 << self.epoch_bits) - 1);
        ((log as u64) << self.log_shift())
            | ((chunk as u64) << self.chunk_shift())
            | (epoch << 32)
            | offset
    }

    pub fn unpack(&self, raw: u64) -> PayloadLocator {
        PayloadLocator {
            log: ((raw >> self.log_shift()) & ((1 << self.log_bits) - 1)) as usize,
            chunk: ((raw >> self.chunk_shift()) & ((1 << self.chunk_bits) - 1)) as usize,
            epoch: ((raw >> 32) & ((1 << self.epoch_bits) - 1)) as u32,
            offset: raw & 0xFFFF_FFFF,
        }
    }

    /// Truncate a chunk epoch to the width stored in a locator.
    pub fn epoch_tag(&self, epoch: u32) -> u32 {
        ((epoch as u64) & ((1 << self.epoch_bits) - 1)) as u32
    }
}

/// Decoded form of a packed locator.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PayloadLocator {
    pub log: usize,
    pub chunk: usize,
    pub epoch: u32,
    pub offset: u64,
}

fn bits_for(n: usize) -> u32 {
    debug_assert!(n >= 1);
    usize::BITS - (n - 1).leading_zeros()
}

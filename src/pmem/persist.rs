//! Cache-line flush and store-fence primitives.
//!
//! Durable metadata follows a flush-before-link discipline: the target of a
//! pointer (or the payload behind a size field) is flushed and fenced before
//! the pointer/size itself is updated, so no reader can observe a link whose
//! target is not durable.

const CACHE_LINE: usize = 64;

/// Flush every cache line covering `len` bytes starting at `ptr`.
#[cfg(target_arch = "x86_64")]
pub fn flush(ptr: *const u8, len: usize) {
    let start = ptr as usize & !(CACHE_LINE - 1);
    let end = ptr as usize + len;
    let mut line = start;
    while line < end {
        // Safety: clflush has no alignment or validity requirements beyond
        // the address being mapped, which the region accessors guarantee.
        unsafe { core::arch::x86_64::_mm_clflush(line as *const u8) };
        line += CACHE_LINE;
    }
}

#[cfg(not(target_arch = "x86_64"))]
pub fn flush(_ptr: *const u8, _len: usize) {
    // No portable line flush; the fence below still orders the stores.
}

/// Store fence ordering flushed lines against later stores.
#[cfg(target_arch = "x86_64")]
pub fn sfence() {
    unsafe { core::arch::x86_64::_mm_sfence() };
}

#[cfg(not(target_arch = "x86_64"))]
pub fn sfence() {
    std::sync::atomic::fence(std::sync::atomic::Ordering::SeqCst);
}

/// Flush + fence in one step.
pub fn persist(ptr: *const u8, len: usize) {
    flush(ptr, len);
    sfence();
}

/// Flush + fence the memory holding `value`.
pub fn persist_ref<T>(value: &T) {
    persist(value as *const T as *const u8, std::mem::size_of::<T>());
}

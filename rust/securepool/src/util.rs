use once_cell::sync::Lazy;
use zeroize::Zeroize;

/// System memory page size, determined once at runtime.
pub(crate) static PAGE_SIZE: Lazy<usize> = Lazy::new(page_size::get);

/// Allocation granularity inside the locked pool.
pub(crate) const GRANULE: usize = 16;

/// Rounds `size` up to the next multiple of `align`, which must be non-zero.
///
/// Returns `None` if the result does not fit in `usize`.
pub(crate) fn round_up(size: usize, align: usize) -> Option<usize> {
    match size % align {
        0 => Some(size),
        rem => size.checked_add(align - rem),
    }
}

/// Rounds a size up to the nearest multiple of the page size, or `None` on
/// overflow.
pub fn round_to_page_size(size: usize) -> Option<usize> {
    round_up(size, *PAGE_SIZE)
}

/// Overwrites `buffer` with zeros in a way the optimizer cannot drop.
pub fn wipe(buffer: &mut [u8]) {
    buffer.zeroize();
}

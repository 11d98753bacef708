use crate::constants::{SYSTEM_PAGE_BASE_MASK, SYSTEM_PAGE_OFFSET_MASK, SYSTEM_PAGE_SIZE};

/// Align `value` up to the next multiple of `align`.
/// `align` must be a power of two.
#[inline(always)]
pub const fn align_up(value: usize, align: usize) -> usize {
    debug_assert!(align.is_power_of_two());
    (value + align - 1) & !(align - 1)
}

/// Check if `value` is aligned to `align`.
#[inline(always)]
pub const fn is_aligned(value: usize, align: usize) -> bool {
    value & (align - 1) == 0
}

#[inline(always)]
pub const fn round_up_to_system_page(value: usize) -> usize {
    (value + SYSTEM_PAGE_OFFSET_MASK) & SYSTEM_PAGE_BASE_MASK
}

#[inline(always)]
pub const fn round_down_to_system_page(value: usize) -> usize {
    value & SYSTEM_PAGE_BASE_MASK
}

/// Query the OS page size.
pub fn os_page_size() -> usize {
    let ps = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
    if ps > 0 {
        ps as usize
    } else {
        SYSTEM_PAGE_SIZE
    }
}

/// The compiled-in system page size must be a multiple of what the OS
/// actually uses, otherwise page protection calls would straddle pages.
pub fn system_page_size_matches_os() -> bool {
    let os = os_page_size();
    os != 0 && SYSTEM_PAGE_SIZE % os == 0
}

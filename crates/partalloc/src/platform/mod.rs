//! OS page primitives: reserve, release, protect, decommit, discard.

#[cfg(target_os = "linux")]
pub mod linux;
#[cfg(target_os = "linux")]
pub use linux as sys;

#[cfg(target_os = "macos")]
pub mod macos;
#[cfg(target_os = "macos")]
pub use macos as sys;

use crate::constants::{PAGE_ALLOCATION_GRANULARITY, SYSTEM_PAGE_OFFSET_MASK};
use crate::util::{align_up, is_aligned};
use core::ptr;

/// Accessibility of a page range.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PageAccess {
    Inaccessible,
    ReadWrite,
}

impl PageAccess {
    #[inline]
    fn prot(self) -> libc::c_int {
        match self {
            PageAccess::Inaccessible => libc::PROT_NONE,
            PageAccess::ReadWrite => libc::PROT_READ | libc::PROT_WRITE,
        }
    }
}

/// Reserve `size` bytes of address space aligned to `align`, preferring
/// `hint` as the base address. Returns null on failure.
///
/// # Safety
/// `size` must be a multiple of the allocation granularity and `align` a
/// power of two no smaller than it.
pub unsafe fn alloc_pages(hint: *mut u8, size: usize, align: usize, access: PageAccess) -> *mut u8 {
    debug_assert!(size != 0 && is_aligned(size, PAGE_ALLOCATION_GRANULARITY));
    debug_assert!(align.is_power_of_two() && align >= PAGE_ALLOCATION_GRANULARITY);

    let hint = (hint as usize & !(align - 1)) as *mut u8;
    let ret = sys::map(hint, size, access.prot());
    if ret.is_null() {
        return ptr::null_mut();
    }
    if is_aligned(ret as usize, align) {
        return ret;
    }

    // Misaligned: over-reserve and trim both ends to the alignment.
    sys::unmap(ret, size);
    let try_size = size + align - PAGE_ALLOCATION_GRANULARITY;
    let ret = sys::map(ptr::null_mut(), try_size, access.prot());
    if ret.is_null() {
        return ptr::null_mut();
    }
    let aligned = align_up(ret as usize, align) as *mut u8;
    let pre = aligned as usize - ret as usize;
    if pre > 0 {
        sys::unmap(ret, pre);
    }
    let post = try_size - pre - size;
    if post > 0 {
        sys::unmap(aligned.add(size), post);
    }
    aligned
}

/// Release a reservation made by [`alloc_pages`].
///
/// # Safety
/// The range must have come from `alloc_pages` with the same size.
pub unsafe fn free_pages(ptr: *mut u8, size: usize) {
    sys::unmap(ptr, size);
}

/// # Safety
/// Region must be mapped and system-page aligned.
#[must_use]
pub unsafe fn set_system_pages_access(ptr: *mut u8, len: usize, access: PageAccess) -> bool {
    debug_assert!(ptr as usize & SYSTEM_PAGE_OFFSET_MASK == 0);
    sys::protect(ptr, len, access.prot())
}

/// Like [`set_system_pages_access`], aborting when the OS refuses. Used
/// where the metadata would otherwise describe memory that is not usable.
///
/// # Safety
/// Region must be mapped and system-page aligned.
pub unsafe fn set_system_pages_access_or_abort(ptr: *mut u8, len: usize, access: PageAccess) {
    if !set_system_pages_access(ptr, len, access) {
        crate::error::abort_with_message("partalloc: failed to change page protection\n");
    }
}

/// Return the physical backing of a range and make it inaccessible.
///
/// # Safety
/// Region must be mapped and system-page aligned.
pub unsafe fn decommit_system_pages(ptr: *mut u8, len: usize) {
    sys::discard(ptr, len);
    let ok = sys::protect(ptr, len, PageAccess::Inaccessible.prot());
    debug_assert!(ok, "decommit: mprotect failed");
}

/// Make a decommitted range usable again.
///
/// # Safety
/// Region must be mapped and system-page aligned.
#[must_use]
pub unsafe fn recommit_system_pages(ptr: *mut u8, len: usize, access: PageAccess) -> bool {
    sys::protect(ptr, len, access.prot())
}

/// Return the physical backing of a range while keeping it accessible.
/// Contents become undefined (zero or the previous bytes).
///
/// # Safety
/// Region must be mapped and system-page aligned.
pub unsafe fn discard_system_pages(ptr: *mut u8, len: usize) {
    debug_assert!(ptr as usize & SYSTEM_PAGE_OFFSET_MASK == 0);
    sys::discard(ptr, len);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::constants::{SUPER_PAGE_SIZE, SYSTEM_PAGE_SIZE};

    #[test]
    fn alloc_pages_honours_alignment() {
        unsafe {
            let p = alloc_pages(ptr::null_mut(), SUPER_PAGE_SIZE, SUPER_PAGE_SIZE, PageAccess::ReadWrite);
            assert!(!p.is_null());
            assert!(is_aligned(p as usize, SUPER_PAGE_SIZE));
            p.write(7);
            assert_eq!(p.read(), 7);
            free_pages(p, SUPER_PAGE_SIZE);
        }
    }

    #[test]
    fn decommit_then_recommit_reads_zero() {
        unsafe {
            let size = SYSTEM_PAGE_SIZE * 2;
            let p = alloc_pages(ptr::null_mut(), size, PAGE_ALLOCATION_GRANULARITY, PageAccess::ReadWrite);
            assert!(!p.is_null());
            p.write(0x5A);
            decommit_system_pages(p, size);
            assert!(recommit_system_pages(p, size, PageAccess::ReadWrite));
            #[cfg(target_os = "linux")]
            assert_eq!(p.read(), 0);
            free_pages(p, size);
        }
    }
}

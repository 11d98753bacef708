use core::ptr;

/// Map anonymous memory near `hint`. Returns null on failure.
///
/// # Safety
/// `size` must be page-aligned and non-zero.
pub unsafe fn map(hint: *mut u8, size: usize, prot: libc::c_int) -> *mut u8 {
    let result = libc::mmap(
        hint as *mut libc::c_void,
        size,
        prot,
        libc::MAP_PRIVATE | libc::MAP_ANONYMOUS | libc::MAP_NORESERVE,
        -1,
        0,
    );
    if result == libc::MAP_FAILED {
        ptr::null_mut()
    } else {
        result as *mut u8
    }
}

/// Unmap memory.
///
/// # Safety
/// The range must lie inside a mapping made by `map`.
pub unsafe fn unmap(ptr: *mut u8, size: usize) {
    let ret = libc::munmap(ptr as *mut libc::c_void, size);
    debug_assert!(ret == 0, "munmap failed");
}

/// Change the protection of a page range.
///
/// # Safety
/// Region must be mapped and page-aligned.
pub unsafe fn protect(ptr: *mut u8, size: usize, prot: libc::c_int) -> bool {
    libc::mprotect(ptr as *mut libc::c_void, size, prot) == 0
}

/// Release the physical backing of a range. On Linux, MADV_DONTNEED
/// guarantees zero-filled pages on next access.
///
/// # Safety
/// Region must be mapped and page-aligned.
pub unsafe fn discard(ptr: *mut u8, size: usize) {
    let ret = libc::madvise(ptr as *mut libc::c_void, size, libc::MADV_DONTNEED);
    debug_assert!(ret == 0, "madvise(MADV_DONTNEED) failed");
}

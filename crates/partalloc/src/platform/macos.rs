use core::ptr;

pub unsafe fn map(hint: *mut u8, size: usize, prot: libc::c_int) -> *mut u8 {
    let result = libc::mmap(
        hint as *mut libc::c_void,
        size,
        prot,
        libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
        -1,
        0,
    );
    if result == libc::MAP_FAILED {
        ptr::null_mut()
    } else {
        result as *mut u8
    }
}

pub unsafe fn unmap(ptr: *mut u8, size: usize) {
    libc::munmap(ptr as *mut libc::c_void, size);
}

pub unsafe fn protect(ptr: *mut u8, size: usize, prot: libc::c_int) -> bool {
    libc::mprotect(ptr as *mut libc::c_void, size, prot) == 0
}

/// MADV_FREE leaves either the old contents or zeroes behind.
pub unsafe fn discard(ptr: *mut u8, size: usize) {
    libc::madvise(ptr as *mut libc::c_void, size, libc::MADV_FREE);
}

use crate::constants::MAX_FREEABLE_SPANS;
use core::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

/// Cached config values (read once during global init, never allocate).
static ZAP: AtomicBool = AtomicBool::new(cfg!(debug_assertions));
static EMPTY_RING_LEN: AtomicUsize = AtomicUsize::new(MAX_FREEABLE_SPANS);

/// Read configuration from environment variables.
///
/// - `PARTALLOC_ZAP=0|1` fills fresh slots with `0xAB` and freed slots
///   with `0xCD`.
/// - `PARTALLOC_EMPTY_RING=1..=16` bounds how many empty slot spans a root
///   keeps committed.
///
/// # Safety
/// Calls `libc::getenv`, which races with `setenv` on other threads.
pub unsafe fn read_config() {
    if let Some(val) = getenv_usize(b"PARTALLOC_ZAP\0") {
        ZAP.store(val != 0, Ordering::Relaxed);
    }
    if let Some(val) = getenv_usize(b"PARTALLOC_EMPTY_RING\0") {
        EMPTY_RING_LEN.store(val.clamp(1, MAX_FREEABLE_SPANS), Ordering::Relaxed);
    }
}

#[inline]
pub fn zap_enabled() -> bool {
    ZAP.load(Ordering::Relaxed)
}

pub fn empty_ring_len() -> usize {
    EMPTY_RING_LEN.load(Ordering::Relaxed)
}

/// Parse an environment variable as a usize.
///
/// # Safety
/// Calls libc::getenv.
unsafe fn getenv_usize(key: &[u8]) -> Option<usize> {
    let val = libc::getenv(key.as_ptr() as *const libc::c_char);
    if val.is_null() {
        return None;
    }
    parse_usize(val as *const u8)
}

/// Parse a NUL-terminated decimal string without allocating.
///
/// # Safety
/// `ptr` must point to a NUL-terminated byte string.
unsafe fn parse_usize(mut ptr: *const u8) -> Option<usize> {
    let mut result: usize = 0;
    let mut digits = 0;
    loop {
        let byte = *ptr;
        if byte == 0 {
            break;
        }
        if !byte.is_ascii_digit() {
            return None;
        }
        result = result.checked_mul(10)?.checked_add((byte - b'0') as usize)?;
        digits += 1;
        ptr = ptr.add(1);
    }
    if digits == 0 {
        None
    } else {
        Some(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_decimal() {
        unsafe {
            assert_eq!(parse_usize(b"16\0".as_ptr()), Some(16));
            assert_eq!(parse_usize(b"0\0".as_ptr()), Some(0));
            assert_eq!(parse_usize(b"\0".as_ptr()), None);
            assert_eq!(parse_usize(b"1x\0".as_ptr()), None);
            assert_eq!(parse_usize(b"99999999999999999999999\0".as_ptr()), None);
        }
    }

    #[test]
    fn ring_len_is_bounded() {
        let len = empty_ring_len();
        assert!((1..=MAX_FREEABLE_SPANS).contains(&len));
    }
}

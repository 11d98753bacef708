//! Intrusive free list threaded through free slots.
//!
//! The `next` link stored inside a free slot is never a plain address: it
//! is byte-swapped on little-endian targets and bit-inverted on big-endian
//! ones, so a stray write of a pointer value does not yield a usable link.
//! The list head kept in the slot span metadata is stored decoded.

use core::ptr;

/// An encoded free-list link. Opaque until decoded.
#[repr(transparent)]
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct EncodedNext(usize);

impl EncodedNext {
    #[inline(always)]
    pub fn encode(ptr: *mut FreelistEntry) -> Self {
        EncodedNext(transform(ptr as usize))
    }

    #[inline(always)]
    pub fn decode(self) -> *mut FreelistEntry {
        transform(self.0) as *mut FreelistEntry
    }

    /// True when the stored word is all zero bits. On little-endian targets
    /// this is the encoding of the list terminator.
    #[inline]
    pub fn is_zero_bits(self) -> bool {
        self.0 == 0
    }
}

#[cfg(target_endian = "little")]
#[inline(always)]
fn transform(value: usize) -> usize {
    value.swap_bytes()
}

#[cfg(target_endian = "big")]
#[inline(always)]
fn transform(value: usize) -> usize {
    !value
}

/// The first word of every free slot.
#[repr(C)]
pub struct FreelistEntry {
    next: EncodedNext,
}

impl FreelistEntry {
    /// Decoded successor of `entry`, or null at the end of the list.
    ///
    /// # Safety
    /// `entry` must point to a free slot.
    #[inline(always)]
    pub unsafe fn next(entry: *mut FreelistEntry) -> *mut FreelistEntry {
        (*entry).next.decode()
    }

    /// Raw encoded link, used when deciding whether the link word itself can
    /// be discarded.
    ///
    /// # Safety
    /// `entry` must point to a free slot.
    #[inline]
    pub unsafe fn encoded_next(entry: *mut FreelistEntry) -> EncodedNext {
        (*entry).next
    }

    /// # Safety
    /// `entry` must point to a writable free slot.
    #[inline(always)]
    pub unsafe fn set_next(entry: *mut FreelistEntry, next: *mut FreelistEntry) {
        (*entry).next = EncodedNext::encode(next);
    }

    /// Write a list terminator into `entry`.
    ///
    /// # Safety
    /// `entry` must point to a writable free slot.
    #[inline]
    pub unsafe fn terminate(entry: *mut FreelistEntry) {
        Self::set_next(entry, ptr::null_mut());
    }
}

//! Slot spans: runs of partition pages carved into equal slots for one
//! bucket.
//!
//! A span moves between four states purely through its counters:
//!
//! - active: some slots allocated, some free or unprovisioned
//! - full: every slot allocated (tagged by negating the allocated count
//!   once it has been swept off the active list)
//! - empty: nothing allocated, memory still committed
//! - decommitted: nothing allocated, memory returned to the OS

pub mod freelist;
pub mod purge;
pub mod slot_usage;

use crate::bucket::Bucket;
use crate::config;
use crate::constants::{FREED_BYTE, MAX_MULTI_SLOT_SIZE, SYSTEM_PAGE_SIZE};
use crate::direct_map;
use crate::error::abort_with_message;
use crate::init;
use crate::root::RootBase;
use crate::super_page;
use core::ptr;
use freelist::FreelistEntry;

/// Storage for the first word of a span record. Only ever accessed
/// through [`SlotSpan::head`], which picks the member by the record's
/// `page_offset`.
#[repr(C)]
union SpanHead {
    freelist_head: *mut FreelistEntry,
    raw_size: usize,
}

/// The first word of a span record, tagged by the kind of record holding
/// it. A span's first record (`page_offset == 0`) owns the free list;
/// continuation records only ever carry a raw size.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Head {
    Freelist(*mut FreelistEntry),
    RawSize(usize),
}

/// Metadata record for one partition page. Only the record for the first
/// partition page of a span carries live state; the others just store
/// their `page_offset` back to it.
#[repr(C)]
pub struct SlotSpan {
    head: SpanHead,
    pub(crate) next: *mut SlotSpan,
    pub(crate) bucket: *mut Bucket,
    /// Negative once a full span has been swept off the active list.
    pub(crate) num_allocated_slots: i16,
    pub(crate) num_unprovisioned_slots: u16,
    pub(crate) page_offset: u16,
    /// Position in the root's empty ring, or -1.
    pub(crate) empty_cache_index: i16,
}

impl SlotSpan {
    pub const fn zeroed() -> Self {
        SlotSpan {
            head: SpanHead {
                freelist_head: ptr::null_mut(),
            },
            next: ptr::null_mut(),
            bucket: ptr::null_mut(),
            num_allocated_slots: 0,
            num_unprovisioned_slots: 0,
            page_offset: 0,
            empty_cache_index: 0,
        }
    }

    /// Slot span owning `ptr`.
    ///
    /// # Safety
    /// `ptr` must be a slot start inside memory handed out by a root.
    #[inline(always)]
    pub unsafe fn from_pointer(ptr: *const u8) -> *mut SlotSpan {
        let span = super_page::span_from_pointer_no_alignment_check(ptr);
        debug_assert!(
            (ptr as usize - super_page::span_to_pointer(span) as usize) % (*(*span).bucket).slot_size() == 0,
            "pointer is not at a slot boundary"
        );
        span
    }

    #[inline(always)]
    pub fn to_pointer(span: *const SlotSpan) -> *mut u8 {
        super_page::span_to_pointer(span)
    }

    #[inline(always)]
    pub fn is_sentinel(span: *const SlotSpan) -> bool {
        ptr::eq(span, init::sentinel_span())
    }

    /// This record's head word.
    #[inline(always)]
    pub fn head(&self) -> Head {
        // SAFETY: `set_head` only writes the member matching the tag, and
        // both members are plain words, so a zeroed record reads as null
        // or 0.
        unsafe {
            if self.page_offset == 0 {
                Head::Freelist(self.head.freelist_head)
            } else {
                Head::RawSize(self.head.raw_size)
            }
        }
    }

    #[inline(always)]
    fn set_head(&mut self, value: Head) {
        match value {
            Head::Freelist(entry) => {
                debug_assert!(self.page_offset == 0);
                self.head.freelist_head = entry;
            }
            Head::RawSize(size) => {
                debug_assert!(self.page_offset != 0);
                self.head.raw_size = size;
            }
        }
    }

    #[inline(always)]
    pub fn freelist_head(&self) -> *mut FreelistEntry {
        match self.head() {
            Head::Freelist(entry) => entry,
            Head::RawSize(_) => abort_with_message("partalloc: free list read from a continuation record\n"),
        }
    }

    #[inline(always)]
    pub(crate) fn set_freelist_head(&mut self, head: *mut FreelistEntry) {
        self.set_head(Head::Freelist(head));
    }

    #[inline]
    fn bucket(&self) -> &Bucket {
        // SAFETY: set when the span is initialized and never changes.
        unsafe { &*self.bucket }
    }

    /// Pop the first free slot. The free list must be non-empty.
    ///
    /// # Safety
    /// The span's free list must be intact.
    #[inline(always)]
    pub(crate) unsafe fn pop_free_slot(&mut self) -> *mut u8 {
        let entry = self.freelist_head();
        debug_assert!(!entry.is_null());
        self.set_freelist_head(FreelistEntry::next(entry));
        self.num_allocated_slots += 1;
        entry as *mut u8
    }

    pub fn is_active(&self) -> bool {
        debug_assert!(!Self::is_sentinel(self));
        debug_assert!(self.page_offset == 0);
        self.num_allocated_slots > 0
            && (!self.freelist_head().is_null() || self.num_unprovisioned_slots != 0)
    }

    pub fn is_full(&self) -> bool {
        debug_assert!(!Self::is_sentinel(self));
        debug_assert!(self.page_offset == 0);
        let ret = self.num_allocated_slots as usize == self.bucket().slots_per_span();
        if ret {
            debug_assert!(self.freelist_head().is_null());
            debug_assert!(self.num_unprovisioned_slots == 0);
        }
        ret
    }

    pub fn is_empty(&self) -> bool {
        debug_assert!(!Self::is_sentinel(self));
        debug_assert!(self.page_offset == 0);
        self.num_allocated_slots == 0 && !self.freelist_head().is_null()
    }

    pub fn is_decommitted(&self) -> bool {
        debug_assert!(!Self::is_sentinel(self));
        debug_assert!(self.page_offset == 0);
        let ret = self.num_allocated_slots == 0 && self.freelist_head().is_null();
        if ret {
            debug_assert!(self.num_unprovisioned_slots == 0);
            debug_assert!(self.empty_cache_index == -1);
        }
        ret
    }

    /// The record holding a single-slot span's raw size: the continuation
    /// record right after its first one. Multi-slot spans have no raw size.
    #[inline]
    fn raw_size_record(&self) -> Option<*mut SlotSpan> {
        let bucket = self.bucket();
        if bucket.slot_size() <= MAX_MULTI_SLOT_SIZE {
            return None;
        }
        debug_assert!(bucket.slot_size() % SYSTEM_PAGE_SIZE == 0);
        debug_assert!(bucket.is_direct_mapped() || bucket.slots_per_span() == 1);
        Some(super_page::record_after(self, 1))
    }

    /// Exact requested size of a single-slot span's allocation, or 0.
    #[inline]
    pub fn raw_size(&self) -> usize {
        let Some(record) = self.raw_size_record() else {
            return 0;
        };
        // SAFETY: single-slot spans cover more than one partition page, so
        // the next record is this span's own continuation record.
        match unsafe { (*record).head() } {
            Head::RawSize(size) => size,
            Head::Freelist(_) => {
                debug_assert!(false, "raw size record is not a continuation record");
                0
            }
        }
    }

    #[inline]
    pub(crate) fn set_raw_size(&mut self, size: usize) {
        if let Some(record) = self.raw_size_record() {
            // SAFETY: see `raw_size`.
            unsafe { (*record).set_head(Head::RawSize(size)) };
        }
    }

    /// Put `slot` back on this span's free list.
    ///
    /// # Safety
    /// `slot` must be a live allocation from this span and `root` the root
    /// that owns it, locked by the caller.
    #[inline(always)]
    pub(crate) unsafe fn free(&mut self, root: &mut RootBase, slot: *mut u8) {
        if config::zap_enabled() {
            let raw_size = self.raw_size();
            let len = if raw_size != 0 { raw_size } else { self.bucket().slot_size() };
            ptr::write_bytes(slot, FREED_BYTE, len);
        }
        debug_assert!(self.num_allocated_slots != 0);
        let head = self.freelist_head();
        // Catches an immediate double free.
        if slot as *mut FreelistEntry == head {
            abort_with_message("partalloc: double free detected\n");
        }
        // Look one level deeper in debug builds.
        debug_assert!(head.is_null() || slot as *mut FreelistEntry != FreelistEntry::next(head));
        let entry = slot as *mut FreelistEntry;
        FreelistEntry::set_next(entry, head);
        self.set_freelist_head(entry);
        self.num_allocated_slots -= 1;
        if self.num_allocated_slots <= 0 {
            self.free_slow_path(root);
        } else {
            // Single-slot spans always take the slow path.
            debug_assert!(self.raw_size() == 0);
        }
    }

    /// Handles the span becoming empty or leaving the full state.
    unsafe fn free_slow_path(&mut self, root: &mut RootBase) {
        debug_assert!(!Self::is_sentinel(self));
        let bucket = &mut *self.bucket;
        if self.num_allocated_slots == 0 {
            if bucket.is_direct_mapped() {
                direct_map::direct_unmap(root, self);
                return;
            }
            // Bounce the current active span to the empty list to push
            // allocations towards other spans.
            if ptr::eq(bucket.active_head(), self) {
                bucket.set_new_active_span();
            }
            debug_assert!(!ptr::eq(bucket.active_head(), self));
            self.set_raw_size(0);
            debug_assert!(self.raw_size() == 0);
            self.register_empty(root);
        } else {
            debug_assert!(!bucket.is_direct_mapped());
            // Only a swept full span can get here. A count of -1 would mean
            // the span went from 0 to -1: a double free.
            debug_assert!(self.num_allocated_slots < 0);
            if self.num_allocated_slots == -1 {
                abort_with_message("partalloc: double free detected\n");
            }
            self.num_allocated_slots = -self.num_allocated_slots - 2;
            debug_assert!(self.num_allocated_slots as usize == bucket.slots_per_span() - 1);
            // Back on the active list, at the front, so it fills up again.
            debug_assert!(self.next.is_null());
            bucket.push_active_front(self);
            bucket.dec_full_spans();
            // A single-slot span is now empty.
            if self.num_allocated_slots == 0 {
                self.free_slow_path(root);
            }
        }
    }

    /// Record this span in the root's ring of recently emptied spans,
    /// decommitting whichever span it evicts.
    unsafe fn register_empty(&mut self, root: &mut RootBase) {
        debug_assert!(self.is_empty());
        // Already registered: give it another life.
        if self.empty_cache_index != -1 {
            let index = self.empty_cache_index as usize;
            debug_assert!(index < root.empty_ring_len);
            debug_assert!(ptr::eq(root.empty_ring[index], self));
            root.empty_ring[index] = ptr::null_mut();
        }

        let current = root.empty_ring_index;
        let evicted = root.empty_ring[current];
        // The evicted span may have been reused or filled since.
        if !evicted.is_null() {
            (*evicted).decommit_if_possible(root);
        }

        root.empty_ring[current] = self;
        self.empty_cache_index = current as i16;
        root.empty_ring_index = (current + 1) % root.empty_ring_len;
    }

    /// Called when this span drops out of the empty ring.
    pub(crate) unsafe fn decommit_if_possible(&mut self, root: &mut RootBase) {
        debug_assert!(self.empty_cache_index >= 0);
        debug_assert!((self.empty_cache_index as usize) < root.empty_ring_len);
        debug_assert!(ptr::eq(root.empty_ring[self.empty_cache_index as usize], self));
        self.empty_cache_index = -1;
        if self.is_empty() {
            self.decommit(root);
        }
    }

    /// Return an empty span's memory to the OS. The span stays on whatever
    /// list it is on and is swept to the decommitted list later.
    unsafe fn decommit(&mut self, root: &mut RootBase) {
        debug_assert!(self.is_empty());
        debug_assert!(!self.bucket().is_direct_mapped());
        let addr = Self::to_pointer(self);
        root.decommit_system_pages(addr, self.bucket().bytes_per_span());
        self.set_freelist_head(ptr::null_mut());
        self.num_unprovisioned_slots = 0;
        debug_assert!(self.is_decommitted());
    }

    /// Prepare a decommitted span for reuse: every slot unprovisioned.
    pub(crate) fn reset(&mut self) {
        debug_assert!(self.is_decommitted());
        self.num_unprovisioned_slots = self.bucket().slots_per_span() as u16;
        debug_assert!(self.num_unprovisioned_slots != 0);
        self.next = ptr::null_mut();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use core::mem::size_of;

    #[test]
    fn record_is_four_words_on_64_bit() {
        #[cfg(target_pointer_width = "64")]
        assert_eq!(size_of::<SlotSpan>(), 32);
        assert!(size_of::<SlotSpan>() <= crate::constants::PAGE_METADATA_SIZE);
    }

    #[test]
    fn sentinel_is_recognized() {
        assert!(SlotSpan::is_sentinel(init::sentinel_span()));
        let other = SlotSpan::zeroed();
        assert!(!SlotSpan::is_sentinel(&other));
        assert!(other.freelist_head().is_null());
    }

    #[cfg(target_pointer_width = "64")]
    #[test]
    fn head_is_tagged_by_page_offset() {
        let mut bucket = Bucket::zeroed();
        bucket.set_slot_size(MAX_MULTI_SLOT_SIZE + SYSTEM_PAGE_SIZE);
        // Two adjacent records, as they sit in a metadata page.
        let mut records = [SlotSpan::zeroed(), SlotSpan::zeroed()];
        records[1].page_offset = 1;
        assert_eq!(records[0].head(), Head::Freelist(ptr::null_mut()));
        assert_eq!(records[1].head(), Head::RawSize(0));

        let first = records.as_mut_ptr();
        unsafe {
            (*first).bucket = &mut bucket;
            (*first).set_raw_size(300_000);
            assert_eq!((*first).raw_size(), 300_000);
            assert_eq!((*first.add(1)).head(), Head::RawSize(300_000));
            // The first record's free list is untouched.
            assert!((*first).freelist_head().is_null());
        }
    }

    #[test]
    fn multi_slot_spans_have_no_raw_size() {
        let mut bucket = Bucket::zeroed();
        bucket.init(64);
        let mut span = SlotSpan::zeroed();
        span.bucket = &mut bucket;
        span.set_raw_size(40);
        assert_eq!(span.raw_size(), 0);
    }
}

//! Super-page reservation and the address <-> metadata mapping.
//!
//! All pointer arithmetic that turns a slot address into its slot span
//! record (and back) lives here. A super page is treated as an arena of
//! `NUM_PARTITION_PAGES_PER_SUPER_PAGE` partition pages whose metadata
//! records sit, in the same order, in the system page at
//! `base + SYSTEM_PAGE_SIZE`.

use crate::bucket::Bucket;
use crate::constants::*;
use crate::direct_map::DirectMapExtent;
use crate::page::SlotSpan;
use crate::platform::{self, PageAccess};
use crate::root::RootBase;
use crate::util::is_aligned;
use core::mem::size_of;
use core::ptr;

/// Record 0 of every super page's metadata area. Ties the super page to
/// its root; the remaining fields are only meaningful on the first super
/// page of a contiguous run.
#[repr(C)]
pub struct SuperPageExtentEntry {
    pub(crate) root: *mut RootBase,
    pub(crate) super_page_base: *mut u8,
    pub(crate) super_pages_end: *mut u8,
    pub(crate) next: *mut SuperPageExtentEntry,
}

const _: () = assert!(size_of::<SlotSpan>() <= PAGE_METADATA_SIZE);
const _: () = assert!(size_of::<Bucket>() <= PAGE_METADATA_SIZE);
const _: () = assert!(size_of::<SuperPageExtentEntry>() <= PAGE_METADATA_SIZE);
const _: () = assert!(size_of::<DirectMapExtent>() <= PAGE_METADATA_SIZE);

#[inline(always)]
pub fn super_page_base(addr: usize) -> usize {
    addr & SUPER_PAGE_BASE_MASK
}

/// Which partition page of its super page `addr` falls in.
#[inline(always)]
pub fn partition_page_index(addr: usize) -> usize {
    (addr & SUPER_PAGE_OFFSET_MASK) >> PARTITION_PAGE_SHIFT
}

#[inline(always)]
pub fn metadata_area(super_page: usize) -> *mut u8 {
    debug_assert!(is_aligned(super_page, SUPER_PAGE_SIZE));
    (super_page + SYSTEM_PAGE_SIZE) as *mut u8
}

/// Metadata record `index` of the super page at `super_page`.
#[inline(always)]
pub fn metadata_record(super_page: usize, index: usize) -> *mut u8 {
    debug_assert!(index < NUM_PARTITION_PAGES_PER_SUPER_PAGE);
    (metadata_area(super_page) as usize + (index << PAGE_METADATA_SHIFT)) as *mut u8
}

/// The record `n` places after `span` in the same metadata area.
#[inline(always)]
pub fn record_after<T>(span: *const SlotSpan, n: usize) -> *mut T {
    (span as usize + (n << PAGE_METADATA_SHIFT)) as *mut T
}

/// Slot span metadata for the partition page containing `ptr`, following
/// `page_offset` back to the span's first record.
///
/// # Safety
/// `ptr` must point into a vended partition page of a live super page or
/// direct mapping.
#[inline(always)]
pub unsafe fn span_from_pointer_no_alignment_check(ptr: *const u8) -> *mut SlotSpan {
    let addr = ptr as usize;
    let index = partition_page_index(addr);
    // Index 0 is the metadata and guard area and the last index is a guard
    // page.
    debug_assert!(index != 0);
    debug_assert!(index < NUM_PARTITION_PAGES_PER_SUPER_PAGE - 1);
    let record = metadata_record(super_page_base(addr), index) as *mut SlotSpan;
    let delta = ((*record).page_offset as usize) << PAGE_METADATA_SHIFT;
    (record as usize - delta) as *mut SlotSpan
}

/// First byte of the memory described by `span`.
#[inline(always)]
pub fn span_to_pointer(span: *const SlotSpan) -> *mut u8 {
    let addr = span as usize;
    let offset = addr & SUPER_PAGE_OFFSET_MASK;
    debug_assert!(offset > SYSTEM_PAGE_SIZE);
    debug_assert!(offset < SYSTEM_PAGE_SIZE + NUM_PARTITION_PAGES_PER_SUPER_PAGE * PAGE_METADATA_SIZE);
    let index = (offset - SYSTEM_PAGE_SIZE) >> PAGE_METADATA_SHIFT;
    debug_assert!(index != 0);
    debug_assert!(index < NUM_PARTITION_PAGES_PER_SUPER_PAGE - 1);
    (super_page_base(addr) + (index << PARTITION_PAGE_SHIFT)) as *mut u8
}

/// Extent entry of the super page (or direct mapping) holding `span`.
#[inline(always)]
pub fn extent_entry_of(span: *const SlotSpan) -> *mut SuperPageExtentEntry {
    (span as usize & SYSTEM_PAGE_BASE_MASK) as *mut SuperPageExtentEntry
}

/// Root recorded in the extent entry covering `span`.
///
/// # Safety
/// `span` must be a metadata record inside a live super page or direct
/// mapping.
#[inline(always)]
pub unsafe fn root_of(span: *const SlotSpan) -> *mut RootBase {
    (*extent_entry_of(span)).root
}

impl RootBase {
    /// Carve `num_partition_pages` partition pages for a new slot span,
    /// reserving a fresh super page when the current one is used up.
    /// Returns null if the OS refuses the reservation.
    ///
    /// # Safety
    /// Caller must hold the root's lock.
    pub(crate) unsafe fn alloc_new_slot_span(&mut self, num_partition_pages: usize) -> *mut u8 {
        debug_assert!(is_aligned(self.next_partition_page as usize, PARTITION_PAGE_SIZE));
        debug_assert!(is_aligned(self.next_partition_page_end as usize, PARTITION_PAGE_SIZE));
        debug_assert!(num_partition_pages <= NUM_PARTITION_PAGES_PER_SUPER_PAGE - 2);
        let total_size = PARTITION_PAGE_SIZE * num_partition_pages;
        let pages_left =
            (self.next_partition_page_end as usize - self.next_partition_page as usize) >> PARTITION_PAGE_SHIFT;
        if pages_left >= num_partition_pages {
            // Unvended partition pages are inaccessible until claimed.
            let ret = self.next_partition_page;
            platform::set_system_pages_access_or_abort(ret, total_size, PageAccess::ReadWrite);
            self.next_partition_page = ret.add(total_size);
            self.increase_committed_pages(total_size);
            return ret;
        }

        // Keep super pages contiguous where the OS allows it.
        let requested = self.next_super_page;
        let super_page = platform::alloc_pages(
            requested,
            SUPER_PAGE_SIZE,
            SUPER_PAGE_SIZE,
            PageAccess::Inaccessible,
        );
        if super_page.is_null() {
            return ptr::null_mut();
        }

        self.total_size_of_super_pages += SUPER_PAGE_SIZE;
        self.increase_committed_pages(total_size);

        self.next_super_page = super_page.add(SUPER_PAGE_SIZE);
        let ret = super_page.add(PARTITION_PAGE_SIZE);
        self.next_partition_page = ret.add(total_size);
        self.next_partition_page_end = self.next_super_page.sub(PARTITION_PAGE_SIZE);

        // Partition page 0 is a guard apart from its metadata system page.
        // The last partition page stays a guard.
        platform::set_system_pages_access_or_abort(
            super_page.add(SYSTEM_PAGE_SIZE),
            SYSTEM_PAGE_SIZE,
            PageAccess::ReadWrite,
        );
        platform::set_system_pages_access_or_abort(ret, total_size, PageAccess::ReadWrite);

        // Missed the hint: the OS placement is not ours to predict, start
        // over with no hint next time.
        if !requested.is_null() && requested != super_page {
            self.next_super_page = ptr::null_mut();
        }

        let latest = metadata_area(super_page as usize) as *mut SuperPageExtentEntry;
        (*latest).root = self;
        (*latest).super_page_base = ptr::null_mut();
        (*latest).super_pages_end = ptr::null_mut();
        (*latest).next = ptr::null_mut();

        if super_page != requested {
            if self.current_extent.is_null() {
                debug_assert!(self.first_extent.is_null());
                self.first_extent = latest;
            } else {
                debug_assert!(!(*self.current_extent).super_page_base.is_null());
                (*self.current_extent).next = latest;
            }
            self.current_extent = latest;
            (*latest).super_page_base = super_page;
            (*latest).super_pages_end = super_page.add(SUPER_PAGE_SIZE);
            log::debug!("partalloc: new super page extent at {:p}", super_page);
        } else {
            let current = self.current_extent;
            debug_assert!(!(*current).super_pages_end.is_null());
            (*current).super_pages_end = (*current).super_pages_end.add(SUPER_PAGE_SIZE);
            log::debug!("partalloc: extended super page extent to {:p}", (*current).super_pages_end);
        }
        ret
    }

    /// Number of super pages reserved by this root, counted by walking the
    /// extent list.
    pub fn super_page_count(&self) -> usize {
        let mut count = 0;
        let mut extent = self.first_extent;
        while !extent.is_null() {
            // SAFETY: extents live for the life of the root.
            unsafe {
                let e = &*extent;
                count += (e.super_pages_end as usize - e.super_page_base as usize) / SUPER_PAGE_SIZE;
                extent = e.next;
            }
        }
        count
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn records_round_trip_through_addresses() {
        let super_page = 64 * SUPER_PAGE_SIZE;
        for index in 1..NUM_PARTITION_PAGES_PER_SUPER_PAGE - 1 {
            let record = metadata_record(super_page, index) as *const SlotSpan;
            let start = span_to_pointer(record);
            assert_eq!(start as usize, super_page + index * PARTITION_PAGE_SIZE);
            assert_eq!(partition_page_index(start as usize + 17), index);
        }
    }

    #[test]
    fn extent_entry_is_first_record() {
        let super_page = 3 * SUPER_PAGE_SIZE;
        let record = metadata_record(super_page, 5) as *const SlotSpan;
        assert_eq!(extent_entry_of(record) as usize, metadata_record(super_page, 0) as usize);
        assert_eq!(record_after::<u8>(record, 2) as usize, metadata_record(super_page, 7) as usize);
    }
}

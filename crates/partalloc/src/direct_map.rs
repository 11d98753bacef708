//! Allocations too large for any bucket, each backed by its own mapping.
//!
//! A direct mapping imitates a super page so that the usual pointer to
//! metadata lookup works on it:
//!
//! ```text
//! | guard | metadata | guard ... | slot (size) | guard |
//! |<-- partition page 0 -------->|
//! ```
//!
//! The metadata page holds the extent entry (record 0), the slot span
//! (record 1), the raw size (record 2), a private bucket (record 3) and the
//! [`DirectMapExtent`] (record 4).

use crate::bucket::Bucket;
use crate::config;
use crate::constants::*;
use crate::page::freelist::FreelistEntry;
use crate::page::SlotSpan;
use crate::platform::{self, PageAccess};
use crate::root::RootBase;
use crate::super_page::{self, SuperPageExtentEntry};
use crate::util::round_up_to_system_page;
use core::ptr;

/// Bookkeeping for one direct mapping, linked into its root's list.
#[repr(C)]
pub struct DirectMapExtent {
    pub(crate) next: *mut DirectMapExtent,
    pub(crate) prev: *mut DirectMapExtent,
    pub(crate) bucket: *mut Bucket,
    /// Bytes available to the slot without remapping. Excludes the leading
    /// partition page and the trailing guard page.
    pub(crate) map_size: usize,
}

impl DirectMapExtent {
    #[inline]
    pub fn from_span(span: *const SlotSpan) -> *mut DirectMapExtent {
        super_page::record_after(span, 3)
    }

    /// Current usable size of the mapping's slot.
    ///
    /// # Safety
    /// The extent must be live.
    pub unsafe fn slot_size(&self) -> usize {
        (*self.bucket).slot_size()
    }
}

/// Size actually reserved for the slot of a `size`-byte direct map.
#[inline]
pub fn direct_map_size(size: usize) -> usize {
    // Callers bound `size` by GENERIC_MAX_DIRECT_MAPPED, which also keeps
    // this from overflowing.
    debug_assert!(size <= GENERIC_MAX_DIRECT_MAPPED);
    round_up_to_system_page(size)
}

/// Map a new direct allocation of `raw_size` bytes. Returns its slot span,
/// or null if the OS refused.
///
/// # Safety
/// Caller must hold the root's lock.
pub(crate) unsafe fn direct_map(root: &mut RootBase, raw_size: usize) -> *mut SlotSpan {
    let size = direct_map_size(raw_size);

    // Leading partition page for metadata, trailing guard page.
    let map_size = (size + PARTITION_PAGE_SIZE + SYSTEM_PAGE_SIZE + PAGE_ALLOCATION_GRANULARITY_OFFSET_MASK)
        & PAGE_ALLOCATION_GRANULARITY_BASE_MASK;

    let base = platform::alloc_pages(ptr::null_mut(), map_size, SUPER_PAGE_SIZE, PageAccess::ReadWrite);
    if base.is_null() {
        return ptr::null_mut();
    }

    let committed = size + SYSTEM_PAGE_SIZE;
    root.total_size_of_direct_mapped_pages += map_size - PARTITION_PAGE_SIZE;
    root.increase_committed_pages(committed);

    let slot = base.add(PARTITION_PAGE_SIZE);
    platform::set_system_pages_access_or_abort(base, SYSTEM_PAGE_SIZE, PageAccess::Inaccessible);
    platform::set_system_pages_access_or_abort(
        base.add(SYSTEM_PAGE_SIZE * 2),
        PARTITION_PAGE_SIZE - SYSTEM_PAGE_SIZE * 2,
        PageAccess::Inaccessible,
    );
    let trailing = slot.add(size);
    let trailing_len = base.add(map_size) as usize - trailing as usize;
    platform::set_system_pages_access_or_abort(trailing, trailing_len, PageAccess::Inaccessible);

    // The metadata page is fresh, so every record starts zeroed.
    let extent = super_page::metadata_area(base as usize) as *mut SuperPageExtentEntry;
    (*extent).root = root;
    debug_assert!((*extent).super_page_base.is_null());
    debug_assert!((*extent).super_pages_end.is_null());
    debug_assert!((*extent).next.is_null());

    let span = super_page::span_from_pointer_no_alignment_check(slot);
    let raw_size_record: *mut SlotSpan = super_page::record_after(span, 1);
    (*raw_size_record).page_offset = 1;
    let bucket: *mut Bucket = super_page::record_after(span, 2);
    debug_assert!((*span).next.is_null());
    debug_assert!((*span).num_allocated_slots == 0);
    debug_assert!((*span).num_unprovisioned_slots == 0);
    debug_assert!((*span).page_offset == 0);

    // A single free slot; `slow_path_alloc` pops it.
    let entry = slot as *mut FreelistEntry;
    FreelistEntry::terminate(entry);
    (*span).bucket = bucket;
    (*span).set_freelist_head(entry);
    (*span).empty_cache_index = -1;

    // Pages-per-span stays zero: that is what marks the bucket direct-mapped.
    debug_assert!((*bucket).active_head().is_null());
    debug_assert!((*bucket).is_direct_mapped());
    debug_assert!((*bucket).num_full_spans() == 0);
    (*bucket).set_slot_size(size);

    let map_extent = DirectMapExtent::from_span(span);
    (*map_extent).map_size = map_size - PARTITION_PAGE_SIZE - SYSTEM_PAGE_SIZE;
    (*map_extent).bucket = bucket;

    (*map_extent).next = root.direct_map_list;
    if !(*map_extent).next.is_null() {
        (*(*map_extent).next).prev = map_extent;
    }
    (*map_extent).prev = ptr::null_mut();
    root.direct_map_list = map_extent;

    log::debug!(
        "partalloc: direct mapped {} bytes at {:p} (mapping {} bytes)",
        size,
        slot,
        map_size
    );
    span
}

/// Release a direct mapping whose only slot was freed.
///
/// # Safety
/// Caller must hold the root's lock; `span` must be a direct-mapped span of
/// `root` with nothing allocated.
pub(crate) unsafe fn direct_unmap(root: &mut RootBase, span: *mut SlotSpan) {
    let extent = DirectMapExtent::from_span(span);

    if !(*extent).prev.is_null() {
        debug_assert!((*(*extent).prev).next == extent);
        (*(*extent).prev).next = (*extent).next;
    } else {
        root.direct_map_list = (*extent).next;
    }
    if !(*extent).next.is_null() {
        debug_assert!((*(*extent).next).prev == extent);
        (*(*extent).next).prev = (*extent).prev;
    }

    // Add back the leading partition page and the trailing guard page.
    let unmap_size = (*extent).map_size + PARTITION_PAGE_SIZE + SYSTEM_PAGE_SIZE;
    debug_assert!(unmap_size & PAGE_ALLOCATION_GRANULARITY_OFFSET_MASK == 0);

    let committed = (*(*span).bucket).slot_size() + SYSTEM_PAGE_SIZE;
    root.decrease_committed_pages(committed);
    let mapped = unmap_size - PARTITION_PAGE_SIZE;
    debug_assert!(root.total_size_of_direct_mapped_pages >= mapped);
    root.total_size_of_direct_mapped_pages -= mapped;

    let base = SlotSpan::to_pointer(span).sub(PARTITION_PAGE_SIZE);
    log::debug!("partalloc: unmapped direct mapping at {:p} ({} bytes)", base, unmap_size);
    platform::free_pages(base, unmap_size);
}

/// Try to resize a direct mapping without moving it. Shrinking decommits
/// the tail, but only while the new size still covers at least 80% of the
/// mapping; growing recommits pages already reserved. Returns false when
/// the caller has to move the allocation.
///
/// # Safety
/// Caller must hold the root's lock; `span` must be a live direct-mapped
/// span of `root`.
pub(crate) unsafe fn realloc_in_place(root: &mut RootBase, span: *mut SlotSpan, raw_size: usize) -> bool {
    let bucket = &mut *(*span).bucket;
    debug_assert!(bucket.is_direct_mapped());

    // The new size may be a bucketed size; those leave the direct map.
    let new_size = direct_map_size(raw_size);
    if new_size < GENERIC_MIN_DIRECT_MAPPED_DOWNSIZE {
        return false;
    }

    let current_size = bucket.slot_size();
    let slot = SlotSpan::to_pointer(span);
    let map_size = (*DirectMapExtent::from_span(span)).map_size;

    if new_size == current_size {
        // Nothing to remap.
    } else if new_size < current_size {
        // Holding on to lots of unused address space is not worth it.
        if (new_size / SYSTEM_PAGE_SIZE) * 5 < (map_size / SYSTEM_PAGE_SIZE) * 4 {
            return false;
        }
        let decommit_size = current_size - new_size;
        root.decommit_system_pages(slot.add(new_size), decommit_size);
        log::debug!(
            "partalloc: shrank direct mapping at {:p} in place to {} bytes",
            slot,
            new_size
        );
    } else if new_size <= map_size {
        let recommit_size = new_size - current_size;
        root.recommit_system_pages(slot.add(current_size), recommit_size);
        if config::zap_enabled() {
            ptr::write_bytes(slot.add(current_size), UNINITIALIZED_BYTE, recommit_size);
        }
        log::debug!(
            "partalloc: grew direct mapping at {:p} in place to {} bytes",
            slot,
            new_size
        );
    } else {
        // Would need a bigger mapping.
        return false;
    }

    (*span).set_raw_size(raw_size);
    debug_assert!((*span).raw_size() == raw_size);
    bucket.set_slot_size(new_size);
    true
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn map_size_rounds_to_system_pages() {
        assert_eq!(direct_map_size(GENERIC_MAX_BUCKETED + 1), GENERIC_MAX_BUCKETED + SYSTEM_PAGE_SIZE);
        assert_eq!(direct_map_size(4 * SYSTEM_PAGE_SIZE), 4 * SYSTEM_PAGE_SIZE);
    }

    #[test]
    fn extent_sits_three_records_after_span() {
        let span = (SUPER_PAGE_SIZE + SYSTEM_PAGE_SIZE + PAGE_METADATA_SIZE) as *const SlotSpan;
        assert_eq!(
            DirectMapExtent::from_span(span) as usize,
            span as usize + 3 * PAGE_METADATA_SIZE
        );
    }
}

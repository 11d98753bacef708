//! Discarding unused system pages inside live slot spans.

use super::freelist::FreelistEntry;
use super::slot_usage::SlotUsage;
use super::SlotSpan;
use crate::bucket::Bucket;
use crate::constants::{MAX_PURGEABLE_SLOT_COUNT, SYSTEM_PAGE_SIZE};
use crate::platform;
use crate::util::{round_down_to_system_page, round_up_to_system_page};
use core::mem::size_of;
use core::ptr;

/// Work out how many bytes of `span` could be handed back to the OS
/// without disturbing live slots or free-list links, and hand them back if
/// `discard` is set. With `discard == false` nothing is modified.
///
/// Only spans whose slots are at least a system page large have anything
/// to give back.
///
/// # Safety
/// `span` must be a live, non-sentinel span of a bucketed size whose root
/// is locked by the caller.
pub unsafe fn purge_span(span: *mut SlotSpan, discard: bool) -> usize {
    let span = &mut *span;
    let bucket: &Bucket = &*span.bucket;
    let slot_size = bucket.slot_size();
    if slot_size < SYSTEM_PAGE_SIZE || span.num_allocated_slots == 0 {
        return 0;
    }

    let base = SlotSpan::to_pointer(span);

    // A single-slot span: everything past the requested size, rounded to
    // a page, is spare.
    let raw_size = span.raw_size();
    if raw_size != 0 {
        let used_bytes = round_up_to_system_page(raw_size);
        let discardable = slot_size - used_bytes;
        if discardable != 0 && discard {
            platform::discard_system_pages(base.add(used_bytes), discardable);
        }
        return discardable;
    }

    let bucket_num_slots = bucket.slots_per_span();
    debug_assert!(bucket_num_slots <= MAX_PURGEABLE_SLOT_COUNT);
    debug_assert!((span.num_unprovisioned_slots as usize) < bucket_num_slots);
    let mut usage = SlotUsage::all_used(bucket_num_slots - span.num_unprovisioned_slots as usize);

    // Mark free slots. A slot whose link word is all zero bits (the end of
    // the list on little-endian targets) can have that word discarded too,
    // since discarded memory reads back as zero or as its old contents.
    let mut last_slot = None;
    let mut entry = span.freelist_head();
    while !entry.is_null() {
        let slot_index = (entry as usize - base as usize) / slot_size;
        debug_assert!(slot_index < usage.num_slots());
        usage.mark_free(slot_index);
        if FreelistEntry::encoded_next(entry).is_zero_bits() {
            last_slot = Some(slot_index);
        }
        entry = FreelistEntry::next(entry);
    }

    let mut discardable = 0;

    // Free slots at the end of the span can be unprovisioned entirely.
    let truncated_slots = usage.truncate_trailing_free();
    let num_slots = usage.num_slots();
    if truncated_slots != 0 {
        let begin = round_up_to_system_page(base as usize + num_slots * slot_size);
        // The span owns everything up to the next page boundary.
        let end = round_up_to_system_page(base as usize + (num_slots + truncated_slots) * slot_size);
        debug_assert!(end <= base as usize + bucket.bytes_per_span());
        let unprovisioned_bytes = end.saturating_sub(begin);
        discardable += unprovisioned_bytes;

        if unprovisioned_bytes != 0 && discard {
            span.num_unprovisioned_slots += truncated_slots as u16;
            last_slot = rewrite_freelist(span, base, slot_size, &usage);
            platform::discard_system_pages(begin as *mut u8, unprovisioned_bytes);
        }
    }

    // Whole system pages strictly inside a free slot can go, as long as the
    // free-list link at the start of the slot survives.
    for i in usage.free_slots() {
        let mut begin = base as usize + i * slot_size;
        let end = round_down_to_system_page(begin + slot_size);
        if last_slot != Some(i) {
            begin += size_of::<FreelistEntry>();
        }
        let begin = round_up_to_system_page(begin);
        if begin < end {
            let partial_slot_bytes = end - begin;
            discardable += partial_slot_bytes;
            if discard {
                platform::discard_system_pages(begin as *mut u8, partial_slot_bytes);
            }
        }
    }
    discardable
}

/// Rebuild the free list in address order from `usage`. Returns the index
/// of the new last entry.
unsafe fn rewrite_freelist(
    span: &mut SlotSpan,
    base: *mut u8,
    slot_size: usize,
    usage: &SlotUsage,
) -> Option<usize> {
    let mut head: *mut FreelistEntry = ptr::null_mut();
    let mut tail: *mut FreelistEntry = ptr::null_mut();
    let mut last = None;
    let mut num_new_entries = 0;
    for i in usage.free_slots() {
        let entry = base.add(i * slot_size) as *mut FreelistEntry;
        if tail.is_null() {
            head = entry;
        } else {
            FreelistEntry::set_next(tail, entry);
        }
        tail = entry;
        last = Some(i);
        num_new_entries += 1;
    }
    if !tail.is_null() {
        FreelistEntry::terminate(tail);
    }
    span.set_freelist_head(head);
    debug_assert!(num_new_entries == usage.num_slots() - span.num_allocated_slots as usize);
    // On big-endian targets the terminator is not all zero bits, so the
    // last link must survive like any other.
    if cfg!(target_endian = "little") {
        last
    } else {
        None
    }
}

/// Discard unused pages across all of a bucket's spans. Empty and
/// decommitted spans hold no live slots, so only active ones give anything
/// back here; whole empty spans are reclaimed by decommitting instead.
///
/// # Safety
/// `bucket` must belong to a root locked by the caller.
pub unsafe fn purge_bucket(bucket: &Bucket) -> usize {
    let mut discarded = 0;
    bucket.for_each_active_span(|span| discarded += purge_span(span, true));
    bucket.for_each_empty_span(|span| discarded += purge_span(span, true));
    bucket.for_each_decommitted_span(|span| discarded += purge_span(span, true));
    discarded
}

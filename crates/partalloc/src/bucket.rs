//! Size classes and the slow allocation path.

use crate::constants::*;
use crate::direct_map;
use crate::error::{abort_with_message, AllocError};
use crate::init;
use crate::page::freelist::FreelistEntry;
use crate::page::SlotSpan;
use crate::root::RootBase;
use crate::super_page;
use core::mem::size_of;
use core::ptr::{self, NonNull};

const SYSTEM_PAGES_BITS: u32 = 8;
const SYSTEM_PAGES_MASK: u32 = (1 << SYSTEM_PAGES_BITS) - 1;
const MAX_FULL_SPANS: u32 = (1 << (32 - SYSTEM_PAGES_BITS)) - 1;

/// One allocation size class.
///
/// The active list always has a head: the shared sentinel span stands in
/// for "no active spans", and a null head marks a disabled bucket. The
/// list helpers below hide both conventions.
#[repr(C)]
pub struct Bucket {
    active_head: *mut SlotSpan,
    empty_head: *mut SlotSpan,
    decommitted_head: *mut SlotSpan,
    slot_size: u32,
    /// System pages per span in the low 8 bits, full span count above.
    packed: u32,
}

impl Bucket {
    pub const fn zeroed() -> Self {
        Bucket {
            active_head: ptr::null_mut(),
            empty_head: ptr::null_mut(),
            decommitted_head: ptr::null_mut(),
            slot_size: 0,
            packed: 0,
        }
    }

    pub fn init(&mut self, slot_size: usize) {
        debug_assert!(slot_size <= u32::MAX as usize);
        self.slot_size = slot_size as u32;
        self.active_head = init::sentinel_span();
        self.empty_head = ptr::null_mut();
        self.decommitted_head = ptr::null_mut();
        self.packed = system_pages_per_slot_span(slot_size) as u32;
    }

    /// Make any allocation through this bucket fault.
    pub(crate) fn disable(&mut self) {
        self.active_head = ptr::null_mut();
    }

    #[inline]
    pub fn is_disabled(&self) -> bool {
        self.active_head.is_null()
    }

    #[inline(always)]
    pub fn slot_size(&self) -> usize {
        self.slot_size as usize
    }

    /// Direct maps adjust their slot size on in-place realloc.
    pub(crate) fn set_slot_size(&mut self, slot_size: usize) {
        self.slot_size = slot_size as u32;
    }

    #[inline(always)]
    pub fn system_pages_per_slot_span(&self) -> usize {
        (self.packed & SYSTEM_PAGES_MASK) as usize
    }

    /// Direct-map buckets carve no spans.
    #[inline(always)]
    pub fn is_direct_mapped(&self) -> bool {
        self.system_pages_per_slot_span() == 0
    }

    pub fn pages_per_slot_span(&self) -> usize {
        self.system_pages_per_slot_span().div_ceil(NUM_SYSTEM_PAGES_PER_PARTITION_PAGE)
    }

    pub fn bytes_per_span(&self) -> usize {
        self.system_pages_per_slot_span() * SYSTEM_PAGE_SIZE
    }

    pub fn slots_per_span(&self) -> usize {
        self.bytes_per_span() / self.slot_size()
    }

    pub fn num_full_spans(&self) -> usize {
        (self.packed >> SYSTEM_PAGES_BITS) as usize
    }

    fn inc_full_spans(&mut self) {
        let full = self.packed >> SYSTEM_PAGES_BITS;
        // The counter is 24 bits wide.
        if full == MAX_FULL_SPANS {
            abort_with_message("partalloc: too many full slot spans in one bucket\n");
        }
        self.packed += 1 << SYSTEM_PAGES_BITS;
    }

    pub(crate) fn dec_full_spans(&mut self) {
        debug_assert!(self.num_full_spans() > 0);
        self.packed -= 1 << SYSTEM_PAGES_BITS;
    }

    /// Raw head of the active list, possibly the sentinel or null.
    #[inline(always)]
    pub(crate) fn active_head(&self) -> *mut SlotSpan {
        self.active_head
    }

    pub(crate) fn set_active_head(&mut self, span: *mut SlotSpan) {
        self.active_head = span;
    }

    /// True when the active list holds at least one real span.
    pub fn has_active_spans(&self) -> bool {
        !self.active_head.is_null() && !SlotSpan::is_sentinel(self.active_head)
    }

    pub fn has_empty_spans(&self) -> bool {
        !self.empty_head.is_null()
    }

    pub fn has_decommitted_spans(&self) -> bool {
        !self.decommitted_head.is_null()
    }

    /// Link `span` at the front of the active list.
    ///
    /// # Safety
    /// `span` must belong to this bucket and be on no list.
    pub(crate) unsafe fn push_active_front(&mut self, span: *mut SlotSpan) {
        if self.has_active_spans() {
            (*span).next = self.active_head;
        }
        self.active_head = span;
    }

    /// Visit every span on the active list. `f` must not relink spans.
    ///
    /// # Safety
    /// Caller must hold the owning root's lock.
    pub unsafe fn for_each_active_span(&self, mut f: impl FnMut(*mut SlotSpan)) {
        if !self.has_active_spans() {
            return;
        }
        let mut span = self.active_head;
        while !span.is_null() {
            debug_assert!(!SlotSpan::is_sentinel(span));
            let next = (*span).next;
            f(span);
            span = next;
        }
    }

    /// # Safety
    /// Caller must hold the owning root's lock.
    pub unsafe fn for_each_empty_span(&self, f: impl FnMut(*mut SlotSpan)) {
        walk(self.empty_head, f);
    }

    /// # Safety
    /// Caller must hold the owning root's lock.
    pub unsafe fn for_each_decommitted_span(&self, f: impl FnMut(*mut SlotSpan)) {
        walk(self.decommitted_head, f);
    }

    /// Sweep the active list until a span with free or unprovisioned slots
    /// heads it. Empty and decommitted spans met on the way move to their
    /// lists; full spans are unlinked and tagged. Returns false, leaving
    /// the sentinel at the head, if no usable span was found.
    pub(crate) unsafe fn set_new_active_span(&mut self) -> bool {
        let mut span = self.active_head;
        if SlotSpan::is_sentinel(span) {
            return false;
        }

        while !span.is_null() {
            let next = (*span).next;
            debug_assert!(ptr::eq((*span).bucket, self));
            debug_assert!(span != self.empty_head);
            debug_assert!(span != self.decommitted_head);

            let s = &mut *span;
            if s.is_active() {
                self.active_head = span;
                return true;
            }

            if s.is_empty() {
                s.next = self.empty_head;
                self.empty_head = span;
            } else if s.is_decommitted() {
                s.next = self.decommitted_head;
                self.decommitted_head = span;
            } else {
                debug_assert!(s.is_full());
                // Tag it so free can tell it needs to go back on the list.
                s.num_allocated_slots = -s.num_allocated_slots;
                self.inc_full_spans();
                s.next = ptr::null_mut();
            }
            span = next;
        }

        self.active_head = init::sentinel_span();
        false
    }

    /// Find a span with room, in order of preference: the active list, an
    /// empty span, a decommitted span (recommitted), a fresh span. Returns
    /// null only if the OS refused memory.
    unsafe fn find_or_make_span(&mut self, root: &mut RootBase) -> *mut SlotSpan {
        // Sweeping may move spans onto the empty or decommitted lists, so
        // it must happen before they are consulted.
        if self.set_new_active_span() {
            let span = self.active_head;
            debug_assert!((*span).is_active());
            return span;
        }

        if self.has_empty_spans() || self.has_decommitted_spans() {
            // Prefer empty spans, but one may have been decommitted since it
            // was listed.
            let mut span = ptr::null_mut();
            while !self.empty_head.is_null() {
                let candidate = self.empty_head;
                debug_assert!(ptr::eq((*candidate).bucket, self));
                debug_assert!((*candidate).is_empty() || (*candidate).is_decommitted());
                self.empty_head = (*candidate).next;
                if !(*candidate).freelist_head().is_null() {
                    (*candidate).next = ptr::null_mut();
                    span = candidate;
                    break;
                }
                debug_assert!((*candidate).is_decommitted());
                (*candidate).next = self.decommitted_head;
                self.decommitted_head = candidate;
            }
            if span.is_null() && !self.decommitted_head.is_null() {
                span = self.decommitted_head;
                debug_assert!(ptr::eq((*span).bucket, self));
                debug_assert!((*span).is_decommitted());
                self.decommitted_head = (*span).next;
                root.recommit_system_pages(SlotSpan::to_pointer(span), self.bytes_per_span());
                (*span).reset();
            }
            debug_assert!(!span.is_null());
            return span;
        }

        let raw = root.alloc_new_slot_span(self.pages_per_slot_span());
        if raw.is_null() {
            return ptr::null_mut();
        }
        let span = super_page::span_from_pointer_no_alignment_check(raw);
        self.initialize_slot_span(span);
        log::trace!(
            "partalloc: new slot span at {:p} for slot size {}",
            raw,
            self.slot_size
        );
        span
    }

    unsafe fn initialize_slot_span(&mut self, span: *mut SlotSpan) {
        let s = &mut *span;
        // The bucket never changes once set.
        s.bucket = self;
        s.empty_cache_index = -1;
        s.reset();

        // Continuation records point back to the first one. This also tags
        // their head word as a raw size.
        for i in 1..self.pages_per_slot_span() {
            let secondary: *mut SlotSpan = super_page::record_after(span, i);
            (*secondary).page_offset = i as u16;
        }
    }

    /// Provision slots of a span whose free list is empty: return the next
    /// unprovisioned slot and thread a free list through the following
    /// slots that fit in the same system page.
    unsafe fn alloc_and_fill_freelist(&self, span: *mut SlotSpan) -> *mut u8 {
        let s = &mut *span;
        debug_assert!(!SlotSpan::is_sentinel(span));
        let mut num_slots = s.num_unprovisioned_slots as usize;
        debug_assert!(num_slots != 0);
        // Every slot is either allocated or unprovisioned here.
        debug_assert!(num_slots + s.num_allocated_slots as usize == self.slots_per_span());
        debug_assert!(s.freelist_head().is_null());
        debug_assert!(s.num_allocated_slots >= 0);

        let size = self.slot_size();
        let base = SlotSpan::to_pointer(span);
        let return_object = base.add(size * s.num_allocated_slots as usize);
        let first_freelist_pointer = return_object as usize + size;
        let first_freelist_pointer_extent = first_freelist_pointer + size_of::<*mut FreelistEntry>();
        // Fault as few system pages as possible: links may be written up to
        // the end of the page holding the end of the returned slot.
        let sub_page_limit = crate::util::round_up_to_system_page(first_freelist_pointer);
        let slots_limit = return_object as usize + size * num_slots;
        let freelist_limit = sub_page_limit.min(slots_limit);

        let mut num_new_entries = 0;
        if first_freelist_pointer_extent <= freelist_limit {
            // The first link fits; further ones need a whole slot each.
            num_new_entries = 1 + (freelist_limit - first_freelist_pointer_extent) / size;
        }

        // One slot is always returned.
        debug_assert!(num_new_entries + 1 <= num_slots);
        num_slots -= num_new_entries + 1;
        s.num_unprovisioned_slots = num_slots as u16;
        s.num_allocated_slots += 1;

        if num_new_entries != 0 {
            let mut entry = first_freelist_pointer as *mut FreelistEntry;
            s.set_freelist_head(entry);
            for _ in 1..num_new_entries {
                let next = (entry as *mut u8).add(size) as *mut FreelistEntry;
                FreelistEntry::set_next(entry, next);
                entry = next;
            }
            FreelistEntry::terminate(entry);
        } else {
            s.set_freelist_head(ptr::null_mut());
        }
        return_object
    }
}

unsafe fn walk(mut span: *mut SlotSpan, mut f: impl FnMut(*mut SlotSpan)) {
    while !span.is_null() {
        let next = (*span).next;
        f(span);
        span = next;
    }
}

/// Pick the span length, in system pages, for `slot_size`.
///
/// Single-slot sizes take exactly as many pages as the slot. Otherwise the
/// length from 3 to 16 system pages with the least waste wins, where waste
/// is the tail that fits no slot plus a pointer-sized charge for each page
/// of the last partition page left unfaulted.
pub fn system_pages_per_slot_span(slot_size: usize) -> usize {
    if slot_size > MAX_MULTI_SLOT_SIZE {
        debug_assert!(slot_size % SYSTEM_PAGE_SIZE == 0);
        let pages = slot_size / SYSTEM_PAGE_SIZE;
        if pages >= 1 << SYSTEM_PAGES_BITS {
            abort_with_message("partalloc: slot size too large for a slot span\n");
        }
        return pages;
    }

    let mut best_waste_ratio = 1.0f64;
    let mut best_pages = 0;
    for i in (NUM_SYSTEM_PAGES_PER_PARTITION_PAGE - 1)..=MAX_SYSTEM_PAGES_PER_SLOT_SPAN {
        let page_size = SYSTEM_PAGE_SIZE * i;
        let num_slots = page_size / slot_size;
        let mut waste = page_size - num_slots * slot_size;
        let num_remainder_pages = i & (NUM_SYSTEM_PAGES_PER_PARTITION_PAGE - 1);
        let num_unfaulted_pages = if num_remainder_pages != 0 {
            NUM_SYSTEM_PAGES_PER_PARTITION_PAGE - num_remainder_pages
        } else {
            0
        };
        waste += size_of::<*const u8>() * num_unfaulted_pages;
        let waste_ratio = waste as f64 / page_size as f64;
        if waste_ratio < best_waste_ratio {
            best_waste_ratio = waste_ratio;
            best_pages = i;
        }
    }
    debug_assert!(best_pages > 0);
    debug_assert!(best_pages <= MAX_SYSTEM_PAGES_PER_SLOT_SPAN);
    best_pages
}

/// Slow allocation path, taken when the active span has no free-list
/// entry. `bucket` may be the sentinel bucket, which stands for direct
/// mapping.
///
/// # Safety
/// Caller must hold the root's lock; `bucket` must be the sentinel or a
/// bucket of `root`.
pub(crate) unsafe fn slow_path_alloc(
    bucket: *mut Bucket,
    root: &mut RootBase,
    size: usize,
) -> Result<NonNull<u8>, AllocError> {
    debug_assert!((*(*bucket).active_head).freelist_head().is_null());

    let span = if (*bucket).is_direct_mapped() {
        debug_assert!(size > GENERIC_MAX_BUCKETED);
        debug_assert!(ptr::eq(bucket, init::sentinel_bucket()));
        if size > GENERIC_MAX_DIRECT_MAPPED {
            return Err(AllocError::ExcessiveSize { size });
        }
        direct_map::direct_map(root, size)
    } else {
        (*bucket).find_or_make_span(root)
    };

    if span.is_null() {
        return Err(AllocError::OutOfMemory { size });
    }

    let s = &mut *span;
    let owner = &mut *s.bucket;
    debug_assert!(!ptr::eq(owner, init::sentinel_bucket()));
    owner.set_active_head(span);
    s.set_raw_size(size);

    let slot = if !s.freelist_head().is_null() {
        s.pop_free_slot()
    } else {
        debug_assert!(s.num_unprovisioned_slots != 0);
        owner.alloc_and_fill_freelist(span)
    };
    // A slot address is never null.
    Ok(NonNull::new_unchecked(slot))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn small_sizes_pack_into_whole_partition_pages() {
        // 8 divides every page length, so the unfaulted-page charge decides.
        let pages = system_pages_per_slot_span(8);
        assert_eq!(pages % NUM_SYSTEM_PAGES_PER_PARTITION_PAGE, 0);
    }

    #[test]
    fn single_slot_sizes_use_exact_pages() {
        let size = MAX_MULTI_SLOT_SIZE + SYSTEM_PAGE_SIZE;
        assert_eq!(system_pages_per_slot_span(size), size / SYSTEM_PAGE_SIZE);
    }

    #[test]
    fn span_geometry() {
        let mut bucket = Bucket::zeroed();
        bucket.init(64);
        assert!(!bucket.is_direct_mapped());
        assert!(!bucket.is_disabled());
        assert!(!bucket.has_active_spans());
        assert_eq!(bucket.num_full_spans(), 0);
        assert!(bucket.pages_per_slot_span() <= MAX_PARTITION_PAGES_PER_SLOT_SPAN);
        assert_eq!(bucket.slots_per_span(), bucket.bytes_per_span() / 64);

        bucket.disable();
        assert!(bucket.is_disabled());
    }

    #[test]
    fn full_span_counter_shares_word_with_page_count() {
        let mut bucket = Bucket::zeroed();
        bucket.init(4096);
        let pages = bucket.system_pages_per_slot_span();
        bucket.inc_full_spans();
        bucket.inc_full_spans();
        assert_eq!(bucket.num_full_spans(), 2);
        assert_eq!(bucket.system_pages_per_slot_span(), pages);
        bucket.dec_full_spans();
        assert_eq!(bucket.num_full_spans(), 1);
    }

    #[test]
    fn sentinel_bucket_is_direct_mapped() {
        unsafe {
            assert!((*init::sentinel_bucket()).is_direct_mapped());
        }
    }
}

//! Partition roots: the state shared by both root flavours, plus the
//! fixed-bucket [`PartitionRoot`] and the size-class [`PartitionRootGeneric`].

pub mod fixed;
pub mod generic;

pub use fixed::PartitionRoot;
pub use generic::PartitionRootGeneric;

use crate::bucket::{self, Bucket};
use crate::config;
use crate::constants::{MAX_FREEABLE_SPANS, UNINITIALIZED_BYTE};
use crate::direct_map::DirectMapExtent;
use crate::error::{abort_with_message, handle_alloc_error, AllocError};
use crate::init;
use crate::page::SlotSpan;
use crate::platform::{self, PageAccess};
use crate::super_page::{self, SuperPageExtentEntry};
use bitflags::bitflags;
use core::ptr::{self, NonNull};

bitflags! {
    /// Per-call allocation options.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct AllocFlags: u32 {
        /// Return null instead of terminating when memory is unavailable
        /// or the size is too large.
        const RETURN_NULL = 1 << 0;
    }
}

bitflags! {
    /// What [`PartitionRootGeneric::purge_memory`] should reclaim.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct PurgeFlags: u32 {
        /// Decommit every span sitting in the empty ring.
        const DECOMMIT_EMPTY_PAGES = 1 << 0;
        /// Discard whole unused system pages inside active spans of
        /// buckets with slots of at least a system page.
        const DISCARD_UNUSED_SYSTEM_PAGES = 1 << 1;
    }
}

/// Bookkeeping common to both root flavours: counters, super-page vending
/// state, extents, direct maps and the empty-span ring.
pub struct RootBase {
    pub(crate) total_size_of_committed_pages: usize,
    pub(crate) total_size_of_super_pages: usize,
    pub(crate) total_size_of_direct_mapped_pages: usize,
    /// `!(address of this root)`, checked before trusting a root pointer
    /// read out of page metadata.
    pub(crate) inverted_self: usize,
    pub(crate) initialized: bool,
    pub(crate) next_super_page: *mut u8,
    pub(crate) next_partition_page: *mut u8,
    pub(crate) next_partition_page_end: *mut u8,
    pub(crate) current_extent: *mut SuperPageExtentEntry,
    pub(crate) first_extent: *mut SuperPageExtentEntry,
    pub(crate) direct_map_list: *mut DirectMapExtent,
    pub(crate) empty_ring: [*mut SlotSpan; MAX_FREEABLE_SPANS],
    pub(crate) empty_ring_index: usize,
    pub(crate) empty_ring_len: usize,
}

impl RootBase {
    pub const fn new() -> Self {
        RootBase {
            total_size_of_committed_pages: 0,
            total_size_of_super_pages: 0,
            total_size_of_direct_mapped_pages: 0,
            inverted_self: 0,
            initialized: false,
            next_super_page: ptr::null_mut(),
            next_partition_page: ptr::null_mut(),
            next_partition_page_end: ptr::null_mut(),
            current_extent: ptr::null_mut(),
            first_extent: ptr::null_mut(),
            direct_map_list: ptr::null_mut(),
            empty_ring: [ptr::null_mut(); MAX_FREEABLE_SPANS],
            empty_ring_index: 0,
            empty_ring_len: MAX_FREEABLE_SPANS,
        }
    }

    /// # Safety
    /// The root must not move afterwards: page metadata records its address.
    pub(crate) unsafe fn init(&mut self) {
        debug_assert!(!self.initialized, "partition root initialized twice");
        init::ensure_global_init();
        self.initialized = true;
        self.inverted_self = !(self as *const RootBase as usize);
        self.empty_ring_len = config::empty_ring_len();
    }

    pub fn is_initialized(&self) -> bool {
        self.initialized
    }

    /// Whether `span` lives in memory owned by this root.
    ///
    /// # Safety
    /// `span` must be a metadata record inside some live super page or
    /// direct mapping.
    pub(crate) unsafe fn is_valid_span(&self, span: *const SlotSpan) -> bool {
        let root = super_page::root_of(span);
        ptr::eq(root, self) && (*root).inverted_self == !(root as usize)
    }

    /// Span for a pointer about to be freed or resized, aborting if the
    /// pointer was not handed out by this root.
    ///
    /// # Safety
    /// `ptr` must point into memory reserved by some root.
    pub(crate) unsafe fn checked_span(&self, ptr: *const u8) -> *mut SlotSpan {
        let span = SlotSpan::from_pointer(ptr);
        if !self.is_valid_span(span) {
            abort_with_message("partalloc: pointer does not belong to this partition\n");
        }
        span
    }

    #[inline]
    pub(crate) fn increase_committed_pages(&mut self, len: usize) {
        self.total_size_of_committed_pages += len;
    }

    #[inline]
    pub(crate) fn decrease_committed_pages(&mut self, len: usize) {
        debug_assert!(self.total_size_of_committed_pages >= len);
        self.total_size_of_committed_pages -= len;
    }

    pub(crate) unsafe fn decommit_system_pages(&mut self, addr: *mut u8, len: usize) {
        self.decrease_committed_pages(len);
        platform::decommit_system_pages(addr, len);
    }

    pub(crate) unsafe fn recommit_system_pages(&mut self, addr: *mut u8, len: usize) {
        if !platform::recommit_system_pages(addr, len, PageAccess::ReadWrite) {
            abort_with_message("partalloc: failed to recommit pages\n");
        }
        self.increase_committed_pages(len);
    }

    /// Pop a slot from `bucket`, taking the slow path when its active span
    /// has no free-list entry.
    ///
    /// # Safety
    /// Caller must hold the root's lock; `bucket` must be the sentinel or a
    /// bucket of this root.
    #[inline(always)]
    pub(crate) unsafe fn alloc_from_bucket(
        &mut self,
        bucket: *mut Bucket,
        size: usize,
    ) -> Result<NonNull<u8>, AllocError> {
        debug_assert!(self.initialized);
        let span = (*bucket).active_head();
        if span.is_null() {
            abort_with_message("partalloc: allocation from a disabled bucket\n");
        }
        // Neither full nor freed.
        debug_assert!((*span).num_allocated_slots >= 0);

        let slot = if !(*span).freelist_head().is_null() {
            debug_assert!(self.is_valid_span(span));
            // Single-slot spans must go through the slow path to record
            // their raw size.
            debug_assert!((*span).raw_size() == 0);
            NonNull::new_unchecked((*span).pop_free_slot())
        } else {
            bucket::slow_path_alloc(bucket, self, size)?
        };

        if config::zap_enabled() {
            let span = SlotSpan::from_pointer(slot.as_ptr());
            let raw_size = (*span).raw_size();
            let len = if raw_size != 0 { raw_size } else { (*(*span).bucket).slot_size() };
            ptr::write_bytes(slot.as_ptr(), UNINITIALIZED_BYTE, len);
        }
        Ok(slot)
    }

    /// Decommit every span in the empty ring and clear the ring.
    ///
    /// # Safety
    /// Caller must hold the root's lock.
    pub(crate) unsafe fn decommit_empty_spans(&mut self) {
        for i in 0..MAX_FREEABLE_SPANS {
            let span = self.empty_ring[i];
            if !span.is_null() {
                (*span).decommit_if_possible(self);
            }
            self.empty_ring[i] = ptr::null_mut();
        }
    }
}

impl Default for RootBase {
    fn default() -> Self {
        Self::new()
    }
}

/// Turn an allocation result into the pointer the caller asked for: null
/// on failure if they opted in, otherwise the process ends here.
#[inline]
pub(crate) fn resolve(result: Result<NonNull<u8>, AllocError>, flags: AllocFlags) -> *mut u8 {
    match result {
        Ok(ptr) => ptr.as_ptr(),
        Err(err) if flags.contains(AllocFlags::RETURN_NULL) => {
            log::warn!("partalloc: {}; returning null", err);
            ptr::null_mut()
        }
        Err(err) => handle_alloc_error(err),
    }
}

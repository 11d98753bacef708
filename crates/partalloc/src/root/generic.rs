use super::{resolve, AllocFlags, PurgeFlags, RootBase};
use crate::bucket::Bucket;
use crate::constants::*;
use crate::direct_map::{self, direct_map_size};
use crate::error::AllocError;
use crate::hooks;
use crate::init;
use crate::page::purge::purge_bucket;
use crate::stats::{self, BucketMemoryStats, PartitionMemoryStats, StatsDumper};
use crate::sync::SpinLock;
use core::cell::UnsafeCell;
use core::ptr::{self, NonNull};

/// Lookup value meaning "too large for any bucket".
const DIRECT_MAP_INDEX: u16 = u16::MAX;

const NUM_ORDERS: usize = BITS_PER_SIZE_T + 1;

/// Slot size of generic bucket `index`. Each order doubles the base size
/// and splits it into `GENERIC_NUM_BUCKETS_PER_ORDER` even steps, so some
/// sizes (9, 10, ... 15, 18, ...) are not multiples of the smallest bucket.
/// Those pseudo buckets exist only to keep the index math uniform.
pub const fn generic_bucket_slot_size(index: usize) -> usize {
    let order = index >> GENERIC_NUM_BUCKETS_PER_ORDER_BITS;
    let step = index & (GENERIC_NUM_BUCKETS_PER_ORDER - 1);
    (GENERIC_SMALLEST_BUCKET + step * (GENERIC_SMALLEST_BUCKET >> GENERIC_NUM_BUCKETS_PER_ORDER_BITS))
        << order
}

struct GenericState {
    base: RootBase,
    buckets: [Bucket; GENERIC_NUM_BUCKETS],
}

/// A thread-safe partition serving any size: 136 size-class buckets up to
/// `GENERIC_MAX_BUCKETED` bytes, direct mappings beyond that.
///
/// Bucket lists and root bookkeeping live behind a spin lock. The size to
/// bucket tables are written once by [`init`](Self::init) and read without
/// it.
pub struct PartitionRootGeneric {
    lock: SpinLock,
    order_index_shifts: [usize; NUM_ORDERS],
    order_sub_index_masks: [usize; NUM_ORDERS],
    bucket_lookups: [u16; GENERIC_BUCKET_LOOKUP_LEN],
    state: UnsafeCell<GenericState>,
}

unsafe impl Send for PartitionRootGeneric {}
unsafe impl Sync for PartitionRootGeneric {}

impl PartitionRootGeneric {
    pub const fn new() -> Self {
        const BUCKET: Bucket = Bucket::zeroed();
        PartitionRootGeneric {
            lock: SpinLock::new(),
            order_index_shifts: [0; NUM_ORDERS],
            order_sub_index_masks: [0; NUM_ORDERS],
            bucket_lookups: [0; GENERIC_BUCKET_LOOKUP_LEN],
            state: UnsafeCell::new(GenericState {
                base: RootBase::new(),
                buckets: [BUCKET; GENERIC_NUM_BUCKETS],
            }),
        }
    }

    /// Set up buckets and the size lookup tables.
    ///
    /// # Safety
    /// Must be called exactly once, before any other method. The root must
    /// not move afterwards: page metadata records its address.
    pub unsafe fn init(&mut self) {
        let state = self.state.get_mut();
        state.base.init();

        // Example: 41 is 101001 in binary. Its order is 6 (the highest set
        // bit is 1 << 5). The order index is the next three bits, 010, which
        // picks the 40-byte bucket. The remaining bits (01) are non-zero, so
        // the request bumps up to the next bucket, 44.
        for order in 0..NUM_ORDERS {
            self.order_index_shifts[order] = order.saturating_sub(GENERIC_NUM_BUCKETS_PER_ORDER_BITS + 1);
            self.order_sub_index_masks[order] = if order == BITS_PER_SIZE_T {
                usize::MAX >> (GENERIC_NUM_BUCKETS_PER_ORDER_BITS + 1)
            } else {
                ((1usize << order) - 1) >> (GENERIC_NUM_BUCKETS_PER_ORDER_BITS + 1)
            };
        }

        for (i, bucket) in state.buckets.iter_mut().enumerate() {
            let slot_size = generic_bucket_slot_size(i);
            bucket.init(slot_size);
            if slot_size % GENERIC_SMALLEST_BUCKET != 0 {
                bucket.disable();
            }
        }
        debug_assert!(generic_bucket_slot_size(GENERIC_NUM_BUCKETS) == 1 << GENERIC_MAX_BUCKETED_ORDER);

        let mut bucket_index = 0;
        let mut k = 0;
        for order in 0..NUM_ORDERS {
            for _ in 0..GENERIC_NUM_BUCKETS_PER_ORDER {
                self.bucket_lookups[k] = if order < GENERIC_MIN_BUCKETED_ORDER {
                    // malloc(0) and other tiny sizes use the finest bucket.
                    0
                } else if order > GENERIC_MAX_BUCKETED_ORDER {
                    DIRECT_MAP_INDEX
                } else {
                    let mut valid = bucket_index;
                    while generic_bucket_slot_size(valid) % GENERIC_SMALLEST_BUCKET != 0 {
                        valid += 1;
                    }
                    bucket_index += 1;
                    valid as u16
                };
                k += 1;
            }
        }
        debug_assert!(bucket_index == GENERIC_NUM_BUCKETS);
        debug_assert!(k == NUM_ORDERS * GENERIC_NUM_BUCKETS_PER_ORDER);
        // Hit by sizes that would overflow into a non-existent order.
        self.bucket_lookups[k] = DIRECT_MAP_INDEX;
    }

    pub fn is_initialized(&self) -> bool {
        // SAFETY: `initialized` is only written by `init`, which has `&mut self`.
        unsafe { (*self.state.get()).base.is_initialized() }
    }

    /// Index of the bucket serving `size`, or `None` if `size` needs a
    /// direct mapping.
    #[inline]
    pub fn bucket_index_for_size(&self, size: usize) -> Option<usize> {
        let order = BITS_PER_SIZE_T - size.leading_zeros() as usize;
        // The order index is the next few bits after the most significant one.
        let order_index = (size >> self.order_index_shifts[order]) & (GENERIC_NUM_BUCKETS_PER_ORDER - 1);
        // Any bits below those bump the size up to the next bucket.
        let sub_order_index = size & self.order_sub_index_masks[order];
        let index = self.bucket_lookups
            [(order << GENERIC_NUM_BUCKETS_PER_ORDER_BITS) + order_index + (sub_order_index != 0) as usize];
        if index == DIRECT_MAP_INDEX {
            None
        } else {
            debug_assert!(generic_bucket_slot_size(index as usize) >= size);
            debug_assert!(generic_bucket_slot_size(index as usize) % GENERIC_SMALLEST_BUCKET == 0);
            Some(index as usize)
        }
    }

    /// Bucket for `size`; the sentinel bucket stands for direct mapping.
    #[inline]
    fn bucket_for_size(&self, size: usize) -> *mut Bucket {
        match self.bucket_index_for_size(size) {
            // SAFETY: in-bounds field projection, no reference created.
            Some(index) => unsafe { ptr::addr_of_mut!((*self.state.get()).buckets[index]) },
            None => init::sentinel_bucket(),
        }
    }

    #[inline]
    fn base(&self) -> *mut RootBase {
        // SAFETY: field projection only.
        unsafe { ptr::addr_of_mut!((*self.state.get()).base) }
    }

    /// Size a request for `size` bytes would really be given.
    pub fn actual_size(&self, size: usize) -> usize {
        match self.bucket_index_for_size(size) {
            Some(index) => generic_bucket_slot_size(index),
            // Too large to allocate: returned unchanged.
            None if size > GENERIC_MAX_DIRECT_MAPPED => size,
            None => direct_map_size(size),
        }
    }

    /// Allocate `size` bytes, terminating the process on failure.
    ///
    /// # Safety
    /// The root must be initialized.
    pub unsafe fn alloc(&self, size: usize, type_name: &str) -> *mut u8 {
        self.alloc_flags(AllocFlags::empty(), size, type_name)
    }

    /// Allocate `size` bytes. With [`AllocFlags::RETURN_NULL`] failures
    /// return null; otherwise they terminate the process.
    ///
    /// # Safety
    /// The root must be initialized.
    pub unsafe fn alloc_flags(&self, flags: AllocFlags, size: usize, type_name: &str) -> *mut u8 {
        resolve(self.try_alloc(size, type_name), flags)
    }

    /// Allocate `size` bytes, reporting failure to the caller.
    ///
    /// # Safety
    /// The root must be initialized.
    pub unsafe fn try_alloc(&self, size: usize, type_name: &str) -> Result<NonNull<u8>, AllocError> {
        let bucket = self.bucket_for_size(size);
        let result = {
            let _guard = self.lock.lock();
            (*self.base()).alloc_from_bucket(bucket, size)
        };
        if let Ok(ptr) = result {
            hooks::allocation_hook_if_enabled(ptr.as_ptr(), size, type_name);
        }
        result
    }

    /// Free an allocation. Null is ignored.
    ///
    /// # Safety
    /// `ptr` must be null or a live allocation from this root.
    pub unsafe fn free(&self, ptr: *mut u8) {
        if ptr.is_null() {
            return;
        }
        hooks::free_hook_if_enabled(ptr);
        let _guard = self.lock.lock();
        let base = &mut *self.base();
        let span = base.checked_span(ptr);
        (*span).free(base, ptr);
    }

    /// Slot size backing the allocation at `ptr`.
    ///
    /// # Safety
    /// `ptr` must be a live allocation from this root.
    pub unsafe fn get_size(&self, ptr: *mut u8) -> usize {
        let _guard = self.lock.lock();
        let span = (*self.base()).checked_span(ptr);
        (*(*span).bucket).slot_size()
    }

    /// # Safety
    /// `ptr` must be null or a live allocation from this root.
    pub unsafe fn realloc(&self, ptr: *mut u8, new_size: usize, type_name: &str) -> *mut u8 {
        self.realloc_flags(AllocFlags::empty(), ptr, new_size, type_name)
    }

    /// Resize an allocation, keeping its first `min(old, new)` bytes.
    ///
    /// A null `ptr` allocates; a zero `new_size` frees and returns null.
    /// Direct mappings are resized in place where possible. A request that
    /// lands on the same slot size keeps the pointer; anything else moves.
    ///
    /// # Safety
    /// `ptr` must be null or a live allocation from this root.
    pub unsafe fn realloc_flags(
        &self,
        flags: AllocFlags,
        ptr: *mut u8,
        new_size: usize,
        type_name: &str,
    ) -> *mut u8 {
        if ptr.is_null() {
            return self.alloc_flags(flags, new_size, type_name);
        }
        if new_size == 0 {
            self.free(ptr);
            return ptr::null_mut();
        }
        if new_size > GENERIC_MAX_DIRECT_MAPPED {
            return resolve(Err(AllocError::ExcessiveSize { size: new_size }), flags);
        }

        enum Outcome {
            InPlace,
            Unchanged,
            Move { old_size: usize },
        }

        let actual_new_size = self.actual_size(new_size);
        let outcome = {
            let _guard = self.lock.lock();
            let base = &mut *self.base();
            let span = base.checked_span(ptr);
            let bucket = &*(*span).bucket;
            if bucket.is_direct_mapped() && direct_map::realloc_in_place(base, span, new_size) {
                Outcome::InPlace
            } else {
                let old_size = (*(*span).bucket).slot_size();
                if old_size == actual_new_size {
                    // Same slot size: only the recorded size changes.
                    (*span).set_raw_size(new_size);
                    Outcome::Unchanged
                } else {
                    Outcome::Move { old_size }
                }
            }
        };

        match outcome {
            Outcome::InPlace => {
                hooks::realloc_hook_if_enabled(ptr, ptr, new_size, type_name);
                ptr
            }
            Outcome::Unchanged => ptr,
            Outcome::Move { old_size } => {
                let ret = self.alloc_flags(flags, new_size, type_name);
                if ret.is_null() {
                    return ptr::null_mut();
                }
                ptr::copy_nonoverlapping(ptr, ret, old_size.min(new_size));
                self.free(ptr);
                ret
            }
        }
    }

    /// Reclaim memory according to `flags`.
    pub fn purge_memory(&self, flags: PurgeFlags) {
        let _guard = self.lock.lock();
        // SAFETY: the lock is held.
        unsafe {
            if flags.contains(PurgeFlags::DECOMMIT_EMPTY_PAGES) {
                (*self.base()).decommit_empty_spans();
            }
            if flags.contains(PurgeFlags::DISCARD_UNUSED_SYSTEM_PAGES) {
                let buckets = ptr::addr_of!((*self.state.get()).buckets);
                let mut discarded = 0;
                for bucket in (*buckets).iter() {
                    if bucket.slot_size() >= SYSTEM_PAGE_SIZE {
                        discarded += purge_bucket(bucket);
                    }
                }
                log::debug!("partalloc: discarded {} bytes of unused system pages", discarded);
            }
        }
    }

    /// Report usage to `dumper`. A light dump only reports totals. Detailed
    /// reports are delivered after the lock is released.
    pub fn dump_stats(&self, partition_name: &str, is_light_dump: bool, dumper: &mut dyn StatsDumper) {
        let mut stats = PartitionMemoryStats::default();
        // Reserved up front: nothing may allocate while the lock is held.
        let mut bucket_stats: Vec<BucketMemoryStats> = Vec::new();
        let mut direct_map_lengths: Vec<usize> = Vec::new();
        if !is_light_dump {
            bucket_stats.reserve_exact(GENERIC_NUM_BUCKETS);
            direct_map_lengths.reserve_exact(MAX_REPORTABLE_DIRECT_MAPS);
        }

        let mut direct_mapped_total = 0;
        {
            let _guard = self.lock.lock();
            // SAFETY: the lock is held.
            unsafe {
                let base = &*self.base();
                stats.total_mmapped_bytes =
                    base.total_size_of_super_pages + base.total_size_of_direct_mapped_pages;
                stats.total_committed_bytes = base.total_size_of_committed_pages;

                let buckets = ptr::addr_of!((*self.state.get()).buckets);
                for bucket in (*buckets).iter() {
                    // Pseudo buckets are never reported.
                    if bucket.is_disabled() {
                        continue;
                    }
                    if let Some(bs) = stats::dump_bucket_stats(bucket) {
                        stats.add_bucket(&bs);
                        if !is_light_dump {
                            bucket_stats.push(bs);
                        }
                    }
                }

                let mut extent = base.direct_map_list;
                let mut count = 0;
                while !extent.is_null() && count < MAX_REPORTABLE_DIRECT_MAPS {
                    debug_assert!((*extent).next.is_null() || (*(*extent).next).prev == extent);
                    let slot_size = (*extent).slot_size();
                    direct_mapped_total += slot_size;
                    if !is_light_dump {
                        direct_map_lengths.push(slot_size);
                    }
                    extent = (*extent).next;
                    count += 1;
                }
            }
        }

        if !is_light_dump {
            for bs in &bucket_stats {
                dumper.dump_bucket_stats(partition_name, bs);
            }
            for &size in &direct_map_lengths {
                dumper.dump_bucket_stats(partition_name, &BucketMemoryStats::direct_map(size));
            }
        }

        stats.total_resident_bytes += direct_mapped_total;
        stats.total_active_bytes += direct_mapped_total;
        dumper.dump_totals(partition_name, &stats);
    }

    /// Super pages reserved so far.
    pub fn super_page_count(&self) -> usize {
        let _guard = self.lock.lock();
        // SAFETY: the lock is held.
        unsafe { (*self.base()).super_page_count() }
    }
}

impl Default for PartitionRootGeneric {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn root() -> Box<PartitionRootGeneric> {
        let mut root = Box::new(PartitionRootGeneric::new());
        unsafe { root.init() };
        root
    }

    #[test]
    fn bucket_sizes_follow_orders() {
        assert_eq!(generic_bucket_slot_size(0), 8);
        assert_eq!(generic_bucket_slot_size(1), 9);
        assert_eq!(generic_bucket_slot_size(8), 16);
        assert_eq!(generic_bucket_slot_size(GENERIC_NUM_BUCKETS - 1), GENERIC_MAX_BUCKETED);
    }

    #[test]
    fn lookup_worked_example() {
        let root = root();
        // 41 -> order 6, order index 2, non-zero remainder -> 44.
        let index = root.bucket_index_for_size(41).unwrap();
        assert_eq!(generic_bucket_slot_size(index), 44);
        let index = root.bucket_index_for_size(40).unwrap();
        assert_eq!(generic_bucket_slot_size(index), 40);
        assert_eq!(root.bucket_index_for_size(0), Some(0));
        assert_eq!(root.bucket_index_for_size(8), Some(0));
        assert_eq!(root.bucket_index_for_size(GENERIC_MAX_BUCKETED), Some(GENERIC_NUM_BUCKETS - 1));
        assert_eq!(root.bucket_index_for_size(GENERIC_MAX_BUCKETED + 1), None);
        assert_eq!(root.bucket_index_for_size(usize::MAX), None);
    }

    #[test]
    fn pseudo_buckets_are_disabled() {
        let root = root();
        let state = unsafe { &*root.state.get() };
        for (i, bucket) in state.buckets.iter().enumerate() {
            let pseudo = generic_bucket_slot_size(i) % GENERIC_SMALLEST_BUCKET != 0;
            assert_eq!(bucket.is_disabled(), pseudo, "bucket {}", i);
        }
    }

    #[test]
    fn actual_size_matches_slot_sizes() {
        let root = root();
        assert_eq!(root.actual_size(1), 8);
        assert_eq!(root.actual_size(41), 44);
        assert_eq!(root.actual_size(9), 16);
        assert_eq!(
            root.actual_size(GENERIC_MAX_BUCKETED + 1),
            GENERIC_MAX_BUCKETED + SYSTEM_PAGE_SIZE
        );
        assert_eq!(root.actual_size(GENERIC_MAX_DIRECT_MAPPED + 1), GENERIC_MAX_DIRECT_MAPPED + 1);
    }
}

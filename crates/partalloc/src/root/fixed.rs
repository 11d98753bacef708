use super::{resolve, AllocFlags, PurgeFlags, RootBase};
use crate::bucket::Bucket;
use crate::constants::*;
use crate::error::AllocError;
use crate::hooks;
use crate::stats::{self, BucketMemoryStats, PartitionMemoryStats, StatsDumper};
use crate::util::align_up;
use core::ptr::{self, NonNull};

/// A partition with a fixed number of buckets spaced one allocation
/// granule apart. No lock: callers serialize access, which the `&mut self`
/// receivers enforce.
pub struct PartitionRoot {
    base: RootBase,
    buckets: Vec<Bucket>,
    max_allocation: usize,
}

unsafe impl Send for PartitionRoot {}

impl PartitionRoot {
    pub const fn new() -> Self {
        PartitionRoot {
            base: RootBase::new(),
            buckets: Vec::new(),
            max_allocation: 0,
        }
    }

    /// Set up `num_buckets` buckets serving sizes up to `max_allocation`.
    /// Bucket `i` holds `i * 8` byte slots, except bucket 0 which holds 8.
    ///
    /// # Safety
    /// Must be called exactly once, before any other method. The root must
    /// not move afterwards: page metadata records its address.
    pub unsafe fn init(&mut self, num_buckets: usize, max_allocation: usize) {
        debug_assert!(num_buckets > 0);
        debug_assert!(max_allocation <= MAX_MULTI_SLOT_SIZE);
        debug_assert!(align_up(max_allocation, ALLOCATION_GRANULARITY) >> BUCKET_SHIFT < num_buckets);
        self.base.init();
        self.max_allocation = max_allocation;
        self.buckets = (0..num_buckets)
            .map(|i| {
                let mut bucket = Bucket::zeroed();
                bucket.init(if i == 0 { ALLOCATION_GRANULARITY } else { i << BUCKET_SHIFT });
                bucket
            })
            .collect();
    }

    pub fn is_initialized(&self) -> bool {
        self.base.is_initialized()
    }

    pub fn max_allocation(&self) -> usize {
        self.max_allocation
    }

    pub fn num_buckets(&self) -> usize {
        self.buckets.len()
    }

    /// Size a request for `size` bytes would really be given.
    pub fn actual_size(&self, size: usize) -> usize {
        if size > self.max_allocation {
            return size;
        }
        self.buckets[align_up(size, ALLOCATION_GRANULARITY) >> BUCKET_SHIFT].slot_size()
    }

    /// # Safety
    /// The root must be initialized.
    pub unsafe fn alloc(&mut self, size: usize, type_name: &str) -> *mut u8 {
        self.alloc_flags(AllocFlags::empty(), size, type_name)
    }

    /// # Safety
    /// The root must be initialized.
    pub unsafe fn alloc_flags(&mut self, flags: AllocFlags, size: usize, type_name: &str) -> *mut u8 {
        resolve(self.try_alloc(size, type_name), flags)
    }

    /// # Safety
    /// The root must be initialized.
    pub unsafe fn try_alloc(&mut self, size: usize, type_name: &str) -> Result<NonNull<u8>, AllocError> {
        if size > self.max_allocation {
            return Err(AllocError::ExcessiveSize { size });
        }
        let index = align_up(size, ALLOCATION_GRANULARITY) >> BUCKET_SHIFT;
        let bucket: *mut Bucket = &mut self.buckets[index];
        let result = self.base.alloc_from_bucket(bucket, size);
        if let Ok(ptr) = result {
            hooks::allocation_hook_if_enabled(ptr.as_ptr(), size, type_name);
        }
        result
    }

    /// Free an allocation. Null is ignored.
    ///
    /// # Safety
    /// `ptr` must be null or a live allocation from this root.
    pub unsafe fn free(&mut self, ptr: *mut u8) {
        if ptr.is_null() {
            return;
        }
        hooks::free_hook_if_enabled(ptr);
        let span = self.base.checked_span(ptr);
        (*span).free(&mut self.base, ptr);
    }

    /// Slot size backing the allocation at `ptr`.
    ///
    /// # Safety
    /// `ptr` must be a live allocation from this root.
    pub unsafe fn get_size(&self, ptr: *mut u8) -> usize {
        let span = self.base.checked_span(ptr);
        (*(*span).bucket).slot_size()
    }

    /// Resize an allocation. Same-bucket requests keep the pointer; others
    /// move. A null `ptr` allocates, a zero `new_size` frees.
    ///
    /// # Safety
    /// `ptr` must be null or a live allocation from this root.
    pub unsafe fn realloc(&mut self, ptr: *mut u8, new_size: usize, type_name: &str) -> *mut u8 {
        self.realloc_flags(AllocFlags::empty(), ptr, new_size, type_name)
    }

    /// [`realloc`](Self::realloc) honouring `flags`. With
    /// [`AllocFlags::RETURN_NULL`] a request the root cannot serve returns
    /// null and leaves `ptr` untouched.
    ///
    /// # Safety
    /// `ptr` must be null or a live allocation from this root.
    pub unsafe fn realloc_flags(
        &mut self,
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
        if new_size > self.max_allocation {
            return resolve(Err(AllocError::ExcessiveSize { size: new_size }), flags);
        }
        let old_size = self.get_size(ptr);
        if old_size == self.actual_size(new_size) {
            return ptr;
        }
        let ret = self.alloc_flags(flags, new_size, type_name);
        if ret.is_null() {
            return ptr::null_mut();
        }
        ptr::copy_nonoverlapping(ptr, ret, old_size.min(new_size));
        self.free(ptr);
        ret
    }

    /// Reclaim memory. Fixed roots only support
    /// [`PurgeFlags::DECOMMIT_EMPTY_PAGES`]; other flags are ignored.
    pub fn purge_memory(&mut self, flags: PurgeFlags) {
        if flags.contains(PurgeFlags::DECOMMIT_EMPTY_PAGES) {
            // SAFETY: `&mut self` serializes access.
            unsafe { self.base.decommit_empty_spans() };
        }
    }

    /// Report usage to `dumper`. A light dump only reports totals.
    pub fn dump_stats(&mut self, partition_name: &str, is_light_dump: bool, dumper: &mut dyn StatsDumper) {
        let mut stats = PartitionMemoryStats {
            total_mmapped_bytes: self.base.total_size_of_super_pages,
            total_committed_bytes: self.base.total_size_of_committed_pages,
            ..Default::default()
        };
        debug_assert!(self.base.total_size_of_direct_mapped_pages == 0);

        // Every bucket counts towards the totals; only the first
        // MAX_REPORTABLE_BUCKETS in use are reported individually.
        let mut bucket_stats: Vec<BucketMemoryStats> = Vec::new();
        if !is_light_dump {
            bucket_stats.reserve_exact(self.buckets.len().min(MAX_REPORTABLE_BUCKETS));
        }
        for bucket in &self.buckets {
            // SAFETY: `&mut self` serializes access.
            if let Some(bs) = unsafe { stats::dump_bucket_stats(bucket) } {
                stats.add_bucket(&bs);
                if !is_light_dump && bucket_stats.len() < MAX_REPORTABLE_BUCKETS {
                    bucket_stats.push(bs);
                }
            }
        }

        for bs in &bucket_stats {
            dumper.dump_bucket_stats(partition_name, bs);
        }
        dumper.dump_totals(partition_name, &stats);
    }

    /// Super pages reserved so far.
    pub fn super_page_count(&self) -> usize {
        self.base.super_page_count()
    }
}

impl Default for PartitionRoot {
    fn default() -> Self {
        Self::new()
    }
}

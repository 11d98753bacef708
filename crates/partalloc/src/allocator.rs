//! Owning wrappers that box a root, initialize it and keep it in place.
//!
//! Roots record their own address in page metadata, so they must never
//! move once initialized. Boxing them here takes care of that. Dropping a
//! wrapper leaks the root's pages: outstanding allocations stay valid, and
//! tearing down a partition is not supported.

use crate::constants::ALLOCATION_GRANULARITY;
use crate::error::AllocError;
use crate::root::{AllocFlags, PartitionRoot, PartitionRootGeneric, PurgeFlags};
use crate::stats::StatsDumper;
use core::ptr::NonNull;

/// A ready-to-use, thread-safe generic partition.
pub struct PartitionAllocatorGeneric {
    root: Box<PartitionRootGeneric>,
}

impl PartitionAllocatorGeneric {
    pub fn new() -> Self {
        let mut root = Box::new(PartitionRootGeneric::new());
        // SAFETY: fresh root, and the box keeps it from moving.
        unsafe { root.init() };
        PartitionAllocatorGeneric { root }
    }

    pub fn root(&self) -> &PartitionRootGeneric {
        &self.root
    }

    pub fn alloc(&self, size: usize, type_name: &str) -> *mut u8 {
        // SAFETY: the root was initialized in `new`.
        unsafe { self.root.alloc(size, type_name) }
    }

    pub fn alloc_flags(&self, flags: AllocFlags, size: usize, type_name: &str) -> *mut u8 {
        // SAFETY: the root was initialized in `new`.
        unsafe { self.root.alloc_flags(flags, size, type_name) }
    }

    pub fn try_alloc(&self, size: usize, type_name: &str) -> Result<NonNull<u8>, AllocError> {
        // SAFETY: the root was initialized in `new`.
        unsafe { self.root.try_alloc(size, type_name) }
    }

    /// # Safety
    /// `ptr` must be null or a live allocation from this allocator.
    pub unsafe fn free(&self, ptr: *mut u8) {
        self.root.free(ptr)
    }

    /// # Safety
    /// `ptr` must be null or a live allocation from this allocator.
    pub unsafe fn realloc(&self, ptr: *mut u8, new_size: usize, type_name: &str) -> *mut u8 {
        self.root.realloc(ptr, new_size, type_name)
    }

    pub fn purge_memory(&self, flags: PurgeFlags) {
        self.root.purge_memory(flags)
    }

    pub fn dump_stats(&self, partition_name: &str, is_light_dump: bool, dumper: &mut dyn StatsDumper) {
        self.root.dump_stats(partition_name, is_light_dump, dumper)
    }
}

impl Default for PartitionAllocatorGeneric {
    fn default() -> Self {
        Self::new()
    }
}

/// A fixed partition for objects of at most `N - 8` bytes, one bucket per
/// 8-byte step. Single-threaded: every operation takes `&mut self`.
pub struct SizeSpecificPartitionAllocator<const N: usize> {
    root: Box<PartitionRoot>,
}

impl<const N: usize> SizeSpecificPartitionAllocator<N> {
    pub const NUM_BUCKETS: usize = N / ALLOCATION_GRANULARITY;
    pub const MAX_ALLOCATION: usize = N - ALLOCATION_GRANULARITY;

    pub fn new() -> Self {
        let mut root = Box::new(PartitionRoot::new());
        // SAFETY: fresh root, and the box keeps it from moving.
        unsafe { root.init(Self::NUM_BUCKETS, Self::MAX_ALLOCATION) };
        SizeSpecificPartitionAllocator { root }
    }

    pub fn root(&mut self) -> &mut PartitionRoot {
        &mut self.root
    }

    pub fn alloc(&mut self, size: usize, type_name: &str) -> *mut u8 {
        // SAFETY: the root was initialized in `new`.
        unsafe { self.root.alloc(size, type_name) }
    }

    pub fn try_alloc(&mut self, size: usize, type_name: &str) -> Result<NonNull<u8>, AllocError> {
        // SAFETY: the root was initialized in `new`.
        unsafe { self.root.try_alloc(size, type_name) }
    }

    /// # Safety
    /// `ptr` must be null or a live allocation from this allocator.
    pub unsafe fn free(&mut self, ptr: *mut u8) {
        self.root.free(ptr)
    }

    pub fn purge_memory(&mut self, flags: PurgeFlags) {
        self.root.purge_memory(flags)
    }

    pub fn dump_stats(&mut self, partition_name: &str, is_light_dump: bool, dumper: &mut dyn StatsDumper) {
        self.root.dump_stats(partition_name, is_light_dump, dumper)
    }
}

impl<const N: usize> Default for SizeSpecificPartitionAllocator<N> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn size_specific_geometry() {
        let mut a = SizeSpecificPartitionAllocator::<1024>::new();
        assert_eq!(SizeSpecificPartitionAllocator::<1024>::NUM_BUCKETS, 128);
        assert_eq!(a.root().max_allocation(), 1016);
        let p = a.alloc(1016, "test");
        assert!(!p.is_null());
        assert!(a.try_alloc(1017, "test").is_err());
        unsafe { a.free(p) };
    }

    #[test]
    fn generic_allocator_round_trip() {
        let a = PartitionAllocatorGeneric::new();
        let p = a.alloc(100, "test");
        assert!(!p.is_null());
        unsafe {
            p.write_bytes(0x11, 100);
            let q = a.realloc(p, 200, "test");
            assert_eq!(*q.add(99), 0x11);
            a.free(q);
        }
    }
}

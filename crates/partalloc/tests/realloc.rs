//! Realloc semantics on the generic partition.

use partalloc::constants::*;
use partalloc::PartitionAllocatorGeneric;
use std::ptr;

fn fill(p: *mut u8, len: usize) {
    for i in 0..len {
        unsafe { *p.add(i) = (i % 251) as u8 };
    }
}

fn check(p: *const u8, len: usize) {
    for i in 0..len {
        assert_eq!(unsafe { *p.add(i) }, (i % 251) as u8, "byte {} differs", i);
    }
}

// ---------------------------------------------------------------------------
// null / zero edge cases
// ---------------------------------------------------------------------------

#[test]
fn realloc_null_allocates() {
    let a = PartitionAllocatorGeneric::new();
    unsafe {
        let p = a.realloc(ptr::null_mut(), 64, "test");
        assert!(!p.is_null());
        assert_eq!(a.root().get_size(p), 64);
        a.free(p);
    }
}

#[test]
fn realloc_to_zero_frees() {
    let a = PartitionAllocatorGeneric::new();
    unsafe {
        let p = a.alloc(64, "test");
        let q = a.realloc(p, 0, "test");
        assert!(q.is_null());
        // The slot went back on the free list.
        let r = a.alloc(64, "test");
        assert_eq!(r, p);
        a.free(r);
    }
}

// ---------------------------------------------------------------------------
// Same bucket keeps the pointer
// ---------------------------------------------------------------------------

#[test]
fn same_bucket_returns_same_pointer() {
    let a = PartitionAllocatorGeneric::new();
    unsafe {
        // 41 and 44 both land in the 44-byte bucket.
        let p = a.alloc(41, "test");
        fill(p, 41);
        let q = a.realloc(p, 44, "test");
        assert_eq!(p, q);
        check(q, 41);
        let r = a.realloc(q, 42, "test");
        assert_eq!(q, r);
        check(r, 41);
        a.free(r);
    }
}

#[test]
fn same_bucket_single_slot_span_updates_raw_size() {
    let a = PartitionAllocatorGeneric::new();
    unsafe {
        let p = a.alloc(300_000, "test");
        fill(p, 4096);
        let q = a.realloc(p, 310_000, "test");
        assert_eq!(p, q);
        check(q, 4096);
        a.free(q);
    }
}

// ---------------------------------------------------------------------------
// Moving between buckets
// ---------------------------------------------------------------------------

#[test]
fn grow_across_buckets_moves_and_copies() {
    let a = PartitionAllocatorGeneric::new();
    unsafe {
        let p = a.alloc(100, "test");
        fill(p, 100);
        let q = a.realloc(p, 1000, "test");
        assert_ne!(p, q);
        check(q, 100);
        assert_eq!(a.root().get_size(q), a.root().actual_size(1000));

        // The old slot was freed and is handed out again.
        let r = a.alloc(100, "test");
        assert_eq!(r, p);
        a.free(r);
        a.free(q);
    }
}

#[test]
fn shrink_across_buckets_keeps_prefix() {
    let a = PartitionAllocatorGeneric::new();
    unsafe {
        let p = a.alloc(5000, "test");
        fill(p, 5000);
        let q = a.realloc(p, 16, "test");
        assert_ne!(p, q);
        check(q, 16);
        a.free(q);
    }
}

#[test]
fn bucketed_to_direct_mapped_and_back() {
    let a = PartitionAllocatorGeneric::new();
    unsafe {
        let p = a.alloc(2048, "test");
        fill(p, 2048);
        let big = GENERIC_MAX_BUCKETED + 1;
        let q = a.realloc(p, big, "test");
        assert_ne!(p, q);
        check(q, 2048);
        assert_eq!(a.root().get_size(q), big.next_multiple_of(SYSTEM_PAGE_SIZE));

        let r = a.realloc(q, 512, "test");
        assert_ne!(q, r);
        check(r, 512);
        a.free(r);
    }
}

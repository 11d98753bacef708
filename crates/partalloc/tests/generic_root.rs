//! End-to-end behaviour of the generic partition: slot reuse, size
//! classes, and the span state machine as seen through stats.

use partalloc::constants::*;
use partalloc::{AllocFlags, CollectingDumper, PartitionAllocatorGeneric, PurgeFlags};
use std::collections::HashSet;

fn dump(a: &PartitionAllocatorGeneric) -> CollectingDumper {
    let mut d = CollectingDumper::new();
    a.dump_stats("test", false, &mut d);
    d
}

// ---------------------------------------------------------------------------
// Basic scenario: reuse, then decommit after a purge
// ---------------------------------------------------------------------------

#[test]
fn alloc_reuse_and_decommit() {
    let a = PartitionAllocatorGeneric::new();
    let p1 = a.alloc(40, "test");
    assert!(!p1.is_null());
    assert_eq!(p1 as usize % ALLOCATION_GRANULARITY, 0);
    let p2 = a.alloc(40, "test");
    assert!(!p2.is_null());
    assert_ne!(p1, p2);

    unsafe {
        a.free(p1);
        let p3 = a.alloc(40, "test");
        assert_eq!(p3, p1, "most recently freed slot is reused first");
        a.free(p3);
        a.free(p2);
    }

    let before = dump(&a);
    let bucket = before.bucket(40).expect("40-byte bucket reported");
    assert_eq!(bucket.num_empty_pages, 1);
    assert_eq!(bucket.active_bytes, 0);

    a.purge_memory(PurgeFlags::DECOMMIT_EMPTY_PAGES);

    let after = dump(&a);
    let bucket = after.bucket(40).expect("40-byte bucket reported");
    assert!(bucket.num_decommitted_pages >= 1);
    assert_eq!(bucket.num_empty_pages, 0);
    assert_eq!(bucket.resident_bytes, 0);
}

#[test]
fn decommitted_span_comes_back_to_life() {
    let a = PartitionAllocatorGeneric::new();
    let p = a.alloc(64, "test");
    unsafe { a.free(p) };
    a.purge_memory(PurgeFlags::DECOMMIT_EMPTY_PAGES);
    let committed_low = dump(&a).totals.unwrap().total_committed_bytes;

    let q = a.alloc(64, "test");
    assert!(!q.is_null());
    unsafe {
        // Recommitted memory is writable again.
        q.write_bytes(0x5A, 64);
        assert_eq!(*q.add(63), 0x5A);
    }

    let d = dump(&a);
    let bucket = d.bucket(64).unwrap();
    assert_eq!(bucket.num_active_pages, 1);
    assert_eq!(bucket.num_decommitted_pages, 0);
    assert!(d.totals.unwrap().total_committed_bytes > committed_low);
    unsafe { a.free(q) };
}

// ---------------------------------------------------------------------------
// Size classes
// ---------------------------------------------------------------------------

#[test]
fn zero_sized_alloc_is_unique_and_freeable() {
    let a = PartitionAllocatorGeneric::new();
    let mut seen = HashSet::new();
    let mut ptrs = Vec::new();
    for _ in 0..64 {
        let p = a.alloc(0, "test");
        assert!(!p.is_null());
        assert!(seen.insert(p as usize));
        ptrs.push(p);
    }
    for p in ptrs {
        unsafe { a.free(p) };
    }
}

#[test]
fn get_size_reports_slot_size() {
    let a = PartitionAllocatorGeneric::new();
    let root = a.root();
    for &size in &[1usize, 8, 9, 41, 100, 1000, 5000, 70_000, GENERIC_MAX_BUCKETED] {
        let p = a.alloc(size, "test");
        unsafe {
            assert_eq!(root.get_size(p), root.actual_size(size), "size {}", size);
            assert!(root.get_size(p) >= size);
            a.free(p);
        }
    }
}

#[test]
fn whole_slot_is_writable() {
    let a = PartitionAllocatorGeneric::new();
    for &size in &[24usize, 200, 3000, 20_000, 300_000] {
        let p = a.alloc(size, "test");
        let usable = unsafe { a.root().get_size(p) };
        unsafe {
            p.write_bytes(0xEE, usable);
            assert_eq!(*p.add(usable - 1), 0xEE);
            a.free(p);
        }
    }
}

#[test]
fn many_small_allocations_are_distinct() {
    let a = PartitionAllocatorGeneric::new();
    let mut ptrs = Vec::new();
    let mut seen = HashSet::new();
    for i in 0..10_000usize {
        let size = 8 + (i % 120);
        let p = a.alloc(size, "test");
        unsafe { p.write_bytes((i & 0xFF) as u8, size) };
        assert!(seen.insert(p as usize));
        ptrs.push((p, size, (i & 0xFF) as u8));
    }
    for (p, size, byte) in ptrs {
        unsafe {
            assert_eq!(*p, byte);
            assert_eq!(*p.add(size - 1), byte);
            a.free(p);
        }
    }
}

// ---------------------------------------------------------------------------
// Failure policy
// ---------------------------------------------------------------------------

#[test]
fn excessive_size_returns_null_when_asked() {
    let a = PartitionAllocatorGeneric::new();
    let p = a.alloc_flags(AllocFlags::RETURN_NULL, GENERIC_MAX_DIRECT_MAPPED + 1, "test");
    assert!(p.is_null());
    let err = a.try_alloc(usize::MAX, "test").unwrap_err();
    assert_eq!(err.size(), usize::MAX);
}

#[test]
fn free_null_is_a_no_op() {
    let a = PartitionAllocatorGeneric::new();
    unsafe { a.free(std::ptr::null_mut()) };
}

// ---------------------------------------------------------------------------
// Super pages
// ---------------------------------------------------------------------------

#[test]
fn super_pages_are_reserved_on_demand() {
    let a = PartitionAllocatorGeneric::new();
    assert_eq!(a.root().super_page_count(), 0);
    let p = a.alloc(16, "test");
    assert_eq!(a.root().super_page_count(), 1);

    // Enough 16 KiB slots to spill past one super page.
    let count = SUPER_PAGE_SIZE / 16384 + 8;
    let ptrs: Vec<_> = (0..count).map(|_| a.alloc(16384, "test")).collect();
    assert!(a.root().super_page_count() >= 2);

    unsafe {
        for p in ptrs {
            a.free(p);
        }
        a.free(p);
    }
}

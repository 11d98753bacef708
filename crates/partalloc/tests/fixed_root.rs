//! The fixed-bucket partition through `SizeSpecificPartitionAllocator`.

use partalloc::constants::*;
use partalloc::{CollectingDumper, PurgeFlags, SizeSpecificPartitionAllocator};

type Small = SizeSpecificPartitionAllocator<1024>;
/// More buckets than a dump reports, with slots spanning several pages.
type Large = SizeSpecificPartitionAllocator<8192>;

#[test]
fn every_bucket_serves_its_size() {
    let mut a = Small::new();
    let mut ptrs = Vec::new();
    for size in (0..=Small::MAX_ALLOCATION).step_by(8) {
        let p = a.alloc(size, "test");
        assert!(!p.is_null());
        let expected = if size == 0 { ALLOCATION_GRANULARITY } else { size };
        assert_eq!(unsafe { a.root().get_size(p) }, expected);
        ptrs.push(p);
    }
    for p in ptrs {
        unsafe { a.free(p) };
    }
}

#[test]
fn unaligned_sizes_round_up() {
    let mut a = Small::new();
    let p = a.alloc(13, "test");
    assert_eq!(unsafe { a.root().get_size(p) }, 16);
    assert_eq!(a.root().actual_size(13), 16);
    unsafe { a.free(p) };
}

#[test]
fn too_large_is_an_error() {
    let mut a = Small::new();
    let err = a.try_alloc(Small::MAX_ALLOCATION + 1, "test").unwrap_err();
    assert_eq!(err, partalloc::AllocError::ExcessiveSize { size: 1017 });
}

#[test]
fn realloc_moves_between_buckets() {
    let mut a = Small::new();
    unsafe {
        let p = a.alloc(16, "test");
        p.write_bytes(0x3C, 16);
        let root = a.root();
        let same = root.realloc(p, 12, "test");
        assert_eq!(same, p);
        let q = root.realloc(p, 512, "test");
        assert_ne!(q, p);
        assert_eq!(*q.add(15), 0x3C);
        root.free(q);
    }
}

#[test]
fn purge_decommits_empty_spans() {
    let mut a = Small::new();
    let p = a.alloc(96, "test");
    unsafe { a.free(p) };

    let mut d = CollectingDumper::new();
    a.dump_stats("fixed", false, &mut d);
    assert_eq!(d.bucket(96).unwrap().num_empty_pages, 1);

    // Discarding is not available on fixed roots and does nothing.
    a.purge_memory(PurgeFlags::DISCARD_UNUSED_SYSTEM_PAGES);
    let mut d = CollectingDumper::new();
    a.dump_stats("fixed", false, &mut d);
    assert_eq!(d.bucket(96).unwrap().num_empty_pages, 1);

    a.purge_memory(PurgeFlags::DECOMMIT_EMPTY_PAGES);
    let mut d = CollectingDumper::new();
    a.dump_stats("fixed", false, &mut d);
    let b = d.bucket(96).unwrap();
    assert_eq!(b.num_decommitted_pages, 1);
    assert_eq!(d.totals.unwrap().total_resident_bytes, 0);
    assert_eq!(d.direct_maps().count(), 0);
}

#[test]
fn fixed_roots_are_independent() {
    let mut a = Small::new();
    let mut b = SizeSpecificPartitionAllocator::<64>::new();
    let p = a.alloc(32, "a");
    let q = b.alloc(32, "b");
    assert_ne!(p, q);
    assert_eq!(a.root().super_page_count(), 1);
    assert_eq!(b.root().super_page_count(), 1);
    unsafe {
        a.free(p);
        b.free(q);
    }
}

// ---------------------------------------------------------------------------
// Roots with more buckets than a dump reports
// ---------------------------------------------------------------------------

#[test]
fn large_root_has_more_buckets_than_reports() {
    assert!(Large::NUM_BUCKETS > MAX_REPORTABLE_BUCKETS);
    assert_eq!(Large::MAX_ALLOCATION, 8184);
}

#[test]
fn totals_count_buckets_past_the_report_limit() {
    let mut a = Large::new();
    let p = a.alloc(5000, "test");
    let q = a.alloc(Large::MAX_ALLOCATION, "test");

    let mut light = CollectingDumper::new();
    a.dump_stats("large", true, &mut light);
    assert_eq!(light.totals.unwrap().total_active_bytes, 5000 + Large::MAX_ALLOCATION);

    let mut full = CollectingDumper::new();
    a.dump_stats("large", false, &mut full);
    assert_eq!(full.totals, light.totals);
    let b = full.bucket(5000).unwrap();
    assert_eq!(b.active_bytes, 5000);
    assert!(b.allocated_page_size > SYSTEM_PAGE_SIZE);
    assert_eq!(full.bucket(Large::MAX_ALLOCATION).unwrap().active_bytes, Large::MAX_ALLOCATION);

    unsafe {
        a.free(p);
        a.free(q);
    }
}

#[test]
fn bucket_reports_are_capped_but_totals_are_not() {
    let mut a = Large::new();
    let ptrs: Vec<_> = (8..=Large::MAX_ALLOCATION)
        .step_by(8)
        .map(|size| a.alloc(size, "test"))
        .collect();
    let expected: usize = (8..=Large::MAX_ALLOCATION).step_by(8).sum();

    let mut d = CollectingDumper::new();
    a.dump_stats("large", false, &mut d);
    assert_eq!(d.buckets.len(), MAX_REPORTABLE_BUCKETS);
    let totals = d.totals.unwrap();
    assert_eq!(totals.total_active_bytes, expected);
    let reported: usize = d.buckets.iter().map(|b| b.active_bytes).sum();
    assert!(reported < totals.total_active_bytes);

    for p in ptrs {
        unsafe { a.free(p) };
    }
    let mut d = CollectingDumper::new();
    a.dump_stats("large", true, &mut d);
    assert_eq!(d.totals.unwrap().total_active_bytes, 0);
}

#[test]
fn multi_page_slots_realloc_and_decommit() {
    let mut a = Large::new();
    unsafe {
        let p = a.alloc(3000, "test");
        p.write_bytes(0x6B, 3000);
        let root = a.root();
        let q = root.realloc(p, 7000, "test");
        assert_ne!(p, q);
        assert_eq!(root.get_size(q), 7000);
        assert_eq!(*q.add(2999), 0x6B);
        root.free(q);
    }
    a.purge_memory(PurgeFlags::DECOMMIT_EMPTY_PAGES);
    let mut d = CollectingDumper::new();
    a.dump_stats("large", false, &mut d);
    assert_eq!(d.bucket(7000).unwrap().num_decommitted_pages, 1);
    assert_eq!(d.totals.unwrap().total_resident_bytes, 0);
}

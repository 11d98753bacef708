#![no_main]

use libfuzzer_sys::fuzz_target;
use partalloc::constants::ALLOCATION_GRANULARITY;
use partalloc::{AllocFlags, PartitionAllocatorGeneric};
use std::sync::OnceLock;

// Fuzz target that exercises size boundaries. Interprets input as a series
// of u32 sizes, allocates each, writes to the full usable extent, checks
// the reported sizes and frees.

fn allocator() -> &'static PartitionAllocatorGeneric {
    static ALLOCATOR: OnceLock<PartitionAllocatorGeneric> = OnceLock::new();
    ALLOCATOR.get_or_init(PartitionAllocatorGeneric::new)
}

fuzz_target!(|data: &[u8]| {
    let a = allocator();
    let root = a.root();
    let mut i = 0;
    while i + 4 <= data.len() {
        let raw_size = u32::from_le_bytes([data[i], data[i + 1], data[i + 2], data[i + 3]]);
        i += 4;

        // Cap size to keep memory use sane: max 4 MiB
        let size = (raw_size as usize) % (4 << 20);

        let ptr = a.alloc_flags(AllocFlags::RETURN_NULL, size, "fuzz");
        if ptr.is_null() {
            continue; // OOM is ok
        }

        assert_eq!(
            (ptr as usize) % ALLOCATION_GRANULARITY,
            0,
            "alloc({}) returned unaligned pointer {:p}",
            size,
            ptr
        );

        let usable = unsafe { root.get_size(ptr) };
        assert!(usable >= size, "get_size = {} < requested {}", usable, size);
        assert_eq!(usable, root.actual_size(size));

        // Write to full extent -- this should not crash
        unsafe { std::ptr::write_bytes(ptr, 0xBB, usable) };
        for j in [0, usable / 2, usable - 1] {
            assert_eq!(unsafe { *ptr.add(j) }, 0xBB);
        }

        unsafe { a.free(ptr) };
    }
});

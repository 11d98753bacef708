#![no_main]

use libfuzzer_sys::fuzz_target;
use partalloc::{CollectingDumper, PartitionAllocatorGeneric, PurgeFlags};
use std::sync::OnceLock;

/// Fuzz target that interprets a byte slice as a sequence of partition
/// operations.
///
/// Each operation is encoded as:
///   byte 0: opcode (0=alloc, 1=free, 2=realloc, 3=purge/dump)
///   byte 1-2: size (little-endian u16), scaled by byte 3's top bit
///   byte 3: slot index (which tracked pointer to operate on)
///
/// We track up to 64 live pointers. Every live allocation is filled with a
/// byte derived from its slot and checked before it is released.
const MAX_SLOTS: usize = 64;

fn allocator() -> &'static PartitionAllocatorGeneric {
    static ALLOCATOR: OnceLock<PartitionAllocatorGeneric> = OnceLock::new();
    ALLOCATOR.get_or_init(PartitionAllocatorGeneric::new)
}

fn check(ptr: *mut u8, size: usize, slot: usize) {
    for off in [0, size / 2, size.saturating_sub(1)] {
        if off < size {
            assert_eq!(unsafe { *ptr.add(off) }, slot as u8, "slot {} corrupted", slot);
        }
    }
}

fuzz_target!(|data: &[u8]| {
    let a = allocator();
    let mut slots: [*mut u8; MAX_SLOTS] = [std::ptr::null_mut(); MAX_SLOTS];
    let mut sizes: [usize; MAX_SLOTS] = [0; MAX_SLOTS];

    let mut i = 0;
    while i + 4 <= data.len() {
        let opcode = data[i] & 0x03;
        let mut size = u16::from_le_bytes([data[i + 1], data[i + 2]]) as usize;
        // Reach into the large buckets and direct maps now and then.
        if data[i + 3] & 0x80 != 0 {
            size <<= 5;
        }
        let slot = (data[i + 3] as usize) % MAX_SLOTS;
        i += 4;

        match opcode {
            0 => {
                if !slots[slot].is_null() {
                    check(slots[slot], sizes[slot], slot);
                    unsafe { a.free(slots[slot]) };
                }
                let ptr = a.alloc(size, "fuzz");
                assert!(!ptr.is_null());
                unsafe { std::ptr::write_bytes(ptr, slot as u8, size) };
                slots[slot] = ptr;
                sizes[slot] = size;
            }
            1 => {
                if !slots[slot].is_null() {
                    check(slots[slot], sizes[slot], slot);
                    unsafe { a.free(slots[slot]) };
                    slots[slot] = std::ptr::null_mut();
                    sizes[slot] = 0;
                }
            }
            2 => {
                let old = sizes[slot];
                let was_null = slots[slot].is_null();
                let ptr = unsafe { a.realloc(slots[slot], size, "fuzz") };
                if size == 0 && !was_null {
                    assert!(ptr.is_null());
                    slots[slot] = std::ptr::null_mut();
                    sizes[slot] = 0;
                } else {
                    assert!(!ptr.is_null());
                    check(ptr, old.min(size), slot);
                    unsafe { std::ptr::write_bytes(ptr, slot as u8, size) };
                    slots[slot] = ptr;
                    sizes[slot] = size;
                }
            }
            3 => {
                let flags = PurgeFlags::from_bits_truncate(data[i - 3] as u32);
                a.purge_memory(flags);
                let mut d = CollectingDumper::new();
                a.dump_stats("fuzz", data[i - 2] & 1 == 1, &mut d);
                let totals = d.totals.unwrap();
                assert!(totals.total_resident_bytes >= totals.total_active_bytes);
            }
            _ => unreachable!(),
        }
    }

    // Cleanup
    for (slot, ptr) in slots.iter_mut().enumerate() {
        if !ptr.is_null() {
            check(*ptr, sizes[slot], slot);
            unsafe { a.free(*ptr) };
            *ptr = std::ptr::null_mut();
        }
    }
});

//! Thread stress tests for the generic partition.
//!
//! Many threads share one root and hammer it with alloc/free/realloc,
//! checking that nothing is handed out twice and contents survive.

use partalloc::{CollectingDumper, PartitionAllocatorGeneric, PurgeFlags};
use std::ptr;
use std::sync::{Arc, Barrier};
use std::thread;

/// Wrapper to move allocated pointers between threads.
#[derive(Clone, Copy)]
struct SendPtr(*mut u8);
unsafe impl Send for SendPtr {}

// ---------------------------------------------------------------------------
// N threads doing rapid alloc/free cycles
// ---------------------------------------------------------------------------

fn stress_alloc_free_n_threads(num_threads: usize) {
    const ITERATIONS: usize = 5_000;

    let a = Arc::new(PartitionAllocatorGeneric::new());
    let barrier = Arc::new(Barrier::new(num_threads));

    let handles: Vec<_> = (0..num_threads)
        .map(|t| {
            let a = Arc::clone(&a);
            let barrier = Arc::clone(&barrier);
            thread::spawn(move || {
                barrier.wait();
                let size = 16 + t * 24;
                for i in 0..ITERATIONS {
                    let p = a.alloc(size, "stress");
                    assert!(!p.is_null());
                    let byte = (t as u8).wrapping_add(i as u8);
                    unsafe {
                        ptr::write_bytes(p, byte, size);
                        assert_eq!(*p.add(size - 1), byte);
                        a.free(p);
                    }
                }
            })
        })
        .collect();

    for h in handles {
        h.join().expect("thread panicked during alloc/free stress");
    }

    let mut d = CollectingDumper::new();
    a.dump_stats("stress", true, &mut d);
    assert_eq!(d.totals.unwrap().total_active_bytes, 0);
}

#[test]
fn stress_alloc_free_4_threads() {
    stress_alloc_free_n_threads(4);
}

#[test]
fn stress_alloc_free_8_threads() {
    stress_alloc_free_n_threads(8);
}

// ---------------------------------------------------------------------------
// Live allocations held concurrently never overlap
// ---------------------------------------------------------------------------

#[test]
fn concurrent_live_allocations_keep_their_contents() {
    const THREADS: usize = 8;
    const LIVE: usize = 500;

    let a = Arc::new(PartitionAllocatorGeneric::new());
    let barrier = Arc::new(Barrier::new(THREADS));

    let handles: Vec<_> = (0..THREADS)
        .map(|t| {
            let a = Arc::clone(&a);
            let barrier = Arc::clone(&barrier);
            thread::spawn(move || {
                barrier.wait();
                let tag = 0x10 + t as u8;
                let mut live = Vec::with_capacity(LIVE);
                for i in 0..LIVE {
                    let size = 8 + (i * 37) % 3000;
                    let p = a.alloc(size, "live");
                    unsafe { ptr::write_bytes(p, tag, size) };
                    live.push((SendPtr(p), size));
                }
                // Grow every other allocation.
                for (i, entry) in live.iter_mut().enumerate() {
                    if i % 2 == 0 {
                        let new_size = entry.1 * 2 + 1;
                        let q = unsafe { a.realloc(entry.0 .0, new_size, "live") };
                        unsafe { ptr::write_bytes(q.add(entry.1), tag, new_size - entry.1) };
                        *entry = (SendPtr(q), new_size);
                    }
                }
                for (p, size) in &live {
                    for off in [0, size / 2, size - 1] {
                        assert_eq!(unsafe { *p.0.add(off) }, tag, "corrupted by another thread");
                    }
                }
                for (p, _) in live {
                    unsafe { a.free(p.0) };
                }
            })
        })
        .collect();

    for h in handles {
        h.join().expect("thread panicked");
    }
}

// ---------------------------------------------------------------------------
// Cross-thread free: one thread allocates, another frees
// ---------------------------------------------------------------------------

#[test]
fn cross_thread_free() {
    const COUNT: usize = 2_000;

    let a = Arc::new(PartitionAllocatorGeneric::new());
    let ptrs: Vec<SendPtr> = (0..COUNT).map(|i| SendPtr(a.alloc(32 + i % 200, "xthread"))).collect();

    let freer = {
        let a = Arc::clone(&a);
        thread::spawn(move || {
            for p in ptrs {
                unsafe { a.free(p.0) };
            }
        })
    };
    // Purge and dump concurrently with the frees.
    for _ in 0..20 {
        a.purge_memory(PurgeFlags::DECOMMIT_EMPTY_PAGES | PurgeFlags::DISCARD_UNUSED_SYSTEM_PAGES);
        let mut d = CollectingDumper::new();
        a.dump_stats("xthread", false, &mut d);
    }
    freer.join().expect("freeing thread panicked");

    let mut d = CollectingDumper::new();
    a.dump_stats("xthread", true, &mut d);
    assert_eq!(d.totals.unwrap().total_active_bytes, 0);
}

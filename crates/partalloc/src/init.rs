//! Process-wide state: the sentinel bucket and span shared by every root,
//! and the one-time setup that runs when the first root is initialized.
//! Once set up, this state lives for the rest of the process.

use crate::bucket::Bucket;
use crate::config;
use crate::error;
use crate::page::SlotSpan;
use crate::sync::SpinLock;
use core::cell::UnsafeCell;
use core::sync::atomic::{AtomicBool, Ordering};

struct Holder<T>(UnsafeCell<T>);
unsafe impl<T> Sync for Holder<T> {}

/// Stands in for "no active spans" at the head of every bucket's active
/// list. It has no free list, so allocation through it always falls to the
/// slow path.
static SENTINEL_SPAN: Holder<SlotSpan> = Holder(UnsafeCell::new(SlotSpan::zeroed()));

/// The bucket size lookups resolve to when a request is too large for any
/// real bucket. It carves no spans, which routes the request to a direct
/// mapping.
static SENTINEL_BUCKET: Holder<Bucket> = Holder(UnsafeCell::new(Bucket::zeroed()));

static INIT_LOCK: SpinLock = SpinLock::new();
static INITIALIZED: AtomicBool = AtomicBool::new(false);

#[inline(always)]
pub fn sentinel_span() -> *mut SlotSpan {
    SENTINEL_SPAN.0.get()
}

#[inline(always)]
pub fn sentinel_bucket() -> *mut Bucket {
    SENTINEL_BUCKET.0.get()
}

/// Run the one-time setup if no root has done it yet.
pub(crate) fn ensure_global_init() {
    if INITIALIZED.load(Ordering::Acquire) {
        return;
    }
    let _guard = INIT_LOCK.lock();
    if INITIALIZED.load(Ordering::Relaxed) {
        return;
    }
    unsafe {
        config::read_config();
        // The sentinel bucket's list must look like every other empty list.
        (*sentinel_bucket()).set_active_head(sentinel_span());
    }
    if !crate::util::system_page_size_matches_os() {
        error::abort_with_message("partalloc: OS page size does not divide the system page size\n");
    }
    log::debug!("partalloc: global state initialized");
    INITIALIZED.store(true, Ordering::Release);
}

/// Register the handler run when an allocation fails and the caller did
/// not ask for null. The process aborts if the handler returns.
pub fn partition_alloc_global_init(oom_handler: fn()) {
    error::set_oom_handler(oom_handler);
}

use core::sync::atomic::{AtomicPtr, Ordering};
use thiserror::Error;

/// Why an allocation could not be satisfied.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum AllocError {
    /// The OS refused to hand out more address space or pages.
    #[error("out of memory while allocating {size} bytes")]
    OutOfMemory { size: usize },
    /// The request is larger than anything the partition can map.
    #[error("allocation of {size} bytes exceeds the largest supported size")]
    ExcessiveSize { size: usize },
}

impl AllocError {
    /// The size of the request that failed.
    pub fn size(&self) -> usize {
        match *self {
            AllocError::OutOfMemory { size } | AllocError::ExcessiveSize { size } => size,
        }
    }
}

static OOM_HANDLER: AtomicPtr<()> = AtomicPtr::new(core::ptr::null_mut());

pub(crate) fn set_oom_handler(handler: fn()) {
    OOM_HANDLER.store(handler as *mut (), Ordering::Release);
}

fn oom_handler() -> Option<fn()> {
    let raw = OOM_HANDLER.load(Ordering::Acquire);
    if raw.is_null() {
        None
    } else {
        // SAFETY: only ever stored from a `fn()` in `set_oom_handler`.
        Some(unsafe { core::mem::transmute::<*mut (), fn()>(raw) })
    }
}

/// Abort with a diagnostic message to stderr.
/// Used for failures and misuse the allocator cannot recover from.
#[cold]
#[inline(never)]
pub fn abort_with_message(msg: &str) -> ! {
    unsafe {
        // Write directly to stderr fd (2) -- no allocation needed
        libc::write(2, msg.as_ptr() as *const libc::c_void, msg.len());
        libc::abort();
    }
}

/// Terminal path for an allocation failure the caller did not opt out of.
/// Runs the registered OOM handler first; the process aborts if it returns.
#[cold]
#[inline(never)]
pub(crate) fn handle_alloc_error(err: AllocError) -> ! {
    match err {
        AllocError::OutOfMemory { size } => {
            log::warn!("partalloc: out of memory allocating {} bytes", size);
            if let Some(handler) = oom_handler() {
                handler();
            }
            abort_with_message("partalloc: out of memory\n")
        }
        AllocError::ExcessiveSize { size } => {
            log::warn!("partalloc: excessive allocation size {}", size);
            abort_with_message("partalloc: excessive allocation size\n")
        }
    }
}

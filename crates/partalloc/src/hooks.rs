//! Process-wide allocation observers.
//!
//! Hooks are called synchronously on the allocating thread, outside the
//! partition lock. Only one hook of each kind can be installed.

use core::ptr;
use core::sync::atomic::{AtomicPtr, Ordering};

/// Called with the returned address, the requested size and the caller's
/// type name after every successful allocation.
pub type AllocationHook = fn(address: *mut u8, size: usize, type_name: &str);
/// Called with the address before every free.
pub type FreeHook = fn(address: *mut u8);

static ALLOCATION_HOOK: AtomicPtr<()> = AtomicPtr::new(ptr::null_mut());
static FREE_HOOK: AtomicPtr<()> = AtomicPtr::new(ptr::null_mut());

/// Install or clear the allocation hook. Chaining is not supported:
/// installing over an existing hook is a programming error.
pub fn set_allocation_hook(hook: Option<AllocationHook>) {
    let raw = hook.map_or(ptr::null_mut(), |h| h as *mut ());
    let prev = ALLOCATION_HOOK.swap(raw, Ordering::AcqRel);
    debug_assert!(
        raw.is_null() || prev.is_null(),
        "allocation hook already installed"
    );
}

/// Install or clear the free hook.
pub fn set_free_hook(hook: Option<FreeHook>) {
    let raw = hook.map_or(ptr::null_mut(), |h| h as *mut ());
    let prev = FREE_HOOK.swap(raw, Ordering::AcqRel);
    debug_assert!(raw.is_null() || prev.is_null(), "free hook already installed");
}

#[inline]
fn allocation_hook() -> Option<AllocationHook> {
    let raw = ALLOCATION_HOOK.load(Ordering::Acquire);
    if raw.is_null() {
        None
    } else {
        // SAFETY: only ever stored from an `AllocationHook`.
        Some(unsafe { core::mem::transmute::<*mut (), AllocationHook>(raw) })
    }
}

#[inline]
fn free_hook() -> Option<FreeHook> {
    let raw = FREE_HOOK.load(Ordering::Acquire);
    if raw.is_null() {
        None
    } else {
        // SAFETY: only ever stored from a `FreeHook`.
        Some(unsafe { core::mem::transmute::<*mut (), FreeHook>(raw) })
    }
}

#[inline]
pub(crate) fn allocation_hook_if_enabled(address: *mut u8, size: usize, type_name: &str) {
    if let Some(hook) = allocation_hook() {
        hook(address, size, type_name);
    }
}

#[inline]
pub(crate) fn free_hook_if_enabled(address: *mut u8) {
    if let Some(hook) = free_hook() {
        hook(address);
    }
}

/// A realloc is reported as a free of the old address followed by an
/// allocation of the new one, and only when both hooks are installed.
#[inline]
pub(crate) fn realloc_hook_if_enabled(
    old_address: *mut u8,
    new_address: *mut u8,
    size: usize,
    type_name: &str,
) {
    if let (Some(alloc), Some(free)) = (allocation_hook(), free_hook()) {
        free(old_address);
        alloc(new_address, size, type_name);
    }
}

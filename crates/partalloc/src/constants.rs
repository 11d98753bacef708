//! Page-size geometry for the partition allocator.
//!
//! Every address-to-metadata mapping in the crate is derived from these
//! values, so the relations between them are enforced at compile time.
//!
//! Layout of one super page (4 KiB system pages, 16 KiB partition pages):
//!
//! ```text
//! | guard | metadata | guard guard | partition page 1 | ... | partition page 126 | guard partition page |
//! |<------ partition page 0 ------>|
//! ```
//!
//! The metadata system page holds one 32-byte record per partition page.
//! Record 0 is the super-page extent entry; record `i` describes partition
//! page `i`.

use core::mem::size_of;

/// Smallest unit the fixed-bucket root rounds requests to.
pub const ALLOCATION_GRANULARITY: usize = size_of::<usize>();
pub const ALLOCATION_GRANULARITY_MASK: usize = ALLOCATION_GRANULARITY - 1;
pub const BUCKET_SHIFT: usize = if ALLOCATION_GRANULARITY == 8 { 3 } else { 2 };

// Apple silicon only maps 16 KiB pages.
#[cfg(all(target_os = "macos", target_arch = "aarch64"))]
pub const SYSTEM_PAGE_SHIFT: usize = 14;
#[cfg(not(all(target_os = "macos", target_arch = "aarch64")))]
pub const SYSTEM_PAGE_SHIFT: usize = 12;

pub const SYSTEM_PAGE_SIZE: usize = 1 << SYSTEM_PAGE_SHIFT;
pub const SYSTEM_PAGE_OFFSET_MASK: usize = SYSTEM_PAGE_SIZE - 1;
pub const SYSTEM_PAGE_BASE_MASK: usize = !SYSTEM_PAGE_OFFSET_MASK;

/// Granularity of address-space reservations. Equal to the system page on
/// every supported (unix) target.
pub const PAGE_ALLOCATION_GRANULARITY_SHIFT: usize = SYSTEM_PAGE_SHIFT;
pub const PAGE_ALLOCATION_GRANULARITY: usize = 1 << PAGE_ALLOCATION_GRANULARITY_SHIFT;
pub const PAGE_ALLOCATION_GRANULARITY_OFFSET_MASK: usize = PAGE_ALLOCATION_GRANULARITY - 1;
pub const PAGE_ALLOCATION_GRANULARITY_BASE_MASK: usize = !PAGE_ALLOCATION_GRANULARITY_OFFSET_MASK;

/// A partition page is the metadata unit: four system pages.
pub const PARTITION_PAGE_SHIFT: usize = SYSTEM_PAGE_SHIFT + 2;
pub const PARTITION_PAGE_SIZE: usize = 1 << PARTITION_PAGE_SHIFT;
pub const PARTITION_PAGE_OFFSET_MASK: usize = PARTITION_PAGE_SIZE - 1;
pub const PARTITION_PAGE_BASE_MASK: usize = !PARTITION_PAGE_OFFSET_MASK;
pub const MAX_PARTITION_PAGES_PER_SLOT_SPAN: usize = 4;

pub const NUM_SYSTEM_PAGES_PER_PARTITION_PAGE: usize = PARTITION_PAGE_SIZE / SYSTEM_PAGE_SIZE;
pub const MAX_SYSTEM_PAGES_PER_SLOT_SPAN: usize =
    NUM_SYSTEM_PAGES_PER_PARTITION_PAGE * MAX_PARTITION_PAGES_PER_SLOT_SPAN;

/// Largest slot that still shares a span with other slots. Anything above
/// occupies a single-slot span and records its raw size.
pub const MAX_MULTI_SLOT_SIZE: usize = MAX_SYSTEM_PAGES_PER_SLOT_SPAN * SYSTEM_PAGE_SIZE;

pub const SUPER_PAGE_SHIFT: usize = 21;
pub const SUPER_PAGE_SIZE: usize = 1 << SUPER_PAGE_SHIFT;
pub const SUPER_PAGE_OFFSET_MASK: usize = SUPER_PAGE_SIZE - 1;
pub const SUPER_PAGE_BASE_MASK: usize = !SUPER_PAGE_OFFSET_MASK;
pub const NUM_PARTITION_PAGES_PER_SUPER_PAGE: usize = SUPER_PAGE_SIZE / PARTITION_PAGE_SIZE;

pub const PAGE_METADATA_SHIFT: usize = 5;
pub const PAGE_METADATA_SIZE: usize = 1 << PAGE_METADATA_SHIFT;

// Generic size classes: each power-of-two "order" is split into
// GENERIC_NUM_BUCKETS_PER_ORDER evenly spaced buckets.
pub const GENERIC_MIN_BUCKETED_ORDER: usize = 4; // 8 bytes.
pub const GENERIC_MAX_BUCKETED_ORDER: usize = 20; // Largest bucketed order is 1 << (20 - 1).
pub const GENERIC_NUM_BUCKETED_ORDERS: usize =
    (GENERIC_MAX_BUCKETED_ORDER - GENERIC_MIN_BUCKETED_ORDER) + 1;
pub const GENERIC_NUM_BUCKETS_PER_ORDER_BITS: usize = 3;
pub const GENERIC_NUM_BUCKETS_PER_ORDER: usize = 1 << GENERIC_NUM_BUCKETS_PER_ORDER_BITS;
pub const GENERIC_NUM_BUCKETS: usize = GENERIC_NUM_BUCKETED_ORDERS * GENERIC_NUM_BUCKETS_PER_ORDER;
pub const GENERIC_SMALLEST_BUCKET: usize = 1 << (GENERIC_MIN_BUCKETED_ORDER - 1);
pub const GENERIC_MAX_BUCKET_SPACING: usize =
    1 << ((GENERIC_MAX_BUCKETED_ORDER - 1) - GENERIC_NUM_BUCKETS_PER_ORDER_BITS);
pub const GENERIC_MAX_BUCKETED: usize = (1 << (GENERIC_MAX_BUCKETED_ORDER - 1))
    + ((GENERIC_NUM_BUCKETS_PER_ORDER - 1) * GENERIC_MAX_BUCKET_SPACING);
/// Direct mappings shrunk below this size are moved into a bucket instead.
pub const GENERIC_MIN_DIRECT_MAPPED_DOWNSIZE: usize = GENERIC_MAX_BUCKETED + 1;
pub const GENERIC_MAX_DIRECT_MAPPED: usize = (1 << 31) + PAGE_ALLOCATION_GRANULARITY;

pub const BITS_PER_SIZE_T: usize = usize::BITS as usize;
/// One entry per (order, order index) pair plus a trailing overflow entry.
pub const GENERIC_BUCKET_LOOKUP_LEN: usize =
    (BITS_PER_SIZE_T + 1) * GENERIC_NUM_BUCKETS_PER_ORDER + 1;

/// Number of empty slot spans a root keeps committed before decommitting.
pub const MAX_FREEABLE_SPANS: usize = 16;

/// Upper bound on slots in a span whose slot size is at least a system page.
/// Sizes the purge bitmap.
pub const MAX_PURGEABLE_SLOT_COUNT: usize =
    (PARTITION_PAGE_SIZE * MAX_PARTITION_PAGES_PER_SLOT_SPAN) / SYSTEM_PAGE_SIZE;

pub const MAX_REPORTABLE_DIRECT_MAPS: usize = 4096;
pub const MAX_REPORTABLE_BUCKETS: usize = 4096 / size_of::<usize>();

/// Fill byte for fresh allocations when zapping is enabled.
pub const UNINITIALIZED_BYTE: u8 = 0xAB;
/// Fill byte for freed slots when zapping is enabled.
pub const FREED_BYTE: u8 = 0xCD;

// Two partition pages are used as guard / metadata pages.
const _: () = assert!(PARTITION_PAGE_SIZE * 4 <= SUPER_PAGE_SIZE);
const _: () = assert!(SUPER_PAGE_SIZE % PARTITION_PAGE_SIZE == 0);
// Four system pages leave room for a guarded metadata page in the middle.
const _: () = assert!(SYSTEM_PAGE_SIZE * 4 <= PARTITION_PAGE_SIZE);
const _: () = assert!(PARTITION_PAGE_SIZE % SYSTEM_PAGE_SIZE == 0);
const _: () = assert!(PAGE_METADATA_SIZE * NUM_PARTITION_PAGES_PER_SUPER_PAGE <= SYSTEM_PAGE_SIZE);
const _: () = assert!(GENERIC_MAX_DIRECT_MAPPED <= (1 << 31) + PAGE_ALLOCATION_GRANULARITY);
const _: () = assert!(GENERIC_SMALLEST_BUCKET == 8);
const _: () = assert!(GENERIC_MAX_BUCKETED == 983_040);
const _: () = assert!(MAX_SYSTEM_PAGES_PER_SLOT_SPAN < (1 << 8));
const _: () = assert!(GENERIC_NUM_BUCKETS < u16::MAX as usize);
const _: () = assert!(MAX_FREEABLE_SPANS <= i16::MAX as usize);

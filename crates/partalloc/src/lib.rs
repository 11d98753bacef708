extern crate libc;

pub mod allocator;
pub mod bucket;
pub mod config;
pub mod constants;
pub mod direct_map;
pub mod error;
pub mod hooks;
pub mod init;
pub mod page;
pub mod platform;
pub mod root;
pub mod stats;
pub mod super_page;
pub mod sync;
pub mod util;

pub use allocator::{PartitionAllocatorGeneric, SizeSpecificPartitionAllocator};
pub use error::AllocError;
pub use hooks::{set_allocation_hook, set_free_hook, AllocationHook, FreeHook};
pub use init::partition_alloc_global_init;
pub use root::{AllocFlags, PartitionRoot, PartitionRootGeneric, PurgeFlags};
pub use stats::{BucketMemoryStats, CollectingDumper, PartitionMemoryStats, StatsDumper};

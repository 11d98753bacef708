//! Memory usage reports.

use crate::bucket::Bucket;
use crate::page::purge::purge_span;
use crate::page::SlotSpan;
use crate::util::round_up_to_system_page;

/// Totals for a whole partition.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PartitionMemoryStats {
    /// Address space reserved from the OS (super pages plus direct maps).
    pub total_mmapped_bytes: usize,
    /// Bytes currently committed.
    pub total_committed_bytes: usize,
    /// Bytes provisioned for slots.
    pub total_resident_bytes: usize,
    /// Bytes in live allocations.
    pub total_active_bytes: usize,
    /// Bytes held by empty spans that a purge would decommit.
    pub total_decommittable_bytes: usize,
    /// Bytes a discarding purge would hand back.
    pub total_discardable_bytes: usize,
}

/// Figures for one bucket, or for one direct mapping.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BucketMemoryStats {
    /// Direct mappings are reported one per mapping, so slot sizes repeat.
    pub is_direct_map: bool,
    pub bucket_slot_size: usize,
    /// Bytes in one span of this bucket.
    pub allocated_page_size: usize,
    pub active_bytes: usize,
    pub resident_bytes: usize,
    pub decommittable_bytes: usize,
    pub discardable_bytes: usize,
    pub num_full_pages: usize,
    pub num_active_pages: usize,
    pub num_empty_pages: usize,
    pub num_decommitted_pages: usize,
}

impl BucketMemoryStats {
    /// Report for a single direct mapping of `size` bytes.
    pub fn direct_map(size: usize) -> Self {
        BucketMemoryStats {
            is_direct_map: true,
            bucket_slot_size: size,
            allocated_page_size: size,
            active_bytes: size,
            resident_bytes: size,
            num_full_pages: 1,
            ..Default::default()
        }
    }
}

/// Receives the results of `dump_stats`. Bucket reports arrive first, then
/// the totals. Both are delivered after the partition lock is released, so
/// implementations may allocate from the partition being dumped.
pub trait StatsDumper {
    fn dump_totals(&mut self, partition_name: &str, stats: &PartitionMemoryStats);
    fn dump_bucket_stats(&mut self, partition_name: &str, stats: &BucketMemoryStats);
}

impl PartitionMemoryStats {
    pub(crate) fn add_bucket(&mut self, bucket: &BucketMemoryStats) {
        self.total_resident_bytes += bucket.resident_bytes;
        self.total_active_bytes += bucket.active_bytes;
        self.total_decommittable_bytes += bucket.decommittable_bytes;
        self.total_discardable_bytes += bucket.discardable_bytes;
    }
}

unsafe fn dump_span_stats(out: &mut BucketMemoryStats, span: *mut SlotSpan, bucket_num_slots: usize) {
    let s = &*span;
    if s.is_decommitted() {
        out.num_decommitted_pages += 1;
        return;
    }

    out.discardable_bytes += purge_span(span, false);

    let raw_size = s.raw_size();
    if raw_size != 0 {
        out.active_bytes += raw_size;
    } else {
        out.active_bytes += s.num_allocated_slots as usize * out.bucket_slot_size;
    }

    let resident =
        round_up_to_system_page((bucket_num_slots - s.num_unprovisioned_slots as usize) * out.bucket_slot_size);
    out.resident_bytes += resident;
    if s.is_empty() {
        out.decommittable_bytes += resident;
        out.num_empty_pages += 1;
    } else if s.is_full() {
        out.num_full_pages += 1;
    } else {
        debug_assert!(s.is_active());
        out.num_active_pages += 1;
    }
}

/// Collect a bucket's figures. Buckets that never held a span report
/// nothing.
///
/// # Safety
/// `bucket` must be a non-direct-mapped bucket of a root whose lock the
/// caller holds.
pub(crate) unsafe fn dump_bucket_stats(bucket: &Bucket) -> Option<BucketMemoryStats> {
    debug_assert!(!bucket.is_direct_mapped());
    if !bucket.has_active_spans()
        && !bucket.has_empty_spans()
        && !bucket.has_decommitted_spans()
        && bucket.num_full_spans() == 0
    {
        return None;
    }

    let bucket_num_slots = bucket.slots_per_span();
    let mut out = BucketMemoryStats {
        is_direct_map: false,
        num_full_pages: bucket.num_full_spans(),
        bucket_slot_size: bucket.slot_size(),
        allocated_page_size: bucket.bytes_per_span(),
        ..Default::default()
    };
    out.active_bytes = bucket.num_full_spans() * out.bucket_slot_size * bucket_num_slots;
    out.resident_bytes = bucket.num_full_spans() * out.allocated_page_size;

    bucket.for_each_empty_span(|span| {
        debug_assert!((*span).is_empty() || (*span).is_decommitted());
        dump_span_stats(&mut out, span, bucket_num_slots);
    });
    bucket.for_each_decommitted_span(|span| {
        debug_assert!((*span).is_decommitted());
        dump_span_stats(&mut out, span, bucket_num_slots);
    });
    bucket.for_each_active_span(|span| {
        dump_span_stats(&mut out, span, bucket_num_slots);
    });
    Some(out)
}

/// A [`StatsDumper`] that keeps everything it is given. Handy for tests
/// and for callers that post-process reports.
#[derive(Debug, Default, Clone)]
pub struct CollectingDumper {
    pub totals: Option<PartitionMemoryStats>,
    pub buckets: Vec<BucketMemoryStats>,
}

impl CollectingDumper {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reports for ordinary buckets with the given slot size.
    pub fn bucket(&self, slot_size: usize) -> Option<&BucketMemoryStats> {
        self.buckets
            .iter()
            .find(|b| !b.is_direct_map && b.bucket_slot_size == slot_size)
    }

    pub fn direct_maps(&self) -> impl Iterator<Item = &BucketMemoryStats> {
        self.buckets.iter().filter(|b| b.is_direct_map)
    }
}

impl StatsDumper for CollectingDumper {
    fn dump_totals(&mut self, _partition_name: &str, stats: &PartitionMemoryStats) {
        self.totals = Some(*stats);
    }

    fn dump_bucket_stats(&mut self, _partition_name: &str, stats: &BucketMemoryStats) {
        self.buckets.push(*stats);
    }
}

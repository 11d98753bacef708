use crate::constants::MAX_PURGEABLE_SLOT_COUNT;

const NUM_WORDS: usize = MAX_PURGEABLE_SLOT_COUNT.div_ceil(64);

/// Per-slot usage map for one slot span, built while purging.
/// Each bit represents one provisioned slot: 1 = in use, 0 = free.
pub struct SlotUsage {
    words: [u64; NUM_WORDS],
    num_slots: usize,
}

impl SlotUsage {
    /// A map of `num_slots` slots, all marked in use.
    pub fn all_used(num_slots: usize) -> Self {
        debug_assert!(num_slots <= MAX_PURGEABLE_SLOT_COUNT);
        let mut words = [0u64; NUM_WORDS];
        // Bits past the last slot stay clear
        for (i, w) in words.iter_mut().enumerate() {
            let start = i * 64;
            if start < num_slots {
                let n = (num_slots - start).min(64);
                *w = if n == 64 { u64::MAX } else { (1u64 << n) - 1 };
            }
        }
        SlotUsage { words, num_slots }
    }

    #[inline]
    pub fn num_slots(&self) -> usize {
        self.num_slots
    }

    #[inline]
    pub fn mark_free(&mut self, slot: usize) {
        debug_assert!(slot < self.num_slots);
        self.words[slot / 64] &= !(1u64 << (slot % 64));
    }

    #[inline]
    pub fn is_used(&self, slot: usize) -> bool {
        debug_assert!(slot < self.num_slots);
        self.words[slot / 64] & (1u64 << (slot % 64)) != 0
    }

    /// Drop free slots from the end of the map. Returns how many were
    /// dropped. At least one slot is always in use when purging, so the map
    /// never shrinks to zero.
    pub fn truncate_trailing_free(&mut self) -> usize {
        let mut truncated = 0;
        while self.num_slots > 0 && !self.is_used(self.num_slots - 1) {
            self.num_slots -= 1;
            truncated += 1;
        }
        debug_assert!(self.num_slots > 0);
        truncated
    }

    /// Indices of free slots, in ascending order.
    pub fn free_slots(&self) -> impl Iterator<Item = usize> + '_ {
        (0..self.num_slots).filter(move |&i| !self.is_used(i))
    }
}

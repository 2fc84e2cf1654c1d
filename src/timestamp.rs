//! Monotonic global timestamp source (spec §2, §3). Produces transaction
//! start/commit timestamps, page write timestamps, and checkpoint marks.
//! Grounded on the teacher's `TRANSACTION_ID: AtomicU32` allocator in
//! `src/transaction/tx.rs`, widened to `u64` and given a name that matches
//! its several roles here.

use std::sync::atomic::{AtomicU64, Ordering};

pub type Timestamp = u64;

/// `0` is reserved to mean "never written"/"no snapshot yet".
pub const NEVER: Timestamp = 0;

pub struct TimestampAllocator {
    next: AtomicU64,
}

impl Default for TimestampAllocator {
    fn default() -> Self {
        Self::new()
    }
}

impl TimestampAllocator {
    pub fn new() -> Self {
        TimestampAllocator {
            next: AtomicU64::new(1),
        }
    }

    /// Allocate the next timestamp. Used for transaction start timestamps,
    /// commit timestamps, page write timestamps, and checkpoint marks —
    /// every caller draws from the same sequence so `t1 < t2` always means
    /// "t1 happened no later than t2" across all of those uses.
    pub fn next_timestamp(&self) -> Timestamp {
        self.next.fetch_add(1, Ordering::AcqRel)
    }

    /// Current high-water mark without allocating.
    pub fn current(&self) -> Timestamp {
        self.next.load(Ordering::Acquire)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn timestamps_are_monotonic_and_unique() {
        let alloc = TimestampAllocator::new();
        let mut prev = alloc.next_timestamp();
        for _ in 0..1000 {
            let ts = alloc.next_timestamp();
            assert!(ts > prev);
            prev = ts;
        }
    }
}

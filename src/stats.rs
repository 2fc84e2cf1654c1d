//! Management/observation counters (spec §6.3). A thin, process-wide
//! resettable snapshot over the `BufferPool`'s and `JournalManager`'s own
//! atomics, plus per-session rollback counting.

use std::sync::atomic::{AtomicU64, Ordering};

use crate::buffer_pool::BufferPool;
use crate::journal::JournalManager;

#[derive(Debug, Clone, Default)]
pub struct PoolStats {
    pub gets: u64,
    pub hits: u64,
    pub hit_ratio: f64,
    pub valid_pages: u64,
    pub dirty_pages: u64,
    pub reader_claimed_pages: u64,
    pub writer_claimed_pages: u64,
    pub permanent_pages: u64,
    pub journal_bytes_written: u64,
    pub pending_checkpoint_proposals: u64,
}

/// Per-session rollback counter (spec §6.3 "rollbacks since last commit
/// per session").
#[derive(Default)]
pub struct SessionStats {
    rollbacks_since_last_commit: AtomicU64,
}

impl SessionStats {
    pub fn new() -> Self {
        SessionStats::default()
    }

    pub fn record_rollback(&self) {
        self.rollbacks_since_last_commit.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_commit(&self) {
        self.rollbacks_since_last_commit.store(0, Ordering::Relaxed);
    }

    pub fn rollbacks_since_last_commit(&self) -> u64 {
        self.rollbacks_since_last_commit.load(Ordering::Relaxed)
    }
}

/// Snapshot a pool's counters (spec §6.3). Buffer-level counters
/// (valid/dirty/reader-claimed/writer-claimed/permanent) require walking
/// every buffer, which this does directly rather than maintaining
/// separate running counters, since it is a diagnostic/management-facing
/// operation invoked far less often than `get()`.
pub fn snapshot(pool: &BufferPool, journal: &JournalManager) -> PoolStats {
    let mut valid = 0;
    let mut dirty = 0;
    let mut reader_claimed = 0;
    let mut writer_claimed = 0;
    let mut permanent = 0;

    for i in 0..pool.buffer_count() {
        let buf = pool.buffer_at(i);
        if buf.is_valid() {
            valid += 1;
        }
        if buf.is_dirty() {
            dirty += 1;
        }
        if buf.is_fixed() {
            permanent += 1;
        }
        if buf.resource.is_writer_held() {
            writer_claimed += 1;
        } else if buf.resource.claim_count() > 0 {
            reader_claimed += 1;
        }
    }

    PoolStats {
        gets: pool.get_count(),
        hits: pool.hit_count(),
        hit_ratio: pool.hit_ratio(),
        valid_pages: valid,
        dirty_pages: dirty,
        reader_claimed_pages: reader_claimed,
        writer_claimed_pages: writer_claimed,
        permanent_pages: permanent,
        journal_bytes_written: journal.bytes_written(),
        pending_checkpoint_proposals: pool.pending_checkpoint_count() as u64,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::timestamp::TimestampAllocator;
    use std::sync::Arc;
    use tempfile::tempdir;

    #[test]
    fn session_stats_reset_on_commit() {
        let s = SessionStats::new();
        s.record_rollback();
        s.record_rollback();
        assert_eq!(s.rollbacks_since_last_commit(), 2);
        s.record_commit();
        assert_eq!(s.rollbacks_since_last_commit(), 0);
    }

    #[test]
    fn snapshot_reports_zero_on_fresh_pool() {
        let dir = tempdir().unwrap();
        let journal = JournalManager::open(dir.path(), "rpj", 1 << 20).unwrap();
        let ts = Arc::new(TimestampAllocator::new());
        let pool = BufferPool::new(8, 4096, journal.clone(), ts);
        let stats = snapshot(&pool, &journal);
        assert_eq!(stats.gets, 0);
        assert_eq!(stats.valid_pages, 0);
        pool.close();
    }
}

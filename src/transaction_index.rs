//! Tracks in-flight and recently committed transactions; answers "commit
//! status of version v at read-ts t" and "does version v write-write
//! depend on active txn x" (spec §3, §4.6). Grounded on the teacher's
//! `ConcurrentStatus` (`src/concurrent_status.rs`) for the "central map of
//! transaction id -> status, consulted by everyone" shape, generalized
//! from lock ownership to MVCC commit bookkeeping.

use std::collections::{HashMap, HashSet};
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

use crate::timestamp::Timestamp;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommitState {
    Active,
    Committed(Timestamp),
    Aborted,
}

/// Outcome of a write-write dependency check between a transaction being
/// staged and the transaction that produced an existing version (spec
/// §4.6 "Add contract").
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WwOutcome {
    NoDependency,
    Aborted,
    TimedOut,
    Conflict,
}

struct Inner {
    statuses: HashMap<Timestamp, CommitState>,
    active_snapshots: HashSet<Timestamp>,
}

/// Central registry of transaction commit state, consulted by
/// `TimelyResource` and by `Transaction::commit`'s validation step.
pub struct TransactionIndex {
    inner: Mutex<Inner>,
    cv: Condvar,
}

impl Default for TransactionIndex {
    fn default() -> Self {
        Self::new()
    }
}

impl TransactionIndex {
    pub fn new() -> Self {
        TransactionIndex {
            inner: Mutex::new(Inner {
                statuses: HashMap::new(),
                active_snapshots: HashSet::new(),
            }),
            cv: Condvar::new(),
        }
    }

    /// Register a newly begun transaction's start timestamp as active and
    /// as a live read snapshot (spec §4.5 `begin()`).
    pub fn register_active(&self, start_ts: Timestamp) {
        let mut inner = self.inner.lock();
        inner.statuses.insert(start_ts, CommitState::Active);
        inner.active_snapshots.insert(start_ts);
    }

    pub fn mark_committed(&self, start_ts: Timestamp, commit_ts: Timestamp) {
        let mut inner = self.inner.lock();
        inner.statuses.insert(start_ts, CommitState::Committed(commit_ts));
        inner.active_snapshots.remove(&start_ts);
        self.cv.notify_all();
    }

    pub fn mark_aborted(&self, start_ts: Timestamp) {
        let mut inner = self.inner.lock();
        inner.statuses.insert(start_ts, CommitState::Aborted);
        inner.active_snapshots.remove(&start_ts);
        self.cv.notify_all();
    }

    /// Transactions end their read snapshot at `end()` regardless of
    /// whether they ever wrote anything (spec §4.5 `end()`).
    pub fn end_snapshot(&self, start_ts: Timestamp) {
        self.inner.lock().active_snapshots.remove(&start_ts);
    }

    pub fn commit_state(&self, start_ts: Timestamp) -> CommitState {
        self.inner
            .lock()
            .statuses
            .get(&start_ts)
            .copied()
            .unwrap_or(CommitState::Aborted)
    }

    /// Is `version_start_ts` visible to a read snapshot at `read_ts`?
    /// (spec §4.6 "Get contract": "commit-status ≥ 0 and not
    /// `UNCOMMITTED` relative to `(ts, step)`" — `step` is reserved for
    /// intra-transaction nested visibility, not modeled here since nested
    /// transactions share their outer timestamp per §4.5 `begin()`.)
    pub fn is_visible(&self, version_start_ts: Timestamp, read_ts: Timestamp) -> bool {
        if version_start_ts == read_ts {
            return true; // reading your own write
        }
        match self.commit_state(version_start_ts) {
            CommitState::Committed(commit_ts) => commit_ts <= read_ts,
            CommitState::Active | CommitState::Aborted => false,
        }
    }

    /// The oldest still-active read snapshot, or `None` if there are no
    /// active transactions (used by `TimelyResource::prune`).
    pub fn oldest_active_snapshot(&self) -> Option<Timestamp> {
        self.inner.lock().active_snapshots.iter().min().copied()
    }

    /// Write-write dependency check (spec §4.6 "Add contract"): does the
    /// transaction starting at `new_start_ts` depend on the transaction
    /// that produced the version starting at `other_start_ts`? A version
    /// that committed before `new_start_ts` is already visible to the new
    /// transaction's snapshot and is not a conflict; one that committed
    /// concurrently (after `new_start_ts`) is a blind write and conflicts.
    pub fn ww_dependency(&self, new_start_ts: Timestamp, other_start_ts: Timestamp, timeout: Duration) -> WwOutcome {
        if new_start_ts == other_start_ts {
            return WwOutcome::NoDependency;
        }
        let deadline = Instant::now() + timeout;
        let mut inner = self.inner.lock();
        loop {
            match inner.statuses.get(&other_start_ts).copied().unwrap_or(CommitState::Aborted) {
                CommitState::Aborted => return WwOutcome::Aborted,
                CommitState::Committed(commit_ts) => {
                    if commit_ts <= new_start_ts {
                        return WwOutcome::NoDependency;
                    }
                    return WwOutcome::Conflict;
                }
                CommitState::Active => {
                    let now = Instant::now();
                    if now >= deadline {
                        return WwOutcome::TimedOut;
                    }
                    let remaining = deadline - now;
                    self.cv.wait_for(&mut inner, remaining);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn own_write_has_no_dependency() {
        let idx = TransactionIndex::new();
        idx.register_active(5);
        assert_eq!(idx.ww_dependency(5, 5, Duration::ZERO), WwOutcome::NoDependency);
    }

    #[test]
    fn committed_other_is_a_conflict_when_concurrent() {
        let idx = TransactionIndex::new();
        idx.register_active(5);
        idx.mark_committed(5, 20);
        // new txn started at 10, before 5's commit at 20: blind write.
        assert_eq!(idx.ww_dependency(10, 5, Duration::ZERO), WwOutcome::Conflict);
    }

    #[test]
    fn committed_other_before_start_is_visible_not_a_conflict() {
        let idx = TransactionIndex::new();
        idx.register_active(5);
        idx.mark_committed(5, 6);
        // new txn started at 10, after 5 already committed at 6: visible.
        assert_eq!(idx.ww_dependency(10, 5, Duration::ZERO), WwOutcome::NoDependency);
    }

    #[test]
    fn aborted_other_is_skipped() {
        let idx = TransactionIndex::new();
        idx.register_active(5);
        idx.mark_aborted(5);
        assert_eq!(idx.ww_dependency(10, 5, Duration::ZERO), WwOutcome::Aborted);
    }

    #[test]
    fn active_other_times_out() {
        let idx = TransactionIndex::new();
        idx.register_active(5);
        let outcome = idx.ww_dependency(10, 5, Duration::from_millis(20));
        assert_eq!(outcome, WwOutcome::TimedOut);
    }

    #[test]
    fn visibility_requires_commit_before_read_ts() {
        let idx = TransactionIndex::new();
        idx.register_active(5);
        idx.mark_committed(5, 8);
        assert!(!idx.is_visible(5, 7));
        assert!(idx.is_visible(5, 8));
        assert!(idx.is_visible(5, 9));
    }

    #[test]
    fn oldest_active_snapshot_tracks_begin_and_end() {
        let idx = TransactionIndex::new();
        idx.register_active(3);
        idx.register_active(7);
        assert_eq!(idx.oldest_active_snapshot(), Some(3));
        idx.end_snapshot(3);
        assert_eq!(idx.oldest_active_snapshot(), Some(7));
    }
}

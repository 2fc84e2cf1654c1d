//! Per-session optimistic MVCC transaction context (spec §4.5). Grounded
//! on the teacher's `Transaction` (`src_old/transaction/tx.rs`,
//! unwired but present in the source tree) for the
//! begin/commit/rollback/nesting shape, and on
//! `src_old/transaction/log_aries.rs` for "append start/commit/rollback
//! markers that tie a run of records together by id".
//!
//! The underlying B+-tree page format is out of scope (spec §1), so
//! `LiveTree` here is the glue stand-in (SPEC_FULL.md §B.4) that lets
//! `store`/`fetch`/`commit` be exercised end-to-end: an in-memory sorted
//! map plus a write-timestamp stamp that commit validation re-checks,
//! playing the role real page write-timestamps play in the full engine.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use log::{debug, warn};

use crate::error::{PersistitError, Result};
use crate::journal::JournalManager;
use crate::shared_resource::{ClaimId, SharedResource};
use crate::stats::SessionStats;
use crate::timestamp::{Timestamp, TimestampAllocator};
use crate::transaction_index::TransactionIndex;

/// Threshold above which a stored value is staged as a "long record":
/// only a neutered descriptor lives in the overlay, with the real bytes
/// tracked on the side until commit (spec §4.5 "Long records").
pub const LONG_RECORD_THRESHOLD: usize = 1 << 16;

/// A live, in-memory tree that transactions read and write (see module
/// doc comment on scope).
pub struct LiveTree {
    data: parking_lot::Mutex<BTreeMap<Vec<u8>, Vec<u8>>>,
    write_timestamp: AtomicU64,
    dropped: std::sync::atomic::AtomicBool,
}

impl Default for LiveTree {
    fn default() -> Self {
        Self::new()
    }
}

impl LiveTree {
    pub fn new() -> Self {
        LiveTree {
            data: parking_lot::Mutex::new(BTreeMap::new()),
            write_timestamp: AtomicU64::new(0),
            dropped: std::sync::atomic::AtomicBool::new(false),
        }
    }

    pub fn write_timestamp(&self) -> Timestamp {
        self.write_timestamp.load(Ordering::Acquire)
    }

    pub fn get(&self, key: &[u8]) -> Option<Vec<u8>> {
        self.data.lock().get(key).cloned()
    }

    pub fn is_dropped(&self) -> bool {
        self.dropped.load(Ordering::Acquire)
    }

    /// Stamp this tree as written at `ts` without going through a
    /// `Transaction`, mirroring `Buffer::set_write_timestamp` for the
    /// out-of-scope page layer (spec §8 scenario 4: "Outside any txn, a
    /// direct write bumps the page timestamp").
    pub fn touch_externally(&self, ts: Timestamp) {
        self.write_timestamp.store(ts, Ordering::Release);
    }

    /// Apply a single committed write. Shared by `Transaction::commit`'s
    /// overlay-apply step and by journal replay, since both land the same
    /// mutation on the same data map (spec §4.4, §4.5).
    pub fn apply_write(&self, key: &[u8], value: &[u8], ts: Timestamp) {
        self.data.lock().insert(key.to_vec(), value.to_vec());
        self.write_timestamp.store(ts, Ordering::Release);
    }

    /// Apply a committed `[k1, k2)` deletion.
    pub fn apply_delete_range(&self, k1: &[u8], k2: &[u8], ts: Timestamp) {
        let mut data = self.data.lock();
        let keys: Vec<Vec<u8>> = data.range(k1.to_vec()..k2.to_vec()).map(|(k, _)| k.clone()).collect();
        for k in keys {
            data.remove(&k);
        }
        drop(data);
        self.write_timestamp.store(ts, Ordering::Release);
    }

    /// Apply a committed tree drop: clear the data map and mark dropped.
    pub fn apply_drop(&self, ts: Timestamp) {
        self.data.lock().clear();
        self.dropped.store(true, Ordering::Release);
        self.write_timestamp.store(ts, Ordering::Release);
    }
}

#[derive(Clone, PartialEq, Eq, PartialOrd, Ord)]
enum OpKind {
    Store,
    RemoveRange,
    DropTree,
}

#[derive(Clone, PartialEq, Eq, PartialOrd, Ord)]
struct OverlayKey {
    op: OpKind,
    tree_handle: i32,
    key: Vec<u8>,
}

#[derive(Clone)]
enum OverlayValue {
    Store(Vec<u8>),
    StoreLong(u64),
    RemoveRange(Vec<u8>),
    DropTree,
}

/// Outcome of `fetch`: a live value, an explicit tombstone (inside a
/// staged remove range), or nothing staged (defer to the live tree).
pub enum FetchResult {
    Value(Vec<u8>),
    Removed,
    NotStaged,
}

pub struct Transaction {
    session_id: ClaimId,
    timestamps: Arc<TimestampAllocator>,
    index: Arc<TransactionIndex>,
    journal: Arc<JournalManager>,
    commit_resource: Arc<SharedResource>,
    stats: Arc<SessionStats>,

    depth: u32,
    start_ts: Timestamp,
    committed_this_txn: bool,
    rollback_pending: bool,

    overlay: BTreeMap<OverlayKey, OverlayValue>,
    touched: HashMap<i32, Timestamp>,
    long_records: HashMap<u64, Vec<u8>>,
    next_long_record_id: u64,
    dealloc_list: Vec<u64>,

    retry_count: u32,
    pessimistic: bool,
    holds_commit_resource: bool,

    #[allow(clippy::type_complexity)]
    on_commit: Option<Arc<dyn Fn(Timestamp) + Send + Sync>>,
}

const PESSIMISTIC_RETRY_THRESHOLD: u32 = 3;
const COMMIT_CLAIM_TIMEOUT: Duration = Duration::from_secs(60);

impl Transaction {
    pub fn new(
        session_id: ClaimId,
        timestamps: Arc<TimestampAllocator>,
        index: Arc<TransactionIndex>,
        journal: Arc<JournalManager>,
        commit_resource: Arc<SharedResource>,
        stats: Arc<SessionStats>,
    ) -> Self {
        Transaction {
            session_id,
            timestamps,
            index,
            journal,
            commit_resource,
            stats,
            depth: 0,
            start_ts: 0,
            committed_this_txn: false,
            rollback_pending: false,
            overlay: BTreeMap::new(),
            touched: HashMap::new(),
            long_records: HashMap::new(),
            next_long_record_id: 0,
            dealloc_list: Vec::new(),
            retry_count: 0,
            pessimistic: false,
            holds_commit_resource: false,
            on_commit: None,
        }
    }

    pub fn set_commit_listener(&mut self, f: Arc<dyn Fn(Timestamp) + Send + Sync>) {
        self.on_commit = Some(f);
    }

    pub fn depth(&self) -> u32 {
        self.depth
    }

    pub fn start_timestamp(&self) -> Timestamp {
        self.start_ts
    }

    /// (spec §4.5 `begin()`).
    pub fn begin(&mut self) -> Result<()> {
        if self.depth == 0 {
            let writer = self.pessimistic;
            if !self.commit_resource.claim(self.session_id, writer, COMMIT_CLAIM_TIMEOUT) {
                return Err(PersistitError::InUse);
            }
            self.holds_commit_resource = true;
            self.start_ts = self.timestamps.next_timestamp();
            self.index.register_active(self.start_ts);
            self.rollback_pending = false;
            self.committed_this_txn = false;
        }
        self.depth += 1;
        Ok(())
    }

    /// (spec §4.5 `end()`).
    pub fn end(&mut self, trees: &HashMap<i32, Arc<LiveTree>>) -> Result<()> {
        if self.depth == 0 {
            return Err(PersistitError::Fatal("end() called without a matching begin()".into()));
        }
        self.depth -= 1;
        if self.depth == 0 {
            if !self.committed_this_txn {
                self.rollback(trees)?;
            }
            self.touched.clear();
            self.index.end_snapshot(self.start_ts);
        }
        Ok(())
    }

    fn stage(&mut self, key: OverlayKey, value: OverlayValue) {
        if let Some(OverlayValue::StoreLong(id)) = self.overlay.insert(key, value) {
            // An earlier long-record store in this same transaction is
            // being overwritten; it will never commit (spec §4.5 "Long
            // records").
            self.dealloc_list.push(id);
        }
    }

    /// Write into the overlay (spec §4.5 `store`). Values above
    /// `LONG_RECORD_THRESHOLD` are staged as a neutered descriptor.
    pub fn store(&mut self, tree_handle: i32, key: &[u8], value: &[u8]) {
        let overlay_key = OverlayKey {
            op: OpKind::Store,
            tree_handle,
            key: key.to_vec(),
        };
        if value.len() > LONG_RECORD_THRESHOLD {
            let id = self.next_long_record_id;
            self.next_long_record_id += 1;
            self.long_records.insert(id, value.to_vec());
            self.stage(overlay_key, OverlayValue::StoreLong(id));
        } else {
            self.stage(overlay_key, OverlayValue::Store(value.to_vec()));
        }
    }

    /// Remove `[k1, k2)`; overlapping remove-range entries for the same
    /// tree are coalesced (spec §4.5 `remove`).
    pub fn remove(&mut self, tree_handle: i32, k1: &[u8], k2: &[u8]) {
        let mut lo = k1.to_vec();
        let mut hi = k2.to_vec();

        let overlapping: Vec<OverlayKey> = self
            .overlay
            .iter()
            .filter_map(|(k, v)| match v {
                OverlayValue::RemoveRange(end) if k.tree_handle == tree_handle => {
                    if ranges_overlap(&k.key, end, &lo, &hi) {
                        Some(k.clone())
                    } else {
                        None
                    }
                }
                _ => None,
            })
            .collect();

        for k in &overlapping {
            if let Some(OverlayValue::RemoveRange(end)) = self.overlay.remove(k) {
                if k.key < lo {
                    lo = k.key.clone();
                }
                if end > hi {
                    hi = end;
                }
            }
        }

        self.stage(
            OverlayKey {
                op: OpKind::RemoveRange,
                tree_handle,
                key: lo,
            },
            OverlayValue::RemoveRange(hi),
        );
    }

    pub fn remove_tree(&mut self, tree_handle: i32) {
        self.overlay.retain(|k, _| k.tree_handle != tree_handle);
        self.stage(
            OverlayKey {
                op: OpKind::DropTree,
                tree_handle,
                key: Vec::new(),
            },
            OverlayValue::DropTree,
        );
    }

    /// Record a snapshot of a tree's write-timestamp the first time this
    /// transaction reads or writes it, for commit-time re-verification
    /// (spec §4.5 commit step 2, generalized from per-page touches to
    /// per-tree touches since page-level storage is out of scope — see
    /// DESIGN.md).
    pub fn touch(&mut self, tree_handle: i32, tree: &LiveTree) {
        self.touched.entry(tree_handle).or_insert_with(|| tree.write_timestamp());
    }

    /// Consult the overlay first; `NotStaged` means defer to the live
    /// tree (spec §4.5 `fetch`/`traverse`).
    pub fn fetch(&self, tree_handle: i32, key: &[u8]) -> FetchResult {
        let store_key = OverlayKey {
            op: OpKind::Store,
            tree_handle,
            key: key.to_vec(),
        };
        match self.overlay.get(&store_key) {
            Some(OverlayValue::Store(v)) => return FetchResult::Value(v.clone()),
            Some(OverlayValue::StoreLong(id)) => {
                if let Some(v) = self.long_records.get(id) {
                    return FetchResult::Value(v.clone());
                }
            }
            _ => {}
        }
        for (k, v) in self.overlay.range(..=store_key.clone()).rev() {
            if k.tree_handle != tree_handle || k.op != OpKind::RemoveRange {
                continue;
            }
            if let OverlayValue::RemoveRange(end) = v {
                if k.key.as_slice() <= key && key < end.as_slice() {
                    return FetchResult::Removed;
                }
            }
        }
        FetchResult::NotStaged
    }

    /// (spec §4.5 `rollback()`).
    pub fn rollback(&mut self, trees: &HashMap<i32, Arc<LiveTree>>) -> Result<()> {
        let _ = trees;
        self.overlay.clear();
        self.long_records.clear();
        self.dealloc_list.clear();
        self.index.mark_aborted(self.start_ts);
        self.rollback_pending = false;
        self.stats.record_rollback();

        if self.depth == 0 {
            self.release_commit_resource();
        }

        if self.start_ts != 0 {
            self.retry_count += 1;
            if self.retry_count >= PESSIMISTIC_RETRY_THRESHOLD {
                warn!(
                    "session {} switching to pessimistic mode after {} rollbacks",
                    self.session_id, self.retry_count
                );
                self.pessimistic = true;
            }
        }
        Ok(())
    }

    fn release_commit_resource(&mut self) {
        if self.holds_commit_resource {
            self.commit_resource.release(self.session_id);
            self.holds_commit_resource = false;
        }
    }

    /// (spec §4.5 `commit(to_disk)`).
    pub fn commit(&mut self, to_disk: bool, trees: &HashMap<i32, Arc<LiveTree>>) -> Result<()> {
        if self.depth > 1 {
            self.committed_this_txn = true;
            return Ok(());
        }

        // Step 1: claim the global commit resource exclusively. The
        // outermost `begin()` already holds a claim (shared, or
        // exclusive under pessimistic mode); upgrade or reclaim as
        // exclusive for the apply step.
        let already_own_exclusive =
            self.commit_resource.is_writer_held() && self.commit_resource.owner() == Some(self.session_id);
        if !already_own_exclusive {
            if !self.commit_resource.upgrade(self.session_id) {
                self.release_commit_resource();
                if !self.commit_resource.claim(self.session_id, true, COMMIT_CLAIM_TIMEOUT) {
                    self.rollback_pending = true;
                    return Err(PersistitError::InUse);
                }
                self.holds_commit_resource = true;
            }
        }

        // Step 2: re-verify every touched tree's write-timestamp.
        for (&tree_handle, &snapshot_ts) in &self.touched {
            if let Some(tree) = trees.get(&tree_handle) {
                if tree.write_timestamp() != snapshot_ts {
                    self.rollback_pending = true;
                    self.release_commit_resource();
                    return Err(PersistitError::Rollback);
                }
            }
        }

        // Step 3: transaction-start marker.
        self.journal.write_transaction_start(self.start_ts)?;

        // Step 4: apply overlay in key order; stamp touched trees.
        let commit_ts = self.timestamps.next_timestamp();
        for (k, v) in self.overlay.iter() {
            match v {
                OverlayValue::Store(value) => {
                    if let Some(tree) = trees.get(&k.tree_handle) {
                        tree.apply_write(&k.key, value, commit_ts);
                    }
                    self.journal.write_store(self.start_ts, k.tree_handle, "", &k.key, value)?;
                }
                OverlayValue::StoreLong(id) => {
                    if let Some(value) = self.long_records.get(id) {
                        if let Some(tree) = trees.get(&k.tree_handle) {
                            tree.apply_write(&k.key, value, commit_ts);
                        }
                        self.journal.write_store(self.start_ts, k.tree_handle, "", &k.key, value)?;
                    }
                }
                OverlayValue::RemoveRange(end) => {
                    if let Some(tree) = trees.get(&k.tree_handle) {
                        tree.apply_delete_range(&k.key, end, commit_ts);
                    }
                    self.journal.write_delete_range(self.start_ts, k.tree_handle, "", &k.key, end)?;
                }
                OverlayValue::DropTree => {
                    if let Some(tree) = trees.get(&k.tree_handle) {
                        tree.apply_drop(commit_ts);
                    }
                    self.journal.write_drop_tree(self.start_ts, k.tree_handle, "")?;
                }
            }
        }
        self.journal.write_transaction_commit(self.start_ts)?;

        // Step 5: clear overlay and dealloc list.
        for id in self.dealloc_list.drain(..) {
            self.long_records.remove(&id);
        }
        self.overlay.clear();
        self.long_records.clear();

        // Step 6: release and optionally force.
        self.release_commit_resource();
        if to_disk {
            self.journal.force()?;
        }

        self.index.mark_committed(self.start_ts, commit_ts);
        self.committed_this_txn = true;
        self.stats.record_commit();
        self.retry_count = 0;

        // Step 7: commit listener.
        if let Some(listener) = &self.on_commit {
            listener(commit_ts);
        }
        debug!("transaction {} committed at timestamp {}", self.start_ts, commit_ts);
        Ok(())
    }
}

fn ranges_overlap(a_lo: &[u8], a_hi: &[u8], b_lo: &[u8], b_hi: &[u8]) -> bool {
    a_lo < b_hi && b_lo < a_hi
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn setup() -> (Transaction, HashMap<i32, Arc<LiveTree>>, Arc<JournalManager>) {
        let dir = tempdir().unwrap();
        let journal = JournalManager::open(dir.path(), "rpj", 1 << 20).unwrap();
        let timestamps = Arc::new(TimestampAllocator::new());
        let index = Arc::new(TransactionIndex::new());
        let commit_resource = Arc::new(SharedResource::new());
        let stats = Arc::new(SessionStats::new());
        let txn = Transaction::new(1, timestamps, index, journal.clone(), commit_resource, stats);
        let mut trees = HashMap::new();
        trees.insert(1, Arc::new(LiveTree::new()));
        (txn, trees, journal)
    }

    #[test]
    fn store_then_fetch_sees_own_write_before_commit() {
        let (mut txn, trees, _journal) = setup();
        txn.begin().unwrap();
        txn.store(1, b"k1", b"v1");
        match txn.fetch(1, b"k1") {
            FetchResult::Value(v) => assert_eq!(v, b"v1"),
            _ => panic!("expected staged value"),
        }
        txn.commit(false, &trees).unwrap();
        txn.end(&trees).unwrap();
        assert_eq!(trees[&1].get(b"k1"), Some(b"v1".to_vec()));
    }

    #[test]
    fn rollback_discards_overlay() {
        let (mut txn, trees, _journal) = setup();
        txn.begin().unwrap();
        txn.store(1, b"k1", b"v1");
        txn.rollback(&trees).unwrap();
        txn.end(&trees).unwrap();
        assert_eq!(trees[&1].get(b"k1"), None);
    }

    #[test]
    fn end_without_commit_rolls_back() {
        let (mut txn, trees, _journal) = setup();
        txn.begin().unwrap();
        txn.store(1, b"k1", b"v1");
        txn.end(&trees).unwrap();
        assert_eq!(trees[&1].get(b"k1"), None);
    }

    #[test]
    fn touched_tree_mismatch_forces_rollback() {
        let (mut txn, trees, _journal) = setup();
        txn.begin().unwrap();
        txn.touch(1, &trees[&1]);
        // Simulate a concurrent commit bumping the tree's write-timestamp.
        trees[&1].write_timestamp.store(999, Ordering::Release);
        let result = txn.commit(false, &trees);
        assert!(result.is_err());
    }

    #[test]
    fn long_record_round_trips_through_overlay() {
        let (mut txn, trees, _journal) = setup();
        txn.begin().unwrap();
        let big = vec![7u8; LONG_RECORD_THRESHOLD + 10];
        txn.store(1, b"big", &big);
        match txn.fetch(1, b"big") {
            FetchResult::Value(v) => assert_eq!(v.len(), big.len()),
            _ => panic!("expected staged long value"),
        }
        txn.commit(false, &trees).unwrap();
        txn.end(&trees).unwrap();
        assert_eq!(trees[&1].get(b"big").unwrap().len(), big.len());
    }

    #[test]
    fn remove_range_coalesces_overlapping_ranges() {
        let (mut txn, _trees, _journal) = setup();
        txn.begin().unwrap();
        txn.remove(1, b"a", b"m");
        txn.remove(1, b"k", b"z");
        assert_eq!(txn.overlay.len(), 1);
        let only = txn.overlay.values().next().unwrap();
        match only {
            OverlayValue::RemoveRange(end) => assert_eq!(end, b"z"),
            _ => panic!("expected a single coalesced remove range"),
        }
    }
}

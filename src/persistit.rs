//! Top-level engine struct wiring `BufferPool`, `JournalManager`,
//! `TransactionIndex`, and the live-tree directory together; an explicit,
//! constructible object replacing the teacher's `Database::global()`
//! singleton, per spec §9's redesign note against hidden global state.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use log::info;
use parking_lot::RwLock;

use crate::buffer_pool::BufferPool;
use crate::config::Config;
use crate::error::{PersistitError, Result};
use crate::journal::{JournalManager, RecoveryReport};
use crate::shared_resource::{ClaimId, SharedResource};
use crate::stats::{self, PoolStats, SessionStats};
use crate::timely_resource::TimelyResource;
use crate::timestamp::TimestampAllocator;
use crate::transaction::{LiveTree, Transaction};
use crate::transaction_index::TransactionIndex;
use crate::tree::Tree;
use crate::volume::Volume;

const SCHEMA_CLAIM_TIMEOUT: Duration = Duration::from_secs(5);

/// A running instance of the storage engine.
pub struct Persistit {
    config: Config,
    timestamps: Arc<TimestampAllocator>,
    index: Arc<TransactionIndex>,
    journal: Arc<JournalManager>,
    commit_resource: Arc<SharedResource>,
    pools: HashMap<usize, Arc<BufferPool>>,
    trees: RwLock<HashMap<i32, Arc<LiveTree>>>,
    tree_schema: RwLock<HashMap<i32, Arc<TimelyResource<Tree>>>>,
    next_tree_handle: AtomicU64,
    next_session_id: AtomicU64,
}

impl Persistit {
    pub fn open(config: Config) -> Result<Arc<Self>> {
        let timestamps = Arc::new(TimestampAllocator::new());
        let index = Arc::new(TransactionIndex::new());
        let journal = JournalManager::open(&config.journal_path, "rpj", config.journal_file_size)?;
        let commit_resource = Arc::new(SharedResource::new());

        let mut pools = HashMap::new();
        for (page_size, spec) in &config.buffer_pools {
            let count = spec.resolve_count(*page_size);
            let pool = BufferPool::new(count, *page_size, journal.clone(), timestamps.clone());
            pools.insert(*page_size, pool);
        }

        info!(
            "engine opened with {} buffer pool(s), journal at {}",
            pools.len(),
            config.journal_path
        );

        let engine = Arc::new(Persistit {
            config,
            timestamps,
            index,
            journal,
            commit_resource,
            pools,
            trees: RwLock::new(HashMap::new()),
            tree_schema: RwLock::new(HashMap::new()),
            next_tree_handle: AtomicU64::new(1),
            next_session_id: AtomicU64::new(1),
        });

        // Replay whatever committed work survives in the journal against
        // whichever volumes/trees were registered before `open()` was
        // called (spec §4.4 "Recovery"). Volumes and trees registered
        // afterward see only their own fresh state, same as a brand-new
        // engine.
        let report = engine.recover()?;
        info!(
            "recovery scanned {} record(s), applied {} page(s) and {} tree mutation(s) across {} committed transaction(s)",
            report.records_scanned, report.pages_applied, report.records_applied, report.committed_transactions
        );

        Ok(engine)
    }

    /// Scan the journal and replay committed work against the volumes and
    /// trees currently registered with this engine (spec §4.4 "Recovery").
    pub fn recover(&self) -> Result<RecoveryReport> {
        let mut volumes = HashMap::new();
        for pool in self.pools.values() {
            volumes.extend(pool.volumes_snapshot());
        }
        let trees = self.trees_snapshot();
        let records = self.journal.scan_all()?;
        self.journal.replay(&records, &volumes, &trees)
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn pool(&self, page_size: usize) -> Option<Arc<BufferPool>> {
        self.pools.get(&page_size).cloned()
    }

    pub fn register_volume(&self, page_size: usize, volume: Arc<dyn Volume>) {
        if let Some(pool) = self.pools.get(&page_size) {
            pool.register_volume(volume);
        }
    }

    /// Create a named tree, versioning it through the tree directory's
    /// `TimelyResource<Tree>` chain rather than installing it directly
    /// (spec §4.6's MVCC "Add contract" applies to schema objects, not
    /// just row data).
    pub fn create_tree(&self, name: &str) -> Result<i32> {
        let handle = self.next_tree_handle.fetch_add(1, Ordering::AcqRel) as i32;
        let ts = self.timestamps.next_timestamp();
        self.index.register_active(ts);

        let schema = Arc::new(TimelyResource::new(name));
        let result = schema.add_version(Tree::new(name, handle, 0), ts, &self.index, SCHEMA_CLAIM_TIMEOUT);
        match &result {
            Ok(()) => {
                let commit_ts = self.timestamps.next_timestamp();
                self.index.mark_committed(ts, commit_ts);
            }
            Err(_) => self.index.mark_aborted(ts),
        }
        self.index.end_snapshot(ts);
        result?;

        self.tree_schema.write().insert(handle, schema);
        self.trees.write().insert(handle, Arc::new(LiveTree::new()));
        Ok(handle)
    }

    /// Drop a tree, staging a new `Tree::dropped` version in its schema
    /// chain and clearing its live data (spec §4.6, §4.5 `removeTree`).
    pub fn drop_tree(&self, handle: i32) -> Result<()> {
        let schema = self
            .tree_schema
            .read()
            .get(&handle)
            .cloned()
            .ok_or_else(|| PersistitError::Fatal(format!("no such tree handle {}", handle)))?;

        let ts = self.timestamps.next_timestamp();
        self.index.register_active(ts);
        let result = schema.add_version(Tree::dropped(schema.name(), handle), ts, &self.index, SCHEMA_CLAIM_TIMEOUT);
        match &result {
            Ok(()) => {
                let commit_ts = self.timestamps.next_timestamp();
                self.index.mark_committed(ts, commit_ts);
                if let Some(tree) = self.trees.read().get(&handle) {
                    tree.apply_drop(commit_ts);
                }
            }
            Err(_) => self.index.mark_aborted(ts),
        }
        self.index.end_snapshot(ts);
        result
    }

    pub fn tree(&self, handle: i32) -> Option<Arc<LiveTree>> {
        self.trees.read().get(&handle).cloned()
    }

    pub fn tree_schema(&self, handle: i32) -> Option<Arc<TimelyResource<Tree>>> {
        self.tree_schema.read().get(&handle).cloned()
    }

    pub fn trees_snapshot(&self) -> HashMap<i32, Arc<LiveTree>> {
        self.trees.read().clone()
    }

    /// Allocate a fresh session id and a `Transaction` bound to this
    /// engine's shared machinery (spec §4.5).
    pub fn begin_session(self: &Arc<Self>) -> (ClaimId, Transaction) {
        let session_id = self.next_session_id.fetch_add(1, Ordering::AcqRel);
        let stats = Arc::new(SessionStats::new());
        let txn = Transaction::new(
            session_id,
            self.timestamps.clone(),
            self.index.clone(),
            self.journal.clone(),
            self.commit_resource.clone(),
            stats,
        );
        (session_id, txn)
    }

    pub fn transaction_index(&self) -> &Arc<TransactionIndex> {
        &self.index
    }

    pub fn journal(&self) -> &Arc<JournalManager> {
        &self.journal
    }

    pub fn propose_checkpoint(&self, wall_clock_ms: u64) {
        for pool in self.pools.values() {
            pool.propose_checkpoint(wall_clock_ms);
        }
    }

    pub fn stats(&self, page_size: usize) -> Option<PoolStats> {
        self.pools.get(&page_size).map(|pool| stats::snapshot(pool, &self.journal))
    }

    /// Flush every pool's dirty pages and stop background workers (spec
    /// §4.3 `close()`).
    pub fn close(&self) {
        for pool in self.pools.values() {
            pool.close();
        }
        info!("engine closed");
    }
}

//! An embedded, transactional B+-tree-style key/value storage engine
//! core: a concurrent buffered page cache, an append-only write-ahead
//! journal, and an optimistic MVCC transaction manager. The B+-tree page
//! layout itself, cursors, typed serialization, and the management/JMX
//! surface are out of scope; this crate provides the storage-engine
//! machinery those layers would sit on top of.

pub mod buffer;
pub mod buffer_pool;
pub mod config;
pub mod error;
pub mod journal;
pub mod persistit;
pub mod shared_resource;
pub mod stats;
pub mod timely_resource;
pub mod timestamp;
pub mod transaction;
pub mod transaction_index;
pub mod tree;
pub mod volume;

pub use error::{PersistitError, Result};
pub use persistit::Persistit;

use std::sync::Once;

static LOG_INIT: Once = Once::new();

/// Initialize `env_logger` exactly once; safe to call repeatedly (tests
/// and examples each call this at setup).
pub fn init_log() {
    LOG_INIT.call_once(|| {
        let _ = env_logger::try_init();
    });
}

//! Programmatic engine configuration (spec §6.4). The source's
//! XML-backed configuration subsystem is out of scope (spec §1); this
//! substitutes a validated builder, the Open Question resolution
//! recorded in DESIGN.md.

use crate::error::{PersistitError, Result};

pub const VALID_PAGE_SIZES: [usize; 5] = [1024, 2048, 4096, 8192, 16384];

/// Exactly one of `count` or the memory-budget fields may be given for a
/// page size (spec §6.4).
#[derive(Debug, Clone, Copy)]
pub enum BufferPoolSpec {
    Count(usize),
    Memory {
        min_memory: u64,
        max_memory: u64,
        reserved_memory: u64,
        fraction: f64,
    },
}

impl BufferPoolSpec {
    /// Resolve to a buffer count for a given page size. For `Memory`,
    /// this is `((max_memory - reserved_memory) as f64 * fraction) /
    /// page_size`, clamped so at least one buffer is always produced.
    pub fn resolve_count(&self, page_size: usize) -> usize {
        match self {
            BufferPoolSpec::Count(n) => *n,
            BufferPoolSpec::Memory {
                max_memory,
                reserved_memory,
                fraction,
                ..
            } => {
                let usable = max_memory.saturating_sub(*reserved_memory) as f64 * fraction;
                ((usable / page_size as f64) as usize).max(1)
            }
        }
    }
}

#[derive(Debug, Clone)]
pub struct Config {
    pub buffer_pools: Vec<(usize, BufferPoolSpec)>,
    pub journal_path: String,
    pub journal_file_size: u64,
    pub checkpoint_interval_secs: u64,
    pub append_only: bool,
    pub ignore_missing_volumes: bool,
}

const MIN_JOURNAL_FILE_SIZE: u64 = 1 << 16;
const MAX_JOURNAL_FILE_SIZE: u64 = 1 << 34;
const MIN_CHECKPOINT_INTERVAL: u64 = 1;
const MAX_CHECKPOINT_INTERVAL: u64 = 3600;

pub struct ConfigBuilder {
    buffer_pools: Vec<(usize, BufferPoolSpec)>,
    journal_path: Option<String>,
    journal_file_size: u64,
    checkpoint_interval_secs: u64,
    append_only: bool,
    ignore_missing_volumes: bool,
}

impl Default for ConfigBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl ConfigBuilder {
    pub fn new() -> Self {
        ConfigBuilder {
            buffer_pools: Vec::new(),
            journal_path: None,
            journal_file_size: 1 << 30,
            checkpoint_interval_secs: 60,
            append_only: false,
            ignore_missing_volumes: false,
        }
    }

    pub fn buffer_pool(mut self, page_size: usize, spec: BufferPoolSpec) -> Self {
        self.buffer_pools.push((page_size, spec));
        self
    }

    pub fn journal_path(mut self, path: &str) -> Self {
        self.journal_path = Some(path.to_string());
        self
    }

    pub fn journal_file_size(mut self, bytes: u64) -> Self {
        self.journal_file_size = bytes;
        self
    }

    pub fn checkpoint_interval_secs(mut self, secs: u64) -> Self {
        self.checkpoint_interval_secs = secs;
        self
    }

    pub fn append_only(mut self, v: bool) -> Self {
        self.append_only = v;
        self
    }

    pub fn ignore_missing_volumes(mut self, v: bool) -> Self {
        self.ignore_missing_volumes = v;
        self
    }

    pub fn build(self) -> Result<Config> {
        let journal_path = self
            .journal_path
            .ok_or_else(|| PersistitError::Fatal("journal_path is required".into()))?;

        if self.buffer_pools.is_empty() {
            return Err(PersistitError::Fatal("at least one buffer_pool entry is required".into()));
        }

        let mut seen = std::collections::HashSet::new();
        for (page_size, _) in &self.buffer_pools {
            if !VALID_PAGE_SIZES.contains(page_size) {
                return Err(PersistitError::Fatal(format!(
                    "invalid page size {}; must be one of {:?}",
                    page_size, VALID_PAGE_SIZES
                )));
            }
            if !seen.insert(*page_size) {
                return Err(PersistitError::Fatal(format!(
                    "duplicate buffer pool spec for page size {}",
                    page_size
                )));
            }
        }

        if !(MIN_JOURNAL_FILE_SIZE..=MAX_JOURNAL_FILE_SIZE).contains(&self.journal_file_size) {
            return Err(PersistitError::Fatal(format!(
                "journal_file_size {} out of bounded range [{}, {}]",
                self.journal_file_size, MIN_JOURNAL_FILE_SIZE, MAX_JOURNAL_FILE_SIZE
            )));
        }

        if !(MIN_CHECKPOINT_INTERVAL..=MAX_CHECKPOINT_INTERVAL).contains(&self.checkpoint_interval_secs) {
            return Err(PersistitError::Fatal(format!(
                "checkpoint_interval_secs {} out of bounded range [{}, {}]",
                self.checkpoint_interval_secs, MIN_CHECKPOINT_INTERVAL, MAX_CHECKPOINT_INTERVAL
            )));
        }

        Ok(Config {
            buffer_pools: self.buffer_pools,
            journal_path,
            journal_file_size: self.journal_file_size,
            checkpoint_interval_secs: self.checkpoint_interval_secs,
            append_only: self.append_only,
            ignore_missing_volumes: self.ignore_missing_volumes,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builds_with_valid_settings() {
        let cfg = ConfigBuilder::new()
            .journal_path("/tmp/journal")
            .buffer_pool(16384, BufferPoolSpec::Count(100))
            .build()
            .unwrap();
        assert_eq!(cfg.buffer_pools.len(), 1);
    }

    #[test]
    fn rejects_invalid_page_size() {
        let err = ConfigBuilder::new()
            .journal_path("/tmp/journal")
            .buffer_pool(3000, BufferPoolSpec::Count(10))
            .build();
        assert!(err.is_err());
    }

    #[test]
    fn rejects_missing_journal_path() {
        let err = ConfigBuilder::new().buffer_pool(8192, BufferPoolSpec::Count(10)).build();
        assert!(err.is_err());
    }

    #[test]
    fn memory_spec_resolves_to_bounded_count() {
        let spec = BufferPoolSpec::Memory {
            min_memory: 0,
            max_memory: 1 << 20,
            reserved_memory: 0,
            fraction: 0.5,
        };
        let count = spec.resolve_count(4096);
        assert!(count >= 1 && count <= 256);
    }
}

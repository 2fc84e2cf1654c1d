//! Crate-wide error taxonomy (spec §7). One enum, no `thiserror` — mirrors
//! the teacher's own `SimpleError`/`SmallError` (manual `Display`/`Error`).

use std::fmt;
use std::io;

#[derive(Debug)]
pub enum PersistitError {
    /// A claim timed out. Recoverable by retry or surfaced to the caller.
    InUse,
    /// A waiting thread was cancelled.
    Interrupted,
    /// Page on disk does not match its expected geometry.
    InvalidPageAddress(String),
    InvalidPageStructure(String),
    VolumeClosed(String),
    VolumeNotFound(String),
    /// Wraps a volume or journal I/O error.
    PersistitIo(io::Error),
    /// Explicit or implicit rollback of a transaction.
    Rollback,
    /// Internal: a write-write dependency wait timed out during
    /// `TimelyResource::add_version`. Never returned across the public API.
    WwRetry,
    /// Journal record malformed, or a checkpoint invariant was violated
    /// during recovery.
    Corrupt(String),
    /// Invariant violation. Latches the engine closed.
    Fatal(String),
}

pub type Result<T> = std::result::Result<T, PersistitError>;

impl fmt::Display for PersistitError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            PersistitError::InUse => write!(f, "claim timed out"),
            PersistitError::Interrupted => write!(f, "operation interrupted"),
            PersistitError::InvalidPageAddress(s) => {
                write!(f, "invalid page address: {}", s)
            }
            PersistitError::InvalidPageStructure(s) => {
                write!(f, "invalid page structure: {}", s)
            }
            PersistitError::VolumeClosed(s) => write!(f, "volume closed: {}", s),
            PersistitError::VolumeNotFound(s) => write!(f, "volume not found: {}", s),
            PersistitError::PersistitIo(e) => write!(f, "i/o error: {}", e),
            PersistitError::Rollback => write!(f, "transaction rolled back"),
            PersistitError::WwRetry => write!(f, "write-write dependency wait timed out"),
            PersistitError::Corrupt(s) => write!(f, "corrupt journal: {}", s),
            PersistitError::Fatal(s) => write!(f, "fatal engine error: {}", s),
        }
    }
}

impl std::error::Error for PersistitError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            PersistitError::PersistitIo(e) => Some(e),
            _ => None,
        }
    }
}

impl From<io::Error> for PersistitError {
    fn from(e: io::Error) -> Self {
        PersistitError::PersistitIo(e)
    }
}

impl PersistitError {
    /// Background workers (PageWriter/DirtyPageCollector) treat I/O errors
    /// as transient: log and retry rather than propagate. See spec §7.
    pub fn is_transient_io(&self) -> bool {
        matches!(self, PersistitError::PersistitIo(_))
    }
}

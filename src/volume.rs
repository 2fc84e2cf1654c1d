//! The volume interface consumed by the core (spec §6.1). The B+-tree page
//! layout and the on-disk volume file format are explicitly out of scope
//! (spec §1); this module defines only the block-I/O contract the
//! in-scope components (`BufferPool`, `JournalManager`) need, plus two
//! concrete implementations sufficient to exercise them end-to-end:
//! `FileVolume` (flat-file page store) and `MemoryVolume` (for fast unit
//! tests). See SPEC_FULL.md §B.3.

use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::Mutex;

use crate::error::{PersistitError, Result};

pub type PageAddress = u64;

/// A page's identity within the engine: which volume, and where in it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PageId {
    pub volume_id: i64,
    pub page_address: PageAddress,
}

impl PageId {
    pub fn new(volume_id: i64, page_address: PageAddress) -> Self {
        PageId {
            volume_id,
            page_address,
        }
    }
}

/// Operations the core requires from a volume (spec §6.1). All are
/// blocking; the core is multi-threaded, not async (spec §5).
pub trait Volume: Send + Sync {
    fn id(&self) -> i64;
    fn name(&self) -> &str;
    fn path(&self) -> &str;
    fn is_temporary(&self) -> bool;
    fn page_size(&self) -> usize;
    fn next_available_page(&self) -> PageAddress;

    /// Read one page into `buf`. `buf.len()` must equal `page_size()`.
    fn read_page(&self, page: PageAddress, buf: &mut [u8]) -> Result<()>;
    /// Write one page from `buf`. `buf.len()` must equal `page_size()`.
    fn write_page(&self, page: PageAddress, buf: &[u8]) -> Result<()>;
    /// Grow the volume to hold at least `to_pages` pages.
    fn extend(&self, to_pages: PageAddress) -> Result<()>;
}

/// A flat file of fixed-size pages. Page `p` lives at byte offset
/// `p * page_size`.
pub struct FileVolume {
    id: i64,
    name: String,
    path: String,
    page_size: usize,
    temporary: bool,
    file: Mutex<File>,
    next_page: AtomicU64,
}

impl FileVolume {
    pub fn create<P: AsRef<Path>>(
        id: i64,
        name: &str,
        path: P,
        page_size: usize,
        temporary: bool,
    ) -> Result<Self> {
        let path_buf: PathBuf = path.as_ref().to_path_buf();
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(&path_buf)?;
        let len = file.metadata()?.len();
        let next_page = len / page_size as u64;
        Ok(FileVolume {
            id,
            name: name.to_string(),
            path: path_buf.to_string_lossy().into_owned(),
            page_size,
            temporary,
            file: Mutex::new(file),
            next_page: AtomicU64::new(next_page),
        })
    }
}

impl Volume for FileVolume {
    fn id(&self) -> i64 {
        self.id
    }
    fn name(&self) -> &str {
        &self.name
    }
    fn path(&self) -> &str {
        &self.path
    }
    fn is_temporary(&self) -> bool {
        self.temporary
    }
    fn page_size(&self) -> usize {
        self.page_size
    }
    fn next_available_page(&self) -> PageAddress {
        self.next_page.load(Ordering::Acquire)
    }

    fn read_page(&self, page: PageAddress, buf: &mut [u8]) -> Result<()> {
        if buf.len() != self.page_size {
            return Err(PersistitError::InvalidPageStructure(format!(
                "read buffer size {} != page size {}",
                buf.len(),
                self.page_size
            )));
        }
        let mut file = self.file.lock().unwrap();
        file.seek(SeekFrom::Start(page * self.page_size as u64))?;
        file.read_exact(buf)?;
        Ok(())
    }

    fn write_page(&self, page: PageAddress, buf: &[u8]) -> Result<()> {
        if buf.len() != self.page_size {
            return Err(PersistitError::InvalidPageStructure(format!(
                "write buffer size {} != page size {}",
                buf.len(),
                self.page_size
            )));
        }
        let mut file = self.file.lock().unwrap();
        file.seek(SeekFrom::Start(page * self.page_size as u64))?;
        file.write_all(buf)?;
        self.next_page.fetch_max(page + 1, Ordering::AcqRel);
        Ok(())
    }

    fn extend(&self, to_pages: PageAddress) -> Result<()> {
        let file = self.file.lock().unwrap();
        file.set_len(to_pages * self.page_size as u64)?;
        self.next_page.fetch_max(to_pages, Ordering::AcqRel);
        Ok(())
    }
}

/// An in-memory volume, for unit tests that want buffer-pool/journal
/// behavior without touching the filesystem.
pub struct MemoryVolume {
    id: i64,
    name: String,
    page_size: usize,
    temporary: bool,
    pages: Mutex<HashMap<PageAddress, Vec<u8>>>,
    next_page: AtomicU64,
}

static NEXT_MEMORY_VOLUME_ID: AtomicI64 = AtomicI64::new(1);

impl MemoryVolume {
    pub fn new(name: &str, page_size: usize, temporary: bool) -> Self {
        MemoryVolume {
            id: NEXT_MEMORY_VOLUME_ID.fetch_add(1, Ordering::Relaxed),
            name: name.to_string(),
            page_size,
            temporary,
            pages: Mutex::new(HashMap::new()),
            next_page: AtomicU64::new(0),
        }
    }
}

impl Volume for MemoryVolume {
    fn id(&self) -> i64 {
        self.id
    }
    fn name(&self) -> &str {
        &self.name
    }
    fn path(&self) -> &str {
        "memory"
    }
    fn is_temporary(&self) -> bool {
        self.temporary
    }
    fn page_size(&self) -> usize {
        self.page_size
    }
    fn next_available_page(&self) -> PageAddress {
        self.next_page.load(Ordering::Acquire)
    }

    fn read_page(&self, page: PageAddress, buf: &mut [u8]) -> Result<()> {
        let pages = self.pages.lock().unwrap();
        match pages.get(&page) {
            Some(bytes) => {
                buf.copy_from_slice(bytes);
                Ok(())
            }
            None => Err(PersistitError::InvalidPageAddress(format!(
                "page {} never written in volume {}",
                page, self.name
            ))),
        }
    }

    fn write_page(&self, page: PageAddress, buf: &[u8]) -> Result<()> {
        let mut pages = self.pages.lock().unwrap();
        pages.insert(page, buf.to_vec());
        self.next_page.fetch_max(page + 1, Ordering::AcqRel);
        Ok(())
    }

    fn extend(&self, to_pages: PageAddress) -> Result<()> {
        self.next_page.fetch_max(to_pages, Ordering::AcqRel);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn memory_volume_round_trips_a_page() {
        let volume = MemoryVolume::new("v1", 16, false);
        volume.write_page(5, &[9u8; 16]).unwrap();
        let mut buf = vec![0u8; 16];
        volume.read_page(5, &mut buf).unwrap();
        assert_eq!(buf, vec![9u8; 16]);
        assert_eq!(volume.next_available_page(), 6);
    }

    #[test]
    fn memory_volume_unwritten_page_is_invalid_address() {
        let volume = MemoryVolume::new("v1", 16, false);
        let mut buf = vec![0u8; 16];
        let err = volume.read_page(0, &mut buf).unwrap_err();
        assert!(matches!(err, PersistitError::InvalidPageAddress(_)));
    }

    #[test]
    fn memory_volume_ids_are_distinct() {
        let a = MemoryVolume::new("a", 16, false);
        let b = MemoryVolume::new("b", 16, false);
        assert_ne!(a.id(), b.id());
    }

    #[test]
    fn file_volume_round_trips_across_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("v1.db");

        {
            let volume = FileVolume::create(1, "v1", &path, 16, false).unwrap();
            volume.write_page(2, &[3u8; 16]).unwrap();
            assert_eq!(volume.next_available_page(), 3);
        }

        let reopened = FileVolume::create(1, "v1", &path, 16, false).unwrap();
        assert_eq!(reopened.next_available_page(), 3);
        let mut buf = vec![0u8; 16];
        reopened.read_page(2, &mut buf).unwrap();
        assert_eq!(buf, vec![3u8; 16]);
    }

    #[test]
    fn file_volume_rejects_wrong_sized_buffer() {
        let dir = tempfile::tempdir().unwrap();
        let volume = FileVolume::create(1, "v1", dir.path().join("v1.db"), 16, false).unwrap();
        let err = volume.write_page(0, &[0u8; 8]).unwrap_err();
        assert!(matches!(err, PersistitError::InvalidPageStructure(_)));
    }

    #[test]
    fn file_volume_extend_grows_next_available_page() {
        let dir = tempfile::tempdir().unwrap();
        let volume = FileVolume::create(1, "v1", dir.path().join("v1.db"), 16, false).unwrap();
        volume.extend(10).unwrap();
        assert_eq!(volume.next_available_page(), 10);
    }
}

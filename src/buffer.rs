//! A fixed-size page image backed by a `SharedResource` (spec §4.2). Links
//! to neighboring buffers in the pool's hash/LRU/dirty lists are modeled as
//! plain array indices with a `NONE` sentinel rather than nullable pointers
//! — spec §9's "arena + index" redesign note, replacing the teacher's
//! `Rc<RefCell<_>>` page graph (`src/btree/buffer_pool.rs`) which this spec
//! explicitly asks us not to transliterate.

use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};

use bytes::BytesMut;
use parking_lot::Mutex;

use crate::error::Result;
use crate::shared_resource::{
    SharedResource, ClaimId, STATUS_DIRTY, STATUS_FIXED, STATUS_TEMPORARY, STATUS_TOUCHED,
    STATUS_VALID,
};
use crate::timestamp::Timestamp;
use crate::volume::{PageAddress, Volume};

pub const NONE: usize = usize::MAX;

/// Identity + list-membership state mutated only while the owning bucket's
/// lock is held (spec §5: "a thread may hold at most one [bucket lock] at
/// a time").
pub struct BufferLinks {
    pub volume_id: i64,
    pub page_address: PageAddress,
    /// Intrusive singly-linked hash chain within this buffer's bucket-local
    /// hash slot. The LRU/invalid/perm/dirty/urgent lists themselves are
    /// held as plain `VecDeque<usize>`s on the owning `Bucket` — see
    /// `buffer_pool.rs` — since those are mutated wholesale under the
    /// bucket lock and a `VecDeque` of indices is simpler and no less
    /// faithful to the "arena + index" redesign than five more intrusive
    /// link fields would be.
    pub next_hash: usize,
}

impl BufferLinks {
    fn new() -> Self {
        BufferLinks {
            volume_id: 0,
            page_address: 0,
            next_hash: NONE,
        }
    }
}

pub struct Buffer {
    pub index: usize,
    pub page_size: usize,
    pub resource: SharedResource,
    pub links: Mutex<BufferLinks>,
    pub bytes: Mutex<BytesMut>,
    write_timestamp: AtomicU64,
    /// -1 until the buffer is first installed for a real volume.
    volume_id_hint: AtomicI64,
}

impl Buffer {
    pub fn new(index: usize, page_size: usize) -> Self {
        Buffer {
            index,
            page_size,
            resource: SharedResource::new(),
            links: Mutex::new(BufferLinks::new()),
            bytes: Mutex::new(BytesMut::zeroed(page_size)),
            write_timestamp: AtomicU64::new(0),
            volume_id_hint: AtomicI64::new(-1),
        }
    }

    pub fn page_id(&self) -> (i64, PageAddress) {
        let links = self.links.lock();
        (links.volume_id, links.page_address)
    }

    pub fn write_timestamp(&self) -> Timestamp {
        self.write_timestamp.load(Ordering::Acquire)
    }

    pub fn set_write_timestamp(&self, ts: Timestamp) {
        self.write_timestamp.store(ts, Ordering::Release);
        self.volume_id_hint
            .store(self.links.lock().volume_id, Ordering::Release);
    }

    pub fn is_valid(&self) -> bool {
        self.resource.test_bit(STATUS_VALID)
    }
    pub fn is_dirty(&self) -> bool {
        self.resource.test_bit(STATUS_DIRTY)
    }
    pub fn is_temporary(&self) -> bool {
        self.resource.test_bit(STATUS_TEMPORARY)
    }
    pub fn is_fixed(&self) -> bool {
        self.resource.test_bit(STATUS_FIXED)
    }
    pub fn mark_touched(&self) {
        self.resource.set_bit(STATUS_TOUCHED);
    }

    /// Read the page from `volume`. Caller must hold the writer claim;
    /// on failure the buffer is marked invalid (spec §4.2).
    pub fn load(&self, claimant: ClaimId, volume: &dyn Volume, page: PageAddress) -> Result<()> {
        debug_assert!(self.resource.owner() == Some(claimant) && self.resource.is_writer_held());
        let mut bytes = self.bytes.lock();
        match volume.read_page(page, &mut bytes) {
            Ok(()) => {
                self.resource.set_bit(STATUS_VALID);
                Ok(())
            }
            Err(e) => {
                self.resource.clear_bit(STATUS_VALID);
                Err(e)
            }
        }
    }

    /// Zero-initialize an unallocated page (spec §4.3 step 6, "not
    /// `want_read`" branch).
    pub fn zero_fill(&self) {
        let mut bytes = self.bytes.lock();
        bytes.iter_mut().for_each(|b| *b = 0);
        self.resource.set_bit(STATUS_VALID);
    }

    /// Zero the unused middle of the page before journaling, for
    /// compressibility and determinism (spec §4.2).
    pub fn clear_slack(&self, left_size: usize) {
        let mut bytes = self.bytes.lock();
        let len = bytes.len();
        if left_size < len {
            // Keep `left_size` header bytes and the final 0 trailing bytes
            // (no meaningful tail for this stand-in page format); zero the
            // rest.
            for b in bytes[left_size..].iter_mut() {
                *b = 0;
            }
        }
    }

    /// Write the page image to `volume` directly (used by tests and by
    /// anything that bypasses the journal). The journal's own `PA` record
    /// writer reads `self.bytes` directly instead of calling this.
    pub fn write_to_volume(&self, volume: &dyn Volume, page: PageAddress) -> Result<()> {
        let bytes = self.bytes.lock();
        volume.write_page(page, &bytes)
    }

    /// Unsynchronized snapshot for diagnostics; may be torn under
    /// concurrent mutation (spec §4.2 `copy()`).
    pub fn copy_unsynchronized(&self) -> Vec<u8> {
        self.bytes.lock().to_vec()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::volume::MemoryVolume;
    use std::time::Duration;

    #[test]
    fn fresh_buffer_is_invalid_and_untouched() {
        let buf = Buffer::new(0, 4096);
        assert!(!buf.is_valid());
        assert!(!buf.is_dirty());
        assert_eq!(buf.write_timestamp(), 0);
        assert_eq!(buf.page_id(), (0, 0));
    }

    #[test]
    fn load_success_marks_valid_and_copies_bytes() {
        let volume = MemoryVolume::new("v", 16, false);
        volume.write_page(3, &[7u8; 16]).unwrap();

        let buf = Buffer::new(0, 16);
        let claim = buf.resource.claim(1, true, Duration::ZERO);
        assert!(claim);
        buf.load(1, &volume, 3).unwrap();

        assert!(buf.is_valid());
        assert_eq!(buf.copy_unsynchronized(), vec![7u8; 16]);
    }

    #[test]
    fn load_failure_clears_valid_bit() {
        let volume = MemoryVolume::new("v", 16, false);
        let buf = Buffer::new(0, 16);
        buf.resource.set_bit(STATUS_VALID);
        buf.resource.claim(1, true, Duration::ZERO);

        // Page 9 was never written, so read_page errors.
        let result = buf.load(1, &volume, 9);
        assert!(result.is_err());
        assert!(!buf.is_valid());
    }

    #[test]
    fn zero_fill_clears_bytes_and_marks_valid() {
        let buf = Buffer::new(0, 8);
        buf.bytes.lock().iter_mut().for_each(|b| *b = 0xFF);
        buf.zero_fill();
        assert!(buf.is_valid());
        assert_eq!(buf.copy_unsynchronized(), vec![0u8; 8]);
    }

    #[test]
    fn clear_slack_preserves_header_and_zeroes_rest() {
        let buf = Buffer::new(0, 8);
        buf.bytes.lock().iter_mut().for_each(|b| *b = 0xAA);
        buf.clear_slack(2);
        let bytes = buf.copy_unsynchronized();
        assert_eq!(&bytes[..2], &[0xAA, 0xAA]);
        assert_eq!(&bytes[2..], &[0u8; 6]);
    }

    #[test]
    fn write_to_volume_round_trips() {
        let volume = MemoryVolume::new("v", 8, false);
        let buf = Buffer::new(0, 8);
        buf.bytes.lock().iter_mut().enumerate().for_each(|(i, b)| *b = i as u8);
        buf.write_to_volume(&volume, 2).unwrap();

        let mut out = vec![0u8; 8];
        volume.read_page(2, &mut out).unwrap();
        assert_eq!(out, (0..8).collect::<Vec<u8>>());
    }

    #[test]
    fn set_write_timestamp_records_owning_volume() {
        let buf = Buffer::new(0, 4);
        buf.links.lock().volume_id = 42;
        buf.set_write_timestamp(100);
        assert_eq!(buf.write_timestamp(), 100);
        assert_eq!(buf.volume_id_hint.load(Ordering::Acquire), 42);
    }
}

//! The index map: header + record map + extension table.
//!
//! A map is the in-memory index for one mailbox. It is reference-counted
//! and shared read-only between views; the copy-on-write discipline is:
//! clone the map (not the record map) when the map itself is shared, fork
//! the record map when the record arena must become private. The map also
//! mirrors its serialized header in `hdr_copy_buf`, which is what gets
//! written back to a mapped byte region at the end of a sync.

use std::cell::RefCell;
use std::rc::Rc;
use std::sync::OnceLock;

use maildex_error::{IndexError, Result};
use maildex_types::{
    INDEX_BASE_HEADER_SIZE, IndexHeader, IndexHeaderFlags, IndexRecord, MailFlags,
};

use crate::ext::MapExtension;
use crate::rec_map::{RecMapRef, RecordMap};

/// Shared handle to an index map.
pub type MapRef = Rc<RefCell<IndexMap>>;

/// Where a map's bytes live.
#[derive(Debug, Clone)]
pub enum MapResidence {
    /// Private growable memory.
    Memory,
    /// Backed by a mapped byte region; the header is written back into the
    /// region at sync end as long as the map stays mapped.
    Mapped(Rc<RefCell<Vec<u8>>>),
}

/// In-memory index map for one mailbox.
#[derive(Debug)]
pub struct IndexMap {
    /// The live, typed header.
    pub hdr: IndexHeader,
    /// Serialized header mirror (`header_size` bytes: base + ext headers).
    pub(crate) hdr_copy_buf: Vec<u8>,
    rec_map: RecMapRef,
    residence: MapResidence,
    /// Extensions registered in this map by EXT_INTRO records.
    pub(crate) extensions: Vec<MapExtension>,
    /// Keyword names; bit positions in the keywords extension bitmap.
    pub(crate) keywords: Vec<String>,
}

impl IndexMap {
    /// Allocate a fresh, empty in-memory map.
    #[must_use]
    pub fn create(indexid: u32) -> MapRef {
        let hdr = IndexHeader::fresh(indexid);
        let hdr_copy_buf = hdr.to_bytes().to_vec();
        let rec_map = RecordMap::new_ref();
        let map = Rc::new(RefCell::new(Self {
            hdr,
            hdr_copy_buf,
            rec_map: rec_map.clone(),
            residence: MapResidence::Memory,
            extensions: Vec::new(),
            keywords: Vec::new(),
        }));
        rec_map.borrow_mut().register_map(&map);
        map
    }

    /// Open a map over a mapped byte region (header + record area).
    ///
    /// The region stands in for an mmap'd index file: records are read out
    /// of it once, and the header is written back into it at sync end until
    /// the map moves to private memory.
    pub fn open_from_region(region: Rc<RefCell<Vec<u8>>>) -> Result<MapRef> {
        let (hdr, hdr_copy_buf, records) = {
            let bytes = region.borrow();
            let hdr = IndexHeader::from_bytes(&bytes).ok_or_else(|| IndexError::ShortRead {
                expected: INDEX_BASE_HEADER_SIZE as usize,
                actual: bytes.len(),
            })?;
            let header_size = hdr.header_size as usize;
            if header_size < INDEX_BASE_HEADER_SIZE as usize || bytes.len() < header_size {
                return Err(IndexError::invalid_header(
                    "<region>",
                    format!("header_size {header_size} out of range"),
                ));
            }
            let record_area = &bytes[header_size..];
            let record_size = hdr.record_size as usize;
            if record_size < 8 {
                return Err(IndexError::invalid_header(
                    "<region>",
                    format!("record_size {record_size} too small"),
                ));
            }
            let count = record_area.len() / record_size;
            if (hdr.messages_count as usize) > count {
                return Err(IndexError::invalid_header(
                    "<region>",
                    format!(
                        "messages_count {} exceeds {count} mapped records",
                        hdr.messages_count
                    ),
                ));
            }
            (
                hdr,
                bytes[..header_size].to_vec(),
                record_area[..count * record_size].to_vec(),
            )
        };

        let rec_map = RecordMap::new_ref();
        {
            let mut rm = rec_map.borrow_mut();
            let record_size = hdr.record_size;
            for chunk in records.chunks_exact(record_size as usize) {
                let rec = IndexRecord::from_bytes(chunk).expect("record_size checked above");
                rm.append(&rec, record_size);
                // Keep the full extension bytes, not just the base portion.
                let seq = rm.records_count();
                rm.record_mut(seq, record_size).copy_from_slice(chunk);
            }
        }
        let map = Rc::new(RefCell::new(Self {
            hdr,
            hdr_copy_buf,
            rec_map: rec_map.clone(),
            residence: MapResidence::Mapped(region),
            extensions: Vec::new(),
            keywords: Vec::new(),
        }));
        rec_map.borrow_mut().register_map(&map);
        map.borrow()
            .check_header()
            .map_err(|detail| IndexError::invalid_header("<region>", detail))?;
        Ok(map)
    }

    /// Clone the map (header, header copy, extension table, keywords) while
    /// sharing the record map. The clone is registered for counter fan-out.
    #[must_use]
    pub fn clone_separate(this: &MapRef) -> MapRef {
        let src = this.borrow();
        let map = Rc::new(RefCell::new(Self {
            hdr: src.hdr.clone(),
            hdr_copy_buf: src.hdr_copy_buf.clone(),
            rec_map: src.rec_map.clone(),
            residence: src.residence.clone(),
            extensions: src.extensions.clone(),
            keywords: src.keywords.clone(),
        }));
        src.rec_map.borrow_mut().register_map(&map);
        map
    }

    /// Fork the record map so no other index map shares it.
    pub fn fork_rec_map(this: &MapRef) {
        let old = this.borrow().rec_map.clone();
        let forked = Rc::new(RefCell::new(old.borrow().clone_records()));
        old.borrow_mut().unregister_map(this);
        forked.borrow_mut().register_map(this);
        this.borrow_mut().rec_map = forked;
    }

    /// Drop the mapped-region backing; the map now lives purely in memory
    /// and is no longer written back at sync end.
    pub fn move_to_memory(&mut self) {
        self.residence = MapResidence::Memory;
    }

    /// Whether the map is still backed by a mapped region.
    #[must_use]
    pub fn is_mapped(&self) -> bool {
        matches!(self.residence, MapResidence::Mapped(_))
    }

    /// The mapped backing region, if any.
    #[must_use]
    pub fn mapped_region(&self) -> Option<Rc<RefCell<Vec<u8>>>> {
        match &self.residence {
            MapResidence::Mapped(region) => Some(region.clone()),
            MapResidence::Memory => None,
        }
    }

    /// The shared record map handle.
    #[must_use]
    pub fn rec_map(&self) -> &RecMapRef {
        &self.rec_map
    }

    /// Decode the base record at 1-based `seq`.
    #[must_use]
    pub fn record_at(&self, seq: u32) -> IndexRecord {
        self.rec_map.borrow().record_at(seq, self.hdr.record_size)
    }

    /// Copy out the full record bytes (base + extension area) at `seq`.
    #[must_use]
    pub fn record_bytes_at(&self, seq: u32) -> Vec<u8> {
        self.rec_map
            .borrow()
            .record(seq, self.hdr.record_size)
            .to_vec()
    }

    fn first_seq_at_or_above(&self, uid: u32) -> u32 {
        let rm = self.rec_map.borrow();
        let rs = self.hdr.record_size;
        let mut lo = 1u32;
        let mut hi = self.hdr.messages_count;
        while lo <= hi {
            let mid = lo + (hi - lo) / 2;
            if rm.uid_at(mid, rs) < uid {
                lo = mid + 1;
            } else {
                if mid == 1 {
                    return 1;
                }
                hi = mid - 1;
            }
        }
        lo
    }

    /// Resolve a UID to its 1-based sequence, if present.
    #[must_use]
    pub fn lookup_seq(&self, uid: u32) -> Option<u32> {
        let seq = self.first_seq_at_or_above(uid);
        if seq > self.hdr.messages_count {
            return None;
        }
        (self.record_at(seq).uid == uid).then_some(seq)
    }

    /// Resolve an inclusive UID range to an inclusive sequence range,
    /// clamping to the messages present. Returns `None` when no message
    /// falls inside the range.
    #[must_use]
    pub fn lookup_seq_range(&self, uid1: u32, uid2: u32) -> Option<(u32, u32)> {
        if self.hdr.messages_count == 0 || uid1 > uid2 {
            return None;
        }
        let seq1 = self.first_seq_at_or_above(uid1);
        if seq1 > self.hdr.messages_count {
            return None;
        }
        let mut seq2 = self.first_seq_at_or_above(uid2.saturating_add(1));
        seq2 -= 1;
        if seq2 < seq1 {
            return None;
        }
        Some((seq1, seq2))
    }

    /// Serialize the live header into the header-copy buffer.
    pub fn sync_hdr_copy(&mut self) {
        let base = self.hdr.to_bytes();
        debug_assert!(self.hdr_copy_buf.len() >= base.len());
        self.hdr_copy_buf[..base.len()].copy_from_slice(&base);
    }

    /// Write the header-copy buffer back into the mapped region, if the map
    /// is still mapped.
    pub fn write_back(&self) {
        if let MapResidence::Mapped(region) = &self.residence {
            let mut bytes = region.borrow_mut();
            let len = self.hdr_copy_buf.len();
            if bytes.len() < len {
                bytes.resize(len, 0);
            }
            bytes[..len].copy_from_slice(&self.hdr_copy_buf);
        }
    }

    /// Validate the header against the record map.
    ///
    /// Returns a human-readable description of the first violation.
    pub fn check_header(&self) -> std::result::Result<(), String> {
        let h = &self.hdr;
        let records_count = self.rec_map.borrow().records_count();
        if h.base_header_size < INDEX_BASE_HEADER_SIZE {
            return Err(format!("base_header_size {} too small", h.base_header_size));
        }
        if h.header_size < h.base_header_size {
            return Err(format!(
                "header_size {} below base_header_size {}",
                h.header_size, h.base_header_size
            ));
        }
        if self.hdr_copy_buf.len() != h.header_size as usize {
            return Err(format!(
                "header copy is {} bytes, header_size says {}",
                self.hdr_copy_buf.len(),
                h.header_size
            ));
        }
        if h.record_size < 8 {
            return Err(format!("record_size {} too small", h.record_size));
        }
        if h.next_uid == 0 {
            return Err("next_uid is 0".to_owned());
        }
        if h.messages_count > records_count {
            return Err(format!(
                "messages_count {} exceeds {records_count} records",
                h.messages_count
            ));
        }
        if h.seen_messages_count > h.messages_count {
            return Err(format!(
                "seen_messages_count {} exceeds messages_count {}",
                h.seen_messages_count, h.messages_count
            ));
        }
        if h.deleted_messages_count > h.messages_count {
            return Err(format!(
                "deleted_messages_count {} exceeds messages_count {}",
                h.deleted_messages_count, h.messages_count
            ));
        }
        if h.first_unseen_uid_lowwater > h.next_uid {
            return Err(format!(
                "first_unseen_uid_lowwater {} above next_uid {}",
                h.first_unseen_uid_lowwater, h.next_uid
            ));
        }
        if h.first_deleted_uid_lowwater > h.next_uid {
            return Err(format!(
                "first_deleted_uid_lowwater {} above next_uid {}",
                h.first_deleted_uid_lowwater, h.next_uid
            ));
        }
        if h.messages_count > 0 {
            let last_uid = self
                .rec_map
                .borrow()
                .uid_at(h.messages_count, h.record_size);
            if last_uid >= h.next_uid {
                return Err(format!("last uid {last_uid} >= next_uid {}", h.next_uid));
            }
        }
        Ok(())
    }

    /// Debug-time invariant walk over the finished map: strictly increasing
    /// UIDs, lowwater bounds, counter equality.
    ///
    /// Panics on violation. Skipped entirely when the
    /// `MAILDEX_DEBUG_IGNORE_INDEX_CORRUPTION` environment toggle is set.
    pub fn check(&self) {
        if corruption_checks_ignored() {
            return;
        }
        let h = &self.hdr;
        let rm = self.rec_map.borrow();
        assert!(h.messages_count <= rm.records_count());
        let mut seen = 0u32;
        let mut deleted = 0u32;
        let mut prev_uid = 0u32;
        for seq in 1..=h.messages_count {
            let rec = rm.record_at(seq, h.record_size);
            assert!(rec.uid > prev_uid, "uid order broken at seq {seq}");
            prev_uid = rec.uid;
            if rec.flags.contains(MailFlags::DELETED) {
                assert!(rec.uid >= h.first_deleted_uid_lowwater);
                deleted += 1;
            }
            if rec.flags.contains(MailFlags::SEEN) {
                seen += 1;
            } else {
                assert!(rec.uid >= h.first_unseen_uid_lowwater);
            }
        }
        assert_eq!(deleted, h.deleted_messages_count);
        assert_eq!(seen, h.seen_messages_count);
    }

    /// The serialized header mirror (`header_size` bytes).
    #[must_use]
    pub fn hdr_copy_buf(&self) -> &[u8] {
        &self.hdr_copy_buf
    }

    /// Whether the map carries the HAVE_DIRTY header bit.
    #[must_use]
    pub fn have_dirty(&self) -> bool {
        self.hdr.flags.contains(IndexHeaderFlags::HAVE_DIRTY)
    }

    /// The keyword names known to this map, in bit order.
    #[must_use]
    pub fn keywords(&self) -> &[String] {
        &self.keywords
    }

    /// The extensions registered in this map.
    #[must_use]
    pub fn extensions(&self) -> &[MapExtension] {
        &self.extensions
    }
}

/// Whether the debug corruption checker is disabled via the environment.
/// Read once at first use.
pub(crate) fn corruption_checks_ignored() -> bool {
    static IGNORED: OnceLock<bool> = OnceLock::new();
    *IGNORED.get_or_init(|| {
        std::env::var_os("MAILDEX_DEBUG_IGNORE_INDEX_CORRUPTION").is_some()
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn map_with_uids(uids: &[u32]) -> MapRef {
        let map = IndexMap::create(1);
        {
            let m = map.borrow();
            let mut rm = m.rec_map().borrow_mut();
            for &uid in uids {
                rm.append(&IndexRecord::new(uid, MailFlags::empty()), 8);
            }
        }
        {
            let mut m = map.borrow_mut();
            m.hdr.messages_count = uids.len() as u32;
            m.hdr.next_uid = uids.last().map_or(1, |u| u + 1);
        }
        map
    }

    #[test]
    fn lookup_seq_exact() {
        let map = map_with_uids(&[10, 12, 15, 20]);
        let m = map.borrow();
        assert_eq!(m.lookup_seq(10), Some(1));
        assert_eq!(m.lookup_seq(15), Some(3));
        assert_eq!(m.lookup_seq(11), None);
        assert_eq!(m.lookup_seq(21), None);
    }

    #[test]
    fn lookup_seq_range_clamps() {
        let map = map_with_uids(&[10, 12, 15, 20]);
        let m = map.borrow();
        assert_eq!(m.lookup_seq_range(11, 16), Some((2, 3)));
        assert_eq!(m.lookup_seq_range(1, 100), Some((1, 4)));
        assert_eq!(m.lookup_seq_range(13, 14), None);
        assert_eq!(m.lookup_seq_range(21, 30), None);
        assert_eq!(m.lookup_seq_range(15, 15), Some((3, 3)));
    }

    #[test]
    fn lookup_on_empty_map() {
        let map = IndexMap::create(1);
        assert_eq!(map.borrow().lookup_seq(1), None);
        assert_eq!(map.borrow().lookup_seq_range(1, 10), None);
    }

    #[test]
    fn clone_separate_shares_rec_map() {
        let map = map_with_uids(&[1, 2]);
        let clone = IndexMap::clone_separate(&map);
        assert!(Rc::ptr_eq(
            map.borrow().rec_map(),
            clone.borrow().rec_map()
        ));
        // Both maps are registered for fan-out.
        let shared = map.borrow().rec_map().borrow_mut().shared_maps();
        assert_eq!(shared.len(), 2);
    }

    #[test]
    fn fork_rec_map_isolates_records() {
        let map = map_with_uids(&[1, 2]);
        let clone = IndexMap::clone_separate(&map);
        IndexMap::fork_rec_map(&clone);
        assert!(!Rc::ptr_eq(
            map.borrow().rec_map(),
            clone.borrow().rec_map()
        ));
        {
            let c = clone.borrow();
            let mut rm = c.rec_map().borrow_mut();
            rm.set_flags_at(1, 8, MailFlags::SEEN);
        }
        assert!(map.borrow().record_at(1).flags.is_empty());
        // The old rec_map no longer fans out to the forked map.
        let shared = map.borrow().rec_map().borrow_mut().shared_maps();
        assert_eq!(shared.len(), 1);
    }

    #[test]
    fn check_header_catches_count_breaks() {
        let map = map_with_uids(&[1, 2]);
        map.borrow_mut().hdr.seen_messages_count = 3;
        assert!(map.borrow().check_header().is_err());
        map.borrow_mut().hdr.seen_messages_count = 0;
        assert!(map.borrow().check_header().is_ok());
        map.borrow_mut().hdr.messages_count = 5;
        assert!(map.borrow().check_header().is_err());
    }

    #[test]
    fn open_from_region_round_trip() {
        let source = map_with_uids(&[3, 7]);
        source.borrow_mut().hdr.seen_messages_count = 0;
        source.borrow_mut().sync_hdr_copy();
        let mut bytes = source.borrow().hdr_copy_buf.clone();
        for seq in 1..=2 {
            bytes.extend_from_slice(&source.borrow().record_bytes_at(seq));
        }
        let region = Rc::new(RefCell::new(bytes));
        let map = IndexMap::open_from_region(region.clone()).expect("open");
        {
            let m = map.borrow();
            assert!(m.is_mapped());
            assert_eq!(m.hdr.messages_count, 2);
            assert_eq!(m.record_at(2).uid, 7);
        }
        // Write-back lands header changes in the region.
        map.borrow_mut().hdr.next_uid = 50;
        map.borrow_mut().sync_hdr_copy();
        map.borrow().write_back();
        let reparsed = IndexHeader::from_bytes(&region.borrow()).expect("parse");
        assert_eq!(reparsed.next_uid, 50);
    }

    #[test]
    fn open_from_region_rejects_bad_header() {
        let region = Rc::new(RefCell::new(vec![0u8; 16]));
        assert!(IndexMap::open_from_region(region).is_err());
    }
}

//! The record map: a flat arena of fixed-size message records.
//!
//! Sequence numbers are 1-based and index directly into the arena. UID order
//! is strictly increasing with sequence. A record map is shared
//! copy-on-write between index maps; it keeps weak back-references to every
//! sharing map so flag changes can fan counter updates out to all of them.

use std::cell::RefCell;
use std::rc::{Rc, Weak};

use maildex_types::{INDEX_RECORD_SIZE, IndexRecord, MailFlags, SeqRangeSet};

use crate::map::{IndexMap, MapRef};
use crate::modseq::ModseqTracking;

/// Shared handle to a record map.
pub type RecMapRef = Rc<RefCell<RecordMap>>;

/// Flat array of fixed-size message records plus sharing bookkeeping.
#[derive(Debug, Default)]
pub struct RecordMap {
    buffer: Vec<u8>,
    records_count: u32,
    last_appended_uid: u32,
    maps: Vec<Weak<RefCell<IndexMap>>>,
    pub(crate) modseq: Option<ModseqTracking>,
}

impl RecordMap {
    /// Create an empty record map behind a shared handle.
    #[must_use]
    pub fn new_ref() -> RecMapRef {
        Rc::new(RefCell::new(Self::default()))
    }

    /// Number of records in the arena. May exceed the owning map's
    /// `messages_count` while appends from an uncommitted transaction are
    /// folded in.
    #[must_use]
    pub const fn records_count(&self) -> u32 {
        self.records_count
    }

    /// UID of the most recently appended record, or 0 if none.
    #[must_use]
    pub const fn last_appended_uid(&self) -> u32 {
        self.last_appended_uid
    }

    /// Raw bytes of the record at 1-based `seq`.
    #[must_use]
    pub fn record(&self, seq: u32, record_size: u32) -> &[u8] {
        let rs = record_size as usize;
        let start = (seq as usize - 1) * rs;
        &self.buffer[start..start + rs]
    }

    /// Mutable raw bytes of the record at 1-based `seq`.
    pub fn record_mut(&mut self, seq: u32, record_size: u32) -> &mut [u8] {
        let rs = record_size as usize;
        let start = (seq as usize - 1) * rs;
        &mut self.buffer[start..start + rs]
    }

    /// Decode the base portion of the record at `seq`.
    #[must_use]
    pub fn record_at(&self, seq: u32, record_size: u32) -> IndexRecord {
        IndexRecord::from_bytes(self.record(seq, record_size))
            .expect("record_size is at least the base record size")
    }

    /// UID of the record at `seq`.
    #[must_use]
    pub fn uid_at(&self, seq: u32, record_size: u32) -> u32 {
        self.record_at(seq, record_size).uid
    }

    /// Overwrite the flag byte of the record at `seq`.
    pub fn set_flags_at(&mut self, seq: u32, record_size: u32, flags: MailFlags) {
        self.record_mut(seq, record_size)[4] = flags.bits();
    }

    /// Append a record at the end of the arena, zero-filling the extension
    /// bytes past the base portion.
    pub fn append(&mut self, rec: &IndexRecord, record_size: u32) {
        let rs = record_size as usize;
        debug_assert!(rs >= INDEX_RECORD_SIZE);
        let start = self.records_count as usize * rs;
        self.buffer.resize(start + rs, 0);
        self.buffer[start..start + INDEX_RECORD_SIZE].copy_from_slice(&rec.to_bytes());
        self.buffer[start + INDEX_RECORD_SIZE..start + rs].fill(0);
        self.records_count += 1;
        self.last_appended_uid = rec.uid;
    }

    /// Remove the records in `ranges` with a single left-to-right pass,
    /// shifting survivors down to close the gaps. Moves are always leftward,
    /// so overlapping source and destination regions are fine.
    ///
    /// Returns the number of records removed. The parallel modseq vector,
    /// when present, is reshaped by the same gap-closing pass.
    pub fn compact(&mut self, ranges: &SeqRangeSet, record_size: u32) -> u32 {
        if ranges.is_empty() {
            return 0;
        }
        let rs = record_size as usize;
        let orig_count = self.records_count;
        let mut dest_seq = 1u32;
        let mut prev_seq2 = 0u32;
        let mut removed = 0u32;

        for range in ranges.iter() {
            debug_assert!(range.seq1 > prev_seq2);
            debug_assert!(range.seq2 <= orig_count);
            if prev_seq2 + 1 <= range.seq1 - 1 {
                let move_count = range.seq1 - 1 - prev_seq2;
                if prev_seq2 + 1 != dest_seq {
                    let src = prev_seq2 as usize * rs;
                    let dst = (dest_seq as usize - 1) * rs;
                    self.buffer
                        .copy_within(src..src + move_count as usize * rs, dst);
                }
                dest_seq += move_count;
            }
            removed += range.count();
            prev_seq2 = range.seq2;
        }
        if orig_count > prev_seq2 {
            let move_count = orig_count - prev_seq2;
            let src = prev_seq2 as usize * rs;
            let dst = (dest_seq as usize - 1) * rs;
            if src != dst {
                self.buffer
                    .copy_within(src..src + move_count as usize * rs, dst);
            }
        }
        self.records_count -= removed;
        self.buffer.truncate(self.records_count as usize * rs);

        if let Some(modseq) = &mut self.modseq {
            modseq.remove_seqs(ranges);
        }
        removed
    }

    /// Re-layout every record from `old_record_size` to `new_record_size`
    /// strides. `moves` lists `(old_offset, new_offset, len)` regions to
    /// carry over per record; everything else is zero-filled.
    pub(crate) fn rebuild(
        &mut self,
        old_record_size: u32,
        new_record_size: u32,
        moves: &[(u32, u32, u32)],
    ) {
        let old_rs = old_record_size as usize;
        let new_rs = new_record_size as usize;
        let count = self.records_count as usize;
        let mut new_buf = vec![0u8; count * new_rs];
        for i in 0..count {
            let old = &self.buffer[i * old_rs..(i + 1) * old_rs];
            let new = &mut new_buf[i * new_rs..(i + 1) * new_rs];
            for &(src, dst, len) in moves {
                let (src, dst, len) = (src as usize, dst as usize, len as usize);
                new[dst..dst + len].copy_from_slice(&old[src..src + len]);
            }
        }
        self.buffer = new_buf;
    }

    /// Fork: a private copy of the arena and modseq vector, with no sharing
    /// maps registered yet.
    #[must_use]
    pub fn clone_records(&self) -> Self {
        Self {
            buffer: self.buffer.clone(),
            records_count: self.records_count,
            last_appended_uid: self.last_appended_uid,
            maps: Vec::new(),
            modseq: self.modseq.clone(),
        }
    }

    /// Register an index map as sharing this record map.
    pub(crate) fn register_map(&mut self, map: &MapRef) {
        self.maps.push(Rc::downgrade(map));
    }

    /// Unregister an index map (it forked or was retired).
    pub(crate) fn unregister_map(&mut self, map: &MapRef) {
        self.maps
            .retain(|w| w.as_ptr() != Rc::as_ptr(map) && w.strong_count() > 0);
    }

    /// Every live index map sharing this record map, pruning dead entries.
    pub(crate) fn shared_maps(&mut self) -> Vec<MapRef> {
        self.maps.retain(|w| w.strong_count() > 0);
        self.maps.iter().filter_map(Weak::upgrade).collect()
    }
}

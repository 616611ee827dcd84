//! The record applier: decode one transaction record and mutate the map.
//!
//! [`SyncMapContext`] is the per-sync state machine: the current map, the
//! extension context established by the latest EXT_INTRO, the lazily
//! initialized expunge handlers, and the corruption flag. `sync_record`
//! dispatches on the record type, validates sizes and padding, and applies
//! the mutation. Corruption aborts the current record only; the sync driver
//! keeps replaying and schedules a repair pass at the end.

use std::rc::Rc;

use maildex_types::{
    EXPUNGE_GUID_ENTRY_SIZE, EXPUNGE_RANGE_SIZE, EXT_ATOMIC_INC_SIZE, EXT_INTRO_BASE_SIZE,
    ExtAtomicInc, ExtIntro, ExtReset, FLAG_UPDATE_SIZE, FlagUpdate, HdrUpdateEntry, INDEX_RECORD_SIZE,
    IndexHeader, IndexHeaderFlags, IndexRecord, KEYWORD_RESET_ENTRY_SIZE, KeywordUpdate,
    MODSEQ_UPDATE_ENTRY_SIZE, MailFlags, ModseqUpdate, SeqRangeSet, TRANSACTION_HEADER_SIZE,
    TransactionHeader, TransactionType, pad4, read_u32,
};

use crate::counters;
use crate::index::{ExpungeHandler, Index, IndexOpenFlags};
use crate::log::LogPosition;
use crate::map::{IndexMap, MapRef};
use crate::modseq::{ModseqSetResult, ModseqSync};

/// Which caller is driving the sync; controls handler invocation and
/// whether the published map may be rebound.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncType {
    /// Syncing the index's own map from its tail offset.
    File,
    /// Syncing the index's map to the log head.
    Head,
    /// Syncing a view-private map; never rebinds the published pointer.
    View,
}

/// The current record was abandoned after corruption was recorded.
///
/// Not an error in the `Result`-propagation sense: the condition is already
/// logged and counted on the context, and the sync keeps going with the
/// next log record.
#[derive(Debug, Clone, Copy)]
pub struct RecordAborted;

/// Outcome of applying one transaction record (or one inner entry).
pub type ApplyResult = Result<(), RecordAborted>;

/// Per-sync state for the record applier.
pub struct SyncMapContext<'a> {
    pub(crate) index: &'a mut Index,
    pub(crate) map: MapRef,
    pub(crate) sync_type: SyncType,
    pub(crate) modseq: ModseqSync,
    /// Start position of the record currently being applied; at end of
    /// log, the end-of-log position.
    pub(crate) cur_pos: LogPosition,
    pub(crate) cur_ext_map_idx: Option<usize>,
    pub(crate) cur_ext_record_size: u32,
    pub(crate) cur_ext_ignore: bool,
    pub(crate) ext_intro_seq: u32,
    pub(crate) ext_intro_offset: u32,
    pub(crate) ext_intro_end_offset: u32,
    pub(crate) expunge_handlers: Vec<ExpungeHandler>,
    pub(crate) expunge_handlers_set: bool,
    pub(crate) errors: bool,
    pub(crate) unknown_extensions: Vec<String>,
}

impl<'a> SyncMapContext<'a> {
    /// Open a sync context over `map`.
    pub fn new(index: &'a mut Index, map: MapRef, sync_type: SyncType) -> Self {
        let modseq = ModseqSync::begin(index.modseq_enabled, &map);
        Self {
            index,
            map,
            sync_type,
            modseq,
            cur_pos: LogPosition { seq: 0, offset: 0 },
            cur_ext_map_idx: None,
            cur_ext_record_size: 0,
            cur_ext_ignore: false,
            ext_intro_seq: 0,
            ext_intro_offset: 0,
            ext_intro_end_offset: 0,
            expunge_handlers: Vec::new(),
            expunge_handlers_set: false,
            errors: false,
            unknown_extensions: Vec::new(),
        }
    }

    /// Whether any record hit corruption during this sync.
    #[must_use]
    pub const fn errors(&self) -> bool {
        self.errors
    }

    /// The map currently being mutated (possibly a replacement).
    #[must_use]
    pub fn map(&self) -> MapRef {
        self.map.clone()
    }

    /// Record a corruption condition: the sync continues, the driver
    /// schedules a repair pass at the end.
    pub(crate) fn set_corrupted(&mut self, detail: impl Into<String>) {
        let detail = detail.into();
        self.errors = true;
        tracing::error!(
            index = %self.index.filepath,
            seq = self.cur_pos.seq,
            offset = self.cur_pos.offset,
            "index corrupted during sync: {detail}"
        );
    }

    /// Close the context, handing borrowed registries back to the index.
    pub(crate) fn deinit(&mut self) {
        if self.expunge_handlers_set {
            self.index
                .expunge_handlers
                .append(&mut self.expunge_handlers);
            self.expunge_handlers_set = false;
        }
        if !self.unknown_extensions.is_empty() {
            tracing::debug!(
                index = %self.index.filepath,
                extensions = ?self.unknown_extensions,
                "sync saw unknown extensions"
            );
        }
    }

    // ── Copy-on-write primitives ─────────────────────────────────────

    /// Make sure the map is private to this sync and lives in memory.
    /// Clones the map (not the record map) when other holders share it.
    pub(crate) fn move_to_private_memory(&mut self) -> MapRef {
        if Rc::strong_count(&self.map) > 1 {
            let clone = IndexMap::clone_separate(&self.map);
            self.replace_map(clone);
        }
        if self.map.borrow().is_mapped() {
            self.map.borrow_mut().move_to_memory();
            self.modseq.map_replaced(&self.map);
        }
        self.map.clone()
    }

    /// A private map with a private record map: nothing else observes the
    /// record arena afterwards.
    pub(crate) fn get_atomic_map(&mut self) -> MapRef {
        self.move_to_private_memory();
        if Rc::strong_count(self.map.borrow().rec_map()) > 1 {
            IndexMap::fork_rec_map(&self.map);
        }
        self.modseq.map_replaced(&self.map);
        self.map.clone()
    }

    /// Swap the sync's current map. The retired map's log offsets are
    /// finalized first so a successor view can resume where it stopped.
    /// The index's published pointer is rebound at sync end for `FILE` and
    /// `HEAD` syncs; `VIEW` syncs never touch it.
    pub(crate) fn replace_map(&mut self, new_map: MapRef) {
        debug_assert!(!Rc::ptr_eq(&self.map, &new_map));
        self.update_log_offset_on(&self.map, false);
        self.map = new_map;
        self.modseq.map_replaced(&self.map);
    }

    /// Finalize `map`'s log offsets from the current log position.
    pub(crate) fn update_log_offset_on(&self, map: &MapRef, eol: bool) {
        let prev_seq = self.cur_pos.seq;
        let mut prev_offset = self.cur_pos.offset;
        if prev_seq == 0 {
            // Handling lost changes in view syncing.
            return;
        }
        let mut m = map.borrow_mut();
        if !eol {
            if prev_offset == self.ext_intro_end_offset && prev_seq == self.ext_intro_seq {
                // The previous record was an extension introduction and we
                // most likely got here from an extension reset. Another
                // view continuing the sync needs the intro, so back up to
                // its start. Not at end of log, or every sync would retry
                // the intro forever.
                prev_offset = self.ext_intro_offset;
            }
            m.hdr.log_file_seq = prev_seq;
        } else {
            debug_assert_eq!(self.index.log.borrow().head().file_seq, prev_seq);
            if m.hdr.log_file_seq != prev_seq {
                m.hdr.log_file_seq = prev_seq;
                m.hdr.log_file_tail_offset = 0;
            }
        }
        m.hdr.log_file_head_offset = prev_offset;
    }

    // ── Counter helpers ──────────────────────────────────────────────

    /// Counter update on the current map only.
    pub(crate) fn header_update_counts(&mut self, uid: u32, old: MailFlags, new: MailFlags) {
        let result = {
            let mut m = self.map.borrow_mut();
            if uid >= m.hdr.next_uid {
                Err(format!("uid {uid} >= next_uid {}", m.hdr.next_uid))
            } else {
                counters::update_counts(&mut m.hdr, old, new).map_err(str::to_owned)
            }
        };
        if let Err(detail) = result {
            self.set_corrupted(detail);
        }
    }

    /// Counter update fanned out to every map sharing the record map.
    pub(crate) fn header_update_counts_all(&mut self, uid: u32, old: MailFlags, new: MailFlags) {
        for detail in counters::update_counts_all(&self.map, uid, old, new) {
            self.set_corrupted(detail);
        }
    }

    // ── Record dispatch ──────────────────────────────────────────────

    /// Apply one transaction record to the map.
    pub fn sync_record(&mut self, hdr: &TransactionHeader, data: &[u8]) -> ApplyResult {
        let ty = hdr.tx_type;
        let masked = ty.masked();

        if masked == TransactionType::APPEND.bits() {
            if data.is_empty() || data.len() % INDEX_RECORD_SIZE != 0 {
                self.set_corrupted(format!("Append with invalid size {}", data.len()));
                return Err(RecordAborted);
            }
            for chunk in data.chunks_exact(INDEX_RECORD_SIZE) {
                let rec = IndexRecord::from_bytes(chunk).expect("chunk is record-sized");
                self.sync_append(&rec)?;
            }
            Ok(())
        } else if masked == TransactionType::EXPUNGE.bits()
            || masked == (TransactionType::EXPUNGE | TransactionType::EXPUNGE_PROT).bits()
        {
            if !ty.is_external() {
                // Simply a request for expunge.
                return Ok(());
            }
            if data.len() % EXPUNGE_RANGE_SIZE != 0 {
                self.set_corrupted(format!("Expunge with invalid size {}", data.len()));
                return Err(RecordAborted);
            }
            let mut seqs = SeqRangeSet::new();
            for chunk in data.chunks_exact(EXPUNGE_RANGE_SIZE) {
                let uid1 = read_u32(chunk, 0);
                let uid2 = read_u32(chunk, 4);
                if let Some((seq1, seq2)) = self.map.borrow().lookup_seq_range(uid1, uid2) {
                    seqs.add_range(seq1, seq2);
                }
            }
            self.sync_expunge(&seqs);
            Ok(())
        } else if masked == TransactionType::EXPUNGE_GUID.bits()
            || masked == (TransactionType::EXPUNGE_GUID | TransactionType::EXPUNGE_PROT).bits()
        {
            if !ty.is_external() {
                return Ok(());
            }
            if data.len() % EXPUNGE_GUID_ENTRY_SIZE != 0 {
                self.set_corrupted(format!("Expunge-guid with invalid size {}", data.len()));
                return Err(RecordAborted);
            }
            let mut seqs = SeqRangeSet::new();
            for chunk in data.chunks_exact(EXPUNGE_GUID_ENTRY_SIZE) {
                let uid = read_u32(chunk, 0);
                if uid == 0 {
                    self.set_corrupted("Expunge-guid for UID 0");
                    return Err(RecordAborted);
                }
                if let Some(seq) = self.map.borrow().lookup_seq(uid) {
                    seqs.add(seq);
                }
            }
            self.sync_expunge(&seqs);
            Ok(())
        } else if masked == TransactionType::FLAG_UPDATE.bits() {
            if data.len() % FLAG_UPDATE_SIZE != 0 {
                self.set_corrupted(format!("Flag update with invalid size {}", data.len()));
                return Err(RecordAborted);
            }
            for chunk in data.chunks_exact(FLAG_UPDATE_SIZE) {
                let update = FlagUpdate::from_bytes(chunk).expect("chunk is entry-sized");
                self.sync_flag_update(&update)?;
            }
            Ok(())
        } else if masked == TransactionType::HEADER_UPDATE.bits() {
            let mut i = 0;
            while i < data.len() {
                let Some((entry, advance)) = HdrUpdateEntry::parse16(&data[i..]) else {
                    self.set_corrupted("Header update: invalid record size");
                    return Err(RecordAborted);
                };
                self.sync_header_update(&entry)?;
                i += advance;
            }
            Ok(())
        } else if masked == TransactionType::EXT_INTRO.bits() {
            self.ext_intro_seq = self.cur_pos.seq;
            self.ext_intro_offset = self.cur_pos.offset;
            self.ext_intro_end_offset =
                self.cur_pos.offset + TRANSACTION_HEADER_SIZE as u32 + hdr.size;
            let mut i = 0;
            while i < data.len() {
                if i + EXT_INTRO_BASE_SIZE > data.len() {
                    // Should be just extra padding.
                    break;
                }
                let Some((intro, advance)) = ExtIntro::parse_entry(&data[i..]) else {
                    self.set_corrupted("Extension intro: invalid record size");
                    return Err(RecordAborted);
                };
                self.sync_ext_intro(&intro)?;
                i += advance;
            }
            Ok(())
        } else if masked == TransactionType::EXT_RESET.bits() {
            let Some(reset) = ExtReset::from_bytes(data) else {
                self.set_corrupted("Extension reset: invalid record size");
                return Err(RecordAborted);
            };
            self.sync_ext_reset(&reset)
        } else if masked == TransactionType::EXT_HDR_UPDATE.bits() {
            let mut i = 0;
            while i < data.len() {
                let Some((entry, advance)) = HdrUpdateEntry::parse16(&data[i..]) else {
                    self.set_corrupted("Extension hdr update: invalid record size");
                    return Err(RecordAborted);
                };
                self.sync_ext_hdr_update(&entry)?;
                i += advance;
            }
            Ok(())
        } else if masked == TransactionType::EXT_HDR_UPDATE32.bits() {
            let mut i = 0;
            while i < data.len() {
                let Some((entry, advance)) = HdrUpdateEntry::parse32(&data[i..]) else {
                    self.set_corrupted("Extension hdr update: invalid record size");
                    return Err(RecordAborted);
                };
                self.sync_ext_hdr_update(&entry)?;
                i += advance;
            }
            Ok(())
        } else if masked == TransactionType::EXT_REC_UPDATE.bits() {
            if self.cur_ext_map_idx.is_none() {
                self.set_corrupted("Extension record updated without intro prefix");
                return Err(RecordAborted);
            }
            if self.cur_ext_ignore {
                return Ok(());
            }
            // The record is padded to 32 bits in the transaction log.
            let stride = pad4(4 + self.cur_ext_record_size as usize);
            let mut i = 0;
            while i < data.len() {
                if i + stride > data.len() {
                    self.set_corrupted("Extension record update: invalid record size");
                    return Err(RecordAborted);
                }
                let uid = read_u32(data, i);
                let ext_data = &data[i + 4..i + 4 + self.cur_ext_record_size as usize];
                self.sync_ext_rec_update(uid, ext_data)?;
                i += stride;
            }
            Ok(())
        } else if masked == TransactionType::EXT_ATOMIC_INC.bits() {
            if self.cur_ext_map_idx.is_none() {
                self.set_corrupted("Extension record updated without intro prefix");
                return Err(RecordAborted);
            }
            if self.cur_ext_ignore {
                return Ok(());
            }
            if data.len() % EXT_ATOMIC_INC_SIZE != 0 {
                self.set_corrupted(format!("Atomic inc with invalid size {}", data.len()));
                return Err(RecordAborted);
            }
            for chunk in data.chunks_exact(EXT_ATOMIC_INC_SIZE) {
                let inc = ExtAtomicInc::from_bytes(chunk).expect("chunk is entry-sized");
                self.sync_ext_atomic_inc(&inc)?;
            }
            Ok(())
        } else if masked == TransactionType::KEYWORD_UPDATE.bits() {
            let Some(update) = KeywordUpdate::from_bytes(data) else {
                self.set_corrupted("Keyword update: invalid record size");
                return Err(RecordAborted);
            };
            self.sync_keyword_update(&update)
        } else if masked == TransactionType::KEYWORD_RESET.bits() {
            if data.len() % KEYWORD_RESET_ENTRY_SIZE != 0 {
                self.set_corrupted(format!("Keyword reset with invalid size {}", data.len()));
                return Err(RecordAborted);
            }
            let ranges: Vec<(u32, u32)> = data
                .chunks_exact(KEYWORD_RESET_ENTRY_SIZE)
                .map(|c| (read_u32(c, 0), read_u32(c, 4)))
                .collect();
            self.sync_keyword_reset(&ranges)
        } else if masked == TransactionType::MODSEQ_UPDATE.bits() {
            if data.len() % MODSEQ_UPDATE_ENTRY_SIZE != 0 {
                self.set_corrupted(format!("Modseq update with invalid size {}", data.len()));
                return Err(RecordAborted);
            }
            for chunk in data.chunks_exact(MODSEQ_UPDATE_ENTRY_SIZE) {
                let update = ModseqUpdate::from_bytes(chunk).expect("chunk is entry-sized");
                self.sync_modseq_update(&update)?;
            }
            Ok(())
        } else if masked == TransactionType::INDEX_DELETED.bits() {
            if !ty.is_external() {
                // The next sync finishes the deletion.
                self.index.index_delete_requested = true;
            }
            Ok(())
        } else if masked == TransactionType::INDEX_UNDELETED.bits() {
            self.index.index_delete_requested = false;
            Ok(())
        } else if masked == TransactionType::BOUNDARY.bits()
            || masked == TransactionType::ATTRIBUTE_UPDATE.bits()
        {
            Ok(())
        } else {
            self.set_corrupted(format!("Unknown transaction record type 0x{masked:x}"));
            Err(RecordAborted)
        }
    }

    // ── Individual record types ──────────────────────────────────────

    fn sync_append(&mut self, rec: &IndexRecord) -> ApplyResult {
        let next_uid = self.map.borrow().hdr.next_uid;
        if rec.uid < next_uid {
            self.set_corrupted(format!(
                "Append with UID {}, but next_uid = {next_uid}",
                rec.uid
            ));
            return Err(RecordAborted);
        }

        // Appending writes past the shared/mapped record area, so the map
        // must be private memory first.
        let map = self.move_to_private_memory();

        let (last_appended_uid, records_count, messages_count, record_size) = {
            let m = map.borrow();
            let rm = m.rec_map().borrow();
            (
                rm.last_appended_uid(),
                rm.records_count(),
                m.hdr.messages_count,
                m.hdr.record_size,
            )
        };

        let new_flags;
        if rec.uid <= last_appended_uid {
            // The record was already folded into the record map by an
            // earlier sync of a sibling map. Its flags may have changed
            // since; use the current ones so flag counters stay correct.
            if messages_count >= records_count {
                self.set_corrupted(format!(
                    "Append of existing UID {} but no hidden records",
                    rec.uid
                ));
                return Err(RecordAborted);
            }
            let existing = map.borrow().record_at(messages_count + 1);
            if existing.uid != rec.uid {
                self.set_corrupted(format!(
                    "Append of UID {} does not match existing record UID {}",
                    rec.uid, existing.uid
                ));
                return Err(RecordAborted);
            }
            new_flags = existing.flags;
        } else {
            {
                let m = map.borrow();
                m.rec_map().borrow_mut().append(rec, record_size);
            }
            self.modseq.append(&map);
            new_flags = rec.flags;
        }

        {
            let mut m = map.borrow_mut();
            m.hdr.messages_count += 1;
            m.hdr.next_uid = rec.uid + 1;
            if new_flags.contains(MailFlags::DIRTY)
                && !self.index.flags.contains(IndexOpenFlags::NO_DIRTY)
            {
                m.hdr.flags |= IndexHeaderFlags::HAVE_DIRTY;
            }
        }

        counters::update_lowwaters_all(&map, rec.uid, new_flags);
        self.header_update_counts(rec.uid, MailFlags::empty(), new_flags);
        Ok(())
    }

    fn sync_flag_update(&mut self, update: &FlagUpdate) -> ApplyResult {
        let Some((seq1, seq2)) = self
            .map
            .borrow()
            .lookup_seq_range(update.uid1, update.uid2)
        else {
            return Ok(());
        };

        if !update.is_internal() {
            self.modseq.update_flags(&self.map, seq1, seq2);
        }

        if update.add_flags.contains(MailFlags::DIRTY)
            && !self.index.flags.contains(IndexOpenFlags::NO_DIRTY)
        {
            self.map.borrow_mut().hdr.flags |= IndexHeaderFlags::HAVE_DIRTY;
        }

        // Complement on the raw byte so flag bits this version does not
        // know about survive the update untouched.
        let flag_mask = !update.remove_flags.bits();
        let apply = |flags: MailFlags| {
            MailFlags::from_bits_retain((flags.bits() & flag_mask) | update.add_flags.bits())
        };
        let touches_counted = (update.add_flags | update.remove_flags)
            .intersects(MailFlags::SEEN | MailFlags::DELETED);

        if !touches_counted {
            // No counted or lowwatered flags involved.
            let m = self.map.borrow();
            let record_size = m.hdr.record_size;
            let mut rm = m.rec_map().borrow_mut();
            for seq in seq1..=seq2 {
                let flags = rm.record_at(seq, record_size).flags;
                rm.set_flags_at(seq, record_size, apply(flags));
            }
            return Ok(());
        }

        for seq in seq1..=seq2 {
            let (uid, old_flags, new_flags) = {
                let m = self.map.borrow();
                let record_size = m.hdr.record_size;
                let mut rm = m.rec_map().borrow_mut();
                let rec = rm.record_at(seq, record_size);
                let new_flags = apply(rec.flags);
                rm.set_flags_at(seq, record_size, new_flags);
                (rec.uid, rec.flags, new_flags)
            };
            counters::update_lowwaters_all(&self.map, uid, new_flags);
            self.header_update_counts_all(uid, old_flags, new_flags);
        }
        Ok(())
    }

    fn sync_header_update(&mut self, entry: &HdrUpdateEntry<'_>) -> ApplyResult {
        let offset = entry.offset as usize;
        let len = entry.data.len();
        let (base_header_size, orig_next_uid, orig_tail_offset) = {
            let m = self.map.borrow();
            (
                m.hdr.base_header_size as usize,
                m.hdr.next_uid,
                m.hdr.log_file_tail_offset,
            )
        };
        if offset >= base_header_size || offset + len > base_header_size {
            self.set_corrupted(format!(
                "Header update outside range: {offset} + {len} > {base_header_size}"
            ));
            return Err(RecordAborted);
        }

        let mut m = self.map.borrow_mut();
        m.hdr_copy_buf[offset..offset + len].copy_from_slice(entry.data);
        debug_assert_eq!(m.hdr_copy_buf.len(), m.hdr.header_size as usize);

        // Mirror only the updated byte range into the live header; the rest
        // of the struct may be ahead of the serialized copy mid-sync.
        let mut base = m.hdr.to_bytes();
        let struct_end = base.len().min(offset + len);
        if offset < base.len() {
            base[offset..struct_end].copy_from_slice(&entry.data[..struct_end - offset]);
        }
        m.hdr = IndexHeader::from_bytes(&base).expect("base buffer is full-sized");

        if m.hdr.next_uid < orig_next_uid {
            // A next_uid shrink can happen in rare replication races; just
            // ignore it.
            m.hdr.next_uid = orig_next_uid;
        }
        // Tail offset updates are internal log bookkeeping; the header's
        // copy moves only at the end of a sync.
        m.hdr.log_file_tail_offset = orig_tail_offset;
        Ok(())
    }

    fn sync_modseq_update(&mut self, update: &ModseqUpdate) -> ApplyResult {
        if update.uid == 0 {
            self.modseq.set_watermark(&self.map, update.modseq);
            return Ok(());
        }
        let Some(seq) = self.map.borrow().lookup_seq(update.uid) else {
            return Ok(());
        };
        match self.modseq.set(&self.map, seq, update.modseq) {
            ModseqSetResult::NotEnabled => {
                self.set_corrupted("modseqs updated before they were enabled");
                Err(RecordAborted)
            }
            ModseqSetResult::Ignored => {
                if self.update_originates_from_commit() {
                    if let Some(result) = &mut self.index.sync_commit_result {
                        result.ignored_modseq_changes += 1;
                    }
                }
                Ok(())
            }
            ModseqSetResult::Applied => Ok(()),
        }
    }

    /// Whether the record being applied was written inside the caller's
    /// just-committed transaction window.
    fn update_originates_from_commit(&self) -> bool {
        let Some(result) = &self.index.sync_commit_result else {
            return false;
        };
        if self.cur_pos.seq != result.log_file_seq {
            return false;
        }
        let trans_end = result.log_file_offset;
        let trans_start = trans_end.saturating_sub(result.commit_size);
        self.cur_pos.offset >= trans_start && self.cur_pos.offset < trans_end
    }
}

//! In-memory transaction log and its view cursor.
//!
//! The log is a sequence of files, each identified by a `file_seq` and
//! holding 4-byte-padded transaction records after a fixed file header
//! region. Offsets are file offsets, so position `(file_seq, offset)`
//! addresses a record start exactly the way the index header records it.
//!
//! [`LogView`] is the applier's cursor: `set` seeks to a recorded position
//! (detecting log resets and lost positions), `next` yields one record at a
//! time, and `prev_pos` reports the start of the record just yielded, or
//! the end-of-log position once the view is exhausted, which is what the
//! sync driver writes back as the new head offset.

use std::cell::RefCell;
use std::rc::Rc;

use maildex_error::{IndexError, Result};
use maildex_types::{
    ExtAtomicInc, ExtIntro, ExtReset, FlagUpdate, HdrUpdateEntry, IndexRecord, KeywordModify,
    KeywordUpdate, ModseqUpdate, TRANSACTION_HEADER_SIZE, TransactionHeader, TransactionType,
    encode_append, encode_expunge, encode_expunge_guid, encode_ext_atomic_incs, encode_ext_intros,
    encode_ext_rec_updates, encode_flag_updates, encode_keyword_reset, encode_modseq_updates,
    pad4,
};

/// Size of the per-file header region; records start at this offset.
pub const LOG_FILE_HDR_SIZE: u32 = 24;

/// A position in the transaction log: file sequence + file offset.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LogPosition {
    /// Log file sequence number.
    pub seq: u32,
    /// Byte offset within that file.
    pub offset: u32,
}

impl LogPosition {
    /// Lexicographic "strictly earlier than" comparison.
    #[must_use]
    pub const fn is_before(self, other: Self) -> bool {
        self.seq < other.seq || (self.seq == other.seq && self.offset < other.offset)
    }
}

/// One log file: a growable record area behind a fixed header region.
#[derive(Debug)]
pub struct LogFile {
    /// File sequence number; strictly increasing across rotations.
    pub file_seq: u32,
    /// Whether this file starts a new log generation (the log was reset).
    pub reset: bool,
    /// Highest tail offset any index has committed for this file.
    pub max_tail_offset: u32,
    buf: Vec<u8>,
}

impl LogFile {
    fn new(file_seq: u32, reset: bool) -> Self {
        Self {
            file_seq,
            reset,
            max_tail_offset: 0,
            buf: vec![0u8; LOG_FILE_HDR_SIZE as usize],
        }
    }

    /// Current end-of-file offset.
    #[must_use]
    pub fn size(&self) -> u32 {
        self.buf.len() as u32
    }
}

/// Shared handle to a transaction log.
pub type LogRef = Rc<RefCell<TransactionLog>>;

/// An in-memory transaction log: an ordered list of files, the last of
/// which is the head that new records are appended to.
#[derive(Debug)]
pub struct TransactionLog {
    files: Vec<LogFile>,
}

impl Default for TransactionLog {
    fn default() -> Self {
        Self::new()
    }
}

impl TransactionLog {
    /// Create a log with a single empty head file (`file_seq == 1`).
    #[must_use]
    pub fn new() -> Self {
        Self {
            files: vec![LogFile::new(1, false)],
        }
    }

    /// Create a shared handle around a fresh log.
    #[must_use]
    pub fn new_ref() -> LogRef {
        Rc::new(RefCell::new(Self::new()))
    }

    /// The head (most recent) file.
    #[must_use]
    pub fn head(&self) -> &LogFile {
        self.files.last().expect("log always has a head file")
    }

    /// Position just past the last record in the head file.
    #[must_use]
    pub fn head_pos(&self) -> LogPosition {
        let head = self.head();
        LogPosition {
            seq: head.file_seq,
            offset: head.size(),
        }
    }

    /// Rotate to a new head file, keeping older files readable.
    pub fn rotate(&mut self) {
        let seq = self.head().file_seq + 1;
        self.files.push(LogFile::new(seq, false));
    }

    /// Reset the log: drop every file and start a new generation. Maps
    /// synced against the old generation will be discarded and rebuilt.
    pub fn reset(&mut self) {
        let seq = self.head().file_seq + 1;
        self.files = vec![LogFile::new(seq, true)];
    }

    /// Raise the head file's committed tail offset.
    pub fn note_tail_offset(&mut self, offset: u32) {
        let head = self.files.last_mut().expect("log always has a head file");
        head.max_tail_offset = head.max_tail_offset.max(offset);
    }

    fn file_index(&self, file_seq: u32) -> Option<usize> {
        self.files.iter().position(|f| f.file_seq == file_seq)
    }

    /// Append one transaction record to the head file; returns the record's
    /// start position.
    pub fn append(&mut self, tx_type: TransactionType, payload: &[u8]) -> LogPosition {
        let head = self.files.last_mut().expect("log always has a head file");
        let start = LogPosition {
            seq: head.file_seq,
            offset: head.size(),
        };
        let hdr = TransactionHeader {
            tx_type,
            size: payload.len() as u32,
        };
        head.buf.extend_from_slice(&hdr.to_bytes());
        head.buf.extend_from_slice(payload);
        head.buf
            .resize(start.offset as usize + TRANSACTION_HEADER_SIZE + pad4(payload.len()), 0);
        start
    }

    // ── Typed writer helpers ─────────────────────────────────────────

    /// Append new messages.
    pub fn append_records(&mut self, records: &[IndexRecord]) -> LogPosition {
        self.append(
            TransactionType::APPEND | TransactionType::EXTERNAL,
            &encode_append(records),
        )
    }

    /// Append an expunge for UID ranges. Non-external entries are requests
    /// only; external entries commit.
    pub fn append_expunge(&mut self, ranges: &[(u32, u32)], external: bool) -> LogPosition {
        let mut ty = TransactionType::EXPUNGE | TransactionType::EXPUNGE_PROT;
        if external {
            ty |= TransactionType::EXTERNAL;
        }
        self.append(ty, &encode_expunge(ranges))
    }

    /// Append an expunge-by-GUID entry list.
    pub fn append_expunge_guid(
        &mut self,
        entries: &[(u32, [u8; 16])],
        external: bool,
    ) -> LogPosition {
        let mut ty = TransactionType::EXPUNGE_GUID | TransactionType::EXPUNGE_PROT;
        if external {
            ty |= TransactionType::EXTERNAL;
        }
        self.append(ty, &encode_expunge_guid(entries))
    }

    /// Append flag updates.
    pub fn append_flag_updates(&mut self, updates: &[FlagUpdate]) -> LogPosition {
        self.append(TransactionType::FLAG_UPDATE, &encode_flag_updates(updates))
    }

    /// Append one base-header update.
    pub fn append_header_update(&mut self, offset: u16, data: &[u8]) -> LogPosition {
        self.append(
            TransactionType::HEADER_UPDATE,
            &HdrUpdateEntry::encode16(offset, data),
        )
    }

    /// Append extension introductions.
    pub fn append_ext_intro(&mut self, intros: &[ExtIntro]) -> LogPosition {
        self.append(TransactionType::EXT_INTRO, &encode_ext_intros(intros))
    }

    /// Append an extension reset.
    pub fn append_ext_reset(&mut self, reset: ExtReset) -> LogPosition {
        self.append(TransactionType::EXT_RESET, &reset.to_bytes())
    }

    /// Append one extension-header update (16-bit sizes).
    pub fn append_ext_hdr_update(&mut self, offset: u16, data: &[u8]) -> LogPosition {
        self.append(
            TransactionType::EXT_HDR_UPDATE,
            &HdrUpdateEntry::encode16(offset, data),
        )
    }

    /// Append one extension-header update (32-bit sizes).
    pub fn append_ext_hdr_update32(&mut self, offset: u32, data: &[u8]) -> LogPosition {
        self.append(
            TransactionType::EXT_HDR_UPDATE32,
            &HdrUpdateEntry::encode32(offset, data),
        )
    }

    /// Append extension record updates; `ext_record_size` must match the
    /// size declared by the preceding intro.
    pub fn append_ext_rec_updates(
        &mut self,
        entries: &[(u32, &[u8])],
        ext_record_size: usize,
    ) -> LogPosition {
        self.append(
            TransactionType::EXT_REC_UPDATE,
            &encode_ext_rec_updates(entries, ext_record_size),
        )
    }

    /// Append extension atomic increments.
    pub fn append_ext_atomic_incs(&mut self, entries: &[ExtAtomicInc]) -> LogPosition {
        self.append(
            TransactionType::EXT_ATOMIC_INC,
            &encode_ext_atomic_incs(entries),
        )
    }

    /// Append a keyword add/remove over UID ranges.
    pub fn append_keyword_update(
        &mut self,
        modify: KeywordModify,
        name: &str,
        ranges: &[(u32, u32)],
    ) -> LogPosition {
        let kw = KeywordUpdate {
            modify,
            name: name.to_owned(),
            ranges: ranges.to_vec(),
        };
        self.append(TransactionType::KEYWORD_UPDATE, &kw.to_bytes())
    }

    /// Append a keyword reset over UID ranges.
    pub fn append_keyword_reset(&mut self, ranges: &[(u32, u32)]) -> LogPosition {
        self.append(TransactionType::KEYWORD_RESET, &encode_keyword_reset(ranges))
    }

    /// Append modseq updates.
    pub fn append_modseq_updates(&mut self, entries: &[ModseqUpdate]) -> LogPosition {
        self.append(
            TransactionType::MODSEQ_UPDATE,
            &encode_modseq_updates(entries),
        )
    }

    /// Append an index deletion request (or external confirmation).
    pub fn append_index_deleted(&mut self, external: bool) -> LogPosition {
        let mut ty = TransactionType::INDEX_DELETED;
        if external {
            ty |= TransactionType::EXTERNAL;
        }
        self.append(ty, &[])
    }

    /// Append an index undeletion.
    pub fn append_index_undeleted(&mut self) -> LogPosition {
        self.append(TransactionType::INDEX_UNDELETED, &[])
    }
}

/// Outcome of positioning a [`LogView`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LogSetOutcome {
    /// Positioned successfully. `reset` is true when the requested position
    /// belongs to a discarded log generation; the cursor then sits at the
    /// start of the new generation and the map must be rebuilt.
    Ok { reset: bool },
    /// The requested position no longer exists in the log.
    NotFound { reason: String },
}

/// One record yielded by [`LogView::next`].
#[derive(Debug)]
pub struct LogRecord<'a> {
    /// The outer transaction header.
    pub hdr: TransactionHeader,
    /// Start position of this record in the log.
    pub pos: LogPosition,
    /// Payload bytes; valid until the next `next()` call.
    pub data: &'a [u8],
}

/// Read cursor over a transaction log.
#[derive(Debug)]
pub struct LogView {
    log: LogRef,
    positioned: bool,
    cur: LogPosition,
    prev: LogPosition,
    scratch: Vec<u8>,
}

impl LogView {
    /// Create an unpositioned view; call [`LogView::set`] before `next`.
    #[must_use]
    pub fn new(log: LogRef) -> Self {
        Self {
            log,
            positioned: false,
            cur: LogPosition { seq: 0, offset: 0 },
            prev: LogPosition { seq: 0, offset: 0 },
            scratch: Vec::new(),
        }
    }

    /// Seek to `(file_seq, offset)` inclusive, through end of log.
    ///
    /// `file_seq == 0` means "from the oldest available file" (a map that
    /// has never been synced). Offsets inside the file header region are
    /// clamped up to the first record.
    pub fn set(&mut self, file_seq: u32, offset: u32) -> Result<LogSetOutcome> {
        let log = self.log.borrow();
        let outcome = if file_seq == 0 {
            let first = &log.files[0];
            Some((
                LogPosition {
                    seq: first.file_seq,
                    offset: LOG_FILE_HDR_SIZE,
                },
                false,
            ))
        } else if let Some(idx) = log.file_index(file_seq) {
            let file = &log.files[idx];
            let offset = offset.max(LOG_FILE_HDR_SIZE);
            if offset > file.size() {
                None
            } else if let Some(reset_file) = log.files[idx + 1..].iter().find(|f| f.reset) {
                Some((
                    LogPosition {
                        seq: reset_file.file_seq,
                        offset: LOG_FILE_HDR_SIZE,
                    },
                    true,
                ))
            } else {
                Some((LogPosition { seq: file_seq, offset }, false))
            }
        } else {
            let oldest = &log.files[0];
            if file_seq < oldest.file_seq && oldest.reset {
                Some((
                    LogPosition {
                        seq: oldest.file_seq,
                        offset: LOG_FILE_HDR_SIZE,
                    },
                    true,
                ))
            } else {
                None
            }
        };
        drop(log);

        match outcome {
            Some((pos, reset)) => {
                self.cur = pos;
                self.prev = pos;
                self.positioned = true;
                Ok(LogSetOutcome::Ok { reset })
            }
            None => {
                self.positioned = false;
                Ok(LogSetOutcome::NotFound {
                    reason: format!("file_seq {file_seq} offset {offset} not in log"),
                })
            }
        }
    }

    /// Yield the next record, or `None` at end of log.
    ///
    /// Structurally unreadable records abort the view with
    /// [`IndexError::BrokenRecord`].
    pub fn next(&mut self) -> Result<Option<LogRecord<'_>>> {
        if !self.positioned {
            return Ok(None);
        }
        let log = self.log.borrow();
        loop {
            let idx = log.file_index(self.cur.seq).ok_or_else(|| {
                IndexError::internal(format!("log file_seq {} vanished mid-view", self.cur.seq))
            })?;
            let file = &log.files[idx];
            if self.cur.offset >= file.size() {
                if idx + 1 < log.files.len() {
                    let next = &log.files[idx + 1];
                    self.cur = LogPosition {
                        seq: next.file_seq,
                        offset: LOG_FILE_HDR_SIZE,
                    };
                    continue;
                }
                // End of log: prev_pos reports the end position so the
                // driver records it as the new head offset.
                self.prev = self.cur;
                return Ok(None);
            }

            let start = self.cur.offset as usize;
            let buf = &file.buf;
            let hdr = TransactionHeader::from_bytes(&buf[start..]).ok_or_else(|| {
                IndexError::BrokenRecord {
                    seq: self.cur.seq,
                    offset: self.cur.offset,
                    detail: "truncated transaction header".to_owned(),
                }
            })?;
            if hdr.size == 0 {
                return Err(IndexError::BrokenRecord {
                    seq: self.cur.seq,
                    offset: self.cur.offset,
                    detail: "zero-sized transaction record".to_owned(),
                });
            }
            let total = TRANSACTION_HEADER_SIZE + pad4(hdr.size as usize);
            if start + total > buf.len() {
                return Err(IndexError::BrokenRecord {
                    seq: self.cur.seq,
                    offset: self.cur.offset,
                    detail: "truncated transaction payload".to_owned(),
                });
            }

            self.scratch.clear();
            self.scratch.extend_from_slice(
                &buf[start + TRANSACTION_HEADER_SIZE
                    ..start + TRANSACTION_HEADER_SIZE + hdr.size as usize],
            );
            self.prev = self.cur;
            self.cur.offset += total as u32;
            drop(log);
            return Ok(Some(LogRecord {
                hdr,
                pos: self.prev,
                data: &self.scratch,
            }));
        }
    }

    /// Start position of the record last yielded, or the end-of-log
    /// position once `next()` has returned `None`.
    #[must_use]
    pub const fn prev_pos(&self) -> LogPosition {
        self.prev
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use maildex_types::MailFlags;

    #[test]
    fn append_positions_and_padding() {
        let mut log = TransactionLog::new();
        let p1 = log.append(TransactionType::FLAG_UPDATE, &[0u8; 12]);
        assert_eq!(p1.seq, 1);
        assert_eq!(p1.offset, LOG_FILE_HDR_SIZE);
        // 8 header + 12 payload, already aligned.
        let p2 = log.append(TransactionType::HEADER_UPDATE, &[0u8; 5]);
        assert_eq!(p2.offset, LOG_FILE_HDR_SIZE + 20);
        // 8 + pad4(5) = 16.
        assert_eq!(log.head_pos().offset, p2.offset + 16);
    }

    #[test]
    fn view_iterates_in_order() {
        let log = TransactionLog::new_ref();
        log.borrow_mut()
            .append_records(&[IndexRecord::new(1, MailFlags::empty())]);
        log.borrow_mut().append_flag_updates(&[FlagUpdate {
            uid1: 1,
            uid2: 1,
            add_flags: MailFlags::SEEN,
            remove_flags: MailFlags::empty(),
            modseq_inc: false,
        }]);

        let mut view = LogView::new(log);
        assert_eq!(
            view.set(0, 0).expect("set"),
            LogSetOutcome::Ok { reset: false }
        );
        let first = view.next().expect("next").expect("first record");
        assert_eq!(
            first.hdr.tx_type.masked(),
            TransactionType::APPEND.bits()
        );
        assert_eq!(first.pos.offset, LOG_FILE_HDR_SIZE);
        let second = view.next().expect("next").expect("second record");
        assert_eq!(
            second.hdr.tx_type.masked(),
            TransactionType::FLAG_UPDATE.bits()
        );
        assert!(view.next().expect("next").is_none());
        // prev_pos now reports end of log.
        let end = view.prev_pos();
        assert_eq!(end.offset, view.log.borrow().head_pos().offset);
    }

    #[test]
    fn view_crosses_file_rotation() {
        let log = TransactionLog::new_ref();
        log.borrow_mut()
            .append_records(&[IndexRecord::new(1, MailFlags::empty())]);
        log.borrow_mut().rotate();
        log.borrow_mut()
            .append_records(&[IndexRecord::new(2, MailFlags::empty())]);

        let mut view = LogView::new(log);
        view.set(1, 0).expect("set");
        let first = view.next().expect("next").expect("record in file 1");
        assert_eq!(first.pos.seq, 1);
        let second = view.next().expect("next").expect("record in file 2");
        assert_eq!(second.pos.seq, 2);
        assert!(view.next().expect("next").is_none());
        assert_eq!(view.prev_pos().seq, 2);
    }

    #[test]
    fn set_detects_reset_generation() {
        let log = TransactionLog::new_ref();
        log.borrow_mut()
            .append_records(&[IndexRecord::new(1, MailFlags::empty())]);
        log.borrow_mut().reset();

        let mut view = LogView::new(log);
        let outcome = view.set(1, LOG_FILE_HDR_SIZE).expect("set");
        assert_eq!(outcome, LogSetOutcome::Ok { reset: true });
        assert_eq!(view.prev_pos().seq, 2);
        assert_eq!(view.prev_pos().offset, LOG_FILE_HDR_SIZE);
    }

    #[test]
    fn set_reports_lost_position() {
        let log = TransactionLog::new_ref();
        let mut view = LogView::new(log);
        let outcome = view.set(9, 0).expect("set");
        assert!(matches!(outcome, LogSetOutcome::NotFound { .. }));
        assert!(view.next().expect("next").is_none());
    }

    #[test]
    fn truncated_record_is_broken() {
        let log = TransactionLog::new_ref();
        {
            let mut l = log.borrow_mut();
            l.append_records(&[IndexRecord::new(1, MailFlags::empty())]);
            // Hand-corrupt: claim a payload far past EOF.
            let head = l.files.last_mut().expect("head");
            let at = head.buf.len();
            head.buf
                .extend_from_slice(&TransactionType::APPEND.bits().to_le_bytes());
            head.buf.extend_from_slice(&1024u32.to_le_bytes());
            assert_eq!(head.buf.len(), at + 8);
        }
        let mut view = LogView::new(log);
        view.set(1, 0).expect("set");
        assert!(view.next().expect("first ok").is_some());
        assert!(matches!(
            view.next(),
            Err(IndexError::BrokenRecord { .. })
        ));
    }

    #[test]
    fn is_before_lexicographic() {
        let a = LogPosition { seq: 1, offset: 100 };
        let b = LogPosition { seq: 2, offset: 0 };
        assert!(a.is_before(b));
        assert!(!b.is_before(a));
        let c = LogPosition { seq: 1, offset: 101 };
        assert!(a.is_before(c));
        assert!(!a.is_before(a));
    }
}

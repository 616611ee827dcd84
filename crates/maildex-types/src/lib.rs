//! On-disk and wire formats for the Maildex index engine.
//!
//! A mailbox index consists of a binary index file (header + fixed-size
//! records + optional extension data) and a transaction log of append,
//! expunge, flag-update, header-update, extension, keyword, and modseq
//! entries. This crate owns the byte layouts and nothing else: no I/O, no
//! replay logic.
//!
//! All multi-byte integers are little-endian.

pub mod hdr;
pub mod record;
pub mod seq_range;
pub mod transaction;

pub use hdr::{INDEX_BASE_HEADER_SIZE, IndexHeader, IndexHeaderFlags};
pub use record::{INDEX_RECORD_SIZE, IndexRecord, MailFlags};
pub use seq_range::{SeqRange, SeqRangeSet};
pub use transaction::{
    EXPUNGE_GUID_ENTRY_SIZE, EXPUNGE_RANGE_SIZE, EXT_ATOMIC_INC_SIZE, EXT_HDR_UPDATE32_BASE_SIZE,
    EXT_HDR_UPDATE_BASE_SIZE, EXT_INTRO_BASE_SIZE, EXT_RESET_SIZE, ExtAtomicInc, ExtIntro,
    ExtReset, FLAG_UPDATE_SIZE, FlagUpdate, HdrUpdateEntry, KEYWORD_RESET_ENTRY_SIZE,
    KeywordModify, KeywordUpdate, MODSEQ_UPDATE_ENTRY_SIZE, ModseqUpdate,
    TRANSACTION_HEADER_SIZE, TRANSACTION_TYPE_MASK, TransactionHeader, TransactionType,
    encode_append, encode_expunge, encode_expunge_guid, encode_ext_atomic_incs, encode_ext_intros,
    encode_ext_rec_updates, encode_flag_updates, encode_keyword_reset, encode_modseq_updates,
    pad4, read_u16, read_u32, write_u16, write_u32,
};

/// Read a `[u8; 4]` out of a buffer at `offset`.
///
/// Panics if the buffer is too short; callers bounds-check first.
#[must_use]
pub(crate) fn read4(buf: &[u8], offset: usize) -> [u8; 4] {
    let mut out = [0u8; 4];
    out.copy_from_slice(&buf[offset..offset + 4]);
    out
}

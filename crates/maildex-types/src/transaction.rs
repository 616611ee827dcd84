//! Transaction log record wire format.
//!
//! Every log entry is an outer header `{type: u32 bitfield, size: u32}`
//! followed by `size` bytes of payload, padded to a 4-byte boundary in the
//! log. Variable-length inner entries (header updates, extension intros)
//! are themselves 4-byte padded; the advancement rules live here with the
//! codecs so the applier's handlers never re-derive them.

use crate::read4;
use crate::record::{INDEX_RECORD_SIZE, IndexRecord, MailFlags};

/// Size of the outer transaction header in bytes.
pub const TRANSACTION_HEADER_SIZE: usize = 8;
/// Size of one expunge UID-range entry.
pub const EXPUNGE_RANGE_SIZE: usize = 8;
/// Size of one expunge-by-GUID entry (`uid` + 128-bit GUID).
pub const EXPUNGE_GUID_ENTRY_SIZE: usize = 20;
/// Size of one flag-update entry.
pub const FLAG_UPDATE_SIZE: usize = 12;
/// Fixed prefix size of an extension intro entry (name follows).
pub const EXT_INTRO_BASE_SIZE: usize = 20;
/// Size of an extension reset payload.
pub const EXT_RESET_SIZE: usize = 8;
/// Fixed prefix size of a 16-bit-sized header update entry.
pub const EXT_HDR_UPDATE_BASE_SIZE: usize = 4;
/// Fixed prefix size of a 32-bit-sized header update entry.
pub const EXT_HDR_UPDATE32_BASE_SIZE: usize = 8;
/// Size of one extension atomic-increment entry.
pub const EXT_ATOMIC_INC_SIZE: usize = 8;
/// Size of one modseq update entry.
pub const MODSEQ_UPDATE_ENTRY_SIZE: usize = 12;
/// Size of one keyword-reset UID-range entry.
pub const KEYWORD_RESET_ENTRY_SIZE: usize = 8;

/// Round `n` up to the next 4-byte boundary.
#[must_use]
pub const fn pad4(n: usize) -> usize {
    (n + 3) & !3
}

/// Read a little-endian u32 at `offset`.
#[must_use]
pub fn read_u32(buf: &[u8], offset: usize) -> u32 {
    u32::from_le_bytes(read4(buf, offset))
}

/// Read a little-endian u16 at `offset`.
#[must_use]
pub fn read_u16(buf: &[u8], offset: usize) -> u16 {
    u16::from_le_bytes([buf[offset], buf[offset + 1]])
}

/// Write a little-endian u32 at `offset`.
pub fn write_u32(buf: &mut [u8], offset: usize, value: u32) {
    buf[offset..offset + 4].copy_from_slice(&value.to_le_bytes());
}

/// Write a little-endian u16 at `offset`.
pub fn write_u16(buf: &mut [u8], offset: usize, value: u16) {
    buf[offset..offset + 2].copy_from_slice(&value.to_le_bytes());
}

bitflags::bitflags! {
    /// Transaction type bitfield.
    ///
    /// The low 20 bits select the record type; expunge types are OR'd with
    /// `EXPUNGE_PROT` on the wire so a stray write cannot masquerade as an
    /// expunge. `EXTERNAL` marks an entry that already affected the
    /// authoritative store; non-external expunges are requests only.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct TransactionType: u32 {
        const EXPUNGE = 0x0000_0001;
        const APPEND = 0x0000_0002;
        const FLAG_UPDATE = 0x0000_0004;
        const HEADER_UPDATE = 0x0000_0020;
        const EXT_INTRO = 0x0000_0040;
        const EXT_RESET = 0x0000_0080;
        const EXT_HDR_UPDATE = 0x0000_0100;
        const EXT_REC_UPDATE = 0x0000_0200;
        const KEYWORD_UPDATE = 0x0000_0400;
        const KEYWORD_RESET = 0x0000_0800;
        const EXT_ATOMIC_INC = 0x0000_1000;
        const EXPUNGE_GUID = 0x0000_2000;
        const MODSEQ_UPDATE = 0x0000_8000;
        const EXT_HDR_UPDATE32 = 0x0001_0000;
        const INDEX_DELETED = 0x0002_0000;
        const INDEX_UNDELETED = 0x0004_0000;
        const BOUNDARY = 0x0008_0000;
        const ATTRIBUTE_UPDATE = 0x0010_0000;

        /// Guard bits OR'd into expunge entries on the wire.
        const EXPUNGE_PROT = 0x0000_cd90;
        /// The entry already affected the authoritative store.
        const EXTERNAL = 0x1000_0000;
    }
}

/// Mask selecting the record type (including the expunge guard bits).
pub const TRANSACTION_TYPE_MASK: u32 = 0x000f_ffff;

impl TransactionType {
    /// The type bits with modifier bits removed.
    #[must_use]
    pub const fn masked(self) -> u32 {
        self.bits() & TRANSACTION_TYPE_MASK
    }

    /// Whether the entry already affected the authoritative store.
    #[must_use]
    pub const fn is_external(self) -> bool {
        self.bits() & Self::EXTERNAL.bits() != 0
    }
}

/// Outer header of a transaction record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransactionHeader {
    /// Type bitfield.
    pub tx_type: TransactionType,
    /// Payload size in bytes (unpadded).
    pub size: u32,
}

impl TransactionHeader {
    /// Parse the outer header from the start of `buf`.
    #[must_use]
    pub fn from_bytes(buf: &[u8]) -> Option<Self> {
        if buf.len() < TRANSACTION_HEADER_SIZE {
            return None;
        }
        Some(Self {
            tx_type: TransactionType::from_bits_retain(read_u32(buf, 0)),
            size: read_u32(buf, 4),
        })
    }

    /// Serialize the outer header.
    #[must_use]
    pub fn to_bytes(&self) -> [u8; TRANSACTION_HEADER_SIZE] {
        let mut buf = [0u8; TRANSACTION_HEADER_SIZE];
        write_u32(&mut buf, 0, self.tx_type.bits());
        write_u32(&mut buf, 4, self.size);
        buf
    }
}

/// One flag-update entry: apply `add`/`remove` to the UID range.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FlagUpdate {
    /// First UID in the range.
    pub uid1: u32,
    /// Last UID in the range (inclusive).
    pub uid2: u32,
    /// Flags to set.
    pub add_flags: MailFlags,
    /// Flags to clear.
    pub remove_flags: MailFlags,
    /// Force a modseq bump even when no flag actually changes.
    pub modseq_inc: bool,
}

impl FlagUpdate {
    /// Parse one entry from the start of `buf`.
    #[must_use]
    pub fn from_bytes(buf: &[u8]) -> Option<Self> {
        if buf.len() < FLAG_UPDATE_SIZE {
            return None;
        }
        Some(Self {
            uid1: read_u32(buf, 0),
            uid2: read_u32(buf, 4),
            add_flags: MailFlags::from_bits_retain(buf[8]),
            remove_flags: MailFlags::from_bits_retain(buf[9]),
            modseq_inc: buf[10] != 0,
        })
    }

    /// Serialize one entry.
    #[must_use]
    pub fn to_bytes(&self) -> [u8; FLAG_UPDATE_SIZE] {
        let mut buf = [0u8; FLAG_UPDATE_SIZE];
        write_u32(&mut buf, 0, self.uid1);
        write_u32(&mut buf, 4, self.uid2);
        buf[8] = self.add_flags.bits();
        buf[9] = self.remove_flags.bits();
        buf[10] = u8::from(self.modseq_inc);
        buf
    }

    /// An internal update touches nothing but the DIRTY bit and does not
    /// bump modseq state.
    #[must_use]
    pub fn is_internal(&self) -> bool {
        (self.add_flags | self.remove_flags) == MailFlags::DIRTY
    }
}

/// Extension introduction descriptor.
///
/// `ext_id == u32::MAX` means the extension is addressed by name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExtIntro {
    /// Index-level extension id, or `u32::MAX` for by-name resolution.
    pub ext_id: u32,
    /// Generation marker; updates from other generations are ignored.
    pub reset_id: u32,
    /// Extension header area size in bytes.
    pub hdr_size: u32,
    /// Per-record extension data size in bytes.
    pub record_size: u16,
    /// Required alignment of the per-record data.
    pub record_align: u16,
    /// Reserved flag bits.
    pub flags: u16,
    /// Extension name.
    pub name: String,
}

impl ExtIntro {
    /// Parse one intro entry at the start of `buf`.
    ///
    /// Returns the entry and the padded number of bytes it occupies.
    #[must_use]
    pub fn parse_entry(buf: &[u8]) -> Option<(Self, usize)> {
        if buf.len() < EXT_INTRO_BASE_SIZE {
            return None;
        }
        let name_size = read_u16(buf, 18) as usize;
        if EXT_INTRO_BASE_SIZE + name_size > buf.len() {
            return None;
        }
        let name_bytes = &buf[EXT_INTRO_BASE_SIZE..EXT_INTRO_BASE_SIZE + name_size];
        let name = std::str::from_utf8(name_bytes).ok()?.to_owned();
        let intro = Self {
            ext_id: read_u32(buf, 0),
            reset_id: read_u32(buf, 4),
            hdr_size: read_u32(buf, 8),
            record_size: read_u16(buf, 12),
            record_align: read_u16(buf, 14),
            flags: read_u16(buf, 16),
            name,
        };
        Some((intro, pad4(EXT_INTRO_BASE_SIZE + name_size)))
    }

    /// Serialize one intro entry, 4-byte padded.
    #[must_use]
    pub fn to_bytes(&self) -> Vec<u8> {
        let name = self.name.as_bytes();
        let mut buf = vec![0u8; pad4(EXT_INTRO_BASE_SIZE + name.len())];
        write_u32(&mut buf, 0, self.ext_id);
        write_u32(&mut buf, 4, self.reset_id);
        write_u32(&mut buf, 8, self.hdr_size);
        write_u16(&mut buf, 12, self.record_size);
        write_u16(&mut buf, 14, self.record_align);
        write_u16(&mut buf, 16, self.flags);
        write_u16(&mut buf, 18, name.len() as u16);
        buf[EXT_INTRO_BASE_SIZE..EXT_INTRO_BASE_SIZE + name.len()].copy_from_slice(name);
        buf
    }
}

/// Extension reset payload: start a new data generation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExtReset {
    /// The new generation id.
    pub new_reset_id: u32,
    /// Keep existing header and record data instead of zeroing it.
    pub preserve_data: bool,
}

impl ExtReset {
    /// Parse from the start of `buf`. Old writers emitted only the
    /// `new_reset_id` word, so 4 bytes is the minimum.
    #[must_use]
    pub fn from_bytes(buf: &[u8]) -> Option<Self> {
        if buf.len() < 4 {
            return None;
        }
        Some(Self {
            new_reset_id: read_u32(buf, 0),
            preserve_data: buf.len() > 4 && buf[4] != 0,
        })
    }

    /// Serialize to the 8-byte layout.
    #[must_use]
    pub fn to_bytes(&self) -> [u8; EXT_RESET_SIZE] {
        let mut buf = [0u8; EXT_RESET_SIZE];
        write_u32(&mut buf, 0, self.new_reset_id);
        buf[4] = u8::from(self.preserve_data);
        buf
    }
}

/// One header-region update entry (used by HEADER_UPDATE, EXT_HDR_UPDATE,
/// and EXT_HDR_UPDATE32 payloads).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HdrUpdateEntry<'a> {
    /// Byte offset within the target header region.
    pub offset: u32,
    /// Bytes to write at `offset`.
    pub data: &'a [u8],
}

impl<'a> HdrUpdateEntry<'a> {
    /// Parse one 16-bit-sized entry; returns the entry and its padded size.
    #[must_use]
    pub fn parse16(buf: &'a [u8]) -> Option<(Self, usize)> {
        if buf.len() < EXT_HDR_UPDATE_BASE_SIZE {
            return None;
        }
        let offset = u32::from(read_u16(buf, 0));
        let size = read_u16(buf, 2) as usize;
        if EXT_HDR_UPDATE_BASE_SIZE + size > buf.len() {
            return None;
        }
        let data = &buf[EXT_HDR_UPDATE_BASE_SIZE..EXT_HDR_UPDATE_BASE_SIZE + size];
        Some((Self { offset, data }, pad4(EXT_HDR_UPDATE_BASE_SIZE + size)))
    }

    /// Parse one 32-bit-sized entry; returns the entry and its padded size.
    #[must_use]
    pub fn parse32(buf: &'a [u8]) -> Option<(Self, usize)> {
        if buf.len() < EXT_HDR_UPDATE32_BASE_SIZE {
            return None;
        }
        let offset = read_u32(buf, 0);
        let size = read_u32(buf, 4) as usize;
        if EXT_HDR_UPDATE32_BASE_SIZE + size > buf.len() {
            return None;
        }
        let data = &buf[EXT_HDR_UPDATE32_BASE_SIZE..EXT_HDR_UPDATE32_BASE_SIZE + size];
        Some((Self { offset, data }, pad4(EXT_HDR_UPDATE32_BASE_SIZE + size)))
    }

    /// Serialize as a 16-bit-sized entry, 4-byte padded.
    #[must_use]
    pub fn encode16(offset: u16, data: &[u8]) -> Vec<u8> {
        let mut buf = vec![0u8; pad4(EXT_HDR_UPDATE_BASE_SIZE + data.len())];
        write_u16(&mut buf, 0, offset);
        write_u16(&mut buf, 2, data.len() as u16);
        buf[EXT_HDR_UPDATE_BASE_SIZE..EXT_HDR_UPDATE_BASE_SIZE + data.len()].copy_from_slice(data);
        buf
    }

    /// Serialize as a 32-bit-sized entry, 4-byte padded.
    #[must_use]
    pub fn encode32(offset: u32, data: &[u8]) -> Vec<u8> {
        let mut buf = vec![0u8; pad4(EXT_HDR_UPDATE32_BASE_SIZE + data.len())];
        write_u32(&mut buf, 0, offset);
        write_u32(&mut buf, 4, data.len() as u32);
        buf[EXT_HDR_UPDATE32_BASE_SIZE..EXT_HDR_UPDATE32_BASE_SIZE + data.len()]
            .copy_from_slice(data);
        buf
    }
}

/// One extension atomic-increment entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExtAtomicInc {
    /// Target message UID.
    pub uid: u32,
    /// Signed delta applied to the extension's numeric field.
    pub diff: i32,
}

impl ExtAtomicInc {
    /// Parse one entry from the start of `buf`.
    #[must_use]
    pub fn from_bytes(buf: &[u8]) -> Option<Self> {
        if buf.len() < EXT_ATOMIC_INC_SIZE {
            return None;
        }
        Some(Self {
            uid: read_u32(buf, 0),
            diff: read_u32(buf, 4) as i32,
        })
    }

    /// Serialize one entry.
    #[must_use]
    pub fn to_bytes(&self) -> [u8; EXT_ATOMIC_INC_SIZE] {
        let mut buf = [0u8; EXT_ATOMIC_INC_SIZE];
        write_u32(&mut buf, 0, self.uid);
        write_u32(&mut buf, 4, self.diff as u32);
        buf
    }
}

/// One modseq update entry. `uid == 0` addresses the highest-modseq
/// watermark rather than a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ModseqUpdate {
    /// Target message UID, or 0 for the watermark.
    pub uid: u32,
    /// Minimum modseq the target must reach.
    pub modseq: u64,
}

impl ModseqUpdate {
    /// Parse one entry from the start of `buf`.
    #[must_use]
    pub fn from_bytes(buf: &[u8]) -> Option<Self> {
        if buf.len() < MODSEQ_UPDATE_ENTRY_SIZE {
            return None;
        }
        let low = u64::from(read_u32(buf, 4));
        let high = u64::from(read_u32(buf, 8));
        Some(Self {
            uid: read_u32(buf, 0),
            modseq: (high << 32) | low,
        })
    }

    /// Serialize one entry (low word first).
    #[must_use]
    pub fn to_bytes(&self) -> [u8; MODSEQ_UPDATE_ENTRY_SIZE] {
        let mut buf = [0u8; MODSEQ_UPDATE_ENTRY_SIZE];
        write_u32(&mut buf, 0, self.uid);
        write_u32(&mut buf, 4, (self.modseq & 0xffff_ffff) as u32);
        write_u32(&mut buf, 8, (self.modseq >> 32) as u32);
        buf
    }
}

/// Keyword modification kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum KeywordModify {
    /// Set the keyword on the range.
    Add = 1,
    /// Clear the keyword from the range.
    Remove = 2,
}

/// A keyword update: one keyword name applied to a list of UID ranges.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeywordUpdate {
    /// Add or remove.
    pub modify: KeywordModify,
    /// Keyword name.
    pub name: String,
    /// UID ranges the modification applies to.
    pub ranges: Vec<(u32, u32)>,
}

impl KeywordUpdate {
    /// Parse a whole KEYWORD_UPDATE payload.
    #[must_use]
    pub fn from_bytes(buf: &[u8]) -> Option<Self> {
        if buf.len() < 4 {
            return None;
        }
        let modify = match buf[0] {
            1 => KeywordModify::Add,
            2 => KeywordModify::Remove,
            _ => return None,
        };
        let name_size = read_u16(buf, 2) as usize;
        if name_size == 0 || 4 + name_size > buf.len() {
            return None;
        }
        let name = std::str::from_utf8(&buf[4..4 + name_size]).ok()?.to_owned();
        let mut ranges = Vec::new();
        let mut i = pad4(4 + name_size);
        while i + EXPUNGE_RANGE_SIZE <= buf.len() {
            ranges.push((read_u32(buf, i), read_u32(buf, i + 4)));
            i += EXPUNGE_RANGE_SIZE;
        }
        if i != buf.len() {
            return None;
        }
        Some(Self {
            modify,
            name,
            ranges,
        })
    }

    /// Serialize a whole KEYWORD_UPDATE payload.
    #[must_use]
    pub fn to_bytes(&self) -> Vec<u8> {
        let name = self.name.as_bytes();
        let ranges_off = pad4(4 + name.len());
        let mut buf = vec![0u8; ranges_off + self.ranges.len() * EXPUNGE_RANGE_SIZE];
        buf[0] = self.modify as u8;
        write_u16(&mut buf, 2, name.len() as u16);
        buf[4..4 + name.len()].copy_from_slice(name);
        for (i, &(uid1, uid2)) in self.ranges.iter().enumerate() {
            write_u32(&mut buf, ranges_off + i * EXPUNGE_RANGE_SIZE, uid1);
            write_u32(&mut buf, ranges_off + i * EXPUNGE_RANGE_SIZE + 4, uid2);
        }
        buf
    }
}

// ── Whole-payload encoders (the writer side of the wire format) ──────

/// Encode an APPEND payload from base records.
#[must_use]
pub fn encode_append(records: &[IndexRecord]) -> Vec<u8> {
    let mut buf = Vec::with_capacity(records.len() * INDEX_RECORD_SIZE);
    for rec in records {
        buf.extend_from_slice(&rec.to_bytes());
    }
    buf
}

/// Encode an EXPUNGE payload from UID ranges.
#[must_use]
pub fn encode_expunge(ranges: &[(u32, u32)]) -> Vec<u8> {
    let mut buf = Vec::with_capacity(ranges.len() * EXPUNGE_RANGE_SIZE);
    for &(uid1, uid2) in ranges {
        buf.extend_from_slice(&uid1.to_le_bytes());
        buf.extend_from_slice(&uid2.to_le_bytes());
    }
    buf
}

/// Encode an EXPUNGE_GUID payload.
#[must_use]
pub fn encode_expunge_guid(entries: &[(u32, [u8; 16])]) -> Vec<u8> {
    let mut buf = Vec::with_capacity(entries.len() * EXPUNGE_GUID_ENTRY_SIZE);
    for (uid, guid) in entries {
        buf.extend_from_slice(&uid.to_le_bytes());
        buf.extend_from_slice(guid);
    }
    buf
}

/// Encode a FLAG_UPDATE payload.
#[must_use]
pub fn encode_flag_updates(updates: &[FlagUpdate]) -> Vec<u8> {
    let mut buf = Vec::with_capacity(updates.len() * FLAG_UPDATE_SIZE);
    for u in updates {
        buf.extend_from_slice(&u.to_bytes());
    }
    buf
}

/// Encode an EXT_INTRO payload.
#[must_use]
pub fn encode_ext_intros(intros: &[ExtIntro]) -> Vec<u8> {
    let mut buf = Vec::new();
    for intro in intros {
        buf.extend_from_slice(&intro.to_bytes());
    }
    buf
}

/// Encode an EXT_REC_UPDATE payload; every entry is padded to the same
/// `(4 + ext_record_size)` rounded-up stride.
#[must_use]
pub fn encode_ext_rec_updates(entries: &[(u32, &[u8])], ext_record_size: usize) -> Vec<u8> {
    let stride = pad4(4 + ext_record_size);
    let mut buf = vec![0u8; entries.len() * stride];
    for (i, (uid, data)) in entries.iter().enumerate() {
        debug_assert!(data.len() <= ext_record_size);
        write_u32(&mut buf, i * stride, *uid);
        buf[i * stride + 4..i * stride + 4 + data.len()].copy_from_slice(data);
    }
    buf
}

/// Encode an EXT_ATOMIC_INC payload.
#[must_use]
pub fn encode_ext_atomic_incs(entries: &[ExtAtomicInc]) -> Vec<u8> {
    let mut buf = Vec::with_capacity(entries.len() * EXT_ATOMIC_INC_SIZE);
    for e in entries {
        buf.extend_from_slice(&e.to_bytes());
    }
    buf
}

/// Encode a MODSEQ_UPDATE payload.
#[must_use]
pub fn encode_modseq_updates(entries: &[ModseqUpdate]) -> Vec<u8> {
    let mut buf = Vec::with_capacity(entries.len() * MODSEQ_UPDATE_ENTRY_SIZE);
    for e in entries {
        buf.extend_from_slice(&e.to_bytes());
    }
    buf
}

/// Encode a KEYWORD_RESET payload from UID ranges.
#[must_use]
pub fn encode_keyword_reset(ranges: &[(u32, u32)]) -> Vec<u8> {
    encode_expunge(ranges)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pad4_boundaries() {
        assert_eq!(pad4(0), 0);
        assert_eq!(pad4(1), 4);
        assert_eq!(pad4(4), 4);
        assert_eq!(pad4(5), 8);
        assert_eq!(pad4(19), 20);
    }

    #[test]
    fn transaction_header_round_trip() {
        let hdr = TransactionHeader {
            tx_type: TransactionType::EXPUNGE
                | TransactionType::EXPUNGE_PROT
                | TransactionType::EXTERNAL,
            size: 16,
        };
        let parsed = TransactionHeader::from_bytes(&hdr.to_bytes()).expect("parse");
        assert_eq!(parsed, hdr);
        assert!(parsed.tx_type.is_external());
        assert_eq!(
            parsed.tx_type.masked(),
            (TransactionType::EXPUNGE | TransactionType::EXPUNGE_PROT).bits()
        );
    }

    #[test]
    fn masked_strips_external() {
        let ty = TransactionType::APPEND | TransactionType::EXTERNAL;
        assert_eq!(ty.masked(), TransactionType::APPEND.bits());
    }

    #[test]
    fn flag_update_round_trip() {
        let u = FlagUpdate {
            uid1: 3,
            uid2: 9,
            add_flags: MailFlags::SEEN,
            remove_flags: MailFlags::DRAFT,
            modseq_inc: true,
        };
        let parsed = FlagUpdate::from_bytes(&u.to_bytes()).expect("parse");
        assert_eq!(parsed, u);
        assert!(!parsed.is_internal());
    }

    #[test]
    fn flag_update_internal_is_dirty_only() {
        let dirty_only = FlagUpdate {
            uid1: 1,
            uid2: 1,
            add_flags: MailFlags::DIRTY,
            remove_flags: MailFlags::empty(),
            modseq_inc: false,
        };
        assert!(dirty_only.is_internal());

        let mixed = FlagUpdate {
            add_flags: MailFlags::DIRTY | MailFlags::SEEN,
            ..dirty_only
        };
        assert!(!mixed.is_internal());
    }

    #[test]
    fn ext_intro_round_trip_with_padding() {
        let intro = ExtIntro {
            ext_id: u32::MAX,
            reset_id: 2,
            hdr_size: 16,
            record_size: 6,
            record_align: 2,
            flags: 0,
            name: "cache".to_owned(),
        };
        let bytes = intro.to_bytes();
        // 20 + 5 = 25, padded to 28.
        assert_eq!(bytes.len(), 28);
        let (parsed, advance) = ExtIntro::parse_entry(&bytes).expect("parse");
        assert_eq!(parsed, intro);
        assert_eq!(advance, 28);
    }

    #[test]
    fn ext_intro_name_overrun_rejected() {
        let mut bytes = ExtIntro {
            ext_id: 0,
            reset_id: 0,
            hdr_size: 0,
            record_size: 0,
            record_align: 0,
            flags: 0,
            name: "x".to_owned(),
        }
        .to_bytes();
        // Claim a name longer than the buffer.
        write_u16(&mut bytes, 18, 200);
        assert!(ExtIntro::parse_entry(&bytes).is_none());
    }

    #[test]
    fn ext_reset_old_writer_compat() {
        // Only the new_reset_id word present.
        let reset = ExtReset::from_bytes(&5u32.to_le_bytes()).expect("parse");
        assert_eq!(reset.new_reset_id, 5);
        assert!(!reset.preserve_data);
    }

    #[test]
    fn hdr_update_entry_parse16() {
        let bytes = HdrUpdateEntry::encode16(24, &[1, 2, 3]);
        assert_eq!(bytes.len(), 8); // 4 + 3, padded to 8
        let (entry, advance) = HdrUpdateEntry::parse16(&bytes).expect("parse");
        assert_eq!(entry.offset, 24);
        assert_eq!(entry.data, &[1, 2, 3]);
        assert_eq!(advance, 8);
    }

    #[test]
    fn hdr_update_entry_parse32() {
        let data = vec![9u8; 6];
        let bytes = HdrUpdateEntry::encode32(70_000, &data);
        let (entry, advance) = HdrUpdateEntry::parse32(&bytes).expect("parse");
        assert_eq!(entry.offset, 70_000);
        assert_eq!(entry.data, &data[..]);
        assert_eq!(advance, pad4(8 + 6));
    }

    #[test]
    fn hdr_update_entry_size_overrun_rejected() {
        let mut bytes = HdrUpdateEntry::encode16(0, &[1, 2]);
        write_u16(&mut bytes, 2, 100);
        assert!(HdrUpdateEntry::parse16(&bytes).is_none());
    }

    #[test]
    fn modseq_update_word_order() {
        let u = ModseqUpdate {
            uid: 7,
            modseq: 0x0000_0001_0000_0002,
        };
        let bytes = u.to_bytes();
        assert_eq!(read_u32(&bytes, 4), 2, "low word first");
        assert_eq!(read_u32(&bytes, 8), 1);
        assert_eq!(ModseqUpdate::from_bytes(&bytes).expect("parse"), u);
    }

    #[test]
    fn ext_atomic_inc_negative_diff() {
        let e = ExtAtomicInc { uid: 4, diff: -3 };
        let parsed = ExtAtomicInc::from_bytes(&e.to_bytes()).expect("parse");
        assert_eq!(parsed.diff, -3);
    }

    #[test]
    fn keyword_update_round_trip() {
        let kw = KeywordUpdate {
            modify: KeywordModify::Add,
            name: "$Forwarded".to_owned(),
            ranges: vec![(1, 4), (9, 9)],
        };
        let bytes = kw.to_bytes();
        // Ranges start 4-aligned after the name.
        assert_eq!(bytes.len(), pad4(4 + 10) + 16);
        let parsed = KeywordUpdate::from_bytes(&bytes).expect("parse");
        assert_eq!(parsed, kw);
    }

    #[test]
    fn keyword_update_empty_name_rejected() {
        let mut bytes = KeywordUpdate {
            modify: KeywordModify::Remove,
            name: "a".to_owned(),
            ranges: vec![],
        }
        .to_bytes();
        write_u16(&mut bytes, 2, 0);
        assert!(KeywordUpdate::from_bytes(&bytes).is_none());
    }

    #[test]
    fn keyword_update_bad_modify_type_rejected() {
        let mut bytes = KeywordUpdate {
            modify: KeywordModify::Add,
            name: "a".to_owned(),
            ranges: vec![],
        }
        .to_bytes();
        bytes[0] = 9;
        assert!(KeywordUpdate::from_bytes(&bytes).is_none());
    }

    #[test]
    fn encode_ext_rec_updates_stride() {
        let data = [0xAAu8; 6];
        let buf = encode_ext_rec_updates(&[(1, &data), (2, &data)], 6);
        // 4 + 6 = 10, padded stride 12.
        assert_eq!(buf.len(), 24);
        assert_eq!(read_u32(&buf, 0), 1);
        assert_eq!(read_u32(&buf, 12), 2);
        assert_eq!(&buf[4..10], &data);
        assert_eq!(&buf[10..12], &[0, 0]);
    }

    #[test]
    fn encode_append_layout() {
        let recs = [
            IndexRecord::new(1, MailFlags::empty()),
            IndexRecord::new(2, MailFlags::SEEN),
        ];
        let buf = encode_append(&recs);
        assert_eq!(buf.len(), 16);
        assert_eq!(read_u32(&buf, 0), 1);
        assert_eq!(buf[12], MailFlags::SEEN.bits());
    }
}

//! Index header layout.
//!
//! The header sits at the start of the index file and is mirrored in memory
//! through each map's header-copy buffer. The *base* header is the fixed
//! 64-byte region below; extension headers follow it, so `header_size >=
//! base_header_size` and the serialized header occupies `header_size` bytes.
//!
//! ```text
//! Offset  Size  Field
//!   0       4   indexid
//!   4       4   flags (CORRUPTED=0x1, HAVE_DIRTY=0x2, FSCKD=0x4)
//!   8       4   base_header_size (64)
//!  12       4   header_size (base + extension header area)
//!  16       4   record_size (>= 8)
//!  20       4   messages_count
//!  24       4   next_uid
//!  28       4   seen_messages_count
//!  32       4   deleted_messages_count
//!  36       4   first_unseen_uid_lowwater
//!  40       4   first_deleted_uid_lowwater
//!  44       4   log_file_seq
//!  48       4   log_file_head_offset
//!  52       4   log_file_tail_offset
//!  56       8   reserved (zero)
//! ```

use crate::read4;
use crate::record::INDEX_RECORD_SIZE;

/// Size of the fixed base header region in bytes.
pub const INDEX_BASE_HEADER_SIZE: u32 = 64;

bitflags::bitflags! {
    /// Persistent header flag bits.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct IndexHeaderFlags: u32 {
        /// The index is known broken; readers should not trust it.
        const CORRUPTED = 0x01;
        /// At least one record carries the DIRTY flag.
        const HAVE_DIRTY = 0x02;
        /// The index was repaired at some point; survives log resets.
        const FSCKD = 0x04;
    }
}

/// Parsed base index header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexHeader {
    /// Identifier tying the index file to its transaction log.
    pub indexid: u32,
    /// Persistent flag bits.
    pub flags: IndexHeaderFlags,
    /// Size of the fixed base header region.
    pub base_header_size: u32,
    /// Total serialized header size (base + extension headers).
    pub header_size: u32,
    /// Size of one message record, base portion plus extension bytes.
    pub record_size: u32,
    /// Number of messages visible through this map.
    pub messages_count: u32,
    /// Next UID to be assigned; strictly above every record's UID.
    pub next_uid: u32,
    /// Count of records carrying the SEEN flag.
    pub seen_messages_count: u32,
    /// Count of records carrying the DELETED flag.
    pub deleted_messages_count: u32,
    /// No record below this UID lacks the SEEN flag.
    pub first_unseen_uid_lowwater: u32,
    /// No record below this UID carries the DELETED flag.
    pub first_deleted_uid_lowwater: u32,
    /// Transaction log file this map is synced against.
    pub log_file_seq: u32,
    /// Offset within `log_file_seq` up to which everything is applied.
    pub log_file_head_offset: u32,
    /// Offset below which the log may be pruned for this index.
    pub log_file_tail_offset: u32,
}

impl IndexHeader {
    /// Create the header of a fresh, empty map.
    ///
    /// Lowwaters start at 1: the first valid UID, so the `uid >= lowwater`
    /// invariant holds trivially for every record that will ever exist.
    #[must_use]
    pub fn fresh(indexid: u32) -> Self {
        Self {
            indexid,
            flags: IndexHeaderFlags::empty(),
            base_header_size: INDEX_BASE_HEADER_SIZE,
            header_size: INDEX_BASE_HEADER_SIZE,
            record_size: INDEX_RECORD_SIZE as u32,
            messages_count: 0,
            next_uid: 1,
            seen_messages_count: 0,
            deleted_messages_count: 0,
            first_unseen_uid_lowwater: 1,
            first_deleted_uid_lowwater: 1,
            log_file_seq: 0,
            log_file_head_offset: 0,
            log_file_tail_offset: 0,
        }
    }

    /// Parse a base header from the first `INDEX_BASE_HEADER_SIZE` bytes.
    ///
    /// Returns `None` if the buffer is too short. Value-level validation
    /// (count bounds, size sanity) is the map's job, not the codec's.
    #[must_use]
    pub fn from_bytes(buf: &[u8]) -> Option<Self> {
        if buf.len() < INDEX_BASE_HEADER_SIZE as usize {
            return None;
        }
        Some(Self {
            indexid: u32::from_le_bytes(read4(buf, 0)),
            flags: IndexHeaderFlags::from_bits_retain(u32::from_le_bytes(read4(buf, 4))),
            base_header_size: u32::from_le_bytes(read4(buf, 8)),
            header_size: u32::from_le_bytes(read4(buf, 12)),
            record_size: u32::from_le_bytes(read4(buf, 16)),
            messages_count: u32::from_le_bytes(read4(buf, 20)),
            next_uid: u32::from_le_bytes(read4(buf, 24)),
            seen_messages_count: u32::from_le_bytes(read4(buf, 28)),
            deleted_messages_count: u32::from_le_bytes(read4(buf, 32)),
            first_unseen_uid_lowwater: u32::from_le_bytes(read4(buf, 36)),
            first_deleted_uid_lowwater: u32::from_le_bytes(read4(buf, 40)),
            log_file_seq: u32::from_le_bytes(read4(buf, 44)),
            log_file_head_offset: u32::from_le_bytes(read4(buf, 48)),
            log_file_tail_offset: u32::from_le_bytes(read4(buf, 52)),
        })
    }

    /// Serialize the base header into its 64-byte layout.
    #[must_use]
    pub fn to_bytes(&self) -> [u8; INDEX_BASE_HEADER_SIZE as usize] {
        let mut buf = [0u8; INDEX_BASE_HEADER_SIZE as usize];
        buf[0..4].copy_from_slice(&self.indexid.to_le_bytes());
        buf[4..8].copy_from_slice(&self.flags.bits().to_le_bytes());
        buf[8..12].copy_from_slice(&self.base_header_size.to_le_bytes());
        buf[12..16].copy_from_slice(&self.header_size.to_le_bytes());
        buf[16..20].copy_from_slice(&self.record_size.to_le_bytes());
        buf[20..24].copy_from_slice(&self.messages_count.to_le_bytes());
        buf[24..28].copy_from_slice(&self.next_uid.to_le_bytes());
        buf[28..32].copy_from_slice(&self.seen_messages_count.to_le_bytes());
        buf[32..36].copy_from_slice(&self.deleted_messages_count.to_le_bytes());
        buf[36..40].copy_from_slice(&self.first_unseen_uid_lowwater.to_le_bytes());
        buf[40..44].copy_from_slice(&self.first_deleted_uid_lowwater.to_le_bytes());
        buf[44..48].copy_from_slice(&self.log_file_seq.to_le_bytes());
        buf[48..52].copy_from_slice(&self.log_file_head_offset.to_le_bytes());
        buf[52..56].copy_from_slice(&self.log_file_tail_offset.to_le_bytes());
        buf
    }
}

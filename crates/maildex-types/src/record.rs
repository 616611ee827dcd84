//! Message record layout and flags.
//!
//! A record's base portion is 8 bytes: `uid: u32`, `flags: u8`, three zero
//! padding bytes. Anything past the base portion belongs to map extensions
//! and is sliced by the extension table, never typed here.

use crate::read4;

/// Size of the base portion of a message record in bytes.
pub const INDEX_RECORD_SIZE: usize = 8;

bitflags::bitflags! {
    /// Per-message flag bits stored in the record.
    ///
    /// The low bits are the IMAP system flags; `BACKEND` and `DIRTY` are
    /// index-internal. `DIRTY` marks a record whose flags could not be
    /// written through to the backing store yet.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct MailFlags: u8 {
        const ANSWERED = 0x01;
        const FLAGGED = 0x02;
        const DELETED = 0x04;
        const SEEN = 0x08;
        const DRAFT = 0x10;
        /// Reserved for the storage backend.
        const BACKEND = 0x40;
        /// Flag changes not yet synced to the backing store.
        const DIRTY = 0x80;
    }
}

/// Base portion of a message record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IndexRecord {
    /// Per-mailbox monotonically assigned message identifier; never reused.
    pub uid: u32,
    /// Message flags.
    pub flags: MailFlags,
}

impl IndexRecord {
    /// Create a record with the given UID and flags.
    #[must_use]
    pub const fn new(uid: u32, flags: MailFlags) -> Self {
        Self { uid, flags }
    }

    /// Parse the base portion from the start of `buf`.
    #[must_use]
    pub fn from_bytes(buf: &[u8]) -> Option<Self> {
        if buf.len() < INDEX_RECORD_SIZE {
            return None;
        }
        Some(Self {
            uid: u32::from_le_bytes(read4(buf, 0)),
            flags: MailFlags::from_bits_retain(buf[4]),
        })
    }

    /// Serialize the base portion (8 bytes, padding zeroed).
    #[must_use]
    pub fn to_bytes(&self) -> [u8; INDEX_RECORD_SIZE] {
        let mut buf = [0u8; INDEX_RECORD_SIZE];
        buf[0..4].copy_from_slice(&self.uid.to_le_bytes());
        buf[4] = self.flags.bits();
        buf
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn record_round_trip() {
        let rec = IndexRecord::new(42, MailFlags::SEEN | MailFlags::DRAFT);
        let bytes = rec.to_bytes();
        assert_eq!(bytes.len(), 8);
        let parsed = IndexRecord::from_bytes(&bytes).expect("parse");
        assert_eq!(parsed, rec);
    }

    #[test]
    fn record_layout() {
        let rec = IndexRecord::new(0x01020304, MailFlags::DELETED);
        let bytes = rec.to_bytes();
        assert_eq!(&bytes[0..4], &[0x04, 0x03, 0x02, 0x01]);
        assert_eq!(bytes[4], 0x04);
        assert_eq!(&bytes[5..8], &[0, 0, 0]);
    }

    #[test]
    fn short_buffer_rejected() {
        assert!(IndexRecord::from_bytes(&[1, 2, 3]).is_none());
    }

    #[test]
    fn unknown_flag_bits_retained() {
        let rec = IndexRecord::new(1, MailFlags::from_bits_retain(0x20));
        let parsed = IndexRecord::from_bytes(&rec.to_bytes()).expect("parse");
        assert_eq!(parsed.flags.bits(), 0x20);
    }
}

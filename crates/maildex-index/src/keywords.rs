//! Keyword sub-applier.
//!
//! Keyword names live on the map, in bit order; the per-message bitmap
//! lives in a `"keywords"` extension created on demand and grown when the
//! keyword count needs more bits. Keyword changes bump modseq over the
//! affected ranges the way flag updates do.

use maildex_types::{KeywordModify, KeywordUpdate};

use crate::applier::{ApplyResult, SyncMapContext};

/// Name of the extension holding the per-message keyword bitmap.
pub const KEYWORDS_EXT_NAME: &str = "keywords";

impl SyncMapContext<'_> {
    /// Apply a KEYWORD_UPDATE: set or clear one keyword over UID ranges.
    pub(crate) fn sync_keyword_update(&mut self, update: &KeywordUpdate) -> ApplyResult {
        let existing = self
            .map
            .borrow()
            .keywords
            .iter()
            .position(|k| k == &update.name);

        let bit = match (existing, update.modify) {
            (Some(bit), _) => bit,
            (None, KeywordModify::Remove) => {
                // Removing a keyword no message carries.
                return Ok(());
            }
            (None, KeywordModify::Add) => {
                self.move_to_private_memory();
                let mut m = self.map.borrow_mut();
                m.keywords.push(update.name.clone());
                m.keywords.len() - 1
            }
        };

        // Grow the bitmap extension so the bit fits; sized in 4-byte steps
        // so repeated new keywords rarely force a record re-layout.
        let needed = (bit / 8 + 1).next_multiple_of(4) as u32;
        let ext_idx = self.ensure_map_extension(KEYWORDS_EXT_NAME, 0, needed, 1);

        let (byte_offset, stride) = {
            let m = self.map.borrow();
            let ext = &m.extensions[ext_idx];
            (ext.record_offset as usize + bit / 8, m.hdr.record_size)
        };
        let mask = 1u8 << (bit % 8);

        for &(uid1, uid2) in &update.ranges {
            let Some((seq1, seq2)) = self.map.borrow().lookup_seq_range(uid1, uid2) else {
                continue;
            };
            self.modseq.update_flags(&self.map, seq1, seq2);
            let m = self.map.borrow();
            let mut rm = m.rec_map().borrow_mut();
            for seq in seq1..=seq2 {
                let byte = &mut rm.record_mut(seq, stride)[byte_offset];
                match update.modify {
                    KeywordModify::Add => *byte |= mask,
                    KeywordModify::Remove => *byte &= !mask,
                }
            }
        }
        Ok(())
    }

    /// Apply a KEYWORD_RESET: clear every keyword bit over UID ranges.
    pub(crate) fn sync_keyword_reset(&mut self, ranges: &[(u32, u32)]) -> ApplyResult {
        let ext = {
            let m = self.map.borrow();
            m.extensions
                .iter()
                .find(|e| e.name == KEYWORDS_EXT_NAME)
                .map(|e| (e.record_offset as usize, e.record_size as usize))
        };
        let Some((offset, size)) = ext else {
            // No keyword bitmap yet: nothing to clear.
            return Ok(());
        };

        let stride = self.map.borrow().hdr.record_size;
        for &(uid1, uid2) in ranges {
            let Some((seq1, seq2)) = self.map.borrow().lookup_seq_range(uid1, uid2) else {
                continue;
            };
            self.modseq.update_flags(&self.map, seq1, seq2);
            let m = self.map.borrow();
            let mut rm = m.rec_map().borrow_mut();
            for seq in seq1..=seq2 {
                rm.record_mut(seq, stride)[offset..offset + size].fill(0);
            }
        }
        Ok(())
    }
}

//! The expunge engine.
//!
//! Takes a sorted, merged set of sequence ranges, invokes registered
//! expunge handlers for every doomed record (index-file syncs only, before
//! any mutation), folds the records' flags out of the counters, and
//! gap-closes the record arena in a single pass.

use maildex_types::{MailFlags, SeqRangeSet};

use crate::applier::{SyncMapContext, SyncType};
use crate::index::ExpungeEvent;

impl SyncMapContext<'_> {
    /// Expunge every record in `seqs` from the map.
    pub(crate) fn sync_expunge(&mut self, seqs: &SeqRangeSet) {
        if seqs.is_empty() {
            return;
        }
        // A private record map we are free to rewrite.
        let map = self.get_atomic_map();

        if self.init_expunge_handlers() {
            for range in seqs.iter() {
                for handler in &mut self.expunge_handlers {
                    for seq in range.seq1..=range.seq2 {
                        let bytes = map.borrow().record_bytes_at(seq);
                        let uid = map.borrow().record_at(seq).uid;
                        let offset = (handler.record_offset as usize).min(bytes.len());
                        let event = ExpungeEvent {
                            uid,
                            seq,
                            ext_data: &bytes[offset..],
                        };
                        (handler.handler)(&event);
                    }
                }
            }
        }

        for range in seqs.iter() {
            for seq in range.seq1..=range.seq2 {
                let rec = map.borrow().record_at(seq);
                self.header_update_counts(rec.uid, rec.flags, MailFlags::empty());
            }
            map.borrow_mut().hdr.messages_count -= range.count();
        }

        let removed = {
            let m = map.borrow();
            let record_size = m.hdr.record_size;
            let mut rm = m.rec_map().borrow_mut();
            rm.compact(seqs, record_size)
        };
        debug_assert_eq!(removed, seqs.count());
    }

    /// Lazily borrow the index's expunge handlers; they run only when
    /// syncing the index file itself.
    fn init_expunge_handlers(&mut self) -> bool {
        if self.sync_type != SyncType::File {
            return false;
        }
        if !self.expunge_handlers_set {
            self.expunge_handlers = std::mem::take(&mut self.index.expunge_handlers);
            self.expunge_handlers_set = true;
        }
        !self.expunge_handlers.is_empty()
    }
}

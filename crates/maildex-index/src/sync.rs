//! The sync driver: replay the transaction log onto a map.
//!
//! [`Index::sync_map`] opens a log view at the map's recorded offset,
//! replays every record through the applier (skipping ones the map already
//! folded in), recomputes the dirty bit, finalizes the map's log offsets,
//! mirrors the header into its serialized copy (and the mapped region, when
//! still mapped), and publishes the possibly-replaced map. Per-record
//! corruption never aborts the replay; it schedules a repair pass instead.

use maildex_error::Result;
use maildex_types::{IndexHeaderFlags, MailFlags};

use crate::applier::{SyncMapContext, SyncType};
use crate::index::{Index, IndexOpenFlags};
use crate::log::{LogPosition, LogSetOutcome, LogView};
use crate::map::{IndexMap, MapRef};

/// Outcome of a sync pass.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncResult {
    /// The map was advanced to the end of the log.
    Synced,
    /// The log no longer contains the map's recorded position; the caller
    /// typically re-initializes the index from scratch.
    LostLog {
        /// Human-readable description of what was lost.
        reason: String,
    },
}

impl Index {
    /// Replay the transaction log onto `map` from its recorded offset.
    ///
    /// Returns the possibly-replaced map. For `FILE` and `HEAD` syncs the
    /// index's published map pointer is rebound to it; `VIEW` syncs leave
    /// the published pointer alone.
    pub fn sync_map(
        &mut self,
        map: MapRef,
        sync_type: SyncType,
    ) -> Result<(SyncResult, MapRef)> {
        let (map_seq, start_offset) = {
            let m = map.borrow();
            let offset = if sync_type == SyncType::File {
                m.hdr.log_file_tail_offset
            } else {
                m.hdr.log_file_head_offset
            };
            (m.hdr.log_file_seq, offset)
        };

        let mut log_view = LogView::new(self.log.clone());
        let reset = match log_view.set(map_seq, start_offset)? {
            LogSetOutcome::NotFound { reason } => {
                let reason =
                    format!("Lost log for seq={map_seq} offset={start_offset}: {reason}");
                tracing::warn!(index = %self.filepath, "{reason}");
                return Ok((SyncResult::LostLog { reason }, map));
            }
            LogSetOutcome::Ok { reset } => reset,
        };

        // Reading much more from the log than preferred: remember that the
        // index should be rewritten soon.
        {
            let log = self.log.borrow();
            let head = log.head();
            let tail = map.borrow().hdr.log_file_tail_offset;
            if head.file_seq != map_seq
                || head.size().saturating_sub(tail) > self.optimization.rewrite_min_log_bytes
            {
                self.index_min_write = true;
            }
        }

        // Drop the published reference for the duration of the sync so the
        // map isn't treated as shared with ourselves; rebound at the end.
        let publish = matches!(sync_type, SyncType::File | SyncType::Head);
        if publish {
            self.map = None;
        }

        let had_dirty = map
            .borrow()
            .hdr
            .flags
            .contains(IndexHeaderFlags::HAVE_DIRTY);
        if had_dirty {
            map.borrow_mut().hdr.flags -= IndexHeaderFlags::HAVE_DIRTY;
        }

        let mut ctx = SyncMapContext::new(self, map, sync_type);
        ctx.cur_pos = log_view.prev_pos();

        if reset {
            // Reset the entire index, keeping only indexid, the new log
            // generation's position, and the FSCKD bit.
            let pos = log_view.prev_pos();
            let new_map = IndexMap::create(ctx.index.indexid);
            {
                let fsckd = ctx
                    .map
                    .borrow()
                    .hdr
                    .flags
                    .contains(IndexHeaderFlags::FSCKD);
                let mut m = new_map.borrow_mut();
                if fsckd {
                    m.hdr.flags |= IndexHeaderFlags::FSCKD;
                }
                m.hdr.log_file_seq = pos.seq;
                m.hdr.log_file_tail_offset = 0;
            }
            ctx.replace_map(new_map);
        }

        let mut io_error = None;
        loop {
            match log_view.next() {
                Ok(Some(rec)) => {
                    ctx.cur_pos = rec.pos;
                    let skip = {
                        let m = ctx.map.borrow();
                        rec.pos.is_before(LogPosition {
                            seq: m.hdr.log_file_seq,
                            offset: m.hdr.log_file_head_offset,
                        })
                    };
                    if skip {
                        // This record has been synced already.
                        debug_assert_eq!(ctx.sync_type, SyncType::File);
                        continue;
                    }
                    // Broken entries are recorded and skipped over.
                    let _ = ctx.sync_record(&rec.hdr, rec.data);
                }
                Ok(None) => break,
                Err(err) => {
                    io_error = Some(err);
                    break;
                }
            }
        }

        let errors = ctx.errors;
        let final_map = ctx.map();

        if io_error.is_none() {
            if had_dirty {
                update_hdr_dirty_flag(&final_map, ctx.index.flags);
            }
            ctx.modseq.end();
            ctx.cur_pos = log_view.prev_pos();
            ctx.update_log_offset_on(&final_map, true);
        }
        ctx.deinit();
        drop(ctx);

        if publish {
            self.map = Some(final_map.clone());
        }
        if let Some(err) = io_error {
            // The map is not mutated past the last successful record and
            // its offsets are not advanced; the caller decides retry policy.
            return Err(err);
        }

        if cfg!(debug_assertions) {
            final_map.borrow().check();
        }
        {
            let m = final_map.borrow();
            debug_assert!(m.hdr.indexid == self.indexid || m.hdr.indexid == 0);
        }

        // The transaction log tracks the newest safe tail offset to skip
        // over already-handled external transactions; piggy-back it.
        {
            let log = self.log.borrow();
            let head = log.head();
            let mut m = final_map.borrow_mut();
            debug_assert_eq!(m.hdr.log_file_seq, head.file_seq);
            if m.hdr.log_file_tail_offset < head.max_tail_offset {
                m.hdr.log_file_tail_offset = head.max_tail_offset;
            }
        }

        final_map.borrow_mut().sync_hdr_copy();
        final_map.borrow().write_back();

        let header_check = final_map.borrow().check_header();
        if let Err(detail) = header_check {
            tracing::error!(
                index = %self.filepath,
                "synchronization corrupted index header: {detail}"
            );
            self.fsck_requested = true;
        } else if errors {
            // Individual records hit corruption; have the index repaired.
            self.fsck_requested = true;
        }

        Ok((SyncResult::Synced, final_map))
    }

    /// Sync the published map to the log head.
    pub fn sync_to_head(&mut self) -> Result<SyncResult> {
        let map = self.map();
        let (result, _map) = self.sync_map(map, SyncType::Head)?;
        Ok(result)
    }

    /// Sync the published map the way the index-file writer does: from the
    /// tail offset, running expunge handlers.
    pub fn sync_file(&mut self) -> Result<SyncResult> {
        let map = self.map();
        let (result, _map) = self.sync_map(map, SyncType::File)?;
        Ok(result)
    }
}

/// Recompute HAVE_DIRTY by scanning for records still carrying DIRTY.
fn update_hdr_dirty_flag(map: &MapRef, flags: IndexOpenFlags) {
    {
        let m = map.borrow();
        if m.hdr.flags.contains(IndexHeaderFlags::HAVE_DIRTY)
            || flags.contains(IndexOpenFlags::NO_DIRTY)
        {
            return;
        }
    }
    let any_dirty = {
        let m = map.borrow();
        let record_size = m.hdr.record_size;
        let rm = m.rec_map().borrow();
        (1..=rm.records_count())
            .any(|seq| rm.record_at(seq, record_size).flags.contains(MailFlags::DIRTY))
    };
    if any_dirty {
        map.borrow_mut().hdr.flags |= IndexHeaderFlags::HAVE_DIRTY;
    }
}

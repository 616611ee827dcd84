//! Map extension table: intro, reset, header and record updates.
//!
//! Extensions are optional per-header and per-record data regions
//! registered by EXT_INTRO log records. The applier only routes and sizes
//! them; extension schemas live with their owners. Introducing or resizing
//! an extension re-layouts the record arena; updates from a stale
//! generation (mismatched `reset_id`) are dropped until an EXT_RESET
//! installs the new generation.

use maildex_types::{
    ExtAtomicInc, ExtIntro, ExtReset, HdrUpdateEntry, INDEX_RECORD_SIZE, pad4, read_u16,
    read_u32, write_u16, write_u32,
};

use crate::applier::{ApplyResult, RecordAborted, SyncMapContext};
use crate::map::MapRef;

/// One extension registered in a map.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MapExtension {
    /// Extension name.
    pub name: String,
    /// Data generation; updates carrying another generation are ignored.
    pub reset_id: u32,
    /// Offset of the extension's header area within the full header.
    pub hdr_offset: u32,
    /// Size of the extension's header area.
    pub hdr_size: u32,
    /// Offset of the extension's region within each record.
    pub record_offset: u32,
    /// Size of the extension's region within each record.
    pub record_size: u32,
    /// Alignment requirement of the record region.
    pub record_align: u32,
}

fn align_to(offset: u32, align: u32) -> u32 {
    if align <= 1 {
        offset
    } else {
        offset.div_ceil(align) * align
    }
}

/// Recompute header and record layouts for `new_exts` (sizes already set),
/// rebuild the header-copy buffer and record arena accordingly, and install
/// the table into the map.
///
/// Entry `i` of `new_exts` corresponds to entry `i` of the map's current
/// table; extra trailing entries are newly created and zero-filled. The
/// map must already be atomic (private record map).
fn install_layout(map: &MapRef, mut new_exts: Vec<MapExtension>) {
    let (old_exts, old_record_size, base_header_size) = {
        let m = map.borrow();
        (
            m.extensions.clone(),
            m.hdr.record_size,
            m.hdr.base_header_size,
        )
    };

    let mut header_size = base_header_size;
    for ext in &mut new_exts {
        ext.hdr_offset = header_size;
        header_size += pad4(ext.hdr_size as usize) as u32;
    }

    let mut record_end = INDEX_RECORD_SIZE as u32;
    for ext in &mut new_exts {
        if ext.record_size > 0 {
            ext.record_offset = align_to(record_end, ext.record_align.max(1));
            record_end = ext.record_offset + ext.record_size;
        } else {
            ext.record_offset = 0;
        }
    }
    let new_record_size = pad4(record_end as usize) as u32;

    let mut m = map.borrow_mut();

    let mut new_hdr_buf = vec![0u8; header_size as usize];
    let base_len = (base_header_size as usize).min(m.hdr_copy_buf.len());
    new_hdr_buf[..base_len].copy_from_slice(&m.hdr_copy_buf[..base_len]);
    for (i, ext) in new_exts.iter().enumerate() {
        if let Some(old) = old_exts.get(i) {
            let len = old.hdr_size.min(ext.hdr_size) as usize;
            let src = old.hdr_offset as usize;
            let dst = ext.hdr_offset as usize;
            new_hdr_buf[dst..dst + len].copy_from_slice(&m.hdr_copy_buf[src..src + len]);
        }
    }
    m.hdr_copy_buf = new_hdr_buf;
    m.hdr.header_size = header_size;

    let regions_moved = new_record_size != old_record_size
        || new_exts.iter().enumerate().any(|(i, ext)| {
            old_exts.get(i).is_some_and(|old| {
                old.record_offset != ext.record_offset || old.record_size != ext.record_size
            })
        });
    if regions_moved {
        let mut moves = vec![(0u32, 0u32, INDEX_RECORD_SIZE as u32)];
        for (i, ext) in new_exts.iter().enumerate() {
            if let Some(old) = old_exts.get(i) {
                let len = old.record_size.min(ext.record_size);
                if len > 0 {
                    moves.push((old.record_offset, ext.record_offset, len));
                }
            }
        }
        m.rec_map()
            .borrow_mut()
            .rebuild(old_record_size, new_record_size, &moves);
        m.hdr.record_size = new_record_size;
    }
    m.extensions = new_exts;
}

impl SyncMapContext<'_> {
    /// Handle one EXT_INTRO descriptor: establish the extension context for
    /// the records that follow, creating or resizing the map's extension as
    /// needed.
    pub(crate) fn sync_ext_intro(&mut self, intro: &ExtIntro) -> ApplyResult {
        let name = if !intro.name.is_empty() {
            intro.name.clone()
        } else if intro.ext_id != u32::MAX {
            match self.index.extension_name(intro.ext_id) {
                Some(name) => name.to_owned(),
                None => {
                    self.set_corrupted(format!(
                        "Extension intro for unknown id {}",
                        intro.ext_id
                    ));
                    return Err(RecordAborted);
                }
            }
        } else {
            self.set_corrupted("Extension intro without id or name");
            return Err(RecordAborted);
        };

        if intro.record_size > 0 && intro.record_align == 0 {
            self.set_corrupted(format!(
                "Extension {name} intro with record_size {} but no alignment",
                intro.record_size
            ));
            return Err(RecordAborted);
        }

        let known = self.index.extensions.iter().any(|e| e.name == name);
        if !known && !self.unknown_extensions.contains(&name) {
            self.unknown_extensions.push(name.clone());
        }

        let existing = self
            .map
            .borrow()
            .extensions
            .iter()
            .position(|e| e.name == name);

        match existing {
            Some(idx) => {
                let (reset_id, hdr_size, record_size) = {
                    let m = self.map.borrow();
                    let ext = &m.extensions[idx];
                    (ext.reset_id, ext.hdr_size, ext.record_size)
                };
                self.cur_ext_map_idx = Some(idx);
                self.cur_ext_record_size = u32::from(intro.record_size);
                self.cur_ext_ignore = intro.reset_id != reset_id;
                if !self.cur_ext_ignore
                    && (u32::from(intro.record_size) != record_size
                        || intro.hdr_size != hdr_size)
                {
                    self.resize_map_extension(idx, intro);
                }
            }
            None => {
                let map = self.get_atomic_map();
                let mut new_exts = map.borrow().extensions.clone();
                new_exts.push(MapExtension {
                    name,
                    reset_id: intro.reset_id,
                    hdr_offset: 0,
                    hdr_size: intro.hdr_size,
                    record_offset: 0,
                    record_size: u32::from(intro.record_size),
                    record_align: u32::from(intro.record_align).max(1),
                });
                let idx = new_exts.len() - 1;
                install_layout(&map, new_exts);
                self.cur_ext_map_idx = Some(idx);
                self.cur_ext_record_size = u32::from(intro.record_size);
                self.cur_ext_ignore = false;
            }
        }
        Ok(())
    }

    fn resize_map_extension(&mut self, idx: usize, intro: &ExtIntro) {
        let map = self.get_atomic_map();
        let mut new_exts = map.borrow().extensions.clone();
        new_exts[idx].hdr_size = intro.hdr_size;
        new_exts[idx].record_size = u32::from(intro.record_size);
        new_exts[idx].record_align = u32::from(intro.record_align).max(1);
        install_layout(&map, new_exts);
    }

    /// Handle an EXT_RESET: install the new data generation, zeroing the
    /// extension's header area and record regions unless asked to preserve.
    pub(crate) fn sync_ext_reset(&mut self, reset: &ExtReset) -> ApplyResult {
        let Some(idx) = self.cur_ext_map_idx else {
            self.set_corrupted("Extension reset without intro prefix");
            return Err(RecordAborted);
        };
        let map = self.get_atomic_map();
        {
            let mut m = map.borrow_mut();
            m.extensions[idx].reset_id = reset.new_reset_id;
            if !reset.preserve_data {
                let (hdr_offset, hdr_size, record_offset, record_size) = {
                    let ext = &m.extensions[idx];
                    (ext.hdr_offset, ext.hdr_size, ext.record_offset, ext.record_size)
                };
                let (start, end) = (hdr_offset as usize, (hdr_offset + hdr_size) as usize);
                m.hdr_copy_buf[start..end].fill(0);
                if record_size > 0 {
                    let stride = m.hdr.record_size;
                    let mut rm = m.rec_map().borrow_mut();
                    for seq in 1..=rm.records_count() {
                        let rec = rm.record_mut(seq, stride);
                        rec[record_offset as usize..(record_offset + record_size) as usize]
                            .fill(0);
                    }
                }
            }
        }
        // The reset defines the new generation; following updates apply.
        self.cur_ext_ignore = false;
        Ok(())
    }

    /// Handle one EXT_HDR_UPDATE entry (either size variant).
    pub(crate) fn sync_ext_hdr_update(&mut self, entry: &HdrUpdateEntry<'_>) -> ApplyResult {
        let Some(idx) = self.cur_ext_map_idx else {
            self.set_corrupted("Extension header updated without intro prefix");
            return Err(RecordAborted);
        };
        if self.cur_ext_ignore {
            return Ok(());
        }
        self.move_to_private_memory();
        let bounds = {
            let m = self.map.borrow();
            let ext = &m.extensions[idx];
            let len = entry.data.len() as u32;
            if entry.offset >= ext.hdr_size || entry.offset + len > ext.hdr_size {
                Err(format!(
                    "Extension header update outside range: {} + {len} > {}",
                    entry.offset, ext.hdr_size
                ))
            } else {
                Ok(ext.hdr_offset + entry.offset)
            }
        };
        match bounds {
            Ok(dst) => {
                let mut m = self.map.borrow_mut();
                let dst = dst as usize;
                m.hdr_copy_buf[dst..dst + entry.data.len()].copy_from_slice(entry.data);
                Ok(())
            }
            Err(detail) => {
                self.set_corrupted(detail);
                Err(RecordAborted)
            }
        }
    }

    /// Handle one EXT_REC_UPDATE entry: write the extension's record region
    /// for the message with `uid`. Unknown UIDs are skipped.
    pub(crate) fn sync_ext_rec_update(&mut self, uid: u32, data: &[u8]) -> ApplyResult {
        let idx = self
            .cur_ext_map_idx
            .expect("dispatcher checked the intro prefix");
        let Some(seq) = self.map.borrow().lookup_seq(uid) else {
            return Ok(());
        };
        let m = self.map.borrow();
        let ext = &m.extensions[idx];
        if ext.record_size == 0 {
            return Ok(());
        }
        let len = (ext.record_size as usize).min(data.len());
        let offset = ext.record_offset as usize;
        let stride = m.hdr.record_size;
        let mut rm = m.rec_map().borrow_mut();
        rm.record_mut(seq, stride)[offset..offset + len].copy_from_slice(&data[..len]);
        Ok(())
    }

    /// Handle one EXT_ATOMIC_INC entry: bounds-checked add on the
    /// extension's little-endian numeric field.
    pub(crate) fn sync_ext_atomic_inc(&mut self, inc: &ExtAtomicInc) -> ApplyResult {
        let idx = self
            .cur_ext_map_idx
            .expect("dispatcher checked the intro prefix");
        let Some(seq) = self.map.borrow().lookup_seq(inc.uid) else {
            return Ok(());
        };
        let (offset, field_size, stride) = {
            let m = self.map.borrow();
            let ext = &m.extensions[idx];
            (ext.record_offset as usize, ext.record_size, m.hdr.record_size)
        };
        if !matches!(field_size, 1 | 2 | 4 | 8) {
            self.set_corrupted(format!(
                "Extension atomic inc on {field_size}-byte field"
            ));
            return Err(RecordAborted);
        }

        let overflow = {
            let m = self.map.borrow();
            let mut rm = m.rec_map().borrow_mut();
            let field = &mut rm.record_mut(seq, stride)[offset..offset + field_size as usize];
            let old = match field_size {
                1 => u64::from(field[0]),
                2 => u64::from(read_u16(field, 0)),
                4 => u64::from(read_u32(field, 0)),
                _ => u64::from(read_u32(field, 0)) | (u64::from(read_u32(field, 4)) << 32),
            };
            let max = if field_size == 8 {
                u64::MAX as i128
            } else {
                (1i128 << (field_size * 8)) - 1
            };
            let new = i128::from(old) + i128::from(inc.diff);
            if new < 0 || new > max {
                true
            } else {
                let new = new as u64;
                match field_size {
                    1 => field[0] = new as u8,
                    2 => write_u16(field, 0, new as u16),
                    4 => write_u32(field, 0, new as u32),
                    _ => {
                        write_u32(field, 0, new as u32);
                        write_u32(field, 4, (new >> 32) as u32);
                    }
                }
                false
            }
        };
        if overflow {
            self.set_corrupted(format!(
                "Extension record inc/dec overflow for UID {} (diff {})",
                inc.uid, inc.diff
            ));
            return Err(RecordAborted);
        }
        Ok(())
    }

    /// Make sure the map carries an extension at least this large, growing
    /// it in place when needed. Returns the extension's map index.
    pub(crate) fn ensure_map_extension(
        &mut self,
        name: &str,
        hdr_size: u32,
        record_size: u32,
        record_align: u32,
    ) -> usize {
        let existing = self
            .map
            .borrow()
            .extensions
            .iter()
            .position(|e| e.name == name);
        if let Some(idx) = existing {
            let (cur_hdr, cur_rec) = {
                let m = self.map.borrow();
                (m.extensions[idx].hdr_size, m.extensions[idx].record_size)
            };
            if cur_hdr >= hdr_size && cur_rec >= record_size {
                return idx;
            }
            let map = self.get_atomic_map();
            let mut new_exts = map.borrow().extensions.clone();
            new_exts[idx].hdr_size = cur_hdr.max(hdr_size);
            new_exts[idx].record_size = cur_rec.max(record_size);
            install_layout(&map, new_exts);
            idx
        } else {
            let map = self.get_atomic_map();
            let mut new_exts = map.borrow().extensions.clone();
            new_exts.push(MapExtension {
                name: name.to_owned(),
                reset_id: 0,
                hdr_offset: 0,
                hdr_size,
                record_offset: 0,
                record_size,
                record_align: record_align.max(1),
            });
            let idx = new_exts.len() - 1;
            install_layout(&map, new_exts);
            idx
        }
    }
}

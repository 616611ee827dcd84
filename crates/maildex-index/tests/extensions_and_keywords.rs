//! Extension introduction, reset, record/header updates, and keywords.

use maildex_index::{Index, KEYWORDS_EXT_NAME, SyncResult};
use maildex_types::{ExtAtomicInc, ExtIntro, ExtReset, IndexRecord, KeywordModify, MailFlags};

fn new_index() -> Index {
    Index::new("testbox/maildex.index", 0x4d49)
}

fn plain_records(uids: &[u32]) -> Vec<IndexRecord> {
    uids.iter()
        .map(|&uid| IndexRecord::new(uid, MailFlags::empty()))
        .collect()
}

fn cache_intro(reset_id: u32) -> ExtIntro {
    ExtIntro {
        ext_id: u32::MAX,
        reset_id,
        hdr_size: 8,
        record_size: 4,
        record_align: 4,
        flags: 0,
        name: "cache".to_owned(),
    }
}

#[test]
fn intro_registers_extension_and_grows_records() {
    let mut index = new_index();
    {
        let log = index.log();
        let mut log = log.borrow_mut();
        log.append_records(&plain_records(&[1, 2]));
        log.append_ext_intro(&[cache_intro(1)]);
        log.append_ext_rec_updates(&[(1, &7u32.to_le_bytes())], 4);
    }
    assert_eq!(index.sync_to_head().expect("sync"), SyncResult::Synced);

    let map = index.map();
    let m = map.borrow();
    let ext = &m.extensions()[0];
    assert_eq!(ext.name, "cache");
    assert_eq!(ext.reset_id, 1);
    assert_eq!(ext.hdr_size, 8);
    assert_eq!(ext.record_size, 4);
    assert_eq!(ext.record_offset, 8);
    assert_eq!(m.hdr.record_size, 12);
    assert_eq!(m.hdr.header_size, 64 + 8);

    let bytes = m.record_bytes_at(1);
    assert_eq!(&bytes[8..12], &7u32.to_le_bytes());
    // The other record's extension region stayed zeroed.
    assert_eq!(&m.record_bytes_at(2)[8..12], &[0u8; 4]);
    assert!(!index.fsck_requested());
}

#[test]
fn ext_rec_update_without_intro_is_corruption() {
    let mut index = new_index();
    {
        let log = index.log();
        let mut log = log.borrow_mut();
        log.append_records(&plain_records(&[1]));
        log.append_ext_rec_updates(&[(1, &[9u8, 9, 9, 9])], 4);
    }
    index.sync_to_head().expect("sync");
    assert!(index.fsck_requested());
}

#[test]
fn ext_hdr_update_writes_extension_header_area() {
    let mut index = new_index();
    {
        let log = index.log();
        let mut log = log.borrow_mut();
        log.append_records(&plain_records(&[1]));
        log.append_ext_intro(&[cache_intro(1)]);
        log.append_ext_hdr_update(2, &[0xAB, 0xCD]);
        // Out of the 8-byte extension header: corruption.
        log.append_ext_intro(&[cache_intro(1)]);
        log.append_ext_hdr_update(6, &[1, 2, 3]);
    }
    index.sync_to_head().expect("sync");

    let map = index.map();
    let m = map.borrow();
    let hdr_offset = m.extensions()[0].hdr_offset as usize;
    assert_eq!(&m.hdr_copy_buf()[hdr_offset + 2..hdr_offset + 4], &[0xAB, 0xCD]);
    assert_eq!(&m.hdr_copy_buf()[hdr_offset + 6..hdr_offset + 8], &[0, 0]);
    assert!(index.fsck_requested());
}

#[test]
fn atomic_inc_applies_and_detects_underflow() {
    let mut index = new_index();
    {
        let log = index.log();
        let mut log = log.borrow_mut();
        log.append_records(&plain_records(&[1]));
        log.append_ext_intro(&[cache_intro(1)]);
        log.append_ext_atomic_incs(&[
            ExtAtomicInc { uid: 1, diff: 5 },
            ExtAtomicInc { uid: 1, diff: -2 },
        ]);
    }
    index.sync_to_head().expect("sync");
    {
        let map = index.map();
        let m = map.borrow();
        assert_eq!(&m.record_bytes_at(1)[8..12], &3u32.to_le_bytes());
        assert!(!index.fsck_requested());
    }

    {
        let log = index.log();
        let mut log = log.borrow_mut();
        log.append_ext_intro(&[cache_intro(1)]);
        log.append_ext_atomic_incs(&[ExtAtomicInc { uid: 1, diff: -10 }]);
    }
    index.sync_to_head().expect("sync underflow");
    let map = index.map();
    let m = map.borrow();
    // The impossible decrement was refused and flagged.
    assert_eq!(&m.record_bytes_at(1)[8..12], &3u32.to_le_bytes());
    assert!(index.fsck_requested());
}

#[test]
fn stale_generation_updates_are_ignored_until_reset() {
    let mut index = new_index();
    {
        let log = index.log();
        let mut log = log.borrow_mut();
        log.append_records(&plain_records(&[1]));
        log.append_ext_intro(&[cache_intro(1)]);
        log.append_ext_rec_updates(&[(1, &1u32.to_le_bytes())], 4);
    }
    index.sync_to_head().expect("setup sync");

    {
        let log = index.log();
        let mut log = log.borrow_mut();
        // Intro for generation 2 while the map still holds generation 1:
        // the update below must be dropped.
        log.append_ext_intro(&[cache_intro(2)]);
        log.append_ext_rec_updates(&[(1, &9u32.to_le_bytes())], 4);
        // The reset installs generation 2 and zeroes the data; the update
        // after it applies.
        log.append_ext_intro(&[cache_intro(2)]);
        log.append_ext_reset(ExtReset {
            new_reset_id: 2,
            preserve_data: false,
        });
        log.append_ext_rec_updates(&[(1, &5u32.to_le_bytes())], 4);
    }
    index.sync_to_head().expect("sync");

    let map = index.map();
    let m = map.borrow();
    assert_eq!(m.extensions()[0].reset_id, 2);
    assert_eq!(&m.record_bytes_at(1)[8..12], &5u32.to_le_bytes());
    assert!(!index.fsck_requested());
}

#[test]
fn ext_reset_preserving_data_keeps_records() {
    let mut index = new_index();
    {
        let log = index.log();
        let mut log = log.borrow_mut();
        log.append_records(&plain_records(&[1]));
        log.append_ext_intro(&[cache_intro(1)]);
        log.append_ext_rec_updates(&[(1, &8u32.to_le_bytes())], 4);
        log.append_ext_intro(&[cache_intro(1)]);
        log.append_ext_reset(ExtReset {
            new_reset_id: 3,
            preserve_data: true,
        });
    }
    index.sync_to_head().expect("sync");

    let map = index.map();
    let m = map.borrow();
    assert_eq!(m.extensions()[0].reset_id, 3);
    assert_eq!(&m.record_bytes_at(1)[8..12], &8u32.to_le_bytes());
}

#[test]
fn second_extension_lands_after_first() {
    let mut index = new_index();
    {
        let log = index.log();
        let mut log = log.borrow_mut();
        log.append_records(&plain_records(&[1]));
        log.append_ext_intro(&[cache_intro(1)]);
        log.append_ext_intro(&[ExtIntro {
            ext_id: u32::MAX,
            reset_id: 1,
            hdr_size: 4,
            record_size: 2,
            record_align: 2,
            flags: 0,
            name: "hdr-dates".to_owned(),
        }]);
        log.append_ext_rec_updates(&[(1, &[0x11, 0x22])], 2);
    }
    index.sync_to_head().expect("sync");

    let map = index.map();
    let m = map.borrow();
    let exts = m.extensions();
    assert_eq!(exts.len(), 2);
    assert_eq!(exts[0].record_offset, 8);
    assert_eq!(exts[1].record_offset, 12);
    assert_eq!(m.hdr.record_size, 16);
    assert_eq!(exts[1].hdr_offset, 64 + 8);
    assert_eq!(&m.record_bytes_at(1)[12..14], &[0x11, 0x22]);
}

#[test]
fn keyword_add_remove_and_reset() {
    let mut index = new_index();
    {
        let log = index.log();
        let mut log = log.borrow_mut();
        log.append_records(&plain_records(&[1, 2, 3]));
        log.append_keyword_update(KeywordModify::Add, "$Forwarded", &[(1, 2)]);
    }
    index.sync_to_head().expect("sync add");

    let bitmap_offset = {
        let map = index.map();
        let m = map.borrow();
        assert_eq!(m.keywords(), &["$Forwarded".to_owned()]);
        let ext = m
            .extensions()
            .iter()
            .find(|e| e.name == KEYWORDS_EXT_NAME)
            .expect("keywords extension created")
            .clone();
        assert!(ext.record_size >= 1);
        let offset = ext.record_offset as usize;
        assert_eq!(m.record_bytes_at(1)[offset] & 1, 1);
        assert_eq!(m.record_bytes_at(2)[offset] & 1, 1);
        assert_eq!(m.record_bytes_at(3)[offset] & 1, 0);
        offset
    };

    {
        let log = index.log();
        let mut log = log.borrow_mut();
        log.append_keyword_update(KeywordModify::Remove, "$Forwarded", &[(1, 1)]);
        log.append_keyword_update(KeywordModify::Add, "todo", &[(3, 3)]);
    }
    index.sync_to_head().expect("sync remove/add");
    {
        let map = index.map();
        let m = map.borrow();
        assert_eq!(m.keywords().len(), 2);
        assert_eq!(m.record_bytes_at(1)[bitmap_offset] & 1, 0);
        assert_eq!(m.record_bytes_at(2)[bitmap_offset] & 1, 1);
        // Second keyword is bit 1.
        assert_eq!(m.record_bytes_at(3)[bitmap_offset] & 2, 2);
    }

    {
        let log = index.log();
        log.borrow_mut().append_keyword_reset(&[(1, 3)]);
    }
    index.sync_to_head().expect("sync reset");
    let map = index.map();
    let m = map.borrow();
    for seq in 1..=3 {
        assert_eq!(m.record_bytes_at(seq)[bitmap_offset], 0);
    }
    // Names survive a reset; only the bitmap is cleared.
    assert_eq!(m.keywords().len(), 2);
}

#[test]
fn removing_unknown_keyword_is_a_no_op() {
    let mut index = new_index();
    {
        let log = index.log();
        let mut log = log.borrow_mut();
        log.append_records(&plain_records(&[1]));
        log.append_keyword_update(KeywordModify::Remove, "nothere", &[(1, 1)]);
    }
    index.sync_to_head().expect("sync");
    assert!(index.map().borrow().keywords().is_empty());
    assert!(!index.fsck_requested());
}

//! Property tests: counter equality, UID monotonicity, lowwater bounds,
//! compaction order preservation, and replay idempotence over arbitrary
//! operation sequences.

use maildex_index::{Index, IndexMap, MapRef, RecordMap};
use maildex_types::{FlagUpdate, IndexRecord, MailFlags, SeqRangeSet};
use proptest::prelude::*;

/// Abstract log operations; UIDs are assigned while building.
#[derive(Debug, Clone)]
enum Op {
    Append { count: u8 },
    Flag { lo: u32, hi: u32, add: u8, remove: u8 },
    Expunge { lo: u32, hi: u32 },
}

fn op_strategy() -> impl Strategy<Value = Op> {
    prop_oneof![
        (1u8..4).prop_map(|count| Op::Append { count }),
        (1u32..40, 1u32..40, any::<u8>(), any::<u8>()).prop_map(|(a, b, add, remove)| {
            Op::Flag {
                lo: a.min(b),
                hi: a.max(b),
                // Keep to real flag bits.
                add: add & 0x1f,
                remove: remove & 0x1f,
            }
        }),
        (1u32..40, 1u32..40).prop_map(|(a, b)| Op::Expunge {
            lo: a.min(b),
            hi: a.max(b),
        }),
    ]
}

fn build_index(ops: &[Op]) -> Index {
    let mut index = Index::new("propbox/maildex.index", 0x9999);
    let mut next_uid = 1u32;
    {
        let log = index.log();
        let mut log = log.borrow_mut();
        for op in ops {
            match op {
                Op::Append { count } => {
                    let records: Vec<_> = (0..*count)
                        .map(|i| IndexRecord::new(next_uid + u32::from(i), MailFlags::empty()))
                        .collect();
                    next_uid += u32::from(*count);
                    log.append_records(&records);
                }
                Op::Flag { lo, hi, add, remove } => {
                    log.append_flag_updates(&[FlagUpdate {
                        uid1: *lo,
                        uid2: *hi,
                        add_flags: MailFlags::from_bits_retain(*add),
                        remove_flags: MailFlags::from_bits_retain(*remove),
                        modseq_inc: false,
                    }]);
                }
                Op::Expunge { lo, hi } => {
                    log.append_expunge(&[(*lo, *hi)], true);
                }
            }
        }
    }
    index
}

/// Recompute every derived header field from the records and compare.
fn assert_derived_state_consistent(map: &MapRef) {
    let m = map.borrow();
    let h = &m.hdr;
    let mut seen = 0u32;
    let mut deleted = 0u32;
    let mut prev_uid = 0u32;
    for seq in 1..=h.messages_count {
        let rec = m.record_at(seq);
        assert!(rec.uid > prev_uid, "uid order broken at seq {seq}");
        assert!(rec.uid < h.next_uid);
        prev_uid = rec.uid;
        if rec.flags.contains(MailFlags::SEEN) {
            seen += 1;
        } else {
            assert!(
                rec.uid >= h.first_unseen_uid_lowwater,
                "unseen uid {} below lowwater {}",
                rec.uid,
                h.first_unseen_uid_lowwater
            );
        }
        if rec.flags.contains(MailFlags::DELETED) {
            deleted += 1;
            assert!(
                rec.uid >= h.first_deleted_uid_lowwater,
                "deleted uid {} below lowwater {}",
                rec.uid,
                h.first_deleted_uid_lowwater
            );
        }
    }
    assert_eq!(seen, h.seen_messages_count);
    assert_eq!(deleted, h.deleted_messages_count);
}

fn snapshot(map: &MapRef) -> (maildex_types::IndexHeader, Vec<Vec<u8>>) {
    let m = map.borrow();
    (
        m.hdr.clone(),
        (1..=m.hdr.messages_count)
            .map(|s| m.record_bytes_at(s))
            .collect(),
    )
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn derived_state_stays_consistent(ops in prop::collection::vec(op_strategy(), 0..12)) {
        let mut index = build_index(&ops);
        index.sync_to_head().expect("sync");
        prop_assert!(!index.fsck_requested());
        assert_derived_state_consistent(&index.map());
    }

    #[test]
    fn replay_is_idempotent(ops in prop::collection::vec(op_strategy(), 0..12)) {
        let mut index = build_index(&ops);
        index.sync_to_head().expect("first sync");
        let before = snapshot(&index.map());
        // A FILE sync walks the whole log again from the tail offset.
        index.sync_file().expect("second sync");
        let after = snapshot(&index.map());
        prop_assert_eq!(before, after);
    }

    #[test]
    fn compaction_keeps_survivors_in_order(
        count in 1u32..50,
        raw_ranges in prop::collection::vec((1u32..50, 0u32..5), 0..5),
    ) {
        let mut rm = RecordMap::default();
        for uid in 1..=count {
            rm.append(&IndexRecord::new(uid, MailFlags::empty()), 8);
        }

        let mut set = SeqRangeSet::new();
        for (start, extra) in raw_ranges {
            if start <= count {
                set.add_range(start, (start + extra).min(count));
            }
        }

        let removed = rm.compact(&set, 8);
        prop_assert_eq!(removed, set.count());

        let expected: Vec<u32> = (1..=count).filter(|&seq| !set.contains(seq)).collect();
        let survivors: Vec<u32> = (1..=rm.records_count()).map(|s| rm.uid_at(s, 8)).collect();
        // Records were appended with uid == original sequence, so the
        // survivor UIDs are exactly the non-expunged sequences, in order.
        prop_assert_eq!(survivors, expected);
    }

    #[test]
    fn cow_holder_never_observes_mutation(
        ops in prop::collection::vec(op_strategy(), 1..10),
        more in prop::collection::vec(op_strategy(), 1..6),
    ) {
        let mut index = build_index(&ops);
        index.sync_to_head().expect("first sync");
        let held = index.map();
        let held_before = snapshot(&held);

        // Append more operations and sync again while a holder exists.
        let mut next_uid = held.borrow().hdr.next_uid;
        {
            let log = index.log();
            let mut log = log.borrow_mut();
            for op in &more {
                match op {
                    Op::Append { count } => {
                        let records: Vec<_> = (0..*count)
                            .map(|i| IndexRecord::new(next_uid + u32::from(i), MailFlags::empty()))
                            .collect();
                        next_uid += u32::from(*count);
                        log.append_records(&records);
                    }
                    Op::Expunge { lo, hi } => {
                        log.append_expunge(&[(*lo, *hi)], true);
                    }
                    Op::Flag { .. } => {
                        // Flag updates intentionally write through the
                        // shared record map (siblings get counter fan-out),
                        // so they are not part of this isolation property.
                    }
                }
            }
        }
        index.sync_to_head().expect("second sync");

        // Structural changes never leak into the held map.
        let held_after = snapshot(&held);
        prop_assert_eq!(held_before.0.messages_count, held_after.0.messages_count);
        prop_assert_eq!(held_before.1, held_after.1);
        assert_derived_state_consistent(&index.map());
    }
}

#[test]
fn empty_log_sync_is_clean() {
    let mut index = Index::new("propbox/maildex.index", 1);
    index.sync_to_head().expect("sync");
    let map = index.map();
    assert_eq!(map.borrow().hdr.messages_count, 0);
    assert_eq!(map.borrow().hdr.log_file_seq, 1);
    assert!(!index.fsck_requested());
}

#[test]
fn synced_map_round_trips_through_region() {
    use std::cell::RefCell;
    use std::rc::Rc;

    // Build a region from a synced index.
    let mut source = Index::new("propbox/maildex.index", 5);
    {
        let log = source.log();
        log.borrow_mut().append_records(&[
            IndexRecord::new(1, MailFlags::SEEN),
            IndexRecord::new(2, MailFlags::empty()),
        ]);
    }
    source.sync_to_head().expect("sync source");
    // SEEN arrived via the append records themselves.
    assert_eq!(source.map().borrow().hdr.seen_messages_count, 1);

    let region = {
        let map = source.map();
        let m = map.borrow();
        let mut bytes = m.hdr_copy_buf().to_vec();
        for seq in 1..=m.hdr.messages_count {
            bytes.extend_from_slice(&m.record_bytes_at(seq));
        }
        Rc::new(RefCell::new(bytes))
    };
    let reopened = IndexMap::open_from_region(region).expect("open");
    assert_eq!(reopened.borrow().hdr.seen_messages_count, 1);
    assert_derived_state_consistent(&reopened);
}

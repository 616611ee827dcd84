//! Derived counter and lowwater maintenance.
//!
//! `seen_messages_count`, `deleted_messages_count`, and the unseen/deleted
//! UID lowwaters are redundant state derived from the record flags; they are
//! updated incrementally on every flag transition and must stay consistent
//! with the record array at every step. Counter updates fan out to every
//! index map sharing the record map whose `next_uid` covers the UID, so
//! sibling views stay consistent with the shared record bytes.

use maildex_types::{IndexHeader, MailFlags};

use crate::map::MapRef;

/// Apply one record's flag transition to a header's counters.
///
/// Returns the offending counter's name when the transition is impossible,
/// which the caller reports as corruption.
pub fn update_counts(
    hdr: &mut IndexHeader,
    old_flags: MailFlags,
    new_flags: MailFlags,
) -> Result<(), &'static str> {
    let changed = old_flags ^ new_flags;

    if changed.contains(MailFlags::SEEN) {
        if old_flags.contains(MailFlags::SEEN) {
            if hdr.seen_messages_count == 0 {
                return Err("Seen counter wrong");
            }
            hdr.seen_messages_count -= 1;
        } else {
            if hdr.seen_messages_count >= hdr.messages_count {
                return Err("Seen counter wrong");
            }
            hdr.seen_messages_count += 1;
            if hdr.seen_messages_count == hdr.messages_count {
                hdr.first_unseen_uid_lowwater = hdr.next_uid;
            }
        }
    }

    if changed.contains(MailFlags::DELETED) {
        if old_flags.contains(MailFlags::DELETED) {
            if hdr.deleted_messages_count == 0 || hdr.deleted_messages_count > hdr.messages_count {
                return Err("Deleted counter wrong");
            }
            hdr.deleted_messages_count -= 1;
            if hdr.deleted_messages_count == 0 {
                hdr.first_deleted_uid_lowwater = hdr.next_uid;
            }
        } else {
            hdr.deleted_messages_count += 1;
            if hdr.deleted_messages_count > hdr.messages_count {
                return Err("Deleted counter wrong");
            }
        }
    }
    Ok(())
}

/// Tighten one header's lowwaters for a record now carrying `flags`.
pub fn update_lowwaters(hdr: &mut IndexHeader, uid: u32, flags: MailFlags) {
    if !flags.contains(MailFlags::SEEN) && uid < hdr.first_unseen_uid_lowwater {
        hdr.first_unseen_uid_lowwater = uid;
    }
    if flags.contains(MailFlags::DELETED) && uid < hdr.first_deleted_uid_lowwater {
        hdr.first_deleted_uid_lowwater = uid;
    }
}

/// Tighten the lowwaters of every map sharing `map`'s record map.
pub fn update_lowwaters_all(map: &MapRef, uid: u32, flags: MailFlags) {
    let siblings = {
        let rec_map = map.borrow().rec_map().clone();
        let siblings = rec_map.borrow_mut().shared_maps();
        siblings
    };
    for sibling in siblings {
        update_lowwaters(&mut sibling.borrow_mut().hdr, uid, flags);
    }
}

/// Apply a flag transition to the counters of every map sharing `map`'s
/// record map whose `next_uid` covers the UID.
///
/// Returns the error messages of every map whose counters broke.
pub fn update_counts_all(
    map: &MapRef,
    uid: u32,
    old_flags: MailFlags,
    new_flags: MailFlags,
) -> Vec<&'static str> {
    let siblings = {
        let rec_map = map.borrow().rec_map().clone();
        let siblings = rec_map.borrow_mut().shared_maps();
        siblings
    };
    let mut errors = Vec::new();
    for sibling in siblings {
        let mut m = sibling.borrow_mut();
        if uid >= m.hdr.next_uid {
            continue;
        }
        if let Err(msg) = update_counts(&mut m.hdr, old_flags, new_flags) {
            errors.push(msg);
        }
    }
    errors
}

//! Mailbox index maps and the sync-map applier.
//!
//! Each mailbox has a compact binary index (header + fixed-size records +
//! optional per-message extension data) and a transaction log. This crate
//! advances an in-memory index map by replaying log records from the map's
//! recorded offset: decoding heterogeneous record types, maintaining derived
//! counters and lowwater marks, invoking expunge side-effect handlers, and
//! publishing the new map atomically under copy-on-write sharing.
//!
//! The entry point is [`Index::sync_map`]. Maps are reference-counted and
//! shared read-only between views; any structural mutation first takes the
//! copy-on-write primitives in [`map`]. Corruption found while replaying a
//! record is localized: the record is abandoned, the error logged, and the
//! sync continues. The driver schedules a repair pass at the end instead of
//! propagating a failure mid-stream.

pub mod applier;
pub mod counters;
pub mod expunge;
pub mod ext;
pub mod index;
pub mod keywords;
pub mod log;
pub mod map;
pub mod modseq;
pub mod rec_map;
pub mod sync;

pub use applier::{ApplyResult, RecordAborted, SyncMapContext, SyncType};
pub use ext::MapExtension;
pub use index::{
    ExpungeEvent, ExpungeHandler, ExpungeHandlerFn, Index, IndexOpenFlags, OptimizationSettings,
    RegisteredExtension, SyncCommitResult,
};
pub use keywords::KEYWORDS_EXT_NAME;
pub use log::{
    LOG_FILE_HDR_SIZE, LogPosition, LogRecord, LogRef, LogSetOutcome, LogView, TransactionLog,
};
pub use map::{IndexMap, MapRef, MapResidence};
pub use modseq::{ModseqSetResult, ModseqSync, ModseqTracking};
pub use rec_map::{RecMapRef, RecordMap};
pub use sync::SyncResult;

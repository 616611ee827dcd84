//! The index object: published map, transaction log, and registries.
//!
//! An `Index` ties one mailbox's published map to its transaction log and
//! carries the capability registries the applier consults during a sync:
//! known extensions, expunge side-effect handlers, keyword state, open
//! flags, and the commit result of the caller's just-committed transaction.

use std::cell::RefCell;
use std::rc::Rc;

use crate::log::{LogRef, TransactionLog};
use crate::map::{IndexMap, MapRef};

bitflags::bitflags! {
    /// Behavior toggles set when the index is opened.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct IndexOpenFlags: u32 {
        /// Never track the DIRTY flag or the HAVE_DIRTY header bit.
        const NO_DIRTY = 0x01;
    }
}

/// Tunables consulted by the sync driver.
#[derive(Debug, Clone)]
pub struct OptimizationSettings {
    /// When a sync reads more than this many log bytes past the map's tail
    /// offset, the index is marked for rewrite.
    pub rewrite_min_log_bytes: u32,
}

impl Default for OptimizationSettings {
    fn default() -> Self {
        Self {
            rewrite_min_log_bytes: 8 * 1024,
        }
    }
}

/// Result of the transaction the caller just committed, installed before a
/// sync so the modseq sub-applier can attribute ignored updates to it.
#[derive(Debug, Clone, Default)]
pub struct SyncCommitResult {
    /// Log file the transaction was written to.
    pub log_file_seq: u32,
    /// End offset of the transaction in that file.
    pub log_file_offset: u32,
    /// Total byte size of the committed transaction.
    pub commit_size: u32,
    /// Modseq updates from this transaction the applier ignored.
    pub ignored_modseq_changes: u32,
}

/// What an expunge handler sees for each expunged record, before the record
/// array is compacted.
#[derive(Debug)]
pub struct ExpungeEvent<'a> {
    /// UID of the record being expunged.
    pub uid: u32,
    /// Its current (pre-compaction) sequence.
    pub seq: u32,
    /// Record bytes from the handler's registered offset to record end.
    pub ext_data: &'a [u8],
}

/// Boxed expunge side-effect handler.
pub type ExpungeHandlerFn = Box<dyn FnMut(&ExpungeEvent<'_>)>;

/// One registered expunge handler.
pub struct ExpungeHandler {
    /// Index-level extension id the handler belongs to.
    pub ext_id: u32,
    /// Byte offset within the record handed to the handler.
    pub record_offset: u32,
    /// The handler itself; per-handler context lives in the closure.
    pub handler: ExpungeHandlerFn,
}

/// An extension known at the index level; its id is its position in the
/// registry and is what EXT_INTRO records reference.
#[derive(Debug, Clone)]
pub struct RegisteredExtension {
    /// Extension name.
    pub name: String,
}

/// One mailbox's index: published map, log, and registries.
pub struct Index {
    pub(crate) indexid: u32,
    pub(crate) filepath: String,
    pub(crate) log: LogRef,
    pub(crate) map: Option<MapRef>,
    pub(crate) flags: IndexOpenFlags,
    pub(crate) optimization: OptimizationSettings,
    pub(crate) extensions: Vec<RegisteredExtension>,
    pub(crate) expunge_handlers: Vec<ExpungeHandler>,
    pub(crate) modseq_enabled: bool,
    /// A non-external INDEX_DELETED record was seen; the next sync is
    /// expected to finish the deletion.
    pub index_delete_requested: bool,
    pub(crate) fsck_requested: bool,
    pub(crate) index_min_write: bool,
    /// Installed by the committing caller; consulted and updated during the
    /// following sync.
    pub sync_commit_result: Option<SyncCommitResult>,
}

impl Index {
    /// Create an in-memory index with a fresh map and an empty log.
    #[must_use]
    pub fn new(filepath: &str, indexid: u32) -> Self {
        Self {
            indexid,
            filepath: filepath.to_owned(),
            log: Rc::new(RefCell::new(TransactionLog::new())),
            map: Some(IndexMap::create(indexid)),
            flags: IndexOpenFlags::empty(),
            optimization: OptimizationSettings::default(),
            extensions: Vec::new(),
            expunge_handlers: Vec::new(),
            modseq_enabled: false,
            index_delete_requested: false,
            fsck_requested: false,
            index_min_write: false,
            sync_commit_result: None,
        }
    }

    /// Create an index with explicit open flags.
    #[must_use]
    pub fn with_flags(filepath: &str, indexid: u32, flags: IndexOpenFlags) -> Self {
        let mut index = Self::new(filepath, indexid);
        index.flags = flags;
        index
    }

    /// The index's identifier.
    #[must_use]
    pub const fn indexid(&self) -> u32 {
        self.indexid
    }

    /// The index path used in log messages.
    #[must_use]
    pub fn filepath(&self) -> &str {
        &self.filepath
    }

    /// The published map. Replaced only by `FILE`/`HEAD` syncs.
    #[must_use]
    pub fn map(&self) -> MapRef {
        self.map.clone().expect("index always has a published map")
    }

    /// Install a map as the published one (e.g. one opened from a region).
    pub fn set_map(&mut self, map: MapRef) {
        self.map = Some(map);
    }

    /// Shared handle to the transaction log.
    #[must_use]
    pub fn log(&self) -> LogRef {
        self.log.clone()
    }

    /// Register an extension; returns its index-level id.
    pub fn register_extension(&mut self, name: &str) -> u32 {
        if let Some(id) = self.extensions.iter().position(|e| e.name == name) {
            return id as u32;
        }
        self.extensions.push(RegisteredExtension {
            name: name.to_owned(),
        });
        (self.extensions.len() - 1) as u32
    }

    /// Name of a registered extension, if the id is known.
    #[must_use]
    pub fn extension_name(&self, ext_id: u32) -> Option<&str> {
        self.extensions
            .get(ext_id as usize)
            .map(|e| e.name.as_str())
    }

    /// Register an expunge handler for an extension. During `FILE` syncs the
    /// handler runs once per expunged record, before compaction.
    pub fn register_expunge_handler(
        &mut self,
        ext_id: u32,
        record_offset: u32,
        handler: ExpungeHandlerFn,
    ) {
        self.expunge_handlers.push(ExpungeHandler {
            ext_id,
            record_offset,
            handler,
        });
    }

    /// Enable modseq tracking for this index. Modseq updates replayed
    /// before this is called are corruption.
    pub fn enable_modseq(&mut self) {
        self.modseq_enabled = true;
    }

    /// Whether modseq tracking is enabled.
    #[must_use]
    pub const fn modseq_enabled(&self) -> bool {
        self.modseq_enabled
    }

    /// Whether a sync flagged the index for repair.
    #[must_use]
    pub const fn fsck_requested(&self) -> bool {
        self.fsck_requested
    }

    /// Whether a sync decided the index should be rewritten soon.
    #[must_use]
    pub const fn index_min_write(&self) -> bool {
        self.index_min_write
    }
}

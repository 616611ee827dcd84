use std::path::PathBuf;

use thiserror::Error;

/// Primary error type for Maildex index operations.
///
/// Corruption detected while replaying individual transaction records is a
/// data condition, not an error: the applier records it in its sync context
/// and keeps going. This enum covers the surfaces that abort an operation:
/// I/O failures, a lost transaction log, and malformed on-disk structures
/// found before replay starts.
#[derive(Error, Debug)]
pub enum IndexError {
    // === I/O ===
    /// File or byte-range provider I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Short read from the byte-range provider.
    #[error("short read: expected {expected} bytes, got {actual}")]
    ShortRead { expected: usize, actual: usize },

    // === Index file ===
    /// Index file is corrupt in a way that prevents opening it at all.
    #[error("corrupted index {path}: {detail}")]
    Corrupt { path: PathBuf, detail: String },

    /// Index header failed validation.
    #[error("invalid index header in {path}: {detail}")]
    InvalidHeader { path: PathBuf, detail: String },

    // === Transaction log ===
    /// The log view could not seek to the recorded position; the caller
    /// typically re-initializes the index from scratch.
    #[error("lost transaction log at seq={seq} offset={offset}: {reason}")]
    LostLog { seq: u32, offset: u32, reason: String },

    /// A transaction record in the log is structurally unreadable.
    #[error("broken transaction log record at seq={seq} offset={offset}: {detail}")]
    BrokenRecord { seq: u32, offset: u32, detail: String },

    // === Misuse ===
    /// An extension id or name was used that is not registered.
    #[error("unknown extension: {name}")]
    UnknownExtension { name: String },

    /// Internal logic error (should never happen).
    #[error("internal error: {0}")]
    Internal(String),
}

impl IndexError {
    /// Create a `Corrupt` error for an index path.
    pub fn corrupt(path: impl Into<PathBuf>, detail: impl Into<String>) -> Self {
        Self::Corrupt {
            path: path.into(),
            detail: detail.into(),
        }
    }

    /// Create an `InvalidHeader` error for an index path.
    pub fn invalid_header(path: impl Into<PathBuf>, detail: impl Into<String>) -> Self {
        Self::InvalidHeader {
            path: path.into(),
            detail: detail.into(),
        }
    }

    /// Create an `Internal` error.
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }

    /// Whether retrying the operation may succeed without intervention.
    pub const fn is_transient(&self) -> bool {
        matches!(self, Self::Io(_) | Self::ShortRead { .. })
    }
}

/// Result type alias using `IndexError`.
pub type Result<T> = std::result::Result<T, IndexError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_display_corrupt() {
        let err = IndexError::corrupt("mbox/maildex.index", "uid order broken");
        assert_eq!(
            err.to_string(),
            "corrupted index mbox/maildex.index: uid order broken"
        );
    }

    #[test]
    fn error_display_lost_log() {
        let err = IndexError::LostLog {
            seq: 3,
            offset: 1024,
            reason: "file_seq too old".to_owned(),
        };
        assert_eq!(
            err.to_string(),
            "lost transaction log at seq=3 offset=1024: file_seq too old"
        );
    }

    #[test]
    fn io_error_from() {
        let io_err = std::io::Error::new(std::io::ErrorKind::UnexpectedEof, "truncated");
        let err: IndexError = io_err.into();
        assert!(matches!(err, IndexError::Io(_)));
        assert!(err.is_transient());
    }

    #[test]
    fn is_transient() {
        assert!(IndexError::ShortRead {
            expected: 64,
            actual: 12
        }
        .is_transient());
        assert!(!IndexError::internal("bug").is_transient());
        assert!(!IndexError::corrupt("x", "y").is_transient());
    }
}

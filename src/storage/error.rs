use std::path::PathBuf;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("short read in slot {slot}: wanted {wanted} bytes, got {got}")]
    ShortRead { slot: u32, wanted: usize, got: usize },

    #[error("{what} {index} out of range (limit {limit})")]
    OutOfRange {
        what: &'static str,
        index: u64,
        limit: u64,
    },

    #[error("resume data rejected: {0}")]
    ResumeDataRejected(#[from] ResumeRejection),

    #[error("fatal disk error: {0}")]
    FatalDisk(String),

    #[error("file check aborted")]
    CheckAborted,

    #[error("piece {0} is not stored in any slot")]
    PieceNotStored(u32),

    #[error("no free slot available for piece {0}")]
    NoFreeSlot(u32),

    #[error("path traversal detected in file path: {0}")]
    PathTraversal(String),

    #[error("torrent not registered: {0}")]
    TorrentNotFound(String),

    #[error("disk worker has shut down")]
    WorkerGone,

    #[error("resume data encoding: {0}")]
    Encoding(#[from] serde_json::Error),
}

impl StorageError {
    pub(crate) fn out_of_range(what: &'static str, index: impl Into<u64>, limit: impl Into<u64>) -> Self {
        StorageError::OutOfRange {
            what,
            index: index.into(),
            limit: limit.into(),
        }
    }

    /// Whether the error means "the bytes are not there" rather than a
    /// failing disk.
    pub fn is_missing_data(&self) -> bool {
        match self {
            StorageError::ShortRead { .. } => true,
            StorageError::Io(e) => e.kind() == std::io::ErrorKind::NotFound,
            _ => false,
        }
    }
}

/// Why fast-resume data could not be trusted.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ResumeRejection {
    #[error("missing file sizes")]
    MissingFileSizes,

    #[error("file count mismatch: resume data has {recorded}, torrent has {actual}")]
    FileCountMismatch { recorded: usize, actual: usize },

    #[error("file size mismatch for {path}: expected {expected}, found {actual}")]
    SizeMismatch {
        path: PathBuf,
        expected: u64,
        actual: u64,
    },

    #[error("timestamp mismatch for {path}: expected {expected}, found {actual}")]
    TimestampMismatch {
        path: PathBuf,
        expected: i64,
        actual: i64,
    },

    #[error("piece length mismatch: resume data has {recorded}, torrent has {actual}")]
    PieceLengthMismatch { recorded: u32, actual: u32 },

    #[error("slot map has {slots} entries for {pieces} pieces")]
    TooManySlots { slots: usize, pieces: usize },

    #[error("invalid piece index {0} in slot map")]
    InvalidPiece(i64),

    #[error("piece {0} appears twice in slot map")]
    DuplicatePiece(u32),

    #[error("mapped file count mismatch: resume data has {recorded}, torrent has {actual}")]
    MappedFileCountMismatch { recorded: usize, actual: usize },
}

//! Error types for dsrepl core.

use dsrepl_storage::StorageError;
use std::io;
use std::path::PathBuf;
use thiserror::Error;

/// Result type for changelog operations.
pub type ChangelogResult<T> = Result<T, ChangelogError>;

/// Errors raised by the changelog.
///
/// Any of these on a domain's changelog makes that domain unavailable for
/// writes; other domains keep running.
#[derive(Debug, Error)]
pub enum ChangelogError {
    /// Storage backend error.
    #[error("storage error: {0}")]
    Storage(#[from] StorageError),

    /// I/O error outside a backend (directory listing, rename, delete).
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// A segment file could not be opened for reading.
    #[error("segment {path} unavailable: {source}")]
    Unavailable {
        /// Segment file.
        path: PathBuf,
        /// Underlying failure.
        #[source]
        source: StorageError,
    },

    /// A segment holds bytes that are not a valid record.
    #[error("corrupt segment {path} at offset {offset}: {message}")]
    Corrupted {
        /// Segment file.
        path: PathBuf,
        /// Offset of the bad record.
        offset: u64,
        /// Description of the corruption.
        message: String,
    },

    /// A record failed its checksum.
    #[error(
        "checksum mismatch in {path} at offset {offset}: expected {expected:#010x}, found {actual:#010x}"
    )]
    ChecksumMismatch {
        /// Segment file.
        path: PathBuf,
        /// Offset of the bad record.
        offset: u64,
        /// CRC stored in the record.
        expected: u32,
        /// CRC computed over the payload.
        actual: u32,
    },

    /// A record payload could not be encoded or decoded.
    #[error("record codec error: {0}")]
    Codec(String),

    /// Another process holds the changelog directory lock.
    #[error("changelog directory {0} is locked by another writer")]
    Locked(PathBuf),

    /// An earlier write failed; the log refuses further appends.
    #[error("changelog {0} failed earlier and refuses writes")]
    WriterFailed(PathBuf),

    /// The changelog was closed and gave up its directory lock.
    #[error("changelog {0} is closed")]
    Closed(PathBuf),

    /// A record is larger than the envelope allows.
    #[error("record of {size} bytes exceeds the {max} byte limit")]
    RecordTooLarge {
        /// Encoded payload size.
        size: usize,
        /// Maximum payload size.
        max: usize,
    },
}

impl ChangelogError {
    /// Creates a corruption error.
    pub fn corrupted(path: impl Into<PathBuf>, offset: u64, message: impl Into<String>) -> Self {
        Self::Corrupted {
            path: path.into(),
            offset,
            message: message.into(),
        }
    }

    /// Returns true if the on-disk data itself is damaged.
    #[must_use]
    pub fn is_corruption(&self) -> bool {
        matches!(self, Self::Corrupted { .. } | Self::ChecksumMismatch { .. })
    }
}

/// The sequence number space of one millisecond ran out.
///
/// Fatal to the write that requested the CSN only. The next clock tick
/// resets the sequence number.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("CSN sequence exhausted for replica {replica_id} at {time} ms")]
pub struct CsnExhausted {
    /// Millisecond whose sequence numbers are used up.
    pub time: u64,
    /// Replica that asked for the CSN.
    pub replica_id: u16,
}

/// Result type for server state persistence.
pub type StateResult<T> = Result<T, StateError>;

/// Errors raised while loading or saving a persisted server state.
#[derive(Debug, Error)]
pub enum StateError {
    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// The state file is malformed.
    #[error("corrupt server state file {path}: {message}")]
    Corrupted {
        /// State file.
        path: PathBuf,
        /// Description of the problem.
        message: String,
    },

    /// The state file belongs to another domain.
    #[error("server state file holds domain {found}, expected {expected}")]
    DomainMismatch {
        /// Domain the caller asked for.
        expected: String,
        /// Domain recorded in the file.
        found: String,
    },
}

impl StateError {
    pub(crate) fn corrupted(path: impl Into<PathBuf>, message: impl Into<String>) -> Self {
        Self::Corrupted {
            path: path.into(),
            message: message.into(),
        }
    }
}

//! Segment bookkeeping shared by the writer and its readers.

use super::reader::KeyMatch;
use super::record::{decode_envelope, EnvelopeRead, LogRecord};
use crate::error::{ChangelogError, ChangelogResult};
use dsrepl_storage::{FileBackend, StorageBackend};
use parking_lot::RwLock;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::{Duration, Instant};
use tracing::trace;

/// Diagnostic view of one segment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SegmentInfo<K> {
    /// Segment file.
    pub path: PathBuf,
    /// Key of the first record.
    pub first_key: Option<K>,
    /// Key of the last record.
    pub last_key: Option<K>,
    /// Number of records.
    pub records: usize,
    /// Size in bytes of the complete records.
    pub bytes: u64,
    /// False for the active head segment.
    pub sealed: bool,
}

/// One segment file and its in-memory key index.
///
/// The index maps every record key to its offset. The writer pushes to it
/// after the bytes are written, so readers never see a key whose record is
/// incomplete.
#[derive(Debug)]
pub(crate) struct Segment<K> {
    id: u64,
    path: RwLock<PathBuf>,
    index: RwLock<Vec<(K, u64)>>,
    len: AtomicU64,
    sealed: AtomicBool,
    opened_at: Instant,
}

impl<K: Ord + Copy> Segment<K> {
    pub(crate) fn new(id: u64, path: PathBuf, index: Vec<(K, u64)>, len: u64, sealed: bool) -> Self {
        Self {
            id,
            path: RwLock::new(path),
            index: RwLock::new(index),
            len: AtomicU64::new(len),
            sealed: AtomicBool::new(sealed),
            opened_at: Instant::now(),
        }
    }

    pub(crate) fn id(&self) -> u64 {
        self.id
    }

    pub(crate) fn path(&self) -> PathBuf {
        self.path.read().clone()
    }

    /// Renames the file to `sealed_path` and marks the segment sealed.
    ///
    /// The rename and the path update happen under the path lock that
    /// [`Segment::open_read_only`] holds, so a reader opens either the old
    /// name before the rename or the new one after it.
    pub(crate) fn seal_as(&self, sealed_path: PathBuf) -> io::Result<()> {
        let mut path = self.path.write();
        fs::rename(&*path, &sealed_path)?;
        *path = sealed_path;
        self.sealed.store(true, Ordering::Release);
        Ok(())
    }

    /// Opens a read-only handle on the segment file.
    pub(crate) fn open_read_only(&self) -> ChangelogResult<FileBackend> {
        let path = self.path.read();
        trace!(path = %path.display(), "opening segment reader");
        FileBackend::open_read_only(&path).map_err(|source| ChangelogError::Unavailable {
            path: path.clone(),
            source,
        })
    }

    pub(crate) fn is_sealed(&self) -> bool {
        self.sealed.load(Ordering::Acquire)
    }

    pub(crate) fn len(&self) -> u64 {
        self.len.load(Ordering::Acquire)
    }

    pub(crate) fn age(&self) -> Duration {
        self.opened_at.elapsed()
    }

    pub(crate) fn first_key(&self) -> Option<K> {
        self.index.read().first().map(|(k, _)| *k)
    }

    pub(crate) fn last_key(&self) -> Option<K> {
        self.index.read().last().map(|(k, _)| *k)
    }

    pub(crate) fn record_count(&self) -> usize {
        self.index.read().len()
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.index.read().is_empty()
    }

    pub(crate) fn push(&self, key: K, offset: u64, end: u64) {
        self.index.write().push((key, offset));
        self.len.store(end, Ordering::Release);
    }

    /// Index position of the first record matching `key` under `matching`.
    pub(crate) fn position(&self, key: K, matching: KeyMatch) -> usize {
        let index = self.index.read();
        match matching {
            KeyMatch::AtOrAfter => index.partition_point(|(k, _)| *k < key),
            KeyMatch::After => index.partition_point(|(k, _)| *k <= key),
        }
    }

    pub(crate) fn entry_at(&self, position: usize) -> Option<(K, u64)> {
        self.index.read().get(position).copied()
    }

    /// True if some record in this segment satisfies `key` under `matching`.
    pub(crate) fn reaches(&self, key: K, matching: KeyMatch) -> bool {
        match (self.last_key(), matching) {
            (Some(last), KeyMatch::AtOrAfter) => last >= key,
            (Some(last), KeyMatch::After) => last > key,
            (None, _) => false,
        }
    }

    pub(crate) fn info(&self) -> SegmentInfo<K> {
        let index = self.index.read();
        SegmentInfo {
            path: self.path(),
            first_key: index.first().map(|(k, _)| *k),
            last_key: index.last().map(|(k, _)| *k),
            records: index.len(),
            bytes: self.len(),
            sealed: self.is_sealed(),
        }
    }
}

/// Outcome of scanning a segment file from the start.
#[derive(Debug)]
pub(crate) struct ScanOutcome<K> {
    pub(crate) index: Vec<(K, u64)>,
    /// Offset just past the last complete record.
    pub(crate) valid_len: u64,
    /// True if bytes after `valid_len` form a torn record.
    pub(crate) torn: bool,
}

/// Reads every record of a segment, checking checksums and key order.
pub(crate) fn scan_segment<R: LogRecord>(
    backend: &dyn StorageBackend,
    path: &Path,
) -> ChangelogResult<ScanOutcome<R::Key>> {
    let limit = backend.size()?;
    let mut index: Vec<(R::Key, u64)> = Vec::new();
    let mut offset = 0;

    loop {
        match decode_envelope(backend, offset, limit, path)? {
            EnvelopeRead::Record {
                payload,
                next_offset,
            } => {
                let record = R::decode_payload(&payload)?;
                let key = record.key();
                if let Some((last, _)) = index.last() {
                    if key <= *last {
                        return Err(ChangelogError::corrupted(
                            path,
                            offset,
                            format!("key {key} does not follow {last}"),
                        ));
                    }
                }
                index.push((key, offset));
                offset = next_offset;
            }
            EnvelopeRead::End => {
                return Ok(ScanOutcome {
                    index,
                    valid_len: offset,
                    torn: false,
                })
            }
            EnvelopeRead::Truncated => {
                return Ok(ScanOutcome {
                    index,
                    valid_len: offset,
                    torn: true,
                })
            }
        }
    }
}

/// Result of checking one segment file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SegmentReport<K> {
    /// What the complete records describe.
    pub info: SegmentInfo<K>,
    /// Bytes after the last complete record.
    pub torn_bytes: u64,
}

/// Checks every record of a segment file without modifying it.
///
/// Verifies envelope checksums, record decoding and strictly increasing
/// keys. A torn tail is reported, not treated as an error.
///
/// # Errors
///
/// Returns an error for the first corrupt record or an unreadable file.
pub fn verify_segment<R: LogRecord>(path: &Path) -> ChangelogResult<SegmentReport<R::Key>> {
    let backend = FileBackend::open_read_only(path).map_err(|source| {
        ChangelogError::Unavailable {
            path: path.to_path_buf(),
            source,
        }
    })?;
    let size = backend.size()?;
    let scan = scan_segment::<R>(&backend, path)?;
    let sealed = path
        .file_name()
        .is_some_and(|name| name != std::ffi::OsStr::new("head.log"));
    Ok(SegmentReport {
        info: SegmentInfo {
            path: path.to_path_buf(),
            first_key: scan.index.first().map(|(k, _)| *k),
            last_key: scan.index.last().map(|(k, _)| *k),
            records: scan.index.len(),
            bytes: scan.valid_len,
            sealed,
        },
        torn_bytes: size - scan.valid_len,
    })
}

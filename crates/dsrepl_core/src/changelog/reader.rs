//! Forward-only readers over a single segment.

use super::record::{decode_envelope, EnvelopeRead, LogRecord};
use super::segment::Segment;
use crate::error::{ChangelogError, ChangelogResult};
use dsrepl_storage::{FileBackend, StorageBackend};
use std::marker::PhantomData;
use std::path::PathBuf;
use std::sync::Arc;

/// How a key given to `seek` selects the first record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyMatch {
    /// First record whose key is greater than or equal to the key.
    AtOrAfter,
    /// First record whose key is strictly greater than the key.
    After,
}

/// A reader over one segment, owned exclusively by its user.
///
/// Obtained from a [`super::LogReaderPool`] and handed back with
/// [`super::LogReaderPool::release`]. Once [`SegmentReader::next`] returns
/// `None` the reader stays exhausted until the next
/// [`SegmentReader::seek`], even if the writer appends more records.
#[derive(Debug)]
pub struct SegmentReader<R: LogRecord> {
    segment: Arc<Segment<R::Key>>,
    backend: FileBackend,
    position: usize,
    exhausted: bool,
    _record: PhantomData<fn() -> R>,
}

impl<R: LogRecord> SegmentReader<R> {
    pub(crate) fn new(segment: Arc<Segment<R::Key>>, backend: FileBackend) -> Self {
        Self {
            segment,
            backend,
            position: 0,
            exhausted: false,
            _record: PhantomData,
        }
    }

    /// Positions the reader at the first record matching `key`.
    ///
    /// Binary search over the segment's key index. Returns true if such a
    /// record exists right now.
    pub fn seek(&mut self, key: R::Key, matching: KeyMatch) -> bool {
        self.position = self.segment.position(key, matching);
        self.exhausted = false;
        self.position < self.segment.record_count()
    }

    /// Positions the reader at the first record of the segment.
    pub fn rewind(&mut self) {
        self.position = 0;
        self.exhausted = false;
    }

    /// Reads the next record.
    ///
    /// # Errors
    ///
    /// Returns an error if the record cannot be read or is corrupt.
    pub fn next(&mut self) -> ChangelogResult<Option<R>> {
        if self.exhausted {
            return Ok(None);
        }
        let Some((key, offset)) = self.segment.entry_at(self.position) else {
            self.exhausted = true;
            return Ok(None);
        };

        let path = self.segment.path();
        let mut read = decode_envelope(&self.backend, offset, self.backend.size()?, &path)?;
        if !matches!(read, EnvelopeRead::Record { .. }) {
            // written after this handle last looked at the file size
            let limit = self.backend.refresh()?;
            read = decode_envelope(&self.backend, offset, limit, &path)?;
        }

        match read {
            EnvelopeRead::Record { payload, .. } => {
                let record = R::decode_payload(&payload)?;
                if record.key() != key {
                    return Err(ChangelogError::corrupted(
                        path,
                        offset,
                        format!("indexed key {key} but record holds {}", record.key()),
                    ));
                }
                self.position += 1;
                Ok(Some(record))
            }
            EnvelopeRead::Truncated | EnvelopeRead::End => Err(ChangelogError::corrupted(
                path,
                offset,
                "indexed record is missing",
            )),
        }
    }

    /// True once `next` has returned `None` since the last seek.
    #[must_use]
    pub fn is_exhausted(&self) -> bool {
        self.exhausted
    }

    /// File this reader is reading.
    #[must_use]
    pub fn segment_path(&self) -> PathBuf {
        self.segment.path()
    }

    /// Closes the file handle instead of returning it to the pool.
    ///
    /// The pool only counts idle handles, so nothing there changes; a
    /// later reader of this segment opens a fresh handle. Use
    /// [`super::LogReaderPool::release`] to keep the handle for reuse.
    pub fn close(self) {}

    pub(crate) fn segment(&self) -> &Arc<Segment<R::Key>> {
        &self.segment
    }

    pub(crate) fn into_parts(self) -> (u64, FileBackend) {
        (self.segment.id(), self.backend)
    }
}

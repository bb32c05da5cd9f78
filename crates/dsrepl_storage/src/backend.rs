//! Storage backend trait definition.

use crate::error::StorageResult;

/// How a backend handle was opened.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccessMode {
    /// The single handle allowed to append to the file.
    ReadWrite,
    /// A reader handle. Appends, truncation and sync are rejected.
    ReadOnly,
}

/// A low-level byte store holding one changelog segment.
///
/// Backends are **opaque byte stores**. The changelog owns the record
/// envelope; backends never interpret what they hold.
///
/// # Invariants
///
/// - `append` returns the offset where data was written
/// - `read_at` returns exactly the bytes previously written at that offset
/// - `sync` makes every appended byte durable
/// - a read-only handle sees bytes appended by the writer only after
///   [`StorageBackend::refresh`]
pub trait StorageBackend: Send + Sync {
    /// Reads `len` bytes starting at `offset`.
    ///
    /// # Errors
    ///
    /// Returns an error if the range extends past the known size or an I/O
    /// error occurs.
    fn read_at(&self, offset: u64, len: usize) -> StorageResult<Vec<u8>>;

    /// Appends data to the end of the storage and returns its offset.
    ///
    /// # Errors
    ///
    /// Returns an error on I/O failure or when the handle is read-only.
    fn append(&mut self, data: &[u8]) -> StorageResult<u64>;

    /// Pushes buffered writes to the operating system.
    ///
    /// # Errors
    ///
    /// Returns an error if the flush operation fails.
    fn flush(&mut self) -> StorageResult<()>;

    /// Returns the size known to this handle.
    ///
    /// # Errors
    ///
    /// Returns an error if the size cannot be determined.
    fn size(&self) -> StorageResult<u64>;

    /// Re-reads the size from the underlying store and returns it.
    ///
    /// Writers always know their own size; readers call this to pick up
    /// records appended since they were opened.
    ///
    /// # Errors
    ///
    /// Returns an error if the size cannot be determined.
    fn refresh(&self) -> StorageResult<u64>;

    /// Syncs data and metadata to durable storage.
    ///
    /// # Errors
    ///
    /// Returns an error if the sync fails or the handle is read-only.
    fn sync(&mut self) -> StorageResult<()>;

    /// Truncates the storage to `new_size` bytes.
    ///
    /// Used to drop a torn record at the tail of the active segment.
    ///
    /// # Errors
    ///
    /// Returns an error if `new_size` exceeds the current size, the handle
    /// is read-only, or the truncation fails.
    fn truncate(&mut self, new_size: u64) -> StorageResult<()>;

    /// Returns how this handle was opened.
    fn access_mode(&self) -> AccessMode;
}

//! In-memory backend used by tests and record codec checks.

use crate::backend::{AccessMode, StorageBackend};
use crate::error::{StorageError, StorageResult};
use parking_lot::RwLock;
use std::sync::Arc;

/// An in-memory byte store.
///
/// Clones made with [`InMemoryBackend::reader`] share the same buffer, which
/// lets tests model a writer and its readers without touching the disk.
///
/// # Example
///
/// ```rust
/// use dsrepl_storage::{StorageBackend, InMemoryBackend};
///
/// let mut writer = InMemoryBackend::new();
/// let reader = writer.reader();
/// writer.append(b"abc").unwrap();
/// assert_eq!(reader.refresh().unwrap(), 3);
/// ```
#[derive(Debug, Clone)]
pub struct InMemoryBackend {
    data: Arc<RwLock<Vec<u8>>>,
    visible: Arc<RwLock<u64>>,
    mode: AccessMode,
}

impl Default for InMemoryBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryBackend {
    /// Creates a new empty writable backend.
    #[must_use]
    pub fn new() -> Self {
        Self::with_data(Vec::new())
    }

    /// Creates a writable backend holding pre-existing bytes.
    ///
    /// Useful for feeding torn or corrupted segments to recovery code.
    #[must_use]
    pub fn with_data(data: Vec<u8>) -> Self {
        let len = data.len() as u64;
        Self {
            data: Arc::new(RwLock::new(data)),
            visible: Arc::new(RwLock::new(len)),
            mode: AccessMode::ReadWrite,
        }
    }

    /// Returns a read-only handle sharing this backend's buffer.
    #[must_use]
    pub fn reader(&self) -> Self {
        let len = self.data.read().len() as u64;
        Self {
            data: Arc::clone(&self.data),
            visible: Arc::new(RwLock::new(len)),
            mode: AccessMode::ReadOnly,
        }
    }

    /// Returns a copy of all bytes in the backend.
    #[must_use]
    pub fn data(&self) -> Vec<u8> {
        self.data.read().clone()
    }
}

impl StorageBackend for InMemoryBackend {
    fn read_at(&self, offset: u64, len: usize) -> StorageResult<Vec<u8>> {
        let size = *self.visible.read();
        let end = offset.saturating_add(len as u64);
        if offset > size || end > size {
            return Err(StorageError::ReadPastEnd { offset, len, size });
        }
        let data = self.data.read();
        Ok(data[offset as usize..end as usize].to_vec())
    }

    fn append(&mut self, new_data: &[u8]) -> StorageResult<u64> {
        if self.mode == AccessMode::ReadOnly {
            return Err(StorageError::ReadOnly);
        }
        let mut data = self.data.write();
        let offset = data.len() as u64;
        data.extend_from_slice(new_data);
        *self.visible.write() = data.len() as u64;
        Ok(offset)
    }

    fn flush(&mut self) -> StorageResult<()> {
        Ok(())
    }

    fn size(&self) -> StorageResult<u64> {
        Ok(*self.visible.read())
    }

    fn refresh(&self) -> StorageResult<u64> {
        let len = self.data.read().len() as u64;
        *self.visible.write() = len;
        Ok(len)
    }

    fn sync(&mut self) -> StorageResult<()> {
        if self.mode == AccessMode::ReadOnly {
            return Err(StorageError::ReadOnly);
        }
        Ok(())
    }

    fn truncate(&mut self, new_size: u64) -> StorageResult<()> {
        if self.mode == AccessMode::ReadOnly {
            return Err(StorageError::ReadOnly);
        }
        let mut data = self.data.write();
        let size = data.len() as u64;
        if new_size > size {
            return Err(StorageError::InvalidTruncate {
                requested: new_size,
                size,
            });
        }
        data.truncate(new_size as usize);
        *self.visible.write() = new_size;
        Ok(())
    }

    fn access_mode(&self) -> AccessMode {
        self.mode
    }
}

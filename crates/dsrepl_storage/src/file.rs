//! File-based backend for changelog segment files.

use crate::backend::{AccessMode, StorageBackend};
use crate::error::{StorageError, StorageResult};
use parking_lot::{Mutex, RwLock};
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

/// A segment file on the local file system.
///
/// A segment has exactly one [`AccessMode::ReadWrite`] handle while it is
/// the active head of a log, and any number of [`AccessMode::ReadOnly`]
/// handles owned by changelog readers.
///
/// # Durability
///
/// - `flush()` pushes data to the OS
/// - `sync()` calls `File::sync_all()`
///
/// # Example
///
/// ```no_run
/// use dsrepl_storage::{StorageBackend, FileBackend};
/// use std::path::Path;
///
/// let mut writer = FileBackend::open(Path::new("head.log")).unwrap();
/// writer.append(b"record").unwrap();
/// writer.sync().unwrap();
///
/// let reader = FileBackend::open_read_only(Path::new("head.log")).unwrap();
/// assert_eq!(reader.read_at(0, 6).unwrap(), b"record");
/// ```
#[derive(Debug)]
pub struct FileBackend {
    path: PathBuf,
    mode: AccessMode,
    file: Mutex<File>,
    size: RwLock<u64>,
}

impl FileBackend {
    /// Opens or creates a writable segment file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be opened or created.
    pub fn open(path: &Path) -> StorageResult<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)?;
        Self::from_file(path, file, AccessMode::ReadWrite)
    }

    /// Opens an existing segment file for reading only.
    ///
    /// # Errors
    ///
    /// Returns an error if the file does not exist or cannot be opened.
    pub fn open_read_only(path: &Path) -> StorageResult<Self> {
        let file = OpenOptions::new().read(true).open(path)?;
        Self::from_file(path, file, AccessMode::ReadOnly)
    }

    /// Opens or creates a writable file, creating parent directories first.
    ///
    /// # Errors
    ///
    /// Returns an error if directories cannot be created or the file cannot
    /// be opened.
    pub fn open_with_create_dirs(path: &Path) -> StorageResult<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        Self::open(path)
    }

    fn from_file(path: &Path, file: File, mode: AccessMode) -> StorageResult<Self> {
        let size = file.metadata()?.len();
        Ok(Self {
            path: path.to_path_buf(),
            mode,
            file: Mutex::new(file),
            size: RwLock::new(size),
        })
    }

    /// Returns the path to the underlying file.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Points this handle at a new path after the file was renamed.
    ///
    /// The open descriptor stays valid across a rename, so only the
    /// bookkeeping changes.
    pub fn set_path(&mut self, path: PathBuf) {
        self.path = path;
    }

    fn ensure_writable(&self) -> StorageResult<()> {
        match self.mode {
            AccessMode::ReadWrite => Ok(()),
            AccessMode::ReadOnly => Err(StorageError::ReadOnly),
        }
    }
}

impl StorageBackend for FileBackend {
    fn read_at(&self, offset: u64, len: usize) -> StorageResult<Vec<u8>> {
        let size = *self.size.read();
        let end = offset.saturating_add(len as u64);

        if offset > size || end > size {
            return Err(StorageError::ReadPastEnd { offset, len, size });
        }
        if len == 0 {
            return Ok(Vec::new());
        }

        let mut file = self.file.lock();
        file.seek(SeekFrom::Start(offset))?;
        let mut buffer = vec![0u8; len];
        file.read_exact(&mut buffer)?;
        Ok(buffer)
    }

    fn append(&mut self, data: &[u8]) -> StorageResult<u64> {
        self.ensure_writable()?;
        if data.is_empty() {
            return Ok(*self.size.read());
        }

        let mut file = self.file.lock();
        let mut size = self.size.write();
        let offset = *size;
        file.seek(SeekFrom::Start(offset))?;
        file.write_all(data)?;
        *size += data.len() as u64;
        Ok(offset)
    }

    fn flush(&mut self) -> StorageResult<()> {
        if self.mode == AccessMode::ReadOnly {
            return Ok(());
        }
        self.file.lock().flush()?;
        Ok(())
    }

    fn size(&self) -> StorageResult<u64> {
        Ok(*self.size.read())
    }

    fn refresh(&self) -> StorageResult<u64> {
        let len = self.file.lock().metadata()?.len();
        *self.size.write() = len;
        Ok(len)
    }

    fn sync(&mut self) -> StorageResult<()> {
        self.ensure_writable()?;
        self.file.lock().sync_all()?;
        Ok(())
    }

    fn truncate(&mut self, new_size: u64) -> StorageResult<()> {
        self.ensure_writable()?;
        let file = self.file.lock();
        let mut size = self.size.write();

        if new_size > *size {
            return Err(StorageError::InvalidTruncate {
                requested: new_size,
                size: *size,
            });
        }

        file.set_len(new_size)?;
        file.sync_all()?;
        *size = new_size;
        Ok(())
    }

    fn access_mode(&self) -> AccessMode {
        self.mode
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn append_and_read_back() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("head.log");

        let mut backend = FileBackend::open(&path).unwrap();
        assert_eq!(backend.append(b"first").unwrap(), 0);
        assert_eq!(backend.append(b"second").unwrap(), 5);
        assert_eq!(backend.size().unwrap(), 11);
        assert_eq!(backend.read_at(5, 6).unwrap(), b"second");
    }

    #[test]
    fn read_past_end_fails() {
        let dir = tempdir().unwrap();
        let mut backend = FileBackend::open(&dir.path().join("head.log")).unwrap();
        backend.append(b"abc").unwrap();

        assert!(matches!(
            backend.read_at(2, 5),
            Err(StorageError::ReadPastEnd { .. })
        ));
    }

    #[test]
    fn reader_sees_appends_after_refresh() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("head.log");

        let mut writer = FileBackend::open(&path).unwrap();
        writer.append(b"one").unwrap();
        writer.flush().unwrap();

        let reader = FileBackend::open_read_only(&path).unwrap();
        assert_eq!(reader.size().unwrap(), 3);

        writer.append(b"two").unwrap();
        writer.flush().unwrap();
        assert_eq!(reader.size().unwrap(), 3);
        assert_eq!(reader.refresh().unwrap(), 6);
        assert_eq!(reader.read_at(3, 3).unwrap(), b"two");
    }

    #[test]
    fn read_only_rejects_writes() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("sealed.log");
        FileBackend::open(&path).unwrap();

        let mut reader = FileBackend::open_read_only(&path).unwrap();
        assert_eq!(reader.access_mode(), AccessMode::ReadOnly);
        assert!(matches!(reader.append(b"x"), Err(StorageError::ReadOnly)));
        assert!(matches!(reader.truncate(0), Err(StorageError::ReadOnly)));
        assert!(reader.flush().is_ok());
    }

    #[test]
    fn read_only_missing_file_fails() {
        let dir = tempdir().unwrap();
        let result = FileBackend::open_read_only(&dir.path().join("absent.log"));
        assert!(matches!(result, Err(StorageError::Io(_))));
    }

    #[test]
    fn truncate_drops_tail() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("head.log");

        let mut backend = FileBackend::open(&path).unwrap();
        backend.append(b"keep-torn").unwrap();
        backend.truncate(4).unwrap();
        assert_eq!(backend.size().unwrap(), 4);

        let reopened = FileBackend::open(&path).unwrap();
        assert_eq!(reopened.read_at(0, 4).unwrap(), b"keep");
        assert!(matches!(
            backend.truncate(10),
            Err(StorageError::InvalidTruncate { .. })
        ));
    }

    #[test]
    fn handle_survives_rename() {
        let dir = tempdir().unwrap();
        let head = dir.path().join("head.log");
        let sealed = dir.path().join("a_b.log");

        let mut backend = FileBackend::open(&head).unwrap();
        backend.append(b"data").unwrap();
        std::fs::rename(&head, &sealed).unwrap();
        backend.set_path(sealed.clone());

        assert_eq!(backend.path(), sealed);
        assert_eq!(backend.read_at(0, 4).unwrap(), b"data");
    }

    #[test]
    fn create_with_dirs() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("domain").join("1").join("head.log");
        let backend = FileBackend::open_with_create_dirs(&path).unwrap();
        assert_eq!(backend.size().unwrap(), 0);
        assert!(path.exists());
    }
}

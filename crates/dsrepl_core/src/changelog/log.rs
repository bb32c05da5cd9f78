//! A single append-only, key-ordered log made of segment files.

use super::config::{LogConfig, SyncPolicy};
use super::pool::LogReaderPool;
use super::reader::{KeyMatch, SegmentReader};
use super::record::{encode_envelope, LogRecord};
use super::segment::{scan_segment, Segment, SegmentInfo};
use crate::error::{ChangelogError, ChangelogResult};
use crate::fsutil::sync_directory;
use dsrepl_storage::{FileBackend, StorageBackend};
use parking_lot::{Mutex, RwLock};
use std::fs;
use std::io;
use std::marker::PhantomData;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, error, info, warn};

const HEAD_FILE: &str = "head.log";
const SEGMENT_SUFFIX: &str = ".log";

/// Result of [`Log::append`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AppendOutcome<K> {
    /// The record was written.
    Appended,
    /// The record's key is not greater than the last key; nothing was
    /// written.
    Stale {
        /// Last key in the log.
        last: K,
    },
}

impl<K> AppendOutcome<K> {
    /// True if the record was written.
    #[must_use]
    pub fn is_appended(&self) -> bool {
        matches!(self, Self::Appended)
    }
}

#[derive(Debug)]
struct Writer<K> {
    backend: FileBackend,
    segment: Arc<Segment<K>>,
    last_key: Option<K>,
    unsynced: usize,
}

#[derive(Debug)]
struct LogInner<R: LogRecord> {
    dir: PathBuf,
    config: LogConfig,
    segments: RwLock<Vec<Arc<Segment<R::Key>>>>,
    writer: Mutex<Writer<R::Key>>,
    pool: LogReaderPool,
    next_segment_id: AtomicU64,
    failed: AtomicBool,
    _record: PhantomData<fn() -> R>,
}

/// An append-only log of records ordered by key.
///
/// Records go to `head.log`. When the head grows past
/// [`LogConfig::max_segment_size`] or gets older than
/// [`LogConfig::rotation_interval`] it is sealed and renamed to
/// `<first key>_<last key>.log`; an empty head is never sealed.
///
/// One writer, many readers: appends serialize on an internal lock while
/// cursors read concurrently through pooled read-only handles. After a
/// failed write the log refuses further appends.
#[derive(Debug)]
pub struct Log<R: LogRecord> {
    inner: Arc<LogInner<R>>,
}

impl<R: LogRecord> Clone for Log<R> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

fn parse_sealed_name<R: LogRecord>(name: &str) -> Option<(R::Key, R::Key)> {
    let stem = name.strip_suffix(SEGMENT_SUFFIX)?;
    let (low, high) = stem.split_once('_')?;
    Some((R::parse_key(low)?, R::parse_key(high)?))
}

impl<R: LogRecord> Log<R> {
    /// Opens the log in `dir`, creating it if needed.
    ///
    /// Every segment is scanned to rebuild its key index. A torn record at
    /// the end of the head segment is cut off; any other damage is an
    /// error.
    ///
    /// # Errors
    ///
    /// Returns an error if a segment is unreadable or corrupt.
    pub fn open(dir: &Path, config: LogConfig) -> ChangelogResult<Self> {
        fs::create_dir_all(dir)?;

        let mut sealed_files = Vec::new();
        for entry in fs::read_dir(dir)? {
            let entry = entry?;
            let name = entry.file_name().to_string_lossy().into_owned();
            if name == HEAD_FILE || !name.ends_with(SEGMENT_SUFFIX) {
                continue;
            }
            let Some((low, high)) = parse_sealed_name::<R>(&name) else {
                return Err(ChangelogError::corrupted(
                    entry.path(),
                    0,
                    "unrecognized segment file name",
                ));
            };
            sealed_files.push((low, high, entry.path()));
        }
        sealed_files.sort_by(|a, b| a.0.cmp(&b.0));

        let mut segments: Vec<Arc<Segment<R::Key>>> = Vec::new();
        let mut last_key: Option<R::Key> = None;
        let mut next_id = 0u64;

        for (low, high, path) in sealed_files {
            let backend = FileBackend::open_read_only(&path).map_err(|source| {
                ChangelogError::Unavailable {
                    path: path.clone(),
                    source,
                }
            })?;
            let scan = scan_segment::<R>(&backend, &path)?;
            if scan.torn {
                warn!(path = %path.display(), "ignoring torn tail of sealed segment");
            }
            let first = scan.index.first().map(|(k, _)| *k);
            let last = scan.index.last().map(|(k, _)| *k);
            if first != Some(low) || last != Some(high) {
                return Err(ChangelogError::corrupted(
                    &path,
                    0,
                    "segment contents do not match its name",
                ));
            }
            if last_key.is_some_and(|prev| low <= prev) {
                return Err(ChangelogError::corrupted(&path, 0, "segments overlap"));
            }
            last_key = Some(high);
            segments.push(Arc::new(Segment::new(
                next_id,
                path,
                scan.index,
                scan.valid_len,
                true,
            )));
            next_id += 1;
        }

        let head_path = dir.join(HEAD_FILE);
        let mut backend = FileBackend::open(&head_path)?;
        let scan = scan_segment::<R>(&backend, &head_path)?;
        if scan.torn {
            warn!(
                path = %head_path.display(),
                valid_len = scan.valid_len,
                "truncating torn record at end of head segment"
            );
            backend.truncate(scan.valid_len)?;
        }
        if let (Some(prev), Some((first, _))) = (last_key, scan.index.first()) {
            if *first <= prev {
                return Err(ChangelogError::corrupted(
                    &head_path,
                    0,
                    "head segment overlaps sealed segments",
                ));
            }
        }
        if let Some((last, _)) = scan.index.last() {
            last_key = Some(*last);
        }
        let head = Arc::new(Segment::new(
            next_id,
            head_path,
            scan.index,
            scan.valid_len,
            false,
        ));
        segments.push(Arc::clone(&head));

        debug!(
            dir = %dir.display(),
            segments = segments.len(),
            "opened changelog log"
        );

        Ok(Self {
            inner: Arc::new(LogInner {
                dir: dir.to_path_buf(),
                pool: LogReaderPool::new(config.max_idle_readers, config.max_idle_total),
                config,
                segments: RwLock::new(segments),
                writer: Mutex::new(Writer {
                    backend,
                    segment: head,
                    last_key,
                    unsynced: 0,
                }),
                next_segment_id: AtomicU64::new(next_id + 1),
                failed: AtomicBool::new(false),
                _record: PhantomData,
            }),
        })
    }

    /// Directory holding the segment files.
    #[must_use]
    pub fn dir(&self) -> &Path {
        &self.inner.dir
    }

    /// Appends `record` if its key is greater than the last key.
    ///
    /// # Errors
    ///
    /// Returns an error if the write fails; the log then refuses further
    /// appends with [`ChangelogError::WriterFailed`].
    pub fn append(&self, record: &R) -> ChangelogResult<AppendOutcome<R::Key>> {
        let inner = &self.inner;
        if inner.failed.load(Ordering::Acquire) {
            return Err(ChangelogError::WriterFailed(inner.dir.clone()));
        }

        let key = record.key();
        let mut writer = inner.writer.lock();
        if let Some(last) = writer.last_key {
            if key <= last {
                return Ok(AppendOutcome::Stale { last });
            }
        }

        let envelope = encode_envelope(&record.encode_payload()?)?;
        let result = self.write_locked(&mut writer, &envelope);
        match result {
            Ok(offset) => {
                writer
                    .segment
                    .push(key, offset, offset + envelope.len() as u64);
                writer.last_key = Some(key);
                Ok(AppendOutcome::Appended)
            }
            Err(err) => {
                inner.failed.store(true, Ordering::Release);
                error!(dir = %inner.dir.display(), error = %err, "changelog write failed");
                Err(err)
            }
        }
    }

    fn write_locked(
        &self,
        writer: &mut Writer<R::Key>,
        envelope: &[u8],
    ) -> ChangelogResult<u64> {
        if self.should_rotate(writer, envelope.len() as u64) {
            self.rotate_locked(writer)?;
        }

        let offset = writer.backend.append(envelope)?;
        writer.unsynced += 1;
        let sync_now = match self.inner.config.sync_policy {
            SyncPolicy::EveryRecord => true,
            SyncPolicy::EveryRecords(n) => writer.unsynced >= n.max(1),
            SyncPolicy::Manual => false,
        };
        if sync_now {
            writer.backend.sync()?;
            writer.unsynced = 0;
        }
        Ok(offset)
    }

    fn should_rotate(&self, writer: &Writer<R::Key>, incoming: u64) -> bool {
        let head = &writer.segment;
        if head.is_empty() {
            return false;
        }
        let config = &self.inner.config;
        head.len() + incoming > config.max_segment_size
            || config
                .rotation_interval
                .is_some_and(|interval| head.age() >= interval)
    }

    fn rotate_locked(&self, writer: &mut Writer<R::Key>) -> ChangelogResult<()> {
        let inner = &self.inner;
        let (Some(first), Some(last)) = (writer.segment.first_key(), writer.segment.last_key())
        else {
            return Ok(());
        };

        writer.backend.sync()?;
        writer.unsynced = 0;

        let head_path = inner.dir.join(HEAD_FILE);
        let sealed_path = inner.dir.join(format!("{first}_{last}{SEGMENT_SUFFIX}"));
        writer.segment.seal_as(sealed_path.clone())?;
        sync_directory(&inner.dir)?;

        let backend = FileBackend::open(&head_path)?;
        let id = inner.next_segment_id.fetch_add(1, Ordering::AcqRel);
        let head = Arc::new(Segment::new(id, head_path, Vec::new(), 0, false));
        inner.segments.write().push(Arc::clone(&head));
        writer.backend = backend;
        writer.segment = head;

        info!(path = %sealed_path.display(), "sealed changelog segment");
        Ok(())
    }

    /// Seals the head segment now, unless it is empty.
    ///
    /// # Errors
    ///
    /// Returns an error if the rename fails; the log then refuses writes.
    pub fn rotate(&self) -> ChangelogResult<()> {
        let mut writer = self.inner.writer.lock();
        self.rotate_locked(&mut writer).inspect_err(|_| {
            self.inner.failed.store(true, Ordering::Release);
        })
    }

    /// Makes every appended record durable.
    ///
    /// # Errors
    ///
    /// Returns an error if the sync fails.
    pub fn sync(&self) -> ChangelogResult<()> {
        let mut writer = self.inner.writer.lock();
        if writer.unsynced > 0 {
            writer.backend.sync()?;
            writer.unsynced = 0;
        }
        Ok(())
    }

    /// Deletes sealed segments whose every key is below `key`.
    ///
    /// The head segment is never deleted. Returns the number of segments
    /// removed.
    ///
    /// # Errors
    ///
    /// Returns an error if a file cannot be deleted.
    pub fn purge_up_to(&self, key: R::Key) -> ChangelogResult<usize> {
        let inner = &self.inner;
        let victims: Vec<Arc<Segment<R::Key>>> = {
            let mut segments = inner.segments.write();
            let count = segments
                .iter()
                .take_while(|s| s.is_sealed() && s.last_key().is_some_and(|last| last < key))
                .count();
            segments.drain(..count).collect()
        };
        if victims.is_empty() {
            return Ok(0);
        }

        for segment in &victims {
            inner.pool.evict(segment.id());
            let path = segment.path();
            match fs::remove_file(&path) {
                Ok(()) => {}
                Err(err) if err.kind() == io::ErrorKind::NotFound => {}
                Err(err) => return Err(err.into()),
            }
            debug!(path = %path.display(), "purged changelog segment");
        }
        sync_directory(&inner.dir)?;
        Ok(victims.len())
    }

    /// Key of the oldest record still in the log.
    #[must_use]
    pub fn oldest_key(&self) -> Option<R::Key> {
        self.inner
            .segments
            .read()
            .iter()
            .find_map(|s| s.first_key())
    }

    /// Key of the newest record.
    #[must_use]
    pub fn newest_key(&self) -> Option<R::Key> {
        self.inner.writer.lock().last_key
    }

    /// Number of records in the log.
    #[must_use]
    pub fn record_count(&self) -> usize {
        self.inner
            .segments
            .read()
            .iter()
            .map(|s| s.record_count())
            .sum()
    }

    /// Diagnostic view of every segment, oldest first.
    #[must_use]
    pub fn segments(&self) -> Vec<SegmentInfo<R::Key>> {
        self.inner.segments.read().iter().map(|s| s.info()).collect()
    }

    /// True if an earlier write failed.
    #[must_use]
    pub fn is_failed(&self) -> bool {
        self.inner.failed.load(Ordering::Acquire)
    }

    /// Reader pool of this log.
    #[must_use]
    pub fn pool(&self) -> &LogReaderPool {
        &self.inner.pool
    }

    /// A pooled reader positioned at the first record matching `key`, or
    /// `None` if no such record exists yet. Give it back with
    /// [`LogReaderPool::release`].
    ///
    /// # Errors
    ///
    /// Returns [`ChangelogError::Unavailable`] if the segment cannot be
    /// opened.
    pub fn reader_at(
        &self,
        key: R::Key,
        matching: KeyMatch,
    ) -> ChangelogResult<Option<SegmentReader<R>>> {
        let Some(segment) = self.inner.segment_for(Some((key, matching))) else {
            return Ok(None);
        };
        let mut reader = self.inner.pool.get::<R>(&segment)?;
        reader.seek(key, matching);
        Ok(Some(reader))
    }

    /// Finds the record with exactly `key`.
    ///
    /// # Errors
    ///
    /// Returns an error if the segment cannot be read.
    pub fn find(&self, key: R::Key) -> ChangelogResult<Option<R>> {
        let Some(mut reader) = self.reader_at(key, KeyMatch::AtOrAfter)? else {
            return Ok(None);
        };
        let record = reader.next();
        self.inner.pool.release(reader);
        Ok(record?.filter(|r| r.key() == key))
    }

    /// A cursor over the whole log.
    #[must_use]
    pub fn cursor(&self) -> LogCursor<R> {
        LogCursor {
            inner: Arc::clone(&self.inner),
            reader: None,
            position: None,
        }
    }

    /// A cursor starting at the first record matching `key`.
    #[must_use]
    pub fn cursor_from(&self, key: R::Key, matching: KeyMatch) -> LogCursor<R> {
        LogCursor {
            inner: Arc::clone(&self.inner),
            reader: None,
            position: Some((key, matching)),
        }
    }
}

impl<R: LogRecord> LogInner<R> {
    fn segment_for(&self, position: Option<(R::Key, KeyMatch)>) -> Option<Arc<Segment<R::Key>>> {
        self.segments
            .read()
            .iter()
            .find(|s| match position {
                Some((key, matching)) => s.reaches(key, matching),
                None => !s.is_empty(),
            })
            .cloned()
    }

    fn has_segment_after(&self, id: u64) -> bool {
        self.segments.read().iter().any(|s| s.id() > id)
    }
}

/// Reads a [`Log`] forward across segment boundaries.
///
/// Returning `None` means "caught up", not "finished": records appended
/// later are returned by later calls.
#[derive(Debug)]
pub struct LogCursor<R: LogRecord> {
    inner: Arc<LogInner<R>>,
    reader: Option<SegmentReader<R>>,
    position: Option<(R::Key, KeyMatch)>,
}

impl<R: LogRecord> LogCursor<R> {
    /// Returns the next record, or `None` when caught up.
    ///
    /// # Errors
    ///
    /// Returns an error if a segment cannot be opened or read.
    pub fn next(&mut self) -> ChangelogResult<Option<R>> {
        loop {
            let reader = match self.reader.as_mut() {
                Some(reader) => reader,
                None => {
                    let Some(segment) = self.inner.segment_for(self.position) else {
                        return Ok(None);
                    };
                    let mut reader = self.inner.pool.get::<R>(&segment)?;
                    if let Some((key, matching)) = self.position {
                        reader.seek(key, matching);
                    }
                    self.reader.insert(reader)
                }
            };

            if let Some(record) = reader.next()? {
                self.position = Some((record.key(), KeyMatch::After));
                return Ok(Some(record));
            }

            let segment_id = reader.segment().id();
            let sealed = reader.segment().is_sealed();
            if let Some(done) = self.reader.take() {
                self.inner.pool.release(done);
            }
            if !sealed && !self.inner.has_segment_after(segment_id) {
                return Ok(None);
            }
        }
    }

    /// Key of the last record returned, if any.
    #[must_use]
    pub fn last_key(&self) -> Option<R::Key> {
        match self.position {
            Some((key, KeyMatch::After)) => Some(key),
            _ => None,
        }
    }
}

impl<R: LogRecord> Drop for LogCursor<R> {
    fn drop(&mut self) {
        if let Some(reader) = self.reader.take() {
            self.inner.pool.release(reader);
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::time::Duration;
    use tempfile::tempdir;

    /// Minimal record keyed by a `u64`, named as 16 hex digits.
    #[derive(Debug, Clone, PartialEq, Eq)]
    pub(crate) struct TestRecord {
        pub(crate) key: HexKey,
        pub(crate) body: Vec<u8>,
    }

    #[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
    pub(crate) struct HexKey(pub(crate) u64);

    impl std::fmt::Display for HexKey {
        fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            write!(f, "{:016x}", self.0)
        }
    }

    impl TestRecord {
        pub(crate) fn new(key: u64, body: &[u8]) -> Self {
            Self {
                key: HexKey(key),
                body: body.to_vec(),
            }
        }
    }

    impl LogRecord for TestRecord {
        type Key = HexKey;

        fn key(&self) -> HexKey {
            self.key
        }

        fn encode_payload(&self) -> ChangelogResult<Vec<u8>> {
            let mut out = self.key.0.to_be_bytes().to_vec();
            out.extend_from_slice(&self.body);
            Ok(out)
        }

        fn decode_payload(bytes: &[u8]) -> ChangelogResult<Self> {
            if bytes.len() < 8 {
                return Err(ChangelogError::Codec("short test record".into()));
            }
            let mut key = [0u8; 8];
            key.copy_from_slice(&bytes[..8]);
            Ok(Self {
                key: HexKey(u64::from_be_bytes(key)),
                body: bytes[8..].to_vec(),
            })
        }

        fn parse_key(token: &str) -> Option<HexKey> {
            u64::from_str_radix(token, 16).ok().map(HexKey)
        }
    }

    fn keys(cursor: &mut LogCursor<TestRecord>) -> Vec<u64> {
        let mut out = Vec::new();
        while let Some(record) = cursor.next().unwrap() {
            out.push(record.key.0);
        }
        out
    }

    fn small_segments() -> LogConfig {
        // two 30-byte "payload!" records per segment
        LogConfig::default().with_max_segment_size(64)
    }

    #[test]
    fn append_and_scan_in_order() {
        let dir = tempdir().unwrap();
        let log = Log::<TestRecord>::open(dir.path(), LogConfig::default()).unwrap();
        for key in [1, 2, 5, 9] {
            assert!(log.append(&TestRecord::new(key, b"x")).unwrap().is_appended());
        }
        assert_eq!(keys(&mut log.cursor()), vec![1, 2, 5, 9]);
        assert_eq!(log.oldest_key(), Some(HexKey(1)));
        assert_eq!(log.newest_key(), Some(HexKey(9)));
        assert_eq!(log.record_count(), 4);
    }

    #[test]
    fn lower_or_equal_key_is_stale() {
        let dir = tempdir().unwrap();
        let log = Log::<TestRecord>::open(dir.path(), LogConfig::default()).unwrap();
        log.append(&TestRecord::new(10, b"a")).unwrap();

        assert_eq!(
            log.append(&TestRecord::new(10, b"b")).unwrap(),
            AppendOutcome::Stale { last: HexKey(10) }
        );
        assert_eq!(
            log.append(&TestRecord::new(3, b"c")).unwrap(),
            AppendOutcome::Stale { last: HexKey(10) }
        );
        assert_eq!(log.record_count(), 1);
    }

    #[test]
    fn size_rotation_names_sealed_segments() {
        let dir = tempdir().unwrap();
        let log = Log::<TestRecord>::open(dir.path(), small_segments()).unwrap();
        for key in 1..=5 {
            log.append(&TestRecord::new(key, b"payload!")).unwrap();
        }

        let segments = log.segments();
        assert_eq!(segments.len(), 3);
        assert!(segments[0].sealed);
        assert!(!segments[2].sealed);
        let first_name = segments[0].path.file_name().unwrap().to_string_lossy().into_owned();
        assert_eq!(first_name, format!("{}_{}.log", HexKey(1), HexKey(2)));
        assert!(dir.path().join("head.log").exists());

        assert_eq!(keys(&mut log.cursor()), vec![1, 2, 3, 4, 5]);
    }

    #[test]
    fn empty_head_is_never_sealed() {
        let dir = tempdir().unwrap();
        let log = Log::<TestRecord>::open(dir.path(), LogConfig::default()).unwrap();
        log.rotate().unwrap();
        assert_eq!(log.segments().len(), 1);

        log.append(&TestRecord::new(1, b"x")).unwrap();
        log.rotate().unwrap();
        log.rotate().unwrap();
        assert_eq!(log.segments().len(), 2);
    }

    #[test]
    fn age_rotation() {
        let dir = tempdir().unwrap();
        let config = LogConfig::default().with_rotation_interval(Duration::ZERO);
        let log = Log::<TestRecord>::open(dir.path(), config).unwrap();
        for key in 1..=3 {
            log.append(&TestRecord::new(key, b"x")).unwrap();
        }
        let sealed = log.segments().iter().filter(|s| s.sealed).count();
        assert_eq!(sealed, 2);
    }

    #[test]
    fn reopen_rebuilds_index() {
        let dir = tempdir().unwrap();
        {
            let log = Log::<TestRecord>::open(dir.path(), small_segments()).unwrap();
            for key in 1..=5 {
                log.append(&TestRecord::new(key * 10, b"payload!")).unwrap();
            }
        }
        let log = Log::<TestRecord>::open(dir.path(), small_segments()).unwrap();
        assert_eq!(keys(&mut log.cursor()), vec![10, 20, 30, 40, 50]);
        assert_eq!(
            log.append(&TestRecord::new(50, b"again")).unwrap(),
            AppendOutcome::Stale { last: HexKey(50) }
        );
        assert!(log.append(&TestRecord::new(60, b"new")).unwrap().is_appended());
    }

    #[test]
    fn torn_head_tail_is_truncated_on_open() {
        let dir = tempdir().unwrap();
        {
            let log = Log::<TestRecord>::open(dir.path(), LogConfig::default()).unwrap();
            log.append(&TestRecord::new(1, b"whole")).unwrap();
            log.append(&TestRecord::new(2, b"whole")).unwrap();
        }
        let head = dir.path().join("head.log");
        let len = fs::metadata(&head).unwrap().len();
        let file = fs::OpenOptions::new().write(true).open(&head).unwrap();
        file.set_len(len - 3).unwrap();
        drop(file);

        let log = Log::<TestRecord>::open(dir.path(), LogConfig::default()).unwrap();
        assert_eq!(keys(&mut log.cursor()), vec![1]);
        assert!(log.append(&TestRecord::new(2, b"retry")).unwrap().is_appended());
        assert_eq!(keys(&mut log.cursor()), vec![1, 2]);
    }

    #[test]
    fn corrupt_sealed_segment_fails_open() {
        let dir = tempdir().unwrap();
        {
            let log = Log::<TestRecord>::open(dir.path(), small_segments()).unwrap();
            for key in 1..=3 {
                log.append(&TestRecord::new(key, b"payload!")).unwrap();
            }
        }
        let sealed = log_files(dir.path())
            .into_iter()
            .find(|p| !p.ends_with("head.log"))
            .unwrap();
        let mut bytes = fs::read(&sealed).unwrap();
        bytes[12] ^= 0xff;
        fs::write(&sealed, bytes).unwrap();

        let err = Log::<TestRecord>::open(dir.path(), small_segments()).unwrap_err();
        assert!(err.is_corruption());
    }

    fn log_files(dir: &Path) -> Vec<PathBuf> {
        fs::read_dir(dir)
            .unwrap()
            .map(|e| e.unwrap().path())
            .filter(|p| p.extension().is_some_and(|e| e == "log"))
            .collect()
    }

    #[test]
    fn purge_keeps_head_and_newer_segments() {
        let dir = tempdir().unwrap();
        let log = Log::<TestRecord>::open(dir.path(), small_segments()).unwrap();
        for key in 1..=5 {
            log.append(&TestRecord::new(key, b"payload!")).unwrap();
        }
        // segments: [1,2] [3,4] head[5]
        assert_eq!(log.purge_up_to(HexKey(3)).unwrap(), 1);
        assert_eq!(keys(&mut log.cursor()), vec![3, 4, 5]);

        assert_eq!(log.purge_up_to(HexKey(100)).unwrap(), 1);
        assert_eq!(keys(&mut log.cursor()), vec![5]);
        assert_eq!(log_files(dir.path()).len(), 1);
    }

    #[test]
    fn cursor_resumes_after_key_and_tails_new_records() {
        let dir = tempdir().unwrap();
        let log = Log::<TestRecord>::open(dir.path(), small_segments()).unwrap();
        for key in [2, 4, 6] {
            log.append(&TestRecord::new(key, b"payload!")).unwrap();
        }

        let mut cursor = log.cursor_from(HexKey(2), KeyMatch::After);
        assert_eq!(keys(&mut cursor), vec![4, 6]);
        assert!(cursor.next().unwrap().is_none());

        for key in [7, 8, 9] {
            log.append(&TestRecord::new(key, b"payload!")).unwrap();
        }
        assert_eq!(keys(&mut cursor), vec![7, 8, 9]);
        assert_eq!(cursor.last_key(), Some(HexKey(9)));

        let mut at = log.cursor_from(HexKey(5), KeyMatch::AtOrAfter);
        assert_eq!(keys(&mut at), vec![6, 7, 8, 9]);
    }

    #[test]
    fn find_and_pooled_readers() {
        let dir = tempdir().unwrap();
        let log = Log::<TestRecord>::open(dir.path(), LogConfig::default()).unwrap();
        for key in [1, 3, 5] {
            log.append(&TestRecord::new(key, b"x")).unwrap();
        }
        assert_eq!(log.find(HexKey(3)).unwrap().unwrap().key, HexKey(3));
        assert!(log.find(HexKey(4)).unwrap().is_none());
        assert_eq!(log.pool().idle_count(), 1);

        let mut reader = log.reader_at(HexKey(4), KeyMatch::AtOrAfter).unwrap().unwrap();
        assert_eq!(log.pool().idle_count(), 0);
        assert_eq!(reader.next().unwrap().unwrap().key, HexKey(5));
        assert!(reader.next().unwrap().is_none());
        assert!(reader.is_exhausted());
        log.pool().release(reader);
        assert_eq!(log.pool().idle_count(), 1);
    }

    #[test]
    fn exhausted_reader_stays_exhausted_until_seek() {
        let dir = tempdir().unwrap();
        let log = Log::<TestRecord>::open(dir.path(), LogConfig::default()).unwrap();
        log.append(&TestRecord::new(1, b"x")).unwrap();

        let mut reader = log.reader_at(HexKey(1), KeyMatch::AtOrAfter).unwrap().unwrap();
        assert!(reader.next().unwrap().is_some());
        assert!(reader.next().unwrap().is_none());

        log.append(&TestRecord::new(2, b"y")).unwrap();
        assert!(reader.next().unwrap().is_none());
        assert!(reader.seek(HexKey(1), KeyMatch::After));
        assert_eq!(reader.next().unwrap().unwrap().key, HexKey(2));
        reader.close();
        assert_eq!(log.pool().idle_count(), 0);
    }

    #[test]
    fn concurrent_readers_during_appends() {
        let dir = tempdir().unwrap();
        let log = Log::<TestRecord>::open(dir.path(), small_segments()).unwrap();

        let writer = {
            let log = log.clone();
            std::thread::spawn(move || {
                for key in 1..=200 {
                    log.append(&TestRecord::new(key, b"payload!")).unwrap();
                }
            })
        };
        let reader = {
            let log = log.clone();
            std::thread::spawn(move || {
                let mut cursor = log.cursor();
                let mut seen = Vec::new();
                while seen.len() < 200 {
                    match cursor.next().unwrap() {
                        Some(record) => seen.push(record.key.0),
                        None => std::thread::yield_now(),
                    }
                }
                seen
            })
        };

        writer.join().unwrap();
        let seen = reader.join().unwrap();
        assert_eq!(seen, (1..=200).collect::<Vec<_>>());
    }

    #[test]
    fn readers_tail_across_every_rotation() {
        const RECORDS: u64 = 3000;
        let dir = tempdir().unwrap();
        // every append seals the previous head
        let config = LogConfig::default()
            .with_max_segment_size(1)
            .with_sync_policy(SyncPolicy::Manual);
        let log = Log::<TestRecord>::open(dir.path(), config).unwrap();

        let readers: Vec<_> = (0..4)
            .map(|_| {
                let log = log.clone();
                std::thread::spawn(move || {
                    let mut cursor = log.cursor();
                    let mut next = 1;
                    while next <= RECORDS {
                        match cursor.next() {
                            Ok(Some(record)) => {
                                assert_eq!(record.key.0, next);
                                next += 1;
                            }
                            Ok(None) => std::thread::yield_now(),
                            Err(err) => panic!("after {} records: {err}", next - 1),
                        }
                    }
                })
            })
            .collect();

        for key in 1..=RECORDS {
            log.append(&TestRecord::new(key, b"x")).unwrap();
        }
        for reader in readers {
            reader.join().unwrap();
        }
        assert_eq!(log.segments().len() as u64, RECORDS);
        assert!(log.pool().idle_count() <= LogConfig::default().max_idle_total);
    }

    #[test]
    fn failed_write_refuses_later_appends() {
        let dir = tempdir().unwrap();
        let log_dir = dir.path().join("log");
        let config = LogConfig::default().with_max_segment_size(1);
        let log = Log::<TestRecord>::open(&log_dir, config).unwrap();
        log.append(&TestRecord::new(1, b"x")).unwrap();

        // the next append must seal head.log, which is gone
        fs::remove_dir_all(&log_dir).unwrap();
        assert!(log.append(&TestRecord::new(2, b"x")).is_err());
        assert!(log.is_failed());
        assert!(matches!(
            log.append(&TestRecord::new(3, b"x")),
            Err(ChangelogError::WriterFailed(_))
        ));
        assert_eq!(log.newest_key(), Some(HexKey(1)));
    }
}

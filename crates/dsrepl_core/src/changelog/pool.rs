//! Pool of open segment readers.

use super::reader::SegmentReader;
use super::record::LogRecord;
use super::segment::Segment;
use crate::error::ChangelogResult;
use dsrepl_storage::FileBackend;
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;

#[derive(Debug, Default)]
struct PoolState {
    idle: BTreeMap<u64, Vec<FileBackend>>,
    idle_total: usize,
    retired: HashSet<u64>,
}

/// Reuses read-only file handles across readers of the same segment.
///
/// A reader taken from the pool belongs to its caller until it is released;
/// two callers never share one. When more than `max_idle_total` handles sit
/// idle, those of the oldest segments are closed first.
#[derive(Debug)]
pub struct LogReaderPool {
    state: Mutex<PoolState>,
    max_idle_per_segment: usize,
    max_idle_total: usize,
}

impl LogReaderPool {
    /// Creates a pool keeping at most `max_idle_per_segment` idle handles
    /// per segment and `max_idle_total` overall.
    #[must_use]
    pub fn new(max_idle_per_segment: usize, max_idle_total: usize) -> Self {
        Self {
            state: Mutex::new(PoolState::default()),
            max_idle_per_segment,
            max_idle_total,
        }
    }

    /// Returns a reader positioned at the start of `segment`.
    pub(crate) fn get<R: LogRecord>(
        &self,
        segment: &Arc<Segment<R::Key>>,
    ) -> ChangelogResult<SegmentReader<R>> {
        let pooled = {
            let mut state = self.state.lock();
            let pooled = state.idle.get_mut(&segment.id()).and_then(Vec::pop);
            if pooled.is_some() {
                state.idle_total -= 1;
            }
            pooled
        };
        let backend = match pooled {
            Some(backend) => backend,
            None => segment.open_read_only()?,
        };
        Ok(SegmentReader::new(Arc::clone(segment), backend))
    }

    /// Hands a reader back for reuse.
    pub fn release<R: LogRecord>(&self, reader: SegmentReader<R>) {
        let (segment_id, backend) = reader.into_parts();
        let mut state = self.state.lock();
        if state.retired.contains(&segment_id) {
            return;
        }
        let idle = state.idle.entry(segment_id).or_default();
        if idle.len() >= self.max_idle_per_segment {
            return;
        }
        idle.push(backend);
        state.idle_total += 1;

        while state.idle_total > self.max_idle_total {
            let Some(mut oldest) = state.idle.first_entry() else {
                break;
            };
            let closed = oldest.get_mut().pop();
            if oldest.get().is_empty() {
                oldest.remove();
            }
            if closed.is_some() {
                state.idle_total -= 1;
            }
        }
    }

    /// Closes idle readers of a purged segment and refuses its returns.
    pub(crate) fn evict(&self, segment_id: u64) {
        let mut state = self.state.lock();
        if let Some(idle) = state.idle.remove(&segment_id) {
            state.idle_total -= idle.len();
        }
        state.retired.insert(segment_id);
    }

    /// Number of idle handles across all segments.
    #[must_use]
    pub fn idle_count(&self) -> usize {
        self.state.lock().idle_total
    }
}

#[cfg(test)]
mod tests {
    use crate::changelog::log::tests::{HexKey, TestRecord};
    use crate::changelog::{KeyMatch, Log, LogConfig};
    use crate::error::ChangelogError;
    use std::fs;
    use tempfile::tempdir;

    fn sealed_log(dir: &std::path::Path, config: LogConfig) -> Log<TestRecord> {
        let log = Log::<TestRecord>::open(dir, config.with_max_segment_size(1)).unwrap();
        for key in 1..=4 {
            log.append(&TestRecord::new(key, b"x")).unwrap();
        }
        log
    }

    #[test]
    fn missing_segment_file_is_unavailable() {
        let dir = tempdir().unwrap();
        let log = sealed_log(dir.path(), LogConfig::default());
        let first = log.segments().remove(0);
        fs::remove_file(&first.path).unwrap();

        match log.cursor().next() {
            Err(ChangelogError::Unavailable { path, .. }) => assert_eq!(path, first.path),
            other => panic!("expected an unavailable segment, got {other:?}"),
        }
        // later segments still open
        let mut reader = log.reader_at(HexKey(2), KeyMatch::AtOrAfter).unwrap().unwrap();
        assert_eq!(reader.next().unwrap().unwrap().key, HexKey(2));
    }

    #[test]
    fn idle_total_closes_oldest_segments_first() {
        let dir = tempdir().unwrap();
        let log = sealed_log(dir.path(), LogConfig::default().with_max_idle_total(2));
        for key in 1..=4 {
            assert!(log.find(HexKey(key)).unwrap().is_some());
        }
        assert_eq!(log.pool().idle_count(), 2);

        // the newest segments kept their handles
        let reader = log.reader_at(HexKey(4), KeyMatch::AtOrAfter).unwrap().unwrap();
        assert_eq!(log.pool().idle_count(), 1);
        log.pool().release(reader);
        let reader = log.reader_at(HexKey(1), KeyMatch::AtOrAfter).unwrap().unwrap();
        assert_eq!(log.pool().idle_count(), 2);
        log.pool().release(reader);
        assert_eq!(log.pool().idle_count(), 2);
    }
}

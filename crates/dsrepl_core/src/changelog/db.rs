//! Per-domain changelog: one log per originating replica.

use super::config::LogConfig;
use super::cursor::ChangelogCursor;
use super::log::{AppendOutcome, Log};
use super::segment::SegmentInfo;
use crate::csn::Csn;
use crate::error::{ChangelogError, ChangelogResult};
use crate::state::ServerState;
use crate::update::UpdateRecord;
use fs2::FileExt;
use parking_lot::RwLock;
use std::collections::BTreeMap;
use std::fs::{self, File, OpenOptions};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info, warn};

const LOCK_FILE: &str = "LOCK";

/// The change history of one replication domain.
///
/// Holds an exclusive advisory lock on its directory until it is closed,
/// so only one writer at a time owns a domain's changelog. A closed
/// changelog still serves reads.
#[derive(Debug)]
pub struct ChangelogDb {
    dir: PathBuf,
    config: LogConfig,
    logs: RwLock<BTreeMap<u16, Log<UpdateRecord>>>,
    lock_file: RwLock<Option<File>>,
}

impl ChangelogDb {
    /// Opens the changelog in `dir`, creating it if needed.
    ///
    /// # Errors
    ///
    /// Returns [`ChangelogError::Locked`] if another process has it open,
    /// or any error raised while opening a replica log.
    pub fn open(dir: &Path, config: LogConfig) -> ChangelogResult<Self> {
        fs::create_dir_all(dir)?;
        let lock_file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(dir.join(LOCK_FILE))?;
        if lock_file.try_lock_exclusive().is_err() {
            return Err(ChangelogError::Locked(dir.to_path_buf()));
        }

        let mut logs = BTreeMap::new();
        for entry in fs::read_dir(dir)? {
            let entry = entry?;
            if !entry.file_type()?.is_dir() {
                continue;
            }
            let name = entry.file_name().to_string_lossy().into_owned();
            let Ok(replica_id) = name.parse::<u16>() else {
                continue;
            };
            logs.insert(replica_id, Log::open(&entry.path(), config.clone())?);
        }

        info!(dir = %dir.display(), replicas = logs.len(), "opened changelog");
        Ok(Self {
            dir: dir.to_path_buf(),
            config,
            logs: RwLock::new(logs),
            lock_file: RwLock::new(Some(lock_file)),
        })
    }

    /// Directory of this changelog.
    #[must_use]
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Appends `record` to the log of its originating replica.
    ///
    /// A record not newer than the last one from the same replica is
    /// reported as [`AppendOutcome::Stale`] and not written.
    ///
    /// # Errors
    ///
    /// Returns an error if the write fails.
    pub fn append(&self, record: &UpdateRecord) -> ChangelogResult<AppendOutcome<Csn>> {
        // held until the write is done so close waits for it
        let lock_file = self.lock_file.read();
        if lock_file.is_none() {
            return Err(ChangelogError::Closed(self.dir.clone()));
        }
        self.log_or_create(record.replica_id())?.append(record)
    }

    fn ensure_open(&self) -> ChangelogResult<()> {
        if self.is_closed() {
            return Err(ChangelogError::Closed(self.dir.clone()));
        }
        Ok(())
    }

    /// True once [`ChangelogDb::close`] ran.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.lock_file.read().is_none()
    }

    /// Syncs every log and releases the directory lock, so the directory
    /// can be opened again while this handle is still shared.
    ///
    /// Later appends, purges and clears fail with
    /// [`ChangelogError::Closed`]; reads keep working. Closing twice is a
    /// no-op.
    ///
    /// # Errors
    ///
    /// Returns an error if a sync fails; the lock is released anyway.
    pub fn close(&self) -> ChangelogResult<()> {
        let Some(file) = self.lock_file.write().take() else {
            return Ok(());
        };
        let synced = self.sync();
        if let Err(err) = FileExt::unlock(&file) {
            warn!(dir = %self.dir.display(), error = %err, "releasing changelog lock failed");
        }
        drop(file);
        info!(dir = %self.dir.display(), "closed changelog");
        synced
    }

    fn log_or_create(&self, replica_id: u16) -> ChangelogResult<Log<UpdateRecord>> {
        if let Some(log) = self.logs.read().get(&replica_id) {
            return Ok(log.clone());
        }
        let mut logs = self.logs.write();
        if let Some(log) = logs.get(&replica_id) {
            return Ok(log.clone());
        }
        let log = Log::open(&self.dir.join(replica_id.to_string()), self.config.clone())?;
        debug!(dir = %self.dir.display(), replica_id, "created replica log");
        logs.insert(replica_id, log.clone());
        Ok(log)
    }

    /// The log of `replica_id`, if it has any history.
    #[must_use]
    pub fn log(&self, replica_id: u16) -> Option<Log<UpdateRecord>> {
        self.logs.read().get(&replica_id).cloned()
    }

    /// Replica ids with a log, ascending.
    #[must_use]
    pub fn replica_ids(&self) -> Vec<u16> {
        self.logs.read().keys().copied().collect()
    }

    /// Finds the record with exactly `csn`.
    ///
    /// # Errors
    ///
    /// Returns an error if the segment cannot be read.
    pub fn find(&self, csn: Csn) -> ChangelogResult<Option<UpdateRecord>> {
        match self.log(csn.replica_id()) {
            Some(log) => log.find(csn),
            None => Ok(None),
        }
    }

    /// True if the record with exactly `csn` is stored.
    ///
    /// # Errors
    ///
    /// Returns an error if the segment cannot be read.
    pub fn contains(&self, csn: Csn) -> ChangelogResult<bool> {
        Ok(self.find(csn)?.is_some())
    }

    /// Newest CSN of every replica log.
    #[must_use]
    pub fn newest_state(&self) -> ServerState {
        self.logs
            .read()
            .values()
            .filter_map(Log::newest_key)
            .collect()
    }

    /// Oldest CSN still stored for every replica log.
    #[must_use]
    pub fn oldest_state(&self) -> ServerState {
        let logs = self.logs.read();
        let mut state = ServerState::new();
        for csn in logs.values().filter_map(Log::oldest_key) {
            state.update(csn);
        }
        state
    }

    /// Oldest CSN stored across all replicas.
    #[must_use]
    pub fn oldest_csn(&self) -> Option<Csn> {
        self.logs.read().values().filter_map(Log::oldest_key).min()
    }

    /// Total number of stored records.
    #[must_use]
    pub fn record_count(&self) -> usize {
        self.logs.read().values().map(Log::record_count).sum()
    }

    /// Segments of every replica log.
    #[must_use]
    pub fn segments(&self) -> BTreeMap<u16, Vec<SegmentInfo<Csn>>> {
        self.logs
            .read()
            .iter()
            .map(|(id, log)| (*id, log.segments()))
            .collect()
    }

    /// True if any replica log refuses writes after a failure.
    #[must_use]
    pub fn is_failed(&self) -> bool {
        self.logs.read().values().any(Log::is_failed)
    }

    /// A cursor returning, in CSN order, every record newer than `from`
    /// for its replica. Replicas absent from `from` are read from their
    /// oldest record.
    #[must_use]
    pub fn cursor(self: &Arc<Self>, from: &ServerState) -> ChangelogCursor {
        ChangelogCursor::new(Arc::clone(self), from.clone())
    }

    /// Deletes sealed segments entirely below the watermark of their
    /// replica in `limit`. Replicas absent from `limit` are kept.
    ///
    /// Returns the number of segments deleted.
    ///
    /// # Errors
    ///
    /// Returns an error if a segment file cannot be deleted.
    pub fn purge(&self, limit: &ServerState) -> ChangelogResult<usize> {
        self.ensure_open()?;
        let logs: Vec<(u16, Log<UpdateRecord>)> = self
            .logs
            .read()
            .iter()
            .map(|(id, log)| (*id, log.clone()))
            .collect();
        let mut purged = 0;
        for (replica_id, log) in logs {
            if let Some(csn) = limit.max_csn(replica_id) {
                purged += log.purge_up_to(csn)?;
            }
        }
        if purged > 0 {
            info!(dir = %self.dir.display(), purged, "purged changelog segments");
        }
        Ok(purged)
    }

    /// Removes every replica log and its segment files.
    ///
    /// Open cursors keep reading the files they already hold; new cursors
    /// see an empty changelog. Returns the number of logs removed.
    ///
    /// # Errors
    ///
    /// Returns an error if a log directory cannot be deleted.
    pub fn clear(&self) -> ChangelogResult<usize> {
        self.ensure_open()?;
        let mut logs = self.logs.write();
        let removed = logs.len();
        for (replica_id, log) in std::mem::take(&mut *logs) {
            fs::remove_dir_all(log.dir())?;
            debug!(dir = %self.dir.display(), replica_id, "removed replica log");
        }
        if removed > 0 {
            info!(dir = %self.dir.display(), removed, "cleared changelog");
        }
        Ok(removed)
    }

    /// Fsyncs every replica log.
    ///
    /// # Errors
    ///
    /// Returns the first sync failure.
    pub fn sync(&self) -> ChangelogResult<()> {
        let logs: Vec<Log<UpdateRecord>> = self.logs.read().values().cloned().collect();
        for log in logs {
            log.sync()?;
        }
        Ok(())
    }
}

//! Durable server state.
//!
//! File layout:
//!
//! ```text
//! | magic "DSSS" (4) | version (2) | length (4) | CBOR payload | crc32 (4) |
//! ```
//!
//! The payload records the domain base DN and one `(replica id, time,
//! seqnum)` triple per replica. Saves go through write, fsync, rename and a
//! directory fsync, so a crash leaves either the old or the new file.

use crate::checksum::compute_crc32;
use crate::csn::Csn;
use crate::error::{StateError, StateResult};
use crate::fsutil::write_atomic;
use crate::state::ServerState;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::debug;

const STATE_MAGIC: [u8; 4] = *b"DSSS";
const STATE_VERSION: u16 = 1;
const HEADER_SIZE: usize = 10;
const CRC_SIZE: usize = 4;

#[derive(Debug, Serialize, Deserialize)]
struct PersistedState {
    base_dn: String,
    replicas: Vec<PersistedCsn>,
}

#[derive(Debug, Serialize, Deserialize)]
struct PersistedCsn {
    replica_id: u16,
    time: u64,
    seqnum: u16,
}

/// A [`ServerState`] backed by a file.
///
/// Updates happen in memory and mark the state dirty; [`save`] writes it
/// out. Readers get immutable snapshots, so a save never observes a
/// half-applied update.
///
/// [`save`]: PersistentServerState::save
#[derive(Debug)]
pub struct PersistentServerState {
    path: PathBuf,
    base_dn: String,
    state: RwLock<ServerState>,
    dirty: AtomicBool,
    save_lock: Mutex<()>,
}

impl PersistentServerState {
    /// Loads the state for `base_dn` from `path`, or starts empty if the
    /// file does not exist.
    ///
    /// # Errors
    ///
    /// Returns an error if the file is unreadable, corrupt, or belongs to
    /// a different domain.
    pub fn load(path: &Path, base_dn: &str) -> StateResult<Self> {
        let state = if path.exists() {
            let (found, state) = read_state_file(path)?;
            if found != base_dn {
                return Err(StateError::DomainMismatch {
                    expected: base_dn.to_string(),
                    found,
                });
            }
            debug!(path = %path.display(), state = %state, "loaded server state");
            state
        } else {
            ServerState::new()
        };

        Ok(Self {
            path: path.to_path_buf(),
            base_dn: base_dn.to_string(),
            state: RwLock::new(state),
            dirty: AtomicBool::new(false),
            save_lock: Mutex::new(()),
        })
    }

    /// File backing this state.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Domain this state belongs to.
    #[must_use]
    pub fn base_dn(&self) -> &str {
        &self.base_dn
    }

    /// Records `csn`; returns true if the state moved forward.
    pub fn update(&self, csn: Csn) -> bool {
        let changed = self.state.write().update(csn);
        if changed {
            self.dirty.store(true, Ordering::Release);
        }
        changed
    }

    /// Records every CSN of `other`; returns true if anything moved.
    pub fn merge(&self, other: &ServerState) -> bool {
        let changed = self.state.write().merge(other);
        if changed {
            self.dirty.store(true, Ordering::Release);
        }
        changed
    }

    /// Replaces the whole state, including moving entries back.
    ///
    /// Returns true if it differed from the current state.
    pub fn reset(&self, state: ServerState) -> bool {
        let mut current = self.state.write();
        if *current == state {
            return false;
        }
        *current = state;
        self.dirty.store(true, Ordering::Release);
        true
    }

    /// Newest CSN recorded for `replica_id`.
    #[must_use]
    pub fn max_csn(&self, replica_id: u16) -> Option<Csn> {
        self.state.read().max_csn(replica_id)
    }

    /// An immutable copy of the current state.
    #[must_use]
    pub fn snapshot(&self) -> ServerState {
        self.state.read().clone()
    }

    /// True if updates happened since the last save.
    #[must_use]
    pub fn is_dirty(&self) -> bool {
        self.dirty.load(Ordering::Acquire)
    }

    /// Writes the state if it changed since the last save.
    ///
    /// Returns true if a file was written.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be written. The state stays
    /// dirty so the next save retries.
    pub fn save(&self) -> StateResult<bool> {
        let _guard = self.save_lock.lock();
        if !self.dirty.swap(false, Ordering::AcqRel) {
            return Ok(false);
        }
        self.write_locked(&self.snapshot())?;
        Ok(true)
    }

    /// Writes `snapshot`, an earlier [`snapshot`] of this state, if the
    /// state changed since the last save.
    ///
    /// The state stays dirty if it moved past `snapshot` in the meantime.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be written.
    ///
    /// [`snapshot`]: PersistentServerState::snapshot
    pub fn save_snapshot(&self, snapshot: &ServerState) -> StateResult<bool> {
        let _guard = self.save_lock.lock();
        if !self.dirty.swap(false, Ordering::AcqRel) {
            return Ok(false);
        }
        self.write_locked(snapshot)?;
        if self.snapshot() != *snapshot {
            self.dirty.store(true, Ordering::Release);
        }
        Ok(true)
    }

    fn write_locked(&self, snapshot: &ServerState) -> StateResult<()> {
        let result = encode_state(&self.base_dn, snapshot)
            .and_then(|bytes| write_atomic(&self.path, &bytes).map_err(StateError::from));
        if let Err(err) = result {
            self.dirty.store(true, Ordering::Release);
            return Err(err);
        }
        debug!(path = %self.path.display(), state = %snapshot, "saved server state");
        Ok(())
    }
}

fn encode_state(base_dn: &str, state: &ServerState) -> StateResult<Vec<u8>> {
    let persisted = PersistedState {
        base_dn: base_dn.to_string(),
        replicas: state
            .iter()
            .map(|(replica_id, csn)| PersistedCsn {
                replica_id,
                time: csn.time(),
                seqnum: csn.seqnum(),
            })
            .collect(),
    };

    let mut payload = Vec::new();
    ciborium::into_writer(&persisted, &mut payload)
        .map_err(|e| StateError::corrupted("<encode>", e.to_string()))?;

    let mut out = Vec::with_capacity(HEADER_SIZE + payload.len() + CRC_SIZE);
    out.extend_from_slice(&STATE_MAGIC);
    out.extend_from_slice(&STATE_VERSION.to_le_bytes());
    out.extend_from_slice(&(payload.len() as u32).to_le_bytes());
    out.extend_from_slice(&payload);
    out.extend_from_slice(&compute_crc32(&payload).to_le_bytes());
    Ok(out)
}

/// Reads a state file without taking ownership of it.
///
/// Returns the recorded base DN and state. Used by offline inspection.
///
/// # Errors
///
/// Returns an error if the file cannot be read or is corrupt.
pub fn read_state_file(path: &Path) -> StateResult<(String, ServerState)> {
    let data = std::fs::read(path)?;
    if data.len() < HEADER_SIZE + CRC_SIZE {
        return Err(StateError::corrupted(path, "file too short"));
    }
    if data[0..4] != STATE_MAGIC {
        return Err(StateError::corrupted(path, "bad magic"));
    }
    let version = u16::from_le_bytes([data[4], data[5]]);
    if version != STATE_VERSION {
        return Err(StateError::corrupted(
            path,
            format!("unsupported version {version}"),
        ));
    }
    let len = u32::from_le_bytes([data[6], data[7], data[8], data[9]]) as usize;
    if data.len() != HEADER_SIZE + len + CRC_SIZE {
        return Err(StateError::corrupted(path, "length mismatch"));
    }

    let payload = &data[HEADER_SIZE..HEADER_SIZE + len];
    let crc_bytes = &data[HEADER_SIZE + len..];
    let stored = u32::from_le_bytes([crc_bytes[0], crc_bytes[1], crc_bytes[2], crc_bytes[3]]);
    if stored != compute_crc32(payload) {
        return Err(StateError::corrupted(path, "checksum mismatch"));
    }

    let persisted: PersistedState =
        ciborium::from_reader(payload).map_err(|e| StateError::corrupted(path, e.to_string()))?;
    let state = persisted
        .replicas
        .iter()
        .map(|p| Csn::new(p.time, p.seqnum, p.replica_id))
        .collect();
    Ok((persisted.base_dn, state))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    const DOMAIN: &str = "dc=example,dc=com";

    #[test]
    fn missing_file_starts_empty() {
        let dir = tempdir().unwrap();
        let state = PersistentServerState::load(&dir.path().join("state"), DOMAIN).unwrap();
        assert!(state.snapshot().is_empty());
        assert!(!state.is_dirty());
        assert!(!state.save().unwrap());
    }

    #[test]
    fn save_and_reload_two_replicas() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("state");
        let a = Csn::new(1_700_000_000_000, 3, 1);
        let b = Csn::new(1_700_000_000_500, 0, 2);

        {
            let state = PersistentServerState::load(&path, DOMAIN).unwrap();
            assert!(state.update(a));
            assert!(state.update(b));
            assert!(state.save().unwrap());
            assert!(!state.save().unwrap());
        }

        let reloaded = PersistentServerState::load(&path, DOMAIN).unwrap();
        assert_eq!(reloaded.max_csn(1), Some(a));
        assert_eq!(reloaded.max_csn(2), Some(b));
        assert_eq!(reloaded.snapshot().len(), 2);
    }

    #[test]
    fn reset_moves_entries_back() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("state");
        let state = PersistentServerState::load(&path, DOMAIN).unwrap();
        state.update(Csn::new(20, 0, 1));
        state.update(Csn::new(5, 0, 2));
        state.save().unwrap();

        let lower: ServerState = [Csn::new(10, 0, 1)].into_iter().collect();
        assert!(state.reset(lower.clone()));
        assert!(!state.reset(lower.clone()));
        assert_eq!(state.max_csn(1), Some(Csn::new(10, 0, 1)));
        assert_eq!(state.max_csn(2), None);
        assert!(state.save().unwrap());
        assert_eq!(read_state_file(&path).unwrap().1, lower);
    }

    #[test]
    fn saving_an_older_snapshot_stays_dirty() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("state");
        let state = PersistentServerState::load(&path, DOMAIN).unwrap();
        state.update(Csn::new(10, 0, 1));
        let earlier = state.snapshot();
        state.update(Csn::new(11, 0, 1));

        assert!(state.save_snapshot(&earlier).unwrap());
        assert_eq!(read_state_file(&path).unwrap().1, earlier);
        assert!(state.is_dirty());
        assert!(state.save().unwrap());
        assert_eq!(read_state_file(&path).unwrap().1.max_csn(1), Some(Csn::new(11, 0, 1)));
    }

    #[test]
    fn other_domain_is_rejected() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("state");
        let state = PersistentServerState::load(&path, DOMAIN).unwrap();
        state.update(Csn::new(1, 0, 1));
        state.save().unwrap();

        let err = PersistentServerState::load(&path, "o=other").unwrap_err();
        assert!(matches!(err, StateError::DomainMismatch { .. }));
    }

    #[test]
    fn corrupted_file_is_detected() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("state");
        let state = PersistentServerState::load(&path, DOMAIN).unwrap();
        state.update(Csn::new(1, 0, 1));
        state.save().unwrap();

        let mut bytes = std::fs::read(&path).unwrap();
        let last = bytes.len() - CRC_SIZE - 1;
        bytes[last] ^= 0xff;
        std::fs::write(&path, bytes).unwrap();

        assert!(matches!(
            read_state_file(&path),
            Err(StateError::Corrupted { .. })
        ));
    }

    #[test]
    fn stale_update_does_not_dirty() {
        let dir = tempdir().unwrap();
        let state = PersistentServerState::load(&dir.path().join("state"), DOMAIN).unwrap();
        state.update(Csn::new(10, 0, 1));
        state.save().unwrap();
        assert!(!state.update(Csn::new(5, 0, 1)));
        assert!(!state.is_dirty());
    }
}

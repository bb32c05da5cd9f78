//! A replication domain: one replicated subtree with its own state,
//! changelog, entry history and connected sessions.

use crate::config::DomainConfig;
use crate::error::{ReplicationError, ReplicationResult};
use dsrepl_core::{
    normalize_dn, AppendOutcome, ChangelogDb, Csn, CsnExhausted, CsnGenerator, EntryStore,
    LogConfig, Operation, PersistentServerState, ServerState, UpdateRecord,
};
use dsrepl_protocol::ReplMessage;
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap};
use std::fmt::Write as _;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

const STATE_FILE: &str = "server.state";
const CHANGELOG_DIR: &str = "changelog";

/// Directory name used for a domain under the server root.
///
/// Characters outside `[a-z0-9=,.-_]` are percent-encoded, so every
/// normalized base DN maps to a distinct portable name.
#[must_use]
pub fn domain_dir_name(base_dn: &str) -> String {
    let mut name = String::with_capacity(base_dn.len());
    for byte in normalize_dn(base_dn).bytes() {
        match byte {
            b'a'..=b'z' | b'0'..=b'9' | b'=' | b',' | b'.' | b'-' | b'_' => {
                name.push(char::from(byte));
            }
            other => {
                let _ = write!(name, "%{other:02x}");
            }
        }
    }
    name
}

/// Inverse of [`domain_dir_name`]. `None` if `name` is not a name that
/// function produces.
pub(crate) fn base_dn_from_dir_name(name: &str) -> Option<String> {
    let mut bytes = Vec::with_capacity(name.len());
    let mut rest = name.as_bytes();
    while let Some((&first, tail)) = rest.split_first() {
        if first == b'%' {
            let hex = std::str::from_utf8(tail.get(..2)?).ok()?;
            bytes.push(u8::from_str_radix(hex, 16).ok()?);
            rest = &tail[2..];
        } else {
            bytes.push(first);
            rest = tail;
        }
    }
    let base_dn = String::from_utf8(bytes).ok()?;
    (!base_dn.is_empty() && domain_dir_name(&base_dn) == name).then_some(base_dn)
}

/// True if `dir` holds a domain's state or changelog.
pub(crate) fn is_domain_dir(dir: &Path) -> bool {
    dir.join(STATE_FILE).is_file() || dir.join(CHANGELOG_DIR).is_dir()
}

/// Work delivered to a session's writer.
#[derive(Debug)]
pub(crate) enum SessionEvent {
    /// A record accepted from another session or a local submit.
    Update(UpdateRecord),
    /// A message to send as is.
    Send(ReplMessage),
    /// Send `Stop` and close.
    Close,
}

/// A connected replica, as seen by its domain.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionInfo {
    /// Session id.
    pub id: Uuid,
    /// Replica id announced in the handshake.
    pub replica_id: u16,
    /// Remote address.
    pub peer: SocketAddr,
}

#[derive(Debug)]
struct SessionHandle {
    info: SessionInfo,
    events: mpsc::UnboundedSender<SessionEvent>,
}

/// Result of accepting an update.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Accepted {
    /// CSN of the accepted record.
    pub csn: Csn,
    /// Number of sessions the record was forwarded to.
    pub fanned_out: usize,
}

/// One replicated subtree.
///
/// Accepting an update is serialized per domain: validation, the changelog
/// append, the state update and the fan-out happen under one lock, so every
/// session sees records in changelog order.
#[derive(Debug)]
pub struct ReplicationDomain {
    base_dn: String,
    dir: PathBuf,
    ecl_enabled: AtomicBool,
    disabled: AtomicBool,
    generator: CsnGenerator,
    state: PersistentServerState,
    changelog: Arc<ChangelogDb>,
    entries: EntryStore,
    sessions: Mutex<HashMap<Uuid, SessionHandle>>,
    peer_states: Mutex<BTreeMap<u16, ServerState>>,
    accept_lock: Mutex<()>,
}

impl ReplicationDomain {
    /// Opens the domain under `root`, loading its state and changelog.
    ///
    /// The entry history is rebuilt by replaying the changelog.
    ///
    /// # Errors
    ///
    /// Returns an error if the state file or changelog cannot be opened.
    pub fn open(
        root: &Path,
        config: &DomainConfig,
        server_id: u16,
        log_config: LogConfig,
    ) -> ReplicationResult<Self> {
        let base_dn = normalize_dn(&config.base_dn);
        let dir = root.join(domain_dir_name(&base_dn));
        std::fs::create_dir_all(&dir)?;

        let state = PersistentServerState::load(&dir.join(STATE_FILE), &base_dn)?;
        let changelog = Arc::new(ChangelogDb::open(&dir.join(CHANGELOG_DIR), log_config)?);

        // CSNs handed out before a restart stay used, even if their records
        // never reached the disk
        let saved = state.snapshot();
        let durable = changelog.newest_state();
        let generator = CsnGenerator::new(server_id);
        for (_, csn) in saved.iter().chain(durable.iter()) {
            generator.adjust(csn);
        }
        // the changelog is the source of truth: a saved state ahead of it
        // would make redelivered records look like duplicates
        if state.reset(durable) {
            let durable = state.snapshot();
            if saved.iter().any(|(_, csn)| !durable.covers(&csn)) {
                warn!(
                    base_dn = %base_dn,
                    saved = %saved,
                    durable = %durable,
                    "saved state is ahead of the changelog; using the changelog"
                );
            }
        }

        let entries = EntryStore::new();
        let mut cursor = changelog.cursor(&ServerState::new());
        let mut replayed = 0usize;
        while let Some(record) = cursor.next()? {
            entries.apply(&record.entry_dn, &record.operation, record.csn);
            replayed += 1;
        }

        info!(
            base_dn = %base_dn,
            state = %state.snapshot(),
            replayed,
            "opened replication domain"
        );
        Ok(Self {
            base_dn,
            dir,
            ecl_enabled: AtomicBool::new(config.ecl_enabled),
            disabled: AtomicBool::new(false),
            generator,
            state,
            changelog,
            entries,
            sessions: Mutex::new(HashMap::new()),
            peer_states: Mutex::new(BTreeMap::new()),
            accept_lock: Mutex::new(()),
        })
    }

    /// Normalized base DN.
    #[must_use]
    pub fn base_dn(&self) -> &str {
        &self.base_dn
    }

    /// Directory holding this domain's files.
    #[must_use]
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Whether the domain contributes to the external changelog.
    #[must_use]
    pub fn is_ecl_enabled(&self) -> bool {
        self.ecl_enabled.load(Ordering::Acquire)
    }

    pub(crate) fn set_ecl_enabled(&self, enabled: bool) {
        self.ecl_enabled.store(enabled, Ordering::Release);
    }

    /// True once the domain stopped accepting writes.
    #[must_use]
    pub fn is_disabled(&self) -> bool {
        self.disabled.load(Ordering::Acquire)
    }

    /// Stops accepting writes. Reads keep working.
    pub fn disable(&self) {
        if !self.disabled.swap(true, Ordering::AcqRel) {
            warn!(base_dn = %self.base_dn, "replication domain disabled");
        }
    }

    /// Disables the domain, ends its sessions, flushes it and releases its
    /// changelog directory.
    ///
    /// Handles still held elsewhere keep reading, and the base DN can be
    /// opened again right away.
    ///
    /// # Errors
    ///
    /// Returns the flush or close failure; the changelog is released
    /// either way.
    pub(crate) fn close(&self) -> ReplicationResult<()> {
        let _guard = self.accept_lock.lock();
        self.disable();
        self.close_sessions();
        let flushed = self.flush();
        let closed = self.changelog.close();
        flushed?;
        closed?;
        Ok(())
    }

    /// Current watermarks.
    #[must_use]
    pub fn state(&self) -> ServerState {
        self.state.snapshot()
    }

    /// The domain changelog.
    #[must_use]
    pub fn changelog(&self) -> &Arc<ChangelogDb> {
        &self.changelog
    }

    /// Resolved entry history.
    #[must_use]
    pub fn entries(&self) -> &EntryStore {
        &self.entries
    }

    /// Id used for CSNs generated by this server.
    #[must_use]
    pub fn local_replica_id(&self) -> u16 {
        self.generator.replica_id()
    }

    /// Accepts a change made on this server, assigning it the next local
    /// CSN.
    ///
    /// # Errors
    ///
    /// Returns [`ReplicationError::CsnExhausted`] if no CSN is left this
    /// millisecond, or any error from [`ReplicationDomain::accept`].
    pub fn accept_local(
        &self,
        entry_dn: &str,
        operation: Operation,
        correlation_id: Option<Uuid>,
    ) -> ReplicationResult<Accepted> {
        let _guard = self.accept_lock.lock();
        self.ensure_enabled()?;
        let csn = self.generator.next().inspect_err(|e: &CsnExhausted| {
            warn!(base_dn = %self.base_dn, error = %e, "local CSN space exhausted");
        })?;
        let mut record = UpdateRecord::new(csn, entry_dn, operation);
        record.correlation_id = correlation_id;
        self.accept_locked(&record, None)
    }

    /// Accepts a replicated change.
    ///
    /// `origin` is the session the record came from; it is not sent back
    /// there.
    ///
    /// # Errors
    ///
    /// Returns [`ReplicationError::OrderingViolation`] if the CSN is not
    /// newer than the last one from its replica, or a changelog error, in
    /// which case the domain is disabled.
    pub fn accept(
        &self,
        record: &UpdateRecord,
        origin: Option<Uuid>,
    ) -> ReplicationResult<Accepted> {
        let _guard = self.accept_lock.lock();
        self.accept_locked(record, origin)
    }

    fn ensure_enabled(&self) -> ReplicationResult<()> {
        if self.is_disabled() {
            return Err(ReplicationError::DomainUnavailable(self.base_dn.clone()));
        }
        Ok(())
    }

    fn accept_locked(
        &self,
        record: &UpdateRecord,
        origin: Option<Uuid>,
    ) -> ReplicationResult<Accepted> {
        self.ensure_enabled()?;
        let csn = record.csn;

        if let Some(last) = self.state.max_csn(csn.replica_id()) {
            if csn <= last {
                let benign = self.is_duplicate(record);
                return Err(ReplicationError::OrderingViolation { csn, last, benign });
            }
        }

        match self.changelog.append(record) {
            Ok(AppendOutcome::Appended) => {}
            Ok(AppendOutcome::Stale { last }) => {
                return Err(ReplicationError::OrderingViolation {
                    csn,
                    last,
                    benign: self.is_duplicate(record),
                });
            }
            Err(err) => {
                error!(base_dn = %self.base_dn, csn = %csn, error = %err, "changelog append failed");
                self.disable();
                return Err(err.into());
            }
        }

        self.state.update(csn);
        self.generator.adjust(csn);
        self.entries
            .apply(&record.entry_dn, &record.operation, csn);
        let fanned_out = self.fan_out(record, origin);
        debug!(
            base_dn = %self.base_dn,
            csn = %csn,
            dn = %record.entry_dn,
            op = record.operation.name(),
            fanned_out,
            "accepted update"
        );
        Ok(Accepted { csn, fanned_out })
    }

    fn is_duplicate(&self, record: &UpdateRecord) -> bool {
        match self.changelog.find(record.csn) {
            Ok(Some(stored)) => {
                stored.entry_dn == record.entry_dn && stored.operation == record.operation
            }
            Ok(None) => false,
            Err(err) => {
                warn!(base_dn = %self.base_dn, csn = %record.csn, error = %err, "duplicate check failed");
                false
            }
        }
    }

    fn fan_out(&self, record: &UpdateRecord, origin: Option<Uuid>) -> usize {
        let mut sessions = self.sessions.lock();
        let mut sent = 0;
        sessions.retain(|id, handle| {
            if Some(*id) == origin {
                return true;
            }
            let delivered = handle
                .events
                .send(SessionEvent::Update(record.clone()))
                .is_ok();
            if delivered {
                sent += 1;
            }
            delivered
        });
        sent
    }

    /// Registers a session for live updates.
    ///
    /// Registration is ordered with respect to accepts: every record
    /// accepted afterwards is delivered on the returned channel, and the
    /// returned state covers every record accepted before.
    pub(crate) fn register_session(
        &self,
        info: SessionInfo,
    ) -> ReplicationResult<(mpsc::UnboundedReceiver<SessionEvent>, ServerState)> {
        let _guard = self.accept_lock.lock();
        self.ensure_enabled()?;
        let (tx, rx) = mpsc::unbounded_channel();
        debug!(base_dn = %self.base_dn, session = %info.id, replica_id = info.replica_id, "session registered");
        self.sessions.lock().insert(
            info.id,
            SessionHandle {
                info,
                events: tx,
            },
        );
        Ok((rx, self.state.snapshot()))
    }

    pub(crate) fn unregister_session(&self, id: Uuid) {
        if self.sessions.lock().remove(&id).is_some() {
            debug!(base_dn = %self.base_dn, session = %id, "session unregistered");
        }
    }

    pub(crate) fn send_to_session(&self, id: Uuid, event: SessionEvent) -> bool {
        self.sessions
            .lock()
            .get(&id)
            .is_some_and(|handle| handle.events.send(event).is_ok())
    }

    /// Asks every session to stop.
    pub fn close_sessions(&self) {
        let sessions = self.sessions.lock();
        for handle in sessions.values() {
            let _ = handle.events.send(SessionEvent::Close);
        }
    }

    /// Connected sessions.
    #[must_use]
    pub fn sessions(&self) -> Vec<SessionInfo> {
        self.sessions
            .lock()
            .values()
            .map(|handle| handle.info.clone())
            .collect()
    }

    /// Records what replica `replica_id` reports having applied.
    pub fn record_peer_state(&self, replica_id: u16, state: &ServerState) {
        self.peer_states
            .lock()
            .entry(replica_id)
            .or_default()
            .merge(state);
    }

    /// Latest state reported by every replica seen since startup.
    #[must_use]
    pub fn peer_states(&self) -> BTreeMap<u16, ServerState> {
        self.peer_states.lock().clone()
    }

    /// Highest CSN per replica below which history may be discarded.
    ///
    /// A replica's records qualify once they are older than the purge
    /// delay and every known peer has applied them. A peer that never
    /// reported a replica pins that replica's history.
    #[must_use]
    pub fn purge_limit(&self, now_millis: u64, purge_delay: Duration) -> ServerState {
        let delay = u64::try_from(purge_delay.as_millis()).unwrap_or(u64::MAX);
        let cutoff = now_millis.saturating_sub(delay);
        let peers = self.peer_states.lock().clone();

        let mut limit = ServerState::new();
        'replicas: for replica_id in self.changelog.replica_ids() {
            let mut bound = Csn::new(cutoff, 0, replica_id);
            for peer in peers.values() {
                match peer.max_csn(replica_id) {
                    Some(seen) => bound = bound.min(seen),
                    None => continue 'replicas,
                }
            }
            limit.update(bound);
        }
        limit
    }

    /// Discards changelog segments and entry history that no replica
    /// needs any more. Returns the number of segments deleted.
    ///
    /// # Errors
    ///
    /// Returns an error if a segment cannot be deleted.
    pub fn purge(&self, now_millis: u64, purge_delay: Duration) -> ReplicationResult<usize> {
        let limit = self.purge_limit(now_millis, purge_delay);
        if limit.is_empty() {
            return Ok(0);
        }
        let purged = self.changelog.purge(&limit)?;
        if let Some(oldest_needed) = limit.min_csn() {
            let dropped = self.entries.purge_historical(oldest_needed);
            if dropped > 0 {
                debug!(base_dn = %self.base_dn, dropped, "purged entry history");
            }
        }
        Ok(purged)
    }

    /// Syncs the changelog, then saves the state if it changed.
    ///
    /// The saved state never covers a record that is not yet durable.
    /// Returns true if the state file was written.
    ///
    /// # Errors
    ///
    /// Returns the first failure. A changelog sync failure disables the
    /// domain and leaves the state file untouched.
    pub fn flush(&self) -> ReplicationResult<bool> {
        // a reopened domain owns the files now
        if self.changelog.is_closed() {
            return Ok(false);
        }
        // snapshot first: records accepted during the sync are not synced
        let covered = self.state.snapshot();
        if let Err(err) = self.changelog.sync() {
            error!(base_dn = %self.base_dn, error = %err, "changelog sync failed");
            self.disable();
            return Err(err.into());
        }
        Ok(self.state.save_snapshot(&covered)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use dsrepl_core::{AttributeChange, AttributeValue};
    use std::sync::Arc;
    use std::thread;
    use tempfile::tempdir;

    const BASE: &str = "dc=example,dc=com";

    fn open(root: &Path) -> ReplicationDomain {
        ReplicationDomain::open(root, &DomainConfig::new(BASE), 1, LogConfig::default()).unwrap()
    }

    fn add_mail(t: u64, replica: u16, value: &str) -> UpdateRecord {
        UpdateRecord::new(
            Csn::new(t, 0, replica),
            "cn=a,dc=example,dc=com",
            Operation::Modify {
                changes: vec![AttributeChange::add("mail", [value])],
            },
        )
    }

    fn add_entry(t: u64, replica: u16) -> UpdateRecord {
        UpdateRecord::new(
            Csn::new(t, 0, replica),
            "cn=a,dc=example,dc=com",
            Operation::Add {
                attributes: vec![("cn".to_string(), vec![AttributeValue::from("a")])],
            },
        )
    }

    fn session(replica_id: u16) -> SessionInfo {
        SessionInfo {
            id: Uuid::new_v4(),
            replica_id,
            peer: SocketAddr::from(([127, 0, 0, 1], 4000 + replica_id)),
        }
    }

    #[test]
    fn dir_names_are_portable() {
        assert_eq!(domain_dir_name("DC=Example, DC=com"), "dc=example,dc=com");
        assert_eq!(domain_dir_name("o=a b/c"), "o=a%20b%2fc");
        assert_eq!(base_dn_from_dir_name("o=a%20b%2fc").as_deref(), Some("o=a b/c"));
        assert_eq!(base_dn_from_dir_name("o=A"), None);
        assert_eq!(base_dn_from_dir_name("o=a%2"), None);
        assert_eq!(base_dn_from_dir_name(""), None);
    }

    #[test]
    fn accept_updates_state_and_entries() {
        let dir = tempdir().unwrap();
        let domain = open(dir.path());
        domain.accept(&add_entry(50, 2), None).unwrap();
        let accepted = domain.accept(&add_mail(100, 2, "a@x"), None).unwrap();
        assert_eq!(accepted.csn, Csn::new(100, 0, 2));
        assert_eq!(domain.state().max_csn(2), Some(Csn::new(100, 0, 2)));
        assert_eq!(
            domain
                .entries()
                .resolved_values("cn=a,dc=example,dc=com", "mail"),
            Some(vec![AttributeValue::from("a@x")])
        );
    }

    #[test]
    fn redelivery_is_a_benign_violation() {
        let dir = tempdir().unwrap();
        let domain = open(dir.path());
        domain.accept(&add_mail(100, 2, "a@x"), None).unwrap();

        let err = domain.accept(&add_mail(100, 2, "a@x"), None).unwrap_err();
        assert!(err.is_benign());

        let err = domain.accept(&add_mail(90, 2, "b@x"), None).unwrap_err();
        assert!(matches!(
            err,
            ReplicationError::OrderingViolation { benign: false, .. }
        ));
        assert_eq!(domain.changelog().record_count(), 1);
    }

    #[test]
    fn saved_state_ahead_of_changelog_is_lowered_on_open() {
        let dir = tempdir().unwrap();
        let state_path = {
            let domain = open(dir.path());
            domain.accept(&add_entry(50, 2), None).unwrap();
            domain.flush().unwrap();
            domain.dir().join(STATE_FILE)
        };
        // a state saved for records that never became durable
        let saved = PersistentServerState::load(&state_path, BASE).unwrap();
        saved.update(Csn::new(500, 0, 2));
        saved.update(Csn::new(400, 0, 3));
        saved.save().unwrap();
        drop(saved);

        let domain = open(dir.path());
        assert_eq!(domain.state().max_csn(2), Some(Csn::new(50, 0, 2)));
        assert_eq!(domain.state().max_csn(3), None);
        // the lost records are accepted when replayed
        domain.accept(&add_mail(400, 3, "c@x"), None).unwrap();
        domain.accept(&add_mail(500, 2, "b@x"), None).unwrap();
        assert!(domain.flush().unwrap());
    }

    #[test]
    fn failed_append_disables_the_domain() {
        let dir = tempdir().unwrap();
        let domain = ReplicationDomain::open(
            dir.path(),
            &DomainConfig::new(BASE),
            1,
            LogConfig::default().with_max_segment_size(1),
        )
        .unwrap();
        domain.accept(&add_entry(50, 2), None).unwrap();

        // sealing the head on the next append fails
        std::fs::remove_dir_all(domain.dir().join(CHANGELOG_DIR).join("2")).unwrap();
        let err = domain.accept(&add_mail(100, 2, "a@x"), None).unwrap_err();
        assert!(matches!(err, ReplicationError::Changelog(_)));
        assert!(domain.is_disabled());
        assert!(domain.changelog().log(2).unwrap().is_failed());
        assert_eq!(domain.state().max_csn(2), Some(Csn::new(50, 0, 2)));

        assert!(matches!(
            domain.accept_local("cn=b,dc=example,dc=com", Operation::Delete, None),
            Err(ReplicationError::DomainUnavailable(_))
        ));
        assert!(matches!(
            domain.accept(&add_mail(200, 3, "b@x"), None),
            Err(ReplicationError::DomainUnavailable(_))
        ));
    }

    #[test]
    fn local_csns_follow_remote_ones() {
        let dir = tempdir().unwrap();
        let domain = open(dir.path());
        let far_future = u64::MAX / 2;
        domain.accept(&add_mail(far_future, 2, "a@x"), None).unwrap();

        let local = domain
            .accept_local("cn=b,dc=example,dc=com", Operation::Delete, None)
            .unwrap();
        assert_eq!(local.csn.replica_id(), 1);
        assert!(local.csn.time() > far_future);
    }

    #[test]
    fn concurrent_local_accepts_never_conflict() {
        let dir = tempdir().unwrap();
        let domain = Arc::new(open(dir.path()));
        let workers: Vec<_> = (0..4)
            .map(|i| {
                let domain = Arc::clone(&domain);
                thread::spawn(move || {
                    for n in 0..50 {
                        domain
                            .accept_local(&format!("cn=w{i}-{n},{BASE}"), Operation::Delete, None)
                            .unwrap();
                    }
                })
            })
            .collect();
        for w in workers {
            w.join().unwrap();
        }
        assert_eq!(domain.changelog().record_count(), 200);
    }

    #[test]
    fn fan_out_skips_origin() {
        let dir = tempdir().unwrap();
        let domain = open(dir.path());
        let a = session(2);
        let b = session(3);
        let (mut rx_a, _) = domain.register_session(a.clone()).unwrap();
        let (mut rx_b, _) = domain.register_session(b).unwrap();

        let accepted = domain.accept(&add_mail(10, 2, "x"), Some(a.id)).unwrap();
        assert_eq!(accepted.fanned_out, 1);
        assert!(rx_a.try_recv().is_err());
        assert!(matches!(rx_b.try_recv(), Ok(SessionEvent::Update(r)) if r.csn == accepted.csn));

        domain.unregister_session(a.id);
        assert_eq!(domain.sessions().len(), 1);
    }

    #[test]
    fn closed_receivers_are_dropped_on_fan_out() {
        let dir = tempdir().unwrap();
        let domain = open(dir.path());
        let (rx, _) = domain.register_session(session(2)).unwrap();
        drop(rx);
        let accepted = domain.accept(&add_mail(10, 3, "x"), None).unwrap();
        assert_eq!(accepted.fanned_out, 0);
        assert!(domain.sessions().is_empty());
    }

    #[test]
    fn reopen_replays_history() {
        let dir = tempdir().unwrap();
        {
            let domain = open(dir.path());
            domain.accept(&add_entry(5, 2), None).unwrap();
            domain.accept(&add_mail(10, 2, "a@x"), None).unwrap();
            domain.accept(&add_mail(11, 3, "b@x"), None).unwrap();
            // no flush: the state must be rebuilt from the changelog
        }
        let domain = open(dir.path());
        assert_eq!(domain.state().max_csn(3), Some(Csn::new(11, 0, 3)));
        let mut values = domain
            .entries()
            .resolved_values("cn=a,dc=example,dc=com", "mail")
            .unwrap();
        values.sort();
        assert_eq!(
            values,
            vec![AttributeValue::from("a@x"), AttributeValue::from("b@x")]
        );
    }

    #[test]
    fn disabled_domain_rejects_writes() {
        let dir = tempdir().unwrap();
        let domain = open(dir.path());
        domain.disable();
        assert!(matches!(
            domain.accept(&add_mail(1, 2, "x"), None),
            Err(ReplicationError::DomainUnavailable(_))
        ));
        assert!(domain.register_session(session(2)).is_err());
    }

    #[test]
    fn purge_limit_waits_for_every_peer() {
        let dir = tempdir().unwrap();
        let domain = open(dir.path());
        domain.accept(&add_mail(1_000, 2, "x"), None).unwrap();
        domain.accept(&add_mail(1_000, 3, "y"), None).unwrap();
        let now = 10_000;

        // no peers: age alone decides
        let limit = domain.purge_limit(now, Duration::from_millis(5_000));
        assert_eq!(limit.max_csn(2), Some(Csn::new(5_000, 0, 2)));

        let peer: ServerState = [Csn::new(800, 0, 2)].into_iter().collect();
        domain.record_peer_state(4, &peer);
        let limit = domain.purge_limit(now, Duration::from_millis(5_000));
        assert_eq!(limit.max_csn(2), Some(Csn::new(800, 0, 2)));
        // peer 4 has never seen replica 3
        assert_eq!(limit.max_csn(3), None);
    }

    #[test]
    fn flush_writes_state_once() {
        let dir = tempdir().unwrap();
        let domain = open(dir.path());
        domain.accept(&add_mail(10, 2, "x"), None).unwrap();
        assert!(domain.flush().unwrap());
        assert!(!domain.flush().unwrap());
        assert!(domain.dir().join(STATE_FILE).exists());
    }
}

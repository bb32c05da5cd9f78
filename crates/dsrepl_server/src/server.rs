//! The replication server.

use crate::config::{ConfigError, ConfigEvent, ConfigListener, DomainConfig, RuntimeParams, ServerConfig};
use crate::domain::{base_dn_from_dir_name, is_domain_dir, ReplicationDomain};
use crate::ecl::EclCursor;
use crate::error::{ReplicationError, ReplicationResult};
use crate::session::{reject, run_session};
use crate::timeout::TimeoutChecker;
use dsrepl_core::{normalize_dn, AttributeValue, Csn, Operation, UpdateRecord};
use dsrepl_protocol::EclCookie;
use parking_lot::RwLock;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio::task::JoinSet;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

const SESSION_SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

/// A change submitted to the server.
#[derive(Debug, Clone, PartialEq)]
pub struct SubmitRequest {
    /// Domain the entry belongs to.
    pub base_dn: String,
    /// DN of the changed entry.
    pub entry_dn: String,
    /// The change.
    pub operation: Operation,
    /// CSN assigned by the originating replica; `None` for a change made
    /// on this server.
    pub origin_csn: Option<Csn>,
    /// Caller id echoed back in the acknowledgement.
    pub correlation_id: Option<Uuid>,
}

impl SubmitRequest {
    /// A change made on this server. The server assigns the CSN.
    pub fn local(
        base_dn: impl Into<String>,
        entry_dn: impl Into<String>,
        operation: Operation,
    ) -> Self {
        Self {
            base_dn: base_dn.into(),
            entry_dn: entry_dn.into(),
            operation,
            origin_csn: None,
            correlation_id: None,
        }
    }

    /// A change made on another replica.
    pub fn remote(
        base_dn: impl Into<String>,
        entry_dn: impl Into<String>,
        operation: Operation,
        csn: Csn,
    ) -> Self {
        Self {
            origin_csn: Some(csn),
            ..Self::local(base_dn, entry_dn, operation)
        }
    }

    /// Attaches a correlation id.
    #[must_use]
    pub fn with_correlation_id(mut self, id: Uuid) -> Self {
        self.correlation_id = Some(id);
        self
    }
}

/// Acknowledgement of a submitted change.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SubmitAck {
    /// CSN of the stored change.
    pub csn: Csn,
    /// Correlation id from the request.
    pub correlation_id: Option<Uuid>,
}

#[derive(Debug)]
pub(crate) struct ServerInner {
    pub(crate) config: ServerConfig,
    runtime: RwLock<RuntimeParams>,
    domains: RwLock<BTreeMap<String, Arc<ReplicationDomain>>>,
    pub(crate) active_sessions: AtomicUsize,
    shutdown: watch::Sender<bool>,
}

/// A replication server: one [`ReplicationDomain`] per base DN, replica
/// sessions over TCP, and the external changelog.
///
/// Cheap to clone; clones share the same server.
#[derive(Debug, Clone)]
pub struct ReplicationServer {
    inner: Arc<ServerInner>,
}

impl ReplicationServer {
    /// Opens the server: validates `config`, then opens the configured
    /// domains and every domain found under the root directory.
    ///
    /// # Errors
    ///
    /// Returns an error for invalid configuration or a domain that fails
    /// to open.
    pub fn open(config: ServerConfig) -> ReplicationResult<Self> {
        config.validate()?;
        std::fs::create_dir_all(&config.root_dir)?;

        let (shutdown, _) = watch::channel(false);
        let inner = Arc::new(ServerInner {
            runtime: RwLock::new(config.runtime.clone()),
            config,
            domains: RwLock::new(BTreeMap::new()),
            active_sessions: AtomicUsize::new(0),
            shutdown,
        });

        for domain in inner.config.domains.clone() {
            inner.open_domain(&domain)?;
        }
        for entry in std::fs::read_dir(&inner.config.root_dir)? {
            let entry = entry?;
            if !entry.file_type()?.is_dir() || !is_domain_dir(&entry.path()) {
                continue;
            }
            let name = entry.file_name().to_string_lossy().into_owned();
            let Some(base_dn) = base_dn_from_dir_name(&name) else {
                debug!(dir = %name, "skipping unrecognized directory");
                continue;
            };
            if inner.domains.read().contains_key(&base_dn) {
                continue;
            }
            inner.open_domain(&DomainConfig::new(base_dn))?;
        }

        info!(
            server_id = inner.config.server_id,
            root = %inner.config.root_dir.display(),
            domains = inner.domains.read().len(),
            "replication server opened"
        );
        Ok(Self { inner })
    }

    /// Id of this server.
    #[must_use]
    pub fn server_id(&self) -> u16 {
        self.inner.config.server_id
    }

    /// Static configuration.
    #[must_use]
    pub fn config(&self) -> &ServerConfig {
        &self.inner.config
    }

    /// Current runtime parameters.
    #[must_use]
    pub fn runtime(&self) -> RuntimeParams {
        self.inner.runtime.read().clone()
    }

    /// The domain for `base_dn`, if open.
    #[must_use]
    pub fn domain(&self, base_dn: &str) -> Option<Arc<ReplicationDomain>> {
        self.inner.domains.read().get(&normalize_dn(base_dn)).cloned()
    }

    /// The domain for `base_dn`, opening it if needed.
    ///
    /// # Errors
    ///
    /// Returns an error if the domain cannot be opened.
    pub fn domain_or_create(&self, base_dn: &str) -> ReplicationResult<Arc<ReplicationDomain>> {
        self.inner.domain_or_create(base_dn)
    }

    /// Open domains, sorted by base DN.
    #[must_use]
    pub fn domains(&self) -> Vec<Arc<ReplicationDomain>> {
        self.inner.domains.read().values().cloned().collect()
    }

    /// Normalized base DNs of the open domains.
    #[must_use]
    pub fn base_dns(&self) -> Vec<String> {
        self.inner.domains.read().keys().cloned().collect()
    }

    /// Stores a change and forwards it to connected replicas.
    ///
    /// Local changes get the next CSN of this server. Remote changes keep
    /// their CSN and must be newer than the last one from their replica.
    ///
    /// # Errors
    ///
    /// Returns [`ReplicationError::OrderingViolation`] for a stale remote
    /// CSN, [`ReplicationError::CsnExhausted`] when no local CSN is left
    /// this millisecond, or a domain error.
    pub fn submit(&self, request: SubmitRequest) -> ReplicationResult<SubmitAck> {
        let domain = self.inner.domain_or_create(&request.base_dn)?;
        let accepted = match request.origin_csn {
            None => domain.accept_local(
                &request.entry_dn,
                request.operation,
                request.correlation_id,
            )?,
            Some(csn) => {
                let mut record = UpdateRecord::new(csn, request.entry_dn, request.operation);
                record.correlation_id = request.correlation_id;
                domain.accept(&record, None)?
            }
        };
        Ok(SubmitAck {
            csn: accepted.csn,
            correlation_id: request.correlation_id,
        })
    }

    /// Surviving values of `attribute` on `entry_dn` after conflict
    /// resolution, in value order. `None` if the entry does not exist.
    ///
    /// # Errors
    ///
    /// Returns [`ReplicationError::UnknownDomain`] if the domain is not
    /// open.
    pub fn resolved_values(
        &self,
        base_dn: &str,
        entry_dn: &str,
        attribute: &str,
    ) -> ReplicationResult<Option<Vec<AttributeValue>>> {
        let domain = self
            .domain(base_dn)
            .ok_or_else(|| ReplicationError::UnknownDomain(normalize_dn(base_dn)))?;
        Ok(domain.entries().resolved_values(entry_dn, attribute))
    }

    /// Tears a domain down: stops its sessions, saves its state, releases
    /// its changelog and removes it. Returns false if it was not open.
    ///
    /// Sessions and cursors still holding the old domain drain on their
    /// own; the base DN can be opened again immediately.
    ///
    /// # Errors
    ///
    /// Returns an error if the final save fails; the domain is removed
    /// regardless.
    pub fn disable_domain(&self, base_dn: &str) -> ReplicationResult<bool> {
        let key = normalize_dn(base_dn);
        let Some(domain) = self.inner.domains.write().remove(&key) else {
            return Ok(false);
        };
        domain.close()?;
        info!(base_dn = %key, "replication domain removed");
        Ok(true)
    }

    fn ecl_domains(&self) -> Vec<Arc<ReplicationDomain>> {
        self.inner
            .domains
            .read()
            .values()
            .filter(|d| d.is_ecl_enabled())
            .cloned()
            .collect()
    }

    /// Checks that `cookie` can be served.
    ///
    /// # Errors
    ///
    /// Returns [`ReplicationError::CookieUnknownDomain`] for a domain that
    /// is not open or not in the external changelog, and
    /// [`ReplicationError::CookieTooOld`] if records after a position were
    /// purged.
    pub fn validate_cookie(&self, cookie: &EclCookie) -> ReplicationResult<()> {
        for (base_dn, state) in cookie.iter() {
            let domain = self
                .domain(base_dn)
                .filter(|d| d.is_ecl_enabled())
                .ok_or_else(|| ReplicationError::CookieUnknownDomain(base_dn.to_string()))?;
            let oldest = domain.changelog().oldest_state();
            for (replica_id, csn) in state.iter() {
                if let Some(oldest) = oldest.max_csn(replica_id) {
                    if csn < oldest {
                        return Err(ReplicationError::CookieTooOld {
                            base_dn: base_dn.to_string(),
                            csn,
                            oldest,
                        });
                    }
                }
            }
        }
        Ok(())
    }

    /// Opens the external changelog at `cookie`. An empty cookie starts
    /// at the oldest record of every domain.
    ///
    /// # Errors
    ///
    /// Returns the error of [`ReplicationServer::validate_cookie`].
    pub fn open_ecl(&self, cookie: &EclCookie) -> ReplicationResult<EclCursor> {
        self.validate_cookie(cookie)?;
        let normalized: EclCookie = cookie
            .iter()
            .map(|(base_dn, state)| (normalize_dn(base_dn), state.clone()))
            .collect();
        Ok(EclCursor::new(self.ecl_domains(), normalized))
    }

    /// Cookie positioned after the newest record of every domain.
    #[must_use]
    pub fn newest_cookie(&self) -> EclCookie {
        self.ecl_domains()
            .iter()
            .map(|d| (d.base_dn().to_string(), d.changelog().newest_state()))
            .collect()
    }

    /// Oldest CSN still available in the external changelog.
    #[must_use]
    pub fn oldest_available_csn(&self) -> Option<Csn> {
        self.ecl_domains()
            .iter()
            .filter_map(|d| d.changelog().oldest_csn())
            .min()
    }

    /// Saves every domain's state and syncs its changelog. Returns the
    /// number of state files written.
    ///
    /// # Errors
    ///
    /// Returns the first failure; the other domains are still flushed.
    pub fn flush(&self) -> ReplicationResult<usize> {
        self.inner.flush_all()
    }

    /// Runs the purge policy as of `now_millis`. Returns the number of
    /// changelog segments deleted.
    ///
    /// # Errors
    ///
    /// Returns the first failure; the other domains are still purged.
    pub fn purge(&self, now_millis: u64) -> ReplicationResult<usize> {
        self.inner.purge_all(now_millis)
    }

    /// Binds the configured address and serves until [`shutdown`].
    ///
    /// [`shutdown`]: ReplicationServer::shutdown
    ///
    /// # Errors
    ///
    /// Returns an error if the address cannot be bound.
    pub async fn serve(&self) -> ReplicationResult<()> {
        let listener = TcpListener::bind(self.inner.config.bind_addr).await?;
        self.serve_with_listener(listener).await
    }

    /// Serves replica sessions on `listener` until [`shutdown`], running
    /// state flushes and purges in the background. Sessions are stopped
    /// and every state saved before returning.
    ///
    /// [`shutdown`]: ReplicationServer::shutdown
    ///
    /// # Errors
    ///
    /// Returns [`ReplicationError::ShuttingDown`] if shutdown was already
    /// requested.
    pub async fn serve_with_listener(&self, listener: TcpListener) -> ReplicationResult<()> {
        let mut shutdown = self.inner.shutdown.subscribe();
        if *shutdown.borrow() {
            return Err(ReplicationError::ShuttingDown);
        }
        let timeouts = Arc::new(TimeoutChecker::new());
        let background = tokio::spawn(maintenance(
            Arc::clone(&self.inner),
            self.inner.shutdown.subscribe(),
        ));
        info!(
            addr = ?listener.local_addr().ok(),
            server_id = self.inner.config.server_id,
            "replication server listening"
        );

        let mut sessions = JoinSet::new();
        loop {
            tokio::select! {
                accepted = listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        let active = self.inner.active_sessions.load(Ordering::Acquire);
                        if active >= self.inner.config.max_sessions {
                            warn!(peer = %peer, active, "session limit reached");
                            sessions.spawn(reject(stream, peer, "session limit reached"));
                        } else {
                            debug!(peer = %peer, "connection accepted");
                            sessions.spawn(run_session(
                                Arc::clone(&self.inner),
                                Arc::clone(&timeouts),
                                stream,
                                peer,
                            ));
                        }
                    }
                    Err(err) => warn!(error = %err, "accept failed"),
                },
                Some(_) = sessions.join_next(), if !sessions.is_empty() => {}
                _ = shutdown.changed() => break,
            }
        }

        info!("replication server stopping");
        for domain in self.domains() {
            domain.close_sessions();
        }
        let drained = tokio::time::timeout(SESSION_SHUTDOWN_GRACE, async {
            while sessions.join_next().await.is_some() {}
        })
        .await;
        if drained.is_err() {
            warn!(remaining = sessions.len(), "aborting sessions after grace period");
            sessions.abort_all();
        }
        background.await??;
        Ok(())
    }

    /// Asks [`serve`](ReplicationServer::serve) to stop.
    pub fn shutdown(&self) {
        self.inner.shutdown.send_replace(true);
    }

    /// Number of connected sessions.
    #[must_use]
    pub fn active_sessions(&self) -> usize {
        self.inner.active_sessions.load(Ordering::Acquire)
    }
}

impl ServerInner {
    fn is_ecl_enabled(&self, config: &DomainConfig, base_dn: &str) -> bool {
        config.ecl_enabled && !self.runtime.read().ecl_excluded.contains(base_dn)
    }

    fn open_domain(&self, config: &DomainConfig) -> ReplicationResult<Arc<ReplicationDomain>> {
        let base_dn = normalize_dn(&config.base_dn);
        if base_dn.is_empty() {
            return Err(ConfigError::EmptyBaseDn.into());
        }
        let mut domains = self.domains.write();
        if let Some(domain) = domains.get(&base_dn) {
            return Ok(Arc::clone(domain));
        }
        let domain = Arc::new(ReplicationDomain::open(
            &self.config.root_dir,
            config,
            self.config.server_id,
            self.config.log.clone(),
        )?);
        domain.set_ecl_enabled(self.is_ecl_enabled(config, &base_dn));
        domains.insert(base_dn, Arc::clone(&domain));
        Ok(domain)
    }

    pub(crate) fn domain_or_create(
        &self,
        base_dn: &str,
    ) -> ReplicationResult<Arc<ReplicationDomain>> {
        if let Some(domain) = self.domains.read().get(&normalize_dn(base_dn)) {
            return Ok(Arc::clone(domain));
        }
        self.open_domain(&DomainConfig::new(base_dn))
    }

    fn flush_all(&self) -> ReplicationResult<usize> {
        let domains: Vec<_> = self.domains.read().values().cloned().collect();
        let mut saved = 0;
        let mut first_error = None;
        for domain in domains {
            match domain.flush() {
                Ok(true) => saved += 1,
                Ok(false) => {}
                Err(err) => {
                    error!(base_dn = %domain.base_dn(), error = %err, "flush failed");
                    first_error.get_or_insert(err);
                }
            }
        }
        match first_error {
            Some(err) => Err(err),
            None => Ok(saved),
        }
    }

    fn purge_all(&self, now_millis: u64) -> ReplicationResult<usize> {
        let delay = self.runtime.read().purge_delay;
        let domains: Vec<_> = self.domains.read().values().cloned().collect();
        let mut purged = 0;
        let mut first_error = None;
        for domain in domains {
            match domain.purge(now_millis, delay) {
                Ok(n) => purged += n,
                Err(err) => {
                    error!(base_dn = %domain.base_dn(), error = %err, "purge failed");
                    first_error.get_or_insert(err);
                }
            }
        }
        match first_error {
            Some(err) => Err(err),
            None => Ok(purged),
        }
    }
}

fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| u64::try_from(d.as_millis()).unwrap_or(u64::MAX))
        .unwrap_or(0)
}

/// Flushes and purges on every tick; saves everything once more on
/// shutdown.
async fn maintenance(
    inner: Arc<ServerInner>,
    mut shutdown: watch::Receiver<bool>,
) -> ReplicationResult<()> {
    let mut ticker = tokio::time::interval(inner.config.state_flush_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                let inner = Arc::clone(&inner);
                let outcome = tokio::task::spawn_blocking(move || {
                    let flushed = inner.flush_all();
                    let purged = inner.purge_all(now_millis());
                    (flushed, purged)
                })
                .await?;
                // failures are logged per domain; keep ticking
                if let (Ok(saved), Ok(purged)) = outcome {
                    if saved > 0 || purged > 0 {
                        debug!(saved, purged, "maintenance pass");
                    }
                }
            }
            _ = shutdown.changed() => break,
        }
    }

    let inner_final = Arc::clone(&inner);
    let saved = tokio::task::spawn_blocking(move || inner_final.flush_all()).await??;
    info!(saved, "final state save complete");
    Ok(())
}

impl ConfigListener for ReplicationServer {
    fn is_acceptable(&self, event: &ConfigEvent) -> Result<(), ConfigError> {
        match event {
            ConfigEvent::Add(domain) => {
                let base_dn = normalize_dn(&domain.base_dn);
                if base_dn.is_empty() {
                    return Err(ConfigError::EmptyBaseDn);
                }
                if self.inner.domains.read().contains_key(&base_dn) {
                    return Err(ConfigError::DuplicateBaseDn(base_dn));
                }
                Ok(())
            }
            ConfigEvent::Delete(base_dn) => {
                if normalize_dn(base_dn).is_empty() {
                    return Err(ConfigError::EmptyBaseDn);
                }
                Ok(())
            }
            ConfigEvent::Change(_) => Ok(()),
        }
    }

    fn apply(&self, event: ConfigEvent) -> ReplicationResult<()> {
        self.is_acceptable(&event)?;
        info!(kind = event.kind(), "applying configuration change");
        match event {
            ConfigEvent::Add(domain) => {
                self.inner.open_domain(&domain)?;
            }
            ConfigEvent::Delete(base_dn) => {
                if !self.disable_domain(&base_dn)? {
                    return Err(ReplicationError::UnknownDomain(normalize_dn(&base_dn)));
                }
            }
            ConfigEvent::Change(params) => {
                let excluded: Vec<String> =
                    params.ecl_excluded.iter().map(|dn| normalize_dn(dn)).collect();
                for domain in self.domains() {
                    let included = !excluded.iter().any(|dn| dn == domain.base_dn());
                    domain.set_ecl_enabled(included);
                }
                *self.inner.runtime.write() = RuntimeParams {
                    purge_delay: params.purge_delay,
                    ecl_excluded: excluded.into_iter().collect(),
                };
            }
        }
        Ok(())
    }
}

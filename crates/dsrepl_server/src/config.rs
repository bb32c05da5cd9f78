//! Server configuration and runtime reconfiguration.

use crate::error::ReplicationResult;
use dsrepl_core::{normalize_dn, LogConfig};
use std::collections::{BTreeSet, HashSet};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

/// Invalid replication parameters. Fatal to server or domain startup.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    /// Server ids must be non-zero.
    #[error("invalid server id {0}")]
    InvalidServerId(u16),

    /// The replication port must be non-zero.
    #[error("invalid replication port {0}")]
    InvalidPort(u16),

    /// A domain has an empty base DN.
    #[error("domain base DN is empty")]
    EmptyBaseDn,

    /// Two domains normalize to the same base DN.
    #[error("base DN {0:?} is configured more than once")]
    DuplicateBaseDn(String),

    /// An interval is zero.
    #[error("{0} must be greater than zero")]
    ZeroInterval(&'static str),

    /// A session limit of zero.
    #[error("max_sessions must be greater than zero")]
    NoSessions,
}

/// One replication domain.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DomainConfig {
    /// Base DN of the replicated subtree.
    pub base_dn: String,
    /// Whether the domain contributes to the external changelog.
    pub ecl_enabled: bool,
}

impl DomainConfig {
    /// Creates a domain included in the external changelog.
    pub fn new(base_dn: impl Into<String>) -> Self {
        Self {
            base_dn: base_dn.into(),
            ecl_enabled: true,
        }
    }

    /// Sets whether the domain is part of the external changelog.
    #[must_use]
    pub fn with_ecl(mut self, enabled: bool) -> Self {
        self.ecl_enabled = enabled;
        self
    }
}

/// Parameters that may change while the server runs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuntimeParams {
    /// Minimum age of a changelog record before it may be purged.
    pub purge_delay: Duration,
    /// Normalized base DNs kept out of the external changelog.
    pub ecl_excluded: BTreeSet<String>,
}

impl Default for RuntimeParams {
    fn default() -> Self {
        Self {
            purge_delay: Duration::from_secs(3 * 24 * 60 * 60),
            ecl_excluded: BTreeSet::new(),
        }
    }
}

/// Configuration for a [`ReplicationServer`](crate::ReplicationServer).
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Id of this server; also the replica id of CSNs it generates.
    pub server_id: u16,
    /// Address replicas connect to.
    pub bind_addr: SocketAddr,
    /// Directory holding one subdirectory per domain.
    pub root_dir: PathBuf,
    /// Time allowed between accepting a connection and its `Start`.
    pub handshake_timeout: Duration,
    /// Interval of heartbeats on idle sessions.
    pub heartbeat_interval: Duration,
    /// Interval of state saves, changelog syncs and purges.
    pub state_flush_interval: Duration,
    /// Maximum number of concurrent sessions.
    pub max_sessions: usize,
    /// Changelog segment settings.
    pub log: LogConfig,
    /// Domains opened at startup. Others are created on first use.
    pub domains: Vec<DomainConfig>,
    /// Parameters that may change at runtime.
    pub runtime: RuntimeParams,
}

impl ServerConfig {
    /// Creates a configuration with defaults.
    pub fn new(server_id: u16, root_dir: impl AsRef<Path>) -> Self {
        Self {
            server_id,
            bind_addr: SocketAddr::from(([0, 0, 0, 0], 8989)),
            root_dir: root_dir.as_ref().to_path_buf(),
            handshake_timeout: Duration::from_secs(10),
            heartbeat_interval: Duration::from_secs(10),
            state_flush_interval: Duration::from_secs(1),
            max_sessions: 1000,
            log: LogConfig::default(),
            domains: Vec::new(),
            runtime: RuntimeParams::default(),
        }
    }

    /// Sets the listen address.
    #[must_use]
    pub fn with_bind_addr(mut self, addr: SocketAddr) -> Self {
        self.bind_addr = addr;
        self
    }

    /// Sets the handshake timeout.
    #[must_use]
    pub fn with_handshake_timeout(mut self, timeout: Duration) -> Self {
        self.handshake_timeout = timeout;
        self
    }

    /// Sets the heartbeat interval.
    #[must_use]
    pub fn with_heartbeat_interval(mut self, interval: Duration) -> Self {
        self.heartbeat_interval = interval;
        self
    }

    /// Sets the state flush interval.
    #[must_use]
    pub fn with_state_flush_interval(mut self, interval: Duration) -> Self {
        self.state_flush_interval = interval;
        self
    }

    /// Sets the session limit.
    #[must_use]
    pub fn with_max_sessions(mut self, max: usize) -> Self {
        self.max_sessions = max;
        self
    }

    /// Sets the purge delay.
    #[must_use]
    pub fn with_purge_delay(mut self, delay: Duration) -> Self {
        self.runtime.purge_delay = delay;
        self
    }

    /// Sets the changelog settings.
    #[must_use]
    pub fn with_log_config(mut self, log: LogConfig) -> Self {
        self.log = log;
        self
    }

    /// Adds a domain opened at startup.
    #[must_use]
    pub fn with_domain(mut self, domain: DomainConfig) -> Self {
        self.domains.push(domain);
        self
    }

    /// Checks the configuration.
    ///
    /// # Errors
    ///
    /// Returns the first problem found.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.server_id == 0 {
            return Err(ConfigError::InvalidServerId(self.server_id));
        }
        if self.bind_addr.port() == 0 {
            return Err(ConfigError::InvalidPort(0));
        }
        for (name, value) in [
            ("handshake_timeout", self.handshake_timeout),
            ("heartbeat_interval", self.heartbeat_interval),
            ("state_flush_interval", self.state_flush_interval),
        ] {
            if value.is_zero() {
                return Err(ConfigError::ZeroInterval(name));
            }
        }
        if self.max_sessions == 0 {
            return Err(ConfigError::NoSessions);
        }

        let mut seen = HashSet::new();
        for domain in &self.domains {
            let base_dn = normalize_dn(&domain.base_dn);
            if base_dn.is_empty() {
                return Err(ConfigError::EmptyBaseDn);
            }
            if !seen.insert(base_dn.clone()) {
                return Err(ConfigError::DuplicateBaseDn(base_dn));
            }
        }
        Ok(())
    }
}

/// A configuration change delivered to a running server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigEvent {
    /// A domain was added.
    Add(DomainConfig),
    /// The domain with this base DN was removed.
    Delete(String),
    /// Runtime parameters changed.
    Change(RuntimeParams),
}

impl ConfigEvent {
    /// Short name for logs.
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            ConfigEvent::Add(_) => "add",
            ConfigEvent::Delete(_) => "delete",
            ConfigEvent::Change(_) => "change",
        }
    }
}

/// Receives configuration changes.
///
/// [`is_acceptable`](ConfigListener::is_acceptable) is called before
/// [`apply`](ConfigListener::apply); a rejected event is never applied.
pub trait ConfigListener: Send + Sync {
    /// Checks whether `event` can be applied.
    ///
    /// # Errors
    ///
    /// Returns the reason the event is rejected.
    fn is_acceptable(&self, event: &ConfigEvent) -> Result<(), ConfigError>;

    /// Applies `event`.
    ///
    /// # Errors
    ///
    /// Returns an error if applying failed part way.
    fn apply(&self, event: ConfigEvent) -> ReplicationResult<()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> ServerConfig {
        ServerConfig::new(1, "/tmp/dsrepl")
    }

    #[test]
    fn defaults() {
        let config = config();
        assert_eq!(config.bind_addr.port(), 8989);
        assert_eq!(config.state_flush_interval, Duration::from_secs(1));
        assert_eq!(config.runtime.purge_delay, Duration::from_secs(259_200));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn rejects_bad_server_id_and_port() {
        let mut bad = config();
        bad.server_id = 0;
        assert_eq!(bad.validate(), Err(ConfigError::InvalidServerId(0)));

        let bad = config().with_bind_addr(SocketAddr::from(([127, 0, 0, 1], 0)));
        assert_eq!(bad.validate(), Err(ConfigError::InvalidPort(0)));
    }

    #[test]
    fn rejects_conflicting_domains() {
        let bad = config()
            .with_domain(DomainConfig::new("dc=Example,dc=com"))
            .with_domain(DomainConfig::new("DC=example, DC=com"));
        assert!(matches!(
            bad.validate(),
            Err(ConfigError::DuplicateBaseDn(_))
        ));

        let bad = config().with_domain(DomainConfig::new("  "));
        assert_eq!(bad.validate(), Err(ConfigError::EmptyBaseDn));
    }

    #[test]
    fn rejects_zero_intervals() {
        let bad = config().with_state_flush_interval(Duration::ZERO);
        assert_eq!(
            bad.validate(),
            Err(ConfigError::ZeroInterval("state_flush_interval"))
        );
        let bad = config().with_max_sessions(0);
        assert_eq!(bad.validate(), Err(ConfigError::NoSessions));
    }
}

//! Error types for the replication server.

use crate::config::ConfigError;
use dsrepl_core::{ChangelogError, Csn, CsnExhausted, StateError};
use dsrepl_protocol::{CookieError, SessionError};
use thiserror::Error;

/// Result type for server operations.
pub type ReplicationResult<T> = Result<T, ReplicationError>;

/// Errors raised by the replication server.
#[derive(Error, Debug)]
pub enum ReplicationError {
    /// Invalid configuration.
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    /// Changelog failure; the affected domain stops accepting writes.
    #[error("changelog error: {0}")]
    Changelog(#[from] ChangelogError),

    /// Server state could not be loaded or saved.
    #[error("server state error: {0}")]
    State(#[from] StateError),

    /// A session failed.
    #[error("session error: {0}")]
    Session(#[from] SessionError),

    /// No more CSNs this millisecond.
    #[error(transparent)]
    CsnExhausted(#[from] CsnExhausted),

    /// An inbound CSN is not newer than the last one from its replica.
    #[error("ordering violation: {csn} is not newer than {last}")]
    OrderingViolation {
        /// The rejected CSN.
        csn: Csn,
        /// Last CSN accepted from the same replica.
        last: Csn,
        /// True if the same change is already in the changelog.
        benign: bool,
    },

    /// A session sent an update carrying another replica's id.
    #[error("replica {replica_id} sent foreign CSN {csn}")]
    ForeignCsn {
        /// The CSN received.
        csn: Csn,
        /// Replica id the session announced.
        replica_id: u16,
    },

    /// The domain is disabled or its changelog failed.
    #[error("domain {0} is unavailable")]
    DomainUnavailable(String),

    /// No domain with this base DN.
    #[error("unknown domain {0}")]
    UnknownDomain(String),

    /// A cookie names a domain that is unknown or excluded from the
    /// external changelog.
    #[error("cookie names unknown domain {0}")]
    CookieUnknownDomain(String),

    /// A cookie position precedes purged history.
    #[error("cookie for {base_dn} is too old: {csn} precedes oldest available {oldest}")]
    CookieTooOld {
        /// Domain of the stale position.
        base_dn: String,
        /// Position from the cookie.
        csn: Csn,
        /// Oldest record still stored for that replica.
        oldest: Csn,
    },

    /// The cookie text does not parse.
    #[error("invalid cookie: {0}")]
    Cookie(#[from] CookieError),

    /// The server is shutting down.
    #[error("server is shutting down")]
    ShuttingDown,

    /// A blocking task failed to complete.
    #[error("background task failed: {0}")]
    Task(String),

    /// I/O error.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl ReplicationError {
    /// True for an ordering violation caused by a plain redelivery.
    #[must_use]
    pub fn is_benign(&self) -> bool {
        matches!(self, ReplicationError::OrderingViolation { benign: true, .. })
    }

    /// True if the error ends only the session that caused it.
    #[must_use]
    pub fn is_session_error(&self) -> bool {
        matches!(
            self,
            ReplicationError::Session(_) | ReplicationError::ForeignCsn { .. }
        )
    }

    /// True if the error is the caller's fault rather than the server's.
    #[must_use]
    pub fn is_client_error(&self) -> bool {
        matches!(
            self,
            ReplicationError::OrderingViolation { .. }
                | ReplicationError::ForeignCsn { .. }
                | ReplicationError::UnknownDomain(_)
                | ReplicationError::CookieUnknownDomain(_)
                | ReplicationError::CookieTooOld { .. }
                | ReplicationError::Cookie(_)
        )
    }
}

impl From<tokio::task::JoinError> for ReplicationError {
    fn from(err: tokio::task::JoinError) -> Self {
        ReplicationError::Task(err.to_string())
    }
}

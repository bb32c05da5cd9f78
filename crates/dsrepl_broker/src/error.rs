//! Error types for the replica broker.

use dsrepl_core::{CsnExhausted, StateError};
use dsrepl_protocol::{ErrorCode, SessionError};
use thiserror::Error;

/// Result type for broker operations.
pub type BrokerResult<T> = Result<T, BrokerError>;

/// Errors raised by the replica broker.
#[derive(Error, Debug)]
pub enum BrokerError {
    /// Network failure.
    #[error("transport error: {message}")]
    Transport {
        /// Error message.
        message: String,
        /// Whether connecting again may succeed.
        retryable: bool,
    },

    /// Framing or protocol failure on an established session.
    #[error("session error: {0}")]
    Session(#[from] SessionError),

    /// The server answered the handshake with something other than
    /// `StartAck`.
    #[error("handshake failed: {0}")]
    Handshake(String),

    /// The server refused the session or reported an error.
    #[error("server error ({code:?}): {message}")]
    Rejected {
        /// Error code sent by the server.
        code: ErrorCode,
        /// Error message sent by the server.
        message: String,
    },

    /// Server speaks another protocol version.
    #[error("protocol version mismatch: local={local}, remote={remote}")]
    VersionMismatch {
        /// Local protocol version.
        local: u16,
        /// Remote protocol version.
        remote: u16,
    },

    /// Persisted state could not be loaded or saved.
    #[error("state error: {0}")]
    State(#[from] StateError),

    /// No local CSN left this millisecond.
    #[error(transparent)]
    CsnExhausted(#[from] CsnExhausted),

    /// The applier refused a change.
    #[error("applier error: {0}")]
    Applier(String),

    /// The session has ended.
    #[error("not connected to server")]
    NotConnected,

    /// A deadline passed.
    #[error("{0} timed out")]
    Timeout(&'static str),

    /// A background task failed.
    #[error("task error: {0}")]
    Task(String),
}

impl BrokerError {
    /// Creates a retryable transport error.
    pub fn transport_retryable(message: impl Into<String>) -> Self {
        Self::Transport {
            message: message.into(),
            retryable: true,
        }
    }

    /// Creates a non-retryable transport error.
    pub fn transport_fatal(message: impl Into<String>) -> Self {
        Self::Transport {
            message: message.into(),
            retryable: false,
        }
    }

    /// Returns true if connecting again may succeed.
    pub fn is_retryable(&self) -> bool {
        match self {
            BrokerError::Transport { retryable, .. } => *retryable,
            BrokerError::Timeout(_) => true,
            BrokerError::Rejected { code, .. } => {
                matches!(code, ErrorCode::Unavailable | ErrorCode::DomainUnavailable)
            }
            BrokerError::Session(err) => matches!(err, SessionError::Io(_) | SessionError::Closed),
            _ => false,
        }
    }
}

impl From<std::io::Error> for BrokerError {
    fn from(err: std::io::Error) -> Self {
        use std::io::ErrorKind;
        let retryable = matches!(
            err.kind(),
            ErrorKind::ConnectionRefused
                | ErrorKind::ConnectionReset
                | ErrorKind::ConnectionAborted
                | ErrorKind::BrokenPipe
                | ErrorKind::TimedOut
                | ErrorKind::UnexpectedEof
        );
        Self::Transport {
            message: err.to_string(),
            retryable,
        }
    }
}

impl From<tokio::task::JoinError> for BrokerError {
    fn from(err: tokio::task::JoinError) -> Self {
        Self::Task(err.to_string())
    }
}

//! Session and framing errors.

use crate::messages::ErrorCode;
use crate::session::SessionState;
use thiserror::Error;

/// Result type for protocol operations.
pub type SessionResult<T> = Result<T, SessionError>;

/// Errors that end a replication session.
///
/// None of these affect other sessions or the domain itself.
#[derive(Error, Debug)]
pub enum SessionError {
    /// Transport failure.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// The frame header is not valid.
    #[error("malformed frame: {0}")]
    MalformedFrame(String),

    /// The frame payload does not match its checksum.
    #[error("frame checksum mismatch: expected {expected:#010x}, got {actual:#010x}")]
    ChecksumMismatch {
        /// Checksum carried by the frame.
        expected: u32,
        /// Checksum of the received payload.
        actual: u32,
    },

    /// The frame exceeds the size limit.
    #[error("frame of {size} bytes exceeds limit of {max}")]
    FrameTooLarge {
        /// Announced payload size.
        size: usize,
        /// Maximum allowed.
        max: usize,
    },

    /// Unknown message type byte.
    #[error("unknown message type {0}")]
    UnknownMessageType(u8),

    /// Payload could not be encoded or decoded.
    #[error("codec error: {0}")]
    Codec(String),

    /// The handshake was refused or malformed.
    #[error("handshake failed: {0}")]
    Handshake(String),

    /// A message arrived that the current state does not allow.
    #[error("unexpected {message} message while {state}")]
    UnexpectedMessage {
        /// Session state when the message arrived.
        state: SessionState,
        /// Message name.
        message: &'static str,
    },

    /// Illegal state change.
    #[error("invalid session transition from {from} to {to}")]
    InvalidTransition {
        /// Current state.
        from: SessionState,
        /// Requested state.
        to: SessionState,
    },

    /// The peer reported an error.
    #[error("peer error {code:?}: {message}")]
    Remote {
        /// Error category.
        code: ErrorCode,
        /// Peer-supplied detail.
        message: String,
    },

    /// A deadline passed.
    #[error("session timed out: {0}")]
    Timeout(&'static str),

    /// The peer closed the connection.
    #[error("connection closed by peer")]
    Closed,
}

impl SessionError {
    pub(crate) fn malformed(message: impl Into<String>) -> Self {
        Self::MalformedFrame(message.into())
    }

    /// True if the error came from damaged bytes rather than the peer's
    /// behavior.
    #[must_use]
    pub fn is_corruption(&self) -> bool {
        matches!(
            self,
            Self::MalformedFrame(_) | Self::ChecksumMismatch { .. } | Self::UnknownMessageType(_)
        )
    }
}

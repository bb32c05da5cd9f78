//! Session state machine.

use crate::error::{SessionError, SessionResult};
use crate::messages::ReplMessage;
use std::fmt;

/// Lifecycle of a replication session, on either end.
///
/// ```text
/// Connecting -> Handshaking -> Streaming -> Disconnected
///        \            \            \
///         +------------+------------+---> Error
/// ```
///
/// `Disconnected` and `Error` are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SessionState {
    /// Transport is being set up.
    Connecting,
    /// Waiting for `Start` / `StartAck`.
    Handshaking,
    /// Exchanging updates.
    Streaming,
    /// Closed cleanly.
    Disconnected,
    /// Closed after a failure.
    Error,
}

impl SessionState {
    /// True for `Disconnected` and `Error`.
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Disconnected | Self::Error)
    }

    /// True if `next` may follow `self`.
    #[must_use]
    pub fn can_transition_to(self, next: SessionState) -> bool {
        use SessionState::*;
        match (self, next) {
            (Connecting, Handshaking) | (Handshaking, Streaming) => true,
            (from, Disconnected | Error) => !from.is_terminal(),
            _ => false,
        }
    }

    /// Moves to `next`.
    ///
    /// # Errors
    ///
    /// Returns [`SessionError::InvalidTransition`] if the move is not
    /// allowed; the state is left unchanged.
    pub fn transition(&mut self, next: SessionState) -> SessionResult<()> {
        if !self.can_transition_to(next) {
            return Err(SessionError::InvalidTransition {
                from: *self,
                to: next,
            });
        }
        *self = next;
        Ok(())
    }

    /// Checks that `message` may arrive in this state.
    ///
    /// `Error` and `Stop` are accepted in every live state.
    ///
    /// # Errors
    ///
    /// Returns [`SessionError::UnexpectedMessage`] otherwise.
    pub fn check_incoming(self, message: &ReplMessage) -> SessionResult<()> {
        let allowed = match message {
            ReplMessage::Error(_) | ReplMessage::Stop => !self.is_terminal(),
            ReplMessage::Start(_) | ReplMessage::StartAck(_) => self == Self::Handshaking,
            ReplMessage::Update(_) | ReplMessage::ServerState(_) | ReplMessage::Heartbeat => {
                self == Self::Streaming
            }
        };
        if allowed {
            Ok(())
        } else {
            Err(SessionError::UnexpectedMessage {
                state: self,
                message: message.name(),
            })
        }
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Connecting => "connecting",
            Self::Handshaking => "handshaking",
            Self::Streaming => "streaming",
            Self::Disconnected => "disconnected",
            Self::Error => "error",
        })
    }
}

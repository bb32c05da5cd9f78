//! Replication session messages.

use crate::error::{SessionError, SessionResult};
use dsrepl_core::{ServerState, UpdateRecord};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

/// Protocol version spoken by this crate.
pub const PROTOCOL_VERSION: u16 = 1;

/// A message exchanged between a replica and a replication server.
#[derive(Debug, Clone, PartialEq)]
pub enum ReplMessage {
    /// Opens a session for one domain.
    Start(StartMsg),
    /// Accepts a session.
    StartAck(StartAckMsg),
    /// One replicated change.
    Update(UpdateRecord),
    /// The sender's current watermarks.
    ServerState(ServerState),
    /// Keeps an idle session alive.
    Heartbeat,
    /// Reports a failure; the session ends after it.
    Error(ErrorMsg),
    /// Closes the session cleanly.
    Stop,
}

/// Handshake request sent by a replica.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StartMsg {
    /// Protocol version of the replica.
    pub protocol_version: u16,
    /// Domain to replicate.
    pub base_dn: String,
    /// Replica id; every CSN the replica sends must carry it.
    pub replica_id: u16,
    /// What the replica has already seen.
    pub state: ServerState,
}

impl StartMsg {
    /// Creates a request at the current protocol version.
    pub fn new(base_dn: impl Into<String>, replica_id: u16, state: ServerState) -> Self {
        Self {
            protocol_version: PROTOCOL_VERSION,
            base_dn: base_dn.into(),
            replica_id,
            state,
        }
    }
}

/// Handshake response sent by the server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StartAckMsg {
    /// Id of the replication server.
    pub server_id: u16,
    /// Protocol version the session will use.
    pub protocol_version: u16,
    /// The domain's state on the server.
    pub state: ServerState,
}

/// Error categories carried by [`ReplMessage::Error`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ErrorCode {
    /// Unsupported protocol version.
    ProtocolVersion,
    /// The domain is disabled or failed.
    DomainUnavailable,
    /// A message arrived out of sequence.
    UnexpectedMessage,
    /// An update carried another replica's CSN.
    ForeignCsn,
    /// The server is shutting down or full.
    Unavailable,
    /// Anything else.
    Internal,
}

/// Error report.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorMsg {
    /// Category.
    pub code: ErrorCode,
    /// Detail for logs.
    pub message: String,
}

impl ErrorMsg {
    /// Creates an error report.
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }
}

impl ReplMessage {
    /// Returns the message type code used in frames.
    #[must_use]
    pub fn type_code(&self) -> u8 {
        match self {
            ReplMessage::Start(_) => 1,
            ReplMessage::StartAck(_) => 2,
            ReplMessage::Update(_) => 3,
            ReplMessage::ServerState(_) => 4,
            ReplMessage::Heartbeat => 5,
            ReplMessage::Error(_) => 6,
            ReplMessage::Stop => 7,
        }
    }

    /// Short name for logs and errors.
    #[must_use]
    pub fn name(&self) -> &'static str {
        match self {
            ReplMessage::Start(_) => "start",
            ReplMessage::StartAck(_) => "start-ack",
            ReplMessage::Update(_) => "update",
            ReplMessage::ServerState(_) => "server-state",
            ReplMessage::Heartbeat => "heartbeat",
            ReplMessage::Error(_) => "error",
            ReplMessage::Stop => "stop",
        }
    }

    /// Encodes the payload. Heartbeat and stop have none.
    ///
    /// # Errors
    ///
    /// Returns [`SessionError::Codec`] if serialization fails.
    pub fn encode_payload(&self) -> SessionResult<Vec<u8>> {
        match self {
            ReplMessage::Start(msg) => to_cbor(msg),
            ReplMessage::StartAck(msg) => to_cbor(msg),
            ReplMessage::Update(record) => to_cbor(record),
            ReplMessage::ServerState(state) => to_cbor(state),
            ReplMessage::Error(msg) => to_cbor(msg),
            ReplMessage::Heartbeat | ReplMessage::Stop => Ok(Vec::new()),
        }
    }

    /// Decodes a payload of the given type.
    ///
    /// # Errors
    ///
    /// Returns an error for an unknown type code or an undecodable payload.
    pub fn decode(type_code: u8, payload: &[u8]) -> SessionResult<Self> {
        match type_code {
            1 => from_cbor(payload).map(ReplMessage::Start),
            2 => from_cbor(payload).map(ReplMessage::StartAck),
            3 => from_cbor(payload).map(ReplMessage::Update),
            4 => from_cbor(payload).map(ReplMessage::ServerState),
            5 => Ok(ReplMessage::Heartbeat),
            6 => from_cbor(payload).map(ReplMessage::Error),
            7 => Ok(ReplMessage::Stop),
            other => Err(SessionError::UnknownMessageType(other)),
        }
    }
}

fn to_cbor<T: Serialize>(value: &T) -> SessionResult<Vec<u8>> {
    let mut out = Vec::new();
    ciborium::into_writer(value, &mut out).map_err(|e| SessionError::Codec(e.to_string()))?;
    Ok(out)
}

fn from_cbor<T: DeserializeOwned>(payload: &[u8]) -> SessionResult<T> {
    ciborium::from_reader(payload).map_err(|e| SessionError::Codec(e.to_string()))
}

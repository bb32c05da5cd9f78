//! # dsrepl Protocol
//!
//! Wire types shared by replication servers and replicas.
//!
//! This crate provides:
//! - [`ReplMessage`], the messages exchanged over a replication session
//! - Frame encoding with blocking and async I/O helpers
//! - The [`SessionState`] machine both ends drive
//! - The external changelog cookie ([`EclCookie`])
//!
//! Frames look like this on the wire:
//!
//! ```text
//! | magic "DSRP" (4) | type (1) | length (4, LE) | CBOR payload | crc32 (4, LE) |
//! ```
//!
//! The checksum covers type, length and payload.

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod cookie;
mod error;
mod frame;
mod messages;
mod session;

pub use cookie::{format_cookie, parse_cookie, CookieError, EclCookie};
pub use error::{SessionError, SessionResult};
pub use frame::{
    decode_frame, encode_frame, read_frame, read_frame_async, write_frame, write_frame_async,
    FRAME_MAGIC, MAX_FRAME_SIZE,
};
pub use messages::{ErrorCode, ErrorMsg, ReplMessage, StartAckMsg, StartMsg, PROTOCOL_VERSION};
pub use session::SessionState;

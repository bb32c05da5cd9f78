//! # dsrepl Server
//!
//! A replication server for multi-master directory replication.
//!
//! This crate provides:
//! - [`ReplicationServer`], owning one [`ReplicationDomain`] per base DN
//! - Replica sessions over TCP with catch-up from the changelog and live
//!   fan-out of accepted updates
//! - The external changelog ([`EclCursor`]) merging every enabled domain
//! - A heap-based [`TimeoutChecker`] for handshake deadlines
//! - Runtime reconfiguration through [`ConfigListener`]
//!
//! ## Example
//!
//! ```no_run
//! use dsrepl_server::{ReplicationServer, ServerConfig, SubmitRequest};
//! use dsrepl_core::{AttributeChange, Operation};
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let server = ReplicationServer::open(ServerConfig::new(1, "/var/lib/dsrepl"))?;
//! let ack = server.submit(SubmitRequest::local(
//!     "dc=example,dc=com",
//!     "cn=alice,dc=example,dc=com",
//!     Operation::Modify {
//!         changes: vec![AttributeChange::add("mail", ["alice@example.com"])],
//!     },
//! ))?;
//! println!("assigned {}", ack.csn);
//! # Ok(())
//! # }
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::unwrap_used, clippy::expect_used, clippy::panic)]

mod config;
mod domain;
mod ecl;
mod error;
mod server;
mod session;
mod timeout;

pub use config::{
    ConfigError, ConfigEvent, ConfigListener, DomainConfig, RuntimeParams, ServerConfig,
};
pub use domain::{domain_dir_name, Accepted, ReplicationDomain, SessionInfo};
pub use ecl::{EclCursor, EclRecord};
pub use error::{ReplicationError, ReplicationResult};
pub use server::{ReplicationServer, SubmitAck, SubmitRequest};
pub use timeout::{OperationKind, TimeoutChecker, TimeoutHandle};

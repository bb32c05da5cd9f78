//! # dsrepl Broker
//!
//! The replica side of a replication session.
//!
//! A [`ReplicaBroker`] connects one directory replica to a replication
//! server for one domain:
//! 1. Handshake with the replica's persisted server state
//! 2. Receive the changes the replica is missing, then live changes,
//!    and hand each to an [`UpdateApplier`]
//! 3. Publish local changes under CSNs from the replica's generator
//! 4. Acknowledge progress with periodic `ServerState` messages
//!
//! ## Invariants
//!
//! - A change is applied at most once: CSNs already covered by the
//!   replica's state are skipped
//! - Local CSNs are always newer than every CSN the replica has seen
//! - Published changes leave in CSN order

#![deny(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::unwrap_used, clippy::expect_used, clippy::panic)]

mod applier;
mod broker;
mod config;
mod error;

pub use applier::{EntryStoreApplier, UpdateApplier};
pub use broker::{BrokerStats, BrokerStatus, ReplicaBroker};
pub use config::{BrokerConfig, RetryConfig};
pub use error::{BrokerError, BrokerResult};

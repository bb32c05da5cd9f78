//! # dsrepl Core
//!
//! Ordering, conflict resolution and change history for multi-master
//! directory replication.
//!
//! This crate provides:
//! - [`Csn`] change sequence numbers and the per-replica [`CsnGenerator`]
//! - Per-value attribute history ([`AttrHistoricalMultiple`]) that converges
//!   regardless of the order in which updates arrive
//! - An [`EntryStore`] applying replicated operations entry by entry
//! - [`ServerState`] watermarks and their durable [`PersistentServerState`]
//! - The segmented, append-only [`ChangelogDb`] with pooled readers and
//!   CSN-ordered cursors
//!
//! ## Ordering
//!
//! CSNs compare by time, then replica id, then sequence number. Two replicas
//! generating updates in the same millisecond are therefore ordered by their
//! ids, and the generator's [`CsnGenerator::adjust`] keeps local CSNs after
//! every CSN seen from a peer.

#![deny(unsafe_code)]
#![warn(missing_docs)]

pub mod changelog;
mod checksum;
mod csn;
mod entry;
mod error;
mod fsutil;
mod historical;
mod operation;
mod persistent;
mod state;
mod update;

pub use changelog::{
    verify_segment, AppendOutcome, ChangelogCursor, ChangelogDb, KeyMatch, Log, LogConfig, LogCursor,
    LogReaderPool, LogRecord, SegmentInfo, SegmentReader, SegmentReport, SyncPolicy,
};
pub use checksum::compute_crc32;
pub use csn::{Clock, Csn, CsnGenerator, CsnParseError, ManualClock, SystemClock, CSN_ENCODED_LEN};
pub use entry::{normalize_attribute, normalize_dn, EntryHistorical, EntryStore};
pub use error::{ChangelogError, ChangelogResult, CsnExhausted, StateError, StateResult};
pub use historical::{AttrHistoricalMultiple, AttrValueHistorical};
pub use operation::{AttributeChange, AttributeValue, ChangeKind, Operation};
pub use persistent::{read_state_file, PersistentServerState};
pub use state::ServerState;
pub use update::UpdateRecord;

//! Segmented, append-only change history.
//!
//! A domain's [`ChangelogDb`] keeps one [`Log`] per originating replica:
//!
//! ```text
//! <domain dir>/
//! ├─ LOCK                          # single writer per domain
//! ├─ 1/                            # replica id
//! │  ├─ <low csn>_<high csn>.log   # sealed segments
//! │  └─ head.log                   # active segment
//! └─ 2/
//!    └─ head.log
//! ```
//!
//! Each log is strictly ordered by CSN. Cross-replica order is produced at
//! read time by merging the per-replica cursors, so a change from one
//! replica that arrives after a newer change from another is never lost.

mod config;
mod cursor;
mod db;
mod log;
mod pool;
mod reader;
mod record;
mod segment;

pub use config::{LogConfig, SyncPolicy};
pub use cursor::ChangelogCursor;
pub use db::ChangelogDb;
pub use log::{AppendOutcome, Log, LogCursor};
pub use pool::LogReaderPool;
pub use reader::{KeyMatch, SegmentReader};
pub use record::{decode_envelope, encode_envelope, EnvelopeRead, LogRecord, MAX_PAYLOAD_SIZE};
pub use segment::{verify_segment, SegmentInfo, SegmentReport};

//! Change sequence numbers and their generator.

use crate::error::CsnExhausted;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};
use thiserror::Error;

/// Size of the binary CSN form.
pub const CSN_ENCODED_LEN: usize = 12;

/// Length of the hexadecimal CSN form.
const CSN_STRING_LEN: usize = 24;

/// A change sequence number.
///
/// Identifies one update and places it in the global order. CSNs compare
/// by `time`, then `replica_id`, then `seqnum`; two CSNs with equal fields
/// denote the same event.
///
/// The string form is 24 hex digits (`time`, `replica_id`, `seqnum`), so
/// lexicographic order of strings matches CSN order. Segment file names
/// rely on that.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Csn {
    time: u64,
    seqnum: u16,
    replica_id: u16,
}

impl Csn {
    /// Creates a CSN from its parts.
    #[must_use]
    pub const fn new(time: u64, seqnum: u16, replica_id: u16) -> Self {
        Self {
            time,
            seqnum,
            replica_id,
        }
    }

    /// Wall-clock milliseconds at generation.
    #[must_use]
    pub const fn time(&self) -> u64 {
        self.time
    }

    /// Sequence number within the millisecond.
    #[must_use]
    pub const fn seqnum(&self) -> u16 {
        self.seqnum
    }

    /// Replica that generated this CSN.
    #[must_use]
    pub const fn replica_id(&self) -> u16 {
        self.replica_id
    }

    /// Encodes the CSN as 12 big-endian bytes in comparison order.
    #[must_use]
    pub fn to_bytes(&self) -> [u8; CSN_ENCODED_LEN] {
        let mut out = [0u8; CSN_ENCODED_LEN];
        out[0..8].copy_from_slice(&self.time.to_be_bytes());
        out[8..10].copy_from_slice(&self.replica_id.to_be_bytes());
        out[10..12].copy_from_slice(&self.seqnum.to_be_bytes());
        out
    }

    /// Decodes the 12-byte form produced by [`Csn::to_bytes`].
    #[must_use]
    pub fn from_bytes(bytes: &[u8; CSN_ENCODED_LEN]) -> Self {
        let mut time = [0u8; 8];
        time.copy_from_slice(&bytes[0..8]);
        Self {
            time: u64::from_be_bytes(time),
            replica_id: u16::from_be_bytes([bytes[8], bytes[9]]),
            seqnum: u16::from_be_bytes([bytes[10], bytes[11]]),
        }
    }

    /// Returns true if this CSN is strictly newer than `other`.
    #[must_use]
    pub fn is_newer_than(&self, other: &Csn) -> bool {
        self > other
    }
}

impl Ord for Csn {
    fn cmp(&self, other: &Self) -> Ordering {
        self.time
            .cmp(&other.time)
            .then(self.replica_id.cmp(&other.replica_id))
            .then(self.seqnum.cmp(&other.seqnum))
    }
}

impl PartialOrd for Csn {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl fmt::Display for Csn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:016x}{:04x}{:04x}",
            self.time, self.replica_id, self.seqnum
        )
    }
}

/// A string was not a valid CSN.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("invalid CSN {input:?}: {reason}")]
pub struct CsnParseError {
    input: String,
    reason: &'static str,
}

impl FromStr for Csn {
    type Err = CsnParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let fail = |reason| CsnParseError {
            input: s.to_string(),
            reason,
        };
        if s.len() != CSN_STRING_LEN || !s.is_ascii() {
            return Err(fail("expected 24 hex digits"));
        }
        let time = u64::from_str_radix(&s[0..16], 16).map_err(|_| fail("bad time field"))?;
        let replica_id =
            u16::from_str_radix(&s[16..20], 16).map_err(|_| fail("bad replica id field"))?;
        let seqnum = u16::from_str_radix(&s[20..24], 16).map_err(|_| fail("bad seqnum field"))?;
        Ok(Self::new(time, seqnum, replica_id))
    }
}

/// Source of wall-clock milliseconds for CSN generation.
pub trait Clock: Send + Sync + fmt::Debug {
    /// Milliseconds since the Unix epoch.
    fn now_millis(&self) -> u64;
}

/// The operating system clock.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_millis(&self) -> u64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or(0)
    }
}

/// A clock that only moves when told to.
///
/// Used to reproduce clock skew and same-millisecond bursts.
#[derive(Debug, Default)]
pub struct ManualClock {
    now: AtomicU64,
}

impl ManualClock {
    /// Creates a clock frozen at `millis`.
    #[must_use]
    pub fn new(millis: u64) -> Self {
        Self {
            now: AtomicU64::new(millis),
        }
    }

    /// Moves the clock to `millis`, backwards if asked.
    pub fn set(&self, millis: u64) {
        self.now.store(millis, AtomicOrdering::SeqCst);
    }

    /// Moves the clock forward by `millis`.
    pub fn advance(&self, millis: u64) {
        self.now.fetch_add(millis, AtomicOrdering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now_millis(&self) -> u64 {
        self.now.load(AtomicOrdering::SeqCst)
    }
}

#[derive(Debug, Default)]
struct GeneratorState {
    /// Time of the last issued CSN, or the floor set by `adjust`.
    time: u64,
    /// Sequence number issued at `time`; `None` if nothing was issued yet.
    seqnum: Option<u16>,
}

/// Issues strictly increasing CSNs for one replica.
///
/// Wall-clock regressions are absorbed by reusing the last time and bumping
/// the sequence number, so the output never goes backwards.
#[derive(Debug)]
pub struct CsnGenerator {
    replica_id: u16,
    clock: Arc<dyn Clock>,
    state: Mutex<GeneratorState>,
}

impl CsnGenerator {
    /// Creates a generator driven by the system clock.
    #[must_use]
    pub fn new(replica_id: u16) -> Self {
        Self::with_clock(replica_id, Arc::new(SystemClock))
    }

    /// Creates a generator driven by `clock`.
    #[must_use]
    pub fn with_clock(replica_id: u16, clock: Arc<dyn Clock>) -> Self {
        Self {
            replica_id,
            clock,
            state: Mutex::new(GeneratorState::default()),
        }
    }

    /// Replica id stamped on every CSN.
    #[must_use]
    pub fn replica_id(&self) -> u16 {
        self.replica_id
    }

    /// Issues the next CSN.
    ///
    /// # Errors
    ///
    /// Returns [`CsnExhausted`] when 65 536 CSNs were already issued for the
    /// current millisecond and the clock has not moved past it.
    pub fn next(&self) -> Result<Csn, CsnExhausted> {
        let now = self.clock.now_millis();
        let mut state = self.state.lock();

        if now > state.time {
            state.time = now;
            state.seqnum = Some(0);
        } else {
            let seqnum = match state.seqnum {
                None => 0,
                Some(u16::MAX) => {
                    return Err(CsnExhausted {
                        time: state.time,
                        replica_id: self.replica_id,
                    })
                }
                Some(n) => n + 1,
            };
            state.seqnum = Some(seqnum);
        }

        Ok(Csn::new(
            state.time,
            state.seqnum.unwrap_or(0),
            self.replica_id,
        ))
    }

    /// Makes every later local CSN greater than `remote`.
    ///
    /// Called for each CSN received from a peer so that a local update made
    /// after seeing a remote one is ordered after it, even when the local
    /// clock lags behind the peer's.
    ///
    /// A CSN of this replica, e.g. reloaded after a restart, resumes the
    /// sequence after it.
    pub fn adjust(&self, remote: Csn) {
        if remote.replica_id == self.replica_id {
            let mut state = self.state.lock();
            let issued = state.seqnum.map(|seqnum| (state.time, seqnum));
            if issued.map_or(remote.time >= state.time, |last| (remote.time, remote.seqnum) > last) {
                state.time = remote.time;
                state.seqnum = Some(remote.seqnum);
            }
            return;
        }
        // A higher replica id already sorts after `remote` within the same
        // millisecond; a lower one has to move to the next millisecond.
        let floor = if self.replica_id > remote.replica_id {
            remote.time
        } else {
            remote.time.saturating_add(1)
        };

        let mut state = self.state.lock();
        if floor > state.time {
            state.time = floor;
            state.seqnum = None;
        }
    }

    /// The last CSN handed out, if any.
    #[must_use]
    pub fn last_issued(&self) -> Option<Csn> {
        let state = self.state.lock();
        state
            .seqnum
            .map(|seqnum| Csn::new(state.time, seqnum, self.replica_id))
    }
}

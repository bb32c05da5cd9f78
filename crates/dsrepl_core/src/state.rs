//! Per-replica watermarks.

use crate::csn::{Csn, CsnParseError};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

/// The newest CSN seen from each replica.
///
/// Entries only move forward: [`ServerState::update`] ignores anything not
/// newer than what is already recorded for that replica.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerState {
    replicas: BTreeMap<u16, Csn>,
}

impl ServerState {
    /// Creates an empty state.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Records `csn` if it is newer than the current entry for its replica.
    ///
    /// Returns true if the state changed.
    pub fn update(&mut self, csn: Csn) -> bool {
        match self.replicas.get_mut(&csn.replica_id()) {
            Some(current) if *current >= csn => false,
            Some(current) => {
                *current = csn;
                true
            }
            None => {
                self.replicas.insert(csn.replica_id(), csn);
                true
            }
        }
    }

    /// Applies [`ServerState::update`] for every entry of `other`.
    ///
    /// Returns true if anything changed.
    pub fn merge(&mut self, other: &ServerState) -> bool {
        let mut changed = false;
        for csn in other.replicas.values() {
            changed |= self.update(*csn);
        }
        changed
    }

    /// Newest CSN recorded for `replica_id`.
    #[must_use]
    pub fn max_csn(&self, replica_id: u16) -> Option<Csn> {
        self.replicas.get(&replica_id).copied()
    }

    /// True if `csn` is at or before the watermark of its replica.
    #[must_use]
    pub fn covers(&self, csn: &Csn) -> bool {
        self.max_csn(csn.replica_id()).is_some_and(|max| max >= *csn)
    }

    /// Oldest of the per-replica watermarks.
    #[must_use]
    pub fn min_csn(&self) -> Option<Csn> {
        self.replicas.values().min().copied()
    }

    /// Newest of the per-replica watermarks.
    #[must_use]
    pub fn newest_csn(&self) -> Option<Csn> {
        self.replicas.values().max().copied()
    }

    /// True if no replica has been seen.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.replicas.is_empty()
    }

    /// Number of replicas with a watermark.
    #[must_use]
    pub fn len(&self) -> usize {
        self.replicas.len()
    }

    /// Replica ids with a watermark, ascending.
    pub fn replica_ids(&self) -> impl Iterator<Item = u16> + '_ {
        self.replicas.keys().copied()
    }

    /// `(replica id, CSN)` pairs, ascending by replica id.
    pub fn iter(&self) -> impl Iterator<Item = (u16, Csn)> + '_ {
        self.replicas.iter().map(|(id, csn)| (*id, *csn))
    }

    /// Independent copy.
    #[must_use]
    pub fn duplicate(&self) -> Self {
        self.clone()
    }
}

impl FromIterator<Csn> for ServerState {
    fn from_iter<I: IntoIterator<Item = Csn>>(iter: I) -> Self {
        let mut state = Self::new();
        for csn in iter {
            state.update(csn);
        }
        state
    }
}

impl fmt::Display for ServerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut first = true;
        for csn in self.replicas.values() {
            if !first {
                f.write_str(" ")?;
            }
            write!(f, "{csn}")?;
            first = false;
        }
        Ok(())
    }
}

impl FromStr for ServerState {
    type Err = CsnParseError;

    /// Parses space-separated CSNs, the form produced by `Display`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        s.split_whitespace().map(str::parse::<Csn>).collect()
    }
}

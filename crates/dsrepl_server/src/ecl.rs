//! The external changelog: every enabled domain merged into one stream.

use crate::domain::ReplicationDomain;
use dsrepl_core::{ChangelogCursor, UpdateRecord};
use dsrepl_protocol::EclCookie;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use tracing::warn;

/// A record of the external changelog.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EclRecord {
    /// Domain the change belongs to.
    pub base_dn: String,
    /// The change.
    pub record: UpdateRecord,
}

#[derive(Debug)]
struct Lane {
    cursor: ChangelogCursor,
    pending: Option<UpdateRecord>,
}

/// Reads the external changelog in `(csn, base DN)` order.
///
/// The cookie returned by [`EclCursor::cookie`] after reading a record
/// resumes right after that record. A domain whose changelog fails to read
/// is dropped from the merge and reported by
/// [`EclCursor::degraded_domains`]; the other domains keep flowing.
#[derive(Debug)]
pub struct EclCursor {
    lanes: BTreeMap<String, Lane>,
    cookie: EclCookie,
    degraded: BTreeSet<String>,
}

impl EclCursor {
    pub(crate) fn new(domains: Vec<Arc<ReplicationDomain>>, mut cookie: EclCookie) -> Self {
        let mut lanes = BTreeMap::new();
        for domain in domains {
            let base_dn = domain.base_dn().to_string();
            let start = cookie.domain(&base_dn).cloned().unwrap_or_default();
            let cursor = domain.changelog().cursor(&start);
            cookie.set_domain(base_dn.clone(), start);
            lanes.insert(
                base_dn,
                Lane {
                    cursor,
                    pending: None,
                },
            );
        }
        Self {
            lanes,
            cookie,
            degraded: BTreeSet::new(),
        }
    }

    fn fill_lanes(&mut self) {
        let mut failed = Vec::new();
        for (base_dn, lane) in &mut self.lanes {
            if lane.pending.is_some() {
                continue;
            }
            match lane.cursor.next() {
                Ok(record) => lane.pending = record,
                Err(err) => {
                    warn!(base_dn = %base_dn, error = %err, "external changelog degraded");
                    failed.push(base_dn.clone());
                }
            }
        }
        for base_dn in failed {
            self.lanes.remove(&base_dn);
            self.degraded.insert(base_dn);
        }
    }

    /// Position after the last record returned.
    #[must_use]
    pub fn cookie(&self) -> &EclCookie {
        &self.cookie
    }

    /// Domains dropped from the merge after a read failure.
    #[must_use]
    pub fn degraded_domains(&self) -> Vec<String> {
        self.degraded.iter().cloned().collect()
    }
}

impl Iterator for EclCursor {
    type Item = EclRecord;

    /// Returns the next record, or `None` when caught up. A caught-up
    /// cursor returns records appended later on later calls.
    fn next(&mut self) -> Option<EclRecord> {
        self.fill_lanes();

        let mut best: Option<(&String, &UpdateRecord)> = None;
        for (base_dn, lane) in &self.lanes {
            if let Some(record) = &lane.pending {
                // lanes iterate in base DN order, so ties keep the first
                if best.map_or(true, |(_, b)| record.csn < b.csn) {
                    best = Some((base_dn, record));
                }
            }
        }
        let base_dn = best?.0.clone();

        let record = self.lanes.get_mut(&base_dn)?.pending.take()?;
        self.cookie.domain_mut(&base_dn).update(record.csn);
        Some(EclRecord { base_dn, record })
    }
}

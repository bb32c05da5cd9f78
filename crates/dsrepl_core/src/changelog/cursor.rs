//! CSN-ordered cursor over all replica logs of a domain.

use super::db::ChangelogDb;
use super::log::LogCursor;
use super::reader::KeyMatch;
use crate::csn::Csn;
use crate::error::ChangelogResult;
use crate::state::ServerState;
use crate::update::UpdateRecord;
use std::collections::BTreeMap;
use std::sync::Arc;

#[derive(Debug)]
struct Lane {
    cursor: LogCursor<UpdateRecord>,
    pending: Option<UpdateRecord>,
}

/// Merges the replica logs of a [`ChangelogDb`] into one CSN-ordered
/// stream.
///
/// Each call looks at the next record of every replica and returns the
/// smallest. Replica logs created after the cursor are picked up.
/// `None` means caught up; later calls return records appended since.
///
/// [`ChangelogCursor::position`] tracks the last CSN returned per replica,
/// which is exactly what a consumer needs to resume without gaps even when
/// an older change from one replica is appended after a newer one from
/// another.
#[derive(Debug)]
pub struct ChangelogCursor {
    db: Arc<ChangelogDb>,
    lanes: BTreeMap<u16, Lane>,
    position: ServerState,
}

impl ChangelogCursor {
    pub(crate) fn new(db: Arc<ChangelogDb>, from: ServerState) -> Self {
        Self {
            db,
            lanes: BTreeMap::new(),
            position: from,
        }
    }

    fn discover_lanes(&mut self) {
        for replica_id in self.db.replica_ids() {
            if self.lanes.contains_key(&replica_id) {
                continue;
            }
            let Some(log) = self.db.log(replica_id) else {
                continue;
            };
            let cursor = match self.position.max_csn(replica_id) {
                Some(csn) => log.cursor_from(csn, KeyMatch::After),
                None => log.cursor(),
            };
            self.lanes.insert(
                replica_id,
                Lane {
                    cursor,
                    pending: None,
                },
            );
        }
    }

    /// Returns the next record in CSN order, or `None` when caught up.
    ///
    /// # Errors
    ///
    /// Returns an error if a replica log cannot be read.
    pub fn next(&mut self) -> ChangelogResult<Option<UpdateRecord>> {
        self.discover_lanes();

        let mut best: Option<(Csn, u16)> = None;
        for (replica_id, lane) in &mut self.lanes {
            if lane.pending.is_none() {
                lane.pending = lane.cursor.next()?;
            }
            if let Some(record) = &lane.pending {
                if best.map_or(true, |(csn, _)| record.csn < csn) {
                    best = Some((record.csn, *replica_id));
                }
            }
        }

        let Some((_, replica_id)) = best else {
            return Ok(None);
        };
        let record = self
            .lanes
            .get_mut(&replica_id)
            .and_then(|lane| lane.pending.take());
        if let Some(record) = &record {
            self.position.update(record.csn);
        }
        Ok(record)
    }

    /// CSN of the next record without consuming it.
    ///
    /// # Errors
    ///
    /// Returns an error if a replica log cannot be read.
    pub fn peek_csn(&mut self) -> ChangelogResult<Option<Csn>> {
        self.discover_lanes();
        let mut best: Option<Csn> = None;
        for lane in self.lanes.values_mut() {
            if lane.pending.is_none() {
                lane.pending = lane.cursor.next()?;
            }
            if let Some(record) = &lane.pending {
                best = Some(best.map_or(record.csn, |b| b.min(record.csn)));
            }
        }
        Ok(best)
    }

    /// Last CSN returned per replica, starting from the state the cursor
    /// was opened with.
    #[must_use]
    pub fn position(&self) -> &ServerState {
        &self.position
    }

    /// The changelog this cursor reads.
    #[must_use]
    pub fn db(&self) -> &Arc<ChangelogDb> {
        &self.db
    }
}

//! Where received changes go.

use crate::error::BrokerResult;
use dsrepl_core::{AttributeValue, EntryStore, UpdateRecord};
use std::sync::atomic::{AtomicU64, Ordering};

/// Applies replicated changes to the local replica.
///
/// Called once per change, in the order the server sends them. Changes
/// published by this replica are applied through the same path.
pub trait UpdateApplier: Send + Sync {
    /// Applies one change.
    fn apply(&self, record: &UpdateRecord) -> BrokerResult<()>;
}

/// Applier backed by an in-memory [`EntryStore`].
///
/// Every change goes through per-value conflict resolution, so replicas
/// fed the same changes converge regardless of arrival order.
#[derive(Debug, Default)]
pub struct EntryStoreApplier {
    store: EntryStore,
    applied: AtomicU64,
}

impl EntryStoreApplier {
    /// Creates an empty applier.
    pub fn new() -> Self {
        Self::default()
    }

    /// The entry store.
    pub fn store(&self) -> &EntryStore {
        &self.store
    }

    /// Surviving values of `attribute` on `entry_dn`.
    pub fn resolved_values(&self, entry_dn: &str, attribute: &str) -> Option<Vec<AttributeValue>> {
        self.store.resolved_values(entry_dn, attribute)
    }

    /// Number of changes applied.
    pub fn applied(&self) -> u64 {
        self.applied.load(Ordering::Acquire)
    }
}

impl UpdateApplier for EntryStoreApplier {
    fn apply(&self, record: &UpdateRecord) -> BrokerResult<()> {
        self.store
            .apply(&record.entry_dn, &record.operation, record.csn);
        self.applied.fetch_add(1, Ordering::AcqRel);
        Ok(())
    }
}

impl<A: UpdateApplier + ?Sized> UpdateApplier for std::sync::Arc<A> {
    fn apply(&self, record: &UpdateRecord) -> BrokerResult<()> {
        (**self).apply(record)
    }
}

//! Entry-level history and the per-entry store.

use crate::csn::Csn;
use crate::historical::AttrHistoricalMultiple;
use crate::operation::{AttributeValue, ChangeKind, Operation};
use parking_lot::{Mutex, RwLock};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tracing::trace;

/// Normalizes a DN for use as a map key.
///
/// RDN components are trimmed and lowercased; escaped commas stay part of
/// their component.
#[must_use]
pub fn normalize_dn(dn: &str) -> String {
    split_dn(dn)
        .iter()
        .map(|rdn| rdn.trim().to_lowercase())
        .collect::<Vec<_>>()
        .join(",")
}

/// Normalizes an attribute type name.
#[must_use]
pub fn normalize_attribute(name: &str) -> String {
    name.trim().to_lowercase()
}

fn split_dn(dn: &str) -> Vec<&str> {
    let mut parts = Vec::new();
    let mut start = 0;
    let mut escaped = false;
    for (i, c) in dn.char_indices() {
        match c {
            '\\' if !escaped => escaped = true,
            ',' if !escaped => {
                parts.push(&dn[start..i]);
                start = i + 1;
            }
            _ => escaped = false,
        }
    }
    if start < dn.len() || !parts.is_empty() {
        parts.push(&dn[start..]);
    }
    parts.retain(|p| !p.trim().is_empty());
    parts
}

fn parent_dn(dn: &str) -> Option<String> {
    let parts = split_dn(dn);
    if parts.len() < 2 {
        return None;
    }
    Some(parts[1..].join(","))
}

fn split_rdn(rdn: &str) -> Option<(String, AttributeValue)> {
    let (attr, value) = rdn.split_once('=')?;
    Some((normalize_attribute(attr), AttributeValue::from(value.trim())))
}

/// History of one entry: its attributes plus entry-level add, delete and
/// rename CSNs.
#[derive(Debug, Clone, Default)]
pub struct EntryHistorical {
    attributes: BTreeMap<String, AttrHistoricalMultiple>,
    add_time: Option<Csn>,
    delete_time: Option<Csn>,
    rename_time: Option<Csn>,
}

impl EntryHistorical {
    /// Creates an empty history.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// True if the entry was added and not deleted afterwards.
    #[must_use]
    pub fn is_live(&self) -> bool {
        match (self.add_time, self.delete_time) {
            (Some(add), Some(delete)) => add > delete,
            (Some(_), None) => true,
            (None, _) => false,
        }
    }

    /// History of `attribute`, if any operation touched it.
    #[must_use]
    pub fn attribute(&self, attribute: &str) -> Option<&AttrHistoricalMultiple> {
        self.attributes.get(&normalize_attribute(attribute))
    }

    /// Attribute names with at least one value present.
    pub fn present_attributes(&self) -> impl Iterator<Item = &str> {
        self.attributes
            .iter()
            .filter(|(_, hist)| !hist.is_empty())
            .map(|(name, _)| name.as_str())
    }

    /// Applies a non-rename operation at `csn`.
    pub fn apply(&mut self, operation: &Operation, csn: Csn) {
        match operation {
            Operation::Add { attributes } => {
                self.add_time = self.add_time.max(Some(csn));
                for (name, values) in attributes {
                    let hist = self.attr_mut(name);
                    for value in values {
                        hist.add(value.clone(), csn);
                    }
                }
            }
            Operation::Modify { changes } => {
                for change in changes {
                    let hist = self.attr_mut(&change.attribute);
                    match change.kind {
                        ChangeKind::Add => {
                            for value in &change.values {
                                hist.add(value.clone(), csn);
                            }
                        }
                        ChangeKind::Delete if change.values.is_empty() => hist.delete(csn),
                        ChangeKind::Delete => {
                            for value in &change.values {
                                hist.delete_value(value.clone(), csn);
                            }
                        }
                        ChangeKind::Replace => hist.replace(change.values.iter().cloned(), csn),
                    }
                }
            }
            Operation::Delete => {
                self.delete_time = self.delete_time.max(Some(csn));
            }
            Operation::ModifyDn { .. } => {
                self.rename_time = self.rename_time.max(Some(csn));
            }
        }
    }

    /// Folds another history for the same entry into this one.
    fn absorb(&mut self, other: EntryHistorical) {
        self.add_time = self.add_time.max(other.add_time);
        self.delete_time = self.delete_time.max(other.delete_time);
        self.rename_time = self.rename_time.max(other.rename_time);
        for (name, hist) in other.attributes {
            match self.attributes.get_mut(&name) {
                None => {
                    self.attributes.insert(name, hist);
                }
                Some(mine) => {
                    if let Some(delete) = hist.delete_time() {
                        mine.delete(delete);
                    }
                    for value in hist.entries() {
                        if let Some(update) = value.update_time() {
                            mine.add(value.value().clone(), update);
                        }
                        if let Some(delete) = value.delete_time() {
                            mine.delete_value(value.value().clone(), delete);
                        }
                    }
                }
            }
        }
    }

    fn attr_mut(&mut self, name: &str) -> &mut AttrHistoricalMultiple {
        self.attributes.entry(normalize_attribute(name)).or_default()
    }

    fn purge_before(&mut self, csn: Csn) -> usize {
        let mut purged = 0;
        for hist in self.attributes.values_mut() {
            purged += hist.purge_before(csn);
        }
        self.attributes
            .retain(|_, hist| hist.entries().next().is_some() || hist.delete_time() >= Some(csn));
        purged
    }
}

/// Entry histories keyed by normalized DN.
///
/// Each entry has its own lock, so updates to different entries proceed in
/// parallel; the map lock is only held to find or insert an entry.
#[derive(Debug, Default)]
pub struct EntryStore {
    entries: RwLock<HashMap<String, Arc<Mutex<EntryHistorical>>>>,
}

impl EntryStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Applies `operation` on `dn` at `csn`.
    pub fn apply(&self, dn: &str, operation: &Operation, csn: Csn) {
        let key = normalize_dn(dn);
        trace!(dn = %key, op = operation.name(), csn = %csn, "applying update");

        if let Operation::ModifyDn {
            new_rdn,
            new_superior,
            delete_old_rdn,
        } = operation
        {
            self.rename(
                &key,
                new_rdn,
                new_superior.as_deref(),
                *delete_old_rdn,
                csn,
            );
            return;
        }

        let entry = self.entry_or_insert(&key);
        entry.lock().apply(operation, csn);
    }

    fn rename(
        &self,
        old_key: &str,
        new_rdn: &str,
        new_superior: Option<&str>,
        delete_old_rdn: bool,
        csn: Csn,
    ) {
        let parent = match new_superior {
            Some(superior) => Some(normalize_dn(superior)),
            None => parent_dn(old_key),
        };
        let new_key = match parent {
            Some(parent) => normalize_dn(&format!("{new_rdn},{parent}")),
            None => normalize_dn(new_rdn),
        };

        let mut entries = self.entries.write();
        let Some(current) = entries.get(old_key).cloned() else {
            return;
        };
        {
            let mut hist = current.lock();
            // an older rename arriving late must not move the entry back
            if hist.rename_time.is_some_and(|r| r >= csn) {
                return;
            }
            hist.rename_time = Some(csn);
            if let Some((attr, value)) = split_rdn(new_rdn) {
                hist.attr_mut(&attr).add(value, csn);
            }
            if delete_old_rdn {
                let old_rdn = split_dn(old_key).first().map(|s| s.to_string());
                if let Some((attr, value)) = old_rdn.as_deref().and_then(split_rdn) {
                    hist.attr_mut(&attr).delete_value(value, csn);
                }
            }
        }
        if new_key == old_key {
            return;
        }
        entries.remove(old_key);
        match entries.get(&new_key) {
            Some(existing) => {
                let moved = std::mem::take(&mut *current.lock());
                existing.lock().absorb(moved);
            }
            None => {
                entries.insert(new_key, current);
            }
        }
    }

    fn entry_or_insert(&self, key: &str) -> Arc<Mutex<EntryHistorical>> {
        if let Some(entry) = self.entries.read().get(key) {
            return Arc::clone(entry);
        }
        let mut entries = self.entries.write();
        Arc::clone(entries.entry(key.to_string()).or_default())
    }

    /// Surviving values of `attribute` on `dn`, in value order.
    ///
    /// Returns `None` if the entry does not exist or was deleted.
    #[must_use]
    pub fn resolved_values(&self, dn: &str, attribute: &str) -> Option<Vec<AttributeValue>> {
        let entry = self.entries.read().get(&normalize_dn(dn)).cloned()?;
        let hist = entry.lock();
        if !hist.is_live() {
            return None;
        }
        Some(
            hist.attribute(attribute)
                .map(AttrHistoricalMultiple::values)
                .unwrap_or_default(),
        )
    }

    /// A copy of the history of `dn`.
    #[must_use]
    pub fn entry(&self, dn: &str) -> Option<EntryHistorical> {
        let entry = self.entries.read().get(&normalize_dn(dn)).cloned()?;
        let hist = entry.lock().clone();
        Some(hist)
    }

    /// True if `dn` exists and is not deleted.
    #[must_use]
    pub fn exists(&self, dn: &str) -> bool {
        self.entries
            .read()
            .get(&normalize_dn(dn))
            .is_some_and(|entry| entry.lock().is_live())
    }

    /// Number of tracked entries, deleted ones included.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    /// True if no entry is tracked.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }

    /// Drops history older than `csn`: delete markers inside entries and
    /// entries deleted before `csn`. Returns the number of items removed.
    pub fn purge_historical(&self, csn: Csn) -> usize {
        let mut entries = self.entries.write();
        let mut purged = 0;
        entries.retain(|_, entry| {
            let mut hist = entry.lock();
            if !hist.is_live() && hist.delete_time.is_some_and(|d| d < csn) {
                purged += 1;
                return false;
            }
            purged += hist.purge_before(csn);
            true
        });
        purged
    }
}

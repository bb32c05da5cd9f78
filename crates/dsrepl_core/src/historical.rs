//! Per-value attribute history for conflict resolution.
//!
//! Every replica applies the same operations in whatever order they arrive
//! and must end up with the same attribute values. Each value remembers the
//! CSN of its latest add and latest delete; the attribute remembers the CSN
//! of its latest whole-attribute delete. The newest operation wins, and a
//! delete wins a tie.

use crate::csn::Csn;
use crate::operation::AttributeValue;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::hash::{Hash, Hasher};

/// History of one attribute value.
///
/// Equality and hashing consider the value only, never the CSNs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AttrValueHistorical {
    value: AttributeValue,
    update_time: Option<Csn>,
    delete_time: Option<Csn>,
}

impl AttrValueHistorical {
    fn new(value: AttributeValue) -> Self {
        Self {
            value,
            update_time: None,
            delete_time: None,
        }
    }

    /// The value.
    #[must_use]
    pub fn value(&self) -> &AttributeValue {
        &self.value
    }

    /// CSN of the latest add of this value.
    #[must_use]
    pub fn update_time(&self) -> Option<Csn> {
        self.update_time
    }

    /// CSN of the latest delete of this value.
    #[must_use]
    pub fn delete_time(&self) -> Option<Csn> {
        self.delete_time
    }

    /// True if the latest add is newer than the latest delete.
    #[must_use]
    pub fn is_present(&self) -> bool {
        match (self.update_time, self.delete_time) {
            (Some(update), Some(delete)) => update > delete,
            (Some(_), None) => true,
            (None, _) => false,
        }
    }

    fn last_change(&self) -> Option<Csn> {
        self.update_time.max(self.delete_time)
    }
}

impl PartialEq for AttrValueHistorical {
    fn eq(&self, other: &Self) -> bool {
        self.value == other.value
    }
}

impl Eq for AttrValueHistorical {}

impl Hash for AttrValueHistorical {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.value.hash(state);
    }
}

/// History of a multi-valued attribute.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AttrHistoricalMultiple {
    delete_time: Option<Csn>,
    last_update_time: Option<Csn>,
    values: BTreeMap<AttributeValue, AttrValueHistorical>,
}

impl AttrHistoricalMultiple {
    /// Creates an empty history.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// CSN of the latest whole-attribute delete.
    #[must_use]
    pub fn delete_time(&self) -> Option<Csn> {
        self.delete_time
    }

    /// Largest CSN of any operation applied to this attribute.
    #[must_use]
    pub fn last_update_time(&self) -> Option<Csn> {
        self.last_update_time
    }

    /// Adds `value` at `csn`.
    ///
    /// Returns false if a whole-attribute delete at or after `csn` already
    /// covers the add.
    pub fn add(&mut self, value: impl Into<AttributeValue>, csn: Csn) -> bool {
        self.touch(csn);
        if self.delete_time.is_some_and(|d| csn <= d) {
            return false;
        }
        self.record_add(value.into(), csn);
        true
    }

    /// Deletes `value` at `csn`.
    ///
    /// The value need not be present: the delete is remembered so that an
    /// older add arriving later does not bring the value back. Returns false
    /// if a whole-attribute delete already covers it.
    pub fn delete_value(&mut self, value: impl Into<AttributeValue>, csn: Csn) -> bool {
        self.touch(csn);
        if self.delete_time.is_some_and(|d| csn <= d) {
            return false;
        }
        let entry = self
            .values
            .entry(value.into())
            .or_insert_with_key(|v| AttrValueHistorical::new(v.clone()));
        entry.delete_time = entry.delete_time.max(Some(csn));
        true
    }

    /// Deletes the whole attribute at `csn`.
    ///
    /// Values whose every recorded operation is at or before `csn` are
    /// dropped; newer adds and deletes survive.
    pub fn delete(&mut self, csn: Csn) {
        self.touch(csn);
        let delete = self.delete_time.max(Some(csn));
        self.delete_time = delete;

        self.values.retain(|_, hist| {
            hist.update_time = hist.update_time.filter(|u| Some(*u) > delete);
            hist.delete_time = hist.delete_time.filter(|d| Some(*d) > delete);
            hist.last_change().is_some()
        });
    }

    /// Replaces the attribute with `values` at `csn`.
    ///
    /// Equivalent to a whole-attribute delete and an add of each value, all
    /// at `csn`.
    pub fn replace<V: Into<AttributeValue>>(
        &mut self,
        values: impl IntoIterator<Item = V>,
        csn: Csn,
    ) {
        self.delete(csn);
        // An add at exactly the delete CSN belongs to this replace; anything
        // newer already raised the delete time past `csn`.
        if self.delete_time.is_some_and(|d| csn < d) {
            return;
        }
        for value in values {
            self.record_add(value.into(), csn);
        }
    }

    /// Independent deep copy.
    #[must_use]
    pub fn duplicate(&self) -> Self {
        self.clone()
    }

    /// Histories of the values currently present, in value order.
    pub fn values_historical(&self) -> impl Iterator<Item = &AttrValueHistorical> {
        self.values.values().filter(|hist| hist.is_present())
    }

    /// The values currently present, in value order.
    #[must_use]
    pub fn values(&self) -> Vec<AttributeValue> {
        self.values_historical()
            .map(|hist| hist.value.clone())
            .collect()
    }

    /// Every tracked value history, including delete markers.
    pub fn entries(&self) -> impl Iterator<Item = &AttrValueHistorical> {
        self.values.values()
    }

    /// True if no value is present.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.values_historical().next().is_none()
    }

    /// Drops delete markers whose last change is older than `csn`.
    ///
    /// Only safe once no operation older than `csn` can still arrive.
    /// Returns the number of markers removed.
    pub fn purge_before(&mut self, csn: Csn) -> usize {
        let before = self.values.len();
        self.values
            .retain(|_, hist| hist.is_present() || hist.last_change().is_some_and(|c| c >= csn));
        before - self.values.len()
    }

    fn record_add(&mut self, value: AttributeValue, csn: Csn) {
        let entry = self
            .values
            .entry(value)
            .or_insert_with_key(|v| AttrValueHistorical::new(v.clone()));
        entry.update_time = entry.update_time.max(Some(csn));
    }

    fn touch(&mut self, csn: Csn) {
        self.last_update_time = self.last_update_time.max(Some(csn));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn csn(t: u64) -> Csn {
        Csn::new(t, 0, 1)
    }

    fn strings(hist: &AttrHistoricalMultiple) -> Vec<String> {
        hist.values().iter().map(ToString::to_string).collect()
    }

    #[test]
    fn add_then_older_delete_keeps_value() {
        let mut hist = AttrHistoricalMultiple::new();
        hist.add("a", csn(5));
        hist.delete_value("a", csn(3));
        assert_eq!(strings(&hist), vec!["a"]);
    }

    #[test]
    fn delete_wins_tie() {
        let mut hist = AttrHistoricalMultiple::new();
        hist.add("a", csn(5));
        hist.delete_value("a", csn(5));
        assert!(hist.is_empty());
    }

    #[test]
    fn arrival_order_does_not_matter() {
        // add(v,1), delete(v,2), add(v,3) in two different orders
        let mut forward = AttrHistoricalMultiple::new();
        forward.add("v", csn(1));
        forward.delete_value("v", csn(2));
        forward.add("v", csn(3));

        let mut rotated = AttrHistoricalMultiple::new();
        rotated.add("v", csn(3));
        rotated.add("v", csn(1));
        rotated.delete_value("v", csn(2));

        assert_eq!(strings(&forward), vec!["v"]);
        assert_eq!(forward.values(), rotated.values());
    }

    #[test]
    fn newer_add_survives_attribute_delete() {
        let mut hist = AttrHistoricalMultiple::new();
        hist.add("old", csn(1));
        hist.delete(csn(5));
        hist.add("new", csn(7));
        assert_eq!(strings(&hist), vec!["new"]);

        let mut reversed = AttrHistoricalMultiple::new();
        reversed.add("new", csn(7));
        reversed.delete(csn(5));
        reversed.add("old", csn(1));
        assert_eq!(reversed.values(), hist.values());
    }

    #[test]
    fn older_add_after_attribute_delete_is_refused() {
        let mut hist = AttrHistoricalMultiple::new();
        hist.delete(csn(10));
        assert!(!hist.add("late", csn(4)));
        assert!(hist.is_empty());
        assert_eq!(hist.delete_time(), Some(csn(10)));
    }

    #[test]
    fn replace_loses_to_newer_concurrent_add() {
        let mut hist = AttrHistoricalMultiple::new();
        hist.replace(["x"], csn(5));
        hist.add("y", csn(6));
        assert_eq!(strings(&hist), vec!["x", "y"]);

        let mut other = AttrHistoricalMultiple::new();
        other.add("y", csn(6));
        other.replace(["x"], csn(5));
        assert_eq!(other.values(), hist.values());
    }

    #[test]
    fn replace_drops_older_concurrent_add() {
        let mut hist = AttrHistoricalMultiple::new();
        hist.add("y", csn(4));
        hist.replace(["x"], csn(5));
        assert_eq!(strings(&hist), vec!["x"]);

        let mut other = AttrHistoricalMultiple::new();
        other.replace(["x"], csn(5));
        other.add("y", csn(4));
        assert_eq!(other.values(), hist.values());
    }

    #[test]
    fn older_replace_is_ignored_by_newer_one() {
        let mut hist = AttrHistoricalMultiple::new();
        hist.replace(["new"], csn(9));
        hist.replace(["old"], csn(3));
        assert_eq!(strings(&hist), vec!["new"]);
    }

    #[test]
    fn delete_of_absent_value_blocks_late_add() {
        let mut hist = AttrHistoricalMultiple::new();
        hist.delete_value("ghost", csn(8));
        hist.add("ghost", csn(6));
        assert!(hist.is_empty());
        assert_eq!(hist.entries().count(), 1);
    }

    #[test]
    fn duplicate_is_independent() {
        let mut hist = AttrHistoricalMultiple::new();
        hist.add("a", csn(1));
        let copy = hist.duplicate();
        hist.delete_value("a", csn(2));
        assert!(hist.is_empty());
        assert_eq!(strings(&copy), vec!["a"]);
    }

    #[test]
    fn value_equality_ignores_csns() {
        let mut a = AttrHistoricalMultiple::new();
        a.add("same", csn(1));
        let mut b = AttrHistoricalMultiple::new();
        b.add("same", csn(9));
        let x = a.entries().next().unwrap();
        let y = b.entries().next().unwrap();
        assert_eq!(x, y);
        assert_ne!(x.update_time(), y.update_time());
    }

    #[test]
    fn purge_drops_old_markers_only() {
        let mut hist = AttrHistoricalMultiple::new();
        hist.delete_value("gone", csn(2));
        hist.delete_value("recent", csn(20));
        hist.add("live", csn(1));

        assert_eq!(hist.purge_before(csn(10)), 1);
        let tracked: Vec<String> = hist.entries().map(|h| h.value().to_string()).collect();
        assert_eq!(tracked, vec!["live", "recent"]);
    }

    #[test]
    fn last_update_time_tracks_every_operation() {
        let mut hist = AttrHistoricalMultiple::new();
        hist.add("a", csn(3));
        hist.delete(csn(9));
        hist.add("b", csn(5));
        assert_eq!(hist.last_update_time(), Some(csn(9)));
    }

    #[derive(Debug, Clone)]
    enum Op {
        Add(u8),
        DeleteValue(u8),
        DeleteAttr,
        Replace(Vec<u8>),
    }

    fn apply(hist: &mut AttrHistoricalMultiple, op: &Op, at: Csn) {
        match op {
            Op::Add(v) => {
                hist.add(vec![*v], at);
            }
            Op::DeleteValue(v) => {
                hist.delete_value(vec![*v], at);
            }
            Op::DeleteAttr => hist.delete(at),
            Op::Replace(vs) => hist.replace(vs.iter().map(|v| vec![*v]), at),
        }
    }

    fn op_strategy() -> impl Strategy<Value = Op> {
        prop_oneof![
            4 => (0u8..4).prop_map(Op::Add),
            3 => (0u8..4).prop_map(Op::DeleteValue),
            1 => Just(Op::DeleteAttr),
            1 => proptest::collection::vec(0u8..4, 0..3).prop_map(Op::Replace),
        ]
    }

    fn stamped_ops() -> impl Strategy<Value = Vec<(Op, Csn)>> {
        proptest::collection::vec((op_strategy(), 0u64..50, 1u16..4), 1..24).prop_map(|ops| {
            // one CSN per operation
            ops.into_iter()
                .enumerate()
                .map(|(i, (op, t, r))| (op, Csn::new(t, i as u16, r)))
                .collect()
        })
    }

    proptest! {
        #[test]
        fn any_permutation_converges(
            (ops, shuffled) in stamped_ops().prop_flat_map(|ops| {
                let shuffled = Just(ops.clone()).prop_shuffle();
                (Just(ops), shuffled)
            })
        ) {
            let mut a = AttrHistoricalMultiple::new();
            for (op, at) in &ops {
                apply(&mut a, op, *at);
            }
            let mut b = AttrHistoricalMultiple::new();
            for (op, at) in &shuffled {
                apply(&mut b, op, *at);
            }
            prop_assert_eq!(a.values(), b.values());
            prop_assert_eq!(a.delete_time(), b.delete_time());
            prop_assert_eq!(a.last_update_time(), b.last_update_time());
        }
    }
}

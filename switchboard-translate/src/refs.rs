//! The resource-reference index.
//!
//! A bidirectional, many-to-many index between row identities and the
//! named entities their translation depended on. When an entity changes,
//! the forward side says which rows to re-translate; when a row is
//! re-translated or removed, the reverse side says which forward buckets
//! to clean up.
//!
//! Edges live in a slab and both adjacencies refer to them by index, so
//! removal from either side never chases stale pointers.
//!
//! # Invariants
//!
//! * Every edge index stored in `by_ref` is also stored in `by_row`, and
//!   vice versa.
//! * A `by_ref` bucket is removed as soon as it becomes empty.

use std::collections::{HashMap, HashSet};

use slab::Slab;
use switchboard_data::RowId;

/// What kind of entity a reference names.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum RefKind {
    PortBinding,
    McGroup,
    AddrSet,
    PortGroup,
}

#[derive(Debug)]
struct Edge {
    kind: RefKind,
    name: String,
    row: RowId,
    /// How many times the row references the entity. Meaningful for
    /// address sets (it predicts how many matches one added element
    /// produces); zero for the other kinds.
    ref_count: usize,
}

/// The bidirectional index.
#[derive(Debug, Default)]
pub struct ResourceRefIndex {
    edges: Slab<Edge>,
    by_ref: HashMap<(RefKind, String), HashMap<RowId, usize>, ahash::RandomState>,
    by_row: HashMap<RowId, Vec<usize>, ahash::RandomState>,
}

impl ResourceRefIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record that `row` references `(kind, name)`. Idempotent: a
    /// reference that is already present is left untouched (including
    /// its ref count).
    pub fn add(&mut self, kind: RefKind, name: &str, row: RowId, ref_count: usize) {
        let key = (kind, name.to_string());
        if let Some(bucket) = self.by_ref.get(&key) {
            if bucket.contains_key(&row) {
                return;
            }
        }
        let idx = self.edges.insert(Edge {
            kind,
            name: name.to_string(),
            row,
            ref_count,
        });
        self.by_ref.entry(key).or_default().insert(row, idx);
        self.by_row.entry(row).or_default().push(idx);
    }

    /// Remove every reference held by `row`, dropping forward buckets
    /// that become empty.
    pub fn forget_row(&mut self, row: RowId) {
        let Some(edge_idxs) = self.by_row.remove(&row) else {
            return;
        };
        for idx in edge_idxs {
            let edge = self.edges.remove(idx);
            let key = (edge.kind, edge.name);
            if let Some(bucket) = self.by_ref.get_mut(&key) {
                bucket.remove(&edge.row);
                if bucket.is_empty() {
                    self.by_ref.remove(&key);
                }
            }
        }
    }

    /// The rows referencing `(kind, name)`, with their ref counts.
    pub fn rows_for(&self, kind: RefKind, name: &str) -> impl Iterator<Item = (RowId, usize)> + '_ {
        self.by_ref
            .get(&(kind, name.to_string()))
            .into_iter()
            .flatten()
            .map(|(row, idx)| (*row, self.edges[*idx].ref_count))
    }

    /// Whether `row` holds any reference at all. Rows with references
    /// must never have a fully-expanded cache entry.
    pub fn row_has_refs(&self, row: RowId) -> bool {
        self.by_row.contains_key(&row)
    }

    pub fn clear(&mut self) {
        self.edges.clear();
        self.by_ref.clear();
        self.by_row.clear();
    }

    pub fn is_empty(&self) -> bool {
        self.edges.is_empty()
    }

    /// Verify both adjacencies describe the same edge set. Test support.
    #[doc(hidden)]
    pub fn check_consistency(&self) -> bool {
        let mut seen = HashSet::new();
        for ((kind, name), bucket) in &self.by_ref {
            if bucket.is_empty() {
                return false;
            }
            for (row, idx) in bucket {
                let Some(edge) = self.edges.get(*idx) else {
                    return false;
                };
                if edge.kind != *kind || edge.name != *name || edge.row != *row {
                    return false;
                }
                seen.insert(*idx);
            }
        }
        for (row, idxs) in &self.by_row {
            for idx in idxs {
                let Some(edge) = self.edges.get(*idx) else {
                    return false;
                };
                if edge.row != *row || !seen.remove(idx) {
                    return false;
                }
            }
        }
        seen.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use test_strategy::proptest;

    #[test]
    fn add_is_idempotent() {
        let mut r = ResourceRefIndex::new();
        let row = RowId::random();
        r.add(RefKind::AddrSet, "as1", row, 2);
        r.add(RefKind::AddrSet, "as1", row, 5);
        let refs: Vec<_> = r.rows_for(RefKind::AddrSet, "as1").collect();
        // The original ref count survives.
        assert_eq!(refs, vec![(row, 2)]);
        assert!(r.check_consistency());
    }

    #[test]
    fn forget_row_drops_empty_buckets() {
        let mut r = ResourceRefIndex::new();
        let (a, b) = (RowId::random(), RowId::random());
        r.add(RefKind::PortBinding, "p1", a, 0);
        r.add(RefKind::PortBinding, "p1", b, 0);
        r.add(RefKind::McGroup, "mg@1", a, 0);
        r.forget_row(a);
        assert!(r.check_consistency());
        assert_eq!(r.rows_for(RefKind::PortBinding, "p1").count(), 1);
        assert_eq!(r.rows_for(RefKind::McGroup, "mg@1").count(), 0);
        assert!(!r.row_has_refs(a));
        r.forget_row(b);
        assert!(r.is_empty());
    }

    #[derive(Debug, Clone)]
    enum Op {
        Add { kind: u8, name: u8, row: u8, count: usize },
        Forget { row: u8 },
    }

    fn op_strategy() -> impl Strategy<Value = Op> {
        prop_oneof![
            (0..4u8, 0..4u8, 0..6u8, 0..3usize)
                .prop_map(|(kind, name, row, count)| Op::Add { kind, name, row, count }),
            (0..6u8).prop_map(|row| Op::Forget { row }),
        ]
    }

    // Both sides of the index stay exact mirrors under arbitrary
    // add/forget interleavings.
    #[proptest]
    fn forward_and_reverse_stay_mirrored(
        #[strategy(proptest::collection::vec(op_strategy(), 0..64))] ops: Vec<Op>,
    ) {
        let rows: Vec<RowId> = (0..6).map(|_| RowId::random()).collect();
        let kinds = [
            RefKind::PortBinding,
            RefKind::McGroup,
            RefKind::AddrSet,
            RefKind::PortGroup,
        ];
        let mut r = ResourceRefIndex::new();
        for op in ops {
            match op {
                Op::Add { kind, name, row, count } => {
                    r.add(
                        kinds[kind as usize],
                        &format!("n{name}"),
                        rows[row as usize],
                        count,
                    );
                }
                Op::Forget { row } => r.forget_row(rows[row as usize]),
            }
            prop_assert!(r.check_consistency());
        }
    }
}

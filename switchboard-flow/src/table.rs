//! The desired-flow staging table.

use std::collections::{HashMap, HashSet};

use serde::{Deserialize, Serialize};
use slab::Slab;
use switchboard_data::OwnerId;
use tracing::debug;

use crate::flow::{AddrSetAnnotation, FlowAction, Match};

/// The identity of a desired flow. Two additions with the same key are
/// the same flow; ownership links accumulate on it.
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Debug, Serialize, Deserialize)]
pub struct FlowKey {
    pub table: u8,
    pub priority: u16,
    pub match_: Match,
    pub meter: Option<u32>,
}

/// Everything that goes into one staged flow besides its owner.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FlowDesc {
    pub table: u8,
    pub priority: u16,
    pub cookie: u32,
    pub match_: Match,
    pub actions: Vec<FlowAction>,
    pub meter: Option<u32>,
    /// Set when this flow was expanded from one address-set element.
    pub annotation: Option<AddrSetAnnotation>,
}

impl FlowDesc {
    fn key(&self) -> FlowKey {
        FlowKey {
            table: self.table,
            priority: self.priority,
            match_: self.match_.clone(),
            meter: self.meter,
        }
    }
}

/// A staged flow with its ownership links. Each owner link optionally
/// carries the addr-set annotation recorded when that owner added the
/// flow.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DesiredFlow {
    pub key: FlowKey,
    pub cookie: u32,
    pub actions: Vec<FlowAction>,
    pub owners: std::collections::BTreeMap<OwnerId, Option<AddrSetAnnotation>>,
}

/// The staging-table operations the translator emits through.
pub trait FlowSink {
    /// Stage an ordinary flow. A flow with the same key already present
    /// wins; the new addition only contributes an ownership link.
    fn add_flow(&mut self, owner: OwnerId, flow: FlowDesc);

    /// Stage a flow whose actions may be merged with an existing flow at
    /// the same key (conjunction clauses from several sources coalesce
    /// into one flow).
    fn add_or_append_flow(&mut self, owner: OwnerId, flow: FlowDesc);

    /// Drop every flow link held by `owner`; flows with no remaining
    /// owner are removed.
    fn remove_flows(&mut self, owner: OwnerId);

    /// Drop the flows `owner` added under `annotation`. Returns whether
    /// exactly `expected` links were found and removed.
    fn remove_flows_for_addr_set_ip(
        &mut self,
        owner: OwnerId,
        annotation: &AddrSetAnnotation,
        expected: usize,
    ) -> bool;

    /// Remove every flow reachable from the given owners, following
    /// shared-ownership links transitively; `owners` is grown to the
    /// full set of affected owners so the caller can re-translate them.
    fn flood_remove(&mut self, owners: &mut HashSet<OwnerId>);
}

/// In-memory implementation of [`FlowSink`]: the desired state handed to
/// the forwarding-plane agent at the end of a cycle.
///
/// Entries live in a slab; the key map and the per-owner adjacency refer
/// to entries by slab index so removal never chases stale keys.
#[derive(Clone, Debug, Default)]
pub struct DesiredFlowTable {
    entries: Slab<DesiredFlow>,
    by_key: HashMap<FlowKey, usize, ahash::RandomState>,
    by_owner: HashMap<OwnerId, HashSet<usize>, ahash::RandomState>,
}

impl DesiredFlowTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
        self.by_key.clear();
        self.by_owner.clear();
    }

    pub fn flows(&self) -> impl Iterator<Item = &DesiredFlow> {
        self.entries.iter().map(|(_, e)| e)
    }

    pub fn flows_in_table(&self, table: u8) -> impl Iterator<Item = &DesiredFlow> {
        self.flows().filter(move |f| f.key.table == table)
    }

    pub fn flows_for_owner(&self, owner: OwnerId) -> impl Iterator<Item = &DesiredFlow> + '_ {
        self.by_owner
            .get(&owner)
            .into_iter()
            .flatten()
            .map(|idx| &self.entries[*idx])
    }

    fn link(&mut self, idx: usize, owner: OwnerId, annotation: Option<AddrSetAnnotation>) {
        self.entries[idx].owners.entry(owner).or_insert(annotation);
        self.by_owner.entry(owner).or_default().insert(idx);
    }

    fn unlink(&mut self, idx: usize, owner: OwnerId) {
        let entry = &mut self.entries[idx];
        entry.owners.remove(&owner);
        if let Some(set) = self.by_owner.get_mut(&owner) {
            set.remove(&idx);
            if set.is_empty() {
                self.by_owner.remove(&owner);
            }
        }
        if self.entries[idx].owners.is_empty() {
            self.drop_entry(idx);
        }
    }

    fn drop_entry(&mut self, idx: usize) {
        let entry = self.entries.remove(idx);
        self.by_key.remove(&entry.key);
        for owner in entry.owners.keys() {
            if let Some(set) = self.by_owner.get_mut(owner) {
                set.remove(&idx);
                if set.is_empty() {
                    self.by_owner.remove(owner);
                }
            }
        }
    }

    fn insert_new(&mut self, owner: OwnerId, flow: FlowDesc) -> usize {
        let key = flow.key();
        let annotation = flow.annotation;
        let idx = self.entries.insert(DesiredFlow {
            key: key.clone(),
            cookie: flow.cookie,
            actions: flow.actions,
            owners: Default::default(),
        });
        self.by_key.insert(key, idx);
        self.link(idx, owner, annotation);
        idx
    }

    /// Canonical contents, for equivalence checks: conjunction actions
    /// are order-insensitive.
    pub fn normalized(
        &self,
    ) -> std::collections::BTreeMap<FlowKey, (u32, Vec<FlowAction>, Vec<(OwnerId, Option<AddrSetAnnotation>)>)>
    {
        self.flows()
            .map(|f| {
                let mut actions = f.actions.clone();
                actions.sort_by_key(|a| match a {
                    FlowAction::Conjunction { id, clause, .. } => (1u8, *id, *clause),
                    _ => (0, 0, 0),
                });
                (
                    f.key.clone(),
                    (
                        f.cookie,
                        actions,
                        f.owners.iter().map(|(o, a)| (*o, a.clone())).collect(),
                    ),
                )
            })
            .collect()
    }
}

impl PartialEq for DesiredFlowTable {
    fn eq(&self, other: &Self) -> bool {
        self.normalized() == other.normalized()
    }
}

impl FlowSink for DesiredFlowTable {
    fn add_flow(&mut self, owner: OwnerId, flow: FlowDesc) {
        if let Some(&idx) = self.by_key.get(&flow.key()) {
            if self.entries[idx].actions != flow.actions {
                debug!(
                    table = flow.table,
                    priority = flow.priority,
                    "duplicate flow with different actions, keeping the first"
                );
            }
            let annotation = flow.annotation;
            self.link(idx, owner, annotation);
        } else {
            self.insert_new(owner, flow);
        }
    }

    fn add_or_append_flow(&mut self, owner: OwnerId, flow: FlowDesc) {
        if let Some(&idx) = self.by_key.get(&flow.key()) {
            let annotation = flow.annotation;
            {
                let entry = &mut self.entries[idx];
                for action in flow.actions {
                    if !entry.actions.contains(&action) {
                        entry.actions.push(action);
                    }
                }
            }
            self.link(idx, owner, annotation);
        } else {
            self.insert_new(owner, flow);
        }
    }

    fn remove_flows(&mut self, owner: OwnerId) {
        let idxs: Vec<usize> = self
            .by_owner
            .get(&owner)
            .map(|s| s.iter().copied().collect())
            .unwrap_or_default();
        for idx in idxs {
            self.unlink(idx, owner);
        }
    }

    fn remove_flows_for_addr_set_ip(
        &mut self,
        owner: OwnerId,
        annotation: &AddrSetAnnotation,
        expected: usize,
    ) -> bool {
        let idxs: Vec<usize> = self
            .by_owner
            .get(&owner)
            .map(|s| s.iter().copied().collect())
            .unwrap_or_default();
        let mut removed = 0;
        for idx in idxs {
            if self.entries[idx].owners.get(&owner) == Some(&Some(annotation.clone())) {
                self.unlink(idx, owner);
                removed += 1;
            }
        }
        if removed != expected {
            debug!(
                set = %annotation.set,
                removed,
                expected,
                "addr-set flow removal count mismatch"
            );
        }
        removed == expected
    }

    fn flood_remove(&mut self, owners: &mut HashSet<OwnerId>) {
        let mut queue: Vec<OwnerId> = owners.iter().copied().collect();
        let mut doomed: HashSet<usize> = HashSet::new();
        while let Some(owner) = queue.pop() {
            let idxs: Vec<usize> = self
                .by_owner
                .get(&owner)
                .map(|s| s.iter().copied().collect())
                .unwrap_or_default();
            for idx in idxs {
                if doomed.insert(idx) {
                    for other in self.entries[idx].owners.keys() {
                        if owners.insert(*other) {
                            queue.push(*other);
                        }
                    }
                }
            }
        }
        for idx in doomed {
            self.drop_entry(idx);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::flow::MatchField;

    fn flow(table: u8, metadata: u128, actions: Vec<FlowAction>) -> FlowDesc {
        let mut m = Match::new();
        m.set(MatchField::Metadata, metadata);
        FlowDesc {
            table,
            priority: 100,
            cookie: 1,
            match_: m,
            actions,
            meter: None,
            annotation: None,
        }
    }

    #[test]
    fn duplicate_add_links_second_owner() {
        let mut t = DesiredFlowTable::new();
        let (a, b) = (OwnerId::random(), OwnerId::random());
        t.add_flow(a, flow(8, 1, vec![FlowAction::Resubmit { table: 9 }]));
        t.add_flow(b, flow(8, 1, vec![FlowAction::Resubmit { table: 10 }]));
        assert_eq!(t.len(), 1);
        // First addition's actions win.
        assert_eq!(
            t.flows().next().unwrap().actions,
            vec![FlowAction::Resubmit { table: 9 }]
        );
        t.remove_flows(a);
        assert_eq!(t.len(), 1);
        t.remove_flows(b);
        assert!(t.is_empty());
    }

    #[test]
    fn append_coalesces_conjunction_clauses() {
        let mut t = DesiredFlowTable::new();
        let (a, b) = (OwnerId::random(), OwnerId::random());
        let conj = |id| FlowAction::Conjunction {
            id,
            clause: 0,
            n_clauses: 2,
        };
        t.add_or_append_flow(a, flow(8, 1, vec![conj(7)]));
        t.add_or_append_flow(b, flow(8, 1, vec![conj(9)]));
        t.add_or_append_flow(b, flow(8, 1, vec![conj(9)]));
        let staged = t.flows().next().unwrap();
        assert_eq!(staged.actions, vec![conj(7), conj(9)]);
        assert_eq!(staged.owners.len(), 2);
    }

    #[test]
    fn flood_remove_expands_across_shared_flows() {
        let mut t = DesiredFlowTable::new();
        let (a, b, c) = (OwnerId::random(), OwnerId::random(), OwnerId::random());
        // a and b share one flow; c is independent.
        t.add_or_append_flow(
            a,
            flow(
                8,
                1,
                vec![FlowAction::Conjunction {
                    id: 1,
                    clause: 0,
                    n_clauses: 2,
                }],
            ),
        );
        t.add_or_append_flow(
            b,
            flow(
                8,
                1,
                vec![FlowAction::Conjunction {
                    id: 2,
                    clause: 0,
                    n_clauses: 2,
                }],
            ),
        );
        t.add_flow(b, flow(8, 2, vec![]));
        t.add_flow(c, flow(8, 3, vec![]));

        let mut set = HashSet::from([a]);
        t.flood_remove(&mut set);
        assert!(set.contains(&a) && set.contains(&b));
        assert!(!set.contains(&c));
        // Everything a and b owned is gone, c's flow remains.
        assert_eq!(t.len(), 1);
        assert_eq!(t.flows_for_owner(c).count(), 1);
    }

    #[test]
    fn annotated_removal_checks_count() {
        let mut t = DesiredFlowTable::new();
        let owner = OwnerId::random();
        let ann = AddrSetAnnotation {
            set: "as1".into(),
            ip: 0x01010101,
            mask: u32::MAX as u128,
        };
        let mut desc = flow(8, 1, vec![]);
        desc.annotation = Some(ann.clone());
        t.add_flow(owner, desc);
        t.add_flow(owner, flow(8, 2, vec![]));

        assert!(!t.remove_flows_for_addr_set_ip(owner, &ann, 2));
        // The annotated flow is gone regardless; a second attempt finds
        // nothing.
        assert_eq!(t.len(), 1);
        assert!(t.remove_flows_for_addr_set_ip(owner, &ann, 0));
    }
}

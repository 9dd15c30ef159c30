//! Expansion of a normalized expression into concrete matches.

use indexmap::IndexMap;
use switchboard_flow::{AddrSetAnnotation, Match, MatchField};
use tracing::debug;

use crate::expr::{Cmp, CmpConst, Expr, FieldRef};
use crate::PortResolver;

/// A conjunction clause attached to a match. Ids are allocated as
/// zero-based placeholders during expansion and rebased onto a real
/// range with [`MatchSet::prepare`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Conj {
    pub id: u32,
    pub clause: u8,
    pub n_clauses: u8,
}

/// One expanded match: the concrete field constraints plus the
/// conjunction clauses it participates in and the address-set element it
/// was expanded from, if exactly one.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MatchEntry {
    pub match_: Match,
    pub conjunctions: Vec<Conj>,
    pub annotation: Option<AddrSetAnnotation>,
}

impl MatchEntry {
    pub fn is_conjunctive(&self) -> bool {
        !self.conjunctions.is_empty()
    }
}

/// The expanded matches of one row on one datapath, deduplicated by
/// match. Identical matches from different conjunction groups coalesce
/// into one entry carrying several clauses.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct MatchSet {
    entries: IndexMap<Match, (Vec<Conj>, Option<AddrSetAnnotation>)>,
}

impl MatchSet {
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = MatchEntry> + '_ {
        self.entries.iter().map(|(m, (conjs, ann))| MatchEntry {
            match_: m.clone(),
            conjunctions: conjs.clone(),
            annotation: ann.clone(),
        })
    }

    /// Approximate heap footprint, for cache accounting.
    pub fn size_estimate(&self) -> usize {
        self.entries
            .iter()
            .map(|(m, (c, _))| {
                std::mem::size_of::<Match>()
                    + m.fields().count() * 24
                    + c.len() * std::mem::size_of::<Conj>()
            })
            .sum()
    }

    fn add(&mut self, match_: Match, conj: Option<Conj>, annotation: Option<AddrSetAnnotation>) {
        let entry = self.entries.entry(match_).or_insert((Vec::new(), None));
        match conj {
            Some(c) => {
                if !entry.0.contains(&c) {
                    entry.0.push(c);
                }
                // A match participating in more than one conjunction
                // cannot be attributed to a single address.
                if entry.0.len() > 1 {
                    entry.1 = None;
                } else if entry.1.is_none() {
                    entry.1 = annotation;
                }
            }
            None => {
                if entry.1.is_none() {
                    entry.1 = annotation;
                }
            }
        }
    }

    /// Drop entries not satisfying `keep`.
    pub fn retain(&mut self, mut keep: impl FnMut(&Match, &Option<AddrSetAnnotation>) -> bool) {
        self.entries.retain(|m, (_, ann)| keep(m, ann));
    }

    /// Rebase placeholder conjunction ids onto `[base, base + n)`.
    pub fn prepare(&mut self, base: u32) {
        let mut rebased: IndexMap<Match, (Vec<Conj>, Option<AddrSetAnnotation>)> =
            IndexMap::with_capacity(self.entries.len());
        for (mut m, (mut conjs, ann)) in std::mem::take(&mut self.entries) {
            for c in &mut conjs {
                c.id += base;
            }
            if let Some(fv) = m.get(MatchField::ConjId) {
                m.set(MatchField::ConjId, fv.value + base as u128);
            }
            rebased.insert(m, (conjs, ann));
        }
        self.entries = rebased;
    }
}

/// A resolved integer dimension of one conjunct.
struct Dim {
    field: MatchField,
    constants: Vec<(u128, u128, Option<AddrSetAnnotation>)>,
}

/// Expand a normalized expression into matches, resolving port names
/// through `resolver`. Returns the match set and the number of
/// conjunction groups introduced.
pub fn expr_to_matches(expr: &Expr, resolver: &mut dyn PortResolver) -> (MatchSet, u32) {
    let mut out = MatchSet::default();
    let mut n_conjs: u32 = 0;

    for conjunct in expr.conjuncts() {
        expand_conjunct(&conjunct, resolver, &mut out, &mut n_conjs);
    }
    (out, n_conjs)
}

fn expand_conjunct(
    cmps: &[&Cmp],
    resolver: &mut dyn PortResolver,
    out: &mut MatchSet,
    n_conjs: &mut u32,
) {
    let mut base = Match::new();
    let mut base_anns: Vec<AddrSetAnnotation> = Vec::new();
    let mut dims: Vec<Dim> = Vec::new();

    for cmp in cmps {
        let (field, constants) = match resolve_cmp(cmp, resolver) {
            Some(rc) => rc,
            // A port comparison with no resolvable name: nothing to
            // emit for this conjunct, the recorded references will
            // bring the row back when the port appears.
            None => return,
        };
        match constants.len() {
            0 => return,
            1 => {
                let (value, mask, ann) = constants.into_iter().next().unwrap();
                if mask != 0 && !base.try_constrain(field, value, mask) {
                    debug!("contradictory constraints on {field:?}, dropping conjunct");
                    return;
                }
                if let Some(ann) = ann {
                    base_anns.push(ann);
                }
            }
            _ => dims.push(Dim { field, constants }),
        }
    }

    let base_ann = match &base_anns[..] {
        [one] => Some(one.clone()),
        _ => None,
    };

    match dims.len() {
        0 => out.add(base, None, base_ann),
        1 => {
            let dim = dims.pop().unwrap();
            for (value, mask, ann) in dim.constants {
                let mut m = base.clone();
                if mask != 0 && !m.try_constrain(dim.field, value, mask) {
                    continue;
                }
                out.add(m, None, ann);
            }
        }
        k => {
            let conj_idx = *n_conjs;
            *n_conjs += 1;
            // The parent flow matches only the conjunction id; the
            // caller stamps the datapath metadata onto it like any
            // other match.
            let mut parent = Match::new();
            parent.set(MatchField::ConjId, conj_idx as u128);
            out.add(parent, None, None);

            for (clause, dim) in dims.into_iter().enumerate() {
                for (value, mask, ann) in dim.constants {
                    let mut m = base.clone();
                    if mask != 0 && !m.try_constrain(dim.field, value, mask) {
                        continue;
                    }
                    out.add(
                        m,
                        Some(Conj {
                            id: conj_idx,
                            clause: clause as u8,
                            n_clauses: k as u8,
                        }),
                        ann,
                    );
                }
            }
        }
    }
}

/// Resolve one comparison into a physical field and concrete constants.
/// Returns `None` when a port dimension lost all of its constants to
/// failed lookups.
fn resolve_cmp(
    cmp: &Cmp,
    resolver: &mut dyn PortResolver,
) -> Option<(MatchField, Vec<(u128, u128, Option<AddrSetAnnotation>)>)> {
    match cmp.field {
        FieldRef::Int { field, width } => {
            let wmask = field_width_mask(width);
            let constants = cmp
                .constants
                .iter()
                .filter_map(|c| match c {
                    CmpConst::Int {
                        value,
                        mask,
                        as_name,
                    } => {
                        let mask = mask.unwrap_or(wmask);
                        let ann = as_name.as_ref().map(|set| AddrSetAnnotation {
                            set: set.clone(),
                            ip: *value,
                            mask,
                        });
                        Some((*value & mask, mask, ann))
                    }
                    CmpConst::Str(_) => None,
                })
                .collect();
            Some((field, constants))
        }
        FieldRef::Port(dir) => {
            let mut constants = Vec::new();
            let mut any_resolved = false;
            for c in &cmp.constants {
                if let CmpConst::Str(name) = c {
                    if let Some(key) = resolver.lookup_port(name) {
                        any_resolved = true;
                        constants.push((key as u128, u32::MAX as u128, None));
                    }
                }
            }
            if !any_resolved {
                return None;
            }
            Some((dir.field(), constants))
        }
    }
}

fn field_width_mask(width: u32) -> u128 {
    if width == 128 {
        u128::MAX
    } else {
        (1u128 << width) - 1
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parse::parse_match;
    use crate::symtab::symtab;
    use crate::{AddrSetLookup, NoSets, PortGroupLookup};
    use std::collections::HashMap;
    use switchboard_data::AddrConstant;

    struct Ports(HashMap<String, u32>);

    impl PortResolver for Ports {
        fn lookup_port(&mut self, name: &str) -> Option<u32> {
            self.0.get(name).copied()
        }
    }

    struct Sets(HashMap<String, Vec<AddrConstant>>);

    impl AddrSetLookup for Sets {
        fn addr_set(&self, name: &str) -> Option<&[AddrConstant]> {
            self.0.get(name).map(Vec::as_slice)
        }
    }

    impl PortGroupLookup for Sets {
        fn port_group(&self, _: &str) -> Option<&[String]> {
            None
        }
    }

    fn expand(text: &str) -> (MatchSet, u32) {
        expand_with(text, &Sets(HashMap::new()), &mut Ports(HashMap::new()))
    }

    fn expand_with(text: &str, sets: &Sets, ports: &mut Ports) -> (MatchSet, u32) {
        let parsed = parse_match(text, symtab(), sets, &NoSets).unwrap();
        let normalized = parsed.expr.normalize();
        expr_to_matches(&normalized, ports)
    }

    #[test]
    fn single_set_expands_per_constant() {
        let (ms, n) = expand("ip4.src == {10.0.0.1, 10.0.0.2}");
        assert_eq!(n, 0);
        assert_eq!(ms.len(), 2);
        for e in ms.iter() {
            assert!(e.conjunctions.is_empty());
            assert_eq!(e.match_.exact_value(MatchField::EthType), Some(0x800));
        }
    }

    #[test]
    fn two_multivalue_dimensions_become_a_conjunction() {
        let (ms, n) = expand("ip4.src == {10.0.0.1, 10.0.0.2} && tcp.dst == {80, 443}");
        assert_eq!(n, 1);
        // 2 src clauses + 2 dst clauses + 1 conj-id parent.
        assert_eq!(ms.len(), 5);
        let parents: Vec<_> = ms
            .iter()
            .filter(|e| e.match_.get(MatchField::ConjId).is_some())
            .collect();
        assert_eq!(parents.len(), 1);
        assert!(parents[0].conjunctions.is_empty());
        let clauses: Vec<_> = ms.iter().filter(|e| e.is_conjunctive()).collect();
        assert_eq!(clauses.len(), 4);
        assert!(clauses.iter().all(|c| c.conjunctions[0].n_clauses == 2));
    }

    #[test]
    fn addr_set_constants_annotate_matches() {
        let sets = Sets(HashMap::from([(
            "as1".to_string(),
            vec![
                AddrConstant::parse("1.1.1.1").unwrap(),
                AddrConstant::parse("1.1.1.2").unwrap(),
            ],
        )]));
        let (ms, _) = expand_with("ip4.src == $as1", &sets, &mut Ports(HashMap::new()));
        let annotated: Vec<_> = ms.iter().filter(|e| e.annotation.is_some()).collect();
        assert_eq!(annotated.len(), 2);
        assert!(annotated
            .iter()
            .all(|e| e.annotation.as_ref().unwrap().set == "as1"));
    }

    #[test]
    fn unresolved_port_drops_conjunct() {
        let mut ports = Ports(HashMap::new());
        let (ms, _) = expand_with(
            r#"inport == "p1" && ip4.src == 10.0.0.1"#,
            &Sets(HashMap::new()),
            &mut ports,
        );
        assert!(ms.is_empty());

        let mut ports = Ports(HashMap::from([("p1".to_string(), 7)]));
        let (ms, _) = expand_with(
            r#"inport == "p1" && ip4.src == 10.0.0.1"#,
            &Sets(HashMap::new()),
            &mut ports,
        );
        assert_eq!(ms.len(), 1);
        let entry = ms.iter().next().unwrap();
        assert_eq!(entry.match_.exact_value(MatchField::LogInport), Some(7));
    }

    #[test]
    fn prepare_rebases_placeholder_ids() {
        let (mut ms, n) = expand("ip4.src == {10.0.0.1, 10.0.0.2} && tcp.dst == {80, 443}");
        assert_eq!(n, 1);
        ms.prepare(41);
        let parent = ms
            .iter()
            .find(|e| e.match_.get(MatchField::ConjId).is_some())
            .unwrap();
        assert_eq!(parent.match_.exact_value(MatchField::ConjId), Some(41));
        for clause in ms.iter().filter(|e| e.is_conjunctive()) {
            assert_eq!(clause.conjunctions[0].id, 41);
        }
    }
}

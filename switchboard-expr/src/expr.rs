//! The expression tree and its rewrite passes.
//!
//! Lifecycle of a parsed match:
//!
//! 1. parse (see [`crate::parse`]) — symbols resolved, prerequisites
//!    ANDed in, address sets and port groups expanded to constants;
//! 2. [`Expr::simplify`] — boolean folding and flattening;
//! 3. [`Expr::evaluate_condition`] — `is_chassis_resident()` leaves
//!    become booleans;
//! 4. [`Expr::normalize`] — `!=` and relational comparisons rewritten
//!    into `==`-form prefix matches, the tree distributed into a
//!    disjunction of conjunctions, and same-field comparisons crushed;
//! 5. match expansion (see [`crate::matches`]).

use switchboard_flow::MatchField;

use crate::ResidenceOracle;

/// Relational operator of a comparison.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RelOp {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
}

impl RelOp {
    pub fn negated(self) -> RelOp {
        match self {
            RelOp::Eq => RelOp::Ne,
            RelOp::Ne => RelOp::Eq,
            RelOp::Lt => RelOp::Ge,
            RelOp::Ge => RelOp::Lt,
            RelOp::Le => RelOp::Gt,
            RelOp::Gt => RelOp::Le,
        }
    }
}

/// Which logical port register a port comparison resolves to.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PortDir {
    In,
    Out,
}

impl PortDir {
    pub fn field(self) -> MatchField {
        match self {
            PortDir::In => MatchField::LogInport,
            PortDir::Out => MatchField::LogOutport,
        }
    }
}

/// The field side of a comparison.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FieldRef {
    Int { field: MatchField, width: u32 },
    Port(PortDir),
}

/// One constant of a comparison.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum CmpConst {
    Int {
        value: u128,
        /// `None` means the field's exact mask.
        mask: Option<u128>,
        /// Name of the address set this constant came from.
        as_name: Option<String>,
    },
    /// A port name, resolved at expansion time.
    Str(String),
}

/// A comparison of a field against one or more constants. Multiple
/// constants under `==` mean "any of them".
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Cmp {
    pub field: FieldRef,
    pub relop: RelOp,
    pub constants: Vec<CmpConst>,
}

/// An `is_chassis_resident("port")` leaf, evaluated against the runtime
/// state before normalization.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Condition {
    pub port: String,
    pub negated: bool,
}

/// A match expression.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Expr {
    Boolean(bool),
    Cmp(Cmp),
    Condition(Condition),
    And(Vec<Expr>),
    Or(Vec<Expr>),
}

impl Expr {
    /// Logical negation, pushed down to the leaves.
    pub fn negate(self) -> Expr {
        match self {
            Expr::Boolean(b) => Expr::Boolean(!b),
            Expr::Cmp(mut cmp) => {
                cmp.relop = cmp.relop.negated();
                Expr::Cmp(cmp)
            }
            Expr::Condition(mut c) => {
                c.negated = !c.negated;
                Expr::Condition(c)
            }
            Expr::And(terms) => Expr::Or(terms.into_iter().map(Expr::negate).collect()),
            Expr::Or(terms) => Expr::And(terms.into_iter().map(Expr::negate).collect()),
        }
    }

    /// Boolean folding and flattening.
    pub fn simplify(self) -> Expr {
        match self {
            Expr::And(terms) => {
                let mut out = Vec::new();
                for t in terms {
                    match t.simplify() {
                        Expr::Boolean(false) => return Expr::Boolean(false),
                        Expr::Boolean(true) => {}
                        Expr::And(inner) => out.extend(inner),
                        other => out.push(other),
                    }
                }
                match out.len() {
                    0 => Expr::Boolean(true),
                    1 => out.pop().unwrap(),
                    _ => Expr::And(out),
                }
            }
            Expr::Or(terms) => {
                let mut out = Vec::new();
                for t in terms {
                    match t.simplify() {
                        Expr::Boolean(true) => return Expr::Boolean(true),
                        Expr::Boolean(false) => {}
                        Expr::Or(inner) => out.extend(inner),
                        other => out.push(other),
                    }
                }
                match out.len() {
                    0 => Expr::Boolean(false),
                    1 => out.pop().unwrap(),
                    _ => Expr::Or(out),
                }
            }
            Expr::Cmp(cmp) if cmp.constants.is_empty() => {
                // An empty constant set matches nothing; its negation
                // matches everything.
                Expr::Boolean(cmp.relop == RelOp::Ne)
            }
            other => other,
        }
    }

    /// Replace every condition leaf with its boolean value, recording
    /// references through the oracle, then re-simplify.
    pub fn evaluate_condition(self, oracle: &mut dyn ResidenceOracle) -> Expr {
        fn walk(expr: Expr, oracle: &mut dyn ResidenceOracle) -> Expr {
            match expr {
                Expr::Condition(c) => {
                    Expr::Boolean(oracle.is_chassis_resident(&c.port) != c.negated)
                }
                Expr::And(terms) => {
                    Expr::And(terms.into_iter().map(|t| walk(t, oracle)).collect())
                }
                Expr::Or(terms) => Expr::Or(terms.into_iter().map(|t| walk(t, oracle)).collect()),
                other => other,
            }
        }
        walk(self, oracle).simplify()
    }

    /// Rewrite into a disjunction of conjunctions of `==`-form
    /// comparisons.
    ///
    /// Condition leaves must have been evaluated first.
    pub fn normalize(self) -> Expr {
        let rewritten = rewrite_relops(self).simplify();
        let dnf = to_dnf(rewritten);
        crush(dnf).simplify()
    }

    /// Approximate heap footprint, for cache accounting.
    pub fn size_estimate(&self) -> usize {
        let node = std::mem::size_of::<Expr>();
        match self {
            Expr::Boolean(_) => node,
            Expr::Condition(c) => node + c.port.len(),
            Expr::Cmp(c) => {
                node + c.constants.len() * std::mem::size_of::<CmpConst>()
            }
            Expr::And(terms) | Expr::Or(terms) => {
                node + terms.iter().map(Expr::size_estimate).sum::<usize>()
            }
        }
    }

    /// The disjuncts of a normalized expression.
    pub fn conjuncts(&self) -> Vec<Vec<&Cmp>> {
        match self {
            Expr::Boolean(false) => vec![],
            // A tautology is one unconstrained conjunct.
            Expr::Boolean(true) => vec![vec![]],
            Expr::Cmp(c) => vec![vec![c]],
            Expr::Condition(_) => {
                unreachable!("conjuncts() requires Condition leaves to have been evaluated first")
            }
            Expr::And(terms) => {
                vec![terms
                    .iter()
                    .filter_map(|t| match t {
                        Expr::Cmp(c) => Some(c),
                        _ => None,
                    })
                    .collect()]
            }
            Expr::Or(terms) => terms
                .iter()
                .flat_map(|t| t.conjuncts())
                .collect(),
        }
    }
}

/// Rewrite `!=` and relational comparisons into `==`-form comparisons
/// over masked prefixes.
fn rewrite_relops(expr: Expr) -> Expr {
    match expr {
        Expr::And(terms) => Expr::And(terms.into_iter().map(rewrite_relops).collect()),
        Expr::Or(terms) => Expr::Or(terms.into_iter().map(rewrite_relops).collect()),
        Expr::Cmp(cmp) => rewrite_cmp(cmp),
        other => other,
    }
}

fn rewrite_cmp(cmp: Cmp) -> Expr {
    let width = match cmp.field {
        FieldRef::Int { width, .. } => width,
        // Port comparisons only support equality; the parser enforces
        // it, and `!=` on ports is rejected there too.
        FieldRef::Port(_) => return Expr::Cmp(cmp),
    };
    match cmp.relop {
        RelOp::Eq => Expr::Cmp(cmp),
        RelOp::Ne => {
            // x != {a, b} == (x != a) && (x != b); each single
            // inequality is the disjunction of its differing bits.
            let mut terms = Vec::new();
            for c in &cmp.constants {
                let CmpConst::Int { value, mask, .. } = c else {
                    continue;
                };
                let mask = mask.unwrap_or_else(|| width_mask(width));
                let mut bits = Vec::new();
                for b in 0..width {
                    let bit = 1u128 << b;
                    if mask & bit != 0 {
                        bits.push(Expr::Cmp(Cmp {
                            field: cmp.field,
                            relop: RelOp::Eq,
                            constants: vec![CmpConst::Int {
                                value: !value & bit,
                                mask: Some(bit),
                                as_name: None,
                            }],
                        }));
                    }
                }
                terms.push(Expr::Or(bits));
            }
            Expr::And(terms)
        }
        RelOp::Lt | RelOp::Le | RelOp::Gt | RelOp::Ge => {
            let Some(CmpConst::Int { value, mask: None, .. }) = cmp.constants.first() else {
                return Expr::Boolean(false);
            };
            let value = *value;
            let max = width_mask(width);
            let masks = match cmp.relop {
                RelOp::Lt => lt_prefixes(width, value),
                RelOp::Le if value >= max => vec![(0, 0)],
                RelOp::Le => lt_prefixes(width, value + 1),
                RelOp::Ge => ge_prefixes(width, value),
                RelOp::Gt if value >= max => vec![],
                RelOp::Gt => ge_prefixes(width, value + 1),
                _ => unreachable!(),
            };
            Expr::Or(
                masks
                    .into_iter()
                    .map(|(v, m)| {
                        Expr::Cmp(Cmp {
                            field: cmp.field,
                            relop: RelOp::Eq,
                            constants: vec![CmpConst::Int {
                                value: v,
                                mask: Some(m),
                                as_name: None,
                            }],
                        })
                    })
                    .collect(),
            )
        }
    }
}

fn width_mask(width: u32) -> u128 {
    if width == 128 {
        u128::MAX
    } else {
        (1u128 << width) - 1
    }
}

/// Prefix matches covering `[0, c)`.
fn lt_prefixes(width: u32, c: u128) -> Vec<(u128, u128)> {
    let mut out = Vec::new();
    if c > width_mask(width) {
        // Everything matches.
        out.push((0, 0));
        return out;
    }
    for b in (0..width).rev() {
        let bit = 1u128 << b;
        if c & bit != 0 {
            let above = !(bit | (bit - 1));
            out.push((c & above, (above | bit) & width_mask(width)));
        }
    }
    out
}

/// Prefix matches covering `[c, 2^width)`.
fn ge_prefixes(width: u32, c: u128) -> Vec<(u128, u128)> {
    let mut out = Vec::new();
    if c == 0 {
        out.push((0, 0));
        return out;
    }
    if c > width_mask(width) {
        return out;
    }
    for b in (0..width).rev() {
        let bit = 1u128 << b;
        if c & bit == 0 {
            let above = !(bit | (bit - 1));
            out.push(((c & above) | bit, (above | bit) & width_mask(width)));
        }
    }
    // The exact value itself.
    out.push((c, width_mask(width)));
    out
}

/// Distribute conjunctions over disjunctions. The result is an `Or`
/// whose disjuncts are flat `And`s of leaves (or bare leaves).
fn to_dnf(expr: Expr) -> Expr {
    match expr {
        Expr::And(terms) => {
            // Cartesian product of the disjuncts of every term.
            let mut disjuncts: Vec<Vec<Expr>> = vec![vec![]];
            for term in terms {
                let options = dnf_options(to_dnf(term));
                let mut next = Vec::with_capacity(disjuncts.len() * options.len());
                for d in &disjuncts {
                    for o in &options {
                        let mut combined = d.clone();
                        match o {
                            Expr::And(inner) => combined.extend(inner.iter().cloned()),
                            other => combined.push(other.clone()),
                        }
                        next.push(combined);
                    }
                }
                disjuncts = next;
            }
            Expr::Or(disjuncts.into_iter().map(Expr::And).collect())
        }
        Expr::Or(terms) => Expr::Or(terms.into_iter().map(to_dnf).collect()),
        other => other,
    }
}

/// The disjunct list of a DNF-converted expression, with nested `Or`s
/// flattened away.
fn dnf_options(e: Expr) -> Vec<Expr> {
    match e {
        Expr::Or(terms) => terms.into_iter().flat_map(dnf_options).collect(),
        other => vec![other],
    }
}

/// Within each conjunct, merge comparisons on the same field.
fn crush(expr: Expr) -> Expr {
    match expr {
        Expr::Or(terms) => Expr::Or(terms.into_iter().map(crush).collect()),
        Expr::And(terms) => crush_conjunct(terms),
        other => other,
    }
}

fn crush_conjunct(terms: Vec<Expr>) -> Expr {
    let mut singles: Vec<Cmp> = Vec::new();
    let mut multis: Vec<Cmp> = Vec::new();
    for t in terms {
        match t {
            Expr::Boolean(false) => return Expr::Boolean(false),
            Expr::Boolean(true) => {}
            Expr::Cmp(c) if c.constants.is_empty() => return Expr::Boolean(false),
            Expr::Cmp(c) if c.constants.len() == 1 => singles.push(c),
            Expr::Cmp(c) => multis.push(c),
            // Nested structure can only appear if normalization was
            // skipped; keep it untouched.
            other => {
                let mut rest: Vec<Expr> = singles.into_iter().map(Expr::Cmp).collect();
                rest.extend(multis.into_iter().map(Expr::Cmp));
                rest.push(other);
                return Expr::And(rest);
            }
        }
    }

    // Merge single-constant comparisons per field.
    let mut merged: Vec<Cmp> = Vec::new();
    'next: for c in singles {
        let (value, mask, as_name) = match &c.constants[0] {
            CmpConst::Int { value, mask, as_name } => {
                let m = mask.unwrap_or(match c.field {
                    FieldRef::Int { width, .. } => width_mask(width),
                    FieldRef::Port(_) => u32::MAX as u128,
                });
                (*value & m, m, as_name.clone())
            }
            CmpConst::Str(_) => {
                merged.push(c);
                continue;
            }
        };
        for m in &mut merged {
            if m.field == c.field {
                let full = match m.field {
                    FieldRef::Int { width, .. } => width_mask(width),
                    FieldRef::Port(_) => u32::MAX as u128,
                };
                if let [CmpConst::Int {
                    value: mv,
                    mask: mmask,
                    as_name: man,
                }] = &mut m.constants[..]
                {
                    let mm = mmask.unwrap_or(full);
                    let overlap = mm & mask;
                    if (*mv ^ value) & overlap != 0 {
                        return Expr::Boolean(false);
                    }
                    *mv = (*mv & mm) | (value & mask);
                    let combined = mm | mask;
                    // Keep the canonical exact-match form maskless.
                    *mmask = (combined != full).then_some(combined);
                    if man.is_none() {
                        *man = as_name.clone();
                    }
                    continue 'next;
                }
            }
        }
        merged.push(c);
    }

    // Intersect multi-constant sets on the same field.
    let mut sets: Vec<Cmp> = Vec::new();
    'next_multi: for c in multis {
        for existing in &mut sets {
            if existing.field == c.field {
                existing
                    .constants
                    .retain(|e| c.constants.iter().any(|n| consts_equal(e, n)));
                if existing.constants.is_empty() {
                    return Expr::Boolean(false);
                }
                continue 'next_multi;
            }
        }
        sets.push(c);
    }

    let mut out: Vec<Expr> = merged.into_iter().map(Expr::Cmp).collect();
    out.extend(sets.into_iter().map(Expr::Cmp));
    match out.len() {
        0 => Expr::Boolean(true),
        1 => out.pop().unwrap(),
        _ => Expr::And(out),
    }
}

fn consts_equal(a: &CmpConst, b: &CmpConst) -> bool {
    match (a, b) {
        (
            CmpConst::Int {
                value: va, mask: ma, ..
            },
            CmpConst::Int {
                value: vb, mask: mb, ..
            },
        ) => va == vb && ma == mb,
        (CmpConst::Str(a), CmpConst::Str(b)) => a == b,
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cmp(field: MatchField, width: u32, relop: RelOp, values: &[u128]) -> Expr {
        Expr::Cmp(Cmp {
            field: FieldRef::Int { field, width },
            relop,
            constants: values
                .iter()
                .map(|v| CmpConst::Int {
                    value: *v,
                    mask: None,
                    as_name: None,
                })
                .collect(),
        })
    }

    #[test]
    fn simplify_folds_booleans() {
        let e = Expr::And(vec![
            Expr::Boolean(true),
            cmp(MatchField::EthType, 16, RelOp::Eq, &[0x800]),
        ]);
        assert_eq!(
            e.simplify(),
            cmp(MatchField::EthType, 16, RelOp::Eq, &[0x800])
        );

        let e = Expr::And(vec![Expr::Boolean(false), Expr::Boolean(true)]);
        assert_eq!(e.simplify(), Expr::Boolean(false));

        let e = Expr::Or(vec![Expr::Boolean(false)]);
        assert_eq!(e.simplify(), Expr::Boolean(false));
    }

    #[test]
    fn lt_prefixes_cover_exactly() {
        // width 4, c = 5: [0,5) = 0xxx (0-3) plus 010x (4-5)? No:
        // prefixes are 0xxx [0,8) minus... enumerate to be sure.
        for c in 0..16u128 {
            let masks = lt_prefixes(4, c);
            for x in 0..16u128 {
                let matched = masks.iter().any(|(v, m)| x & m == v & m);
                assert_eq!(matched, x < c, "x={x} c={c}");
            }
        }
    }

    #[test]
    fn ge_prefixes_cover_exactly() {
        for c in 0..16u128 {
            let masks = ge_prefixes(4, c);
            for x in 0..16u128 {
                let matched = masks.iter().any(|(v, m)| x & m == v & m);
                assert_eq!(matched, x >= c, "x={x} c={c}");
            }
        }
    }

    #[test]
    fn ne_expands_to_differing_bits() {
        let e = cmp(MatchField::IpProto, 8, RelOp::Ne, &[6]);
        let n = rewrite_relops(e).simplify();
        // A packet with proto 6 matches no disjunct; any other value
        // matches at least one.
        let matches_value = |n: &Expr, x: u128| -> bool {
            match n {
                Expr::Or(terms) => terms.iter().any(|t| match t {
                    Expr::Cmp(c) => match &c.constants[0] {
                        CmpConst::Int { value, mask, .. } => {
                            x & mask.unwrap() == *value & mask.unwrap()
                        }
                        _ => false,
                    },
                    _ => false,
                }),
                _ => false,
            }
        };
        assert!(!matches_value(&n, 6));
        for x in [0u128, 1, 5, 7, 255] {
            assert!(matches_value(&n, x), "x={x}");
        }
    }

    #[test]
    fn crush_merges_and_detects_contradictions() {
        let e = Expr::And(vec![
            cmp(MatchField::EthType, 16, RelOp::Eq, &[0x800]),
            cmp(MatchField::EthType, 16, RelOp::Eq, &[0x800]),
        ]);
        assert_eq!(
            e.normalize(),
            cmp(MatchField::EthType, 16, RelOp::Eq, &[0x800])
        );

        let e = Expr::And(vec![
            cmp(MatchField::EthType, 16, RelOp::Eq, &[0x800]),
            cmp(MatchField::EthType, 16, RelOp::Eq, &[0x806]),
        ]);
        assert_eq!(e.normalize(), Expr::Boolean(false));
    }

    #[test]
    fn nested_disjunctions_distribute_fully() {
        // a && ((b && c) || d)  →  (a && b && c) || (a && d)
        let a = cmp(MatchField::EthType, 16, RelOp::Eq, &[0x800]);
        let b = cmp(MatchField::IpProto, 8, RelOp::Eq, &[6]);
        let c = cmp(MatchField::TpDst, 16, RelOp::Eq, &[80]);
        let d = cmp(MatchField::NwTtl, 8, RelOp::Eq, &[1]);
        let e = Expr::And(vec![a, Expr::Or(vec![Expr::And(vec![b, c]), d])]).normalize();
        let conjuncts = e.conjuncts();
        assert_eq!(conjuncts.len(), 2);
        let mut sizes: Vec<usize> = conjuncts.iter().map(Vec::len).collect();
        sizes.sort();
        assert_eq!(sizes, vec![2, 3]);
    }

    #[test]
    fn dnf_distributes() {
        // (a || b) && c  →  (a && c) || (b && c)
        let a = cmp(MatchField::EthType, 16, RelOp::Eq, &[0x800]);
        let b = cmp(MatchField::EthType, 16, RelOp::Eq, &[0x86dd]);
        let c = cmp(MatchField::IpProto, 8, RelOp::Eq, &[6]);
        let e = Expr::And(vec![Expr::Or(vec![a, b]), c]).normalize();
        match e {
            Expr::Or(terms) => assert_eq!(terms.len(), 2),
            other => panic!("expected Or, got {other:?}"),
        }
    }
}

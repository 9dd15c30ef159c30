//! Matches and actions over physical fields.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

/// A physical field a flow can match on or an action can write to.
///
/// Logical registers get named variants (the logical input/output port
/// registers, the flags register); plain numbered registers use
/// [`MatchField::Reg`]/[`MatchField::Xxreg`].
#[derive(
    Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub enum MatchField {
    /// Datapath tunnel key.
    Metadata,
    EthSrc,
    EthDst,
    EthType,
    IpProto,
    NwTtl,
    Ip4Src,
    Ip4Dst,
    Ip6Src,
    Ip6Dst,
    TpSrc,
    TpDst,
    IcmpType,
    IcmpCode,
    ArpOp,
    ArpSha,
    ArpTha,
    ArpSpa,
    NdTarget,
    CtState,
    CtMark,
    CtLabel,
    CtNwDst,
    CtIp6Dst,
    CtNwProto,
    CtTpDst,
    /// Logical input port register (reg14).
    LogInport,
    /// Logical output port register (reg15).
    LogOutport,
    /// Logical flags register (reg10).
    LogFlags,
    /// A 32-bit register.
    Reg(u8),
    /// A 128-bit register.
    Xxreg(u8),
    /// The conjunction id a flow's clauses resolve to.
    ConjId,
}

impl MatchField {
    /// Field width in bits.
    pub fn width(self) -> u32 {
        use MatchField::*;
        match self {
            Metadata => 64,
            EthSrc | EthDst | ArpSha | ArpTha => 48,
            EthType | TpSrc | TpDst | CtTpDst | ArpOp => 16,
            IpProto | NwTtl | IcmpType | IcmpCode | CtNwProto => 8,
            Ip4Src | Ip4Dst | ArpSpa | CtNwDst => 32,
            Ip6Src | Ip6Dst | NdTarget | CtIp6Dst | CtLabel | Xxreg(_) => 128,
            CtState | CtMark | LogInport | LogOutport | LogFlags | Reg(_) | ConjId => 32,
        }
    }

    pub fn exact_mask(self) -> u128 {
        let w = self.width();
        if w == 128 {
            u128::MAX
        } else {
            (1u128 << w) - 1
        }
    }
}

/// A value/mask pair for one field.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct FieldValue {
    pub value: u128,
    pub mask: u128,
}

impl fmt::Debug for FieldValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}/{:#x}", self.value, self.mask)
    }
}

/// A concrete match: a conjunction of field/value/mask constraints.
///
/// The field map is ordered so matches have a canonical form and can be
/// used as staging-table keys.
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
pub struct Match {
    fields: BTreeMap<MatchField, FieldValue>,
}

impl Match {
    pub fn new() -> Self {
        Self::default()
    }

    /// Exact-match `field` against `value`.
    pub fn set(&mut self, field: MatchField, value: u128) -> &mut Self {
        self.fields.insert(
            field,
            FieldValue {
                value: value & field.exact_mask(),
                mask: field.exact_mask(),
            },
        );
        self
    }

    pub fn set_masked(&mut self, field: MatchField, value: u128, mask: u128) -> &mut Self {
        self.fields.insert(
            field,
            FieldValue {
                value: value & mask,
                mask,
            },
        );
        self
    }

    pub fn unset(&mut self, field: MatchField) -> &mut Self {
        self.fields.remove(&field);
        self
    }

    pub fn get(&self, field: MatchField) -> Option<FieldValue> {
        self.fields.get(&field).copied()
    }

    /// The exact-matched value of `field`, if any.
    pub fn exact_value(&self, field: MatchField) -> Option<u128> {
        self.fields
            .get(&field)
            .filter(|fv| fv.mask == field.exact_mask())
            .map(|fv| fv.value)
    }

    pub fn fields(&self) -> impl Iterator<Item = (MatchField, FieldValue)> + '_ {
        self.fields.iter().map(|(f, v)| (*f, *v))
    }

    pub fn is_catchall(&self) -> bool {
        self.fields.is_empty()
    }

    /// Merge another constraint on `field` into this match: the masks
    /// union, the values must agree where the masks overlap. Returns
    /// `false` (leaving the match unchanged) on disagreement.
    pub fn try_constrain(&mut self, field: MatchField, value: u128, mask: u128) -> bool {
        match self.fields.get_mut(&field) {
            None => {
                self.set_masked(field, value, mask);
                true
            }
            Some(fv) => {
                let overlap = fv.mask & mask;
                if (fv.value ^ value) & overlap != 0 {
                    return false;
                }
                fv.value = (fv.value & fv.mask) | (value & mask);
                fv.mask |= mask;
                true
            }
        }
    }
}

impl fmt::Debug for Match {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut d = f.debug_map();
        for (field, fv) in &self.fields {
            d.entry(field, fv);
        }
        d.finish()
    }
}

/// Provenance annotation for matches expanded from one address-set
/// element, used by the address-set delta path to remove exactly the
/// flows one deleted element produced.
#[derive(Clone, PartialEq, Eq, Hash, Debug, Serialize, Deserialize)]
pub struct AddrSetAnnotation {
    pub set: String,
    pub ip: u128,
    pub mask: u128,
}

/// One field learnt into a reply-direction flow: either copied from the
/// triggering packet or an immediate.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum LearnMatch {
    Field { dst: MatchField, src: MatchField },
    Immediate { dst: MatchField, value: u128 },
}

/// A flow action.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FlowAction {
    /// Write `value` into `n_bits` bits of `field` starting at `ofs`.
    Load {
        field: MatchField,
        ofs: u8,
        n_bits: u8,
        value: u128,
    },
    /// Continue processing in `table`.
    Resubmit { table: u8 },
    /// Punt to the controller, optionally through a meter.
    Controller { meter: Option<u32> },
    /// One clause of an n-dimensional conjunctive match.
    Conjunction { id: u32, clause: u8, n_clauses: u8 },
    /// Install a reply-direction flow in `table` on first hit.
    Learn {
        table: u8,
        cookie: u32,
        matches: Vec<LearnMatch>,
        /// `(field, bit offset, value)` loads applied by the learnt
        /// flow.
        load: Vec<(MatchField, u8, u128)>,
    },
    /// `ct(commit, zone=<common NAT zone>, nat(src=addr))`.
    CtSnat { v6: bool, addr: u128 },
    /// Recirculate through conntrack NAT in the common NAT zone. The
    /// zone is the DNAT one unless the datapath prefers its SNAT zone.
    CtNat { snat_zone: bool },
}

impl FlowAction {
    /// Load a single flag bit in the logical flags register.
    pub fn set_flag(bit: u8) -> Self {
        FlowAction::Load {
            field: MatchField::LogFlags,
            ofs: bit,
            n_bits: 1,
            value: 1,
        }
    }

    pub fn clear_flag(bit: u8) -> Self {
        FlowAction::Load {
            field: MatchField::LogFlags,
            ofs: bit,
            n_bits: 1,
            value: 0,
        }
    }

    pub fn is_conjunction(&self) -> bool {
        matches!(self, FlowAction::Conjunction { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn constrain_merges_masks_and_detects_conflicts() {
        let mut m = Match::new();
        assert!(m.try_constrain(MatchField::Ip4Src, 0x0a000000, 0xff000000));
        assert!(m.try_constrain(MatchField::Ip4Src, 0x0a000001, 0xffffffff));
        assert_eq!(m.exact_value(MatchField::Ip4Src), Some(0x0a000001));
        // 11.x disagrees with the 10.x prefix already pinned.
        assert!(!m.try_constrain(MatchField::Ip4Src, 0x0b000001, 0xffffffff));
        assert_eq!(m.exact_value(MatchField::Ip4Src), Some(0x0a000001));
    }

    #[test]
    fn matches_order_canonically() {
        let mut a = Match::new();
        a.set(MatchField::EthType, 0x800);
        a.set(MatchField::Metadata, 3);
        let mut b = Match::new();
        b.set(MatchField::Metadata, 3);
        b.set(MatchField::EthType, 0x800);
        assert_eq!(a, b);
    }
}

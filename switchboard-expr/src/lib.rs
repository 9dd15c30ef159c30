//! The match-expression and action-program collaborator.
//!
//! Rows carry their match as text in a small declarative language:
//! comparisons of symbolic fields against constants or constant sets,
//! `$name` address-set and `@name` port-group references, boolean
//! connectives, and the `is_chassis_resident()` condition. This crate
//! parses that language against an immutable symbol table, simplifies
//! and normalizes the resulting tree, and expands it into concrete
//! matches — introducing conjunction groups where a conjunct constrains
//! more than one multi-valued dimension.
//!
//! It also hosts the action-program side: parsing a row's action text
//! (validated against the DHCP/ND-RA/controller-event option bags) and
//! encoding it into concrete flow actions.

pub mod actions;
pub mod expr;
pub mod lex;
pub mod matches;
pub mod parse;
pub mod symtab;

use switchboard_data::{AddrConstant, Snapshot};

pub use actions::{parse_actions, ActionError, ActionOp, ActionProgram, EncodeParams};
pub use expr::{Cmp, CmpConst, Condition, Expr, FieldRef, PortDir, RelOp};
pub use matches::{expr_to_matches, Conj, MatchEntry, MatchSet};
pub use parse::{parse_match, ParseResult};
pub use symtab::{symtab, SymbolTable};

use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ExprError {
    #[error("syntax error at `{0}`")]
    Syntax(String),
    #[error("unknown symbol `{0}`")]
    UnknownSymbol(String),
    #[error("constant {value:#x} too wide for {width}-bit field")]
    ConstantTooWide { value: u128, width: u32 },
    #[error("string constant applied to numeric field")]
    StringOnNumericField,
    #[error("numeric constant applied to port field")]
    NumericOnPortField,
    #[error("relational comparison needs exactly one unmasked constant")]
    BadRelational,
    #[error("masked constant only valid with == or !=")]
    MaskedRelational,
}

/// Read access to the named address sets a match may reference.
///
/// The address-set delta path substitutes a fake set for one name during
/// re-translation; [`AddrSetOverride`] layers that substitution over any
/// base lookup without mutating it.
pub trait AddrSetLookup {
    fn addr_set(&self, name: &str) -> Option<&[AddrConstant]>;
}

/// Read access to the named port groups a match may reference.
pub trait PortGroupLookup {
    fn port_group(&self, name: &str) -> Option<&[String]>;
}

impl AddrSetLookup for Snapshot {
    fn addr_set(&self, name: &str) -> Option<&[AddrConstant]> {
        Snapshot::addr_set(self, name)
    }
}

impl PortGroupLookup for Snapshot {
    fn port_group(&self, name: &str) -> Option<&[String]> {
        Snapshot::port_group(self, name)
    }
}

/// A lookup layer rebinding one address-set name to a substitute list.
pub struct AddrSetOverride<'a, L: ?Sized> {
    pub base: &'a L,
    pub name: &'a str,
    pub addrs: &'a [AddrConstant],
}

impl<L: AddrSetLookup + ?Sized> AddrSetLookup for AddrSetOverride<'_, L> {
    fn addr_set(&self, name: &str) -> Option<&[AddrConstant]> {
        if name == self.name {
            Some(self.addrs)
        } else {
            self.base.addr_set(name)
        }
    }
}

/// An empty lookup, for parsing prerequisite fragments that cannot
/// reference sets.
pub struct NoSets;

impl AddrSetLookup for NoSets {
    fn addr_set(&self, _: &str) -> Option<&[AddrConstant]> {
        None
    }
}

impl PortGroupLookup for NoSets {
    fn port_group(&self, _: &str) -> Option<&[String]> {
        None
    }
}

/// Resolves logical port names while expanding matches or encoding
/// actions. Implementations record a resource reference for every name
/// they are asked about, so that later changes to that name re-translate
/// the row.
pub trait PortResolver {
    /// Logical port or multicast-group name → tunnel key on the current
    /// datapath.
    fn lookup_port(&mut self, name: &str) -> Option<u32>;

    /// Logical port name → OpenFlow port of the tunnel towards the
    /// chassis the port is bound to.
    fn tunnel_ofport(&mut self, name: &str) -> Option<u32> {
        let _ = name;
        None
    }
}

/// Answers `is_chassis_resident()` conditions, recording a port-binding
/// reference for every name evaluated.
pub trait ResidenceOracle {
    fn is_chassis_resident(&mut self, port: &str) -> bool;
}

//! The symbol table of matchable fields.
//!
//! Built once at process start and shared immutably afterwards; fields
//! either map directly onto a physical field (with an optional
//! prerequisite expression that is ANDed into any match using them) or
//! are predicates that expand to an expression over other symbols.

use std::collections::HashMap;
use std::sync::OnceLock;

use switchboard_flow::MatchField;

use crate::expr::PortDir;

/// One symbol definition.
#[derive(Clone, Debug)]
pub enum SymbolDef {
    /// A numeric field.
    Field {
        field: MatchField,
        width: u32,
        /// Expression source ANDed into every match using this field.
        prereq: Option<&'static str>,
    },
    /// A logical port field, compared against port names and resolved to
    /// tunnel keys at expansion time.
    Port(PortDir),
    /// Shorthand expanding to an expression over other symbols.
    Predicate(&'static str),
}

/// The immutable symbol table.
#[derive(Debug, Default)]
pub struct SymbolTable {
    symbols: HashMap<String, SymbolDef>,
}

impl SymbolTable {
    pub fn get(&self, name: &str) -> Option<&SymbolDef> {
        self.symbols.get(name)
    }

    fn insert(&mut self, name: &str, def: SymbolDef) {
        self.symbols.insert(name.to_string(), def);
    }

    /// The standard field set.
    pub fn standard() -> Self {
        use MatchField::*;
        use SymbolDef::*;

        let mut t = SymbolTable::default();

        t.insert("eth.src", Field { field: EthSrc, width: 48, prereq: None });
        t.insert("eth.dst", Field { field: EthDst, width: 48, prereq: None });
        t.insert("eth.type", Field { field: EthType, width: 16, prereq: None });

        t.insert("ip4", Predicate("eth.type == 0x800"));
        t.insert("ip6", Predicate("eth.type == 0x86dd"));
        t.insert("ip", Predicate("ip4 || ip6"));
        t.insert("arp", Predicate("eth.type == 0x806"));
        t.insert("tcp", Predicate("ip.proto == 6"));
        t.insert("udp", Predicate("ip.proto == 17"));
        t.insert("sctp", Predicate("ip.proto == 132"));
        t.insert("icmp6", Predicate("ip6 && ip.proto == 58"));

        t.insert("ip.proto", Field { field: IpProto, width: 8, prereq: Some("ip") });
        t.insert("ip.ttl", Field { field: NwTtl, width: 8, prereq: Some("ip") });
        t.insert("ip4.src", Field { field: Ip4Src, width: 32, prereq: Some("ip4") });
        t.insert("ip4.dst", Field { field: Ip4Dst, width: 32, prereq: Some("ip4") });
        t.insert("ip6.src", Field { field: Ip6Src, width: 128, prereq: Some("ip6") });
        t.insert("ip6.dst", Field { field: Ip6Dst, width: 128, prereq: Some("ip6") });

        t.insert("tcp.src", Field { field: TpSrc, width: 16, prereq: Some("tcp") });
        t.insert("tcp.dst", Field { field: TpDst, width: 16, prereq: Some("tcp") });
        t.insert("udp.src", Field { field: TpSrc, width: 16, prereq: Some("udp") });
        t.insert("udp.dst", Field { field: TpDst, width: 16, prereq: Some("udp") });
        t.insert("sctp.src", Field { field: TpSrc, width: 16, prereq: Some("sctp") });
        t.insert("sctp.dst", Field { field: TpDst, width: 16, prereq: Some("sctp") });

        t.insert("icmp6.type", Field { field: IcmpType, width: 8, prereq: Some("icmp6") });
        t.insert("icmp6.code", Field { field: IcmpCode, width: 8, prereq: Some("icmp6") });
        t.insert("nd.target", Field { field: NdTarget, width: 128, prereq: Some("icmp6") });

        t.insert("arp.op", Field { field: ArpOp, width: 16, prereq: Some("arp") });
        t.insert("arp.spa", Field { field: ArpSpa, width: 32, prereq: Some("arp") });
        t.insert("arp.sha", Field { field: ArpSha, width: 48, prereq: Some("arp") });
        t.insert("arp.tha", Field { field: ArpTha, width: 48, prereq: Some("arp") });

        t.insert("inport", Port(PortDir::In));
        t.insert("outport", Port(PortDir::Out));

        for reg in 0..10u8 {
            t.symbols.insert(
                format!("reg{reg}"),
                Field {
                    field: Reg(reg),
                    width: 32,
                    prereq: None,
                },
            );
        }

        t
    }
}

/// The process-wide symbol table, built on first use.
pub fn symtab() -> &'static SymbolTable {
    static SYMTAB: OnceLock<SymbolTable> = OnceLock::new();
    SYMTAB.get_or_init(SymbolTable::standard)
}

//! Neighbor (MAC-binding) and FDB flow synthesis.
//!
//! These are regular translations that bypass the expression engine:
//! each binding becomes a *get* rule (resolve the destination) and a
//! *lookup* rule (validate the origin).

use std::net::{Ipv4Addr, Ipv6Addr};
use std::str::FromStr;

use eui48::MacAddress;
use switchboard_data::{
    AddrConstant, FdbEntry, MacBinding, OwnerId, StaticMacBinding, Tracked,
};
use switchboard_flow::consts::{flags, oftable};
use switchboard_flow::{FlowAction, FlowDesc, FlowSink, Match, MatchField};
use tracing::{debug, warn};

use crate::{Ctx, Translator};

/// Priority of dynamically learnt bindings.
const DYNAMIC_PRIORITY: u16 = 100;

fn static_priority(smb: &StaticMacBinding) -> u16 {
    if smb.override_dynamic_mac {
        150
    } else {
        50
    }
}

fn mac_bits(mac: MacAddress) -> u128 {
    AddrConstant::mac(mac).value
}

impl Translator {
    pub(crate) fn add_neighbor_flows(&mut self, ctx: &Ctx<'_>, sink: &mut dyn FlowSink) {
        for mb in ctx.snapshot.mac_bindings() {
            self.consider_dynamic_neighbor(mb, ctx, sink);
        }
        for smb in ctx.snapshot.static_mac_bindings() {
            self.consider_static_neighbor(smb, ctx, sink);
        }
    }

    pub(crate) fn consider_dynamic_neighbor(
        &mut self,
        mb: &MacBinding,
        ctx: &Ctx<'_>,
        sink: &mut dyn FlowSink,
    ) {
        self.consider_neighbor_flow(
            mb.id,
            &mb.logical_port,
            &mb.ip,
            &mb.mac,
            DYNAMIC_PRIORITY,
            ctx,
            sink,
        );
    }

    pub(crate) fn consider_static_neighbor(
        &mut self,
        smb: &StaticMacBinding,
        ctx: &Ctx<'_>,
        sink: &mut dyn FlowSink,
    ) {
        self.consider_neighbor_flow(
            smb.id,
            &smb.logical_port,
            &smb.ip,
            &smb.mac,
            static_priority(smb),
            ctx,
            sink,
        );
    }

    fn consider_neighbor_flow(
        &mut self,
        owner: OwnerId,
        logical_port: &str,
        ip: &str,
        mac: &str,
        priority: u16,
        ctx: &Ctx<'_>,
        sink: &mut dyn FlowSink,
    ) {
        let Some(pb) = ctx.snapshot.port_binding_by_name(logical_port) else {
            return;
        };
        let Some(dp) = ctx.snapshot.datapath(pb.datapath) else {
            return;
        };
        if ctx.state.local_datapath(dp.tunnel_key).is_none() {
            return;
        }

        let Ok(mac_addr) = MacAddress::parse_str(mac) else {
            if self.limiters.neighbor.allow() {
                warn!(%owner, mac, "bad 'mac' in binding");
            }
            return;
        };

        let mut get_match = Match::new();
        let mut lookup_match = Match::new();
        if ip.contains('.') {
            let Ok(v4) = Ipv4Addr::from_str(ip) else {
                if self.limiters.neighbor.allow() {
                    warn!(%owner, ip, "bad 'ip' in binding");
                }
                return;
            };
            get_match.set(MatchField::Reg(0), u32::from(v4) as u128);
            lookup_match.set(MatchField::Reg(0), u32::from(v4) as u128);
            lookup_match.set(MatchField::EthType, 0x0806);
        } else {
            let Ok(v6) = Ipv6Addr::from_str(ip) else {
                if self.limiters.neighbor.allow() {
                    warn!(%owner, ip, "bad 'ip' in binding");
                }
                return;
            };
            get_match.set(MatchField::Xxreg(0), u128::from(v6));
            lookup_match.set(MatchField::Xxreg(0), u128::from(v6));
            lookup_match.set(MatchField::EthType, 0x86dd);
            lookup_match.set(MatchField::IpProto, 58);
            lookup_match.set(MatchField::IcmpCode, 0);
        }

        get_match.set(MatchField::Metadata, dp.tunnel_key as u128);
        get_match.set(MatchField::LogOutport, pb.tunnel_key as u128);
        sink.add_flow(
            owner,
            FlowDesc {
                table: oftable::MAC_BINDING,
                priority,
                cookie: owner.cookie(),
                match_: get_match,
                actions: vec![
                    FlowAction::Load {
                        field: MatchField::EthDst,
                        ofs: 0,
                        n_bits: 48,
                        value: mac_bits(mac_addr),
                    },
                    FlowAction::set_flag(flags::LOOKUP_MAC_BIT),
                ],
                meter: None,
                annotation: None,
            },
        );

        lookup_match.set(MatchField::Metadata, dp.tunnel_key as u128);
        lookup_match.set(MatchField::LogInport, pb.tunnel_key as u128);
        lookup_match.set(MatchField::EthSrc, mac_bits(mac_addr));
        sink.add_flow(
            owner,
            FlowDesc {
                table: oftable::MAC_LOOKUP,
                priority,
                cookie: owner.cookie(),
                match_: lookup_match,
                actions: vec![FlowAction::set_flag(flags::LOOKUP_MAC_BIT)],
                meter: None,
                annotation: None,
            },
        );
    }

    /// Neighbor changes: drop flows of deleted bindings first so an
    /// add of the same flow is not clobbered, then re-emit the rest.
    pub fn handle_changed_mac_bindings(
        &mut self,
        tracked: &[Tracked<MacBinding>],
        ctx: &Ctx<'_>,
        sink: &mut dyn FlowSink,
    ) -> bool {
        for t in tracked {
            if t.is_deleted() {
                debug!(binding = %t.item.id, "handle deleted mac binding");
                sink.remove_flows(t.item.id);
            }
        }
        for t in tracked {
            if t.is_deleted() {
                continue;
            }
            if !t.is_new() {
                debug!(binding = %t.item.id, "handle updated mac binding");
                sink.remove_flows(t.item.id);
            }
            self.consider_dynamic_neighbor(&t.item, ctx, sink);
        }
        true
    }

    pub fn handle_changed_static_mac_bindings(
        &mut self,
        tracked: &[Tracked<StaticMacBinding>],
        ctx: &Ctx<'_>,
        sink: &mut dyn FlowSink,
    ) -> bool {
        for t in tracked {
            if t.is_deleted() {
                sink.remove_flows(t.item.id);
            } else {
                if !t.is_new() {
                    sink.remove_flows(t.item.id);
                }
                self.consider_static_neighbor(&t.item, ctx, sink);
            }
        }
        true
    }

    pub(crate) fn add_fdb_flows(&mut self, ctx: &Ctx<'_>, sink: &mut dyn FlowSink) {
        for fdb in ctx.snapshot.fdbs() {
            self.consider_fdb_flows(fdb, ctx, sink);
        }
    }

    pub(crate) fn consider_fdb_flows(
        &mut self,
        fdb: &FdbEntry,
        ctx: &Ctx<'_>,
        sink: &mut dyn FlowSink,
    ) {
        if ctx.state.local_datapath(fdb.dp_key).is_none() {
            return;
        }
        let Ok(mac) = MacAddress::parse_str(&fdb.mac) else {
            if self.limiters.neighbor.allow() {
                warn!(entry = %fdb.id, mac = %fdb.mac, "bad 'mac' in fdb entry");
            }
            return;
        };

        let mut get_match = Match::new();
        get_match.set(MatchField::Metadata, fdb.dp_key as u128);
        get_match.set(MatchField::EthDst, mac_bits(mac));
        sink.add_flow(
            fdb.id,
            FlowDesc {
                table: oftable::GET_FDB,
                priority: 100,
                cookie: fdb.id.cookie(),
                match_: get_match,
                actions: vec![FlowAction::Load {
                    field: MatchField::LogOutport,
                    ofs: 0,
                    n_bits: 32,
                    value: fdb.port_key as u128,
                }],
                meter: None,
                annotation: None,
            },
        );

        let mut lookup_match = Match::new();
        lookup_match.set(MatchField::Metadata, fdb.dp_key as u128);
        lookup_match.set(MatchField::EthSrc, mac_bits(mac));
        lookup_match.set(MatchField::LogInport, fdb.port_key as u128);
        sink.add_flow(
            fdb.id,
            FlowDesc {
                table: oftable::LOOKUP_FDB,
                priority: 100,
                cookie: fdb.id.cookie(),
                match_: lookup_match,
                actions: vec![FlowAction::set_flag(flags::LOOKUP_FDB_BIT)],
                meter: None,
                annotation: None,
            },
        );
    }

    pub fn handle_changed_fdbs(
        &mut self,
        tracked: &[Tracked<FdbEntry>],
        ctx: &Ctx<'_>,
        sink: &mut dyn FlowSink,
    ) -> bool {
        for t in tracked {
            if t.is_deleted() {
                debug!(entry = %t.item.id, "remove fdb flows for deleted entry");
                sink.remove_flows(t.item.id);
            }
        }
        for t in tracked {
            if t.is_deleted() {
                continue;
            }
            if !t.is_new() {
                debug!(entry = %t.item.id, "remove fdb flows for updated entry");
                sink.remove_flows(t.item.id);
            }
            self.consider_fdb_flows(&t.item, ctx, sink);
        }
        true
    }
}

//! Load-balancer hairpin flow synthesis.
//!
//! Traffic from a backend to a VIP that gets load-balanced back to the
//! same backend leaves and re-enters through the same port; it must be
//! SNATed to the VIP (or the configured `hairpin_snat_ip`) to look like
//! a normal reply. Detection rules spot the original direction and
//! install the reply-direction rule with a learn action on first hit.

use std::collections::HashMap;
use std::net::IpAddr;

use switchboard_data::{LbBackend, LbVip, LoadBalancer, Tracked};
use switchboard_flow::consts::{ct_mark, ct_state, flags, oftable, regs};
use switchboard_flow::{FlowAction, FlowDesc, FlowSink, LearnMatch, Match, MatchField};
use tracing::debug;

use crate::{Ctx, Translator};

/// Allocates one conjunction-flow id per load balancer, keyed by name.
#[derive(Debug, Default)]
pub(crate) struct HairpinIdPool {
    ids: HashMap<String, u32>,
    next: u32,
    free: Vec<u32>,
}

impl HairpinIdPool {
    pub(crate) fn assign(&mut self, name: &str) -> u32 {
        if let Some(id) = self.ids.get(name) {
            return *id;
        }
        let id = match self.free.pop() {
            Some(id) => id,
            None => {
                self.next += 1;
                // Running out would mean 2^32 live load balancers.
                assert!(self.next != 0, "hairpin id space exhausted");
                self.next
            }
        };
        self.ids.insert(name.to_string(), id);
        id
    }

    pub(crate) fn release(&mut self, name: &str) {
        if let Some(id) = self.ids.remove(name) {
            self.free.push(id);
        }
    }
}

fn ip_bits(ip: &IpAddr) -> u128 {
    match ip {
        IpAddr::V4(v4) => u32::from(*v4) as u128,
        IpAddr::V6(v6) => u128::from(*v6),
    }
}

impl Translator {
    pub(crate) fn add_lb_hairpin_flows(&mut self, ctx: &Ctx<'_>, sink: &mut dyn FlowSink) {
        for lb in ctx.snapshot.load_balancers() {
            self.consider_lb_hairpin_flows(lb, ctx, sink);
        }
    }

    pub(crate) fn consider_lb_hairpin_flows(
        &mut self,
        lb: &LoadBalancer,
        ctx: &Ctx<'_>,
        sink: &mut dyn FlowSink,
    ) {
        // One local datapath implies the rest of the LB's datapaths are
        // worth programming too.
        let any_local = lb.datapaths.iter().any(|dp| {
            ctx.snapshot
                .datapath(*dp)
                .is_some_and(|dp| ctx.state.local_datapath(dp.tunnel_key).is_some())
        });
        if !any_local {
            return;
        }

        let id = self.hairpin_ids.assign(&lb.name);
        debug!(lb = %lb.name, id, "programming hairpin flows");
        let proto = lb.protocol.ip_proto();

        for vip in &lb.vips {
            for backend in &vip.backends {
                add_lb_vip_hairpin_flows(lb, vip, backend, proto, ctx, sink);
            }
        }
        add_lb_ct_snat_hairpin_flows(lb, id, proto, ctx, sink);
    }

    /// Deleted LBs drop their flows and release their conjunction id;
    /// updated ones are re-emitted from scratch.
    pub fn handle_changed_lbs(
        &mut self,
        tracked: &[Tracked<LoadBalancer>],
        ctx: &Ctx<'_>,
        sink: &mut dyn FlowSink,
    ) -> bool {
        for t in tracked {
            if t.is_deleted() {
                debug!(lb = %t.item.name, "remove hairpin flows for deleted load balancer");
                sink.remove_flows(t.item.id);
                self.hairpin_ids.release(&t.item.name);
            }
        }
        for t in tracked {
            if t.is_deleted() {
                continue;
            }
            if !t.is_new() {
                debug!(lb = %t.item.name, "remove hairpin flows for updated load balancer");
                sink.remove_flows(t.item.id);
            }
            self.consider_lb_hairpin_flows(&t.item, ctx, sink);
        }
        true
    }
}

fn add_lb_vip_hairpin_flows(
    lb: &LoadBalancer,
    vip: &LbVip,
    backend: &LbBackend,
    proto: u8,
    ctx: &Ctx<'_>,
    sink: &mut dyn FlowSink,
) {
    let mut m = Match::new();
    let v6 = vip.vip.is_ipv6();

    if !lb.hairpin_orig_tuple {
        let bits = (ct_state::TRACKED | ct_state::DST_NAT) as u128;
        m.set_masked(MatchField::CtState, bits, bits);
    }

    let backend_bits = ip_bits(&backend.ip);
    let vip_bits = ip_bits(&vip.vip);
    let snat_bits = match (v6, &lb.hairpin_snat_ips.v4, &lb.hairpin_snat_ips.v6) {
        (false, Some(v4), _) => u32::from(*v4) as u128,
        (true, _, Some(v6)) => u128::from(*v6),
        _ => vip_bits,
    };

    if !v6 {
        m.set(MatchField::EthType, 0x0800);
        m.set(MatchField::Ip4Src, backend_bits);
        m.set(MatchField::Ip4Dst, backend_bits);
        if !lb.hairpin_orig_tuple {
            m.set(MatchField::CtNwDst, vip_bits);
        } else {
            m.set(MatchField::Reg(regs::LB_ORIG_DIP_IPV4), vip_bits);
        }
    } else {
        m.set(MatchField::EthType, 0x86dd);
        m.set(MatchField::Ip6Src, backend_bits);
        m.set(MatchField::Ip6Dst, backend_bits);
        if !lb.hairpin_orig_tuple {
            m.set(MatchField::CtIp6Dst, vip_bits);
        } else {
            m.set(MatchField::Xxreg(regs::LB_ORIG_DIP_IPV6), vip_bits);
        }
    }

    if backend.port != 0 {
        m.set(MatchField::IpProto, proto as u128);
        m.set(MatchField::TpDst, backend.port as u128);
        if !lb.hairpin_orig_tuple {
            m.set(MatchField::CtNwProto, proto as u128);
            m.set(MatchField::CtTpDst, vip.vip_port as u128);
        } else {
            m.set_masked(
                MatchField::Reg(regs::LB_ORIG_TP_DPORT),
                vip.vip_port as u128,
                0xffff,
            );
        }
    }

    // Only traffic that was already load balanced can hairpin.
    m.set_masked(
        MatchField::CtMark,
        ct_mark::NATTED as u128,
        ct_mark::NATTED as u128,
    );

    let actions = vec![
        FlowAction::set_flag(flags::LOOKUP_LB_HAIRPIN_BIT),
        lb_hairpin_reply_learn(v6, snat_bits, proto, backend.port != 0, lb.id.cookie()),
    ];

    sink.add_flow(
        lb.id,
        FlowDesc {
            table: oftable::CHK_LB_HAIRPIN,
            priority: 100,
            cookie: lb.id.cookie(),
            match_: m.clone(),
            actions: actions.clone(),
            meter: None,
            annotation: None,
        },
    );

    // Legacy peers stored the natted bit in the CT label; during an
    // upgrade both variants must be present.
    if ctx.state.check_ct_label_for_lb_hairpin {
        let mut legacy = m;
        legacy.unset(MatchField::CtMark);
        legacy.set_masked(
            MatchField::CtLabel,
            ct_mark::NATTED as u128,
            ct_mark::NATTED as u128,
        );
        sink.add_flow(
            lb.id,
            FlowDesc {
                table: oftable::CHK_LB_HAIRPIN,
                priority: 100,
                cookie: lb.id.cookie(),
                match_: legacy,
                actions,
                meter: None,
                annotation: None,
            },
        );
    }
}

/// The learn action installing the reply-direction detection rule:
/// replies come from the backend, towards the SNAT address, with the
/// session's protocol, sourced from the backend port.
fn lb_hairpin_reply_learn(
    v6: bool,
    snat_bits: u128,
    proto: u8,
    has_l4_port: bool,
    cookie: u32,
) -> FlowAction {
    let (src_field, dst_field) = if v6 {
        (MatchField::Ip6Src, MatchField::Ip6Dst)
    } else {
        (MatchField::Ip4Src, MatchField::Ip4Dst)
    };
    let mut matches = vec![
        LearnMatch::Field {
            dst: MatchField::Metadata,
            src: MatchField::Metadata,
        },
        LearnMatch::Immediate {
            dst: MatchField::EthType,
            value: if v6 { 0x86dd } else { 0x0800 },
        },
        LearnMatch::Field {
            dst: src_field,
            src: src_field,
        },
        LearnMatch::Immediate {
            dst: dst_field,
            value: snat_bits,
        },
        LearnMatch::Immediate {
            dst: MatchField::IpProto,
            value: proto as u128,
        },
    ];
    if has_l4_port {
        matches.push(LearnMatch::Field {
            dst: MatchField::TpSrc,
            src: MatchField::TpDst,
        });
    }
    FlowAction::Learn {
        table: oftable::CHK_LB_HAIRPIN_REPLY,
        cookie,
        matches,
        load: vec![(MatchField::LogFlags, flags::LOOKUP_LB_HAIRPIN_BIT, 1)],
    }
}

fn add_lb_ct_snat_hairpin_flows(
    lb: &LoadBalancer,
    id: u32,
    proto: u8,
    ctx: &Ctx<'_>,
    sink: &mut dyn FlowSink,
) {
    for vip in &lb.vips {
        add_lb_ct_snat_hairpin_vip_flow(lb, id, vip, proto, sink);
    }
    add_lb_ct_snat_hairpin_dp_flows(lb, id, ctx, sink);
}

/// The VIP-side SNAT rule. Without a `hairpin_snat_ip` it SNATs to the
/// VIP directly; with one it only contributes the VIP dimension of a
/// conjunction whose other dimension is the LB's datapaths.
fn add_lb_ct_snat_hairpin_vip_flow(
    lb: &LoadBalancer,
    id: u32,
    vip: &LbVip,
    proto: u8,
    sink: &mut dyn FlowSink,
) {
    let v6 = vip.vip.is_ipv6();
    let use_hairpin_snat_ip = if v6 {
        lb.hairpin_snat_ips.v6.is_some()
    } else {
        lb.hairpin_snat_ips.v4.is_some()
    };
    // The conjunctive variant is strictly more specific; it outranks
    // the plain one.
    let priority = if use_hairpin_snat_ip { 200 } else { 100 };

    let actions = if use_hairpin_snat_ip {
        vec![FlowAction::Conjunction {
            id,
            clause: 1,
            n_clauses: 2,
        }]
    } else {
        vec![FlowAction::CtSnat {
            v6,
            addr: ip_bits(&vip.vip),
        }]
    };

    let mut m = Match::new();
    if !lb.hairpin_orig_tuple {
        let bits = (ct_state::TRACKED | ct_state::DST_NAT) as u128;
        m.set_masked(MatchField::CtState, bits, bits);
    }
    if !v6 {
        m.set(MatchField::EthType, 0x0800);
        if !lb.hairpin_orig_tuple {
            m.set(MatchField::CtNwDst, ip_bits(&vip.vip));
        } else {
            m.set(MatchField::Reg(regs::LB_ORIG_DIP_IPV4), ip_bits(&vip.vip));
        }
    } else {
        m.set(MatchField::EthType, 0x86dd);
        if !lb.hairpin_orig_tuple {
            m.set(MatchField::CtIp6Dst, ip_bits(&vip.vip));
        } else {
            m.set(MatchField::Xxreg(regs::LB_ORIG_DIP_IPV6), ip_bits(&vip.vip));
        }
    }
    m.set(MatchField::IpProto, proto as u128);
    if vip.vip_port != 0 {
        if !lb.hairpin_orig_tuple {
            m.set(MatchField::CtNwProto, proto as u128);
            m.set(MatchField::CtTpDst, vip.vip_port as u128);
        } else {
            m.set_masked(
                MatchField::Reg(regs::LB_ORIG_TP_DPORT),
                vip.vip_port as u128,
                0xffff,
            );
        }
    }

    // The same VIP may appear on several LBs sharing a
    // `hairpin_snat_ip`; their clauses coalesce on one flow.
    sink.add_or_append_flow(
        lb.id,
        FlowDesc {
            table: oftable::CT_SNAT_HAIRPIN,
            priority,
            cookie: lb.id.cookie(),
            match_: m,
            actions,
            meter: None,
            annotation: None,
        },
    );
}

/// The datapath dimension and the SNAT finish rules, only present when
/// a `hairpin_snat_ip` is configured.
fn add_lb_ct_snat_hairpin_dp_flows(
    lb: &LoadBalancer,
    id: u32,
    ctx: &Ctx<'_>,
    sink: &mut dyn FlowSink,
) {
    if lb.hairpin_snat_ips.is_empty() {
        return;
    }

    for dp_id in &lb.datapaths {
        let Some(dp) = ctx.snapshot.datapath(*dp_id) else {
            continue;
        };
        let mut m = Match::new();
        m.set(MatchField::Metadata, dp.tunnel_key as u128);
        sink.add_or_append_flow(
            lb.id,
            FlowDesc {
                table: oftable::CT_SNAT_HAIRPIN,
                priority: 200,
                cookie: lb.id.cookie(),
                match_: m,
                actions: vec![FlowAction::Conjunction {
                    id,
                    clause: 0,
                    n_clauses: 2,
                }],
                meter: None,
                annotation: None,
            },
        );
    }

    if let Some(v4) = lb.hairpin_snat_ips.v4 {
        let mut m = Match::new();
        m.set(MatchField::ConjId, id as u128);
        m.set(MatchField::EthType, 0x0800);
        sink.add_flow(
            lb.id,
            FlowDesc {
                table: oftable::CT_SNAT_HAIRPIN,
                priority: 200,
                cookie: lb.id.cookie(),
                match_: m,
                actions: vec![FlowAction::CtSnat {
                    v6: false,
                    addr: u32::from(v4) as u128,
                }],
                meter: None,
                annotation: None,
            },
        );
    }
    if let Some(v6) = lb.hairpin_snat_ips.v6 {
        let mut m = Match::new();
        m.set(MatchField::ConjId, id as u128);
        m.set(MatchField::EthType, 0x86dd);
        sink.add_flow(
            lb.id,
            FlowDesc {
                table: oftable::CT_SNAT_HAIRPIN,
                priority: 200,
                cookie: lb.id.cookie(),
                match_: m,
                actions: vec![FlowAction::CtSnat {
                    v6: true,
                    addr: u128::from(v6),
                }],
                meter: None,
                annotation: None,
            },
        );
    }
}

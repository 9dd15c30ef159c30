//! Port-security flow synthesis.
//!
//! For every locally bound port with port-security entries: default-deny
//! rules on the in and out side, with higher-priority allow rules for
//! the configured MAC/IP pairs and for the protocol traffic a secured
//! port must still be able to send (DHCP requests, ARP, router and
//! neighbor solicitations, MLD).

use switchboard_data::lport::{mac_to_lla, LportAddresses};
use switchboard_data::{AddrConstant, PortBinding};
use switchboard_flow::consts::{flags, oftable};
use switchboard_flow::{FlowAction, FlowDesc, FlowSink, Match, MatchField};
use tracing::info;

use crate::{Ctx, Translator};

fn deny_action() -> Vec<FlowAction> {
    vec![FlowAction::set_flag(flags::CHECK_PORT_SEC_BIT)]
}

fn allow_action() -> Vec<FlowAction> {
    vec![FlowAction::clear_flag(flags::CHECK_PORT_SEC_BIT)]
}

/// Advance ARP/ND traffic into the dedicated check table.
fn adv_nd_check_action() -> Vec<FlowAction> {
    vec![FlowAction::Resubmit {
        table: oftable::CHK_IN_PORT_SEC_ND,
    }]
}

fn port_sec_match(pb: &PortBinding, dp_key: u64, reg: MatchField) -> Match {
    let mut m = Match::new();
    m.set(MatchField::Metadata, dp_key as u128);
    m.set(reg, pb.tunnel_key as u128);
    m
}

fn mac_bits(mac: eui48::MacAddress) -> u128 {
    AddrConstant::mac(mac).value
}

fn add(
    sink: &mut dyn FlowSink,
    pb: &PortBinding,
    table: u8,
    priority: u16,
    m: Match,
    actions: Vec<FlowAction>,
) {
    sink.add_flow(
        pb.id,
        FlowDesc {
            table,
            priority,
            cookie: pb.id.cookie(),
            match_: m,
            actions,
            meter: None,
            annotation: None,
        },
    );
}

impl Translator {
    pub(crate) fn add_port_sec_flows(&mut self, ctx: &Ctx<'_>, sink: &mut dyn FlowSink) {
        for pb in ctx.snapshot.port_bindings() {
            if !ctx.state.bound_lports.contains(&pb.name) {
                continue;
            }
            self.consider_port_sec_flows(pb, ctx, sink);
        }
    }

    pub(crate) fn consider_port_sec_flows(
        &mut self,
        pb: &PortBinding,
        ctx: &Ctx<'_>,
        sink: &mut dyn FlowSink,
    ) {
        if pb.port_security.is_empty() {
            return;
        }
        let Some(dp) = ctx.snapshot.datapath(pb.datapath) else {
            return;
        };
        let dp_key = dp.tunnel_key;

        let mut ps_addrs = Vec::with_capacity(pb.port_security.len());
        for entry in &pb.port_security {
            match LportAddresses::parse(entry) {
                Ok(addrs) => ps_addrs.push(addrs),
                Err(_) => {
                    if self.limiters.port_sec.allow() {
                        info!(
                            port = %pb.name,
                            entry = %entry,
                            "invalid syntax in port security, no MAC address found"
                        );
                    }
                }
            }
        }
        if ps_addrs.is_empty() {
            return;
        }

        build_in_port_sec_default_flows(pb, dp_key, sink);
        for addrs in &ps_addrs {
            build_in_port_sec_no_ip_flows(pb, dp_key, addrs, sink);
            build_in_port_sec_ip4_flows(pb, dp_key, addrs, sink);
            build_in_port_sec_arp_flows(pb, dp_key, addrs, sink);
            build_in_port_sec_ip6_flows(pb, dp_key, addrs, sink);
            build_in_port_sec_nd_flows(pb, dp_key, addrs, sink);
        }

        // Out side: default drop everything towards the port.
        let m = port_sec_match(pb, dp_key, MatchField::LogOutport);
        add(sink, pb, oftable::CHK_OUT_PORT_SEC, 80, m, deny_action());
        for addrs in &ps_addrs {
            build_out_port_sec_no_ip_flows(pb, dp_key, addrs, sink);
            build_out_port_sec_ip4_flows(pb, dp_key, addrs, sink);
            build_out_port_sec_ip6_flows(pb, dp_key, addrs, sink);
        }
    }
}

fn build_in_port_sec_default_flows(pb: &PortBinding, dp_key: u64, sink: &mut dyn FlowSink) {
    // Default drop all traffic from the port.
    let m = port_sec_match(pb, dp_key, MatchField::LogInport);
    add(sink, pb, oftable::CHK_IN_PORT_SEC, 80, m, deny_action());

    // ARP checking happens in the next table; advance ARP there.
    let mut m = port_sec_match(pb, dp_key, MatchField::LogInport);
    m.set(MatchField::EthType, 0x0806);
    add(sink, pb, oftable::CHK_IN_PORT_SEC, 95, m, adv_nd_check_action());

    // Default drop ARP; the allow rules outrank this.
    let mut m = port_sec_match(pb, dp_key, MatchField::LogInport);
    m.set(MatchField::EthType, 0x0806);
    add(sink, pb, oftable::CHK_IN_PORT_SEC_ND, 80, m, deny_action());

    // Default drop IPv6 neighbor advertisements.
    let mut m = port_sec_match(pb, dp_key, MatchField::LogInport);
    m.set(MatchField::EthType, 0x86dd);
    m.set(MatchField::IpProto, 58);
    m.set(MatchField::NwTtl, 255);
    m.set(MatchField::IcmpType, 136);
    add(sink, pb, oftable::CHK_IN_PORT_SEC_ND, 80, m, deny_action());

    // Default *allow* IPv6 neighbor solicitations. This should be a
    // default drop like the NA rule above, but the forwarding plane has
    // been seen steering NS packets with a matching nd.sll onto this
    // default rule instead of the higher-priority allow rule, which
    // would break address resolution for secured ports. Keep allowing
    // until that lookup behavior is understood.
    let mut m = port_sec_match(pb, dp_key, MatchField::LogInport);
    m.set(MatchField::EthType, 0x86dd);
    m.set(MatchField::IpProto, 58);
    m.set(MatchField::NwTtl, 255);
    m.set(MatchField::IcmpType, 135);
    add(sink, pb, oftable::CHK_IN_PORT_SEC_ND, 80, m, allow_action());
}

fn build_in_port_sec_no_ip_flows(
    pb: &PortBinding,
    dp_key: u64,
    addrs: &LportAddresses,
    sink: &mut dyn FlowSink,
) {
    if !addrs.ipv4_addrs.is_empty() || !addrs.ipv6_addrs.is_empty() {
        return;
    }
    // MAC-only entry: anything from that MAC advances to the ARP/ND
    // check.
    let mut m = port_sec_match(pb, dp_key, MatchField::LogInport);
    m.set(MatchField::EthSrc, mac_bits(addrs.ea));
    add(sink, pb, oftable::CHK_IN_PORT_SEC, 90, m, adv_nd_check_action());
}

fn build_in_port_sec_ip4_flows(
    pb: &PortBinding,
    dp_key: u64,
    addrs: &LportAddresses,
    sink: &mut dyn FlowSink,
) {
    if addrs.ipv4_addrs.is_empty() {
        // Without IPv4 addresses the port may not send IPv4 at all; the
        // default flows already drop it.
        return;
    }

    for net in &addrs.ipv4_addrs {
        let mut m = port_sec_match(pb, dp_key, MatchField::LogInport);
        m.set(MatchField::EthSrc, mac_bits(addrs.ea));
        m.set(MatchField::EthType, 0x0800);
        // A subnet entry with host bits zero admits the whole subnet;
        // otherwise only the exact address.
        if net.plen == 32 || !net.host_bits_zero() {
            m.set(MatchField::Ip4Src, u32::from(net.addr) as u128);
        } else {
            m.set_masked(
                MatchField::Ip4Src,
                net.network() as u128,
                net.mask() as u128,
            );
        }
        add(sink, pb, oftable::CHK_IN_PORT_SEC, 90, m, allow_action());
    }

    // DHCP requests come from 0.0.0.0 to the broadcast address.
    let mut m = port_sec_match(pb, dp_key, MatchField::LogInport);
    m.set(MatchField::EthSrc, mac_bits(addrs.ea));
    m.set(MatchField::EthType, 0x0800);
    m.set(MatchField::Ip4Src, 0);
    m.set(MatchField::Ip4Dst, 0xffffffff);
    m.set(MatchField::IpProto, 17);
    m.set(MatchField::TpSrc, 68);
    m.set(MatchField::TpDst, 67);
    add(sink, pb, oftable::CHK_IN_PORT_SEC, 90, m, allow_action());
}

fn build_in_port_sec_arp_flows(
    pb: &PortBinding,
    dp_key: u64,
    addrs: &LportAddresses,
    sink: &mut dyn FlowSink,
) {
    if addrs.ipv4_addrs.is_empty() && !addrs.ipv6_addrs.is_empty() {
        // IPv6-only entries get no ARP.
        return;
    }

    if addrs.ipv4_addrs.is_empty() {
        let mut m = port_sec_match(pb, dp_key, MatchField::LogInport);
        m.set(MatchField::EthSrc, mac_bits(addrs.ea));
        m.set(MatchField::EthType, 0x0806);
        m.set(MatchField::ArpSha, mac_bits(addrs.ea));
        add(sink, pb, oftable::CHK_IN_PORT_SEC_ND, 90, m, allow_action());
    }

    for net in &addrs.ipv4_addrs {
        let mut m = port_sec_match(pb, dp_key, MatchField::LogInport);
        m.set(MatchField::EthSrc, mac_bits(addrs.ea));
        m.set(MatchField::EthType, 0x0806);
        m.set(MatchField::ArpSha, mac_bits(addrs.ea));
        if net.plen == 32 || !net.host_bits_zero() {
            m.set(MatchField::ArpSpa, u32::from(net.addr) as u128);
        } else {
            m.set_masked(
                MatchField::ArpSpa,
                net.network() as u128,
                net.mask() as u128,
            );
        }
        add(sink, pb, oftable::CHK_IN_PORT_SEC_ND, 90, m, allow_action());
    }
}

fn build_in_port_sec_ip6_flows(
    pb: &PortBinding,
    dp_key: u64,
    addrs: &LportAddresses,
    sink: &mut dyn FlowSink,
) {
    if addrs.ipv6_addrs.is_empty() {
        return;
    }

    // Allowed sources advance to the neighbor solicit/advert check.
    for net in &addrs.ipv6_addrs {
        let mut m = port_sec_match(pb, dp_key, MatchField::LogInport);
        m.set(MatchField::EthSrc, mac_bits(addrs.ea));
        m.set(MatchField::EthType, 0x86dd);
        if net.plen == 128 || !net.host_bits_zero() {
            m.set(MatchField::Ip6Src, u128::from(net.addr));
        } else {
            m.set_masked(MatchField::Ip6Src, net.network(), net.mask());
        }
        add(sink, pb, oftable::CHK_IN_PORT_SEC, 90, m, adv_nd_check_action());
    }

    let lla = mac_to_lla(addrs.ea);
    let mut m = port_sec_match(pb, dp_key, MatchField::LogInport);
    m.set(MatchField::EthSrc, mac_bits(addrs.ea));
    m.set(MatchField::EthType, 0x86dd);
    m.set(MatchField::Ip6Src, u128::from(lla));
    add(sink, pb, oftable::CHK_IN_PORT_SEC, 90, m, adv_nd_check_action());

    // MLD report/done from the unspecified address.
    for icmp_type in [131u8, 143] {
        let mut m = port_sec_match(pb, dp_key, MatchField::LogInport);
        m.set(MatchField::EthSrc, mac_bits(addrs.ea));
        m.set(MatchField::EthType, 0x86dd);
        m.set(MatchField::Ip6Src, 0);
        m.set_masked(MatchField::Ip6Dst, 0xff02u128 << 112, 0xffffu128 << 112);
        m.set(MatchField::IpProto, 58);
        m.set(MatchField::IcmpType, icmp_type as u128);
        m.set(MatchField::IcmpCode, 0);
        add(sink, pb, oftable::CHK_IN_PORT_SEC, 90, m, allow_action());
    }

    // Neighbor solicitations from :: advance to the ND check.
    let mut m = port_sec_match(pb, dp_key, MatchField::LogInport);
    m.set(MatchField::EthSrc, mac_bits(addrs.ea));
    m.set(MatchField::EthType, 0x86dd);
    m.set(MatchField::Ip6Src, 0);
    m.set_masked(MatchField::Ip6Dst, 0xff02u128 << 112, 0xffffu128 << 112);
    m.set(MatchField::IpProto, 58);
    m.set(MatchField::IcmpType, 135);
    m.set(MatchField::IcmpCode, 0);
    add(sink, pb, oftable::CHK_IN_PORT_SEC, 90, m, adv_nd_check_action());
}

fn build_in_port_sec_nd_flows(
    pb: &PortBinding,
    dp_key: u64,
    addrs: &LportAddresses,
    sink: &mut dyn FlowSink,
) {
    // Neighbor solicitations with nd.sll of zero or the secured MAC.
    for sll in [0u128, mac_bits(addrs.ea)] {
        let mut m = port_sec_match(pb, dp_key, MatchField::LogInport);
        m.set(MatchField::EthSrc, mac_bits(addrs.ea));
        m.set(MatchField::EthType, 0x86dd);
        m.set(MatchField::IpProto, 58);
        m.set(MatchField::NwTtl, 255);
        m.set(MatchField::IcmpType, 135);
        m.set(MatchField::IcmpCode, 0);
        m.set(MatchField::ArpSha, sll);
        add(sink, pb, oftable::CHK_IN_PORT_SEC_ND, 90, m, allow_action());
    }

    let na_base = |tll: u128| {
        let mut m = port_sec_match(pb, dp_key, MatchField::LogInport);
        m.set(MatchField::EthSrc, mac_bits(addrs.ea));
        m.set(MatchField::EthType, 0x86dd);
        m.set(MatchField::IpProto, 58);
        m.set(MatchField::NwTtl, 255);
        m.set(MatchField::IcmpType, 136);
        m.set(MatchField::IcmpCode, 0);
        m.set(MatchField::ArpTha, tll);
        m
    };

    if addrs.ipv6_addrs.is_empty() {
        // No IPv6 addresses: advertisements allowed for any target.
        for tll in [0u128, mac_bits(addrs.ea)] {
            add(
                sink,
                pb,
                oftable::CHK_IN_PORT_SEC_ND,
                90,
                na_base(tll),
                allow_action(),
            );
        }
        return;
    }

    // Advertisements must target a configured address or the link
    // local.
    let lla = mac_to_lla(addrs.ea);
    for tll in [0u128, mac_bits(addrs.ea)] {
        let mut m = na_base(tll);
        m.set(MatchField::NdTarget, u128::from(lla));
        add(sink, pb, oftable::CHK_IN_PORT_SEC_ND, 90, m, allow_action());

        for net in &addrs.ipv6_addrs {
            let mut m = na_base(tll);
            if net.plen == 128 || !net.host_bits_zero() {
                m.set(MatchField::NdTarget, u128::from(net.addr));
            } else {
                m.set_masked(MatchField::NdTarget, net.network(), net.mask());
            }
            add(sink, pb, oftable::CHK_IN_PORT_SEC_ND, 90, m, allow_action());
        }
    }
}

fn build_out_port_sec_no_ip_flows(
    pb: &PortBinding,
    dp_key: u64,
    addrs: &LportAddresses,
    sink: &mut dyn FlowSink,
) {
    // Anything to the secured MAC is deliverable.
    let mut m = port_sec_match(pb, dp_key, MatchField::LogOutport);
    m.set(MatchField::EthDst, mac_bits(addrs.ea));
    add(sink, pb, oftable::CHK_OUT_PORT_SEC, 85, m, allow_action());
}

fn build_out_port_sec_ip4_flows(
    pb: &PortBinding,
    dp_key: u64,
    addrs: &LportAddresses,
    sink: &mut dyn FlowSink,
) {
    if addrs.ipv4_addrs.is_empty() && addrs.ipv6_addrs.is_empty() {
        return;
    }

    // Default drop IPv4 towards the MAC; allows below outrank it.
    let mut m = port_sec_match(pb, dp_key, MatchField::LogOutport);
    m.set(MatchField::EthDst, mac_bits(addrs.ea));
    m.set(MatchField::EthType, 0x0800);
    add(sink, pb, oftable::CHK_OUT_PORT_SEC, 90, m, deny_action());

    if addrs.ipv4_addrs.is_empty() {
        return;
    }

    for net in &addrs.ipv4_addrs {
        let mut m = port_sec_match(pb, dp_key, MatchField::LogOutport);
        m.set(MatchField::EthDst, mac_bits(addrs.ea));
        m.set(MatchField::EthType, 0x0800);
        if net.plen == 32 || !net.host_bits_zero() {
            if net.plen != 32 {
                // A host-bits-set subnet entry still admits the subnet
                // broadcast address.
                let mut bcast = m.clone();
                bcast.set(MatchField::Ip4Dst, net.bcast() as u128);
                add(sink, pb, oftable::CHK_OUT_PORT_SEC, 95, bcast, allow_action());
            }
            m.set(MatchField::Ip4Dst, u32::from(net.addr) as u128);
        } else {
            m.set_masked(
                MatchField::Ip4Dst,
                net.network() as u128,
                net.mask() as u128,
            );
        }
        add(sink, pb, oftable::CHK_OUT_PORT_SEC, 95, m, allow_action());
    }

    // Limited broadcast and multicast.
    let mut m = port_sec_match(pb, dp_key, MatchField::LogOutport);
    m.set(MatchField::EthDst, mac_bits(addrs.ea));
    m.set(MatchField::EthType, 0x0800);
    m.set(MatchField::Ip4Dst, 0xffffffff);
    add(sink, pb, oftable::CHK_OUT_PORT_SEC, 95, m, allow_action());

    let mut m = port_sec_match(pb, dp_key, MatchField::LogOutport);
    m.set(MatchField::EthDst, mac_bits(addrs.ea));
    m.set(MatchField::EthType, 0x0800);
    m.set_masked(MatchField::Ip4Dst, 0xe0000000, 0xf0000000);
    add(sink, pb, oftable::CHK_OUT_PORT_SEC, 95, m, allow_action());
}

fn build_out_port_sec_ip6_flows(
    pb: &PortBinding,
    dp_key: u64,
    addrs: &LportAddresses,
    sink: &mut dyn FlowSink,
) {
    if addrs.ipv4_addrs.is_empty() && addrs.ipv6_addrs.is_empty() {
        return;
    }

    let mut m = port_sec_match(pb, dp_key, MatchField::LogOutport);
    m.set(MatchField::EthDst, mac_bits(addrs.ea));
    m.set(MatchField::EthType, 0x86dd);
    add(sink, pb, oftable::CHK_OUT_PORT_SEC, 90, m, deny_action());

    if addrs.ipv6_addrs.is_empty() {
        return;
    }

    for net in &addrs.ipv6_addrs {
        let mut m = port_sec_match(pb, dp_key, MatchField::LogOutport);
        m.set(MatchField::EthDst, mac_bits(addrs.ea));
        m.set(MatchField::EthType, 0x86dd);
        if net.plen == 128 || !net.host_bits_zero() {
            m.set(MatchField::Ip6Dst, u128::from(net.addr));
        } else {
            m.set_masked(MatchField::Ip6Dst, net.network(), net.mask());
        }
        add(sink, pb, oftable::CHK_OUT_PORT_SEC, 95, m, allow_action());
    }

    let lla = mac_to_lla(addrs.ea);
    let mut m = port_sec_match(pb, dp_key, MatchField::LogOutport);
    m.set(MatchField::EthDst, mac_bits(addrs.ea));
    m.set(MatchField::EthType, 0x86dd);
    m.set(MatchField::Ip6Dst, u128::from(lla));
    add(sink, pb, oftable::CHK_OUT_PORT_SEC, 95, m, allow_action());

    // All-nodes and the rest of ff00::/8.
    let mut m = port_sec_match(pb, dp_key, MatchField::LogOutport);
    m.set(MatchField::EthDst, mac_bits(addrs.ea));
    m.set(MatchField::EthType, 0x86dd);
    m.set_masked(MatchField::Ip6Dst, 0xffu128 << 120, 0xffu128 << 120);
    add(sink, pb, oftable::CHK_OUT_PORT_SEC, 95, m, allow_action());
}

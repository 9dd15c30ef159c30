//! Adjunct emitters: neighbor, FDB, hairpin and port-security flows,
//! plus their change handlers and datapath activation.

use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr};

use switchboard_data::{
    Datapath, DpId, FdbEntry, LbBackend, LbProto, LbVip, LoadBalancer, LocalState, LogicalRow,
    MacBinding, OptionBags, OwnerId, Pipeline, PortBinding, RowBinding, RowId, Snapshot,
    StaticMacBinding, Tracked,
};
use switchboard_flow::consts::{flags, oftable};
use switchboard_flow::{DesiredFlowTable, FlowAction, MatchField};
use switchboard_translate::{Ctx, Translator};

struct World {
    snap: Snapshot,
    state: LocalState,
    opts: OptionBags,
}

impl World {
    fn new() -> Self {
        World {
            snap: Snapshot::new(),
            state: LocalState {
                chassis: "hv1".to_string(),
                ..LocalState::default()
            },
            opts: OptionBags::standard(),
        }
    }

    fn ctx(&self) -> Ctx<'_> {
        Ctx {
            snapshot: &self.snap,
            state: &self.state,
            opts: &self.opts,
        }
    }

    fn add_datapath(&mut self, tunnel_key: u64, local: bool) -> DpId {
        let dp = Datapath {
            id: DpId::random(),
            tunnel_key,
            is_switch: true,
            external_ids: HashMap::new(),
        };
        let id = dp.id;
        if local {
            self.state.local_datapaths.insert(tunnel_key, id);
        }
        self.snap.add_datapath(dp);
        id
    }

    fn add_bound_port(
        &mut self,
        name: &str,
        dp: DpId,
        tunnel_key: u32,
        port_security: &[&str],
    ) -> PortBinding {
        let pb = PortBinding {
            id: OwnerId::random(),
            name: name.to_string(),
            datapath: dp,
            tunnel_key,
            kind: String::new(),
            chassis: Some(self.state.chassis.clone()),
            ha_chassis_group: None,
            port_security: port_security.iter().map(|s| s.to_string()).collect(),
        };
        self.snap.add_port_binding(pb.clone());
        self.state.bound_lports.insert(name.to_string());
        pb
    }
}

fn mac_binding(port: &str, ip: &str, mac: &str, dp: DpId) -> MacBinding {
    MacBinding {
        id: OwnerId::random(),
        logical_port: port.to_string(),
        ip: ip.to_string(),
        mac: mac.to_string(),
        datapath: dp,
    }
}

#[test]
fn neighbor_flows_for_ipv4_binding() {
    let mut world = World::new();
    let dp = world.add_datapath(3, true);
    world.add_bound_port("p1", dp, 5, &[]);
    let mb = mac_binding("p1", "10.0.0.9", "0a:00:00:00:00:09", dp);
    world.snap.add_mac_binding(mb);

    let mut translator = Translator::new();
    let mut table = DesiredFlowTable::new();
    translator.run_full(&world.ctx(), &mut table);

    let get: Vec<_> = table.flows_in_table(oftable::MAC_BINDING).collect();
    assert_eq!(get.len(), 1);
    assert_eq!(get[0].key.priority, 100);
    assert_eq!(get[0].key.match_.exact_value(MatchField::LogOutport), Some(5));
    assert_eq!(
        get[0].key.match_.exact_value(MatchField::Reg(0)),
        Some(u32::from(Ipv4Addr::new(10, 0, 0, 9)) as u128)
    );
    assert!(get[0]
        .actions
        .iter()
        .any(|a| matches!(a, FlowAction::Load { field: MatchField::EthDst, .. })));

    let lookup: Vec<_> = table.flows_in_table(oftable::MAC_LOOKUP).collect();
    assert_eq!(lookup.len(), 1);
    assert_eq!(lookup[0].key.match_.exact_value(MatchField::EthType), Some(0x0806));
    assert_eq!(lookup[0].key.match_.exact_value(MatchField::LogInport), Some(5));
}

#[test]
fn static_bindings_rank_by_override_flag() {
    let mut world = World::new();
    let dp = world.add_datapath(3, true);
    world.add_bound_port("p1", dp, 5, &[]);
    for (ip, override_dynamic, expected) in
        [("10.0.0.1", true, 150u16), ("10.0.0.2", false, 50)]
    {
        let smb = StaticMacBinding {
            id: OwnerId::random(),
            logical_port: "p1".to_string(),
            ip: ip.to_string(),
            mac: "0a:00:00:00:00:01".to_string(),
            datapath: dp,
            override_dynamic_mac: override_dynamic,
        };
        world.snap.add_static_mac_binding(smb);
        let table = {
            let mut translator = Translator::new();
            let mut table = DesiredFlowTable::new();
            translator.run_full(&world.ctx(), &mut table);
            table
        };
        assert!(
            table
                .flows_in_table(oftable::MAC_BINDING)
                .any(|f| f.key.priority == expected),
            "expected a priority-{expected} get rule"
        );
    }
}

#[test]
fn mac_binding_updates_replace_flows() {
    let mut world = World::new();
    let dp = world.add_datapath(3, true);
    world.add_bound_port("p1", dp, 5, &[]);
    let mb = mac_binding("p1", "10.0.0.9", "0a:00:00:00:00:09", dp);
    world.snap.add_mac_binding(mb.clone());

    let mut translator = Translator::new();
    let mut table = DesiredFlowTable::new();
    translator.run_full(&world.ctx(), &mut table);
    assert_eq!(table.len(), 2);

    // The binding moves to a new MAC.
    let mut updated = mb.clone();
    updated.mac = "0a:00:00:00:00:10".to_string();
    world.snap.remove_mac_binding(mb.id);
    world.snap.add_mac_binding(updated.clone());
    assert!(translator.handle_changed_mac_bindings(
        &[Tracked::updated(updated)],
        &world.ctx(),
        &mut table
    ));
    assert_eq!(table.len(), 2);
    let new_mac = 0x0a00_0000_0010u128;
    assert!(table
        .flows_in_table(oftable::MAC_LOOKUP)
        .all(|f| f.key.match_.exact_value(MatchField::EthSrc) == Some(new_mac)));

    // And away entirely.
    world.snap.remove_mac_binding(mb.id);
    assert!(translator.handle_changed_mac_bindings(
        &[Tracked::deleted(mb)],
        &world.ctx(),
        &mut table
    ));
    assert!(table.is_empty());
}

#[test]
fn fdb_flows_and_changes() {
    let mut world = World::new();
    world.add_datapath(3, true);
    let fdb = FdbEntry {
        id: OwnerId::random(),
        mac: "0a:00:00:00:00:22".to_string(),
        dp_key: 3,
        port_key: 7,
    };
    world.snap.add_fdb(fdb.clone());

    let mut translator = Translator::new();
    let mut table = DesiredFlowTable::new();
    translator.run_full(&world.ctx(), &mut table);

    let get: Vec<_> = table.flows_in_table(oftable::GET_FDB).collect();
    assert_eq!(get.len(), 1);
    assert!(matches!(
        get[0].actions[..],
        [FlowAction::Load { field: MatchField::LogOutport, value: 7, .. }]
    ));
    let lookup: Vec<_> = table.flows_in_table(oftable::LOOKUP_FDB).collect();
    assert_eq!(lookup.len(), 1);
    assert_eq!(
        lookup[0].actions,
        vec![FlowAction::set_flag(flags::LOOKUP_FDB_BIT)]
    );

    world.snap.remove_fdb(fdb.id);
    assert!(translator.handle_changed_fdbs(
        &[Tracked::deleted(fdb)],
        &world.ctx(),
        &mut table
    ));
    assert!(table.is_empty());
}

#[test]
fn port_security_programs_both_directions() {
    let mut world = World::new();
    let dp = world.add_datapath(3, true);
    world.add_bound_port("p1", dp, 5, &["0a:00:00:00:00:01 10.0.0.4 fd00::4"]);

    let table = {
        let mut translator = Translator::new();
        let mut table = DesiredFlowTable::new();
        translator.run_full(&world.ctx(), &mut table);
        table
    };

    // In side: default deny plus the allows.
    let in_default: Vec<_> = table
        .flows_in_table(oftable::CHK_IN_PORT_SEC)
        .filter(|f| f.key.priority == 80)
        .collect();
    assert_eq!(in_default.len(), 1);
    assert_eq!(
        in_default[0].actions,
        vec![FlowAction::set_flag(flags::CHECK_PORT_SEC_BIT)]
    );

    // The ND-table default for neighbor solicitations *allows*; see the
    // port-security module for why.
    let ns_default: Vec<_> = table
        .flows_in_table(oftable::CHK_IN_PORT_SEC_ND)
        .filter(|f| {
            f.key.priority == 80
                && f.key.match_.exact_value(MatchField::IcmpType) == Some(135)
        })
        .collect();
    assert_eq!(ns_default.len(), 1);
    assert_eq!(
        ns_default[0].actions,
        vec![FlowAction::clear_flag(flags::CHECK_PORT_SEC_BIT)]
    );
    // While the advertisement default denies.
    let na_default: Vec<_> = table
        .flows_in_table(oftable::CHK_IN_PORT_SEC_ND)
        .filter(|f| {
            f.key.priority == 80
                && f.key.match_.exact_value(MatchField::IcmpType) == Some(136)
        })
        .collect();
    assert_eq!(
        na_default[0].actions,
        vec![FlowAction::set_flag(flags::CHECK_PORT_SEC_BIT)]
    );

    // The configured IPv4 source is allowed in.
    assert!(table
        .flows_in_table(oftable::CHK_IN_PORT_SEC)
        .any(|f| f.key.priority == 90
            && f.key.match_.exact_value(MatchField::Ip4Src)
                == Some(u32::from(Ipv4Addr::new(10, 0, 0, 4)) as u128)));

    // The DHCP request path is open.
    assert!(table
        .flows_in_table(oftable::CHK_IN_PORT_SEC)
        .any(|f| f.key.match_.exact_value(MatchField::Ip4Dst) == Some(0xffffffff)
            && f.key.match_.exact_value(MatchField::TpDst) == Some(67)));

    // Out side: default deny at 80, eth-only allow at 85, family deny
    // at 90, address allows at 95 (incl. broadcast and multicast).
    let out: Vec<_> = table.flows_in_table(oftable::CHK_OUT_PORT_SEC).collect();
    assert!(out.iter().any(|f| f.key.priority == 80));
    assert!(out.iter().any(|f| f.key.priority == 90
        && f.key.match_.exact_value(MatchField::EthType) == Some(0x0800)));
    assert!(out.iter().any(|f| f.key.priority == 95
        && f.key.match_.exact_value(MatchField::Ip4Dst) == Some(0xffffffff)));
    assert!(out.iter().any(|f| f.key.priority == 95
        && f.key.match_.exact_value(MatchField::Ip6Dst)
            == Some(u128::from(
                "fd00::4".parse::<std::net::Ipv6Addr>().unwrap()
            ))));
}

#[test]
fn lport_handler_reprograms_port_security() {
    let mut world = World::new();
    let dp = world.add_datapath(3, true);
    let pb = world.add_bound_port("p1", dp, 5, &["0a:00:00:00:00:01 10.0.0.4"]);

    let mut translator = Translator::new();
    let mut table = DesiredFlowTable::new();
    translator.run_full(&world.ctx(), &mut table);
    assert!(!table.is_empty());

    // The port loses its security entries: everything keyed on the
    // binding goes away.
    let mut released = pb.clone();
    released.port_security.clear();
    world.snap.remove_port_binding("p1");
    world.snap.add_port_binding(released.clone());
    assert!(translator.handle_flows_for_lport(&released, &world.ctx(), &mut table));
    assert!(table.is_empty());
}

#[test]
fn lb_deletion_releases_flows() {
    let mut world = World::new();
    let dp = world.add_datapath(1, true);
    let lb = LoadBalancer {
        id: OwnerId::random(),
        name: "lb1".to_string(),
        protocol: LbProto::Udp,
        vips: vec![LbVip {
            vip: IpAddr::V4(Ipv4Addr::new(88, 88, 88, 88)),
            vip_port: 53,
            backends: vec![LbBackend {
                ip: IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1)),
                port: 5353,
            }],
        }],
        datapaths: vec![dp],
        hairpin_orig_tuple: false,
        hairpin_snat_ips: Default::default(),
    };
    world.snap.add_load_balancer(lb.clone());

    let mut translator = Translator::new();
    let mut table = DesiredFlowTable::new();
    translator.run_full(&world.ctx(), &mut table);
    assert!(!table.is_empty());
    // Without hairpin_snat_ip the VIP flow SNATs directly at 100.
    assert!(table
        .flows_in_table(oftable::CT_SNAT_HAIRPIN)
        .all(|f| f.key.priority == 100));
    // ct-field matching requires a tracked, DNATted state first.
    assert!(table
        .flows_in_table(oftable::CHK_LB_HAIRPIN)
        .all(|f| f.key.match_.get(MatchField::CtState).is_some()));

    world.snap.remove_load_balancer(lb.id);
    assert!(translator.handle_changed_lbs(
        &[Tracked::deleted(lb)],
        &world.ctx(),
        &mut table
    ));
    assert!(table.is_empty());
}

#[test]
fn datapath_activation_translates_bound_rows() {
    let mut world = World::new();
    let dp = world.add_datapath(4, false);
    let r = LogicalRow {
        id: RowId::random(),
        pipeline: Pipeline::Ingress,
        table_id: 0,
        priority: 100,
        match_text: "ip4.src == 10.0.0.1".to_string(),
        actions: "next;".to_string(),
        controller_meter: None,
        binding: RowBinding::Datapath(dp),
        tags: HashMap::new(),
    };
    world.snap.add_row(r);
    let fdb = FdbEntry {
        id: OwnerId::random(),
        mac: "0a:00:00:00:00:22".to_string(),
        dp_key: 4,
        port_key: 7,
    };
    world.snap.add_fdb(fdb);

    let mut translator = Translator::new();
    let mut table = DesiredFlowTable::new();
    translator.run_full(&world.ctx(), &mut table);
    assert!(table.is_empty());

    // The datapath becomes local mid-cycle.
    world.state.local_datapaths.insert(4, dp);
    let dp_record = world.snap.datapath(dp).unwrap().clone();
    assert!(translator.add_flows_for_datapath(&dp_record, &[], &world.ctx(), &mut table));
    assert_eq!(table.flows_in_table(oftable::LOG_INGRESS_PIPELINE).count(), 1);
    assert_eq!(table.flows_in_table(oftable::GET_FDB).count(), 1);
    assert_eq!(table.flows_in_table(oftable::LOOKUP_FDB).count(), 1);

    translator.clear_processed_rows();
}

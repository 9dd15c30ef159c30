//! End-to-end scenarios: full translation, the incremental handlers and
//! their equivalence with a from-scratch rebuild.

use std::collections::{BTreeSet, HashMap};
use std::net::{IpAddr, Ipv4Addr};

use pretty_assertions::assert_eq;
use switchboard_data::{
    AddrConstant, AddrSetDiff, Datapath, DatapathGroup, DpGroupId, DpId, HaChassis,
    HaChassisGroup, LbBackend, LbProto, LbVip, LoadBalancer, LocalState, LogicalRow,
    MulticastGroup, OptionBags, OwnerId, Pipeline, PortBinding, RowBinding, RowId, Snapshot,
    Tracked,
};
use switchboard_flow::consts::oftable;
use switchboard_flow::{DesiredFlowTable, FlowAction, MatchField};
use switchboard_translate::{Ctx, RefKind, Translator};

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

    fn add_port(&mut self, name: &str, dp: DpId, tunnel_key: u32, related: bool) -> OwnerId {
        let dp_key = self.snap.datapath(dp).unwrap().tunnel_key;
        let pb = PortBinding {
            id: OwnerId::random(),
            name: name.to_string(),
            datapath: dp,
            tunnel_key,
            kind: String::new(),
            chassis: None,
            ha_chassis_group: None,
            port_security: Vec::new(),
        };
        let id = pb.id;
        self.snap.add_port_binding(pb);
        if related {
            self.state.related_lport_ids.insert((dp_key, tunnel_key));
        }
        id
    }
}

fn row(binding: RowBinding, match_text: &str, actions: &str) -> LogicalRow {
    LogicalRow {
        id: RowId::random(),
        pipeline: Pipeline::Ingress,
        table_id: 0,
        priority: 100,
        match_text: match_text.to_string(),
        actions: actions.to_string(),
        controller_meter: None,
        binding,
        tags: HashMap::new(),
    }
}

fn addrs(list: &[&str]) -> Vec<AddrConstant> {
    list.iter().map(|s| AddrConstant::parse(s).unwrap()).collect()
}

/// A fresh full translation of `world`, for equivalence checks.
fn full_rebuild(world: &World) -> DesiredFlowTable {
    let mut translator = Translator::new();
    let mut table = DesiredFlowTable::new();
    translator.run_full(&world.ctx(), &mut table);
    table
}

#[test]
fn datapath_group_translates_only_local_members() {
    let mut world = World::new();
    let dp1 = world.add_datapath(1, false);
    let dp2 = world.add_datapath(2, true);
    let dp3 = world.add_datapath(3, false);
    let group = DpGroupId::random();
    world.snap.add_dp_group(DatapathGroup {
        id: group,
        datapaths: vec![dp1, dp2, dp3],
    });
    world.snap.add_row(row(
        RowBinding::Group(group),
        "ip4.src == {10.0.0.1, 10.0.0.2}",
        "next;",
    ));

    let mut translator = Translator::new();
    let mut table = DesiredFlowTable::new();
    translator.run_full(&world.ctx(), &mut table);

    assert_eq!(table.len(), 2);
    for flow in table.flows() {
        assert_eq!(
            flow.key.match_.exact_value(MatchField::Metadata),
            Some(2),
            "all flows must carry the local datapath's tunnel key"
        );
    }
}

#[test]
fn rows_without_local_datapath_emit_nothing() {
    let mut world = World::new();
    let dp = world.add_datapath(7, false);
    world.snap.add_row(row(
        RowBinding::Datapath(dp),
        "ip4.src == 10.0.0.1",
        "next;",
    ));

    let table = full_rebuild(&world);
    assert!(table.is_empty());
}

#[test]
fn full_run_is_idempotent() {
    let mut world = World::new();
    let dp = world.add_datapath(2, true);
    world.add_port("p1", dp, 5, true);
    world.snap.set_addr_set("as1", addrs(&["1.1.1.1", "1.1.1.2"]));
    world.snap.add_row(row(
        RowBinding::Datapath(dp),
        "ip4.src == $as1",
        "next;",
    ));
    world
        .snap
        .add_row(row(RowBinding::Datapath(dp), r#"inport == "p1""#, "next;"));

    let mut translator = Translator::new();
    let mut table = DesiredFlowTable::new();
    translator.run_full(&world.ctx(), &mut table);
    let first = table.clone();
    translator.run_full(&world.ctx(), &mut table);
    assert_eq!(first, table);
}

#[test]
fn addr_set_addition_takes_the_fast_path() {
    let mut world = World::new();
    let dp = world.add_datapath(2, true);
    world
        .snap
        .set_addr_set("a", addrs(&["1.1.1.1", "1.1.1.2", "1.1.1.3"]));
    let r = row(RowBinding::Datapath(dp), "ip4.src == $a", "next;");
    let row_id = r.id;
    world.snap.add_row(r);

    let mut translator = Translator::new();
    let mut table = DesiredFlowTable::new();
    translator.run_full(&world.ctx(), &mut table);
    assert_eq!(table.len(), 3);

    // The set gains 1.1.1.4.
    world
        .snap
        .set_addr_set("a", addrs(&["1.1.1.1", "1.1.1.2", "1.1.1.3", "1.1.1.4"]));
    let diff = AddrSetDiff {
        added: addrs(&["1.1.1.4"]),
        deleted: vec![],
    };
    assert!(translator.handle_addr_set_update("a", &diff, &world.ctx(), &mut table));

    assert_eq!(table.len(), 4);
    let new_flow = table
        .flows()
        .find(|f| {
            f.key.match_.exact_value(MatchField::Ip4Src)
                == Some(u32::from(Ipv4Addr::new(1, 1, 1, 4)) as u128)
        })
        .expect("a flow for the added address");
    let annotation = new_flow.owners[&OwnerId::from(row_id)]
        .as_ref()
        .expect("the added flow is annotated");
    assert_eq!(annotation.set, "a");

    // Same sink contents as a full rebuild of the new state.
    assert_eq!(table, full_rebuild(&world));
}

#[test]
fn addr_set_deletion_takes_the_fast_path() {
    let mut world = World::new();
    let dp = world.add_datapath(2, true);
    world
        .snap
        .set_addr_set("a", addrs(&["1.1.1.1", "1.1.1.2", "1.1.1.3"]));
    world
        .snap
        .add_row(row(RowBinding::Datapath(dp), "ip4.src == $a", "next;"));

    let mut translator = Translator::new();
    let mut table = DesiredFlowTable::new();
    translator.run_full(&world.ctx(), &mut table);
    assert_eq!(table.len(), 3);

    world.snap.set_addr_set("a", addrs(&["1.1.1.1", "1.1.1.3"]));
    let diff = AddrSetDiff {
        added: vec![],
        deleted: addrs(&["1.1.1.2"]),
    };
    assert!(translator.handle_addr_set_update("a", &diff, &world.ctx(), &mut table));

    assert_eq!(table.len(), 2);
    assert!(table.flows().all(|f| {
        f.key.match_.exact_value(MatchField::Ip4Src)
            != Some(u32::from(Ipv4Addr::new(1, 1, 1, 2)) as u128)
    }));
    assert_eq!(table, full_rebuild(&world));
}

#[test]
fn addr_set_shrinking_to_one_is_not_handled() {
    let mut world = World::new();
    let dp = world.add_datapath(2, true);
    world.snap.set_addr_set("a", addrs(&["1.1.1.1", "1.1.1.2"]));
    world
        .snap
        .add_row(row(RowBinding::Datapath(dp), "ip4.src == $a", "next;"));

    let mut translator = Translator::new();
    let mut table = DesiredFlowTable::new();
    translator.run_full(&world.ctx(), &mut table);

    // Dropping to one element changes the compiled template.
    world.snap.set_addr_set("a", addrs(&["1.1.1.1"]));
    let diff = AddrSetDiff {
        added: vec![],
        deleted: addrs(&["1.1.1.2"]),
    };
    assert!(!translator.handle_addr_set_update("a", &diff, &world.ctx(), &mut table));
}

#[test]
fn missing_port_is_replayed_when_it_appears() {
    let mut world = World::new();
    let dp = world.add_datapath(2, true);
    let r = row(RowBinding::Datapath(dp), r#"inport == "p1""#, "next;");
    let row_id = r.id;
    world.snap.add_row(r);

    let mut translator = Translator::new();
    let mut table = DesiredFlowTable::new();
    translator.run_full(&world.ctx(), &mut table);

    // Nothing emitted, but the dependency is on record.
    assert!(table.is_empty());
    assert_eq!(
        translator
            .refs()
            .rows_for(RefKind::PortBinding, "p1")
            .map(|(row, _)| row)
            .collect::<Vec<_>>(),
        vec![row_id]
    );

    // The port appears on the local datapath.
    world.add_port("p1", dp, 5, true);
    assert!(translator.handle_changed_ref(RefKind::PortBinding, "p1", &world.ctx(), &mut table));

    assert_eq!(table.len(), 1);
    let flow = table.flows().next().unwrap();
    assert_eq!(flow.key.match_.exact_value(MatchField::LogInport), Some(5));
    assert_eq!(table, full_rebuild(&world));
}

#[test]
fn multicast_group_resolution_is_replayed() {
    let mut world = World::new();
    let dp = world.add_datapath(2, true);
    world
        .snap
        .add_row(row(RowBinding::Datapath(dp), r#"outport == "mg1""#, "next;"));

    let mut translator = Translator::new();
    let mut table = DesiredFlowTable::new();
    translator.run_full(&world.ctx(), &mut table);
    assert!(table.is_empty());

    let mg = MulticastGroup {
        datapath: dp,
        name: "mg1".to_string(),
        tunnel_key: 9,
    };
    world.snap.add_mc_group(mg.clone());
    assert!(translator.handle_changed_mc_groups(
        &[Tracked::new(mg)],
        &world.ctx(),
        &mut table
    ));

    assert_eq!(table.len(), 1);
    assert_eq!(
        table
            .flows()
            .next()
            .unwrap()
            .key
            .match_
            .exact_value(MatchField::LogOutport),
        Some(9)
    );
}

#[test]
fn chassis_residence_change_is_replayed() {
    let mut world = World::new();
    let dp = world.add_datapath(2, true);
    let group = HaChassisGroup {
        members: vec![
            HaChassis {
                chassis: "hv1".to_string(),
                priority: 10,
            },
            HaChassis {
                chassis: "hv2".to_string(),
                priority: 20,
            },
        ],
    };
    world.snap.add_port_binding(PortBinding {
        id: OwnerId::random(),
        name: "cr1".to_string(),
        datapath: dp,
        tunnel_key: 11,
        kind: "chassisredirect".to_string(),
        chassis: None,
        ha_chassis_group: Some(group),
        port_security: Vec::new(),
    });
    world.state.active_tunnels.insert("hv2".to_string());
    world.snap.add_row(row(
        RowBinding::Datapath(dp),
        r#"is_chassis_resident("cr1") && ip4.dst == 10.0.0.7"#,
        "next;",
    ));

    let mut translator = Translator::new();
    let mut table = DesiredFlowTable::new();
    translator.run_full(&world.ctx(), &mut table);
    // hv2 outranks us and is reachable: nothing emitted.
    assert!(table.is_empty());

    // hv2's tunnel goes down; the group fails over to this chassis.
    world.state.active_tunnels.clear();
    assert!(translator.handle_changed_ref(RefKind::PortBinding, "cr1", &world.ctx(), &mut table));
    assert_eq!(table.len(), 1);
    assert_eq!(table, full_rebuild(&world));
}

#[test]
fn changed_rows_flood_shared_conjunction_flows() {
    let mut world = World::new();
    let dp = world.add_datapath(2, true);
    let row_a = row(
        RowBinding::Datapath(dp),
        "ip4.src == {10.0.0.1, 10.0.0.2} && tcp.dst == {80, 443}",
        "next;",
    );
    let row_b = row(
        RowBinding::Datapath(dp),
        "ip4.src == {10.0.0.1, 10.0.0.2} && tcp.dst == {8080, 8443}",
        "next;",
    );
    world.snap.add_row(row_a.clone());
    world.snap.add_row(row_b.clone());

    let mut translator = Translator::new();
    let mut table = DesiredFlowTable::new();
    translator.run_full(&world.ctx(), &mut table);

    // The ip4.src clause flows are shared between both rows.
    let shared = table.flows().filter(|f| f.owners.len() == 2).count();
    assert_eq!(shared, 2);

    // Replaying row A must drag row B along (its clauses were removed
    // with the shared flows) and leave an equivalent table.
    assert!(translator.handle_changed_rows(
        &[Tracked::updated(row_a)],
        &world.ctx(),
        &mut table
    ));
    assert_eq!(shape(&table), shape(&full_rebuild(&world)));
    translator.clear_processed_rows();
}

#[test]
fn change_handlers_are_idempotent_within_a_cycle() {
    let mut world = World::new();
    let dp = world.add_datapath(2, true);
    let r = row(RowBinding::Datapath(dp), "ip4.src == 10.0.0.1", "next;");
    world.snap.add_row(r.clone());

    let mut translator = Translator::new();
    let mut table = DesiredFlowTable::new();
    translator.run_full(&world.ctx(), &mut table);

    let tracked = [Tracked::updated(r)];
    assert!(translator.handle_changed_rows(&tracked, &world.ctx(), &mut table));
    let after_first = table.clone();
    // A second delivery in the same cycle is a no-op.
    assert!(translator.handle_changed_rows(&tracked, &world.ctx(), &mut table));
    assert_eq!(after_first, table);

    translator.clear_processed_rows();
    assert!(translator.handle_changed_rows(&tracked, &world.ctx(), &mut table));
    assert_eq!(after_first, table);
}

#[test]
fn deleted_rows_lose_their_flows_and_references() {
    let mut world = World::new();
    let dp = world.add_datapath(2, true);
    world.snap.set_addr_set("a", addrs(&["1.1.1.1", "1.1.1.2"]));
    let r = row(RowBinding::Datapath(dp), "ip4.src == $a", "next;");
    let row_id = r.id;
    world.snap.add_row(r.clone());

    let mut translator = Translator::new();
    let mut table = DesiredFlowTable::new();
    translator.run_full(&world.ctx(), &mut table);
    assert_eq!(table.len(), 2);

    world.snap.remove_row(row_id);
    assert!(translator.handle_changed_rows(
        &[Tracked::deleted(r)],
        &world.ctx(),
        &mut table
    ));
    assert!(table.is_empty());
    assert_eq!(translator.refs().rows_for(RefKind::AddrSet, "a").count(), 0);
}

#[test]
fn cached_conjunction_rows_survive_recompute() {
    let mut world = World::new();
    let dp = world.add_datapath(2, true);
    world.snap.add_row(row(
        RowBinding::Datapath(dp),
        "ip4.src == {10.0.0.1, 10.0.0.2} && tcp.dst == {80, 443}",
        "next;",
    ));

    let mut translator = Translator::new();
    let mut table = DesiredFlowTable::new();
    translator.run_full(&world.ctx(), &mut table);
    let first = table.clone();
    assert_eq!(translator.cache().len(), 1);

    // Second recompute reuses the cached matches (and re-claims the
    // recorded conjunction slice).
    translator.run_full(&world.ctx(), &mut table);
    assert_eq!(first, table);
}

#[test]
fn rows_with_references_never_cache_matches() {
    let mut world = World::new();
    let dp = world.add_datapath(2, true);
    world.add_port("p1", dp, 5, true);
    world.snap.set_addr_set("a", addrs(&["1.1.1.1", "1.1.1.2"]));

    let set_row = row(RowBinding::Datapath(dp), "ip4.src == $a", "next;");
    let port_row = row(RowBinding::Datapath(dp), r#"inport == "p1""#, "next;");
    let plain_row = row(RowBinding::Datapath(dp), "ip4.src == 10.0.0.3", "next;");
    let (set_id, port_id, plain_id) = (set_row.id, port_row.id, plain_row.id);
    world.snap.add_row(set_row);
    world.snap.add_row(port_row);
    world.snap.add_row(plain_row);

    let mut translator = Translator::new();
    let mut table = DesiredFlowTable::new();
    translator.run_full(&world.ctx(), &mut table);

    use switchboard_translate::CacheEntry;
    // Set references: nothing cacheable at all.
    assert!(translator.cache_mut().get(set_id).is_none());
    // Port-binding reference: the expression may be cached, the matches
    // may not.
    assert!(matches!(
        translator.cache_mut().get(port_id),
        Some(CacheEntry::Expr { .. })
    ));
    // No references at all: fully expanded matches.
    assert!(matches!(
        translator.cache_mut().get(plain_id),
        Some(CacheEntry::Matches { .. })
    ));
}

#[test]
fn controller_meters_are_assigned_and_survive_exhaustion() {
    let mut world = World::new();
    let dp = world.add_datapath(2, true);
    let mut metered = row(RowBinding::Datapath(dp), "ip4.src == 10.0.0.1", "next;");
    metered.controller_meter = Some("acl-meter".to_string());
    world.snap.add_row(metered);

    let mut translator = Translator::new();
    let mut table = DesiredFlowTable::new();
    translator.run_full(&world.ctx(), &mut table);
    let flow = table.flows().next().unwrap();
    assert!(flow.key.meter.is_some());
}

#[test]
fn lb_hairpin_flows_with_snat_ip() {
    let mut world = World::new();
    let d1 = world.add_datapath(1, true);
    let d2 = world.add_datapath(2, true);
    let lb = LoadBalancer {
        id: OwnerId::random(),
        name: "lb1".to_string(),
        protocol: LbProto::Tcp,
        vips: vec![LbVip {
            vip: IpAddr::V4(Ipv4Addr::new(88, 88, 88, 88)),
            vip_port: 80,
            backends: vec![
                LbBackend {
                    ip: IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1)),
                    port: 8080,
                },
                LbBackend {
                    ip: IpAddr::V4(Ipv4Addr::new(10, 0, 0, 2)),
                    port: 8080,
                },
            ],
        }],
        datapaths: vec![d1, d2],
        hairpin_orig_tuple: true,
        hairpin_snat_ips: switchboard_data::HairpinSnatIps {
            v4: Some(Ipv4Addr::new(99, 99, 99, 99)),
            v6: None,
        },
    };
    world.snap.add_load_balancer(lb);

    let table = full_rebuild(&world);

    // One detection rule per backend.
    let detections: Vec<_> = table.flows_in_table(oftable::CHK_LB_HAIRPIN).collect();
    assert_eq!(detections.len(), 2);
    assert!(detections.iter().all(|f| f.key.priority == 100));

    let snat: Vec<_> = table.flows_in_table(oftable::CT_SNAT_HAIRPIN).collect();
    // One conjunctive VIP flow, two datapath clauses, one v4 SNAT
    // finish rule.
    assert_eq!(snat.len(), 4);
    assert!(snat.iter().all(|f| f.key.priority == 200));

    let vip_clauses: Vec<_> = snat
        .iter()
        .filter(|f| {
            f.actions
                .iter()
                .any(|a| matches!(a, FlowAction::Conjunction { clause: 1, .. }))
        })
        .collect();
    assert_eq!(vip_clauses.len(), 1);

    let dp_clauses: BTreeSet<u128> = snat
        .iter()
        .filter(|f| {
            f.actions
                .iter()
                .any(|a| matches!(a, FlowAction::Conjunction { clause: 0, .. }))
        })
        .filter_map(|f| f.key.match_.exact_value(MatchField::Metadata))
        .collect();
    assert_eq!(dp_clauses, BTreeSet::from([1, 2]));

    let finish: Vec<_> = snat
        .iter()
        .filter(|f| f.key.match_.get(MatchField::ConjId).is_some())
        .collect();
    assert_eq!(finish.len(), 1);
    assert!(matches!(
        finish[0].actions[..],
        [FlowAction::CtSnat { v6: false, addr }] if addr == u32::from(Ipv4Addr::new(99, 99, 99, 99)) as u128
    ));
}

/// Table contents with conjunction ids erased, for equivalence checks
/// where id assignment legitimately differs between incremental and
/// from-scratch translation.
fn shape(
    table: &DesiredFlowTable,
) -> BTreeSet<(u8, u16, String, Vec<String>, usize)> {
    table
        .flows()
        .map(|f| {
            let mut m = f.key.match_.clone();
            if m.get(MatchField::ConjId).is_some() {
                m.set(MatchField::ConjId, 0);
            }
            let mut actions: Vec<String> = f
                .actions
                .iter()
                .map(|a| match a {
                    FlowAction::Conjunction {
                        clause, n_clauses, ..
                    } => format!("conj/{clause}/{n_clauses}"),
                    other => format!("{other:?}"),
                })
                .collect();
            actions.sort();
            (
                f.key.table,
                f.key.priority,
                format!("{m:?}"),
                actions,
                f.owners.len(),
            )
        })
        .collect()
}

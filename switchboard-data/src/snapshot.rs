//! The read-only input snapshot and per-chassis runtime state.

use std::collections::{HashMap, HashSet};

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

use crate::addr::AddrConstant;
use crate::ids::{DpGroupId, DpId, OwnerId, RowId};
use crate::records::{
    Datapath, DatapathGroup, FdbEntry, LoadBalancer, LogicalRow, MacBinding, MulticastGroup,
    PortBinding, RowBinding, StaticMacBinding,
};

/// A consistent view of all translator inputs, together with the name and
/// datapath indexes the translator looks things up through.
///
/// The indexes are maintained by the `add_*`/`remove_*` mutators; callers
/// build a snapshot once per cycle (or carry one forward and apply the
/// tracked changes to it before invoking the handlers).
#[derive(Clone, Debug, Default)]
pub struct Snapshot {
    rows: IndexMap<RowId, LogicalRow>,
    datapaths: IndexMap<DpId, Datapath>,
    dp_groups: IndexMap<DpGroupId, DatapathGroup>,
    port_bindings: IndexMap<OwnerId, PortBinding>,
    mc_groups: HashMap<(DpId, String), MulticastGroup>,
    mac_bindings: IndexMap<OwnerId, MacBinding>,
    static_mac_bindings: IndexMap<OwnerId, StaticMacBinding>,
    fdbs: IndexMap<OwnerId, FdbEntry>,
    load_balancers: IndexMap<OwnerId, LoadBalancer>,
    addr_sets: HashMap<String, Vec<AddrConstant>>,
    port_groups: HashMap<String, Vec<String>>,

    pb_by_name: HashMap<String, OwnerId>,
    rows_by_dp: HashMap<DpId, Vec<RowId>>,
    rows_by_group: HashMap<DpGroupId, Vec<RowId>>,
}

impl Snapshot {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_row(&mut self, row: LogicalRow) {
        match row.binding {
            RowBinding::Datapath(dp) => self.rows_by_dp.entry(dp).or_default().push(row.id),
            RowBinding::Group(g) => self.rows_by_group.entry(g).or_default().push(row.id),
        }
        self.rows.insert(row.id, row);
    }

    pub fn remove_row(&mut self, id: RowId) -> Option<LogicalRow> {
        let row = self.rows.shift_remove(&id)?;
        match row.binding {
            RowBinding::Datapath(dp) => {
                if let Some(v) = self.rows_by_dp.get_mut(&dp) {
                    v.retain(|r| *r != id);
                }
            }
            RowBinding::Group(g) => {
                if let Some(v) = self.rows_by_group.get_mut(&g) {
                    v.retain(|r| *r != id);
                }
            }
        }
        Some(row)
    }

    pub fn add_datapath(&mut self, dp: Datapath) {
        self.datapaths.insert(dp.id, dp);
    }

    pub fn add_dp_group(&mut self, group: DatapathGroup) {
        self.dp_groups.insert(group.id, group);
    }

    pub fn add_port_binding(&mut self, pb: PortBinding) {
        self.pb_by_name.insert(pb.name.clone(), pb.id);
        self.port_bindings.insert(pb.id, pb);
    }

    pub fn remove_port_binding(&mut self, name: &str) -> Option<PortBinding> {
        let id = self.pb_by_name.remove(name)?;
        self.port_bindings.shift_remove(&id)
    }

    pub fn add_mc_group(&mut self, mg: MulticastGroup) {
        self.mc_groups.insert((mg.datapath, mg.name.clone()), mg);
    }

    pub fn remove_mc_group(&mut self, dp: DpId, name: &str) -> Option<MulticastGroup> {
        self.mc_groups.remove(&(dp, name.to_string()))
    }

    pub fn add_mac_binding(&mut self, mb: MacBinding) {
        self.mac_bindings.insert(mb.id, mb);
    }

    pub fn remove_mac_binding(&mut self, id: OwnerId) -> Option<MacBinding> {
        self.mac_bindings.shift_remove(&id)
    }

    pub fn add_static_mac_binding(&mut self, smb: StaticMacBinding) {
        self.static_mac_bindings.insert(smb.id, smb);
    }

    pub fn add_fdb(&mut self, fdb: FdbEntry) {
        self.fdbs.insert(fdb.id, fdb);
    }

    pub fn remove_fdb(&mut self, id: OwnerId) -> Option<FdbEntry> {
        self.fdbs.shift_remove(&id)
    }

    pub fn add_load_balancer(&mut self, lb: LoadBalancer) {
        self.load_balancers.insert(lb.id, lb);
    }

    pub fn remove_load_balancer(&mut self, id: OwnerId) -> Option<LoadBalancer> {
        self.load_balancers.shift_remove(&id)
    }

    pub fn set_addr_set(&mut self, name: impl Into<String>, addrs: Vec<AddrConstant>) {
        self.addr_sets.insert(name.into(), addrs);
    }

    pub fn remove_addr_set(&mut self, name: &str) -> Option<Vec<AddrConstant>> {
        self.addr_sets.remove(name)
    }

    pub fn set_port_group(&mut self, name: impl Into<String>, ports: Vec<String>) {
        self.port_groups.insert(name.into(), ports);
    }

    // Lookups.

    pub fn rows(&self) -> impl Iterator<Item = &LogicalRow> {
        self.rows.values()
    }

    pub fn row(&self, id: RowId) -> Option<&LogicalRow> {
        self.rows.get(&id)
    }

    pub fn datapath(&self, id: DpId) -> Option<&Datapath> {
        self.datapaths.get(&id)
    }

    pub fn dp_group(&self, id: DpGroupId) -> Option<&DatapathGroup> {
        self.dp_groups.get(&id)
    }

    pub fn port_binding_by_name(&self, name: &str) -> Option<&PortBinding> {
        self.pb_by_name
            .get(name)
            .and_then(|id| self.port_bindings.get(id))
    }

    pub fn mc_group(&self, dp: DpId, name: &str) -> Option<&MulticastGroup> {
        self.mc_groups.get(&(dp, name.to_string()))
    }

    pub fn mac_bindings(&self) -> impl Iterator<Item = &MacBinding> {
        self.mac_bindings.values()
    }

    pub fn static_mac_bindings(&self) -> impl Iterator<Item = &StaticMacBinding> {
        self.static_mac_bindings.values()
    }

    pub fn fdbs(&self) -> impl Iterator<Item = &FdbEntry> {
        self.fdbs.values()
    }

    pub fn load_balancers(&self) -> impl Iterator<Item = &LoadBalancer> {
        self.load_balancers.values()
    }

    pub fn port_bindings(&self) -> impl Iterator<Item = &PortBinding> {
        self.port_bindings.values()
    }

    pub fn addr_set(&self, name: &str) -> Option<&[AddrConstant]> {
        self.addr_sets.get(name).map(Vec::as_slice)
    }

    pub fn port_group(&self, name: &str) -> Option<&[String]> {
        self.port_groups.get(name).map(Vec::as_slice)
    }

    /// Rows bound directly to `dp`.
    pub fn rows_for_datapath(&self, dp: DpId) -> impl Iterator<Item = &LogicalRow> {
        self.rows_by_dp
            .get(&dp)
            .into_iter()
            .flatten()
            .filter_map(|id| self.rows.get(id))
    }

    /// Rows bound to any group containing `dp`. There are far fewer
    /// datapath groups than rows, so scanning the groups is fine.
    pub fn rows_for_group_member(&self, dp: DpId) -> impl Iterator<Item = &LogicalRow> + '_ {
        self.dp_groups
            .values()
            .filter(move |g| g.datapaths.contains(&dp))
            .flat_map(|g| self.rows_by_group.get(&g.id).into_iter().flatten())
            .filter_map(|id| self.rows.get(id))
    }

    pub fn mac_bindings_for_datapath(&self, dp: DpId) -> impl Iterator<Item = &MacBinding> {
        self.mac_bindings.values().filter(move |mb| mb.datapath == dp)
    }

    pub fn static_mac_bindings_for_datapath(
        &self,
        dp: DpId,
    ) -> impl Iterator<Item = &StaticMacBinding> {
        self.static_mac_bindings
            .values()
            .filter(move |smb| smb.datapath == dp)
    }

    pub fn fdbs_for_dp_key(&self, dp_key: u64) -> impl Iterator<Item = &FdbEntry> {
        self.fdbs.values().filter(move |f| f.dp_key == dp_key)
    }
}

/// Per-chassis runtime state: what is local, bound and reachable from
/// here.
#[derive(Clone, Debug, Default)]
pub struct LocalState {
    /// This chassis' name.
    pub chassis: String,
    /// Chassis names reachable over an active tunnel.
    pub active_tunnels: HashSet<String>,
    /// Datapaths instantiated on this chassis, keyed by tunnel key.
    pub local_datapaths: HashMap<u64, DpId>,
    /// `(datapath tunnel key, port tunnel key)` pairs for ports related
    /// to this chassis.
    pub related_lport_ids: HashSet<(u64, u32)>,
    /// Tunnel OpenFlow port towards each remote chassis.
    pub chassis_tunnels: HashMap<String, u32>,
    /// Logical ports claimed by this chassis.
    pub bound_lports: HashSet<String>,
    /// Emit the legacy CT-label variant of hairpin detection rules next
    /// to the CT-mark one.
    pub check_ct_label_for_lb_hairpin: bool,
}

impl LocalState {
    pub fn local_datapath(&self, tunnel_key: u64) -> Option<DpId> {
        self.local_datapaths.get(&tunnel_key).copied()
    }

    pub fn is_related_port(&self, dp_key: u64, port_key: u32) -> bool {
        self.related_lport_ids.contains(&(dp_key, port_key))
    }
}

/// Definition of one named DHCP/ND-RA option.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct OptDef {
    pub code: u8,
    pub kind: String,
}

/// The option bags the action parser validates option names against.
#[derive(Clone, Debug, Default)]
pub struct OptionBags {
    pub dhcp_opts: HashMap<String, OptDef>,
    pub dhcpv6_opts: HashMap<String, OptDef>,
    pub nd_ra_opts: HashMap<String, OptDef>,
    pub controller_events: HashSet<String>,
}

impl OptionBags {
    /// The fixed ND-RA options and controller events; DHCP options come
    /// from the database tables and are filled in by the caller.
    pub fn standard() -> Self {
        let mut bags = OptionBags::default();
        for (name, code, kind) in [
            ("addr_mode", 0u8, "str"),
            ("slla", 1, "mac"),
            ("mtu", 2, "ipv4"),
            ("prefix", 3, "ipv6"),
        ] {
            bags.nd_ra_opts.insert(
                name.to_string(),
                OptDef {
                    code,
                    kind: kind.to_string(),
                },
            );
        }
        bags.controller_events.insert("empty_lb_backends".to_string());
        bags
    }
}

//! Input records: the logical pipeline and its ancillary tables.

use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

use serde::{Deserialize, Serialize};

use crate::addr::AddrConstant;
use crate::ids::{DpGroupId, DpId, OwnerId, RowId};

/// Which logical pipeline a row belongs to.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Pipeline {
    Ingress,
    Egress,
}

/// The datapath binding of a row: either a single datapath or a datapath
/// group, never both.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum RowBinding {
    Datapath(DpId),
    Group(DpGroupId),
}

/// One declarative entry in the logical pipeline.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogicalRow {
    pub id: RowId,
    pub pipeline: Pipeline,
    /// Logical table id, in `[0, LOG_PIPELINE_LEN)`.
    pub table_id: u8,
    pub priority: u16,
    pub match_text: String,
    pub actions: String,
    pub controller_meter: Option<String>,
    pub binding: RowBinding,
    /// Free-form tags; `in_out_port` gates translation on a port's
    /// locality.
    pub tags: HashMap<String, String>,
}

impl LogicalRow {
    pub fn in_out_port(&self) -> Option<&str> {
        self.tags.get("in_out_port").map(String::as_str)
    }
}

/// A virtual switch or router.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Datapath {
    pub id: DpId,
    pub tunnel_key: u64,
    pub is_switch: bool,
    /// Arbitrary metadata; a `snat-ct-zone` entry switches the common
    /// NAT zone used when encoding actions.
    pub external_ids: HashMap<String, String>,
}

/// A set of datapaths sharing logical rows.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DatapathGroup {
    pub id: DpGroupId,
    pub datapaths: Vec<DpId>,
}

/// One member of an HA chassis group.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct HaChassis {
    pub chassis: String,
    pub priority: i32,
}

/// The HA chassis group a chassis-redirect port fails over across.
#[derive(Clone, Debug, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct HaChassisGroup {
    pub members: Vec<HaChassis>,
}

impl HaChassisGroup {
    pub fn contains(&self, chassis: &str) -> bool {
        self.members.iter().any(|m| m.chassis == chassis)
    }

    /// Whether `chassis` is the active member: the highest-priority
    /// member that is either `chassis` itself or reachable over an
    /// active tunnel.
    pub fn is_active(
        &self,
        chassis: &str,
        active_tunnels: &std::collections::HashSet<String>,
    ) -> bool {
        self.members
            .iter()
            .filter(|m| m.chassis == chassis || active_tunnels.contains(&m.chassis))
            .max_by_key(|m| m.priority)
            .is_some_and(|m| m.chassis == chassis)
    }
}

/// A logical port bound to a datapath.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortBinding {
    pub id: OwnerId,
    /// The logical port name rows reference.
    pub name: String,
    pub datapath: DpId,
    pub tunnel_key: u32,
    /// Port type; `"chassisredirect"` ports resolve residence through
    /// their HA chassis group.
    pub kind: String,
    pub chassis: Option<String>,
    pub ha_chassis_group: Option<HaChassisGroup>,
    /// Raw port-security entries, `"<mac> [<ip>...]"` each.
    pub port_security: Vec<String>,
}

/// A named multicast group on one datapath.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct MulticastGroup {
    pub datapath: DpId,
    pub name: String,
    pub tunnel_key: u32,
}

/// The composite key multicast groups are indexed and referenced under.
/// A group only exists per datapath, so the reference must not collide
/// across datapaths sharing a group name.
pub fn mc_group_key(name: &str, dp_tunnel_key: u64) -> String {
    format!("{name}@{dp_tunnel_key}")
}

/// A dynamically learnt MAC/IP binding on a logical port.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct MacBinding {
    pub id: OwnerId,
    pub logical_port: String,
    pub ip: String,
    pub mac: String,
    pub datapath: DpId,
}

/// A statically configured MAC/IP binding.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct StaticMacBinding {
    pub id: OwnerId,
    pub logical_port: String,
    pub ip: String,
    pub mac: String,
    pub datapath: DpId,
    /// When set, this binding outranks dynamically learnt ones.
    pub override_dynamic_mac: bool,
}

/// One learnt (datapath, MAC) → port entry.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct FdbEntry {
    pub id: OwnerId,
    pub mac: String,
    pub dp_key: u64,
    pub port_key: u32,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum LbProto {
    #[default]
    Tcp,
    Udp,
    Sctp,
}

impl LbProto {
    pub fn ip_proto(self) -> u8 {
        match self {
            LbProto::Tcp => 6,
            LbProto::Udp => 17,
            LbProto::Sctp => 132,
        }
    }
}

/// One backend of a load-balancer VIP.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct LbBackend {
    pub ip: IpAddr,
    /// 0 when the VIP has no L4 port.
    pub port: u16,
}

/// One VIP of a load balancer with its backends.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct LbVip {
    pub vip: IpAddr,
    pub vip_port: u16,
    pub backends: Vec<LbBackend>,
}

/// SNAT addresses to use for hairpin traffic instead of the VIP.
#[derive(Clone, Debug, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct HairpinSnatIps {
    pub v4: Option<Ipv4Addr>,
    pub v6: Option<Ipv6Addr>,
}

impl HairpinSnatIps {
    pub fn is_empty(&self) -> bool {
        self.v4.is_none() && self.v6.is_none()
    }
}

/// A load balancer as seen by the translator.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoadBalancer {
    pub id: OwnerId,
    pub name: String,
    pub protocol: LbProto,
    pub vips: Vec<LbVip>,
    pub datapaths: Vec<DpId>,
    /// Whether the forwarding plane stored the original destination
    /// tuple in registers (newer central controllers) or we must match
    /// conntrack fields directly.
    pub hairpin_orig_tuple: bool,
    pub hairpin_snat_ips: HairpinSnatIps,
}

/// An observed mutation of a named address set.
#[derive(Clone, Debug, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct AddrSetDiff {
    pub added: Vec<AddrConstant>,
    pub deleted: Vec<AddrConstant>,
}

/// How a tracked record changed since the last cycle.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Change {
    New,
    Updated,
    Deleted,
}

/// A tracked-change view entry. For deletions the payload carries the
/// record's last-known content.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Tracked<T> {
    pub change: Change,
    pub item: T,
}

impl<T> Tracked<T> {
    pub fn new(item: T) -> Self {
        Tracked {
            change: Change::New,
            item,
        }
    }

    pub fn updated(item: T) -> Self {
        Tracked {
            change: Change::Updated,
            item,
        }
    }

    pub fn deleted(item: T) -> Self {
        Tracked {
            change: Change::Deleted,
            item,
        }
    }

    pub fn is_new(&self) -> bool {
        self.change == Change::New
    }

    pub fn is_deleted(&self) -> bool {
        self.change == Change::Deleted
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn ha_group_activity_follows_priority() {
        let group = HaChassisGroup {
            members: vec![
                HaChassis {
                    chassis: "hv1".into(),
                    priority: 10,
                },
                HaChassis {
                    chassis: "hv2".into(),
                    priority: 20,
                },
            ],
        };
        let mut tunnels = HashSet::new();
        // hv2 unreachable: hv1 is the best live member.
        assert!(group.is_active("hv1", &tunnels));
        tunnels.insert("hv2".to_string());
        assert!(!group.is_active("hv1", &tunnels));
        assert!(group.is_active("hv2", &tunnels));
        assert!(!group.is_active("hv3", &tunnels));
    }
}

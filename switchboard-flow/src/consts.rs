//! Physical table ids, logical-flags bits and CT-state constants.
//!
//! The table layout mirrors the forwarding-plane agent's pipeline; the
//! ids are plumbed through to the staging table untouched.

/// Physical OpenFlow table ids.
pub mod oftable {
    /// First table of the logical ingress pipeline; logical table N maps
    /// to `LOG_INGRESS_PIPELINE + N`.
    pub const LOG_INGRESS_PIPELINE: u8 = 8;
    /// Output staging for remote datapaths (ingress side).
    pub const REMOTE_OUTPUT: u8 = 37;
    pub const LOCAL_OUTPUT: u8 = 38;
    /// First table of the logical egress pipeline.
    pub const LOG_EGRESS_PIPELINE: u8 = 40;
    /// Saves the input port before egress processing.
    pub const SAVE_INPORT: u8 = 64;
    /// ARP/ND binding lookup by (datapath, outport, ip): sets eth.dst.
    pub const MAC_BINDING: u8 = 66;
    /// ARP/ND origin check by (datapath, inport, eth.src, ip).
    pub const MAC_LOOKUP: u8 = 67;
    /// Load-balancer hairpin detection.
    pub const CHK_LB_HAIRPIN: u8 = 68;
    /// Learnt reply-direction hairpin detection.
    pub const CHK_LB_HAIRPIN_REPLY: u8 = 69;
    /// SNAT for detected hairpin traffic.
    pub const CT_SNAT_HAIRPIN: u8 = 70;
    pub const GET_FDB: u8 = 71;
    pub const LOOKUP_FDB: u8 = 72;
    pub const CHK_IN_PORT_SEC: u8 = 73;
    pub const CHK_IN_PORT_SEC_ND: u8 = 74;
    pub const CHK_OUT_PORT_SEC: u8 = 75;
    pub const CHK_OUT_PORT_SEC_ND: u8 = 76;
}

/// Bit offsets in the logical-flags register.
pub mod flags {
    pub const LOOKUP_MAC_BIT: u8 = 6;
    pub const LOOKUP_LB_HAIRPIN_BIT: u8 = 7;
    pub const LOOKUP_FDB_BIT: u8 = 8;
    pub const CHECK_PORT_SEC_BIT: u8 = 10;
}

/// Conntrack state bits (as exposed by the forwarding plane).
pub mod ct_state {
    pub const TRACKED: u32 = 0x20;
    pub const DST_NAT: u32 = 0x80;
}

/// Conntrack mark bits owned by the controller.
pub mod ct_mark {
    /// Set on connections that were NATted by a load balancer.
    pub const NATTED: u32 = 1 << 1;
}

/// Register allocation for logical fields (documented here, encoded in
/// [`crate::flow::MatchField`] variants).
pub mod regs {
    /// 32-bit register holding the load-balancer original destination
    /// IPv4.
    pub const LB_ORIG_DIP_IPV4: u8 = 1;
    /// 32-bit register holding the original destination L4 port in its
    /// low 16 bits.
    pub const LB_ORIG_TP_DPORT: u8 = 2;
    /// 128-bit register holding the original destination IPv6.
    pub const LB_ORIG_DIP_IPV6: u8 = 1;
}

/// Number of logical tables per pipeline.
pub const LOG_PIPELINE_LEN: u8 = 32;

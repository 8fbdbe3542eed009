//! Flow-rule descriptors.
//!
//! A [`FlowRule`] is a table/priority/match plus an ordered action list. Its
//! `Display` form is the textual syntax accepted by `ovs-ofctl add-flow`, and
//! a [`FlowMatch`] alone renders the syntax accepted by `del-flows`.

use hostagent_types::{LocalTag, MacAddress, TunnelId};
use std::fmt;
use std::net::Ipv4Addr;

/// Flow-table numbers of the two-bridge layout.
pub mod table {
    /// Entry table on both bridges
    pub const CLASSIFIER: u8 = 0;
    /// br-tun: traffic arriving from the integration bridge
    pub const FROM_INTEGRATION: u8 = 2;
    /// br-tun: traffic arriving from a tunnel, keyed by tunnel id
    pub const TUNNEL_INGRESS: u8 = 4;
    /// br-tun: known unicast destinations
    pub const UNICAST: u8 = 20;
    /// br-tun: flood / unknown destinations
    pub const FLOOD: u8 = 22;
    pub const ARP_RESPONDER: u8 = 51;
    pub const ICMP_RESPONDER: u8 = 52;
}

/// A single match field.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum MatchField {
    InPort(String),
    TunnelId(TunnelId),
    Vlan(LocalTag),
    EthSrc(MacAddress),
    EthDst(MacAddress),
    Arp,
    ArpOp(u16),
    Ip,
    Icmp,
    IcmpType(u8),
    Ipv4Dst(Ipv4Addr),
}

impl fmt::Display for MatchField {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MatchField::InPort(port) => write!(f, "in_port={}", port),
            MatchField::TunnelId(id) => write!(f, "tun_id={}", id),
            MatchField::Vlan(tag) => write!(f, "dl_vlan={}", tag),
            MatchField::EthSrc(mac) => write!(f, "dl_src={}", mac),
            MatchField::EthDst(mac) => write!(f, "dl_dst={}", mac),
            MatchField::Arp => write!(f, "arp"),
            MatchField::ArpOp(op) => write!(f, "arp_op={}", op),
            MatchField::Ip => write!(f, "ip"),
            MatchField::Icmp => write!(f, "icmp"),
            MatchField::IcmpType(t) => write!(f, "icmp_type={}", t),
            MatchField::Ipv4Dst(ip) => write!(f, "nw_dst={}", ip),
        }
    }
}

/// Table, optional priority and match fields of a rule.
///
/// A match without a priority can only be used for non-strict removal.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct FlowMatch {
    pub table: u8,
    pub priority: Option<u16>,
    pub fields: Vec<MatchField>,
}

impl FlowMatch {
    pub fn new(table: u8) -> Self {
        Self {
            table,
            priority: None,
            fields: Vec::new(),
        }
    }

    pub fn priority(mut self, priority: u16) -> Self {
        self.priority = Some(priority);
        self
    }

    pub fn with(mut self, field: MatchField) -> Self {
        self.fields.push(field);
        self
    }

    /// Strict equality as used by `del-flows --strict`: same table,
    /// same priority, same field set.
    pub fn same_as(&self, other: &FlowMatch) -> bool {
        self.table == other.table
            && self.priority == other.priority
            && self.fields.len() == other.fields.len()
            && self.fields.iter().all(|f| other.fields.contains(f))
    }

    /// Non-strict containment: `other` is in the same table and carries every
    /// field of `self`. Priority is ignored.
    pub fn covers(&self, other: &FlowMatch) -> bool {
        self.table == other.table && self.fields.iter().all(|f| other.fields.contains(f))
    }
}

impl fmt::Display for FlowMatch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "table={}", self.table)?;
        if let Some(priority) = self.priority {
            write!(f, ",priority={}", priority)?;
        }
        for field in &self.fields {
            write!(f, ",{}", field)?;
        }
        Ok(())
    }
}

/// A single action, or a fixed action sequence for the responders.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum FlowAction {
    SetVlan(LocalTag),
    StripVlan,
    SetTunnelId(TunnelId),
    SetTunnelDst(Ipv4Addr),
    SetEthSrc(MacAddress),
    SetEthDst(MacAddress),
    Output(String),
    /// Send back out of the port the packet arrived on
    InPort,
    Normal,
    Resubmit(u8),
    /// Turn an ARP request into a reply for `ip` answered by `mac`
    ArpReply { ip: Ipv4Addr, mac: MacAddress },
    /// Turn an ICMP echo request into a reply from the gateway
    IcmpEchoReply { ip: Ipv4Addr, mac: MacAddress },
}

impl fmt::Display for FlowAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FlowAction::SetVlan(tag) => write!(f, "mod_vlan_vid:{}", tag),
            FlowAction::StripVlan => write!(f, "strip_vlan"),
            FlowAction::SetTunnelId(id) => write!(f, "load:{}->NXM_NX_TUN_ID[]", id),
            FlowAction::SetTunnelDst(ip) => write!(f, "set_field:{}->tun_dst", ip),
            FlowAction::SetEthSrc(mac) => write!(f, "mod_dl_src:{}", mac),
            FlowAction::SetEthDst(mac) => write!(f, "mod_dl_dst:{}", mac),
            FlowAction::Output(port) => write!(f, "output:{}", port),
            FlowAction::InPort => write!(f, "in_port"),
            FlowAction::Normal => write!(f, "NORMAL"),
            FlowAction::Resubmit(t) => write!(f, "resubmit(,{})", t),
            FlowAction::ArpReply { ip, mac } => write!(
                f,
                "move:NXM_OF_ETH_SRC[]->NXM_OF_ETH_DST[],mod_dl_src:{mac},\
                 load:0x2->NXM_OF_ARP_OP[],\
                 move:NXM_NX_ARP_SHA[]->NXM_NX_ARP_THA[],\
                 move:NXM_OF_ARP_SPA[]->NXM_OF_ARP_TPA[],\
                 load:{hex}->NXM_NX_ARP_SHA[],\
                 load:0x{ip:08x}->NXM_OF_ARP_SPA[],in_port",
                mac = mac,
                hex = mac.to_hex(),
                ip = u32::from(*ip),
            ),
            FlowAction::IcmpEchoReply { ip, mac } => write!(
                f,
                "move:NXM_OF_ETH_SRC[]->NXM_OF_ETH_DST[],mod_dl_src:{mac},\
                 move:NXM_OF_IP_SRC[]->NXM_OF_IP_DST[],mod_nw_src:{ip},\
                 load:0xff->NXM_NX_IP_TTL[],load:0->NXM_OF_ICMP_TYPE[],in_port",
                mac = mac,
                ip = ip,
            ),
        }
    }
}

/// A complete rule: match plus actions.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct FlowRule {
    pub flow_match: FlowMatch,
    pub actions: Vec<FlowAction>,
}

impl FlowRule {
    pub fn new(flow_match: FlowMatch, actions: Vec<FlowAction>) -> Self {
        Self {
            flow_match,
            actions,
        }
    }

    pub fn table(&self) -> u8 {
        self.flow_match.table
    }
}

impl fmt::Display for FlowRule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} actions=", self.flow_match)?;
        for (i, action) in self.actions.iter().enumerate() {
            if i > 0 {
                write!(f, ",")?;
            }
            write!(f, "{}", action)?;
        }
        Ok(())
    }
}

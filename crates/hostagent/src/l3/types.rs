//! L3 programmer types.

use crate::goal_state::DestinationType;
use hostagent_types::{Ipv4Cidr, LocalTag, MacAddress, NetworkType, TunnelId};
use serde::Serialize;
use std::collections::BTreeMap;
use std::net::Ipv4Addr;

#[derive(Debug, Clone, Default)]
pub struct L3ProgrammerConfig {
    /// This host's underlay address; neighbors on it are delivered locally.
    pub local_host_ip: Option<Ipv4Addr>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RoutingRule {
    pub id: String,
    pub destination: Ipv4Cidr,
    pub next_hop_ip: Ipv4Addr,
    pub priority: u32,
    pub destination_type: DestinationType,
    pub next_hop_mac: Option<MacAddress>,
}

/// A remote port routed through a subnet's gateway.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct NeighborPort {
    pub virtual_ip: Ipv4Addr,
    pub virtual_mac: MacAddress,
    pub host_ip: Ipv4Addr,
}

/// One subnet attached to a router. The gateway is fixed at attach time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SubnetRoutingTable {
    pub subnet_id: String,
    pub vpc_id: String,
    pub network_type: NetworkType,
    pub cidr: Ipv4Cidr,
    pub tunnel_id: TunnelId,
    pub local_tag: LocalTag,
    pub gateway_ip: Ipv4Addr,
    pub gateway_mac: MacAddress,
    pub routing_rules: BTreeMap<String, RoutingRule>,
    pub neighbor_ports: BTreeMap<String, NeighborPort>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RouterEntry {
    pub router_id: String,
    pub host_dvr_mac: MacAddress,
    pub subnets: BTreeMap<String, SubnetRoutingTable>,
}

/// Arguments of an L3 neighbor create or update.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct L3NeighborRequest {
    pub neighbor_id: String,
    pub vpc_id: String,
    pub subnet_id: String,
    pub virtual_ip: String,
    pub virtual_mac: String,
    pub remote_host_ip: String,
    pub tunnel_id: TunnelId,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct L3ProgrammerStats {
    pub routers_created: u64,
    pub routers_updated: u64,
    pub routers_deleted: u64,
    pub subnets_attached: u64,
    pub subnets_detached: u64,
    pub routing_rules_applied: u64,
    pub l3_neighbors_programmed: u64,
    pub l3_neighbors_removed: u64,
    pub errors: u64,
}

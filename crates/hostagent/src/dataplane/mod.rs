//! Virtual switch collaborators.
//!
//! The programmers never speak a switch protocol themselves. They call the
//! traits below, which a backend implements:
//!
//! - [`OvsCliDataplane`]: drives the stock `ovs-vsctl` / `ovs-ofctl` tools
//! - [`InMemoryDataplane`]: records every call; used by tests and dry runs
//!
//! All calls are synchronous and may block; the agent runs goal-state
//! applies on blocking worker threads.

mod flow;
mod memory;
mod ovs_cli;
pub mod rules;

pub use flow::{table, FlowAction, FlowMatch, FlowRule, MatchField};
pub use memory::{FaultPoint, InMemoryDataplane, PacketOut};
pub use ovs_cli::{shellquote, OvsCliDataplane};

use hostagent_common::AgentResult;
use hostagent_types::{LocalTag, MacAddress, NetworkType};
use std::net::Ipv4Addr;
use std::sync::Arc;

pub const BRIDGE_INTEGRATION: &str = "br-int";
pub const BRIDGE_TUNNEL: &str = "br-tun";
/// Patch port on br-int, peer of [`PATCH_TO_INTEGRATION`]
pub const PATCH_TO_TUNNEL: &str = "patch-tun";
/// Patch port on br-tun, peer of [`PATCH_TO_TUNNEL`]
pub const PATCH_TO_INTEGRATION: &str = "patch-int";

/// Identifies the switch control connection a packet-in arrived on.
pub type ConnectionId = u64;

/// Bridge and port management (the configuration database side).
pub trait SwitchTopologyClient: Send + Sync {
    fn bridge_exists(&self, bridge: &str) -> AgentResult<bool>;

    fn add_bridge(&self, bridge: &str) -> AgentResult<()>;

    fn add_patch_port(&self, bridge: &str, port: &str, peer: &str) -> AgentResult<()>;

    /// Adds a flow-based tunnel port whose remote endpoint comes from `tun_dst`.
    fn add_tunnel_port(&self, bridge: &str, port: &str, network_type: NetworkType) -> AgentResult<()>;

    /// Sets the access tag on an existing port. Fails with `Upstream` when the
    /// port does not exist yet.
    fn attach_port(&self, port_name: &str, tag: LocalTag) -> AgentResult<()>;

    fn detach_port(&self, port_name: &str) -> AgentResult<()>;

    /// Injects `packet` into `bridge` and outputs it on `out_port`.
    fn packet_out(
        &self,
        connection: ConnectionId,
        bridge: &str,
        out_port: u32,
        packet: &[u8],
    ) -> AgentResult<()>;
}

/// Flow-table programming.
pub trait FlowTableClient: Send + Sync {
    /// Adds a rule, replacing any rule with an identical match.
    fn install(&self, bridge: &str, rule: &FlowRule) -> AgentResult<()>;

    /// Removes rules. With `strict`, only the rule whose table, priority and
    /// fields equal `flow_match`; otherwise every rule the match covers.
    fn remove(&self, bridge: &str, flow_match: &FlowMatch, strict: bool) -> AgentResult<()>;

    fn flow_exists(&self, bridge: &str, flow_match: &FlowMatch) -> AgentResult<bool>;
}

/// The agent-local ARP table consulted by the ARP responder.
pub trait AddressResolutionClient: Send + Sync {
    fn upsert(&self, ip: Ipv4Addr, mac: MacAddress, tag: LocalTag) -> AgentResult<()>;

    fn remove(&self, ip: Ipv4Addr, mac: MacAddress, tag: LocalTag) -> AgentResult<()>;

    fn exists(&self, ip: Ipv4Addr, tag: LocalTag) -> bool;
}

/// Answers a buffered ARP request from the agent-local ARP table.
pub trait ArpResponder: Send + Sync {
    fn respond(&self, connection: ConnectionId, ingress_port: u32, packet: &[u8]) -> AgentResult<()>;
}

/// Handles DHCP requests punted to the agent.
pub trait DhcpResponder: Send + Sync {
    fn handle(&self, connection: ConnectionId, ingress_port: u32, packet: &[u8]) -> AgentResult<()>;
}

/// The switch-facing collaborators shared by the programmers.
#[derive(Clone)]
pub struct SwitchClients {
    pub topology: Arc<dyn SwitchTopologyClient>,
    pub flows: Arc<dyn FlowTableClient>,
    pub address_resolution: Arc<dyn AddressResolutionClient>,
}

impl SwitchClients {
    /// Uses one in-memory backend for every concern.
    pub fn in_memory(dataplane: Arc<InMemoryDataplane>) -> Self {
        Self {
            topology: dataplane.clone(),
            flows: dataplane.clone(),
            address_resolution: dataplane,
        }
    }
}

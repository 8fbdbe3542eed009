//! In-memory switch backend.
//!
//! Keeps bridges, ports, flow tables and the ARP table in process memory with
//! the same replace/strict/non-strict semantics as the real switch, and can be
//! told to fail specific calls.

use super::{
    AddressResolutionClient, ArpResponder, ConnectionId, DhcpResponder, FlowMatch, FlowRule,
    FlowTableClient, SwitchTopologyClient, BRIDGE_INTEGRATION, BRIDGE_TUNNEL,
};
use hostagent_common::{AgentError, AgentResult};
use hostagent_types::{LocalTag, MacAddress, NetworkType};
use parking_lot::Mutex;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::net::Ipv4Addr;

/// Calls that can be made to fail with `Upstream`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FaultPoint {
    Install,
    Remove,
    AttachPort,
    DetachPort,
    PacketOut,
    AddressUpsert,
    AddressRemove,
    ArpRespond,
}

/// A packet handed back to the switch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PacketOut {
    pub connection: ConnectionId,
    pub bridge: String,
    pub out_port: u32,
    pub packet: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum PortKind {
    Patch { peer: String },
    Tunnel(NetworkType),
    Vm,
}

#[derive(Debug, Clone)]
struct PortRecord {
    bridge: String,
    kind: PortKind,
    tag: Option<LocalTag>,
}

#[derive(Debug, Default)]
struct State {
    bridges: BTreeSet<String>,
    ports: BTreeMap<String, PortRecord>,
    flows: Vec<(String, FlowRule)>,
    arp_entries: HashMap<(Ipv4Addr, LocalTag), MacAddress>,
    packet_outs: Vec<PacketOut>,
    arp_responses: Vec<PacketOut>,
    dhcp_packets: Vec<PacketOut>,
    faults: HashMap<FaultPoint, usize>,
}

impl State {
    fn check_fault(&mut self, point: FaultPoint, operation: &str) -> AgentResult<()> {
        if let Some(remaining) = self.faults.get_mut(&point) {
            if *remaining > 0 {
                *remaining -= 1;
                return Err(AgentError::upstream(operation, "injected fault"));
            }
        }
        Ok(())
    }
}

/// Switch backend kept entirely in memory.
#[derive(Debug)]
pub struct InMemoryDataplane {
    state: Mutex<State>,
    auto_create_ports: bool,
}

impl InMemoryDataplane {
    /// Ports named in `attach_port` are created on br-int on demand.
    pub fn new() -> Self {
        Self {
            state: Mutex::new(State::default()),
            auto_create_ports: true,
        }
    }

    /// `attach_port` fails until the port is added with [`Self::add_vm_port`].
    pub fn with_strict_ports() -> Self {
        Self {
            state: Mutex::new(State::default()),
            auto_create_ports: false,
        }
    }

    /// Simulates the compute service plugging a VM interface into br-int.
    pub fn add_vm_port(&self, port_name: &str) {
        self.state.lock().ports.insert(
            port_name.to_string(),
            PortRecord {
                bridge: BRIDGE_INTEGRATION.to_string(),
                kind: PortKind::Vm,
                tag: None,
            },
        );
    }

    /// Makes the next `count` calls at `point` fail.
    pub fn inject_fault(&self, point: FaultPoint, count: usize) {
        self.state.lock().faults.insert(point, count);
    }

    pub fn bridges(&self) -> Vec<String> {
        self.state.lock().bridges.iter().cloned().collect()
    }

    pub fn has_port(&self, port_name: &str) -> bool {
        self.state.lock().ports.contains_key(port_name)
    }

    pub fn port_tag(&self, port_name: &str) -> Option<LocalTag> {
        self.state.lock().ports.get(port_name).and_then(|p| p.tag)
    }

    pub fn port_bridge(&self, port_name: &str) -> Option<String> {
        self.state.lock().ports.get(port_name).map(|p| p.bridge.clone())
    }

    pub fn patch_peer(&self, port_name: &str) -> Option<String> {
        match self.state.lock().ports.get(port_name).map(|p| &p.kind) {
            Some(PortKind::Patch { peer }) => Some(peer.clone()),
            _ => None,
        }
    }

    pub fn tunnel_port_type(&self, port_name: &str) -> Option<NetworkType> {
        match self.state.lock().ports.get(port_name).map(|p| &p.kind) {
            Some(PortKind::Tunnel(network_type)) => Some(*network_type),
            _ => None,
        }
    }

    pub fn flows(&self, bridge: &str) -> Vec<FlowRule> {
        self.state
            .lock()
            .flows
            .iter()
            .filter(|(b, _)| b == bridge)
            .map(|(_, rule)| rule.clone())
            .collect()
    }

    pub fn flow_count(&self, bridge: &str) -> usize {
        self.state.lock().flows.iter().filter(|(b, _)| b == bridge).count()
    }

    /// Returns the installed rule whose match equals `flow_match` strictly.
    pub fn find_flow(&self, bridge: &str, flow_match: &FlowMatch) -> Option<FlowRule> {
        self.state
            .lock()
            .flows
            .iter()
            .find(|(b, rule)| b == bridge && rule.flow_match.same_as(flow_match))
            .map(|(_, rule)| rule.clone())
    }

    pub fn arp_entry(&self, ip: Ipv4Addr, tag: LocalTag) -> Option<MacAddress> {
        self.state.lock().arp_entries.get(&(ip, tag)).copied()
    }

    pub fn arp_entry_count(&self) -> usize {
        self.state.lock().arp_entries.len()
    }

    pub fn packet_outs(&self) -> Vec<PacketOut> {
        self.state.lock().packet_outs.clone()
    }

    pub fn arp_responses(&self) -> Vec<PacketOut> {
        self.state.lock().arp_responses.clone()
    }

    pub fn dhcp_packets(&self) -> Vec<PacketOut> {
        self.state.lock().dhcp_packets.clone()
    }
}

impl Default for InMemoryDataplane {
    fn default() -> Self {
        Self::new()
    }
}

impl SwitchTopologyClient for InMemoryDataplane {
    fn bridge_exists(&self, bridge: &str) -> AgentResult<bool> {
        Ok(self.state.lock().bridges.contains(bridge))
    }

    fn add_bridge(&self, bridge: &str) -> AgentResult<()> {
        self.state.lock().bridges.insert(bridge.to_string());
        Ok(())
    }

    fn add_patch_port(&self, bridge: &str, port: &str, peer: &str) -> AgentResult<()> {
        let mut state = self.state.lock();
        if !state.bridges.contains(bridge) {
            return Err(AgentError::upstream(
                "add_patch_port",
                format!("no bridge named {}", bridge),
            ));
        }
        state.ports.insert(
            port.to_string(),
            PortRecord {
                bridge: bridge.to_string(),
                kind: PortKind::Patch {
                    peer: peer.to_string(),
                },
                tag: None,
            },
        );
        Ok(())
    }

    fn add_tunnel_port(&self, bridge: &str, port: &str, network_type: NetworkType) -> AgentResult<()> {
        let mut state = self.state.lock();
        if !state.bridges.contains(bridge) {
            return Err(AgentError::upstream(
                "add_tunnel_port",
                format!("no bridge named {}", bridge),
            ));
        }
        state.ports.insert(
            port.to_string(),
            PortRecord {
                bridge: bridge.to_string(),
                kind: PortKind::Tunnel(network_type),
                tag: None,
            },
        );
        Ok(())
    }

    fn attach_port(&self, port_name: &str, tag: LocalTag) -> AgentResult<()> {
        let mut state = self.state.lock();
        state.check_fault(FaultPoint::AttachPort, "attach_port")?;
        match state.ports.get_mut(port_name) {
            Some(port) => {
                port.tag = Some(tag);
                Ok(())
            }
            None if self.auto_create_ports => {
                state.ports.insert(
                    port_name.to_string(),
                    PortRecord {
                        bridge: BRIDGE_INTEGRATION.to_string(),
                        kind: PortKind::Vm,
                        tag: Some(tag),
                    },
                );
                Ok(())
            }
            None => Err(AgentError::upstream(
                "attach_port",
                format!("no port named {}", port_name),
            )),
        }
    }

    fn detach_port(&self, port_name: &str) -> AgentResult<()> {
        let mut state = self.state.lock();
        state.check_fault(FaultPoint::DetachPort, "detach_port")?;
        match state.ports.get_mut(port_name) {
            Some(port) => {
                port.tag = None;
                Ok(())
            }
            None => Err(AgentError::upstream(
                "detach_port",
                format!("no port named {}", port_name),
            )),
        }
    }

    fn packet_out(
        &self,
        connection: ConnectionId,
        bridge: &str,
        out_port: u32,
        packet: &[u8],
    ) -> AgentResult<()> {
        let mut state = self.state.lock();
        state.check_fault(FaultPoint::PacketOut, "packet_out")?;
        state.packet_outs.push(PacketOut {
            connection,
            bridge: bridge.to_string(),
            out_port,
            packet: packet.to_vec(),
        });
        Ok(())
    }
}

impl FlowTableClient for InMemoryDataplane {
    fn install(&self, bridge: &str, rule: &FlowRule) -> AgentResult<()> {
        let mut state = self.state.lock();
        state.check_fault(FaultPoint::Install, "install_flow")?;
        if !state.bridges.contains(bridge) {
            return Err(AgentError::upstream(
                "install_flow",
                format!("no bridge named {}", bridge),
            ));
        }
        match state
            .flows
            .iter_mut()
            .find(|(b, existing)| b == bridge && existing.flow_match.same_as(&rule.flow_match))
        {
            Some((_, existing)) => *existing = rule.clone(),
            None => state.flows.push((bridge.to_string(), rule.clone())),
        }
        Ok(())
    }

    fn remove(&self, bridge: &str, flow_match: &FlowMatch, strict: bool) -> AgentResult<()> {
        let mut state = self.state.lock();
        state.check_fault(FaultPoint::Remove, "remove_flow")?;
        state.flows.retain(|(b, rule)| {
            let hit = if strict {
                flow_match.same_as(&rule.flow_match)
            } else {
                flow_match.covers(&rule.flow_match)
            };
            !(b == bridge && hit)
        });
        Ok(())
    }

    fn flow_exists(&self, bridge: &str, flow_match: &FlowMatch) -> AgentResult<bool> {
        Ok(self
            .state
            .lock()
            .flows
            .iter()
            .any(|(b, rule)| b == bridge && flow_match.covers(&rule.flow_match)))
    }
}

impl AddressResolutionClient for InMemoryDataplane {
    fn upsert(&self, ip: Ipv4Addr, mac: MacAddress, tag: LocalTag) -> AgentResult<()> {
        let mut state = self.state.lock();
        state.check_fault(FaultPoint::AddressUpsert, "arp_upsert")?;
        state.arp_entries.insert((ip, tag), mac);
        Ok(())
    }

    fn remove(&self, ip: Ipv4Addr, mac: MacAddress, tag: LocalTag) -> AgentResult<()> {
        let mut state = self.state.lock();
        state.check_fault(FaultPoint::AddressRemove, "arp_remove")?;
        if state.arp_entries.get(&(ip, tag)) == Some(&mac) {
            state.arp_entries.remove(&(ip, tag));
        }
        Ok(())
    }

    fn exists(&self, ip: Ipv4Addr, tag: LocalTag) -> bool {
        self.state.lock().arp_entries.contains_key(&(ip, tag))
    }
}

impl ArpResponder for InMemoryDataplane {
    fn respond(&self, connection: ConnectionId, ingress_port: u32, packet: &[u8]) -> AgentResult<()> {
        let mut state = self.state.lock();
        state.check_fault(FaultPoint::ArpRespond, "arp_respond")?;
        state.arp_responses.push(PacketOut {
            connection,
            bridge: BRIDGE_TUNNEL.to_string(),
            out_port: ingress_port,
            packet: packet.to_vec(),
        });
        Ok(())
    }
}

impl DhcpResponder for InMemoryDataplane {
    fn handle(&self, connection: ConnectionId, ingress_port: u32, packet: &[u8]) -> AgentResult<()> {
        self.state.lock().dhcp_packets.push(PacketOut {
            connection,
            bridge: BRIDGE_INTEGRATION.to_string(),
            out_port: ingress_port,
            packet: packet.to_vec(),
        });
        Ok(())
    }
}

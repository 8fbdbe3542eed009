//! Goal-state records pushed by the orchestrator.
//!
//! Everything deserializes from the orchestrator's JSON encoding. Addresses
//! stay as strings here and are validated by the programmers, so a malformed
//! field fails only the resource that carries it.

use hostagent_common::{AggregateCode, OperationStatus};
use hostagent_types::{NetworkType, TunnelId};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OperationType {
    Create,
    Update,
    Delete,
    Info,
}

impl OperationType {
    pub fn is_upsert(&self) -> bool {
        matches!(self, OperationType::Create | OperationType::Update)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum UpdateKind {
    #[default]
    Full,
    Delta,
}

/// One goal-state message. Subnets travel as `Info` companions referenced by
/// id from ports and routers.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GoalState {
    pub port_states: Vec<PortState>,
    pub neighbor_states: Vec<NeighborState>,
    pub router_states: Vec<RouterState>,
    pub subnet_states: Vec<SubnetState>,
}

impl GoalState {
    pub fn is_empty(&self) -> bool {
        self.port_states.is_empty()
            && self.neighbor_states.is_empty()
            && self.router_states.is_empty()
            && self.subnet_states.is_empty()
    }

    pub fn subnet(&self, subnet_id: &str) -> Option<&SubnetConfiguration> {
        self.subnet_states
            .iter()
            .map(|s| &s.configuration)
            .find(|s| s.id == subnet_id)
    }

    pub fn subnet_configurations(&self) -> Vec<SubnetConfiguration> {
        self.subnet_states
            .iter()
            .map(|s| s.configuration.clone())
            .collect()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FixedIp {
    pub subnet_id: String,
    pub ip_address: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortState {
    pub operation_type: OperationType,
    pub configuration: PortConfiguration,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortConfiguration {
    pub id: String,
    #[serde(default)]
    pub update_kind: UpdateKind,
    pub vpc_id: String,
    /// Switch port name; derived from the id when absent.
    #[serde(default)]
    pub name: Option<String>,
    pub mac_address: String,
    #[serde(default)]
    pub fixed_ips: Vec<FixedIp>,
}

impl PortConfiguration {
    /// Interface name the compute service gives the port: `tap` plus the
    /// first 11 characters of the port id.
    pub fn port_name(&self) -> String {
        match &self.name {
            Some(name) if !name.is_empty() => name.clone(),
            _ => format!("tap{}", self.id.chars().take(11).collect::<String>()),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum NeighborType {
    L2,
    L3,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NeighborState {
    pub operation_type: OperationType,
    pub configuration: NeighborConfiguration,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NeighborConfiguration {
    pub id: String,
    pub vpc_id: String,
    pub neighbor_type: NeighborType,
    pub mac_address: String,
    pub host_ip_address: String,
    #[serde(default)]
    pub fixed_ips: Vec<FixedIp>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RouterState {
    pub operation_type: OperationType,
    pub configuration: RouterConfiguration,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RouterConfiguration {
    pub id: String,
    #[serde(default)]
    pub update_kind: UpdateKind,
    pub host_dvr_mac_address: String,
    #[serde(default)]
    pub subnet_routing_tables: Vec<SubnetRoutingTableConfig>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubnetRoutingTableConfig {
    pub subnet_id: String,
    #[serde(default)]
    pub routing_rules: Vec<RoutingRuleConfig>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DestinationType {
    #[default]
    Internet,
    Vpc,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoutingRuleConfig {
    pub id: String,
    pub operation_type: OperationType,
    pub destination: String,
    pub next_hop_ip: String,
    #[serde(default)]
    pub priority: u32,
    #[serde(default)]
    pub destination_type: DestinationType,
    #[serde(default)]
    pub next_hop_mac: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubnetState {
    pub operation_type: OperationType,
    pub configuration: SubnetConfiguration,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubnetConfiguration {
    pub id: String,
    pub vpc_id: String,
    #[serde(default)]
    pub network_type: NetworkType,
    pub cidr: String,
    pub tunnel_id: TunnelId,
    pub gateway: GatewayConfig,
    #[serde(default)]
    pub standby_gateway_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GatewayConfig {
    pub ip_address: String,
    pub mac_address: String,
}

/// Kind of resource a [`ResourceStatus`] reports on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ResourceType {
    Port,
    Neighbor,
    Router,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceStatus {
    pub resource_id: String,
    pub resource_type: ResourceType,
    pub operation: OperationType,
    pub status: OperationStatus,
    pub dataplane_programming_time_us: u64,
    pub network_configuration_time_us: u64,
    pub total_time_us: u64,
}

/// Result of applying one [`GoalState`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GoalStateReply {
    pub statuses: Vec<ResourceStatus>,
    pub aggregate: AggregateCode,
    pub total_time_us: u64,
}

impl GoalStateReply {
    pub fn status_of(&self, resource_id: &str) -> Option<OperationStatus> {
        self.statuses
            .iter()
            .find(|s| s.resource_id == resource_id)
            .map(|s| s.status)
    }
}

//! Goal-state records and the handler that applies them.

mod handler;
mod types;

pub use handler::GoalStateHandler;
pub use types::{
    DestinationType, FixedIp, GatewayConfig, GoalState, GoalStateReply, NeighborConfiguration,
    NeighborState, NeighborType, OperationType, PortConfiguration, PortState, ResourceStatus,
    ResourceType, RouterConfiguration, RouterState, RoutingRuleConfig, SubnetConfiguration,
    SubnetRoutingTableConfig, SubnetState, UpdateKind,
};

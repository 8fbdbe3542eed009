//! L3 dataplane programming: routers, their subnets and routed neighbors.

mod programmer;
mod types;

pub use programmer::L3Programmer;
pub use types::{
    L3NeighborRequest, L3ProgrammerConfig, L3ProgrammerStats, NeighborPort, RouterEntry,
    RoutingRule, SubnetRoutingTable,
};

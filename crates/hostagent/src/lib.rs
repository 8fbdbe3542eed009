//! hostagent - per-host overlay network agent
//!
//! Turns goal-state messages from a central orchestrator into virtual switch
//! state on one compute host: local VM ports, remote L2 neighbors, routers
//! and routed (L3) neighbors. Traffic the switch cannot forward is punted to
//! the agent, which asks the orchestrator for the missing goal state and
//! replays the packet once it lands.
//!
//! ```text
//! goal state ──> [GoalStateHandler] ──> [L2Programmer] ──┐
//!                        │                   ▲           ├──> switch collaborators
//!                        └──────────> [L3Programmer] ────┘     (topology, flows, ARP table)
//!                                            │
//!                                  [TunnelRegistry]  tunnel id <-> local VLAN tag
//!                                            │
//! packet-in ──> [OnDemandEngine] ──> orchestrator ──> completion queue ──> replay
//! ```
//!
//! # Key Components
//!
//! - [`registry::TunnelRegistry`]: tunnel id to local tag allocation and port membership
//! - [`l2::L2Programmer`]: bridge bootstrap, local ports and L2 neighbors
//! - [`l3::L3Programmer`]: distributed routers, gateways and L3 neighbors
//! - [`on_demand::OnDemandEngine`]: packet-in buffering and resolution replay
//! - [`goal_state::GoalStateHandler`]: applies one goal-state message
//! - [`daemon::HostAgent`]: owns the above and runs the background tasks

#[macro_use]
pub mod audit;

pub mod config;
pub mod daemon;
pub mod dataplane;
pub mod goal_state;
pub mod l2;
pub mod l3;
pub mod on_demand;
pub mod registry;

mod validate;

pub use audit::{init_logging, init_logging_pretty, AuditCategory, AuditOutcome, AuditRecord};
pub use config::{AgentConfig, ConfigError};
pub use daemon::{HostAgent, HostAgentCollaborators};

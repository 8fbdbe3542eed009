//! Tunnel/VLAN registry.
//!
//! Maps overlay tunnel ids onto host-local VLAN tags and tracks which local
//! ports belong to each tunnel. The registry never talks to the switch; it
//! tells callers when a tunnel gained its first member or lost its last one.

mod tunnels;
mod types;

pub use tunnels::TunnelRegistry;
pub use types::{MembershipChange, RegistryStats, TunnelEntry};

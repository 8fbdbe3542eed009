//! L2 programmer types.

use hostagent_types::{LocalTag, MacAddress, TunnelId};
use serde::Serialize;
use std::net::Ipv4Addr;
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct L2ProgrammerConfig {
    /// Attempts made to tag a port that did not exist yet
    pub port_tag_retry_max: u32,
    pub port_tag_retry_interval: Duration,
}

impl Default for L2ProgrammerConfig {
    fn default() -> Self {
        Self {
            port_tag_retry_max: 300,
            port_tag_retry_interval: Duration::from_millis(1000),
        }
    }
}

/// How far a `create_port` got.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PortProgramming {
    Programmed,
    /// Identical create seen before; nothing was changed.
    AlreadyProgrammed,
    /// Registered, but the switch port is not tagged yet; a retry task is running.
    InProgress,
}

/// A local port as last requested by the orchestrator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PortRecord {
    pub vpc_id: String,
    pub virtual_ip: Ipv4Addr,
    pub virtual_mac: MacAddress,
    pub tunnel_id: TunnelId,
    pub local_tag: LocalTag,
    /// The switch port carries `local_tag`
    pub tagged: bool,
}

impl PortRecord {
    pub(crate) fn same_config(&self, other: &PortRecord) -> bool {
        self.vpc_id == other.vpc_id
            && self.virtual_ip == other.virtual_ip
            && self.virtual_mac == other.virtual_mac
            && self.tunnel_id == other.tunnel_id
    }
}

/// One programmed remote L2 neighbor, keyed by tag and mac.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct L2NeighborRecord {
    pub local_tag: LocalTag,
    pub virtual_ip: Ipv4Addr,
    pub virtual_mac: MacAddress,
    pub remote_host_ip: Ipv4Addr,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct L2ProgrammerStats {
    pub bridge_bootstraps: u64,
    pub ports_created: u64,
    pub ports_deleted: u64,
    pub duplicate_creates: u64,
    pub neighbors_programmed: u64,
    pub neighbors_removed: u64,
    pub port_tag_retries_started: u64,
    pub port_tag_retries_succeeded: u64,
    pub port_tag_retries_exhausted: u64,
    pub errors: u64,
}

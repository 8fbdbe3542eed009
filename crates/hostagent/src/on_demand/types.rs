//! On-demand resolution types.

use crate::dataplane::ConnectionId;
use hostagent_common::OperationStatus;
use hostagent_types::{LocalTag, TunnelId};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::Ipv4Addr;
use std::time::Duration;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Protocol {
    Tcp,
    Udp,
    Icmp,
    Arp,
}

impl Protocol {
    /// Maps an IPv4 protocol number.
    pub fn from_ip_proto(proto: u8) -> Option<Self> {
        match proto {
            1 => Some(Protocol::Icmp),
            6 => Some(Protocol::Tcp),
            17 => Some(Protocol::Udp),
            _ => None,
        }
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Protocol::Tcp => write!(f, "tcp"),
            Protocol::Udp => write!(f, "udp"),
            Protocol::Icmp => write!(f, "icmp"),
            Protocol::Arp => write!(f, "arp"),
        }
    }
}

/// What the orchestrator is asked to resolve.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ResolutionKey {
    pub vlan_tag: LocalTag,
    pub src_ip: Ipv4Addr,
    pub dst_ip: Ipv4Addr,
    pub src_port: u16,
    pub dst_port: u16,
    pub protocol: Protocol,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResolutionRequest {
    pub request_id: Uuid,
    pub tunnel_id: TunnelId,
    pub key: ResolutionKey,
}

/// Completion delivered by the orchestrator client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResolutionReply {
    pub request_id: Uuid,
    pub status: OperationStatus,
}

/// A buffered packet waiting for its resolution reply.
#[derive(Debug, Clone)]
pub struct PendingResolution {
    pub request_id: Uuid,
    pub ingress_port: u32,
    pub packet: Vec<u8>,
    pub key: ResolutionKey,
    pub tunnel_id: TunnelId,
    pub connection: ConnectionId,
    pub inserted_at: tokio::time::Instant,
}

#[derive(Debug, Clone)]
pub struct OnDemandConfig {
    /// Pending table size at which packet-in handling backs off
    pub pending_max: usize,
    pub expiration: Duration,
    pub sweep_interval: Duration,
    /// Total time an ARP replay waits for the address entry
    pub arp_poll_budget: Duration,
    pub arp_poll_interval: Duration,
    pub backoff_interval: Duration,
    /// Total time a packet-in waits for room in a full table
    pub backoff_budget: Duration,
}

impl Default for OnDemandConfig {
    fn default() -> Self {
        Self {
            pending_max: 1024,
            expiration: Duration::from_secs(10),
            sweep_interval: Duration::from_secs(5),
            arp_poll_budget: Duration::from_secs(2),
            arp_poll_interval: Duration::from_millis(50),
            backoff_interval: Duration::from_millis(10),
            backoff_budget: Duration::from_secs(1),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct OnDemandStats {
    pub packets_buffered: u64,
    pub requests_failed: u64,
    pub replies_success: u64,
    pub replies_failed: u64,
    pub replies_unknown: u64,
    pub replays_sent: u64,
    pub replays_failed: u64,
    pub arp_poll_timeouts: u64,
    pub expired: u64,
    pub dropped: u64,
    pub dhcp_forwarded: u64,
}

/// What `on_packet_in` did with a packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PacketInOutcome {
    /// Buffered and a resolution request sent.
    Buffered(Uuid),
    /// Handed to the DHCP responder.
    ForwardedToDhcp,
}

/// What `on_resolution_reply` did with a pending entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplyDisposition {
    ReplayScheduled,
    Dropped,
}

//! Common types for the per-host overlay agent.
//!
//! This crate provides type-safe representations of the network primitives
//! carried by goal-state records and used when programming the host switch:
//!
//! - [`MacAddress`]: 48-bit Ethernet MAC addresses
//! - [`Ipv4Cidr`]: IPv4 subnets in CIDR notation
//! - [`NetworkType`]: overlay encapsulation kinds and their tunnel id ranges
//! - [`LocalTag`]: host-local forwarding tags (802.1Q range)

mod ip;
mod mac;
mod network;
mod tag;

pub use ip::{parse_ipv4, Ipv4Cidr};
pub use mac::MacAddress;
pub use network::{NetworkType, TunnelId};
pub use tag::LocalTag;

/// Common error type for parsing and validation failures.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ParseError {
    #[error("invalid MAC address format: {0}")]
    InvalidMacAddress(String),

    #[error("invalid IPv4 address format: {0}")]
    InvalidIpAddress(String),

    #[error("invalid CIDR format: {0}")]
    InvalidCidr(String),

    #[error("invalid local tag: {0} (must be 1-4094)")]
    InvalidLocalTag(u32),

    #[error("invalid tunnel id {id} for network type {network_type}")]
    InvalidTunnelId { id: u32, network_type: NetworkType },

    #[error("invalid network type: {0}")]
    InvalidNetworkType(String),
}

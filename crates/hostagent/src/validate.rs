//! Field validation shared by the programmers and the goal-state handler.
//!
//! Each helper names the offending field in its `InvalidArgument` error.

use hostagent_common::{AgentError, AgentResult};
use hostagent_types::{parse_ipv4, Ipv4Cidr, MacAddress, NetworkType, TunnelId};
use std::net::Ipv4Addr;

pub(crate) fn required<'a>(field: &str, value: &'a str) -> AgentResult<&'a str> {
    if value.is_empty() {
        Err(AgentError::empty_field(field))
    } else {
        Ok(value)
    }
}

pub(crate) fn ipv4(field: &str, value: &str) -> AgentResult<Ipv4Addr> {
    parse_ipv4(required(field, value)?).map_err(|e| AgentError::from_parse(field, e))
}

/// A unicast, non-zero MAC address.
pub(crate) fn mac(field: &str, value: &str) -> AgentResult<MacAddress> {
    let mac: MacAddress = required(field, value)?
        .parse()
        .map_err(|e| AgentError::from_parse(field, e))?;
    if mac.is_multicast() || mac.is_zero() {
        return Err(AgentError::invalid_argument(field, format!("{} is not a unicast address", mac)));
    }
    Ok(mac)
}

pub(crate) fn cidr(field: &str, value: &str) -> AgentResult<Ipv4Cidr> {
    required(field, value)?
        .parse()
        .map_err(|e| AgentError::from_parse(field, e))
}

pub(crate) fn tunnel_id(network_type: NetworkType, value: TunnelId) -> AgentResult<TunnelId> {
    network_type
        .validate_tunnel_id(value)
        .map_err(|e| AgentError::from_parse("tunnel_id", e))
}

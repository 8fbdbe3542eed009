//! Builders for every rule the agent installs.
//!
//! Each rule has a `*_match` companion that rebuilds only the match, so a
//! teardown never needs the values that went into the actions.

use super::flow::{table, FlowAction, FlowMatch, FlowRule, MatchField};
use super::{BRIDGE_INTEGRATION, BRIDGE_TUNNEL, PATCH_TO_INTEGRATION};
use hostagent_types::{LocalTag, MacAddress, TunnelId};
use std::net::Ipv4Addr;

pub const PRIORITY_DEFAULT: u16 = 1;
pub const PRIORITY_DISPATCH: u16 = 25;
pub const PRIORITY_SPECIFIC: u16 = 50;

/// A rule together with the bridge it belongs on.
pub type BridgeRule = (&'static str, FlowRule);

pub fn tunnel_classifier_match(tunnel_id: TunnelId) -> FlowMatch {
    FlowMatch::new(table::TUNNEL_INGRESS)
        .priority(PRIORITY_DEFAULT)
        .with(MatchField::TunnelId(tunnel_id))
}

/// br-tun: traffic arriving with `tunnel_id` is tagged with `tag` and sent to br-int.
pub fn tunnel_classifier(tunnel_id: TunnelId, tag: LocalTag) -> FlowRule {
    FlowRule::new(
        tunnel_classifier_match(tunnel_id),
        vec![
            FlowAction::SetVlan(tag),
            FlowAction::Output(PATCH_TO_INTEGRATION.to_string()),
        ],
    )
}

pub fn l2_neighbor_match(tag: LocalTag, virtual_mac: MacAddress) -> FlowMatch {
    FlowMatch::new(table::UNICAST)
        .priority(PRIORITY_SPECIFIC)
        .with(MatchField::Vlan(tag))
        .with(MatchField::EthDst(virtual_mac))
}

/// br-tun: unicast to a remote neighbor is untagged, encapsulated with the
/// tunnel id and sent to the neighbor's host over the transport port.
pub fn l2_neighbor(
    tag: LocalTag,
    virtual_mac: MacAddress,
    tunnel_id: TunnelId,
    remote_host_ip: Ipv4Addr,
    transport_port: &str,
) -> FlowRule {
    FlowRule::new(
        l2_neighbor_match(tag, virtual_mac),
        vec![
            FlowAction::StripVlan,
            FlowAction::SetTunnelId(tunnel_id),
            FlowAction::SetTunnelDst(remote_host_ip),
            FlowAction::Output(transport_port.to_string()),
        ],
    )
}

pub fn arp_responder_match(tag: LocalTag, ip: Ipv4Addr) -> FlowMatch {
    FlowMatch::new(table::ARP_RESPONDER)
        .priority(PRIORITY_SPECIFIC)
        .with(MatchField::Arp)
        .with(MatchField::Vlan(tag))
        .with(MatchField::Ipv4Dst(ip))
}

pub fn arp_responder(tag: LocalTag, ip: Ipv4Addr, mac: MacAddress) -> FlowRule {
    FlowRule::new(
        arp_responder_match(tag, ip),
        vec![FlowAction::ArpReply { ip, mac }],
    )
}

pub fn icmp_responder_match(tag: LocalTag, gateway_ip: Ipv4Addr) -> FlowMatch {
    FlowMatch::new(table::ICMP_RESPONDER)
        .priority(PRIORITY_SPECIFIC)
        .with(MatchField::Icmp)
        .with(MatchField::Vlan(tag))
        .with(MatchField::Ipv4Dst(gateway_ip))
}

pub fn icmp_responder(tag: LocalTag, gateway_ip: Ipv4Addr, gateway_mac: MacAddress) -> FlowRule {
    FlowRule::new(
        icmp_responder_match(tag, gateway_ip),
        vec![FlowAction::IcmpEchoReply {
            ip: gateway_ip,
            mac: gateway_mac,
        }],
    )
}

pub fn dvr_restore_match(tag: LocalTag, host_dvr_mac: MacAddress) -> FlowMatch {
    FlowMatch::new(table::CLASSIFIER)
        .priority(PRIORITY_DISPATCH)
        .with(MatchField::Vlan(tag))
        .with(MatchField::EthSrc(host_dvr_mac))
}

/// br-int: routed traffic arriving with the host DVR mac as source gets the
/// subnet gateway mac back before normal switching.
pub fn dvr_restore(tag: LocalTag, host_dvr_mac: MacAddress, gateway_mac: MacAddress) -> FlowRule {
    FlowRule::new(
        dvr_restore_match(tag, host_dvr_mac),
        vec![FlowAction::SetEthSrc(gateway_mac), FlowAction::Normal],
    )
}

pub fn l3_neighbor_match(
    source_tag: LocalTag,
    virtual_ip: Ipv4Addr,
    source_gateway_mac: MacAddress,
) -> FlowMatch {
    FlowMatch::new(table::CLASSIFIER)
        .priority(PRIORITY_SPECIFIC)
        .with(MatchField::Ip)
        .with(MatchField::Vlan(source_tag))
        .with(MatchField::Ipv4Dst(virtual_ip))
        .with(MatchField::EthDst(source_gateway_mac))
}

/// Where a routed packet goes after the rewrite.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum L3Delivery {
    /// Neighbor lives on this host: rewrite source to the destination
    /// gateway mac and hairpin out of the ingress port.
    Local { destination_gateway_mac: MacAddress },
    /// Neighbor lives elsewhere: rewrite source to the host DVR mac and
    /// continue through the from-integration table.
    Remote { host_dvr_mac: MacAddress },
}

/// br-tun: a packet from the source subnet addressed to its gateway mac and
/// destined for `virtual_ip` is retagged into the destination subnet.
pub fn l3_neighbor(
    source_tag: LocalTag,
    source_gateway_mac: MacAddress,
    destination_tag: LocalTag,
    virtual_ip: Ipv4Addr,
    virtual_mac: MacAddress,
    delivery: L3Delivery,
) -> FlowRule {
    let mut actions = vec![FlowAction::SetVlan(destination_tag)];
    match delivery {
        L3Delivery::Local {
            destination_gateway_mac,
        } => {
            actions.push(FlowAction::SetEthSrc(destination_gateway_mac));
            actions.push(FlowAction::SetEthDst(virtual_mac));
            actions.push(FlowAction::InPort);
        }
        L3Delivery::Remote { host_dvr_mac } => {
            actions.push(FlowAction::SetEthSrc(host_dvr_mac));
            actions.push(FlowAction::SetEthDst(virtual_mac));
            actions.push(FlowAction::Resubmit(table::FROM_INTEGRATION));
        }
    }
    FlowRule::new(
        l3_neighbor_match(source_tag, virtual_ip, source_gateway_mac),
        actions,
    )
}

/// br-tun: traffic arriving on a transport port goes to the tunnel ingress table.
pub fn transport_ingress(transport_port: &str) -> FlowRule {
    FlowRule::new(
        FlowMatch::new(table::CLASSIFIER)
            .priority(PRIORITY_DISPATCH)
            .with(MatchField::InPort(transport_port.to_string())),
        vec![FlowAction::Resubmit(table::TUNNEL_INGRESS)],
    )
}

/// Default pipeline installed when the bridges are first created.
pub fn bootstrap() -> Vec<BridgeRule> {
    let from_int = || MatchField::InPort(PATCH_TO_INTEGRATION.to_string());
    vec![
        (
            BRIDGE_TUNNEL,
            FlowRule::new(
                FlowMatch::new(table::CLASSIFIER)
                    .priority(PRIORITY_DEFAULT)
                    .with(from_int()),
                vec![FlowAction::Resubmit(table::FROM_INTEGRATION)],
            ),
        ),
        (
            BRIDGE_TUNNEL,
            FlowRule::new(
                FlowMatch::new(table::FROM_INTEGRATION).priority(PRIORITY_DEFAULT),
                vec![FlowAction::Resubmit(table::FLOOD)],
            ),
        ),
        (
            BRIDGE_TUNNEL,
            FlowRule::new(
                FlowMatch::new(table::CLASSIFIER)
                    .priority(PRIORITY_DISPATCH)
                    .with(MatchField::Arp)
                    .with(MatchField::ArpOp(1))
                    .with(from_int()),
                vec![FlowAction::Resubmit(table::ARP_RESPONDER)],
            ),
        ),
        (
            BRIDGE_TUNNEL,
            FlowRule::new(
                FlowMatch::new(table::ARP_RESPONDER).priority(PRIORITY_DEFAULT),
                vec![FlowAction::Resubmit(table::FLOOD)],
            ),
        ),
        (
            BRIDGE_TUNNEL,
            FlowRule::new(
                FlowMatch::new(table::CLASSIFIER)
                    .priority(PRIORITY_DISPATCH)
                    .with(MatchField::Icmp)
                    .with(MatchField::IcmpType(8))
                    .with(from_int()),
                vec![FlowAction::Resubmit(table::ICMP_RESPONDER)],
            ),
        ),
        (
            BRIDGE_TUNNEL,
            FlowRule::new(
                FlowMatch::new(table::ICMP_RESPONDER).priority(PRIORITY_DEFAULT),
                vec![FlowAction::Resubmit(table::FLOOD)],
            ),
        ),
    ]
}

/// Bridge on which the DVR restore rule lives.
pub const DVR_RESTORE_BRIDGE: &str = BRIDGE_INTEGRATION;

//! Minimal header parsing for packet-in frames.
//!
//! Only the fields needed to build a [`ResolutionKey`] are read: Ethernet,
//! an optional 802.1Q tag, then ARP or IPv4 with its TCP/UDP ports.

use super::types::Protocol;
use std::net::Ipv4Addr;
use thiserror::Error;

const ETH_HEADER_LEN: usize = 14;
const VLAN_TAG_LEN: usize = 4;
const ARP_LEN: usize = 28;
const IPV4_MIN_HEADER_LEN: usize = 20;

pub const ETHERTYPE_IPV4: u16 = 0x0800;
pub const ETHERTYPE_ARP: u16 = 0x0806;
pub const ETHERTYPE_VLAN: u16 = 0x8100;

pub const ARP_OP_REQUEST: u16 = 1;

const DHCP_CLIENT_PORT: u16 = 68;
const DHCP_SERVER_PORT: u16 = 67;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PacketError {
    #[error("frame truncated: need {needed} bytes, have {actual}")]
    Truncated { needed: usize, actual: usize },

    #[error("unsupported ethertype {0:#06x}")]
    UnsupportedEtherType(u16),

    #[error("unsupported IP protocol {0}")]
    UnsupportedIpProtocol(u8),

    #[error("invalid IPv4 header length {0} words")]
    InvalidHeaderLength(u8),
}

/// Header fields of a packet-in frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParsedPacket {
    Arp {
        vlan: Option<u16>,
        op: u16,
        sender_ip: Ipv4Addr,
        target_ip: Ipv4Addr,
    },
    Ipv4 {
        vlan: Option<u16>,
        src: Ipv4Addr,
        dst: Ipv4Addr,
        protocol: Protocol,
        src_port: u16,
        dst_port: u16,
    },
}

impl ParsedPacket {
    pub fn vlan(&self) -> Option<u16> {
        match *self {
            ParsedPacket::Arp { vlan, .. } | ParsedPacket::Ipv4 { vlan, .. } => vlan,
        }
    }

    pub fn protocol(&self) -> Protocol {
        match *self {
            ParsedPacket::Arp { .. } => Protocol::Arp,
            ParsedPacket::Ipv4 { protocol, .. } => protocol,
        }
    }

    /// DHCP client-to-server traffic.
    pub fn is_dhcp(&self) -> bool {
        matches!(
            *self,
            ParsedPacket::Ipv4 {
                protocol: Protocol::Udp,
                src_port: DHCP_CLIENT_PORT,
                dst_port: DHCP_SERVER_PORT,
                ..
            }
        )
    }
}

fn need(frame: &[u8], needed: usize) -> Result<(), PacketError> {
    if frame.len() < needed {
        return Err(PacketError::Truncated {
            needed,
            actual: frame.len(),
        });
    }
    Ok(())
}

fn be16(frame: &[u8], at: usize) -> u16 {
    u16::from_be_bytes([frame[at], frame[at + 1]])
}

fn ipv4_at(frame: &[u8], at: usize) -> Ipv4Addr {
    Ipv4Addr::new(frame[at], frame[at + 1], frame[at + 2], frame[at + 3])
}

pub fn parse(frame: &[u8]) -> Result<ParsedPacket, PacketError> {
    need(frame, ETH_HEADER_LEN)?;
    let mut ether_type = be16(frame, 12);
    let mut offset = ETH_HEADER_LEN;
    let mut vlan = None;

    if ether_type == ETHERTYPE_VLAN {
        need(frame, ETH_HEADER_LEN + VLAN_TAG_LEN)?;
        vlan = Some(be16(frame, 14) & 0x0fff);
        ether_type = be16(frame, 16);
        offset += VLAN_TAG_LEN;
    }

    match ether_type {
        ETHERTYPE_ARP => {
            need(frame, offset + ARP_LEN)?;
            Ok(ParsedPacket::Arp {
                vlan,
                op: be16(frame, offset + 6),
                sender_ip: ipv4_at(frame, offset + 14),
                target_ip: ipv4_at(frame, offset + 24),
            })
        }
        ETHERTYPE_IPV4 => parse_ipv4(frame, offset, vlan),
        other => Err(PacketError::UnsupportedEtherType(other)),
    }
}

fn parse_ipv4(frame: &[u8], offset: usize, vlan: Option<u16>) -> Result<ParsedPacket, PacketError> {
    need(frame, offset + IPV4_MIN_HEADER_LEN)?;
    let ihl = frame[offset] & 0x0f;
    if ihl < 5 {
        return Err(PacketError::InvalidHeaderLength(ihl));
    }
    let header_len = usize::from(ihl) * 4;
    need(frame, offset + header_len)?;

    let proto = frame[offset + 9];
    let protocol = Protocol::from_ip_proto(proto).ok_or(PacketError::UnsupportedIpProtocol(proto))?;
    let src = ipv4_at(frame, offset + 12);
    let dst = ipv4_at(frame, offset + 16);

    let l4 = offset + header_len;
    let (src_port, dst_port) = match protocol {
        Protocol::Tcp | Protocol::Udp => {
            need(frame, l4 + 4)?;
            (be16(frame, l4), be16(frame, l4 + 2))
        }
        _ => (0, 0),
    };

    Ok(ParsedPacket::Ipv4 {
        vlan,
        src,
        dst,
        protocol,
        src_port,
        dst_port,
    })
}


#[cfg(test)]
mod tests {
    use super::test_frames::*;
    use super::*;
    use pretty_assertions::assert_eq;

    fn ip(s: &str) -> Ipv4Addr {
        s.parse().unwrap()
    }

    #[test]
    fn test_parse_tagged_tcp() {
        let frame = tcp(Some(0x2005), ip("10.0.0.2"), ip("10.0.0.3"), 40000, 80);
        assert_eq!(
            parse(&frame).unwrap(),
            ParsedPacket::Ipv4 {
                vlan: Some(5),
                src: ip("10.0.0.2"),
                dst: ip("10.0.0.3"),
                protocol: Protocol::Tcp,
                src_port: 40000,
                dst_port: 80,
            }
        );
    }

    #[test]
    fn test_parse_arp_request() {
        let frame = arp(Some(7), ARP_OP_REQUEST, ip("10.0.0.2"), ip("10.0.0.9"));
        let parsed = parse(&frame).unwrap();
        assert_eq!(
            parsed,
            ParsedPacket::Arp {
                vlan: Some(7),
                op: ARP_OP_REQUEST,
                sender_ip: ip("10.0.0.2"),
                target_ip: ip("10.0.0.9"),
            }
        );
        assert_eq!(parsed.protocol(), Protocol::Arp);
    }

    #[test]
    fn test_icmp_has_no_ports() {
        let frame = ipv4(None, 1, ip("10.0.0.2"), ip("10.0.0.1"), 0x0800, 0x1234);
        match parse(&frame).unwrap() {
            ParsedPacket::Ipv4 {
                protocol,
                src_port,
                dst_port,
                vlan,
                ..
            } => {
                assert_eq!(protocol, Protocol::Icmp);
                assert_eq!((src_port, dst_port), (0, 0));
                assert_eq!(vlan, None);
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_dhcp_detection() {
        assert!(parse(&dhcp_discover(Some(3))).unwrap().is_dhcp());
        let reply = ipv4(Some(3), 17, ip("10.0.0.1"), ip("10.0.0.2"), 67, 68);
        assert!(!parse(&reply).unwrap().is_dhcp());
    }

    #[test]
    fn test_rejects_malformed() {
        let frame = tcp(Some(5), ip("10.0.0.2"), ip("10.0.0.3"), 1, 2);
        assert!(matches!(
            parse(&frame[..30]),
            Err(PacketError::Truncated { .. })
        ));

        let mut bad_ihl = frame.clone();
        bad_ihl[18] = 0x44;
        assert_eq!(parse(&bad_ihl), Err(PacketError::InvalidHeaderLength(4)));

        let gre = ipv4(None, 47, ip("10.0.0.2"), ip("10.0.0.3"), 0, 0);
        assert_eq!(parse(&gre), Err(PacketError::UnsupportedIpProtocol(47)));

        let mut ipv6 = frame;
        ipv6[16] = 0x86;
        ipv6[17] = 0xdd;
        assert_eq!(parse(&ipv6), Err(PacketError::UnsupportedEtherType(0x86dd)));
    }
}

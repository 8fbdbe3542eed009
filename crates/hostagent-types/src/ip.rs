//! IPv4 address helpers and the CIDR subnet type.

use crate::ParseError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::Ipv4Addr;
use std::str::FromStr;

/// Parses a dotted-quad IPv4 address, mapping failures to [`ParseError`].
pub fn parse_ipv4(s: &str) -> Result<Ipv4Addr, ParseError> {
    s.trim()
        .parse::<Ipv4Addr>()
        .map_err(|_| ParseError::InvalidIpAddress(s.to_string()))
}

/// An IPv4 subnet in CIDR notation (`10.0.0.0/24`).
///
/// The address part is kept as written; [`Ipv4Cidr::network`] masks it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Ipv4Cidr {
    addr: Ipv4Addr,
    prefix_len: u8,
}

impl Ipv4Cidr {
    pub fn new(addr: Ipv4Addr, prefix_len: u8) -> Result<Self, ParseError> {
        if prefix_len > 32 {
            return Err(ParseError::InvalidCidr(format!("{}/{}", addr, prefix_len)));
        }
        Ok(Self { addr, prefix_len })
    }

    pub const fn addr(&self) -> Ipv4Addr {
        self.addr
    }

    pub const fn prefix_len(&self) -> u8 {
        self.prefix_len
    }

    fn mask(&self) -> u32 {
        if self.prefix_len == 0 {
            0
        } else {
            u32::MAX << (32 - u32::from(self.prefix_len))
        }
    }

    pub fn network(&self) -> Ipv4Addr {
        Ipv4Addr::from(u32::from(self.addr) & self.mask())
    }

    pub fn contains(&self, ip: Ipv4Addr) -> bool {
        u32::from(ip) & self.mask() == u32::from(self.network())
    }
}

impl fmt::Display for Ipv4Cidr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.addr, self.prefix_len)
    }
}

impl FromStr for Ipv4Cidr {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (addr, len) = s
            .split_once('/')
            .ok_or_else(|| ParseError::InvalidCidr(s.to_string()))?;
        let addr = parse_ipv4(addr).map_err(|_| ParseError::InvalidCidr(s.to_string()))?;
        let prefix_len = len
            .parse::<u8>()
            .map_err(|_| ParseError::InvalidCidr(s.to_string()))?;
        Self::new(addr, prefix_len)
    }
}

impl TryFrom<String> for Ipv4Cidr {
    type Error = ParseError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        s.parse()
    }
}

impl From<Ipv4Cidr> for String {
    fn from(cidr: Ipv4Cidr) -> String {
        cidr.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_parse_ipv4() {
        assert_eq!(parse_ipv4("10.0.0.1").unwrap(), Ipv4Addr::new(10, 0, 0, 1));
        assert!(parse_ipv4("").is_err());
        assert!(parse_ipv4("10.0.0").is_err());
        assert!(parse_ipv4("fe80::1").is_err());
    }

    #[test]
    fn test_cidr_requires_slash() {
        assert!("10.0.0.0".parse::<Ipv4Cidr>().is_err());
        assert!("10.0.0.0/33".parse::<Ipv4Cidr>().is_err());
        assert!("10.0.0.0/".parse::<Ipv4Cidr>().is_err());
    }

    #[test]
    fn test_cidr_contains() {
        let cidr: Ipv4Cidr = "10.0.1.7/24".parse().unwrap();
        assert_eq!(cidr.network(), Ipv4Addr::new(10, 0, 1, 0));
        assert_eq!(cidr.prefix_len(), 24);
        assert!(cidr.contains(Ipv4Addr::new(10, 0, 1, 200)));
        assert!(!cidr.contains(Ipv4Addr::new(10, 0, 2, 1)));
        assert_eq!(cidr.to_string(), "10.0.1.7/24");
    }

    #[test]
    fn test_zero_prefix_matches_everything() {
        let cidr: Ipv4Cidr = "0.0.0.0/0".parse().unwrap();
        assert!(cidr.contains(Ipv4Addr::new(192, 168, 1, 1)));
    }
}

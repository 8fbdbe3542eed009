//! Overlay network types and tunnel identifier validation.

use crate::ParseError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Global tunnel identifier (VNI/VSID/key) assigned by the orchestrator.
pub type TunnelId = u32;

/// Encapsulation used by a virtual network.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum NetworkType {
    #[default]
    Vxlan,
    Vlan,
    Gre,
    Geneve,
    VxlanGpe,
}

impl NetworkType {
    pub const fn as_str(&self) -> &'static str {
        match self {
            NetworkType::Vxlan => "vxlan",
            NetworkType::Vlan => "vlan",
            NetworkType::Gre => "gre",
            NetworkType::Geneve => "geneve",
            NetworkType::VxlanGpe => "vxlan-gpe",
        }
    }

    /// Largest tunnel id the encapsulation header can carry.
    pub const fn max_tunnel_id(&self) -> TunnelId {
        match self {
            NetworkType::Vxlan | NetworkType::Geneve | NetworkType::VxlanGpe => 0x00ff_ffff,
            NetworkType::Vlan => 4094,
            NetworkType::Gre => u32::MAX,
        }
    }

    /// Tunnel id 0 is never valid.
    pub fn validate_tunnel_id(&self, id: TunnelId) -> Result<TunnelId, ParseError> {
        if id == 0 || id > self.max_tunnel_id() {
            return Err(ParseError::InvalidTunnelId {
                id,
                network_type: *self,
            });
        }
        Ok(id)
    }

    /// Name of the flow-based transport port on the tunnel bridge.
    pub fn transport_port_name(&self) -> String {
        format!("{}-generic", self.as_str())
    }
}

impl fmt::Display for NetworkType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for NetworkType {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "vxlan" => Ok(NetworkType::Vxlan),
            "vlan" => Ok(NetworkType::Vlan),
            "gre" => Ok(NetworkType::Gre),
            "geneve" => Ok(NetworkType::Geneve),
            "vxlan-gpe" | "vxlan_gpe" => Ok(NetworkType::VxlanGpe),
            _ => Err(ParseError::InvalidNetworkType(s.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_vxlan_range() {
        let vxlan = NetworkType::Vxlan;
        assert!(vxlan.validate_tunnel_id(0).is_err());
        assert_eq!(vxlan.validate_tunnel_id(20).unwrap(), 20);
        assert_eq!(vxlan.validate_tunnel_id(16_777_215).unwrap(), 16_777_215);
        assert!(vxlan.validate_tunnel_id(16_777_216).is_err());
    }

    #[test]
    fn test_vlan_and_gre_ranges() {
        assert!(NetworkType::Vlan.validate_tunnel_id(4095).is_err());
        assert!(NetworkType::Vlan.validate_tunnel_id(4094).is_ok());
        assert!(NetworkType::Gre.validate_tunnel_id(u32::MAX).is_ok());
    }

    #[test]
    fn test_transport_port_name() {
        assert_eq!(NetworkType::Vxlan.transport_port_name(), "vxlan-generic");
        assert_eq!(NetworkType::Geneve.transport_port_name(), "geneve-generic");
    }

    #[test]
    fn test_serde_names() {
        let json = serde_json::to_string(&NetworkType::VxlanGpe).unwrap();
        assert_eq!(json, "\"VXLAN_GPE\"");
        let parsed: NetworkType = serde_json::from_str("\"GENEVE\"").unwrap();
        assert_eq!(parsed, NetworkType::Geneve);
        assert_eq!("VXLAN".parse::<NetworkType>().unwrap(), NetworkType::Vxlan);
    }
}

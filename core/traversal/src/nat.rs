//! NAT classification consumed by strategy selection
//!
//! The engine never computes a classification itself; it is supplied by the
//! caller (typically from an external STUN-based detector).

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Mapping/filtering behaviour of a peer's NAT
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum NatType {
    /// Least restrictive: any host may send to the mapped port
    FullCone,
    /// Only hosts we sent to may reply, from any port
    AddressRestrictedCone,
    /// Only the exact ip:port we sent to may reply
    PortRestrictedCone,
    /// New mapping per destination (most restrictive)
    Symmetric,
    #[default]
    Unknown,
}

impl NatType {
    pub const ALL: [NatType; 5] = [
        NatType::FullCone,
        NatType::AddressRestrictedCone,
        NatType::PortRestrictedCone,
        NatType::Symmetric,
        NatType::Unknown,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            NatType::FullCone => "full-cone",
            NatType::AddressRestrictedCone => "address-restricted-cone",
            NatType::PortRestrictedCone => "port-restricted-cone",
            NatType::Symmetric => "symmetric",
            NatType::Unknown => "unknown",
        }
    }
}

impl fmt::Display for NatType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for NatType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        NatType::ALL
            .iter()
            .find(|t| t.as_str().eq_ignore_ascii_case(s))
            .copied()
            .ok_or_else(|| format!("unknown NAT type '{}'", s))
    }
}

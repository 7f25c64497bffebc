//! Network parameters and service bits

use bitflags::bitflags;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use super::config::ConfigError;

/// Chains a connection can speak to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NetworkParameters {
    #[default]
    Mainnet,
    Testnet3,
    Regtest,
    Signet,
}

impl NetworkParameters {
    /// Start-of-message bytes as they appear on the wire
    pub fn magic(&self) -> [u8; 4] {
        match self {
            NetworkParameters::Mainnet => [0xF9, 0xBE, 0xB4, 0xD9],
            NetworkParameters::Testnet3 => [0x0B, 0x11, 0x09, 0x07],
            NetworkParameters::Regtest => [0xFA, 0xBF, 0xB5, 0xDA],
            NetworkParameters::Signet => [0x0A, 0x03, 0xCF, 0x40],
        }
    }

    pub fn default_port(&self) -> u16 {
        match self {
            NetworkParameters::Mainnet => 8333,
            NetworkParameters::Testnet3 => 18333,
            NetworkParameters::Regtest => 18444,
            NetworkParameters::Signet => 38333,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            NetworkParameters::Mainnet => "mainnet",
            NetworkParameters::Testnet3 => "testnet3",
            NetworkParameters::Regtest => "regtest",
            NetworkParameters::Signet => "signet",
        }
    }
}

impl fmt::Display for NetworkParameters {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for NetworkParameters {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "mainnet" | "main" | "bitcoin" => Ok(NetworkParameters::Mainnet),
            "testnet" | "testnet3" | "test" => Ok(NetworkParameters::Testnet3),
            "regtest" => Ok(NetworkParameters::Regtest),
            "signet" => Ok(NetworkParameters::Signet),
            _ => Err(ConfigError::UnknownNetwork(s.to_string())),
        }
    }
}

bitflags! {
    /// Capabilities a peer advertises in its `version` message
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
    pub struct ServiceFlags: u64 {
        const NODE_NETWORK = 0x01;
        const NODE_GETUTXO = 0x02;
        const NODE_BLOOM = 0x04;
        const NODE_WITNESS = 0x08;
        const NODE_XTHIN = 0x10;
        const NODE_NETWORK_LIMITED = 0x400;
    }
}

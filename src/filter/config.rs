//! Filter configuration consumed by a connection

use serde::{Deserialize, Serialize};

/// Default target false-positive rate
pub const DEFAULT_FALSE_POSITIVE_RATE: f64 = 0.0001;

/// How the peer updates the filter when an output matches
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BloomFlags {
    None,
    All,
    #[default]
    P2PubKeyOnly,
}

impl BloomFlags {
    /// Wire value of the `filterload` flags byte
    pub fn as_u8(self) -> u8 {
        match self {
            BloomFlags::None => 0,
            BloomFlags::All => 1,
            BloomFlags::P2PubKeyOnly => 2,
        }
    }
}

/// Bloom filter settings
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FilterConfig {
    pub false_positive_rate: f64,
    pub update_flags: BloomFlags,
}

impl Default for FilterConfig {
    fn default() -> Self {
        Self {
            false_positive_rate: DEFAULT_FALSE_POSITIVE_RATE,
            update_flags: BloomFlags::default(),
        }
    }
}

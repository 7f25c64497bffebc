//! Connection configuration
//!
//! Loaded from JSON; every field is optional and falls back to its default.

use crate::filter::FilterConfig;
use serde::{Deserialize, Serialize};
use std::fs;
use std::io::{self, BufReader};
use std::path::Path;
use thiserror::Error;

use super::message::PROTOCOL_VERSION;
use super::params::NetworkParameters;

/// Configuration errors
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),
    #[error("Parse error: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("Unknown network: {0}")]
    UnknownNetwork(String),
}

/// Settings a connection is created with
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConnectionConfig {
    pub network: NetworkParameters,
    /// Version advertised in our `version` message
    pub protocol_version: i32,
    pub user_agent: String,
    /// Height advertised to the peer; -1 when unknown
    pub start_height: i32,
    pub filter: FilterConfig,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            network: NetworkParameters::default(),
            protocol_version: PROTOCOL_VERSION,
            user_agent: format!("/btc-listener:{}/", env!("CARGO_PKG_VERSION")),
            start_height: -1,
            filter: FilterConfig::default(),
        }
    }
}

impl ConnectionConfig {
    pub fn for_network(network: NetworkParameters) -> Self {
        Self {
            network,
            ..Self::default()
        }
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let file = fs::File::open(path)?;
        let config = serde_json::from_reader(BufReader::new(file))?;
        Ok(config)
    }
}

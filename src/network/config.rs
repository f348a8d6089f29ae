//! Connection manager configuration
//!
//! Every threshold the peer set, event loop and connectors use lives here,
//! loaded from a JSON file with missing fields taking their defaults.

use crate::network::address::Network;
use serde::{Deserialize, Serialize};
use std::fs;
use std::io::{self, BufReader, BufWriter};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

/// Configuration errors
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),
    #[error("Parse error: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// Networking configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NetConfig {
    /// Total connection limit, inbound and outbound
    pub max_connections: usize,
    /// Connections kept free of inbound peers
    pub reserved_outbound: usize,
    /// Concurrent outbound connections
    pub outbound_slots: usize,
    /// Misbehaviour score that triggers a ban
    pub ban_score: i32,
    /// Ban length in seconds
    pub ban_duration: i64,
    /// Seconds between remodel passes
    pub remodel_interval: i64,
    /// Remodeling never runs at or below this many peers
    pub remodel_min_connections: usize,
    pub listen: Vec<SocketAddr>,
    pub listen_enabled: bool,
    pub default_port: u16,
    /// Nodes we always keep a connection to, "host[:port]"
    pub add_nodes: Vec<String>,
    /// Connect to these only, ignoring the address book
    pub connect_only: Vec<String>,
    /// DNS names resolved when the address book is empty
    pub dns_seeds: Vec<String>,
    /// Certified node addresses, "host[:port]"
    pub certified_nodes: Vec<String>,
    /// SOCKS5 proxy for outbound connections
    pub proxy: Option<SocketAddr>,
    /// Let the proxy resolve destination names
    pub name_proxy: bool,
    /// Allow DNS lookups of destination names
    pub name_lookup: bool,
    /// Networks we make no outbound connections on
    pub limited_networks: Vec<Network>,
    /// Learn local addresses from the routing interface and UPnP
    pub discover: bool,
    /// Our externally reachable addresses
    pub external_addrs: Vec<SocketAddr>,
    pub upnp: bool,
    /// Receive flood ceiling in bytes
    pub max_receive_buffer: usize,
    /// Stop processing a peer's messages while its send buffer exceeds this
    pub max_send_buffer: usize,
    pub connect_timeout_ms: u64,
    /// Seconds between trusted connector passes
    pub trusted_interval: u64,
    /// Address book file
    pub peers_file: Option<PathBuf>,
    /// Seconds between address book dumps
    pub dump_interval: u64,
}

impl Default for NetConfig {
    fn default() -> Self {
        Self {
            max_connections: 125,
            reserved_outbound: 8,
            outbound_slots: 8,
            ban_score: 100,
            ban_duration: 24 * 60 * 60,
            remodel_interval: 60,
            remodel_min_connections: 10,
            listen: vec![SocketAddr::from(([0, 0, 0, 0], 8333))],
            listen_enabled: true,
            default_port: 8333,
            add_nodes: Vec::new(),
            connect_only: Vec::new(),
            dns_seeds: Vec::new(),
            certified_nodes: Vec::new(),
            proxy: None,
            name_proxy: false,
            name_lookup: true,
            limited_networks: Vec::new(),
            discover: true,
            external_addrs: Vec::new(),
            upnp: false,
            max_receive_buffer: 5_000_000,
            max_send_buffer: 1_000_000,
            connect_timeout_ms: 5000,
            trusted_interval: 30,
            peers_file: None,
            dump_interval: 15 * 60,
        }
    }
}

impl NetConfig {
    /// Load configuration from a JSON file
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let file = fs::File::open(path)?;
        let config: NetConfig = serde_json::from_reader(BufReader::new(file))?;
        config.validate()?;
        Ok(config)
    }

    /// Write configuration as pretty JSON
    pub fn save(&self, path: &Path) -> Result<(), ConfigError> {
        let file = fs::File::create(path)?;
        serde_json::to_writer_pretty(BufWriter::new(file), self)?;
        Ok(())
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_connections == 0 {
            return Err(ConfigError::Invalid("max_connections must be positive".into()));
        }
        if self.reserved_outbound > self.max_connections {
            return Err(ConfigError::Invalid(format!(
                "reserved_outbound ({}) exceeds max_connections ({})",
                self.reserved_outbound, self.max_connections
            )));
        }
        if self.ban_score <= 0 {
            return Err(ConfigError::Invalid("ban_score must be positive".into()));
        }
        if self.ban_duration < 0 {
            return Err(ConfigError::Invalid("ban_duration must not be negative".into()));
        }
        if self.max_receive_buffer == 0 || self.max_send_buffer == 0 {
            return Err(ConfigError::Invalid("buffer limits must be positive".into()));
        }
        if self.name_proxy && self.proxy.is_none() {
            return Err(ConfigError::Invalid("name_proxy requires a proxy".into()));
        }
        Ok(())
    }

    /// Outbound slot count, never more than the connection limit
    pub fn effective_outbound_slots(&self) -> usize {
        self.outbound_slots.min(self.max_connections)
    }

    /// Inbound peers admitted before the always-admit set is the only way in
    pub fn max_inbound(&self) -> usize {
        self.max_connections.saturating_sub(self.reserved_outbound)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_defaults() {
        let config = NetConfig::default();
        assert_eq!(config.max_inbound(), 117);
        assert_eq!(config.effective_outbound_slots(), 8);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_slots_clamped_to_max_connections() {
        let config = NetConfig {
            max_connections: 4,
            reserved_outbound: 2,
            ..Default::default()
        };
        assert_eq!(config.effective_outbound_slots(), 4);
    }

    #[test]
    fn test_missing_fields_take_defaults() {
        let config: NetConfig =
            serde_json::from_str(r#"{"max_connections": 40, "limited_networks": ["ipv6"]}"#)
                .unwrap();
        assert_eq!(config.max_connections, 40);
        assert_eq!(config.ban_score, 100);
        assert_eq!(config.limited_networks, vec![Network::Ipv6]);
    }

    #[test]
    fn test_invalid_rejected() {
        let config = NetConfig {
            reserved_outbound: 200,
            ..Default::default()
        };
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));

        let config = NetConfig {
            name_proxy: true,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_save_and_load() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("net.json");
        let config = NetConfig {
            add_nodes: vec!["seed.example.org".into()],
            ..Default::default()
        };
        config.save(&path).unwrap();
        assert_eq!(NetConfig::load(&path).unwrap(), config);
    }
}

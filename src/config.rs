//! Configuration loading
//!
//! Settings live in a TOML file; every key is optional and missing keys
//! fall back to the defaults below.

use crate::connection::ConnectionConfig;
use crate::transport::{RfcommConfig, DEFAULT_RFCOMM_CHANNEL};
use serde::{Deserialize, Serialize};
use spp_link_shared::{limits, ServiceIdentifier, SPP_SERVICE_UUID};
use std::fmt;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;
use uuid::Uuid;

/// Errors from reading the configuration file
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid config: {0}")]
    Parse(#[from] toml::de::Error),
}

/// Which transport carries the link
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TransportMode {
    /// Real RFCOMM through BlueZ
    #[default]
    Rfcomm,
    /// Loopback TCP standing in for the radio (development)
    TcpSimulation,
}

impl FromStr for TransportMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "rfcomm" => Ok(TransportMode::Rfcomm),
            "tcp-simulation" | "tcp" => Ok(TransportMode::TcpSimulation),
            other => Err(format!("unknown transport mode: {}", other)),
        }
    }
}

impl fmt::Display for TransportMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransportMode::Rfcomm => write!(f, "rfcomm"),
            TransportMode::TcpSimulation => write!(f, "tcp-simulation"),
        }
    }
}

/// Link configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LinkConfig {
    /// Transport backend
    pub mode: TransportMode,
    /// Service both ends rendezvous on
    pub service_uuid: Uuid,
    /// Name advertised in the service record
    pub service_name: String,
    /// RFCOMM channel for the listening profile
    pub channel: u8,
    /// Require pairing-level authentication on inbound connections
    pub require_authentication: bool,
    /// Listen address when running the TCP simulation
    pub tcp_listen_address: String,
    /// Size of each socket read
    pub read_buffer_size: usize,
    /// Largest text accepted by a single write
    pub max_write_size: usize,
    /// Pause before reopening a failed listener, in milliseconds
    pub relisten_delay_ms: u64,
    /// Capacity of the observer event channel
    pub event_capacity: usize,
    /// Start listening as soon as the manager is created
    pub listen_on_start: bool,
}

impl Default for LinkConfig {
    fn default() -> Self {
        Self {
            mode: TransportMode::default(),
            service_uuid: SPP_SERVICE_UUID,
            service_name: "spp-link".into(),
            channel: DEFAULT_RFCOMM_CHANNEL,
            require_authentication: false,
            tcp_listen_address: "127.0.0.1:9000".into(),
            read_buffer_size: limits::READ_BUFFER_SIZE,
            max_write_size: limits::MAX_WRITE_SIZE,
            relisten_delay_ms: limits::RELISTEN_DELAY_MS,
            event_capacity: 100,
            listen_on_start: true,
        }
    }
}

impl LinkConfig {
    /// Parse configuration from TOML text
    pub fn from_toml(content: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(content)?)
    }

    /// Load configuration from a file, or defaults if it does not exist
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let content = std::fs::read_to_string(path)?;
        Self::from_toml(&content)
    }

    /// The service identifier both ends use
    pub fn service(&self) -> ServiceIdentifier {
        ServiceIdentifier::new(self.service_uuid)
    }

    /// Settings for the connection manager
    pub fn connection(&self) -> ConnectionConfig {
        ConnectionConfig {
            service: self.service(),
            read_buffer_size: self.read_buffer_size,
            max_write_size: self.max_write_size,
            relisten_delay: Duration::from_millis(self.relisten_delay_ms),
            event_capacity: self.event_capacity,
            listen_on_start: self.listen_on_start,
            ..ConnectionConfig::default()
        }
    }

    /// Settings for the BlueZ RFCOMM transport
    pub fn rfcomm(&self) -> RfcommConfig {
        RfcommConfig {
            service_name: self.service_name.clone(),
            channel: self.channel,
            require_authentication: self.require_authentication,
        }
    }
}

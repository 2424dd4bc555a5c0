//! spp-link shared types
//!
//! This crate provides the I/O-free types shared by the connection manager,
//! its transports and the peer tools: addresses, the service identifier,
//! the connection state machine and the text codec.

pub mod codec;
pub mod state_machine;

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;
use uuid::Uuid;

/// Standard Serial Port Profile service class UUID
pub const SPP_SERVICE_UUID: Uuid = Uuid::from_u128(0x00001101_0000_1000_8000_00805F9B34FB);

/// Link parameters shared by both ends
pub mod limits {
    /// Size of the buffer handed to each socket read
    pub const READ_BUFFER_SIZE: usize = 1024;

    /// Largest single write accepted by the session
    pub const MAX_WRITE_SIZE: usize = 64 * 1024;

    /// Pause before reopening the listening socket after it failed
    pub const RELISTEN_DELAY_MS: u64 = 1000;
}

/// Errors from parsing a peer address
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AddressError {
    #[error("Peer address is empty")]
    Empty,

    #[error("Not a Bluetooth address: {0}")]
    NotBluetooth(String),
}

/// Identifier of a remote endpoint.
///
/// Opaque to the manager: a Bluetooth `AA:BB:CC:DD:EE:FF` address for RFCOMM,
/// `host:port` for the TCP simulation, any label for in-memory peers.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PeerAddress(String);

impl PeerAddress {
    /// Create a peer address from its textual form
    pub fn new(address: impl Into<String>) -> Self {
        Self(address.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Interpret this address as a 48-bit Bluetooth device address
    pub fn to_bluetooth(&self) -> Result<[u8; 6], AddressError> {
        if self.0.is_empty() {
            return Err(AddressError::Empty);
        }

        let mut out = [0u8; 6];
        let mut parts = self.0.split(':');
        for byte in out.iter_mut() {
            let part = parts
                .next()
                .filter(|p| p.len() == 2 && p.bytes().all(|b| b.is_ascii_hexdigit()))
                .ok_or_else(|| AddressError::NotBluetooth(self.0.clone()))?;
            *byte = u8::from_str_radix(part, 16)
                .map_err(|_| AddressError::NotBluetooth(self.0.clone()))?;
        }

        if parts.next().is_some() {
            return Err(AddressError::NotBluetooth(self.0.clone()));
        }
        Ok(out)
    }

    /// Build the canonical upper-case form of a Bluetooth address
    pub fn from_bluetooth(bytes: [u8; 6]) -> Self {
        let text = bytes
            .iter()
            .map(|b| format!("{:02X}", b))
            .collect::<Vec<_>>()
            .join(":");
        Self(text)
    }
}

impl fmt::Display for PeerAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for PeerAddress {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

impl From<String> for PeerAddress {
    fn from(s: String) -> Self {
        Self(s)
    }
}

/// The service both listener and dialer rendezvous on
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ServiceIdentifier(Uuid);

impl ServiceIdentifier {
    /// The standard serial port service
    pub const SERIAL_PORT: ServiceIdentifier = ServiceIdentifier(SPP_SERVICE_UUID);

    pub const fn new(uuid: Uuid) -> Self {
        Self(uuid)
    }

    pub fn uuid(&self) -> Uuid {
        self.0
    }
}

impl Default for ServiceIdentifier {
    fn default() -> Self {
        Self::SERIAL_PORT
    }
}

impl fmt::Display for ServiceIdentifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Observable state of the connection manager
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum ConnectionState {
    /// No role running
    #[default]
    Idle,
    /// Waiting for an inbound connection
    Listening,
    /// Dialing the given peer
    Connecting(PeerAddress),
    /// Session active with the given peer
    Connected(PeerAddress),
}

impl ConnectionState {
    /// The peer involved in this state, if any
    pub fn peer(&self) -> Option<&PeerAddress> {
        match self {
            ConnectionState::Connecting(peer) | ConnectionState::Connected(peer) => Some(peer),
            ConnectionState::Idle | ConnectionState::Listening => None,
        }
    }

    pub fn is_connected(&self) -> bool {
        matches!(self, ConnectionState::Connected(_))
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectionState::Idle => write!(f, "idle"),
            ConnectionState::Listening => write!(f, "listening"),
            ConnectionState::Connecting(peer) => write!(f, "connecting to {}", peer),
            ConnectionState::Connected(peer) => write!(f, "connected to {}", peer),
        }
    }
}

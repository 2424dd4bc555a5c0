//! spp-link: a point-to-point serial link over Bluetooth RFCOMM
//!
//! The [`connection::ConnectionManager`] keeps exactly one logical session
//! with a remote peer while staying ready to accept an inbound connection.
//! Transports are pluggable: BlueZ RFCOMM for real radios, TCP for
//! development, and an in-memory transport for tests.

pub mod config;
pub mod connection;
pub mod error;
pub mod transport;

pub use spp_link_shared::{
    codec, limits, state_machine, ConnectionState, PeerAddress, ServiceIdentifier,
    SPP_SERVICE_UUID,
};

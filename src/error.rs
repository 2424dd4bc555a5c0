//! Error types for the link

use spp_link_shared::codec::CodecError;
use spp_link_shared::{AddressError, PeerAddress};
use std::io;
use thiserror::Error;

/// Errors raised while listening, accepting or dialing
#[derive(Error, Debug)]
pub enum TransportError {
    #[error("Bluetooth adapter not available: {0}")]
    AdapterUnavailable(String),

    #[error("Bluetooth adapter is powered off")]
    PoweredOff,

    #[error("Permission denied: {0}")]
    PermissionDenied(String),

    #[error("Invalid peer address: {0}")]
    InvalidAddress(#[from] AddressError),

    #[error("Peer {peer} unreachable: {reason}")]
    Unreachable { peer: PeerAddress, reason: String },

    #[error("Listening socket closed")]
    ListenerClosed,

    #[error("Bluetooth error: {0}")]
    Bluetooth(#[from] bluer::Error),

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

impl TransportError {
    /// Failures that retrying cannot fix until the platform grants
    /// something (adapter power, permissions).
    pub fn is_fatal(&self) -> bool {
        match self {
            TransportError::AdapterUnavailable(_)
            | TransportError::PoweredOff
            | TransportError::PermissionDenied(_) => true,
            TransportError::Bluetooth(e) => matches!(
                e.kind,
                bluer::ErrorKind::NotReady
                    | bluer::ErrorKind::NotAuthorized
                    | bluer::ErrorKind::NotPermitted
            ),
            TransportError::Io(e) => e.kind() == io::ErrorKind::PermissionDenied,
            _ => false,
        }
    }

    /// Wrap an I/O error from a dial attempt, keeping permission failures
    /// distinguishable.
    pub fn dial(peer: &PeerAddress, err: io::Error) -> Self {
        if err.kind() == io::ErrorKind::PermissionDenied {
            return TransportError::PermissionDenied(err.to_string());
        }
        TransportError::Unreachable {
            peer: peer.clone(),
            reason: err.to_string(),
        }
    }

    /// Wrap a BlueZ error from a dial attempt. Failures the platform must
    /// fix keep their kind so they stay fatal; the rest mean the peer was
    /// not reached.
    pub fn dial_bluetooth(peer: &PeerAddress, err: bluer::Error) -> Self {
        let err = TransportError::from(err);
        if err.is_fatal() {
            return err;
        }
        TransportError::Unreachable {
            peer: peer.clone(),
            reason: err.to_string(),
        }
    }
}

/// Errors returned to callers of the connection manager
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum LinkError {
    #[error("Connection manager has shut down")]
    ManagerShutdown,

    #[error("No active session")]
    NotConnected,

    #[error("Session write backlog is full")]
    WriteBacklogFull,

    #[error(transparent)]
    Codec(#[from] CodecError),
}

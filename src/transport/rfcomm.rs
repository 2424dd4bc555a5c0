//! RFCOMM transport implementation for Bluetooth serial links
//!
//! Both sides register a BlueZ profile for the service UUID: the server
//! role publishes the service record and hands over inbound connections,
//! the client role lets BlueZ resolve the peer's channel through SDP.

use crate::error::TransportError;
use crate::transport::traits::{Transport, TransportListener, TransportStream};
use async_trait::async_trait;
use bluer::rfcomm::{Profile, ProfileHandle, Role, Stream as RfcommStream};
use bluer::{Adapter, Address, Session};
use futures::StreamExt;
use spp_link_shared::{PeerAddress, ServiceIdentifier};
use std::io;
use std::time::Duration;
use tracing::{debug, info};

/// Default RFCOMM channel for the listening profile
pub const DEFAULT_RFCOMM_CHANNEL: u8 = 1;

/// How long BlueZ may take to hand over the socket once the profile
/// connection has been reported
const SOCKET_HANDOVER_TIMEOUT: Duration = Duration::from_secs(2);

#[async_trait]
impl TransportStream for RfcommStream {
    async fn shutdown(&mut self) -> io::Result<()> {
        tokio::io::AsyncWriteExt::shutdown(self).await
    }
}

/// Configuration for the RFCOMM transport
#[derive(Debug, Clone)]
pub struct RfcommConfig {
    /// Name published in the service record
    pub service_name: String,
    /// RFCOMM channel number
    pub channel: u8,
    /// Require authentication for inbound connections
    pub require_authentication: bool,
}

impl Default for RfcommConfig {
    fn default() -> Self {
        Self {
            service_name: "spp-link".into(),
            channel: DEFAULT_RFCOMM_CHANNEL,
            require_authentication: false,
        }
    }
}

/// Listening side: a registered server profile
pub struct RfcommListener {
    handle: ProfileHandle,
}

#[async_trait]
impl TransportListener for RfcommListener {
    type Stream = RfcommStream;

    async fn accept(&mut self) -> Result<(Self::Stream, PeerAddress), TransportError> {
        let request = self
            .handle
            .next()
            .await
            .ok_or(TransportError::ListenerClosed)?;

        let peer = PeerAddress::from_bluetooth(request.device().0);
        let stream = request.accept()?;
        info!("[BT] Accepted connection from {}", peer);
        Ok((stream, peer))
    }
}

/// RFCOMM transport over the BlueZ daemon
pub struct RfcommTransport {
    session: Session,
    adapter: Adapter,
    config: RfcommConfig,
}

impl RfcommTransport {
    /// Create a new RFCOMM transport on the given adapter
    pub fn new(session: Session, adapter: Adapter, config: RfcommConfig) -> Self {
        Self {
            session,
            adapter,
            config,
        }
    }

    fn server_profile(&self, service: ServiceIdentifier) -> Profile {
        Profile {
            uuid: service.uuid(),
            name: Some(self.config.service_name.clone()),
            role: Some(Role::Server),
            channel: Some(self.config.channel.into()),
            require_authentication: Some(self.config.require_authentication),
            require_authorization: Some(false),
            ..Default::default()
        }
    }

    fn client_profile(service: ServiceIdentifier) -> Profile {
        Profile {
            uuid: service.uuid(),
            role: Some(Role::Client),
            require_authentication: Some(false),
            require_authorization: Some(false),
            auto_connect: Some(false),
            ..Default::default()
        }
    }
}

#[async_trait]
impl Transport for RfcommTransport {
    type Stream = RfcommStream;
    type Listener = RfcommListener;

    async fn listen(&self, service: ServiceIdentifier) -> Result<Self::Listener, TransportError> {
        let handle = self
            .session
            .register_profile(self.server_profile(service))
            .await?;
        info!(
            "[BT] Serving {} ({}) on channel {}",
            self.config.service_name, service, self.config.channel
        );
        Ok(RfcommListener { handle })
    }

    async fn connect(
        &self,
        peer: &PeerAddress,
        service: ServiceIdentifier,
    ) -> Result<Self::Stream, TransportError> {
        let address = Address::new(peer.to_bluetooth()?);
        let device = self.adapter.device(address)?;
        let mut handle = self
            .session
            .register_profile(Self::client_profile(service))
            .await?;

        info!("[BT] Connecting to {} for service {}", peer, service);

        let uuid = service.uuid();
        let connect = device.connect_profile(&uuid);
        tokio::pin!(connect);
        let handover = tokio::time::sleep(SOCKET_HANDOVER_TIMEOUT);
        tokio::pin!(handover);
        let mut profile_connected = false;

        loop {
            tokio::select! {
                res = &mut connect, if !profile_connected => {
                    if let Err(e) = res {
                        return Err(TransportError::dial_bluetooth(peer, e));
                    }
                    profile_connected = true;
                    handover
                        .as_mut()
                        .reset(tokio::time::Instant::now() + SOCKET_HANDOVER_TIMEOUT);
                }
                _ = &mut handover, if profile_connected => {
                    // Typically the device was already connected on this profile
                    return Err(TransportError::Unreachable {
                        peer: peer.clone(),
                        reason: "profile connected but no socket was handed over".into(),
                    });
                }
                request = handle.next() => {
                    let request = request.ok_or_else(|| TransportError::Unreachable {
                        peer: peer.clone(),
                        reason: "profile unregistered".into(),
                    })?;
                    if request.device() != address {
                        debug!("[BT] Ignoring profile connection from {}", request.device());
                        continue;
                    }
                    let stream = request.accept()?;
                    info!("[BT] Connected to {}", peer);
                    return Ok(stream);
                }
            }
        }
    }

    fn name(&self) -> &'static str {
        "Bluetooth"
    }
}

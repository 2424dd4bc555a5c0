//! TCP transport simulating the serial link over loopback
//!
//! Peers are addressed as `host:port`; the service identifier has no
//! meaning here, both ends simply agree on ports.

use crate::error::TransportError;
use crate::transport::traits::{Transport, TransportListener, TransportStream};
use async_trait::async_trait;
use spp_link_shared::{PeerAddress, ServiceIdentifier};
use std::io;
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, info};

#[async_trait]
impl TransportStream for TcpStream {
    async fn shutdown(&mut self) -> io::Result<()> {
        tokio::io::AsyncWriteExt::shutdown(self).await
    }
}

/// Listening TCP socket
pub struct TcpTransportListener {
    inner: TcpListener,
}

impl TcpTransportListener {
    pub fn local_addr(&self) -> io::Result<std::net::SocketAddr> {
        self.inner.local_addr()
    }
}

#[async_trait]
impl TransportListener for TcpTransportListener {
    type Stream = TcpStream;

    async fn accept(&mut self) -> Result<(Self::Stream, PeerAddress), TransportError> {
        let (stream, addr) = self.inner.accept().await?;
        stream.set_nodelay(true)?;
        Ok((stream, PeerAddress::new(addr.to_string())))
    }
}

/// TCP transport bound to a fixed listen address
pub struct TcpTransport {
    listen_address: String,
}

impl TcpTransport {
    /// Create a new TCP transport listening on `listen_address`
    pub fn new(listen_address: impl Into<String>) -> Self {
        Self {
            listen_address: listen_address.into(),
        }
    }

    pub fn listen_address(&self) -> &str {
        &self.listen_address
    }
}

#[async_trait]
impl Transport for TcpTransport {
    type Stream = TcpStream;
    type Listener = TcpTransportListener;

    async fn listen(&self, service: ServiceIdentifier) -> Result<Self::Listener, TransportError> {
        let inner = TcpListener::bind(&self.listen_address).await.map_err(|e| {
            if e.kind() == io::ErrorKind::PermissionDenied {
                TransportError::PermissionDenied(e.to_string())
            } else {
                TransportError::Io(e)
            }
        })?;
        info!(
            "[TCP] Listening on {} (simulating service {})",
            self.listen_address, service
        );
        Ok(TcpTransportListener { inner })
    }

    async fn connect(
        &self,
        peer: &PeerAddress,
        _service: ServiceIdentifier,
    ) -> Result<Self::Stream, TransportError> {
        debug!("[TCP] Connecting to {}", peer);
        let stream = TcpStream::connect(peer.as_str())
            .await
            .map_err(|e| TransportError::dial(peer, e))?;
        stream.set_nodelay(true)?;
        Ok(stream)
    }

    fn name(&self) -> &'static str {
        "TCP simulation"
    }
}

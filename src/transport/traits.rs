//! Transport trait abstraction for pluggable link backends

use crate::error::TransportError;
use async_trait::async_trait;
use spp_link_shared::{PeerAddress, ServiceIdentifier};
use std::io;
use tokio::io::{AsyncRead, AsyncWrite};

/// A connected stream that can read and write bytes
#[async_trait]
pub trait TransportStream: AsyncRead + AsyncWrite + Send + Unpin + 'static {
    /// Close the transport gracefully
    async fn shutdown(&mut self) -> io::Result<()>;
}

/// A bound listening socket.
///
/// Dropping the listener closes it; an `accept` in progress is abandoned.
#[async_trait]
pub trait TransportListener: Send + 'static {
    /// The stream type produced by accepted connections
    type Stream: TransportStream;

    /// Wait for one inbound connection
    async fn accept(&mut self) -> Result<(Self::Stream, PeerAddress), TransportError>;
}

/// Factory for listening sockets and outbound connections
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    /// The stream type this transport produces
    type Stream: TransportStream;

    /// The listening socket type
    type Listener: TransportListener<Stream = Self::Stream>;

    /// Bind a discoverable endpoint advertising the service
    async fn listen(&self, service: ServiceIdentifier) -> Result<Self::Listener, TransportError>;

    /// Connect to the peer's instance of the service
    async fn connect(
        &self,
        peer: &PeerAddress,
        service: ServiceIdentifier,
    ) -> Result<Self::Stream, TransportError>;

    /// Human-readable name for this transport
    fn name(&self) -> &'static str;
}

/// The shared radio the transports run on.
///
/// Owned by the platform; the link only calls into it.
#[async_trait]
pub trait RadioAdapter: Send + Sync + 'static {
    /// Fail with a fatal error if the radio cannot be used right now
    async fn ensure_ready(&self) -> Result<(), TransportError>;

    /// Stop any device discovery in progress, it slows down connecting
    async fn cancel_discovery(&self) -> Result<(), TransportError>;
}

/// Radio stand-in for transports without one
#[derive(Debug, Default, Clone, Copy)]
pub struct NullRadio;

#[async_trait]
impl RadioAdapter for NullRadio {
    async fn ensure_ready(&self) -> Result<(), TransportError> {
        Ok(())
    }

    async fn cancel_discovery(&self) -> Result<(), TransportError> {
        Ok(())
    }
}

#[async_trait]
impl TransportStream for tokio::io::DuplexStream {
    async fn shutdown(&mut self) -> io::Result<()> {
        tokio::io::AsyncWriteExt::shutdown(self).await
    }
}

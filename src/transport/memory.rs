//! In-process transport with scripted peers
//!
//! Connections are `tokio::io::duplex` pipes. Outbound dials follow the
//! behaviour registered for each peer; inbound connections are injected with
//! [`MemoryTransport::dial_in`]. The far end of every connection is handed
//! to the caller so it can play the remote device.

use crate::error::TransportError;
use crate::transport::traits::{RadioAdapter, Transport, TransportListener};
use async_trait::async_trait;
use spp_link_shared::{PeerAddress, ServiceIdentifier};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::DuplexStream;
use tokio::sync::{mpsc, Mutex};

const PIPE_CAPACITY: usize = 64 * 1024;

/// How a scripted peer answers a dial
#[derive(Debug, Clone)]
pub enum PeerBehavior {
    /// Accept the connection
    Accept,
    /// Accept after a delay
    AcceptAfter(Duration),
    /// Refuse with the given reason
    Refuse(String),
    /// Refuse after a delay, like a radio timing out
    RefuseAfter(Duration, String),
    /// Never answer
    Hang,
    /// Fail with a permission error
    Deny,
}

type Inbound = (DuplexStream, PeerAddress);

#[derive(Default)]
struct Counters {
    listen_calls: AtomicUsize,
    connect_calls: AtomicUsize,
    live_listeners: AtomicUsize,
    max_live_listeners: AtomicUsize,
}

impl Counters {
    fn listener_opened(&self) {
        let live = self.live_listeners.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_live_listeners.fetch_max(live, Ordering::SeqCst);
    }
}

/// Transport whose peers live in the same process
#[derive(Clone)]
pub struct MemoryTransport {
    peers: Arc<Mutex<HashMap<PeerAddress, PeerBehavior>>>,
    /// Sender feeding the currently open listener, if any
    inbound: Arc<Mutex<Option<mpsc::UnboundedSender<Inbound>>>>,
    remote_tx: mpsc::UnboundedSender<(PeerAddress, DuplexStream)>,
    remote_rx: Arc<Mutex<mpsc::UnboundedReceiver<(PeerAddress, DuplexStream)>>>,
    counters: Arc<Counters>,
}

impl Default for MemoryTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryTransport {
    pub fn new() -> Self {
        let (remote_tx, remote_rx) = mpsc::unbounded_channel();
        Self {
            peers: Arc::new(Mutex::new(HashMap::new())),
            inbound: Arc::new(Mutex::new(None)),
            remote_tx,
            remote_rx: Arc::new(Mutex::new(remote_rx)),
            counters: Arc::new(Counters::default()),
        }
    }

    /// Script how dials to `peer` behave. Unknown peers refuse.
    pub async fn set_peer(&self, peer: impl Into<PeerAddress>, behavior: PeerBehavior) {
        self.peers.lock().await.insert(peer.into(), behavior);
    }

    /// Simulate `from` connecting to our listener.
    ///
    /// Returns the remote end of the new connection.
    pub async fn dial_in(
        &self,
        from: impl Into<PeerAddress>,
    ) -> Result<DuplexStream, TransportError> {
        let from = from.into();
        let guard = self.inbound.lock().await;
        let tx = guard.as_ref().ok_or_else(|| TransportError::Unreachable {
            peer: from.clone(),
            reason: "nobody is listening".into(),
        })?;

        let (local, remote) = tokio::io::duplex(PIPE_CAPACITY);
        tx.send((local, from.clone()))
            .map_err(|_| TransportError::Unreachable {
                peer: from,
                reason: "listening socket closed".into(),
            })?;
        Ok(remote)
    }

    /// Wait for the remote end of the next outbound connection
    pub async fn next_remote(&self) -> Option<(PeerAddress, DuplexStream)> {
        self.remote_rx.lock().await.recv().await
    }

    /// Number of times a listening socket was opened
    pub fn listen_calls(&self) -> usize {
        self.counters.listen_calls.load(Ordering::SeqCst)
    }

    /// Number of outbound dial attempts
    pub fn connect_calls(&self) -> usize {
        self.counters.connect_calls.load(Ordering::SeqCst)
    }

    /// Listening sockets currently open
    pub fn live_listeners(&self) -> usize {
        self.counters.live_listeners.load(Ordering::SeqCst)
    }

    /// Most listening sockets ever open at the same time
    pub fn max_live_listeners(&self) -> usize {
        self.counters.max_live_listeners.load(Ordering::SeqCst)
    }
}

/// Listening end of a [`MemoryTransport`]
pub struct MemoryListener {
    rx: mpsc::UnboundedReceiver<Inbound>,
    counters: Arc<Counters>,
}

impl Drop for MemoryListener {
    fn drop(&mut self) {
        self.counters.live_listeners.fetch_sub(1, Ordering::SeqCst);
    }
}

#[async_trait]
impl TransportListener for MemoryListener {
    type Stream = DuplexStream;

    async fn accept(&mut self) -> Result<(Self::Stream, PeerAddress), TransportError> {
        self.rx.recv().await.ok_or(TransportError::ListenerClosed)
    }
}

#[async_trait]
impl Transport for MemoryTransport {
    type Stream = DuplexStream;
    type Listener = MemoryListener;

    async fn listen(&self, _service: ServiceIdentifier) -> Result<Self::Listener, TransportError> {
        let (tx, rx) = mpsc::unbounded_channel();
        *self.inbound.lock().await = Some(tx);

        self.counters.listen_calls.fetch_add(1, Ordering::SeqCst);
        self.counters.listener_opened();
        Ok(MemoryListener {
            rx,
            counters: self.counters.clone(),
        })
    }

    async fn connect(
        &self,
        peer: &PeerAddress,
        _service: ServiceIdentifier,
    ) -> Result<Self::Stream, TransportError> {
        self.counters.connect_calls.fetch_add(1, Ordering::SeqCst);
        let behavior = self
            .peers
            .lock()
            .await
            .get(peer)
            .cloned()
            .unwrap_or_else(|| PeerBehavior::Refuse("no such peer".into()));

        let refuse = |reason: String| TransportError::Unreachable {
            peer: peer.clone(),
            reason,
        };

        match behavior {
            PeerBehavior::Accept => {}
            PeerBehavior::AcceptAfter(delay) => tokio::time::sleep(delay).await,
            PeerBehavior::Refuse(reason) => return Err(refuse(reason)),
            PeerBehavior::RefuseAfter(delay, reason) => {
                tokio::time::sleep(delay).await;
                return Err(refuse(reason));
            }
            PeerBehavior::Hang => std::future::pending::<()>().await,
            PeerBehavior::Deny => {
                return Err(TransportError::PermissionDenied(format!(
                    "not allowed to dial {}",
                    peer
                )))
            }
        }

        let (local, remote) = tokio::io::duplex(PIPE_CAPACITY);
        let _ = self.remote_tx.send((peer.clone(), remote));
        Ok(local)
    }

    fn name(&self) -> &'static str {
        "memory"
    }
}

/// Radio stand-in recording how the link used it
#[derive(Debug)]
pub struct MemoryRadio {
    powered: AtomicBool,
    discovery_cancels: AtomicUsize,
}

impl Default for MemoryRadio {
    fn default() -> Self {
        Self {
            powered: AtomicBool::new(true),
            discovery_cancels: AtomicUsize::new(0),
        }
    }
}

impl MemoryRadio {
    pub fn set_powered(&self, powered: bool) {
        self.powered.store(powered, Ordering::SeqCst);
    }

    pub fn discovery_cancels(&self) -> usize {
        self.discovery_cancels.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl RadioAdapter for MemoryRadio {
    async fn ensure_ready(&self) -> Result<(), TransportError> {
        if self.powered.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(TransportError::PoweredOff)
        }
    }

    async fn cancel_discovery(&self) -> Result<(), TransportError> {
        self.discovery_cancels.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

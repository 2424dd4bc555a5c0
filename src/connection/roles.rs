//! Listener and Dialer roles, and the handle the manager keeps for any role
//!
//! A role is one task owning at most one socket. It reports its outcome as
//! a [`RoleEvent`] on the manager's channel and never touches manager state.
//! Cancellation is a oneshot: dropping the sender makes the role abandon its
//! pending accept/connect/read, which closes the socket, and exit silently.

use crate::connection::session::run_session;
use crate::error::TransportError;
use crate::transport::{RadioAdapter, Transport, TransportListener};
use bytes::Bytes;
use spp_link_shared::{PeerAddress, ServiceIdentifier};
use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Terminal or streaming outcome reported by a role
pub(crate) enum RoleOutcome<S> {
    Accepted { stream: S, peer: PeerAddress },
    Connected { stream: S, peer: PeerAddress },
    DialFailed { peer: PeerAddress, error: TransportError },
    ListenFailed { error: TransportError },
    Message { peer: PeerAddress, text: String },
    SessionEnded { peer: PeerAddress, reason: String },
}

impl<S> fmt::Debug for RoleOutcome<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RoleOutcome::Accepted { peer, .. } => write!(f, "Accepted({})", peer),
            RoleOutcome::Connected { peer, .. } => write!(f, "Connected({})", peer),
            RoleOutcome::DialFailed { peer, error } => write!(f, "DialFailed({}: {})", peer, error),
            RoleOutcome::ListenFailed { error } => write!(f, "ListenFailed({})", error),
            RoleOutcome::Message { peer, text } => {
                write!(f, "Message({}, {} bytes)", peer, text.len())
            }
            RoleOutcome::SessionEnded { peer, reason } => {
                write!(f, "SessionEnded({}: {})", peer, reason)
            }
        }
    }
}

/// Outcome tagged with the generation of the role that produced it
#[derive(Debug)]
pub(crate) struct RoleEvent<S> {
    pub generation: u64,
    pub outcome: RoleOutcome<S>,
}

pub(crate) type RoleEventSender<S> = mpsc::UnboundedSender<RoleEvent<S>>;

/// Which role a handle refers to
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum RoleKind {
    Listener,
    Dialer(PeerAddress),
    Session(PeerAddress),
}

impl fmt::Display for RoleKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RoleKind::Listener => write!(f, "listener"),
            RoleKind::Dialer(peer) => write!(f, "dialer({})", peer),
            RoleKind::Session(peer) => write!(f, "session({})", peer),
        }
    }
}

/// Counts live role tasks
#[derive(Debug, Default)]
pub(crate) struct RoleGauge {
    live: AtomicUsize,
    peak: AtomicUsize,
}

impl RoleGauge {
    pub fn live(&self) -> usize {
        self.live.load(Ordering::SeqCst)
    }

    pub fn peak(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }

    fn enter(self: &Arc<Self>) -> GaugeGuard {
        let live = self.live.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(live, Ordering::SeqCst);
        GaugeGuard(self.clone())
    }
}

struct GaugeGuard(Arc<RoleGauge>);

impl Drop for GaugeGuard {
    fn drop(&mut self) {
        self.0.live.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Ownership token for a running role
pub(crate) struct RoleHandle {
    pub kind: RoleKind,
    pub generation: u64,
    cancel: Option<oneshot::Sender<()>>,
    task: JoinHandle<()>,
    /// Write queue, sessions only
    outbound: Option<mpsc::Sender<Bytes>>,
}

impl RoleHandle {
    pub fn outbound(&self) -> Option<&mpsc::Sender<Bytes>> {
        self.outbound.as_ref()
    }

    /// Cancel the role and wait until its task has exited
    pub async fn retire(mut self) {
        drop(self.cancel.take());
        match (&mut self.task).await {
            Ok(()) => debug!("[ROLE] {} #{} retired", self.kind, self.generation),
            Err(e) if e.is_panic() => {
                error!("[ROLE] {} #{} panicked: {}", self.kind, self.generation, e)
            }
            Err(e) => warn!("[ROLE] {} #{} aborted: {}", self.kind, self.generation, e),
        }
    }
}

/// Everything a role needs from the manager
pub(crate) struct RoleContext<T: Transport> {
    pub transport: Arc<T>,
    pub radio: Arc<dyn RadioAdapter>,
    pub service: ServiceIdentifier,
    pub events: RoleEventSender<T::Stream>,
    pub gauge: Arc<RoleGauge>,
}

impl<T: Transport> Clone for RoleContext<T> {
    fn clone(&self) -> Self {
        Self {
            transport: self.transport.clone(),
            radio: self.radio.clone(),
            service: self.service,
            events: self.events.clone(),
            gauge: self.gauge.clone(),
        }
    }
}

struct Emitter<S> {
    generation: u64,
    events: RoleEventSender<S>,
}

impl<S> Emitter<S> {
    fn emit(&self, outcome: RoleOutcome<S>) {
        // The manager only goes away at shutdown; nothing left to report to
        let _ = self.events.send(RoleEvent {
            generation: self.generation,
            outcome,
        });
    }
}

/// Start a listener that accepts one inbound connection.
///
/// With `delay`, the listening socket is only opened after the pause.
pub(crate) fn spawn_listener<T: Transport>(
    ctx: &RoleContext<T>,
    generation: u64,
    delay: Option<Duration>,
) -> RoleHandle {
    let (cancel_tx, cancel_rx) = oneshot::channel();
    let guard = ctx.gauge.enter();
    let ctx = ctx.clone();

    let task = tokio::spawn(async move {
        let _guard = guard;
        run_listener(ctx, generation, delay, cancel_rx).await;
    });

    RoleHandle {
        kind: RoleKind::Listener,
        generation,
        cancel: Some(cancel_tx),
        task,
        outbound: None,
    }
}

async fn run_listener<T: Transport>(
    ctx: RoleContext<T>,
    generation: u64,
    delay: Option<Duration>,
    mut cancel: oneshot::Receiver<()>,
) {
    let emitter = Emitter {
        generation,
        events: ctx.events.clone(),
    };

    if let Some(delay) = delay {
        debug!("[LISTEN] Reopening in {:?}", delay);
        tokio::select! {
            _ = &mut cancel => return,
            _ = tokio::time::sleep(delay) => {}
        }
    }

    let opened = tokio::select! {
        _ = &mut cancel => return,
        opened = async {
            ctx.radio.ensure_ready().await?;
            ctx.transport.listen(ctx.service).await
        } => opened,
    };

    let mut listener = match opened {
        Ok(listener) => listener,
        Err(error) => {
            warn!("[LISTEN] Could not open listening socket: {}", error);
            emitter.emit(RoleOutcome::ListenFailed { error });
            return;
        }
    };

    info!(
        "[LISTEN] #{} waiting for a connection on {} ({})",
        generation,
        ctx.service,
        ctx.transport.name()
    );

    tokio::select! {
        _ = &mut cancel => {
            // Closing the socket is the expected way out, not a failure
            debug!("[LISTEN] #{} closing listening socket", generation);
        }
        accepted = listener.accept() => match accepted {
            Ok((stream, peer)) => {
                drop(listener);
                info!("[LISTEN] #{} accepted {}", generation, peer);
                emitter.emit(RoleOutcome::Accepted { stream, peer });
            }
            Err(error) => {
                warn!("[LISTEN] #{} accept failed: {}", generation, error);
                emitter.emit(RoleOutcome::ListenFailed { error });
            }
        },
    }
}

/// Start a dialer making one attempt to reach `peer`
pub(crate) fn spawn_dialer<T: Transport>(
    ctx: &RoleContext<T>,
    generation: u64,
    peer: PeerAddress,
) -> RoleHandle {
    let (cancel_tx, cancel_rx) = oneshot::channel();
    let guard = ctx.gauge.enter();
    let task_ctx = ctx.clone();
    let task_peer = peer.clone();

    let task = tokio::spawn(async move {
        let _guard = guard;
        run_dialer(task_ctx, generation, task_peer, cancel_rx).await;
    });

    RoleHandle {
        kind: RoleKind::Dialer(peer),
        generation,
        cancel: Some(cancel_tx),
        task,
        outbound: None,
    }
}

async fn run_dialer<T: Transport>(
    ctx: RoleContext<T>,
    generation: u64,
    peer: PeerAddress,
    mut cancel: oneshot::Receiver<()>,
) {
    let emitter = Emitter {
        generation,
        events: ctx.events.clone(),
    };

    let attempt = async {
        ctx.radio.ensure_ready().await?;
        // Discovery competes with connecting for the radio
        if let Err(e) = ctx.radio.cancel_discovery().await {
            debug!("[DIAL] Could not cancel discovery: {}", e);
        }
        ctx.transport.connect(&peer, ctx.service).await
    };

    info!("[DIAL] #{} connecting to {} via {}", generation, peer, ctx.transport.name());

    tokio::select! {
        _ = &mut cancel => {
            info!("[DIAL] #{} attempt to {} cancelled", generation, peer);
        }
        result = attempt => match result {
            Ok(stream) => {
                info!("[DIAL] #{} connected to {}", generation, peer);
                emitter.emit(RoleOutcome::Connected { stream, peer });
            }
            Err(error) => {
                warn!("[DIAL] #{} could not reach {}: {}", generation, peer, error);
                emitter.emit(RoleOutcome::DialFailed { peer, error });
            }
        },
    }
}

/// Start a session driving an established connection
pub(crate) fn spawn_session<T: Transport>(
    ctx: &RoleContext<T>,
    generation: u64,
    stream: T::Stream,
    peer: PeerAddress,
    read_buffer_size: usize,
    outbound_capacity: usize,
) -> RoleHandle {
    let (cancel_tx, cancel_rx) = oneshot::channel();
    let (outbound_tx, outbound_rx) = mpsc::channel(outbound_capacity);
    let guard = ctx.gauge.enter();
    let emitter = Emitter {
        generation,
        events: ctx.events.clone(),
    };
    let task_peer = peer.clone();

    let task = tokio::spawn(async move {
        let _guard = guard;
        let ended = run_session(
            stream,
            &task_peer,
            read_buffer_size,
            outbound_rx,
            cancel_rx,
            |text| {
                emitter.emit(RoleOutcome::Message {
                    peer: task_peer.clone(),
                    text,
                })
            },
        )
        .await;

        if let Some(reason) = ended {
            emitter.emit(RoleOutcome::SessionEnded {
                peer: task_peer.clone(),
                reason,
            });
        }
    });

    RoleHandle {
        kind: RoleKind::Session(peer),
        generation,
        cancel: Some(cancel_tx),
        task,
        outbound: Some(outbound_tx),
    }
}

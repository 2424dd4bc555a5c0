//! Connection manager: one serialized owner for the link state and its role
//!
//! The manager runs as a task owning the [`LinkStateMachine`], the single
//! current role and the generation counter. Caller requests arrive on a
//! command mailbox, role outcomes on an event channel; both are handled one
//! at a time, so no request can race a role's result. Every transition
//! retires (cancels and joins) the current role before starting the next.

use crate::connection::roles::{
    spawn_dialer, spawn_listener, spawn_session, RoleContext, RoleEvent, RoleGauge, RoleHandle,
    RoleOutcome,
};
use crate::error::{LinkError, TransportError};
use crate::transport::{RadioAdapter, Transport};
use spp_link_shared::codec;
use spp_link_shared::state_machine::{LinkInput, LinkStateMachine, RoleAction, TransitionResult};
use spp_link_shared::{limits, ConnectionState, PeerAddress, ServiceIdentifier};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, oneshot, watch};
use tracing::{debug, error, info, warn};

const COMMAND_CAPACITY: usize = 32;

/// Events delivered to observers
#[derive(Debug, Clone, PartialEq)]
pub enum LinkEvent {
    /// The connection state changed
    StateChanged(ConnectionState),
    /// Text arrived on the active session
    MessageReceived { peer: PeerAddress, text: String },
    /// The platform refused something retrying cannot fix (adapter off,
    /// permission denied). The manager is idle until asked again.
    CannotProceed { reason: String },
}

/// Configuration for the connection manager
#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    /// Service both ends rendezvous on
    pub service: ServiceIdentifier,
    /// Size of each session read
    pub read_buffer_size: usize,
    /// Largest text accepted by `request_write`
    pub max_write_size: usize,
    /// Pause before reopening a listener that failed
    pub relisten_delay: Duration,
    /// Capacity of the observer event channel
    pub event_capacity: usize,
    /// Writes queued on a session before `request_write` fails
    pub outbound_capacity: usize,
    /// Start listening as soon as the manager is created
    pub listen_on_start: bool,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            service: ServiceIdentifier::SERIAL_PORT,
            read_buffer_size: limits::READ_BUFFER_SIZE,
            max_write_size: limits::MAX_WRITE_SIZE,
            relisten_delay: Duration::from_millis(limits::RELISTEN_DELAY_MS),
            event_capacity: 100,
            outbound_capacity: 100,
            listen_on_start: true,
        }
    }
}

enum Command {
    Listen,
    Connect(PeerAddress),
    Write {
        text: String,
        reply: oneshot::Sender<Result<(), LinkError>>,
    },
    Shutdown {
        reply: oneshot::Sender<()>,
    },
}

/// Cloneable handle for issuing requests to the manager
#[derive(Clone)]
pub struct LinkHandle {
    commands: mpsc::Sender<Command>,
    state: watch::Receiver<ConnectionState>,
    gauge: Arc<RoleGauge>,
}

impl LinkHandle {
    async fn send(&self, command: Command) -> Result<(), LinkError> {
        self.commands
            .send(command)
            .await
            .map_err(|_| LinkError::ManagerShutdown)
    }

    /// Wait for an inbound connection, dropping whatever role is active.
    /// A no-op while already listening.
    pub async fn request_listen(&self) -> Result<(), LinkError> {
        self.send(Command::Listen).await
    }

    /// Dial `peer`, dropping whatever role is active
    pub async fn request_connect(&self, peer: impl Into<PeerAddress>) -> Result<(), LinkError> {
        self.send(Command::Connect(peer.into())).await
    }

    /// Queue text on the active session.
    ///
    /// Returns once the session has accepted the payload; the write itself
    /// is best effort.
    pub async fn request_write(&self, text: impl Into<String>) -> Result<(), LinkError> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::Write {
            text: text.into(),
            reply,
        })
        .await?;
        rx.await.map_err(|_| LinkError::ManagerShutdown)?
    }

    /// Retire the active role and go idle. Returns once the role has exited.
    pub async fn shutdown(&self) -> Result<(), LinkError> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::Shutdown { reply }).await?;
        rx.await.map_err(|_| LinkError::ManagerShutdown)
    }

    /// Current connection state
    pub fn state(&self) -> ConnectionState {
        self.state.borrow().clone()
    }

    /// Wait until the state satisfies `predicate`
    pub async fn wait_for(
        &self,
        predicate: impl FnMut(&ConnectionState) -> bool,
    ) -> Result<ConnectionState, LinkError> {
        let mut state = self.state.clone();
        let matched = state
            .wait_for(predicate)
            .await
            .map_err(|_| LinkError::ManagerShutdown)?;
        let state = (*matched).clone();
        Ok(state)
    }

    /// Role tasks alive right now
    pub fn live_roles(&self) -> usize {
        self.gauge.live()
    }

    /// Most role tasks ever alive at the same time
    pub fn max_live_roles(&self) -> usize {
        self.gauge.peak()
    }
}

/// Owns the manager task and the observer end of its event channel
pub struct ConnectionManager {
    handle: LinkHandle,
    event_rx: mpsc::Receiver<LinkEvent>,
}

impl ConnectionManager {
    /// Create a new connection manager and start its task.
    ///
    /// Must be called from within a tokio runtime.
    pub fn new<T: Transport>(
        transport: Arc<T>,
        radio: Arc<dyn RadioAdapter>,
        config: ConnectionConfig,
    ) -> Self {
        let (command_tx, command_rx) = mpsc::channel(COMMAND_CAPACITY);
        let (event_tx, event_rx) = mpsc::channel(config.event_capacity.max(1));
        let (state_tx, state_rx) = watch::channel(ConnectionState::Idle);
        let (role_tx, role_rx) = mpsc::unbounded_channel();
        let gauge = Arc::new(RoleGauge::default());

        info!(
            "[LINK] Starting connection manager ({}, service {})",
            transport.name(),
            config.service
        );

        let actor = ManagerActor {
            ctx: RoleContext {
                transport,
                radio,
                service: config.service,
                events: role_tx,
                gauge: gauge.clone(),
            },
            config,
            fsm: LinkStateMachine::new(),
            role: None,
            generation: 0,
            commands: command_rx,
            role_events: role_rx,
            state_tx,
            event_tx,
        };
        tokio::spawn(actor.run());

        Self {
            handle: LinkHandle {
                commands: command_tx,
                state: state_rx,
                gauge,
            },
            event_rx,
        }
    }

    /// Receive the next observer event
    pub async fn recv(&mut self) -> Option<LinkEvent> {
        self.event_rx.recv().await
    }

    /// Get a handle for issuing requests
    pub fn handle(&self) -> LinkHandle {
        self.handle.clone()
    }

    /// Current connection state
    pub fn state(&self) -> ConnectionState {
        self.handle.state()
    }

    /// Split into the request handle and the event receiver
    pub fn into_parts(self) -> (LinkHandle, mpsc::Receiver<LinkEvent>) {
        (self.handle, self.event_rx)
    }
}

struct ManagerActor<T: Transport> {
    ctx: RoleContext<T>,
    config: ConnectionConfig,
    fsm: LinkStateMachine,
    role: Option<RoleHandle>,
    /// Generation of the current role; events from older roles are stale
    generation: u64,
    commands: mpsc::Receiver<Command>,
    role_events: mpsc::UnboundedReceiver<RoleEvent<T::Stream>>,
    state_tx: watch::Sender<ConnectionState>,
    event_tx: mpsc::Sender<LinkEvent>,
}

impl<T: Transport> ManagerActor<T> {
    async fn run(mut self) {
        if self.config.listen_on_start {
            self.apply(LinkInput::ListenRequested, None).await;
        }

        loop {
            tokio::select! {
                command = self.commands.recv() => match command {
                    Some(command) => self.handle_command(command).await,
                    None => break,
                },
                Some(event) = self.role_events.recv() => self.handle_role_event(event).await,
            }
        }

        self.retire_current().await;
        info!("[LINK] Connection manager stopped");
    }

    async fn handle_command(&mut self, command: Command) {
        match command {
            Command::Listen => self.apply(LinkInput::ListenRequested, None).await,
            Command::Connect(peer) => self.apply(LinkInput::ConnectRequested(peer), None).await,
            Command::Write { text, reply } => {
                let _ = reply.send(self.write(&text));
            }
            Command::Shutdown { reply } => {
                info!("[LINK] Shutdown requested");
                self.apply(LinkInput::Shutdown, None).await;
                let _ = reply.send(());
            }
        }
    }

    async fn handle_role_event(&mut self, event: RoleEvent<T::Stream>) {
        if event.generation != self.generation {
            debug!(
                "[LINK] Dropping stale {:?} from role #{} (current #{})",
                event.outcome, event.generation, self.generation
            );
            return;
        }

        match event.outcome {
            RoleOutcome::Message { peer, text } => self.emit_message(peer, text),
            RoleOutcome::Accepted { stream, peer } => {
                self.apply(LinkInput::Accepted(peer), Some(stream)).await;
            }
            RoleOutcome::Connected { stream, peer } => {
                self.apply(LinkInput::Connected(peer), Some(stream)).await;
            }
            RoleOutcome::DialFailed { peer, error } => {
                if error.is_fatal() {
                    self.cannot_proceed(error).await;
                } else {
                    self.apply(LinkInput::DialFailed(peer), None).await;
                }
            }
            RoleOutcome::ListenFailed { error } => {
                if error.is_fatal() {
                    self.cannot_proceed(error).await;
                } else {
                    self.apply(LinkInput::ListenFailed, None).await;
                }
            }
            RoleOutcome::SessionEnded { peer, reason } => {
                info!("[LINK] Session with {} ended: {}", peer, reason);
                self.apply(LinkInput::SessionEnded, None).await;
            }
        }
    }

    /// Feed one input through the state machine and carry out its action
    async fn apply(&mut self, input: LinkInput, stream: Option<T::Stream>) {
        match self.fsm.process(input) {
            TransitionResult::Success { state, action } => {
                self.run_action(action, stream).await;
                self.publish(state).await;
            }
            TransitionResult::Unchanged(state) => {
                debug!("[LINK] Already {}", state);
            }
            TransitionResult::Invalid { from, input } => {
                warn!("[LINK] Ignoring {:?} while {}", input, from);
            }
        }
    }

    async fn run_action(&mut self, action: RoleAction, stream: Option<T::Stream>) {
        match action {
            RoleAction::StartListener => {
                self.retire_current().await;
                self.role = Some(spawn_listener(&self.ctx, self.generation, None));
            }
            RoleAction::RestartListener => {
                self.retire_current().await;
                let delay = Some(self.config.relisten_delay);
                self.role = Some(spawn_listener(&self.ctx, self.generation, delay));
            }
            RoleAction::StartDialer(peer) => {
                self.retire_current().await;
                self.role = Some(spawn_dialer(&self.ctx, self.generation, peer));
            }
            RoleAction::StartSession(peer) => {
                self.retire_current().await;
                let Some(stream) = stream else {
                    error!("[LINK] No socket to start a session with {}", peer);
                    return;
                };
                self.role = Some(spawn_session(
                    &self.ctx,
                    self.generation,
                    stream,
                    peer,
                    self.config.read_buffer_size,
                    self.config.outbound_capacity.max(1),
                ));
            }
            RoleAction::ForwardWrite => {}
            RoleAction::StopAll => self.retire_current().await,
        }
    }

    fn write(&mut self, text: &str) -> Result<(), LinkError> {
        let payload = codec::encode_with_limit(text, self.config.max_write_size)?;

        match self.fsm.process(LinkInput::WriteRequested) {
            TransitionResult::Success {
                action: RoleAction::ForwardWrite,
                ..
            } => {}
            _ => return Err(LinkError::NotConnected),
        }

        let outbound = self
            .role
            .as_ref()
            .and_then(|role| role.outbound())
            .ok_or(LinkError::NotConnected)?;

        outbound.try_send(payload).map_err(|e| match e {
            TrySendError::Full(_) => LinkError::WriteBacklogFull,
            TrySendError::Closed(_) => LinkError::NotConnected,
        })
    }

    async fn cannot_proceed(&mut self, error: TransportError) {
        error!("[LINK] Cannot proceed: {}", error);
        self.apply(LinkInput::CannotProceed, None).await;
        self.emit(LinkEvent::CannotProceed {
            reason: error.to_string(),
        })
        .await;
    }

    /// Cancel and join the current role. Its queued events become stale.
    async fn retire_current(&mut self) {
        if let Some(role) = self.role.take() {
            role.retire().await;
        }
        self.generation += 1;
    }

    async fn publish(&mut self, state: ConnectionState) {
        let changed = self.state_tx.send_if_modified(|current| {
            if *current == state {
                return false;
            }
            *current = state.clone();
            true
        });

        if changed {
            info!("[LINK] State: {}", state);
            self.emit(LinkEvent::StateChanged(state)).await;
        }
    }

    async fn emit(&self, event: LinkEvent) {
        if self.event_tx.send(event).await.is_err() {
            debug!("[LINK] No observer for events");
        }
    }

    /// Messages are shed when the observer falls behind, so a busy peer
    /// cannot stall state transitions.
    fn emit_message(&self, peer: PeerAddress, text: String) {
        match self.event_tx.try_send(LinkEvent::MessageReceived { peer, text }) {
            Ok(()) => {}
            Err(TrySendError::Full(LinkEvent::MessageReceived { peer, text })) => {
                warn!(
                    "[LINK] Observer is behind, dropped {} bytes from {}",
                    text.len(),
                    peer
                );
            }
            Err(_) => debug!("[LINK] No observer for events"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::{MemoryRadio, MemoryTransport, PeerBehavior, TcpTransport};
    use spp_link_shared::codec::CodecError;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::time::{sleep, timeout};

    const WAIT: Duration = Duration::from_secs(5);

    fn test_config() -> ConnectionConfig {
        ConnectionConfig {
            relisten_delay: Duration::from_millis(20),
            ..ConnectionConfig::default()
        }
    }

    fn start(config: ConnectionConfig) -> (MemoryTransport, Arc<MemoryRadio>, ConnectionManager) {
        let transport = MemoryTransport::new();
        let radio = Arc::new(MemoryRadio::default());
        let manager = ConnectionManager::new(Arc::new(transport.clone()), radio.clone(), config);
        (transport, radio, manager)
    }

    async fn next_event(manager: &mut ConnectionManager) -> LinkEvent {
        timeout(WAIT, manager.recv())
            .await
            .expect("timed out waiting for an event")
            .expect("event channel closed")
    }

    async fn wait_state(handle: &LinkHandle, want: ConnectionState) {
        timeout(WAIT, handle.wait_for(|state| *state == want))
            .await
            .expect("timed out waiting for state")
            .unwrap();
    }

    async fn wait_listener(transport: &MemoryTransport) {
        timeout(WAIT, async {
            while transport.live_listeners() == 0 {
                sleep(Duration::from_millis(1)).await;
            }
        })
        .await
        .expect("listener never opened");
    }

    /// Round-trip through the mailbox so earlier requests have been handled
    async fn sync(handle: &LinkHandle) {
        let _ = handle.request_write("sync").await;
    }

    fn spawn_echo(mut remote: tokio::io::DuplexStream) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            let mut buf = [0u8; 1024];
            loop {
                match remote.read(&mut buf).await {
                    Ok(0) | Err(_) => break,
                    Ok(n) => {
                        if remote.write_all(&buf[..n]).await.is_err() {
                            break;
                        }
                    }
                }
            }
        })
    }

    #[tokio::test]
    async fn test_listens_on_start() {
        let (transport, _radio, mut manager) = start(test_config());

        assert_eq!(
            next_event(&mut manager).await,
            LinkEvent::StateChanged(ConnectionState::Listening)
        );
        wait_listener(&transport).await;
        assert_eq!(manager.state(), ConnectionState::Listening);
    }

    #[tokio::test]
    async fn test_idle_until_asked_to_listen() {
        let config = ConnectionConfig {
            listen_on_start: false,
            ..test_config()
        };
        let (transport, _radio, manager) = start(config);
        let handle = manager.handle();

        sync(&handle).await;
        assert_eq!(handle.state(), ConnectionState::Idle);
        assert_eq!(transport.listen_calls(), 0);

        handle.request_listen().await.unwrap();
        wait_state(&handle, ConnectionState::Listening).await;
        wait_listener(&transport).await;
    }

    #[tokio::test]
    async fn test_listen_while_listening_is_a_no_op() {
        let (transport, _radio, manager) = start(test_config());
        let handle = manager.handle();
        wait_listener(&transport).await;

        handle.request_listen().await.unwrap();
        handle.request_listen().await.unwrap();
        sync(&handle).await;

        assert_eq!(transport.listen_calls(), 1);
        assert_eq!(transport.max_live_listeners(), 1);
        assert_eq!(handle.live_roles(), 1);
    }

    #[tokio::test]
    async fn test_inbound_session_recovers_into_listening() {
        let (transport, _radio, mut manager) = start(test_config());
        let handle = manager.handle();
        wait_listener(&transport).await;

        let mut remote = transport.dial_in("peer-a").await.unwrap();
        wait_state(&handle, ConnectionState::Connected("peer-a".into())).await;

        remote.write_all(b"ping").await.unwrap();
        loop {
            if let LinkEvent::MessageReceived { peer, text } = next_event(&mut manager).await {
                assert_eq!(peer.as_str(), "peer-a");
                assert_eq!(text, "ping");
                break;
            }
        }

        handle.request_write("pong").await.unwrap();
        let mut buf = [0u8; 4];
        remote.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"pong");

        // Closing the socket externally ends the session
        drop(remote);
        wait_state(&handle, ConnectionState::Listening).await;
        wait_listener(&transport).await;

        let _second = transport.dial_in("peer-b").await.unwrap();
        wait_state(&handle, ConnectionState::Connected("peer-b".into())).await;
        assert_eq!(transport.max_live_listeners(), 1);
        assert!(handle.max_live_roles() <= 1);
    }

    #[tokio::test]
    async fn test_write_round_trip_with_echo_peer() {
        let (transport, _radio, mut manager) = start(test_config());
        transport.set_peer("echo", PeerBehavior::Accept).await;
        let handle = manager.handle();

        handle.request_connect("echo").await.unwrap();
        let (peer, remote) = timeout(WAIT, transport.next_remote()).await.unwrap().unwrap();
        assert_eq!(peer.as_str(), "echo");
        let echo = spawn_echo(remote);
        wait_state(&handle, ConnectionState::Connected("echo".into())).await;

        handle.request_write("Hello there!").await.unwrap();

        let mut messages = Vec::new();
        loop {
            match next_event(&mut manager).await {
                LinkEvent::MessageReceived { peer, text } => {
                    assert_eq!(peer.as_str(), "echo");
                    messages.push(text);
                    break;
                }
                LinkEvent::StateChanged(_) => continue,
                other => panic!("unexpected event: {:?}", other),
            }
        }
        assert!(timeout(Duration::from_millis(100), manager.recv()).await.is_err());
        assert_eq!(messages, ["Hello there!"]);

        handle.shutdown().await.unwrap();
        timeout(WAIT, echo).await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_second_connect_supersedes_first() {
        let (transport, _radio, mut manager) = start(test_config());
        transport
            .set_peer("peer-a", PeerBehavior::AcceptAfter(Duration::from_millis(100)))
            .await;
        transport.set_peer("peer-b", PeerBehavior::Accept).await;
        let handle = manager.handle();

        handle.request_connect("peer-a").await.unwrap();
        handle.request_connect("peer-b").await.unwrap();
        wait_state(&handle, ConnectionState::Connected("peer-b".into())).await;

        let (peer, _remote) = timeout(WAIT, transport.next_remote()).await.unwrap().unwrap();
        assert_eq!(peer.as_str(), "peer-b");

        // peer-a would have answered by now; nothing from it may surface
        sleep(Duration::from_millis(200)).await;
        assert!(timeout(Duration::from_millis(10), transport.next_remote())
            .await
            .is_err());
        assert_eq!(handle.state(), ConnectionState::Connected("peer-b".into()));

        while let Ok(Some(event)) = timeout(Duration::from_millis(10), manager.recv()).await {
            assert_ne!(
                event,
                LinkEvent::StateChanged(ConnectionState::Connected("peer-a".into()))
            );
        }
        assert!(handle.max_live_roles() <= 1);
    }

    #[tokio::test]
    async fn test_failed_dial_returns_to_listening() {
        let (transport, _radio, mut manager) = start(test_config());
        transport
            .set_peer(
                "far-away",
                PeerBehavior::RefuseAfter(Duration::from_millis(20), "page timeout".into()),
            )
            .await;
        let handle = manager.handle();
        assert_eq!(
            next_event(&mut manager).await,
            LinkEvent::StateChanged(ConnectionState::Listening)
        );

        handle.request_connect("far-away").await.unwrap();
        assert_eq!(
            next_event(&mut manager).await,
            LinkEvent::StateChanged(ConnectionState::Connecting("far-away".into()))
        );
        assert_eq!(
            next_event(&mut manager).await,
            LinkEvent::StateChanged(ConnectionState::Listening)
        );
        wait_listener(&transport).await;

        // No automatic redial
        sleep(Duration::from_millis(50)).await;
        assert_eq!(transport.connect_calls(), 1);
    }

    #[tokio::test]
    async fn test_unknown_peer_never_sticks_in_connecting() {
        let (transport, _radio, manager) = start(test_config());
        let handle = manager.handle();

        handle.request_connect("nobody").await.unwrap();
        sync(&handle).await;
        wait_state(&handle, ConnectionState::Listening).await;
        wait_listener(&transport).await;
        assert_eq!(transport.connect_calls(), 1);
    }

    #[tokio::test]
    async fn test_permission_failure_cannot_proceed() {
        let (transport, _radio, mut manager) = start(test_config());
        transport.set_peer("locked", PeerBehavior::Deny).await;
        let handle = manager.handle();

        handle.request_connect("locked").await.unwrap();
        loop {
            match next_event(&mut manager).await {
                LinkEvent::CannotProceed { reason } => {
                    assert!(reason.contains("Permission denied"));
                    break;
                }
                LinkEvent::StateChanged(_) => continue,
                other => panic!("unexpected event: {:?}", other),
            }
        }
        assert_eq!(handle.state(), ConnectionState::Idle);
        assert_eq!(handle.live_roles(), 0);

        // Not retried until asked again
        sleep(Duration::from_millis(50)).await;
        assert_eq!(transport.connect_calls(), 1);
        assert_eq!(transport.live_listeners(), 0);

        handle.request_listen().await.unwrap();
        wait_state(&handle, ConnectionState::Listening).await;
        wait_listener(&transport).await;
    }

    #[tokio::test]
    async fn test_powered_off_radio_cannot_proceed() {
        let transport = MemoryTransport::new();
        let radio = Arc::new(MemoryRadio::default());
        radio.set_powered(false);
        let mut manager =
            ConnectionManager::new(Arc::new(transport.clone()), radio.clone(), test_config());

        let mut saw_cannot_proceed = false;
        while !saw_cannot_proceed {
            if let LinkEvent::CannotProceed { .. } = next_event(&mut manager).await {
                saw_cannot_proceed = true;
            }
        }
        assert_eq!(manager.state(), ConnectionState::Idle);
        assert_eq!(transport.listen_calls(), 0);

        radio.set_powered(true);
        manager.handle().request_listen().await.unwrap();
        wait_listener(&transport).await;
    }

    #[tokio::test]
    async fn test_write_errors() {
        let config = ConnectionConfig {
            max_write_size: 8,
            ..test_config()
        };
        let (transport, _radio, manager) = start(config);
        let handle = manager.handle();

        assert_eq!(
            handle.request_write("hello").await,
            Err(LinkError::NotConnected)
        );
        assert_eq!(
            handle.request_write("").await,
            Err(LinkError::Codec(CodecError::Empty))
        );

        wait_listener(&transport).await;
        let _remote = transport.dial_in("peer-a").await.unwrap();
        wait_state(&handle, ConnectionState::Connected("peer-a".into())).await;

        assert_eq!(
            handle.request_write("much too long").await,
            Err(LinkError::Codec(CodecError::MessageTooLarge { size: 13, max: 8 }))
        );
        assert_eq!(handle.request_write("fits").await, Ok(()));
    }

    #[tokio::test]
    async fn test_shutdown_closes_session_and_goes_idle() {
        let (transport, _radio, manager) = start(test_config());
        let handle = manager.handle();
        wait_listener(&transport).await;

        let mut remote = transport.dial_in("peer-a").await.unwrap();
        wait_state(&handle, ConnectionState::Connected("peer-a".into())).await;

        handle.shutdown().await.unwrap();
        assert_eq!(handle.state(), ConnectionState::Idle);
        assert_eq!(handle.live_roles(), 0);

        let mut buf = [0u8; 1];
        assert_eq!(remote.read(&mut buf).await.unwrap(), 0);

        // Shutting down twice is harmless, and the link can be restarted
        handle.shutdown().await.unwrap();
        handle.request_listen().await.unwrap();
        wait_state(&handle, ConnectionState::Listening).await;
    }

    #[tokio::test]
    async fn test_shutdown_with_peer_that_stopped_reading() {
        let (transport, _radio, manager) = start(test_config());
        let handle = manager.handle();
        wait_listener(&transport).await;

        // The remote end is never read, so the pipe fills up
        let _remote = transport.dial_in("peer-a").await.unwrap();
        wait_state(&handle, ConnectionState::Connected("peer-a".into())).await;

        let chunk = "x".repeat(60 * 1024);
        for _ in 0..3 {
            handle.request_write(chunk.clone()).await.unwrap();
        }

        timeout(WAIT, handle.shutdown())
            .await
            .expect("shutdown stalled behind a blocked write")
            .unwrap();
        assert_eq!(handle.state(), ConnectionState::Idle);
        assert_eq!(handle.live_roles(), 0);
    }

    #[tokio::test]
    async fn test_listen_request_closes_active_session() {
        let (transport, _radio, mut manager) = start(test_config());
        transport.set_peer("peer-a", PeerBehavior::Accept).await;
        let handle = manager.handle();

        handle.request_connect("peer-a").await.unwrap();
        let (_, mut remote) = timeout(WAIT, transport.next_remote()).await.unwrap().unwrap();
        let connected = LinkEvent::StateChanged(ConnectionState::Connected("peer-a".into()));
        while next_event(&mut manager).await != connected {}

        handle.request_listen().await.unwrap();
        wait_state(&handle, ConnectionState::Listening).await;

        let mut buf = [0u8; 1];
        let read = timeout(WAIT, remote.read(&mut buf)).await.unwrap().unwrap();
        assert_eq!(read, 0);
        let _ = remote.write_all(b"too late").await;

        wait_listener(&transport).await;
        let _second = transport.dial_in("peer-b").await.unwrap();
        wait_state(&handle, ConnectionState::Connected("peer-b".into())).await;

        let mut events = Vec::new();
        while let Ok(Some(event)) = timeout(Duration::from_millis(50), manager.recv()).await {
            events.push(event);
        }
        assert_eq!(
            events,
            [
                LinkEvent::StateChanged(ConnectionState::Listening),
                LinkEvent::StateChanged(ConnectionState::Connected("peer-b".into())),
            ]
        );
        assert!(handle.max_live_roles() <= 1);
    }

    #[tokio::test]
    async fn test_listen_request_abandons_pending_dial() {
        let (transport, _radio, mut manager) = start(test_config());
        transport.set_peer("hang", PeerBehavior::Hang).await;
        let handle = manager.handle();

        handle.request_connect("hang").await.unwrap();
        wait_state(&handle, ConnectionState::Connecting("hang".into())).await;

        handle.request_listen().await.unwrap();
        wait_state(&handle, ConnectionState::Listening).await;
        wait_listener(&transport).await;
        assert_eq!(handle.live_roles(), 1);
        assert!(transport.connect_calls() <= 1);

        let _remote = transport.dial_in("peer-b").await.unwrap();
        wait_state(&handle, ConnectionState::Connected("peer-b".into())).await;

        while let Ok(Some(event)) = timeout(Duration::from_millis(50), manager.recv()).await {
            assert_ne!(
                event,
                LinkEvent::StateChanged(ConnectionState::Connected("hang".into()))
            );
        }
    }

    #[tokio::test]
    async fn test_slow_observer_sheds_messages_not_transitions() {
        let config = ConnectionConfig {
            event_capacity: 3,
            ..test_config()
        };
        let (transport, _radio, mut manager) = start(config);
        let handle = manager.handle();
        wait_listener(&transport).await;

        let mut remote = transport.dial_in("peer-a").await.unwrap();
        wait_state(&handle, ConnectionState::Connected("peer-a".into())).await;

        // Nobody reads events while the peer keeps talking
        for word in ["one", "two", "three", "four", "five"] {
            remote.write_all(word.as_bytes()).await.unwrap();
            sleep(Duration::from_millis(5)).await;
        }
        sleep(Duration::from_millis(50)).await;

        handle.request_listen().await.unwrap();
        wait_state(&handle, ConnectionState::Listening).await;

        assert_eq!(
            next_event(&mut manager).await,
            LinkEvent::StateChanged(ConnectionState::Listening)
        );
        assert_eq!(
            next_event(&mut manager).await,
            LinkEvent::StateChanged(ConnectionState::Connected("peer-a".into()))
        );
        match next_event(&mut manager).await {
            LinkEvent::MessageReceived { text, .. } => assert!(text.starts_with("one")),
            other => panic!("unexpected event: {:?}", other),
        }
        assert_eq!(
            next_event(&mut manager).await,
            LinkEvent::StateChanged(ConnectionState::Listening)
        );
    }

    #[tokio::test]
    async fn test_handle_clone_keeps_manager_alive() {
        let (_transport, _radio, manager) = start(test_config());
        let (handle, events) = manager.into_parts();
        let clone = handle.clone();
        drop(handle);
        drop(events);

        // The clone keeps the manager alive
        assert_eq!(clone.request_write("x").await, Err(LinkError::NotConnected));
    }

    #[tokio::test]
    async fn test_at_most_one_role_under_request_storm() {
        let (transport, _radio, mut manager) = start(test_config());
        transport
            .set_peer("slow", PeerBehavior::AcceptAfter(Duration::from_millis(5)))
            .await;
        transport.set_peer("fast", PeerBehavior::Accept).await;
        transport.set_peer("hang", PeerBehavior::Hang).await;
        transport
            .set_peer("down", PeerBehavior::Refuse("off".into()))
            .await;
        let handle = manager.handle();

        let drain = tokio::spawn(async move { while manager.recv().await.is_some() {} });

        let peers = ["slow", "fast", "hang", "down"];
        for round in 0..40 {
            if round % 3 == 0 {
                handle.request_listen().await.unwrap();
            } else {
                handle.request_connect(peers[round % peers.len()]).await.unwrap();
            }
            if round % 5 == 0 {
                sleep(Duration::from_millis(2)).await;
            }
        }

        handle.shutdown().await.unwrap();
        assert!(handle.max_live_roles() <= 1);
        assert!(transport.max_live_listeners() <= 1);
        assert_eq!(handle.live_roles(), 0);
        drop(handle);
        drain.abort();
    }

    fn free_port() -> u16 {
        std::net::TcpListener::bind("127.0.0.1:0")
            .unwrap()
            .local_addr()
            .unwrap()
            .port()
    }

    #[tokio::test]
    async fn test_tcp_managers_talk_to_each_other() {
        let address = format!("127.0.0.1:{}", free_port());

        let mut server = ConnectionManager::new(
            Arc::new(TcpTransport::new(address.clone())),
            Arc::new(crate::transport::NullRadio),
            test_config(),
        );
        let server_handle = server.handle();
        wait_state(&server_handle, ConnectionState::Listening).await;

        let mut client = ConnectionManager::new(
            Arc::new(TcpTransport::new("127.0.0.1:0")),
            Arc::new(crate::transport::NullRadio),
            ConnectionConfig {
                listen_on_start: false,
                ..test_config()
            },
        );
        let client_handle = client.handle();

        // The listening socket opens asynchronously; redial until it answers
        timeout(WAIT, async {
            loop {
                client_handle.request_connect(address.as_str()).await.unwrap();
                loop {
                    match client.recv().await {
                        Some(LinkEvent::StateChanged(ConnectionState::Connected(_))) => return,
                        Some(LinkEvent::StateChanged(ConnectionState::Listening)) => break,
                        Some(_) => continue,
                        None => panic!("client manager stopped"),
                    }
                }
                sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("client never connected");

        timeout(WAIT, server_handle.wait_for(|s| s.is_connected()))
            .await
            .unwrap()
            .unwrap();
        client_handle.request_write("Hello there!").await.unwrap();

        let text = timeout(WAIT, async {
            loop {
                if let Some(LinkEvent::MessageReceived { text, .. }) = server.recv().await {
                    return text;
                }
            }
        })
        .await
        .unwrap();
        assert_eq!(text, "Hello there!");

        client_handle.shutdown().await.unwrap();
        wait_state(&server_handle, ConnectionState::Listening).await;
    }

    #[tokio::test]
    async fn test_failing_listener_is_reopened() {
        let blocker = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let address = blocker.local_addr().unwrap().to_string();

        let manager = ConnectionManager::new(
            Arc::new(TcpTransport::new(address.clone())),
            Arc::new(crate::transport::NullRadio),
            test_config(),
        );
        let handle = manager.handle();
        let (_h, mut events) = manager.into_parts();
        let drain = tokio::spawn(async move { while events.recv().await.is_some() {} });

        // Bind fails while the port is taken; the manager keeps listening
        sleep(Duration::from_millis(100)).await;
        assert_eq!(handle.state(), ConnectionState::Listening);
        drop(blocker);

        let stream = timeout(WAIT, async {
            loop {
                if let Ok(stream) = tokio::net::TcpStream::connect(&address).await {
                    return stream;
                }
                sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("listener never reopened");

        timeout(WAIT, handle.wait_for(|s| s.is_connected()))
            .await
            .unwrap()
            .unwrap();
        drop(stream);
        drain.abort();
    }
}

//! Link State Machine
//!
//! Defines the legal connection state transitions and the role action the
//! manager has to perform for each of them.

use crate::{ConnectionState, PeerAddress};

/// Inputs that can trigger state transitions
#[derive(Debug, Clone, PartialEq)]
pub enum LinkInput {
    /// Caller asked to wait for an inbound connection
    ListenRequested,
    /// Caller asked to dial a peer
    ConnectRequested(PeerAddress),
    /// Listener accepted an inbound connection
    Accepted(PeerAddress),
    /// Dialer established the outbound connection
    Connected(PeerAddress),
    /// Dialer gave up on the peer
    DialFailed(PeerAddress),
    /// Listening socket could not be opened or accept failed
    ListenFailed,
    /// Session socket closed
    SessionEnded,
    /// Caller asked to send text on the session
    WriteRequested,
    /// Platform refused a capability (adapter off, permission denied)
    CannotProceed,
    /// Caller asked to stop everything
    Shutdown,
}

/// Role work the manager performs after a transition
#[derive(Debug, Clone, PartialEq)]
pub enum RoleAction {
    /// Retire the current role and open a fresh listener
    StartListener,
    /// Reopen the listener after it failed, after a pause
    RestartListener,
    /// Retire the current role and dial the peer
    StartDialer(PeerAddress),
    /// Retire the connecting role and drive the new socket
    StartSession(PeerAddress),
    /// Hand the payload to the live session
    ForwardWrite,
    /// Retire the current role without starting another
    StopAll,
}

/// Result of a transition attempt
#[derive(Debug, Clone, PartialEq)]
pub enum TransitionResult {
    /// Transition was valid; the manager must run the action
    Success {
        state: ConnectionState,
        action: RoleAction,
    },
    /// Valid input with nothing to do
    Unchanged(ConnectionState),
    /// Input makes no sense in the current state (usually a stale event)
    Invalid {
        from: ConnectionState,
        input: LinkInput,
    },
}

/// The connection state machine
#[derive(Debug, Default)]
pub struct LinkStateMachine {
    current_state: ConnectionState,
}

impl LinkStateMachine {
    /// Create a new state machine in Idle state
    pub fn new() -> Self {
        Self::default()
    }

    /// Get current state
    pub fn state(&self) -> &ConnectionState {
        &self.current_state
    }

    /// Process an input and return the transition result
    pub fn process(&mut self, input: LinkInput) -> TransitionResult {
        match self.next(&input) {
            Next::Go(state, action) => {
                self.current_state = state.clone();
                TransitionResult::Success { state, action }
            }
            Next::Stay => TransitionResult::Unchanged(self.current_state.clone()),
            Next::Reject => TransitionResult::Invalid {
                from: self.current_state.clone(),
                input,
            },
        }
    }

    fn next(&self, input: &LinkInput) -> Next {
        use ConnectionState as S;
        use LinkInput as I;

        match (&self.current_state, input) {
            // Requests are accepted from any state
            (S::Listening, I::ListenRequested) => Next::Stay,
            (_, I::ListenRequested) => Next::Go(S::Listening, RoleAction::StartListener),
            (_, I::ConnectRequested(peer)) => Next::Go(
                S::Connecting(peer.clone()),
                RoleAction::StartDialer(peer.clone()),
            ),

            // Role outcomes
            (S::Listening, I::Accepted(peer)) => Next::Go(
                S::Connected(peer.clone()),
                RoleAction::StartSession(peer.clone()),
            ),
            (S::Listening, I::ListenFailed) => {
                Next::Go(S::Listening, RoleAction::RestartListener)
            }
            (S::Connecting(target), I::Connected(peer)) if target == peer => Next::Go(
                S::Connected(peer.clone()),
                RoleAction::StartSession(peer.clone()),
            ),
            (S::Connecting(target), I::DialFailed(peer)) if target == peer => {
                Next::Go(S::Listening, RoleAction::StartListener)
            }
            (S::Connected(_), I::SessionEnded) => {
                Next::Go(S::Listening, RoleAction::StartListener)
            }
            (S::Connected(peer), I::WriteRequested) => {
                Next::Go(S::Connected(peer.clone()), RoleAction::ForwardWrite)
            }

            // Stopping
            (S::Idle, I::Shutdown | I::CannotProceed) => Next::Stay,
            (_, I::Shutdown | I::CannotProceed) => Next::Go(S::Idle, RoleAction::StopAll),

            _ => Next::Reject,
        }
    }
}

enum Next {
    Go(ConnectionState, RoleAction),
    Stay,
    Reject,
}

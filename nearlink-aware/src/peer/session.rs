//! Per-peer session state machine.
//!
//! A [`PeerSession`] consumes [`SessionInput`]s in delivery order and returns
//! the [`SessionAction`]s the coordinator must carry out. It performs no I/O
//! itself, so every path can be exercised without sockets or a substrate.
//!
//! ```text
//! publisher:  Idle --message--> AwaitingConnection --accept--> Transferring --> Complete
//! subscriber: Idle --discovered--> AwaitingReply --reply--> AwaitingConnection
//!                 --capabilities--> Transferring --> Complete
//! ```
//!
//! Loss, network failure and I/O errors move any live session to `Failed`.
//! Once terminal, a session ignores every further input.

use std::net::SocketAddr;

use bytes::Bytes;

use crate::error::FailureReason;
use crate::peer::{HandshakeState, NetworkRequestState, PeerHandle, Role, SessionId, SessionState};
use crate::substrate::NetworkInfo;
use crate::transport::TransferSummary;

/// An event routed to one session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionInput {
    /// The substrate found the publisher (subscriber side).
    ServiceDiscovered,
    /// A substrate message from the peer.
    MessageReceived(Bytes),
    NetworkAvailable,
    CapabilitiesChanged(NetworkInfo),
    NetworkUnavailable,
    NetworkLost,
    /// The listener for this session is bound (publisher side).
    Listening { port: u16 },
    /// The listener accepted its connection (publisher side).
    Accepted { remote: SocketAddr },
    /// The worker finished the transfer or failed.
    TransferFinished(Result<TransferSummary, String>),
    /// The substrate confirmed delivery of a message of this session.
    MessageSent,
    /// A message of this session could not be delivered.
    SendFailed { message_id: u32 },
    PeerLost,
    SubstrateLost,
    Shutdown,
}

/// Work the coordinator performs on behalf of a session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionAction {
    /// Send a substrate message to the peer.
    SendMessage(Bytes),
    /// Bind a fresh listener and start the accepting worker.
    StartListener,
    /// Request a network path, tagged with the listening port if any.
    RequestNetwork { port: Option<u16> },
    /// Start the connecting worker.
    Connect(SocketAddr),
}

/// One logical relationship with a discovered peer.
#[derive(Debug, Clone)]
pub struct PeerSession {
    id: SessionId,
    peer: PeerHandle,
    role: Role,
    greeting: Bytes,
    state: SessionState,
    handshake: HandshakeState,
    network: NetworkRequestState,
    assigned_port: Option<u16>,
    transfer: Option<TransferSummary>,
    failed_in: Option<&'static str>,
}

impl PeerSession {
    /// Create a session in `Idle`. `greeting` is the text this side sends.
    pub fn new(id: SessionId, peer: PeerHandle, role: Role, greeting: Bytes) -> Self {
        Self {
            id,
            peer,
            role,
            greeting,
            state: SessionState::Idle,
            handshake: HandshakeState::AwaitingGreeting,
            network: NetworkRequestState::NotRequested,
            assigned_port: None,
            transfer: None,
            failed_in: None,
        }
    }

    pub fn id(&self) -> SessionId {
        self.id
    }

    pub fn peer(&self) -> PeerHandle {
        self.peer
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn state(&self) -> &SessionState {
        &self.state
    }

    pub fn handshake(&self) -> HandshakeState {
        self.handshake
    }

    pub fn network(&self) -> &NetworkRequestState {
        &self.network
    }

    /// Listening port, publisher side only.
    pub fn assigned_port(&self) -> Option<u16> {
        self.assigned_port
    }

    /// Transfer result once `Complete`.
    pub fn transfer(&self) -> Option<TransferSummary> {
        self.transfer
    }

    /// Name of the state the session was in when it failed.
    pub fn failed_in(&self) -> Option<&'static str> {
        self.failed_in
    }

    pub fn is_terminal(&self) -> bool {
        self.state.is_terminal()
    }

    /// Apply one input and return the resulting actions.
    pub fn handle(&mut self, input: SessionInput) -> Vec<SessionAction> {
        if self.state.is_terminal() {
            tracing::trace!(peer = %self.peer, state = %self.state, ?input, "Input after terminal state ignored");
            return Vec::new();
        }

        match input {
            SessionInput::PeerLost => self.fail(FailureReason::PeerLost),
            SessionInput::SubstrateLost => self.fail(FailureReason::SubstrateLost),
            SessionInput::Shutdown => self.fail(FailureReason::Shutdown),
            SessionInput::SendFailed { message_id } => {
                self.fail(FailureReason::MessageSendFailed { message_id })
            }
            SessionInput::MessageSent => {
                if self.handshake == HandshakeState::GreetingReceived {
                    self.handshake = HandshakeState::Complete;
                }
                Vec::new()
            }
            SessionInput::NetworkUnavailable => {
                self.network = NetworkRequestState::Failed;
                self.fail(FailureReason::NetworkUnavailable)
            }
            SessionInput::NetworkLost => {
                self.network = NetworkRequestState::Lost;
                self.fail(FailureReason::NetworkLost)
            }
            SessionInput::TransferFinished(Err(message)) => self.fail(FailureReason::Io(message)),
            SessionInput::NetworkAvailable => {
                if self.network == NetworkRequestState::Requested {
                    self.network = NetworkRequestState::CapabilitiesPending;
                }
                Vec::new()
            }
            input => match self.role {
                Role::Publisher => self.publisher_step(input),
                Role::Subscriber => self.subscriber_step(input),
            },
        }
    }

    fn publisher_step(&mut self, input: SessionInput) -> Vec<SessionAction> {
        match (self.state.clone(), input) {
            (SessionState::Idle, SessionInput::MessageReceived(_)) => {
                self.handshake = HandshakeState::GreetingReceived;
                self.transition_to(SessionState::AwaitingConnection);
                vec![
                    SessionAction::SendMessage(self.greeting.clone()),
                    SessionAction::StartListener,
                ]
            }
            (SessionState::AwaitingConnection, SessionInput::Listening { port })
                if self.assigned_port.is_none() =>
            {
                self.assigned_port = Some(port);
                self.network = NetworkRequestState::Requested;
                vec![SessionAction::RequestNetwork { port: Some(port) }]
            }
            (
                SessionState::AwaitingConnection | SessionState::Transferring,
                SessionInput::CapabilitiesChanged(info),
            ) => {
                if !self.network.is_connected() {
                    self.network = NetworkRequestState::Connected(info);
                }
                Vec::new()
            }
            (SessionState::AwaitingConnection, SessionInput::Accepted { remote }) => {
                tracing::debug!(peer = %self.peer, remote = %remote, "Peer connected to listener");
                self.transition_to(SessionState::Transferring);
                Vec::new()
            }
            (SessionState::Transferring, SessionInput::TransferFinished(Ok(summary))) => {
                self.transfer = Some(summary);
                self.transition_to(SessionState::Complete);
                Vec::new()
            }
            (state, input) => {
                tracing::warn!(peer = %self.peer, state = %state, ?input, "Ignoring out-of-order publisher input");
                Vec::new()
            }
        }
    }

    fn subscriber_step(&mut self, input: SessionInput) -> Vec<SessionAction> {
        match (self.state.clone(), input) {
            (SessionState::Idle, SessionInput::ServiceDiscovered) => {
                self.handshake = HandshakeState::GreetingSent;
                self.transition_to(SessionState::AwaitingReply);
                vec![SessionAction::SendMessage(self.greeting.clone())]
            }
            (SessionState::AwaitingReply, SessionInput::MessageReceived(_)) => {
                self.handshake = HandshakeState::Complete;
                self.network = NetworkRequestState::Requested;
                self.transition_to(SessionState::AwaitingConnection);
                vec![SessionAction::RequestNetwork { port: None }]
            }
            (SessionState::AwaitingConnection, SessionInput::CapabilitiesChanged(info)) => {
                match info.socket_addr() {
                    Some(addr) => {
                        self.network = NetworkRequestState::Connected(info);
                        self.transition_to(SessionState::Transferring);
                        vec![SessionAction::Connect(addr)]
                    }
                    None => {
                        tracing::debug!(peer = %self.peer, info = %info, "Capabilities without a port, waiting");
                        Vec::new()
                    }
                }
            }
            (SessionState::Transferring, SessionInput::CapabilitiesChanged(_)) => {
                tracing::debug!(peer = %self.peer, "Already connected, capabilities update ignored");
                Vec::new()
            }
            (SessionState::Transferring, SessionInput::TransferFinished(Ok(summary))) => {
                self.transfer = Some(summary);
                self.transition_to(SessionState::Complete);
                Vec::new()
            }
            (state, input) => {
                tracing::warn!(peer = %self.peer, state = %state, ?input, "Ignoring out-of-order subscriber input");
                Vec::new()
            }
        }
    }

    fn fail(&mut self, reason: FailureReason) -> Vec<SessionAction> {
        self.failed_in = Some(self.state.name());
        self.transition_to(SessionState::Failed(reason));
        Vec::new()
    }

    fn transition_to(&mut self, new_state: SessionState) {
        tracing::debug!(
            peer = %self.peer,
            session = %self.id,
            from = %self.state,
            to = %new_state,
            "Session state transition"
        );
        self.state = new_state;
    }
}

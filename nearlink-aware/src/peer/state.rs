//! Session, handshake and network-request states.

use std::fmt;

use crate::error::FailureReason;
use crate::substrate::NetworkInfo;

/// Lifecycle state of one peer session.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum SessionState {
    /// Created, nothing exchanged yet.
    #[default]
    Idle,
    /// Subscriber sent its greeting and waits for the reply.
    AwaitingReply,
    /// Network path requested, waiting for a socket connection.
    AwaitingConnection,
    /// Socket connected, bulk transfer running.
    Transferring,
    /// Transfer finished.
    Complete,
    /// Session ended with an error.
    Failed(FailureReason),
}

impl SessionState {
    /// Check if the session has reached a terminal state.
    pub fn is_terminal(&self) -> bool {
        matches!(self, SessionState::Complete | SessionState::Failed(_))
    }

    /// Short name used in logs and snapshots.
    pub fn name(&self) -> &'static str {
        match self {
            SessionState::Idle => "idle",
            SessionState::AwaitingReply => "awaiting_reply",
            SessionState::AwaitingConnection => "awaiting_connection",
            SessionState::Transferring => "transferring",
            SessionState::Complete => "complete",
            SessionState::Failed(_) => "failed",
        }
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SessionState::Failed(reason) => write!(f, "failed({})", reason),
            other => write!(f, "{}", other.name()),
        }
    }
}

/// Progress of the greeting exchange.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum HandshakeState {
    /// No greeting seen in either direction.
    #[default]
    AwaitingGreeting,
    /// We sent our greeting first.
    GreetingSent,
    /// The peer's greeting arrived first.
    GreetingReceived,
    /// Both greetings exchanged.
    Complete,
}

impl fmt::Display for HandshakeState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HandshakeState::AwaitingGreeting => write!(f, "awaiting_greeting"),
            HandshakeState::GreetingSent => write!(f, "greeting_sent"),
            HandshakeState::GreetingReceived => write!(f, "greeting_received"),
            HandshakeState::Complete => write!(f, "complete"),
        }
    }
}

/// Progress of network-path negotiation.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum NetworkRequestState {
    #[default]
    NotRequested,
    /// Request handed to the substrate.
    Requested,
    /// Network reported available, capabilities not yet known.
    CapabilitiesPending,
    /// Capabilities received. Entered at most once per session.
    Connected(NetworkInfo),
    Lost,
    Failed,
}

impl NetworkRequestState {
    /// Check if a network request is outstanding or established.
    pub fn is_requested(&self) -> bool {
        !matches!(self, NetworkRequestState::NotRequested)
    }

    /// Check if capabilities were already applied.
    pub fn is_connected(&self) -> bool {
        matches!(self, NetworkRequestState::Connected(_))
    }
}

impl fmt::Display for NetworkRequestState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NetworkRequestState::NotRequested => write!(f, "not_requested"),
            NetworkRequestState::Requested => write!(f, "requested"),
            NetworkRequestState::CapabilitiesPending => write!(f, "capabilities_pending"),
            NetworkRequestState::Connected(info) => write!(f, "connected({})", info),
            NetworkRequestState::Lost => write!(f, "lost"),
            NetworkRequestState::Failed => write!(f, "failed"),
        }
    }
}

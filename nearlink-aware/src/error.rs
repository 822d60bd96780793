//! Aware error types.

use std::fmt;
use std::io;

use thiserror::Error;

use crate::peer::PeerHandle;

/// Errors surfaced by the coordinator, the substrate and the transport.
#[derive(Debug, Error)]
pub enum AwareError {
    /// The host does not provide the discovery capability.
    #[error("Discovery capability not supported on this host")]
    Unsupported,

    /// Attaching to the discovery substrate failed.
    #[error("Attach failed: {0}")]
    AttachFailed(String),

    /// A capability check failed; the caller must re-grant and retry.
    #[error("Permission denied: {0}")]
    PermissionDenied(String),

    /// Starting a publish session failed.
    #[error("Publish failed: {0}")]
    PublishFailed(String),

    /// Starting a subscribe session failed.
    #[error("Subscribe failed: {0}")]
    SubscribeFailed(String),

    /// The operation requires an attached substrate.
    #[error("Not attached to the discovery substrate")]
    NotAttached,

    /// The operation requires an active publish or subscribe session.
    #[error("No active advertisement")]
    AdvertisementInactive,

    /// A role was already chosen for this run.
    #[error("Role already set to {current}, cannot switch to {requested}")]
    RoleConflict { current: String, requested: String },

    /// The substrate revoked the attachment.
    #[error("Discovery substrate revoked")]
    SubstrateRevoked,

    /// The remote peer disappeared.
    #[error("Peer lost: {peer}")]
    PeerLost { peer: PeerHandle },

    /// Network-path negotiation did not produce a connectable network.
    #[error("Network unavailable for {peer}")]
    NetworkUnavailable { peer: PeerHandle },

    /// A negotiated network path went away.
    #[error("Network lost for {peer}")]
    NetworkLost { peer: PeerHandle },

    /// Message delivery over the substrate failed.
    #[error("Message {message_id} to {peer} could not be sent")]
    MessageSendFailed { peer: PeerHandle, message_id: u32 },

    /// No session is tracked for the peer.
    #[error("Session not found: {0}")]
    SessionNotFound(PeerHandle),

    /// I/O error during network operations.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// The transport channel was used after it was closed.
    #[error("Transport channel closed")]
    ChannelClosed,

    /// Coordinator is shutting down.
    #[error("Coordinator shutting down")]
    Shutdown,
}

/// Result type for aware operations.
pub type AwareResult<T> = Result<T, AwareError>;

/// Why a single peer session ended in `Failed`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FailureReason {
    /// The substrate reported the peer lost.
    PeerLost,
    /// Network negotiation finished without a connectable network.
    NetworkUnavailable,
    /// The negotiated network went away.
    NetworkLost,
    /// Socket I/O failed; carries the underlying message.
    Io(String),
    /// The substrate itself was revoked.
    SubstrateLost,
    /// A handshake message could not be delivered.
    MessageSendFailed { message_id: u32 },
    /// The coordinator was torn down.
    Shutdown,
}

impl FailureReason {
    /// Convert into an error naming the affected peer.
    pub fn into_error(self, peer: PeerHandle) -> AwareError {
        match self {
            FailureReason::PeerLost => AwareError::PeerLost { peer },
            FailureReason::NetworkUnavailable => AwareError::NetworkUnavailable { peer },
            FailureReason::NetworkLost => AwareError::NetworkLost { peer },
            FailureReason::Io(msg) => AwareError::Io(io::Error::new(io::ErrorKind::Other, msg)),
            FailureReason::SubstrateLost => AwareError::SubstrateRevoked,
            FailureReason::MessageSendFailed { message_id } => {
                AwareError::MessageSendFailed { peer, message_id }
            }
            FailureReason::Shutdown => AwareError::Shutdown,
        }
    }
}

impl fmt::Display for FailureReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FailureReason::PeerLost => write!(f, "peer lost"),
            FailureReason::NetworkUnavailable => write!(f, "network unavailable"),
            FailureReason::NetworkLost => write!(f, "network lost"),
            FailureReason::Io(msg) => write!(f, "I/O failure: {}", msg),
            FailureReason::SubstrateLost => write!(f, "substrate lost"),
            FailureReason::MessageSendFailed { message_id } => {
                write!(f, "message {} could not be sent", message_id)
            }
            FailureReason::Shutdown => write!(f, "shutdown"),
        }
    }
}

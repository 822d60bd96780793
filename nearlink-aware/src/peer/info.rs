//! Peer and session identification.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Opaque substrate-assigned identifier of a remote peer.
///
/// Only meaningful within the discovery session that produced it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PeerHandle(pub u32);

impl PeerHandle {
    /// Create a peer handle from a raw substrate value.
    pub fn new(id: u32) -> Self {
        Self(id)
    }
}

impl fmt::Display for PeerHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "peer-{}", self.0)
    }
}

/// Generation counter distinguishing successive sessions with the same peer.
///
/// Worker reports carry the id of the session that spawned them so a report
/// that outlives its session is never applied to a newer one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SessionId(pub u64);

impl SessionId {
    /// Create a session id from a counter value.
    pub fn new(id: u64) -> Self {
        Self(id)
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "session-{}", self.0)
    }
}

/// Which side of the exchange this device plays.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// Advertises the service and serves the payload.
    Publisher,
    /// Looks for the service and downloads the payload.
    Subscriber,
}

impl Role {
    /// Check if this is the publishing side.
    pub fn is_publisher(&self) -> bool {
        matches!(self, Role::Publisher)
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Role::Publisher => write!(f, "publisher"),
            Role::Subscriber => write!(f, "subscriber"),
        }
    }
}

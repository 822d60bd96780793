//! Peer session management.
//!
//! This module provides:
//! - Peer and session identification
//! - The per-peer session state machine
//! - The session table owned by the coordinator

pub mod info;
pub mod session;
pub mod state;
pub mod table;

// Re-export main types
pub use info::{PeerHandle, Role, SessionId};
pub use session::{PeerSession, SessionAction, SessionInput};
pub use state::{HandshakeState, NetworkRequestState, SessionState};
pub use table::{SessionEntry, SessionSnapshot, SessionTable};

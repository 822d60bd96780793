//! Peer session table.

use std::collections::HashMap;

use bytes::Bytes;
use serde::Serialize;

use crate::peer::{PeerHandle, PeerSession, Role, SessionId, SessionState};
use crate::substrate::NetworkRequestId;
use crate::transport::SessionWorker;

/// A live session plus the resources the coordinator holds for it.
#[derive(Debug)]
pub struct SessionEntry {
    pub session: PeerSession,
    /// Socket worker, once one was started.
    pub worker: Option<SessionWorker>,
    /// Outstanding network request, released when the session ends.
    pub network_request: Option<NetworkRequestId>,
}

/// Point-in-time view of one session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SessionSnapshot {
    pub peer: PeerHandle,
    pub session: SessionId,
    pub role: Role,
    pub state: String,
    pub handshake: String,
    pub network: String,
    pub port: Option<u16>,
}

impl From<&PeerSession> for SessionSnapshot {
    fn from(session: &PeerSession) -> Self {
        Self {
            peer: session.peer(),
            session: session.id(),
            role: session.role(),
            state: session.state().to_string(),
            handshake: session.handshake().to_string(),
            network: session.network().to_string(),
            port: session.assigned_port(),
        }
    }
}

/// Maps each peer handle to its one live session.
///
/// Owned by the coordinator loop; nothing else reads or writes it.
#[derive(Debug, Default)]
pub struct SessionTable {
    sessions: HashMap<PeerHandle, SessionEntry>,
    next_session_id: u64,
    completed: u64,
    failed: u64,
}

impl SessionTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Check if a live session exists for a peer.
    pub fn contains(&self, peer: &PeerHandle) -> bool {
        self.sessions.contains_key(peer)
    }

    pub fn get(&self, peer: &PeerHandle) -> Option<&SessionEntry> {
        self.sessions.get(peer)
    }

    pub fn get_mut(&mut self, peer: &PeerHandle) -> Option<&mut SessionEntry> {
        self.sessions.get_mut(peer)
    }

    /// Return the peer's session, creating a fresh `Idle` one if none exists.
    pub fn open(&mut self, peer: PeerHandle, role: Role, greeting: Bytes) -> &mut SessionEntry {
        let next_id = &mut self.next_session_id;
        self.sessions.entry(peer).or_insert_with(|| {
            *next_id += 1;
            let id = SessionId::new(*next_id);
            tracing::debug!(peer = %peer, session = %id, role = %role, "Session created");
            SessionEntry {
                session: PeerSession::new(id, peer, role, greeting),
                worker: None,
                network_request: None,
            }
        })
    }

    /// Remove a session, counting how it ended.
    pub fn remove(&mut self, peer: &PeerHandle) -> Option<SessionEntry> {
        let entry = self.sessions.remove(peer)?;
        match entry.session.state() {
            SessionState::Complete => self.completed += 1,
            SessionState::Failed(_) => self.failed += 1,
            _ => {}
        }
        Some(entry)
    }

    /// Peer handles with a live session, in ascending order.
    pub fn peers(&self) -> Vec<PeerHandle> {
        let mut peers: Vec<_> = self.sessions.keys().copied().collect();
        peers.sort();
        peers
    }

    /// Find the session that owns a network request.
    pub fn peer_for_request(&self, request: NetworkRequestId) -> Option<PeerHandle> {
        self.sessions
            .iter()
            .find(|(_, e)| e.network_request == Some(request))
            .map(|(peer, _)| *peer)
    }

    /// Snapshot of every live session, ordered by peer.
    pub fn snapshot(&self) -> Vec<SessionSnapshot> {
        self.peers()
            .iter()
            .filter_map(|peer| self.sessions.get(peer))
            .map(|e| SessionSnapshot::from(&e.session))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    /// Sessions that ended in `Complete`.
    pub fn completed_count(&self) -> u64 {
        self.completed
    }

    /// Sessions that ended in `Failed`.
    pub fn failed_count(&self) -> u64 {
        self.failed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::peer::SessionInput;

    fn greeting() -> Bytes {
        Bytes::from_static(b"hi")
    }

    #[test]
    fn test_open_is_idempotent() {
        let mut table = SessionTable::new();
        let peer = PeerHandle::new(1);

        let first = table.open(peer, Role::Publisher, greeting()).session.id();
        let second = table.open(peer, Role::Publisher, greeting()).session.id();
        assert_eq!(first, second);
        assert_eq!(table.len(), 1);
        assert!(table.contains(&peer));
    }

    #[test]
    fn test_fresh_session_after_removal() {
        let mut table = SessionTable::new();
        let peer = PeerHandle::new(1);

        let entry = table.open(peer, Role::Publisher, greeting());
        let first = entry.session.id();
        entry.session.handle(SessionInput::PeerLost);
        table.remove(&peer);
        assert!(table.is_empty());
        assert_eq!(table.failed_count(), 1);

        let entry = table.open(peer, Role::Publisher, greeting());
        assert_ne!(entry.session.id(), first);
        assert_eq!(*entry.session.state(), SessionState::Idle);
    }

    #[test]
    fn test_request_lookup_and_snapshot() {
        let mut table = SessionTable::new();
        table.open(PeerHandle::new(2), Role::Subscriber, greeting());
        table.open(PeerHandle::new(1), Role::Subscriber, greeting()).network_request =
            Some(NetworkRequestId(9));

        assert_eq!(table.peer_for_request(NetworkRequestId(9)), Some(PeerHandle::new(1)));
        assert_eq!(table.peer_for_request(NetworkRequestId(8)), None);

        let snapshot = table.snapshot();
        assert_eq!(snapshot.len(), 2);
        assert_eq!(snapshot[0].peer, PeerHandle::new(1));
        assert_eq!(snapshot[0].state, "idle");
        assert_eq!(snapshot[1].role, Role::Subscriber);
    }
}

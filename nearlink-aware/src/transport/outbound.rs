//! Outbound connection for the subscribing side.

use std::net::SocketAddr;

use tokio::net::TcpStream;

use crate::error::AwareResult;
use crate::peer::PeerHandle;
use crate::transport::TransportChannel;

/// Connect to a peer's advertised address.
///
/// No timeout is layered on top of the socket's own; cancellation is the
/// caller's job.
pub async fn connect_to_peer(peer: PeerHandle, addr: SocketAddr) -> AwareResult<TransportChannel> {
    tracing::debug!(peer = %peer, addr = %addr, "Connecting to peer");
    let stream = TcpStream::connect(addr).await?;
    tracing::debug!(peer = %peer, addr = %addr, "TCP connection established");
    TransportChannel::new(peer, stream)
}

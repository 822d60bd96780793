//! Single-connection listener for the publishing side.

use std::net::{IpAddr, SocketAddr};

use tokio::net::TcpListener;

use crate::error::AwareResult;
use crate::peer::PeerHandle;
use crate::transport::TransportChannel;

/// An ephemeral listener bound for one peer.
///
/// The port is known as soon as the listener exists, before any connection
/// arrives. Only the first connection is accepted.
#[derive(Debug)]
pub struct InboundListener {
    peer: PeerHandle,
    listener: TcpListener,
    local_addr: SocketAddr,
}

impl InboundListener {
    /// Bind a fresh ephemeral port on `ip`.
    ///
    /// Binding completes synchronously so the port can be handed to the
    /// network request in the same step. Must be called inside a runtime.
    pub fn bind(peer: PeerHandle, ip: IpAddr) -> AwareResult<Self> {
        let std_listener = std::net::TcpListener::bind(SocketAddr::new(ip, 0))?;
        std_listener.set_nonblocking(true)?;
        let listener = TcpListener::from_std(std_listener)?;
        let local_addr = listener.local_addr()?;
        tracing::debug!(peer = %peer, addr = %local_addr, "Listening for peer connection");
        Ok(Self {
            peer,
            listener,
            local_addr,
        })
    }

    /// Port the listener is bound to.
    pub fn port(&self) -> u16 {
        self.local_addr.port()
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Accept the first connection and close the listener.
    pub async fn accept_one(self) -> AwareResult<TransportChannel> {
        let (stream, addr) = self.listener.accept().await?;
        tracing::debug!(peer = %self.peer, addr = %addr, "Accepted peer connection");
        // Dropping the listener here refuses any later connection attempts.
        drop(self.listener);
        TransportChannel::new(self.peer, stream)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;
    use tokio::net::TcpStream;

    #[tokio::test]
    async fn test_port_known_before_accept() {
        let listener = InboundListener::bind(PeerHandle::new(1), IpAddr::V4(Ipv4Addr::LOCALHOST)).unwrap();
        let port = listener.port();
        assert_ne!(port, 0);

        let client = tokio::spawn(async move { TcpStream::connect(("127.0.0.1", port)).await });
        let channel = listener.accept_one().await.unwrap();
        assert!(!channel.is_closed());
        client.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_listener_closed_after_first_accept() {
        let listener = InboundListener::bind(PeerHandle::new(1), IpAddr::V4(Ipv4Addr::LOCALHOST)).unwrap();
        let port = listener.port();

        let _first = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
        let _channel = listener.accept_one().await.unwrap();

        assert!(TcpStream::connect(("127.0.0.1", port)).await.is_err());
    }
}

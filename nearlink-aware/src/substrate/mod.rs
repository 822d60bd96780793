//! Neighbor-awareness discovery substrate.
//!
//! The substrate is the platform capability that finds nearby devices,
//! carries short messages between them and negotiates a direct network path.
//! Every call returns immediately; results arrive later as [`SubstrateEvent`]s
//! on the channel handed to [`DiscoverySubstrate::attach`].

pub mod loopback;

pub use loopback::{LoopbackDevice, LoopbackMedium};

use std::fmt;
use std::net::{IpAddr, SocketAddr};

use bytes::Bytes;
use tokio::sync::mpsc;

use crate::error::AwareResult;
use crate::peer::PeerHandle;

/// Sender half the substrate delivers its events on.
pub type SubstrateEventSender = mpsc::UnboundedSender<SubstrateEvent>;

/// Capability returned by a successful attach.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct AttachHandle(pub u64);

impl fmt::Display for AttachHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "attach-{}", self.0)
    }
}

/// Capability for an active publish or subscribe session.
///
/// Required to send messages or request a network path.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct AdvertisementHandle(pub u64);

impl fmt::Display for AdvertisementHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "adv-{}", self.0)
    }
}

/// Identifier of an outstanding network-path request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct NetworkRequestId(pub u64);

impl fmt::Display for NetworkRequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "net-{}", self.0)
    }
}

/// How a publication is announced.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PublishType {
    /// Answer active subscribers only.
    #[default]
    Solicited,
    /// Broadcast to every subscriber.
    Unsolicited,
}

/// How a subscription searches.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SubscribeType {
    /// Transmit queries for the service.
    #[default]
    Active,
    /// Listen for unsolicited announcements only.
    Passive,
}

impl PublishType {
    /// Check whether a publication of this type is visible to a subscription.
    pub fn matches(&self, subscribe: SubscribeType) -> bool {
        match self {
            PublishType::Unsolicited => true,
            PublishType::Solicited => subscribe == SubscribeType::Active,
        }
    }
}

/// Parameters of a publish request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublishConfig {
    pub service_name: String,
    pub publish_type: PublishType,
}

impl PublishConfig {
    /// Solicited publication of a service.
    pub fn solicited(service_name: impl Into<String>) -> Self {
        Self {
            service_name: service_name.into(),
            publish_type: PublishType::Solicited,
        }
    }
}

/// Parameters of a subscribe request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubscribeConfig {
    pub service_name: String,
    pub subscribe_type: SubscribeType,
}

impl SubscribeConfig {
    /// Active subscription to a service.
    pub fn active(service_name: impl Into<String>) -> Self {
        Self {
            service_name: service_name.into(),
            subscribe_type: SubscribeType::Active,
        }
    }
}

/// A network-path request for one peer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NetworkRequest {
    /// Discovery session the peer was found on.
    pub advertisement: AdvertisementHandle,
    /// Remote peer.
    pub peer: PeerHandle,
    /// Shared secret both sides must present.
    pub passphrase: String,
    /// Locally bound port, set only by the listening side.
    pub port: Option<u16>,
}

/// Connectivity details reported once a network path exists.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NetworkInfo {
    /// Address of the peer on the negotiated network.
    pub peer_ip: IpAddr,
    /// Port the peer listens on, if it is the listening side.
    pub port: Option<u16>,
}

impl NetworkInfo {
    pub fn new(peer_ip: IpAddr, port: Option<u16>) -> Self {
        Self { peer_ip, port }
    }

    /// Address to connect to, when the peer advertised a port.
    pub fn socket_addr(&self) -> Option<SocketAddr> {
        self.port.map(|port| SocketAddr::new(self.peer_ip, port))
    }
}

impl fmt::Display for NetworkInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.socket_addr() {
            Some(addr) => write!(f, "{}", addr),
            None => write!(f, "{}", self.peer_ip),
        }
    }
}

/// Notifications about one network-path request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NetworkEvent {
    /// A network matching the request exists.
    Available,
    /// Capabilities of the network changed; may repeat.
    CapabilitiesChanged(NetworkInfo),
    /// The network was blocked or unblocked.
    BlockedStatusChanged(bool),
    /// Negotiation finished without a network.
    Unavailable,
    /// An established network went away.
    Lost,
}

impl fmt::Display for NetworkEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NetworkEvent::Available => write!(f, "available"),
            NetworkEvent::CapabilitiesChanged(info) => write!(f, "capabilities changed ({})", info),
            NetworkEvent::BlockedStatusChanged(blocked) => write!(f, "blocked={}", blocked),
            NetworkEvent::Unavailable => write!(f, "unavailable"),
            NetworkEvent::Lost => write!(f, "lost"),
        }
    }
}

/// Events delivered by the substrate, in delivery order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SubstrateEvent {
    Attached(AttachHandle),
    AttachFailed { reason: String },
    /// The attachment was revoked by the platform.
    SubstrateLost,
    PublishStarted(AdvertisementHandle),
    SubscribeStarted(AdvertisementHandle),
    /// The publish or subscribe session could not be started or was terminated.
    AdvertisementFailed { reason: String },
    ServiceDiscovered { peer: PeerHandle, info: Bytes },
    MessageReceived { peer: PeerHandle, payload: Bytes },
    SendResult { message_id: u32, ok: bool },
    PeerLost { peer: PeerHandle },
    Network {
        peer: PeerHandle,
        request: NetworkRequestId,
        event: NetworkEvent,
    },
}

/// The platform discovery and network-path capability.
///
/// Implementations must not block: each method hands the request off and
/// reports completion through the event channel.
pub trait DiscoverySubstrate: Send + Sync + 'static {
    /// Whether the host provides the capability at all.
    fn is_supported(&self) -> bool;

    /// Begin attaching. Completion is `Attached` or `AttachFailed`.
    fn attach(&self, events: SubstrateEventSender) -> AwareResult<()>;

    /// Begin publishing. Completion is `PublishStarted` or `AdvertisementFailed`.
    fn publish(&self, attach: AttachHandle, config: PublishConfig) -> AwareResult<()>;

    /// Begin subscribing. Completion is `SubscribeStarted` or `AdvertisementFailed`.
    fn subscribe(&self, attach: AttachHandle, config: SubscribeConfig) -> AwareResult<()>;

    /// Send a short message. Completion is a `SendResult` for `message_id`.
    fn send_message(
        &self,
        advertisement: AdvertisementHandle,
        peer: PeerHandle,
        message_id: u32,
        payload: Bytes,
    ) -> AwareResult<()>;

    /// Request a network path. Progress arrives as `Network` events.
    fn request_network(&self, request: NetworkRequest) -> AwareResult<NetworkRequestId>;

    /// Release a network request and any network it produced.
    fn release_network(&self, request: NetworkRequestId);

    /// Stop publishing or subscribing.
    fn close_advertisement(&self, advertisement: AdvertisementHandle);

    /// Drop the attachment.
    fn detach(&self, attach: AttachHandle);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_publish_subscribe_matching() {
        assert!(PublishType::Solicited.matches(SubscribeType::Active));
        assert!(!PublishType::Solicited.matches(SubscribeType::Passive));
        assert!(PublishType::Unsolicited.matches(SubscribeType::Passive));
    }

    #[test]
    fn test_network_info_addr() {
        let ip: IpAddr = "127.0.0.1".parse().unwrap();
        assert_eq!(NetworkInfo::new(ip, None).socket_addr(), None);
        assert_eq!(
            NetworkInfo::new(ip, Some(5000)).socket_addr(),
            Some("127.0.0.1:5000".parse().unwrap())
        );
    }
}

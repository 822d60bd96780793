//! In-process discovery substrate.
//!
//! A [`LoopbackMedium`] stands in for the radio: every [`LoopbackDevice`]
//! created from it can attach, publish or subscribe, exchange messages with
//! the other devices and negotiate network paths that resolve to a local
//! address. Data still flows over real TCP sockets.

use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use bytes::Bytes;

use super::{
    AdvertisementHandle, AttachHandle, DiscoverySubstrate, NetworkEvent, NetworkInfo,
    NetworkRequest, NetworkRequestId, PublishConfig, SubscribeConfig, SubstrateEvent,
    SubstrateEventSender,
};
use crate::error::{AwareError, AwareResult};
use crate::peer::PeerHandle;

/// Shared medium connecting loopback devices.
#[derive(Clone)]
pub struct LoopbackMedium {
    inner: Arc<Mutex<MediumState>>,
}

struct MediumState {
    /// Address every negotiated network resolves to.
    address: IpAddr,
    next_device: u32,
    next_handle: u64,
    devices: HashMap<PeerHandle, DeviceState>,
    requests: HashMap<NetworkRequestId, PendingRequest>,
}

struct DeviceState {
    supported: bool,
    present: bool,
    permission_denied: bool,
    drop_messages: bool,
    attach_failure: Option<String>,
    events: Option<SubstrateEventSender>,
    attach: Option<AttachHandle>,
    publication: Option<(AdvertisementHandle, PublishConfig)>,
    subscription: Option<(AdvertisementHandle, SubscribeConfig)>,
}

struct PendingRequest {
    owner: PeerHandle,
    peer: PeerHandle,
    passphrase: String,
    port: Option<u16>,
    resolved: bool,
}

impl DeviceState {
    fn new(supported: bool) -> Self {
        Self {
            supported,
            present: true,
            permission_denied: false,
            drop_messages: false,
            attach_failure: None,
            events: None,
            attach: None,
            publication: None,
            subscription: None,
        }
    }

    fn is_attached(&self) -> bool {
        self.present && self.attach.is_some()
    }

    /// Service name behind one of this device's advertisement handles.
    fn service_of(&self, advertisement: AdvertisementHandle) -> Option<&str> {
        if let Some((handle, config)) = &self.publication {
            if *handle == advertisement {
                return Some(&config.service_name);
            }
        }
        if let Some((handle, config)) = &self.subscription {
            if *handle == advertisement {
                return Some(&config.service_name);
            }
        }
        None
    }

    fn advertises(&self, service_name: &str) -> bool {
        self.publication
            .as_ref()
            .is_some_and(|(_, c)| c.service_name == service_name)
            || self
                .subscription
                .as_ref()
                .is_some_and(|(_, c)| c.service_name == service_name)
    }

    fn clear(&mut self) {
        self.attach = None;
        self.publication = None;
        self.subscription = None;
    }
}

impl MediumState {
    fn alloc_handle(&mut self) -> u64 {
        self.next_handle += 1;
        self.next_handle
    }

    fn emit(&self, device: PeerHandle, event: SubstrateEvent) {
        if let Some(tx) = self.devices.get(&device).and_then(|d| d.events.as_ref()) {
            // A dropped receiver means the coordinator is gone.
            let _ = tx.send(event);
        }
    }

    fn emit_network(
        &self,
        owner: PeerHandle,
        peer: PeerHandle,
        request: NetworkRequestId,
        event: NetworkEvent,
    ) {
        self.emit(owner, SubstrateEvent::Network { peer, request, event });
    }

    fn device(&self, id: PeerHandle) -> AwareResult<&DeviceState> {
        self.devices.get(&id).ok_or(AwareError::NotAttached)
    }

    fn device_mut(&mut self, id: PeerHandle) -> AwareResult<&mut DeviceState> {
        self.devices.get_mut(&id).ok_or(AwareError::NotAttached)
    }

    /// Check that `attach` is the device's live attachment.
    fn check_attached(&self, id: PeerHandle, attach: AttachHandle) -> AwareResult<&DeviceState> {
        let device = self.device(id)?;
        if device.attach != Some(attach) || !device.present {
            return Err(AwareError::NotAttached);
        }
        Ok(device)
    }
}

impl Default for LoopbackMedium {
    fn default() -> Self {
        Self::new()
    }
}

impl LoopbackMedium {
    /// Create a medium whose networks resolve to `127.0.0.1`.
    pub fn new() -> Self {
        Self::with_address(IpAddr::V4(Ipv4Addr::LOCALHOST))
    }

    /// Create a medium whose networks resolve to `address`.
    pub fn with_address(address: IpAddr) -> Self {
        Self {
            inner: Arc::new(Mutex::new(MediumState {
                address,
                next_device: 0,
                next_handle: 0,
                devices: HashMap::new(),
                requests: HashMap::new(),
            })),
        }
    }

    fn state(&self) -> MutexGuard<'_, MediumState> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn add_device(&self, supported: bool) -> LoopbackDevice {
        let mut state = self.state();
        state.next_device += 1;
        let id = PeerHandle::new(state.next_device);
        state.devices.insert(id, DeviceState::new(supported));
        tracing::debug!(device = %id, supported, "Loopback device added");
        LoopbackDevice {
            id,
            medium: self.clone(),
        }
    }

    /// Add a device to the medium.
    pub fn device(&self) -> LoopbackDevice {
        self.add_device(true)
    }

    /// Add a device whose host lacks the discovery capability.
    pub fn unsupported_device(&self) -> LoopbackDevice {
        self.add_device(false)
    }

    /// Number of unresolved or established network requests.
    pub fn network_request_count(&self) -> usize {
        self.state().requests.len()
    }
}

/// One device on a [`LoopbackMedium`].
///
/// Other devices see it under [`LoopbackDevice::id`].
#[derive(Clone)]
pub struct LoopbackDevice {
    id: PeerHandle,
    medium: LoopbackMedium,
}

impl LoopbackDevice {
    /// Handle under which peers see this device.
    pub fn id(&self) -> PeerHandle {
        self.id
    }

    /// Make publish and subscribe fail with a permission error.
    pub fn deny_permissions(&self, denied: bool) {
        if let Ok(device) = self.medium.state().device_mut(self.id) {
            device.permission_denied = denied;
        }
    }

    /// Report every outgoing message as undeliverable.
    pub fn drop_messages(&self, drop: bool) {
        if let Ok(device) = self.medium.state().device_mut(self.id) {
            device.drop_messages = drop;
        }
    }

    /// Make the next attach complete with `AttachFailed`.
    pub fn fail_next_attach(&self, reason: impl Into<String>) {
        if let Ok(device) = self.medium.state().device_mut(self.id) {
            device.attach_failure = Some(reason.into());
        }
    }

    /// Take the device out of range.
    ///
    /// Every device sharing a service sees `PeerLost`, and every network
    /// involving this device is reported lost to its other end.
    pub fn disconnect(&self) {
        let mut state = self.medium.state();
        let Ok(device) = state.device_mut(self.id) else {
            return;
        };
        device.present = false;
        let services: Vec<String> = device
            .publication
            .iter()
            .map(|(_, c)| c.service_name.clone())
            .chain(device.subscription.iter().map(|(_, c)| c.service_name.clone()))
            .collect();

        let observers: Vec<PeerHandle> = state
            .devices
            .iter()
            .filter(|(id, d)| **id != self.id && d.is_attached())
            .filter(|(_, d)| services.iter().any(|s| d.advertises(s)))
            .map(|(id, _)| *id)
            .collect();
        for observer in observers {
            state.emit(observer, SubstrateEvent::PeerLost { peer: self.id });
        }

        let affected: Vec<(NetworkRequestId, PeerHandle)> = state
            .requests
            .iter()
            .filter(|(_, r)| r.peer == self.id)
            .map(|(id, r)| (*id, r.owner))
            .collect();
        for (request, owner) in affected {
            state.emit_network(owner, self.id, request, NetworkEvent::Lost);
        }
        state.requests.retain(|_, r| r.owner != self.id);
        tracing::debug!(device = %self.id, "Loopback device disconnected");
    }

    /// Revoke the device's attachment.
    pub fn revoke(&self) {
        let mut state = self.medium.state();
        state.emit(self.id, SubstrateEvent::SubstrateLost);
        if let Ok(device) = state.device_mut(self.id) {
            device.clear();
        }
        state.requests.retain(|_, r| r.owner != self.id);
        tracing::debug!(device = %self.id, "Loopback attachment revoked");
    }
}

impl DiscoverySubstrate for LoopbackDevice {
    fn is_supported(&self) -> bool {
        self.medium
            .state()
            .device(self.id)
            .map(|d| d.supported)
            .unwrap_or(false)
    }

    fn attach(&self, events: SubstrateEventSender) -> AwareResult<()> {
        let mut state = self.medium.state();
        let handle = AttachHandle(state.alloc_handle());
        let failure = {
            let device = state.device_mut(self.id)?;
            if !device.supported {
                return Err(AwareError::Unsupported);
            }
            device.events = Some(events);
            let failure = device.attach_failure.take();
            if failure.is_none() {
                device.attach = Some(handle);
            }
            failure
        };
        match failure {
            Some(reason) => state.emit(self.id, SubstrateEvent::AttachFailed { reason }),
            None => state.emit(self.id, SubstrateEvent::Attached(handle)),
        }
        Ok(())
    }

    fn publish(&self, attach: AttachHandle, config: PublishConfig) -> AwareResult<()> {
        let mut state = self.medium.state();
        if state.check_attached(self.id, attach)?.permission_denied {
            return Err(AwareError::PermissionDenied(
                "nearby devices permission not granted".to_string(),
            ));
        }
        let advertisement = AdvertisementHandle(state.alloc_handle());
        let subscribers: Vec<PeerHandle> = state
            .devices
            .iter()
            .filter(|(id, d)| **id != self.id && d.is_attached())
            .filter(|(_, d)| {
                d.subscription.as_ref().is_some_and(|(_, s)| {
                    s.service_name == config.service_name && config.publish_type.matches(s.subscribe_type)
                })
            })
            .map(|(id, _)| *id)
            .collect();
        let info = Bytes::from(config.service_name.clone());
        state.device_mut(self.id)?.publication = Some((advertisement, config));

        state.emit(self.id, SubstrateEvent::PublishStarted(advertisement));
        for subscriber in subscribers {
            state.emit(
                subscriber,
                SubstrateEvent::ServiceDiscovered {
                    peer: self.id,
                    info: info.clone(),
                },
            );
        }
        Ok(())
    }

    fn subscribe(&self, attach: AttachHandle, config: SubscribeConfig) -> AwareResult<()> {
        let mut state = self.medium.state();
        if state.check_attached(self.id, attach)?.permission_denied {
            return Err(AwareError::PermissionDenied(
                "nearby devices permission not granted".to_string(),
            ));
        }
        let advertisement = AdvertisementHandle(state.alloc_handle());
        let mut publishers: Vec<PeerHandle> = state
            .devices
            .iter()
            .filter(|(id, d)| **id != self.id && d.is_attached())
            .filter(|(_, d)| {
                d.publication.as_ref().is_some_and(|(_, p)| {
                    p.service_name == config.service_name && p.publish_type.matches(config.subscribe_type)
                })
            })
            .map(|(id, _)| *id)
            .collect();
        publishers.sort();
        let info = Bytes::from(config.service_name.clone());
        state.device_mut(self.id)?.subscription = Some((advertisement, config));

        state.emit(self.id, SubstrateEvent::SubscribeStarted(advertisement));
        for publisher in publishers {
            state.emit(
                self.id,
                SubstrateEvent::ServiceDiscovered {
                    peer: publisher,
                    info: info.clone(),
                },
            );
        }
        Ok(())
    }

    fn send_message(
        &self,
        advertisement: AdvertisementHandle,
        peer: PeerHandle,
        message_id: u32,
        payload: Bytes,
    ) -> AwareResult<()> {
        let state = self.medium.state();
        let sender = state.device(self.id)?;
        let service = sender
            .service_of(advertisement)
            .ok_or(AwareError::AdvertisementInactive)?;

        let delivered = sender.present
            && !sender.drop_messages
            && state
                .devices
                .get(&peer)
                .is_some_and(|d| d.is_attached() && d.advertises(service));

        tracing::trace!(from = %self.id, to = %peer, message_id, len = payload.len(), delivered, "Loopback message");
        if delivered {
            state.emit(peer, SubstrateEvent::MessageReceived { peer: self.id, payload });
        }
        state.emit(
            self.id,
            SubstrateEvent::SendResult {
                message_id,
                ok: delivered,
            },
        );
        Ok(())
    }

    fn request_network(&self, request: NetworkRequest) -> AwareResult<NetworkRequestId> {
        let mut state = self.medium.state();
        if state.device(self.id)?.service_of(request.advertisement).is_none() {
            return Err(AwareError::AdvertisementInactive);
        }
        let id = NetworkRequestId(state.alloc_handle());
        let peer_present = state.devices.get(&request.peer).is_some_and(|d| d.is_attached());

        let counterpart = state
            .requests
            .iter()
            .find(|(_, r)| r.owner == request.peer && r.peer == self.id && !r.resolved)
            .map(|(other_id, _)| *other_id);

        state.requests.insert(
            id,
            PendingRequest {
                owner: self.id,
                peer: request.peer,
                passphrase: request.passphrase,
                port: request.port,
                resolved: false,
            },
        );

        if !peer_present {
            state.emit_network(self.id, request.peer, id, NetworkEvent::Unavailable);
            return Ok(id);
        }

        let Some(other_id) = counterpart else {
            return Ok(id);
        };

        let address = state.address;
        let (mine, theirs) = match (state.requests.get(&id), state.requests.get(&other_id)) {
            (Some(mine), Some(theirs)) => (
                (mine.port, mine.passphrase.clone()),
                (theirs.port, theirs.passphrase.clone()),
            ),
            _ => return Ok(id),
        };
        for r in [id, other_id] {
            if let Some(pending) = state.requests.get_mut(&r) {
                pending.resolved = true;
            }
        }

        if mine.1 != theirs.1 {
            tracing::debug!(device = %self.id, peer = %request.peer, "Loopback passphrase mismatch");
            state.emit_network(self.id, request.peer, id, NetworkEvent::Unavailable);
            state.emit_network(request.peer, self.id, other_id, NetworkEvent::Unavailable);
            return Ok(id);
        }

        // Each side learns the port the other side bound, if any.
        state.emit_network(self.id, request.peer, id, NetworkEvent::Available);
        state.emit_network(
            self.id,
            request.peer,
            id,
            NetworkEvent::CapabilitiesChanged(NetworkInfo::new(address, theirs.0)),
        );
        state.emit_network(request.peer, self.id, other_id, NetworkEvent::Available);
        state.emit_network(
            request.peer,
            self.id,
            other_id,
            NetworkEvent::CapabilitiesChanged(NetworkInfo::new(address, mine.0)),
        );
        Ok(id)
    }

    fn release_network(&self, request: NetworkRequestId) {
        let mut state = self.medium.state();
        let owned = state.requests.get(&request).is_some_and(|r| r.owner == self.id);
        if owned {
            state.requests.remove(&request);
        }
    }

    fn close_advertisement(&self, advertisement: AdvertisementHandle) {
        if let Ok(device) = self.medium.state().device_mut(self.id) {
            if device.publication.as_ref().is_some_and(|(h, _)| *h == advertisement) {
                device.publication = None;
            }
            if device.subscription.as_ref().is_some_and(|(h, _)| *h == advertisement) {
                device.subscription = None;
            }
        }
    }

    fn detach(&self, attach: AttachHandle) {
        let mut state = self.medium.state();
        if let Ok(device) = state.device_mut(self.id) {
            if device.attach == Some(attach) {
                device.clear();
                device.events = None;
            }
        }
        state.requests.retain(|_, r| r.owner != self.id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::mpsc;

    fn attach(device: &LoopbackDevice) -> (AttachHandle, mpsc::UnboundedReceiver<SubstrateEvent>) {
        let (tx, mut rx) = mpsc::unbounded_channel();
        device.attach(tx).unwrap();
        match rx.try_recv().unwrap() {
            SubstrateEvent::Attached(handle) => (handle, rx),
            other => panic!("unexpected event {:?}", other),
        }
    }

    fn drain(rx: &mut mpsc::UnboundedReceiver<SubstrateEvent>) -> Vec<SubstrateEvent> {
        let mut events = Vec::new();
        while let Ok(event) = rx.try_recv() {
            events.push(event);
        }
        events
    }

    fn advertisement(events: &[SubstrateEvent]) -> AdvertisementHandle {
        events
            .iter()
            .find_map(|e| match e {
                SubstrateEvent::PublishStarted(h) | SubstrateEvent::SubscribeStarted(h) => Some(*h),
                _ => None,
            })
            .unwrap()
    }

    #[test]
    fn test_unsupported_device() {
        let medium = LoopbackMedium::new();
        let device = medium.unsupported_device();
        let (tx, _rx) = mpsc::unbounded_channel();
        assert!(!device.is_supported());
        assert!(matches!(device.attach(tx), Err(AwareError::Unsupported)));
    }

    #[test]
    fn test_attach_failure() {
        let medium = LoopbackMedium::new();
        let device = medium.device();
        device.fail_next_attach("radio off");
        let (tx, mut rx) = mpsc::unbounded_channel();
        device.attach(tx).unwrap();
        assert_eq!(
            rx.try_recv().unwrap(),
            SubstrateEvent::AttachFailed {
                reason: "radio off".to_string()
            }
        );
    }

    #[test]
    fn test_discovery_and_messaging() {
        let medium = LoopbackMedium::new();
        let publisher = medium.device();
        let subscriber = medium.device();
        let (pub_attach, mut pub_rx) = attach(&publisher);
        let (sub_attach, mut sub_rx) = attach(&subscriber);

        publisher.publish(pub_attach, PublishConfig::solicited("svc")).unwrap();
        let pub_adv = advertisement(&drain(&mut pub_rx));

        subscriber.subscribe(sub_attach, SubscribeConfig::active("svc")).unwrap();
        let events = drain(&mut sub_rx);
        let sub_adv = advertisement(&events);
        assert!(events.contains(&SubstrateEvent::ServiceDiscovered {
            peer: publisher.id(),
            info: Bytes::from_static(b"svc"),
        }));

        subscriber
            .send_message(sub_adv, publisher.id(), 1, Bytes::from_static(b"hi"))
            .unwrap();
        assert_eq!(
            drain(&mut sub_rx),
            vec![SubstrateEvent::SendResult { message_id: 1, ok: true }]
        );
        assert_eq!(
            drain(&mut pub_rx),
            vec![SubstrateEvent::MessageReceived {
                peer: subscriber.id(),
                payload: Bytes::from_static(b"hi"),
            }]
        );

        publisher.drop_messages(true);
        publisher
            .send_message(pub_adv, subscriber.id(), 2, Bytes::from_static(b"x"))
            .unwrap();
        assert_eq!(
            drain(&mut pub_rx),
            vec![SubstrateEvent::SendResult { message_id: 2, ok: false }]
        );
        assert!(drain(&mut sub_rx).is_empty());
    }

    #[test]
    fn test_permission_denied() {
        let medium = LoopbackMedium::new();
        let device = medium.device();
        let (handle, _rx) = attach(&device);
        device.deny_permissions(true);
        let result = device.publish(handle, PublishConfig::solicited("svc"));
        assert!(matches!(result, Err(AwareError::PermissionDenied(_))));
    }

    #[test]
    fn test_network_negotiation() {
        let medium = LoopbackMedium::new();
        let publisher = medium.device();
        let subscriber = medium.device();
        let (pub_attach, mut pub_rx) = attach(&publisher);
        let (sub_attach, mut sub_rx) = attach(&subscriber);
        publisher.publish(pub_attach, PublishConfig::solicited("svc")).unwrap();
        subscriber.subscribe(sub_attach, SubscribeConfig::active("svc")).unwrap();
        let pub_adv = advertisement(&drain(&mut pub_rx));
        let sub_adv = advertisement(&drain(&mut sub_rx));

        let pub_req = publisher
            .request_network(NetworkRequest {
                advertisement: pub_adv,
                peer: subscriber.id(),
                passphrase: "pw".to_string(),
                port: Some(4242),
            })
            .unwrap();
        assert!(drain(&mut pub_rx).is_empty());

        let sub_req = subscriber
            .request_network(NetworkRequest {
                advertisement: sub_adv,
                peer: publisher.id(),
                passphrase: "pw".to_string(),
                port: None,
            })
            .unwrap();

        let localhost: IpAddr = "127.0.0.1".parse().unwrap();
        assert_eq!(
            drain(&mut sub_rx),
            vec![
                SubstrateEvent::Network {
                    peer: publisher.id(),
                    request: sub_req,
                    event: NetworkEvent::Available,
                },
                SubstrateEvent::Network {
                    peer: publisher.id(),
                    request: sub_req,
                    event: NetworkEvent::CapabilitiesChanged(NetworkInfo::new(localhost, Some(4242))),
                },
            ]
        );
        let pub_events = drain(&mut pub_rx);
        assert!(pub_events.contains(&SubstrateEvent::Network {
            peer: subscriber.id(),
            request: pub_req,
            event: NetworkEvent::CapabilitiesChanged(NetworkInfo::new(localhost, None)),
        }));

        publisher.release_network(pub_req);
        subscriber.release_network(sub_req);
        assert_eq!(medium.network_request_count(), 0);
    }

    #[test]
    fn test_passphrase_mismatch() {
        let medium = LoopbackMedium::new();
        let publisher = medium.device();
        let subscriber = medium.device();
        let (pub_attach, mut pub_rx) = attach(&publisher);
        let (sub_attach, mut sub_rx) = attach(&subscriber);
        publisher.publish(pub_attach, PublishConfig::solicited("svc")).unwrap();
        subscriber.subscribe(sub_attach, SubscribeConfig::active("svc")).unwrap();
        let pub_adv = advertisement(&drain(&mut pub_rx));
        let sub_adv = advertisement(&drain(&mut sub_rx));

        publisher
            .request_network(NetworkRequest {
                advertisement: pub_adv,
                peer: subscriber.id(),
                passphrase: "one".to_string(),
                port: Some(1),
            })
            .unwrap();
        let sub_req = subscriber
            .request_network(NetworkRequest {
                advertisement: sub_adv,
                peer: publisher.id(),
                passphrase: "two".to_string(),
                port: None,
            })
            .unwrap();

        assert_eq!(
            drain(&mut sub_rx),
            vec![SubstrateEvent::Network {
                peer: publisher.id(),
                request: sub_req,
                event: NetworkEvent::Unavailable,
            }]
        );
    }

    #[test]
    fn test_disconnect_reports_peer_lost() {
        let medium = LoopbackMedium::new();
        let publisher = medium.device();
        let subscriber = medium.device();
        let (pub_attach, mut pub_rx) = attach(&publisher);
        let (sub_attach, _sub_rx) = attach(&subscriber);
        publisher.publish(pub_attach, PublishConfig::solicited("svc")).unwrap();
        subscriber.subscribe(sub_attach, SubscribeConfig::active("svc")).unwrap();
        drain(&mut pub_rx);

        subscriber.disconnect();
        assert_eq!(
            drain(&mut pub_rx),
            vec![SubstrateEvent::PeerLost { peer: subscriber.id() }]
        );
    }

    #[test]
    fn test_revoke() {
        let medium = LoopbackMedium::new();
        let device = medium.device();
        let (handle, mut rx) = attach(&device);
        device.revoke();
        assert_eq!(drain(&mut rx), vec![SubstrateEvent::SubstrateLost]);
        assert!(device.publish(handle, PublishConfig::solicited("svc")).is_err());
    }
}

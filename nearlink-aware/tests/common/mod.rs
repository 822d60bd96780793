//! Shared test helpers for nearlink-aware integration tests.

#![allow(dead_code)]

use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use bytes::Bytes;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout};

use nearlink_aware::substrate::{PublishConfig, SubscribeConfig};
use nearlink_aware::{
    AdvertisementHandle, AttachHandle, AwareConfig, AwareResult, CoordinatorHandle,
    DiscoveryCoordinator, DiscoverySubstrate, MemorySink, NetworkEvent, NetworkInfo,
    NetworkRequest, NetworkRequestId, PeerHandle, SessionOutcome, SubstrateEvent,
};

/// Timeout for a session to reach a terminal state.
pub const OUTCOME_TIMEOUT_MS: u64 = 15000;

/// Small payload so transfers finish quickly.
pub fn test_config() -> AwareConfig {
    AwareConfig::default()
        .with_listen_ip("127.0.0.1".parse().unwrap())
        .with_payload(1024, 16)
}

/// A call made on [`ManualSubstrate`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Call {
    Attach,
    Publish(PublishConfig),
    Subscribe(SubscribeConfig),
    SendMessage { peer: PeerHandle, payload: Bytes },
    RequestNetwork(NetworkRequestId, NetworkRequest),
    ReleaseNetwork(NetworkRequestId),
    CloseAdvertisement,
    Detach,
}

#[derive(Default)]
struct ManualState {
    calls: Vec<Call>,
    events: Option<nearlink_aware::substrate::SubstrateEventSender>,
    next_request: u64,
    fail_sends: bool,
}

/// Substrate that records every call and lets the test inject events.
///
/// Attach, publish and subscribe confirm immediately. Messages report a
/// successful send unless [`ManualSubstrate::fail_sends`] is set. Network
/// requests never resolve on their own.
#[derive(Clone, Default)]
pub struct ManualSubstrate {
    state: Arc<Mutex<ManualState>>,
}

impl ManualSubstrate {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, ManualState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Report every later send as failed.
    pub fn fail_sends(&self, fail: bool) {
        self.state().fail_sends = fail;
    }

    /// Deliver an event to the attached coordinator.
    pub fn emit(&self, event: SubstrateEvent) {
        let state = self.state();
        let events = state.events.as_ref().expect("substrate not attached");
        events.send(event).expect("coordinator gone");
    }

    /// Deliver a network event for the latest request made for `peer`.
    pub fn emit_network(&self, peer: PeerHandle, event: NetworkEvent) {
        let request = self
            .network_requests()
            .into_iter()
            .rev()
            .find(|(_, r)| r.peer == peer)
            .map(|(id, _)| id)
            .expect("no network request for peer");
        self.emit(SubstrateEvent::Network {
            peer,
            request,
            event,
        });
    }

    /// Resolve the latest request for `peer` to a connectable address.
    pub fn connect_network(&self, peer: PeerHandle, port: Option<u16>) {
        let info = NetworkInfo::new("127.0.0.1".parse().unwrap(), port);
        self.emit_network(peer, NetworkEvent::Available);
        self.emit_network(peer, NetworkEvent::CapabilitiesChanged(info));
    }

    pub fn calls(&self) -> Vec<Call> {
        self.state().calls.clone()
    }

    /// Messages sent to `peer`, in order.
    pub fn messages_to(&self, peer: PeerHandle) -> Vec<String> {
        self.calls()
            .into_iter()
            .filter_map(|c| match c {
                Call::SendMessage { peer: to, payload } if to == peer => {
                    Some(String::from_utf8_lossy(&payload).into_owned())
                }
                _ => None,
            })
            .collect()
    }

    pub fn network_requests(&self) -> Vec<(NetworkRequestId, NetworkRequest)> {
        self.calls()
            .into_iter()
            .filter_map(|c| match c {
                Call::RequestNetwork(id, request) => Some((id, request)),
                _ => None,
            })
            .collect()
    }

    pub fn released(&self) -> Vec<NetworkRequestId> {
        self.calls()
            .into_iter()
            .filter_map(|c| match c {
                Call::ReleaseNetwork(id) => Some(id),
                _ => None,
            })
            .collect()
    }
}

impl DiscoverySubstrate for ManualSubstrate {
    fn is_supported(&self) -> bool {
        true
    }

    fn attach(&self, events: nearlink_aware::substrate::SubstrateEventSender) -> AwareResult<()> {
        let mut state = self.state();
        state.calls.push(Call::Attach);
        let _ = events.send(SubstrateEvent::Attached(AttachHandle(1)));
        state.events = Some(events);
        Ok(())
    }

    fn publish(&self, _attach: AttachHandle, config: PublishConfig) -> AwareResult<()> {
        let mut state = self.state();
        state.calls.push(Call::Publish(config));
        if let Some(events) = &state.events {
            let _ = events.send(SubstrateEvent::PublishStarted(AdvertisementHandle(2)));
        }
        Ok(())
    }

    fn subscribe(&self, _attach: AttachHandle, config: SubscribeConfig) -> AwareResult<()> {
        let mut state = self.state();
        state.calls.push(Call::Subscribe(config));
        if let Some(events) = &state.events {
            let _ = events.send(SubstrateEvent::SubscribeStarted(AdvertisementHandle(2)));
        }
        Ok(())
    }

    fn send_message(
        &self,
        _advertisement: AdvertisementHandle,
        peer: PeerHandle,
        message_id: u32,
        payload: Bytes,
    ) -> AwareResult<()> {
        let mut state = self.state();
        state.calls.push(Call::SendMessage { peer, payload });
        let ok = !state.fail_sends;
        if let Some(events) = &state.events {
            let _ = events.send(SubstrateEvent::SendResult { message_id, ok });
        }
        Ok(())
    }

    fn request_network(&self, request: NetworkRequest) -> AwareResult<NetworkRequestId> {
        let mut state = self.state();
        state.next_request += 1;
        let id = NetworkRequestId(state.next_request);
        state.calls.push(Call::RequestNetwork(id, request));
        Ok(id)
    }

    fn release_network(&self, request: NetworkRequestId) {
        self.state().calls.push(Call::ReleaseNetwork(request));
    }

    fn close_advertisement(&self, _advertisement: AdvertisementHandle) {
        self.state().calls.push(Call::CloseAdvertisement);
    }

    fn detach(&self, _attach: AttachHandle) {
        self.state().calls.push(Call::Detach);
    }
}

/// A running coordinator plus what it reports.
pub struct TestNode {
    pub handle: CoordinatorHandle,
    pub sink: Arc<MemorySink>,
    pub outcomes: mpsc::UnboundedReceiver<SessionOutcome>,
    pub task: JoinHandle<AwareResult<()>>,
}

impl TestNode {
    pub fn start(config: AwareConfig, substrate: Arc<dyn DiscoverySubstrate>) -> Self {
        let sink = Arc::new(MemorySink::new());
        let mut coordinator = DiscoveryCoordinator::new(config, substrate, sink.clone());
        let outcomes = coordinator.outcomes_receiver();
        let handle = coordinator.handle();
        let task = tokio::spawn(coordinator.run());
        Self {
            handle,
            sink,
            outcomes,
            task,
        }
    }

    /// Wait for the next session to end.
    pub async fn next_outcome(&mut self) -> SessionOutcome {
        timeout(Duration::from_millis(OUTCOME_TIMEOUT_MS), self.outcomes.recv())
            .await
            .expect("timed out waiting for a session outcome")
            .expect("coordinator stopped")
    }

    /// Wait until the session with `peer` reports `state`.
    pub async fn wait_for_state(&self, peer: PeerHandle, state: &str) -> bool {
        let handle = self.handle.clone();
        wait_for(5000, 20, || {
            let handle = handle.clone();
            async move {
                handle
                    .session(peer)
                    .await
                    .map(|s| s.state == state)
                    .unwrap_or(false)
            }
        })
        .await
    }

    pub async fn stop(self) {
        let _ = self.handle.shutdown().await;
        let _ = timeout(Duration::from_secs(5), self.task).await;
    }
}

/// Wait for a condition with timeout, polling periodically.
pub async fn wait_for<F, Fut>(timeout_ms: u64, poll_ms: u64, mut condition: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let start = std::time::Instant::now();
    let timeout_duration = Duration::from_millis(timeout_ms);
    let poll_duration = Duration::from_millis(poll_ms);

    loop {
        if condition().await {
            return true;
        }
        if start.elapsed() > timeout_duration {
            return false;
        }
        sleep(poll_duration).await;
    }
}

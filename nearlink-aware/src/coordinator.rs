//! Discovery coordinator.
//!
//! The coordinator owns the attach and advertisement lifecycle and the peer
//! session table. It runs one loop that serializes three inputs: commands
//! from [`CoordinatorHandle`]s, events from the substrate and reports from
//! socket workers. Sessions are driven only from this loop.

use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use serde::Serialize;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

use crate::config::{AwareConfig, SendFailurePolicy};
use crate::error::{AwareError, AwareResult, FailureReason};
use crate::events::EventSink;
use crate::peer::{
    PeerHandle, Role, SessionAction, SessionId, SessionInput, SessionSnapshot, SessionState,
    SessionTable,
};
use crate::substrate::{
    AdvertisementHandle, AttachHandle, DiscoverySubstrate, NetworkEvent, NetworkRequest,
    NetworkRequestId, PublishConfig, SubscribeConfig, SubstrateEvent, SubstrateEventSender,
};
use crate::transport::{
    spawn_publisher, spawn_subscriber, InboundListener, PayloadPattern, TransferSummary,
    WorkerMessage, WorkerReport,
};

/// Capacity of the command channel.
const COMMAND_CAPACITY: usize = 32;

/// How long shutdown waits for each worker to unwind.
const WORKER_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(2);

/// Attach lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AttachState {
    #[default]
    Detached,
    Attaching,
    Attached(AttachHandle),
    Failed,
}

impl fmt::Display for AttachState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AttachState::Detached => write!(f, "detached"),
            AttachState::Attaching => write!(f, "attaching"),
            AttachState::Attached(handle) => write!(f, "attached({})", handle),
            AttachState::Failed => write!(f, "failed"),
        }
    }
}

/// Publish or subscribe lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AdvertisementState {
    #[default]
    Idle,
    Starting,
    Active(AdvertisementHandle),
    Failed,
}

impl fmt::Display for AdvertisementState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AdvertisementState::Idle => write!(f, "idle"),
            AdvertisementState::Starting => write!(f, "starting"),
            AdvertisementState::Active(handle) => write!(f, "active({})", handle),
            AdvertisementState::Failed => write!(f, "failed"),
        }
    }
}

/// How one session ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionOutcome {
    pub peer: PeerHandle,
    pub session: SessionId,
    pub role: Role,
    /// State the session was in when it ended.
    pub stage: &'static str,
    pub result: Result<TransferSummary, FailureReason>,
}

impl SessionOutcome {
    pub fn is_success(&self) -> bool {
        self.result.is_ok()
    }

    /// The outcome as a result, naming the peer on failure.
    pub fn into_result(self) -> AwareResult<TransferSummary> {
        let peer = self.peer;
        self.result.map_err(|reason| reason.into_error(peer))
    }
}

/// Point-in-time view of the coordinator.
#[derive(Debug, Clone, Serialize)]
pub struct CoordinatorSnapshot {
    pub role: Option<Role>,
    pub attach: String,
    pub advertisement: String,
    pub sessions: Vec<SessionSnapshot>,
    pub completed: u64,
    pub failed: u64,
}

impl CoordinatorSnapshot {
    /// Snapshot of the live session with `peer`, if any.
    pub fn session(&self, peer: PeerHandle) -> Option<&SessionSnapshot> {
        self.sessions.iter().find(|s| s.peer == peer)
    }
}

type AttachReply = oneshot::Sender<AwareResult<AttachHandle>>;
type AdvertiseReply = oneshot::Sender<AwareResult<AdvertisementHandle>>;

enum Command {
    Attach(AttachReply),
    Advertise {
        role: Role,
        service: String,
        reply: AdvertiseReply,
    },
    Start {
        role: Role,
        reply: AdvertiseReply,
    },
    Snapshot(oneshot::Sender<CoordinatorSnapshot>),
    Shutdown(oneshot::Sender<()>),
}

/// Cloneable handle for talking to a running coordinator.
#[derive(Clone)]
pub struct CoordinatorHandle {
    tx: mpsc::Sender<Command>,
}

impl CoordinatorHandle {
    async fn request<T>(&self, make: impl FnOnce(oneshot::Sender<T>) -> Command) -> AwareResult<T> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(make(reply))
            .await
            .map_err(|_| AwareError::Shutdown)?;
        rx.await.map_err(|_| AwareError::Shutdown)
    }

    /// Attach to the substrate. Resolves once the substrate confirms.
    pub async fn attach(&self) -> AwareResult<AttachHandle> {
        self.request(Command::Attach).await?
    }

    /// Publish `service`. Requires a completed attach.
    pub async fn publish(&self, service: impl Into<String>) -> AwareResult<AdvertisementHandle> {
        let service = service.into();
        self.request(|reply| Command::Advertise {
            role: Role::Publisher,
            service,
            reply,
        })
        .await?
    }

    /// Subscribe to `service`. Requires a completed attach.
    pub async fn subscribe(&self, service: impl Into<String>) -> AwareResult<AdvertisementHandle> {
        let service = service.into();
        self.request(|reply| Command::Advertise {
            role: Role::Subscriber,
            service,
            reply,
        })
        .await?
    }

    /// Attach, then publish or subscribe the configured service for `role`.
    pub async fn start(&self, role: Role) -> AwareResult<AdvertisementHandle> {
        self.request(|reply| Command::Start { role, reply }).await?
    }

    pub async fn snapshot(&self) -> AwareResult<CoordinatorSnapshot> {
        self.request(Command::Snapshot).await
    }

    /// Snapshot of the live session with `peer`.
    pub async fn session(&self, peer: PeerHandle) -> AwareResult<SessionSnapshot> {
        self.snapshot()
            .await?
            .session(peer)
            .cloned()
            .ok_or(AwareError::SessionNotFound(peer))
    }

    /// End every session, close the advertisement and detach.
    pub async fn shutdown(&self) -> AwareResult<()> {
        self.request(Command::Shutdown).await
    }
}

/// Drives discovery, handshake, network negotiation and transfer for every peer.
pub struct DiscoveryCoordinator {
    config: Arc<AwareConfig>,
    substrate: Arc<dyn DiscoverySubstrate>,
    sink: Arc<dyn EventSink>,
    pattern: PayloadPattern,
    role: Option<Role>,
    attach: AttachState,
    advertisement: AdvertisementState,
    /// The only state shared between callbacks; touched only by the loop.
    sessions: SessionTable,
    next_message_id: u32,
    /// Message id to the session that sent it.
    pending_sends: HashMap<u32, (PeerHandle, SessionId)>,
    attach_waiters: Vec<AttachReply>,
    advertise_waiters: Vec<AdvertiseReply>,
    /// `start` requests waiting for attach to complete.
    pending_starts: Vec<(Role, AdvertiseReply)>,
    /// Cancelled workers still unwinding.
    retired: Vec<JoinHandle<()>>,
    command_tx: mpsc::Sender<Command>,
    command_rx: Option<mpsc::Receiver<Command>>,
    event_tx: SubstrateEventSender,
    event_rx: Option<mpsc::UnboundedReceiver<SubstrateEvent>>,
    report_tx: mpsc::Sender<WorkerMessage>,
    report_rx: Option<mpsc::Receiver<WorkerMessage>>,
    outcome_tx: Option<mpsc::UnboundedSender<SessionOutcome>>,
}

impl DiscoveryCoordinator {
    /// Create a coordinator over `substrate`, reporting to `sink`.
    pub fn new(
        config: AwareConfig,
        substrate: Arc<dyn DiscoverySubstrate>,
        sink: Arc<dyn EventSink>,
    ) -> Self {
        let pattern = PayloadPattern::from_config(&config);
        let (command_tx, command_rx) = mpsc::channel(COMMAND_CAPACITY);
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let (report_tx, report_rx) = mpsc::channel(config.report_capacity.max(1));

        Self {
            config: Arc::new(config),
            substrate,
            sink,
            pattern,
            role: None,
            attach: AttachState::Detached,
            advertisement: AdvertisementState::Idle,
            sessions: SessionTable::new(),
            next_message_id: 0,
            pending_sends: HashMap::new(),
            attach_waiters: Vec::new(),
            advertise_waiters: Vec::new(),
            pending_starts: Vec::new(),
            retired: Vec::new(),
            command_tx,
            command_rx: Some(command_rx),
            event_tx,
            event_rx: Some(event_rx),
            report_tx,
            report_rx: Some(report_rx),
            outcome_tx: None,
        }
    }

    /// Get a handle for issuing commands.
    pub fn handle(&self) -> CoordinatorHandle {
        CoordinatorHandle {
            tx: self.command_tx.clone(),
        }
    }

    /// Get a receiver that yields one outcome per ended session.
    pub fn outcomes_receiver(&mut self) -> mpsc::UnboundedReceiver<SessionOutcome> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.outcome_tx = Some(tx);
        rx
    }

    /// Run until a shutdown command is processed.
    pub async fn run(mut self) -> AwareResult<()> {
        let (Some(mut command_rx), Some(mut event_rx), Some(mut report_rx)) = (
            self.command_rx.take(),
            self.event_rx.take(),
            self.report_rx.take(),
        ) else {
            return Err(AwareError::Shutdown);
        };

        tracing::info!(service = %self.config.service_name, "Discovery coordinator running");

        loop {
            tokio::select! {
                Some(command) = command_rx.recv() => {
                    if let Some(done) = self.handle_command(command) {
                        self.teardown().await;
                        let _ = done.send(());
                        break;
                    }
                }

                Some(event) = event_rx.recv() => {
                    self.handle_substrate_event(event);
                }

                Some(message) = report_rx.recv() => {
                    self.handle_worker_report(message);
                }

                else => break,
            }
        }

        tracing::info!("Discovery coordinator stopped");
        Ok(())
    }

    fn report(&self, message: impl AsRef<str>) {
        self.sink.on_event(message.as_ref());
    }

    /// Returns the shutdown acknowledgement when the loop must stop.
    fn handle_command(&mut self, command: Command) -> Option<oneshot::Sender<()>> {
        match command {
            Command::Attach(reply) => match self.begin_attach() {
                Ok(Some(handle)) => {
                    let _ = reply.send(Ok(handle));
                }
                Ok(None) => self.attach_waiters.push(reply),
                Err(e) => {
                    let _ = reply.send(Err(e));
                }
            },
            Command::Advertise {
                role,
                service,
                reply,
            } => {
                let result = self.claim_role(role).and_then(|()| match self.attach {
                    AttachState::Attached(handle) => self.start_advertising(handle, role, service),
                    _ => Err(AwareError::NotAttached),
                });
                self.settle_advertise(reply, result);
            }
            Command::Start { role, reply } => {
                if let Err(e) = self.claim_role(role) {
                    let _ = reply.send(Err(e));
                    return None;
                }
                match self.begin_attach() {
                    Ok(Some(handle)) => {
                        let service = self.config.service_name.clone();
                        let result = self.start_advertising(handle, role, service);
                        self.settle_advertise(reply, result);
                    }
                    Ok(None) => self.pending_starts.push((role, reply)),
                    Err(e) => {
                        let _ = reply.send(Err(e));
                    }
                }
            }
            Command::Snapshot(reply) => {
                let _ = reply.send(self.snapshot());
            }
            Command::Shutdown(done) => return Some(done),
        }
        None
    }

    fn claim_role(&mut self, role: Role) -> AwareResult<()> {
        match self.role {
            None => {
                tracing::debug!(role = %role, "Role chosen");
                self.role = Some(role);
                Ok(())
            }
            Some(current) if current == role => Ok(()),
            Some(current) => Err(AwareError::RoleConflict {
                current: current.to_string(),
                requested: role.to_string(),
            }),
        }
    }

    /// `Ok(Some)` when already attached, `Ok(None)` when confirmation is pending.
    fn begin_attach(&mut self) -> AwareResult<Option<AttachHandle>> {
        match self.attach {
            AttachState::Attached(handle) => Ok(Some(handle)),
            AttachState::Attaching => Ok(None),
            AttachState::Failed => Err(AwareError::AttachFailed(
                "attach already failed for this run".to_string(),
            )),
            AttachState::Detached => {
                if !self.substrate.is_supported() {
                    self.attach = AttachState::Failed;
                    self.report("Discovery capability is not supported on this device.");
                    return Err(AwareError::Unsupported);
                }
                if let Err(e) = self.substrate.attach(self.event_tx.clone()) {
                    self.attach = AttachState::Failed;
                    self.report(format!("Attach failed: {}", e));
                    return Err(e);
                }
                self.attach = AttachState::Attaching;
                tracing::debug!("Attach requested");
                Ok(None)
            }
        }
    }

    /// `Ok(Some)` when already active, `Ok(None)` when confirmation is pending.
    fn start_advertising(
        &mut self,
        attach: AttachHandle,
        role: Role,
        service: String,
    ) -> AwareResult<Option<AdvertisementHandle>> {
        match self.advertisement {
            AdvertisementState::Active(handle) => return Ok(Some(handle)),
            AdvertisementState::Starting => return Ok(None),
            AdvertisementState::Failed => {
                return Err(advertise_error(role, "advertisement failed earlier in this run"));
            }
            AdvertisementState::Idle => {}
        }

        let result = match role {
            Role::Publisher => {
                self.report(format!("Publishing service {}.", service));
                self.substrate.publish(attach, PublishConfig::solicited(service))
            }
            Role::Subscriber => {
                self.report(format!("Subscribing to service {}.", service));
                self.substrate.subscribe(attach, SubscribeConfig::active(service))
            }
        };

        match result {
            Ok(()) => {
                self.advertisement = AdvertisementState::Starting;
                Ok(None)
            }
            // Left idle so the caller can retry once permissions are granted.
            Err(e @ AwareError::PermissionDenied(_)) => {
                self.report(format!("Permissions missing: {}", e));
                Err(e)
            }
            Err(e) => {
                self.advertisement = AdvertisementState::Failed;
                self.report(format!("{} failed: {}", role, e));
                Err(e)
            }
        }
    }

    fn settle_advertise(&mut self, reply: AdvertiseReply, result: AwareResult<Option<AdvertisementHandle>>) {
        match result {
            Ok(Some(handle)) => {
                let _ = reply.send(Ok(handle));
            }
            Ok(None) => self.advertise_waiters.push(reply),
            Err(e) => {
                let _ = reply.send(Err(e));
            }
        }
    }

    fn handle_substrate_event(&mut self, event: SubstrateEvent) {
        match event {
            SubstrateEvent::Attached(handle) => {
                self.attach = AttachState::Attached(handle);
                tracing::info!(attach = %handle, "Attached to discovery substrate");
                self.report("Discovery session attached.");
                for waiter in self.attach_waiters.drain(..) {
                    let _ = waiter.send(Ok(handle));
                }
                for (role, reply) in std::mem::take(&mut self.pending_starts) {
                    let service = self.config.service_name.clone();
                    let result = self.start_advertising(handle, role, service);
                    self.settle_advertise(reply, result);
                }
            }
            SubstrateEvent::AttachFailed { reason } => {
                self.attach = AttachState::Failed;
                tracing::warn!(reason = %reason, "Attach failed");
                self.report(format!("Attach failed: {}", reason));
                for waiter in self.attach_waiters.drain(..) {
                    let _ = waiter.send(Err(AwareError::AttachFailed(reason.clone())));
                }
                for (_, reply) in self.pending_starts.drain(..) {
                    let _ = reply.send(Err(AwareError::AttachFailed(reason.clone())));
                }
            }
            SubstrateEvent::SubstrateLost => self.handle_substrate_lost(),
            SubstrateEvent::PublishStarted(handle) | SubstrateEvent::SubscribeStarted(handle) => {
                self.advertisement = AdvertisementState::Active(handle);
                tracing::info!(advertisement = %handle, role = ?self.role, "Advertisement active");
                match self.role {
                    Some(Role::Publisher) => self.report("Publish started. Waiting for subscribers."),
                    _ => self.report("Subscribe started. Looking for publishers."),
                }
                for reply in self.advertise_waiters.drain(..) {
                    let _ = reply.send(Ok(handle));
                }
            }
            SubstrateEvent::AdvertisementFailed { reason } => {
                self.advertisement = AdvertisementState::Failed;
                let role = self.role.unwrap_or(Role::Publisher);
                tracing::warn!(role = %role, reason = %reason, "Advertisement failed");
                self.report(format!("{} failed: {}", role, reason));
                for reply in self.advertise_waiters.drain(..) {
                    let _ = reply.send(Err(advertise_error(role, &reason)));
                }
            }
            SubstrateEvent::ServiceDiscovered { peer, info } => {
                tracing::trace!(peer = %peer, info_len = info.len(), "Service discovered");
                self.report(format!("Found peer: {}", peer));
                if self.role != Some(Role::Subscriber) {
                    tracing::warn!(peer = %peer, "Discovery event without subscriber role ignored");
                    return;
                }
                self.open_session(peer, Role::Subscriber);
                self.drive(peer, SessionInput::ServiceDiscovered);
            }
            SubstrateEvent::MessageReceived { peer, payload } => {
                tracing::trace!(peer = %peer, len = payload.len(), "Message received");
                self.report(format!(
                    "Received message from {}: {}",
                    peer,
                    String::from_utf8_lossy(&payload)
                ));
                match self.role {
                    Some(Role::Publisher) => {
                        self.open_session(peer, Role::Publisher);
                        self.drive(peer, SessionInput::MessageReceived(payload));
                    }
                    Some(Role::Subscriber) if self.sessions.contains(&peer) => {
                        self.drive(peer, SessionInput::MessageReceived(payload));
                    }
                    _ => {
                        tracing::warn!(peer = %peer, "Message from peer without a session ignored");
                    }
                }
            }
            SubstrateEvent::SendResult { message_id, ok } => {
                let owner = self.pending_sends.remove(&message_id);
                if ok {
                    self.report(format!("Sent message {} successfully.", message_id));
                    if let Some((peer, session)) = owner {
                        if self.sessions.get(&peer).map(|e| e.session.id()) == Some(session) {
                            self.drive(peer, SessionInput::MessageSent);
                        }
                    }
                    return;
                }
                match owner {
                    Some((peer, _)) => self.report(format!("Failed to send message {} to {}.", message_id, peer)),
                    None => self.report(format!("Failed to send message {}.", message_id)),
                }
                if let Some((peer, session)) = owner {
                    let current = self.sessions.get(&peer).map(|e| e.session.id());
                    if current == Some(session) && self.config.send_failure_policy == SendFailurePolicy::FailSession {
                        self.drive(peer, SessionInput::SendFailed { message_id });
                    }
                }
            }
            SubstrateEvent::PeerLost { peer } => {
                self.report(format!("Lost peer: {}", peer));
                if self.sessions.contains(&peer) {
                    self.drive(peer, SessionInput::PeerLost);
                }
            }
            SubstrateEvent::Network {
                peer,
                request,
                event,
            } => self.handle_network_event(peer, request, event),
        }
    }

    fn handle_network_event(&mut self, peer: PeerHandle, request: NetworkRequestId, event: NetworkEvent) {
        if self.sessions.peer_for_request(request) != Some(peer) {
            tracing::debug!(peer = %peer, request = %request, event = %event, "Network event for released request ignored");
            return;
        }
        self.report(format!("Network {} for {}.", event, peer));
        let input = match event {
            NetworkEvent::Available => SessionInput::NetworkAvailable,
            NetworkEvent::CapabilitiesChanged(info) => SessionInput::CapabilitiesChanged(info),
            NetworkEvent::BlockedStatusChanged(_) => return,
            NetworkEvent::Unavailable => SessionInput::NetworkUnavailable,
            NetworkEvent::Lost => SessionInput::NetworkLost,
        };
        self.drive(peer, input);
    }

    fn handle_substrate_lost(&mut self) {
        tracing::warn!(sessions = self.sessions.len(), "Discovery substrate lost");
        self.report("Discovery substrate lost. Ending all sessions.");
        self.attach = AttachState::Failed;
        self.advertisement = AdvertisementState::Failed;

        for waiter in self.attach_waiters.drain(..) {
            let _ = waiter.send(Err(AwareError::SubstrateRevoked));
        }
        for reply in self.advertise_waiters.drain(..) {
            let _ = reply.send(Err(AwareError::SubstrateRevoked));
        }
        for (_, reply) in self.pending_starts.drain(..) {
            let _ = reply.send(Err(AwareError::SubstrateRevoked));
        }

        for peer in self.sessions.peers() {
            self.drive(peer, SessionInput::SubstrateLost);
        }
        self.pending_sends.clear();
    }

    fn handle_worker_report(&mut self, message: WorkerMessage) {
        let WorkerMessage {
            peer,
            session,
            report,
        } = message;
        let current = self.sessions.get(&peer).map(|e| e.session.id());
        if current != Some(session) {
            tracing::debug!(peer = %peer, session = %session, "Report from retired worker ignored");
            return;
        }

        match report {
            WorkerReport::Accepted { remote } => {
                self.report(format!("{}: client connected from {}.", peer, remote.ip()));
                self.drive(peer, SessionInput::Accepted { remote });
            }
            WorkerReport::Connected { remote } => {
                self.report(format!("{}: socket connected to {}.", peer, remote));
            }
            WorkerReport::LineReceived(line) => {
                self.report(format!("{}: received from client: {}", peer, line));
            }
            WorkerReport::Finished(result) => {
                self.drive(peer, SessionInput::TransferFinished(result));
            }
        }
    }

    fn open_session(&mut self, peer: PeerHandle, role: Role) {
        let greeting = match role {
            Role::Publisher => &self.config.publisher_greeting,
            Role::Subscriber => &self.config.subscriber_greeting,
        };
        self.sessions
            .open(peer, role, Bytes::from(greeting.clone().into_bytes()));
    }

    /// Feed one input to a session, carry out its actions and retire it if
    /// it reached a terminal state.
    fn drive(&mut self, peer: PeerHandle, input: SessionInput) {
        let mut queue = VecDeque::from([input]);
        while let Some(input) = queue.pop_front() {
            let Some(entry) = self.sessions.get_mut(&peer) else {
                return;
            };
            let actions = entry.session.handle(input);
            for action in actions {
                if let Some(follow_up) = self.execute(peer, action) {
                    queue.push_back(follow_up);
                }
            }
        }

        if self.sessions.get(&peer).is_some_and(|e| e.session.is_terminal()) {
            self.finish_session(peer);
        }
    }

    /// Carry out one action. Returns an input to feed back when the action
    /// completes synchronously.
    fn execute(&mut self, peer: PeerHandle, action: SessionAction) -> Option<SessionInput> {
        let session = self.sessions.get(&peer)?.session.id();

        match action {
            SessionAction::SendMessage(payload) => {
                self.next_message_id = self.next_message_id.wrapping_add(1);
                let message_id = self.next_message_id;
                let AdvertisementState::Active(advertisement) = self.advertisement else {
                    self.report(format!("Cannot message {}: no active advertisement.", peer));
                    return self.send_failure_input(message_id);
                };
                self.pending_sends.insert(message_id, (peer, session));
                tracing::trace!(peer = %peer, message_id, len = payload.len(), "Sending message");

                if let Err(e) = self.substrate.send_message(advertisement, peer, message_id, payload) {
                    self.pending_sends.remove(&message_id);
                    self.report(format!("Failed to send message {} to {}: {}", message_id, peer, e));
                    return self.send_failure_input(message_id);
                }
                None
            }
            SessionAction::StartListener => match InboundListener::bind(peer, self.config.listen_ip) {
                Ok(listener) => {
                    let port = listener.port();
                    self.report(format!("{}: server socket listening on port {}.", peer, port));
                    let worker = spawn_publisher(peer, session, listener, self.pattern, self.report_tx.clone());
                    if let Some(entry) = self.sessions.get_mut(&peer) {
                        entry.worker = Some(worker);
                    }
                    Some(SessionInput::Listening { port })
                }
                Err(e) => {
                    self.report(format!("{}: server socket error: {}", peer, e));
                    Some(SessionInput::TransferFinished(Err(e.to_string())))
                }
            },
            SessionAction::RequestNetwork { port } => {
                let AdvertisementState::Active(advertisement) = self.advertisement else {
                    self.report(format!("Cannot request network for {}: no active advertisement.", peer));
                    return Some(SessionInput::NetworkUnavailable);
                };
                let request = NetworkRequest {
                    advertisement,
                    peer,
                    passphrase: self.config.passphrase.clone(),
                    port,
                };
                match self.substrate.request_network(request) {
                    Ok(id) => {
                        tracing::debug!(peer = %peer, request = %id, port = ?port, "Network requested");
                        match port {
                            Some(port) => self.report(format!("Requesting network for {} (port {}).", peer, port)),
                            None => self.report(format!("Requesting network for {}.", peer)),
                        }
                        if let Some(entry) = self.sessions.get_mut(&peer) {
                            entry.network_request = Some(id);
                        }
                        None
                    }
                    Err(e) => {
                        self.report(format!("Network request for {} failed: {}", peer, e));
                        Some(SessionInput::NetworkUnavailable)
                    }
                }
            }
            SessionAction::Connect(addr) => {
                self.report(format!("{}: connecting socket to {}.", peer, addr));
                let worker = spawn_subscriber(
                    peer,
                    session,
                    addr,
                    self.config.request_line.clone(),
                    self.pattern,
                    self.report_tx.clone(),
                );
                if let Some(entry) = self.sessions.get_mut(&peer) {
                    entry.worker = Some(worker);
                }
                None
            }
        }
    }

    fn send_failure_input(&self, message_id: u32) -> Option<SessionInput> {
        match self.config.send_failure_policy {
            SendFailurePolicy::FailSession => Some(SessionInput::SendFailed { message_id }),
            SendFailurePolicy::Report => None,
        }
    }

    /// Remove a terminal session and release everything it held.
    fn finish_session(&mut self, peer: PeerHandle) {
        let Some(mut entry) = self.sessions.remove(&peer) else {
            return;
        };
        if let Some(worker) = entry.worker.take() {
            self.retired.push(worker.shutdown());
        }
        self.retired.retain(|task| !task.is_finished());
        if let Some(request) = entry.network_request.take() {
            tracing::debug!(peer = %peer, request = %request, "Releasing network request");
            self.substrate.release_network(request);
        }

        let session = entry.session;
        let id = session.id();
        self.pending_sends.retain(|_, (_, owner)| *owner != id);

        let stage = session.failed_in().unwrap_or(session.state().name());
        let result = match session.state() {
            SessionState::Failed(reason) => Err(reason.clone()),
            _ => Ok(session.transfer().unwrap_or_default()),
        };

        match &result {
            Ok(summary) => {
                tracing::info!(peer = %peer, session = %id, bytes = summary.bytes, "Session complete");
                match (session.role(), summary.intact) {
                    (Role::Subscriber, Some(intact)) => self.report(format!(
                        "{}: received {} bytes ({}). Socket closed.",
                        peer,
                        summary.bytes,
                        if intact { "payload intact" } else { "payload corrupted" }
                    )),
                    _ => self.report(format!("{}: sent payload of {} bytes. Socket closed.", peer, summary.bytes)),
                }
            }
            Err(reason) => {
                tracing::warn!(peer = %peer, session = %id, stage, reason = %reason, "Session failed");
                self.report(format!("{}: session failed in {}: {}", peer, stage, reason));
            }
        }

        if let Some(tx) = &self.outcome_tx {
            let _ = tx.send(SessionOutcome {
                peer,
                session: id,
                role: session.role(),
                stage,
                result,
            });
        }
    }

    fn snapshot(&self) -> CoordinatorSnapshot {
        CoordinatorSnapshot {
            role: self.role,
            attach: self.attach.to_string(),
            advertisement: self.advertisement.to_string(),
            sessions: self.sessions.snapshot(),
            completed: self.sessions.completed_count(),
            failed: self.sessions.failed_count(),
        }
    }

    async fn teardown(&mut self) {
        tracing::info!(sessions = self.sessions.len(), "Discovery coordinator shutting down");
        self.report("Shutting down.");

        for peer in self.sessions.peers() {
            self.drive(peer, SessionInput::Shutdown);
        }
        if let AdvertisementState::Active(handle) = self.advertisement {
            self.substrate.close_advertisement(handle);
            self.advertisement = AdvertisementState::Idle;
        }
        if let AttachState::Attached(handle) = self.attach {
            self.substrate.detach(handle);
            self.attach = AttachState::Detached;
        }

        for waiter in self.attach_waiters.drain(..) {
            let _ = waiter.send(Err(AwareError::Shutdown));
        }
        for reply in self.advertise_waiters.drain(..) {
            let _ = reply.send(Err(AwareError::Shutdown));
        }
        for (_, reply) in self.pending_starts.drain(..) {
            let _ = reply.send(Err(AwareError::Shutdown));
        }

        for task in self.retired.drain(..) {
            let _ = tokio::time::timeout(WORKER_SHUTDOWN_TIMEOUT, task).await;
        }
    }
}

fn advertise_error(role: Role, reason: &str) -> AwareError {
    match role {
        Role::Publisher => AwareError::PublishFailed(reason.to_string()),
        Role::Subscriber => AwareError::SubscribeFailed(reason.to_string()),
    }
}

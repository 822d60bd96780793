//! Node orchestrator.
//!
//! Starts one coordinator per simulated device on a shared loopback medium,
//! collects session outcomes and tears everything down.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use serde::Serialize;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use nearlink_aware::{
    AwareResult, CoordinatorHandle, DiscoveryCoordinator, LogEntry, LoopbackMedium, MemorySink,
    PeerHandle, Role, SessionOutcome, SinkSet, TracingSink,
};

use crate::config::NodeConfig;
use crate::shutdown::RunStop;

/// How long each coordinator gets to finish its shutdown.
const COORDINATOR_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(5);

/// How one session ended, as printed in the summary.
#[derive(Debug, Clone, Serialize)]
pub struct SessionRecord {
    /// Device the session ran on.
    pub device: String,
    pub peer: PeerHandle,
    pub role: Role,
    pub stage: &'static str,
    pub bytes: Option<u64>,
    pub intact: Option<bool>,
    pub error: Option<String>,
}

impl SessionRecord {
    fn new(device: String, outcome: SessionOutcome) -> Self {
        let (bytes, intact, error) = match outcome.result {
            Ok(summary) => (Some(summary.bytes), summary.intact, None),
            Err(reason) => (None, None, Some(reason.to_string())),
        };
        Self {
            device,
            peer: outcome.peer,
            role: outcome.role,
            stage: outcome.stage,
            bytes,
            intact,
            error,
        }
    }

    pub fn is_success(&self) -> bool {
        self.error.is_none() && self.intact != Some(false)
    }
}

/// Result of one run.
#[derive(Debug, Clone, Default, Serialize)]
pub struct RunSummary {
    pub sessions: Vec<SessionRecord>,
    pub completed: usize,
    pub failed: usize,
    /// The run was stopped by a signal before every session ended.
    pub interrupted: bool,
    /// Event log of each device, in device order.
    #[serde(skip)]
    pub logs: Vec<(String, Vec<LogEntry>)>,
}

impl RunSummary {
    fn record(&mut self, device: String, outcome: SessionOutcome) {
        let record = SessionRecord::new(device, outcome);
        if record.is_success() {
            self.completed += 1;
        } else {
            self.failed += 1;
        }
        self.sessions.push(record);
    }

    /// No session failed.
    pub fn is_success(&self) -> bool {
        self.failed == 0
    }
}

struct Device {
    name: String,
    handle: CoordinatorHandle,
    log: Arc<MemorySink>,
    task: JoinHandle<AwareResult<()>>,
    forwarder: JoinHandle<()>,
}

/// The main node structure.
pub struct Node {
    /// Node configuration.
    config: NodeConfig,

    /// Stops the run early.
    stop: RunStop,
}

impl Node {
    /// Create a new node with the given configuration.
    pub fn new(config: NodeConfig) -> Self {
        Self {
            config,
            stop: RunStop::new(),
        }
    }

    /// Get a handle that stops the run.
    pub fn shutdown_handle(&self) -> RunStop {
        self.stop.clone()
    }

    /// Run until every expected session ended or a shutdown is signaled.
    pub async fn run(&self) -> anyhow::Result<RunSummary> {
        tracing::info!("Starting nearlink node...");
        tracing::info!("  Service: {}", self.config.aware.service_name);
        tracing::info!("  Publisher: {}", self.config.run_publisher);
        tracing::info!("  Subscribers: {}", self.config.subscribers);
        tracing::info!("  Payload: {} bytes", self.config.aware.payload_len());

        let medium = LoopbackMedium::new();
        let (outcome_tx, mut outcome_rx) = mpsc::unbounded_channel();
        let mut devices = Vec::new();

        if self.config.run_publisher {
            let device = self.start_device("publisher".to_string(), &medium, outcome_tx.clone());
            device
                .handle
                .start(Role::Publisher)
                .await
                .context("publisher failed to start")?;
            devices.push(device);
        }
        for index in 1..=self.config.subscribers {
            let device = self.start_device(format!("subscriber-{}", index), &medium, outcome_tx.clone());
            device
                .handle
                .start(Role::Subscriber)
                .await
                .with_context(|| format!("{} failed to start", device.name))?;
            devices.push(device);
        }
        drop(outcome_tx);

        let expected = self.config.expected_sessions();
        let mut summary = RunSummary::default();
        while expected.map_or(true, |n| summary.sessions.len() < n) {
            tokio::select! {
                Some((device, outcome)) = outcome_rx.recv() => {
                    summary.record(device, outcome);
                }
                _ = self.stop.triggered() => {
                    summary.interrupted = true;
                    break;
                }
            }
        }

        tracing::info!("Shutting down node...");
        for device in &devices {
            let _ = device.handle.shutdown().await;
        }
        for device in devices {
            if let Ok(Ok(Err(e))) = tokio::time::timeout(COORDINATOR_SHUTDOWN_TIMEOUT, device.task).await {
                tracing::warn!(device = %device.name, error = %e, "Coordinator stopped with error");
            }
            let _ = tokio::time::timeout(COORDINATOR_SHUTDOWN_TIMEOUT, device.forwarder).await;
            summary.logs.push((device.name, device.log.entries()));
        }
        while let Ok((device, outcome)) = outcome_rx.try_recv() {
            summary.record(device, outcome);
        }

        tracing::info!(
            completed = summary.completed,
            failed = summary.failed,
            "Node shutdown complete"
        );
        Ok(summary)
    }

    fn start_device(
        &self,
        name: String,
        medium: &LoopbackMedium,
        outcomes: mpsc::UnboundedSender<(String, SessionOutcome)>,
    ) -> Device {
        let log = Arc::new(MemorySink::new());
        let sinks = SinkSet::new().with(Arc::new(TracingSink)).with(log.clone());
        let substrate = Arc::new(medium.device());

        let mut coordinator = DiscoveryCoordinator::new(self.config.aware.clone(), substrate, Arc::new(sinks));
        let mut outcome_rx = coordinator.outcomes_receiver();
        let handle = coordinator.handle();
        let task = tokio::spawn(coordinator.run());

        let device = name.clone();
        let forwarder = tokio::spawn(async move {
            while let Some(outcome) = outcome_rx.recv().await {
                if outcomes.send((device.clone(), outcome)).is_err() {
                    break;
                }
            }
        });

        tracing::debug!(device = %name, "Device started");
        Device {
            name,
            handle,
            log,
            task,
            forwarder,
        }
    }
}

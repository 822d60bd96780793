//! Stopping a run from a process signal or from code.

use std::fmt;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Process signal that ends a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopSignal {
    Interrupt,
    Terminate,
}

impl fmt::Display for StopSignal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StopSignal::Interrupt => write!(f, "SIGINT"),
            StopSignal::Terminate => write!(f, "SIGTERM"),
        }
    }
}

/// Shared stop flag for one run.
///
/// Clones observe the same flag. Triggering before the run starts waiting
/// still stops it.
#[derive(Debug, Clone, Default)]
pub struct RunStop {
    token: CancellationToken,
}

impl RunStop {
    pub fn new() -> Self {
        Self::default()
    }

    /// Ask the run to stop. Later calls have no effect.
    pub fn trigger(&self) {
        self.token.cancel();
    }

    pub fn is_triggered(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Resolves once [`trigger`](Self::trigger) was called.
    pub async fn triggered(&self) {
        self.token.cancelled().await;
    }
}

/// Wait for SIGINT or SIGTERM (Ctrl+C off unix).
pub async fn next_stop_signal() -> std::io::Result<StopSignal> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        let mut interrupt = signal(SignalKind::interrupt())?;
        let mut terminate = signal(SignalKind::terminate())?;
        let received = tokio::select! {
            _ = interrupt.recv() => StopSignal::Interrupt,
            _ = terminate.recv() => StopSignal::Terminate,
        };
        Ok(received)
    }

    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await?;
        Ok(StopSignal::Interrupt)
    }
}

/// Trigger `stop` on the next process signal.
pub fn spawn_signal_forwarder(stop: RunStop) -> JoinHandle<()> {
    tokio::spawn(async move {
        tokio::select! {
            received = next_stop_signal() => match received {
                Ok(signal) => {
                    tracing::info!(%signal, "Stopping the run");
                    stop.trigger();
                }
                Err(e) => tracing::warn!(error = %e, "Signal handler unavailable"),
            },
            _ = stop.triggered() => {}
        }
    })
}

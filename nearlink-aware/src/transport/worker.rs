//! Per-session socket workers.
//!
//! Accept, connect and the bulk transfer run on runtime tasks, never on the
//! coordinator loop. A worker refers to its session only by
//! `(PeerHandle, SessionId)` and reports progress over a channel.

use std::net::SocketAddr;

use serde::Serialize;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::error::AwareResult;
use crate::peer::{PeerHandle, SessionId};
use crate::transport::{connect_to_peer, InboundListener, PayloadPattern};

/// Result of a completed transfer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct TransferSummary {
    /// Bytes written (publisher) or read (subscriber).
    pub bytes: u64,
    /// Whether the received bytes matched the payload pattern. Receiving side only.
    pub intact: Option<bool>,
}

/// Progress reported by a worker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WorkerReport {
    /// The listener accepted its one connection.
    Accepted { remote: SocketAddr },
    /// The outbound connection is established.
    Connected { remote: SocketAddr },
    /// The request line arrived from the connecting side.
    LineReceived(String),
    /// The transfer ended; the error carries the underlying message.
    Finished(Result<TransferSummary, String>),
}

/// A report tagged with the session it belongs to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerMessage {
    pub peer: PeerHandle,
    pub session: SessionId,
    pub report: WorkerReport,
}

#[derive(Clone)]
struct Reporter {
    peer: PeerHandle,
    session: SessionId,
    tx: mpsc::Sender<WorkerMessage>,
}

impl Reporter {
    async fn send(&self, report: WorkerReport) {
        let message = WorkerMessage {
            peer: self.peer,
            session: self.session,
            report,
        };
        if self.tx.send(message).await.is_err() {
            tracing::trace!(peer = %self.peer, session = %self.session, "Coordinator gone, report dropped");
        }
    }
}

/// Handle to a running worker.
#[derive(Debug)]
pub struct SessionWorker {
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

impl SessionWorker {
    /// Interrupt the worker. Its socket is closed when the task unwinds.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    /// Cancel and hand back the task so the caller can wait for it.
    pub fn shutdown(self) -> JoinHandle<()> {
        self.cancel.cancel();
        self.task
    }
}

fn spawn_worker<F>(reporter: Reporter, work: F) -> SessionWorker
where
    F: std::future::Future<Output = AwareResult<TransferSummary>> + Send + 'static,
{
    let cancel = CancellationToken::new();
    let token = cancel.clone();
    let task = tokio::spawn(async move {
        tokio::select! {
            _ = token.cancelled() => {
                tracing::debug!(peer = %reporter.peer, session = %reporter.session, "Worker cancelled");
            }
            result = work => {
                let result = result.map_err(|e| e.to_string());
                reporter.send(WorkerReport::Finished(result)).await;
            }
        }
    });
    SessionWorker { cancel, task }
}

/// Serve the payload to the first peer that connects to `listener`.
pub fn spawn_publisher(
    peer: PeerHandle,
    session: SessionId,
    listener: InboundListener,
    pattern: PayloadPattern,
    reports: mpsc::Sender<WorkerMessage>,
) -> SessionWorker {
    let reporter = Reporter {
        peer,
        session,
        tx: reports,
    };
    let progress = reporter.clone();
    spawn_worker(reporter, async move {
        let mut channel = listener.accept_one().await?;
        progress
            .send(WorkerReport::Accepted {
                remote: channel.remote_addr(),
            })
            .await;

        let line = channel.read_line().await?;
        progress.send(WorkerReport::LineReceived(line)).await;

        let bytes = channel.write_payload(&pattern).await?;
        channel.finish().await?;
        tracing::debug!(peer = %peer, bytes, "Payload sent");
        Ok(TransferSummary { bytes, intact: None })
    })
}

/// Connect to `addr`, send the request line and read the payload.
pub fn spawn_subscriber(
    peer: PeerHandle,
    session: SessionId,
    addr: SocketAddr,
    request_line: String,
    pattern: PayloadPattern,
    reports: mpsc::Sender<WorkerMessage>,
) -> SessionWorker {
    let reporter = Reporter {
        peer,
        session,
        tx: reports,
    };
    let progress = reporter.clone();
    spawn_worker(reporter, async move {
        let mut channel = connect_to_peer(peer, addr).await?;
        progress
            .send(WorkerReport::Connected {
                remote: channel.remote_addr(),
            })
            .await;

        channel.write_line(&request_line).await?;

        let mut verifier = pattern.verifier();
        let bytes = channel.read_to_end_with(|chunk| verifier.update(chunk)).await?;
        channel.close();
        tracing::debug!(peer = %peer, bytes, intact = verifier.is_intact(), "Payload received");
        Ok(TransferSummary {
            bytes,
            intact: Some(verifier.is_intact()),
        })
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{IpAddr, Ipv4Addr};
    use std::time::Duration;
    use tokio::io::AsyncWriteExt;
    use tokio::net::TcpStream;

    const LOCALHOST: IpAddr = IpAddr::V4(Ipv4Addr::LOCALHOST);

    async fn next(rx: &mut mpsc::Receiver<WorkerMessage>) -> WorkerReport {
        tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .unwrap()
            .unwrap()
            .report
    }

    #[tokio::test]
    async fn test_publisher_and_subscriber_workers() {
        let pattern = PayloadPattern::new(64, 10);
        let (tx, mut pub_rx) = mpsc::channel(16);
        let listener = InboundListener::bind(PeerHandle::new(1), LOCALHOST).unwrap();
        let addr = SocketAddr::new(LOCALHOST, listener.port());
        let _publisher = spawn_publisher(PeerHandle::new(1), SessionId::new(1), listener, pattern, tx);

        let (tx, mut sub_rx) = mpsc::channel(16);
        let _subscriber = spawn_subscriber(
            PeerHandle::new(2),
            SessionId::new(2),
            addr,
            "Hello!".to_string(),
            pattern,
            tx,
        );

        assert!(matches!(next(&mut pub_rx).await, WorkerReport::Accepted { .. }));
        assert_eq!(next(&mut pub_rx).await, WorkerReport::LineReceived("Hello!".to_string()));
        assert_eq!(
            next(&mut pub_rx).await,
            WorkerReport::Finished(Ok(TransferSummary { bytes: 640, intact: None }))
        );

        assert!(matches!(next(&mut sub_rx).await, WorkerReport::Connected { .. }));
        assert_eq!(
            next(&mut sub_rx).await,
            WorkerReport::Finished(Ok(TransferSummary {
                bytes: 640,
                intact: Some(true)
            }))
        );
    }

    #[tokio::test]
    async fn test_cancel_closes_listener() {
        let (tx, mut rx) = mpsc::channel(16);
        let listener = InboundListener::bind(PeerHandle::new(1), LOCALHOST).unwrap();
        let port = listener.port();
        let worker = spawn_publisher(
            PeerHandle::new(1),
            SessionId::new(1),
            listener,
            PayloadPattern::new(4, 1),
            tx,
        );

        tokio::time::timeout(Duration::from_secs(5), worker.shutdown())
            .await
            .unwrap()
            .unwrap();
        assert!(rx.try_recv().is_err());
        assert!(TcpStream::connect((LOCALHOST, port)).await.is_err());
    }

    #[tokio::test]
    async fn test_publisher_reports_early_close() {
        let (tx, mut rx) = mpsc::channel(16);
        let listener = InboundListener::bind(PeerHandle::new(1), LOCALHOST).unwrap();
        let port = listener.port();
        let _worker = spawn_publisher(
            PeerHandle::new(1),
            SessionId::new(1),
            listener,
            PayloadPattern::new(4, 1),
            tx,
        );

        let mut client = TcpStream::connect((LOCALHOST, port)).await.unwrap();
        client.shutdown().await.unwrap();
        drop(client);

        assert!(matches!(next(&mut rx).await, WorkerReport::Accepted { .. }));
        assert!(matches!(next(&mut rx).await, WorkerReport::Finished(Err(_))));
    }
}

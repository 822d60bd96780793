//! Socket transport between connected peers.

pub mod channel;
pub mod inbound;
pub mod outbound;
pub mod payload;
pub mod worker;

pub use channel::{TransportChannel, MAX_LINE_LEN};
pub use inbound::InboundListener;
pub use outbound::connect_to_peer;
pub use payload::{PayloadPattern, PayloadVerifier};
pub use worker::{
    spawn_publisher, spawn_subscriber, SessionWorker, TransferSummary, WorkerMessage, WorkerReport,
};

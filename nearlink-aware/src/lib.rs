//! Discovery-to-connection orchestration over a neighbor-awareness substrate.
//!
//! A device takes one role for its run:
//!
//! - A **publisher** advertises a named service, answers each subscriber's
//!   greeting, opens a one-shot listener and serves a fixed payload.
//! - A **subscriber** looks for the service, greets each publisher it finds,
//!   negotiates a direct network path and downloads the payload.
//!
//! Each remote peer gets its own session, so one publisher serves any number
//! of subscribers at once.
//!
//! # Architecture
//!
//! All substrate events, worker reports and commands are serialized through
//! one coordinator loop. Sessions are pure state machines driven by that loop;
//! socket work runs on runtime tasks that report back over a channel.
//!
//! ```text
//! Coordinator Task (DiscoveryCoordinator::run())
//! ├── Substrate events (attach, publish/subscribe, messages, network)
//! ├── Commands (CoordinatorHandle)
//! └── Worker reports
//!     ├── Publisher worker per peer (accept, request line, payload)
//!     └── Subscriber worker per peer (connect, request line, verify)
//! ```
//!
//! # Usage
//!
//! ```ignore
//! use std::sync::Arc;
//! use nearlink_aware::{AwareConfig, DiscoveryCoordinator, LoopbackMedium, Role, TracingSink};
//!
//! let medium = LoopbackMedium::new();
//! let coordinator = DiscoveryCoordinator::new(
//!     AwareConfig::default(),
//!     Arc::new(medium.device()),
//!     Arc::new(TracingSink),
//! );
//! let handle = coordinator.handle();
//! tokio::spawn(coordinator.run());
//!
//! handle.start(Role::Publisher).await?;
//! ```

pub mod config;
pub mod error;

pub mod coordinator;
pub mod events;
pub mod peer;
pub mod substrate;
pub mod transport;

// Re-export main types
pub use config::{AwareConfig, SendFailurePolicy, DEFAULT_PASSPHRASE, DEFAULT_SERVICE_NAME};
pub use coordinator::{
    AdvertisementState, AttachState, CoordinatorHandle, CoordinatorSnapshot,
    DiscoveryCoordinator, SessionOutcome,
};
pub use error::{AwareError, AwareResult, FailureReason};
pub use events::{ChannelSink, EventSink, LogEntry, MemorySink, SinkSet, TracingSink};
pub use peer::{PeerHandle, Role, SessionId, SessionSnapshot, SessionState};
pub use substrate::{
    AdvertisementHandle, AttachHandle, DiscoverySubstrate, LoopbackDevice, LoopbackMedium,
    NetworkEvent, NetworkInfo, NetworkRequest, NetworkRequestId, SubstrateEvent,
};
pub use transport::TransferSummary;

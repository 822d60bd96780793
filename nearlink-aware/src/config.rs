//! Aware session configuration.

use std::net::{IpAddr, Ipv4Addr};

/// Service name advertised and searched for on the discovery substrate.
pub const DEFAULT_SERVICE_NAME: &str = "org.nearlink.demo";

/// Passphrase carried in every network-path request.
///
/// Both sides must present the same value; there is no provisioning step.
pub const DEFAULT_PASSPHRASE: &str = "some_passphrase";

/// Greeting the subscriber sends once it discovers a publisher.
pub const SUBSCRIBER_GREETING: &str = "Hello from Subscriber!";

/// Greeting the publisher sends back to a subscriber.
pub const PUBLISHER_GREETING: &str = "Hello from Publisher!";

/// Line the subscriber writes on the socket before reading the payload.
pub const REQUEST_LINE: &str = "Hello!";

/// Size of one payload block in bytes.
pub const DEFAULT_BLOCK_LEN: usize = 1024;

/// Number of payload blocks the publisher writes (10 MiB in total).
pub const DEFAULT_BLOCK_COUNT: usize = 10_240;

/// Default capacity of the worker report channel.
pub const DEFAULT_REPORT_CAPACITY: usize = 256;

/// What to do when the substrate reports that a message could not be sent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SendFailurePolicy {
    /// Report through the event sink and leave the session where it is.
    #[default]
    Report,
    /// Report and terminate the session that owned the message.
    FailSession,
}

/// Configuration for a discovery coordinator.
#[derive(Debug, Clone)]
pub struct AwareConfig {
    /// Service name used for publish and subscribe.
    pub service_name: String,

    /// Passphrase for network-path negotiation.
    pub passphrase: String,

    /// Greeting text the publisher replies with.
    pub publisher_greeting: String,

    /// Greeting text the subscriber opens with.
    pub subscriber_greeting: String,

    /// Line the subscriber writes once the socket is connected.
    pub request_line: String,

    /// Local address the publisher binds its ephemeral listeners to.
    pub listen_ip: IpAddr,

    /// Length of one payload block.
    pub block_len: usize,

    /// Number of payload blocks per transfer.
    pub block_count: usize,

    /// Handling of failed message sends.
    pub send_failure_policy: SendFailurePolicy,

    /// Capacity of the worker report channel.
    pub report_capacity: usize,
}

impl Default for AwareConfig {
    fn default() -> Self {
        Self {
            service_name: DEFAULT_SERVICE_NAME.to_string(),
            passphrase: DEFAULT_PASSPHRASE.to_string(),
            publisher_greeting: PUBLISHER_GREETING.to_string(),
            subscriber_greeting: SUBSCRIBER_GREETING.to_string(),
            request_line: REQUEST_LINE.to_string(),
            listen_ip: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            block_len: DEFAULT_BLOCK_LEN,
            block_count: DEFAULT_BLOCK_COUNT,
            send_failure_policy: SendFailurePolicy::default(),
            report_capacity: DEFAULT_REPORT_CAPACITY,
        }
    }
}

impl AwareConfig {
    /// Create a configuration for the given service name.
    pub fn new(service_name: impl Into<String>) -> Self {
        Self {
            service_name: service_name.into(),
            ..Default::default()
        }
    }

    /// Set the network passphrase.
    pub fn with_passphrase(mut self, passphrase: impl Into<String>) -> Self {
        self.passphrase = passphrase.into();
        self
    }

    /// Set the address listeners bind to.
    pub fn with_listen_ip(mut self, ip: IpAddr) -> Self {
        self.listen_ip = ip;
        self
    }

    /// Set the payload shape.
    pub fn with_payload(mut self, block_len: usize, block_count: usize) -> Self {
        self.block_len = block_len;
        self.block_count = block_count;
        self
    }

    /// Set the greeting texts (publisher, subscriber).
    pub fn with_greetings(
        mut self,
        publisher: impl Into<String>,
        subscriber: impl Into<String>,
    ) -> Self {
        self.publisher_greeting = publisher.into();
        self.subscriber_greeting = subscriber.into();
        self
    }

    /// Set the subscriber's request line.
    pub fn with_request_line(mut self, line: impl Into<String>) -> Self {
        self.request_line = line.into();
        self
    }

    /// Set the send-failure policy.
    pub fn with_send_failure_policy(mut self, policy: SendFailurePolicy) -> Self {
        self.send_failure_policy = policy;
        self
    }

    /// Total payload length in bytes.
    pub fn payload_len(&self) -> u64 {
        self.block_len as u64 * self.block_count as u64
    }
}

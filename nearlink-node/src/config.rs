//! Node configuration.

use nearlink_aware::config::DEFAULT_BLOCK_LEN;
use nearlink_aware::AwareConfig;

use crate::cli::{Cli, RoleArg};

/// Complete node configuration.
#[derive(Debug, Clone)]
pub struct NodeConfig {
    /// Run a publisher.
    pub run_publisher: bool,

    /// Number of subscribers to run.
    pub subscribers: usize,

    /// Settings shared by every coordinator.
    pub aware: AwareConfig,

    /// Log level.
    pub log_level: String,

    /// Print the summary as JSON.
    pub json: bool,
}

impl NodeConfig {
    /// Create a node configuration from CLI arguments.
    pub fn from_cli(cli: &Cli) -> Self {
        let (run_publisher, subscribers) = match cli.role {
            RoleArg::Publisher => (true, 0),
            RoleArg::Subscriber => (false, cli.subscribers.max(1)),
            RoleArg::Both => (true, cli.subscribers),
        };

        let aware = AwareConfig::new(cli.service.clone())
            .with_passphrase(cli.passphrase.clone())
            .with_listen_ip(cli.listen_ip)
            .with_payload(DEFAULT_BLOCK_LEN, cli.block_count);

        Self {
            run_publisher,
            subscribers,
            aware,
            log_level: cli.log_level.clone(),
            json: cli.json,
        }
    }

    /// Sessions that must end before the run is over.
    ///
    /// `None` when one side is missing and the run lasts until interrupted.
    pub fn expected_sessions(&self) -> Option<usize> {
        if self.run_publisher && self.subscribers > 0 {
            Some(self.subscribers * 2)
        } else {
            None
        }
    }
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            run_publisher: true,
            subscribers: 1,
            aware: AwareConfig::default(),
            log_level: "info".to_string(),
            json: false,
        }
    }
}

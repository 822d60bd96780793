//! Command-line argument parsing.

use std::net::IpAddr;

use clap::{Parser, ValueEnum};

use nearlink_aware::config::DEFAULT_BLOCK_COUNT;
use nearlink_aware::{DEFAULT_PASSPHRASE, DEFAULT_SERVICE_NAME};

/// Which sides of the exchange this process runs.
#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq)]
pub enum RoleArg {
    /// Advertise the service and serve the payload.
    Publisher,
    /// Look for the service and download the payload.
    Subscriber,
    /// One publisher and `--subscribers` subscribers on the same medium.
    Both,
}

/// Nearlink discovery-to-transfer demo node.
#[derive(Parser, Debug, Clone)]
#[command(name = "nearlink-node")]
#[command(about = "Discover peers, negotiate a link and transfer a payload")]
#[command(version)]
pub struct Cli {
    /// Role to run.
    #[arg(long, value_enum, default_value = "both")]
    pub role: RoleArg,

    /// Number of subscribers to start.
    #[arg(long, default_value_t = 1)]
    pub subscribers: usize,

    /// Service name to publish or subscribe to.
    #[arg(long, default_value = DEFAULT_SERVICE_NAME)]
    pub service: String,

    /// Passphrase presented when negotiating the network path.
    #[arg(long, default_value = DEFAULT_PASSPHRASE)]
    pub passphrase: String,

    /// Address publisher listeners bind to.
    #[arg(long, default_value = "127.0.0.1")]
    pub listen_ip: IpAddr,

    /// Number of 1 KiB blocks in the payload.
    #[arg(long, default_value_t = DEFAULT_BLOCK_COUNT)]
    pub block_count: usize,

    /// Log level (trace, debug, info, warn, error).
    #[arg(long, default_value = "info")]
    pub log_level: String,

    /// Print the summary as JSON.
    #[arg(long)]
    pub json: bool,
}

impl Cli {
    /// Parse command-line arguments.
    pub fn parse_args() -> Self {
        Self::parse()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_values() {
        let cli = Cli::parse_from(["nearlink-node"]);
        assert_eq!(cli.role, RoleArg::Both);
        assert_eq!(cli.subscribers, 1);
        assert_eq!(cli.service, DEFAULT_SERVICE_NAME);
        assert_eq!(cli.passphrase, "some_passphrase");
        assert_eq!(cli.block_count, 10_240);
        assert_eq!(cli.log_level, "info");
        assert!(!cli.json);
    }

    #[test]
    fn test_role_and_subscribers() {
        let cli = Cli::parse_from(["nearlink-node", "--role", "publisher", "--subscribers", "3"]);
        assert_eq!(cli.role, RoleArg::Publisher);
        assert_eq!(cli.subscribers, 3);
    }

    #[test]
    fn test_invalid_role_rejected() {
        assert!(Cli::try_parse_from(["nearlink-node", "--role", "relay"]).is_err());
    }
}

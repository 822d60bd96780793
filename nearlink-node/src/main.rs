//! Nearlink node binary.
//!
//! Runs a publisher and its subscribers over the loopback medium, prints each
//! device's event log and a summary, and exits non-zero if a session failed.

use tracing_subscriber::EnvFilter;

use nearlink_node::cli::Cli;
use nearlink_node::config::NodeConfig;
use nearlink_node::node::{Node, RunSummary};
use nearlink_node::shutdown::spawn_signal_forwarder;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Parse CLI arguments
    let cli = Cli::parse_args();

    // Set up logging
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&cli.log_level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false)
        .init();

    tracing::info!("Nearlink Node v{}", env!("CARGO_PKG_VERSION"));

    // Build configuration
    let config = NodeConfig::from_cli(&cli);
    let json = config.json;

    // Create and run node
    let node = Node::new(config);
    let signals = spawn_signal_forwarder(node.shutdown_handle());
    let summary = node.run().await?;
    signals.abort();

    if json {
        println!("{}", serde_json::to_string_pretty(&summary)?);
    } else {
        print_summary(&summary);
    }

    if !summary.is_success() {
        anyhow::bail!("{} session(s) failed", summary.failed);
    }
    Ok(())
}

fn print_summary(summary: &RunSummary) {
    for (device, entries) in &summary.logs {
        println!("== {} ==", device);
        for entry in entries {
            println!("{}", entry);
        }
    }

    println!();
    for session in &summary.sessions {
        match (&session.error, session.bytes) {
            (Some(error), _) => println!(
                "{} {} with {}: failed in {}: {}",
                session.device, session.role, session.peer, session.stage, error
            ),
            (None, Some(bytes)) => println!(
                "{} {} with {}: {} bytes{}",
                session.device,
                session.role,
                session.peer,
                bytes,
                match session.intact {
                    Some(true) => " (intact)",
                    Some(false) => " (corrupted)",
                    None => "",
                }
            ),
            (None, None) => println!("{} {} with {}: done", session.device, session.role, session.peer),
        }
    }
    println!(
        "{} completed, {} failed{}",
        summary.completed,
        summary.failed,
        if summary.interrupted { " (interrupted)" } else { "" }
    );
}

//! Nearlink node library.
//!
//! This library provides the components for running nearlink devices on a
//! loopback medium. It is used by the `nearlink-node` binary and can also be
//! used for testing and embedding.

pub mod cli;
pub mod config;
pub mod node;
pub mod shutdown;

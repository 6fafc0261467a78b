//! Integration and end-to-end tests for Hoard.
//!
//! This crate provides:
//! - A multi-node test harness for spinning up test networks
//! - Integration tests for replication, fetching, and peer lifecycle
//! - Wire-level tests that talk to a node over a raw socket

pub mod harness;
pub mod node;

pub use harness::TestNetwork;
pub use node::{TestNode, TestNodeConfig};

/// Result type used by the harness.
pub type TestResult<T> = Result<T, Box<dyn std::error::Error + Send + Sync>>;

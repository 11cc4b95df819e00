//! dpserve core - coordination layer for data-parallel inference clusters
//!
//! This crate provides:
//! - Rank assignment and sealing on the head node
//! - Discovery and control channels between head and child nodes
//! - Worker groups hosting local shard slots
//! - Key-hash request routing with failover
//! - A public serving endpoint and an orchestrator batch driver

pub mod api;
pub mod config;
pub mod coordinator;
pub mod discovery;
pub mod error;
pub mod logging;
pub mod metrics;
pub mod node;
pub mod orchestrator;
pub mod request;
pub mod router;
pub mod runtime;
pub mod worker;

pub use error::{ClusterError, Result};
pub use node::{ChildNode, HeadNode};

/// Protocol version for compatibility checking
pub const PROTOCOL_VERSION: u32 = 1;

/// Default heartbeat interval in seconds
pub const DEFAULT_HEARTBEAT_INTERVAL_SECS: u64 = 5;

/// Default heartbeat timeout in seconds
pub const DEFAULT_HEARTBEAT_TIMEOUT_SECS: u64 = 15;

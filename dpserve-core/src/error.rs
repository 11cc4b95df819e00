//! Error types for dpserve
//!
//! Error taxonomy covering bring-up, discovery, routing, and
//! per-request failures.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::coordinator::rank_table::GlobalRank;

/// Primary error type for all cluster coordination operations
#[derive(Debug, Clone, Error, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ClusterError {
    // ========== Configuration Errors ==========

    /// Startup configuration failed validation
    #[error("Invalid configuration: {reason}")]
    InvalidConfiguration { reason: String },

    // ========== Bring-up Errors ==========

    /// Requested rank range overlaps a registered one
    #[error("Ranks {start}..{end} overlap ranks already held by {owner}")]
    DuplicateRank { start: GlobalRank, end: GlobalRank, owner: String },

    /// Requested rank range falls outside the declared cluster
    #[error("Ranks {start}..{end} fall outside cluster ranks {base}..{limit}")]
    RankOutOfRange {
        start: GlobalRank,
        end: GlobalRank,
        base: GlobalRank,
        limit: GlobalRank,
    },

    /// Registration attempted after the table was sealed
    #[error("Rank table is sealed, registration from {node} refused")]
    TableSealed { node: String },

    /// Seal attempted before every rank registered
    #[error("Incomplete cluster: {registered} of {expected} ranks registered")]
    IncompleteCluster { registered: u32, expected: u32 },

    /// Cluster did not form before the startup deadline
    #[error("Cluster failed to start within {waited_secs}s: {registered} of {expected} ranks registered")]
    ClusterStartupTimeout { registered: u32, expected: u32, waited_secs: u64 },

    /// A worker group never acknowledged the sealed table
    #[error("Node {node} did not acknowledge the sealed table after {attempts} attempts")]
    BroadcastUnacknowledged { node: String, attempts: u32 },

    /// The head coordinator refused an announce
    #[error("Announce rejected: {reason}")]
    Rejected { reason: String },

    // ========== Routing Errors ==========

    /// Every shard is unreachable or still starting
    #[error("No healthy shards available")]
    NoHealthyShards,

    /// Request produced no result before its deadline
    #[error("Request {request_id} timed out")]
    RequestTimeout { request_id: u64 },

    /// Shard call failed at the transport level
    #[error("Transport failure to rank {rank}: {reason}")]
    RequestTransportFailure { rank: GlobalRank, reason: String },

    /// Request was cancelled by its caller
    #[error("Request {request_id} cancelled")]
    RequestCancelled { request_id: u64 },

    /// Rank is not part of the sealed table
    #[error("Rank {rank} is not in the sealed table")]
    UnknownRank { rank: GlobalRank },

    /// Weight update older than the active version
    #[error("Stale weight version: active {active}, received {received}")]
    StaleWeightVersion { active: u64, received: u64 },

    // ========== Protocol Errors ==========

    /// Protocol version mismatch
    #[error("Protocol version mismatch: server={server}, client={client}")]
    VersionMismatch { server: u32, client: u32 },

    /// Connection failed
    #[error("Connection to {endpoint} failed: {reason}")]
    ConnectionFailed { endpoint: String, reason: String },

    /// Invalid message format
    #[error("Invalid message: {reason}")]
    InvalidMessage { reason: String },

    // ========== Runtime Errors ==========

    /// Shutdown in progress
    #[error("Shutdown in progress")]
    ShutdownInProgress,

    /// Internal error
    #[error("Internal error: {message}")]
    Internal { message: String },
}

impl ClusterError {
    /// Returns true if this error must abort the process during bring-up
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            ClusterError::InvalidConfiguration { .. }
                | ClusterError::DuplicateRank { .. }
                | ClusterError::RankOutOfRange { .. }
                | ClusterError::IncompleteCluster { .. }
                | ClusterError::ClusterStartupTimeout { .. }
                | ClusterError::BroadcastUnacknowledged { .. }
                | ClusterError::Rejected { .. }
                | ClusterError::VersionMismatch { .. }
        )
    }

    /// Returns true if this error is retryable
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ClusterError::ConnectionFailed { .. }
                | ClusterError::RequestTransportFailure { .. }
                | ClusterError::NoHealthyShards
        )
    }
}

/// Result type alias for cluster operations
pub type Result<T> = std::result::Result<T, ClusterError>;

//! Wire types for the internal control channel
//!
//! JSON bodies exchanged between the head coordinator and worker groups.
//! Errors travel as a tagged [`ClusterError`] inside [`WireError`].

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::coordinator::rank_table::{GlobalRank, NodeDescriptor, RankRange};
use crate::error::ClusterError;
use crate::request::InferenceRequest;
use crate::router::health::ShardHealth;
use crate::worker::state::WorkerPhase;

/// Route paths shared by server and client
pub mod paths {
    pub const ANNOUNCE: &str = "/discovery/announce";
    pub const SEALED: &str = "/control/sealed";
    pub const DRAIN: &str = "/control/drain";
    pub const HEALTH: &str = "/control/health";
    pub const SHARD_INFER: &str = "/shard/infer";
    pub const SHARD_CANCEL: &str = "/shard/cancel";
    pub const SHARD_WEIGHTS: &str = "/shard/weights";
}

/// A child node asking for its ranks
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AnnounceRequest {
    pub protocol_version: u32,
    pub node: NodeDescriptor,
    pub requested_local_rank_count: u32,
    pub start_rank_hint: Option<GlobalRank>,
    /// Cluster size the child was started with
    pub declared_total: u32,
    pub tensor_parallel_size: u32,
}

/// Head's answer to an announce
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum AnnounceResponse {
    Assigned {
        range: RankRange,
        tensor_parallel_size: u32,
        total: u32,
    },
    Reject {
        reason: String,
    },
}

/// Acknowledgement of a sealed table delivery
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SealAck {
    pub node: NodeDescriptor,
    /// Ranks the node will serve according to the table it received
    pub ranks: Vec<GlobalRank>,
}

/// Ask a node to stop taking work and wait for in-flight requests
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DrainRequest {
    pub deadline_ms: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DrainResponse {
    /// True when no request was left in flight
    pub drained: bool,
    pub in_flight: usize,
}

/// Per-rank entry of a heartbeat
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShardStatus {
    pub rank: GlobalRank,
    pub health: ShardHealth,
    pub in_flight: usize,
}

/// Heartbeat returned by `GET /control/health`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HealthReport {
    pub node: NodeDescriptor,
    pub phase: WorkerPhase,
    pub shards: Vec<ShardStatus>,
    pub weight_version: Option<u64>,
    pub reported_at: DateTime<Utc>,
}

/// Inference call addressed to one rank
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ShardCall {
    pub rank: GlobalRank,
    pub request: InferenceRequest,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CancelRequest {
    pub request_id: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CancelResponse {
    /// False when the request was not in flight
    pub cancelled: bool,
}

/// Weight update addressed to one rank
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WeightPush {
    pub rank: GlobalRank,
    pub update: crate::request::WeightUpdate,
}

/// Error body used by every control route
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WireError {
    pub error: ClusterError,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_announce_response_tagging() {
        let reject = AnnounceResponse::Reject { reason: "sealed".into() };
        let json = serde_json::to_value(&reject).unwrap();
        assert_eq!(json["status"], "reject");

        let assigned: AnnounceResponse = serde_json::from_str(
            r#"{"status":"assigned","range":{"start":8,"end":12},"tensor_parallel_size":2,"total":12}"#,
        )
        .unwrap();
        assert_eq!(
            assigned,
            AnnounceResponse::Assigned {
                range: RankRange::new(8, 4),
                tensor_parallel_size: 2,
                total: 12,
            }
        );
    }
}

//! Request and weight-update payloads
//!
//! Payloads are opaque JSON to this crate; only the routing key and the
//! request id are interpreted.

use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};

use crate::coordinator::rank_table::GlobalRank;

/// One inference request as seen by the router
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InferenceRequest {
    /// Monotonically increasing id, used to detect retried requests
    pub request_id: u64,
    /// Value hashed to pick the owning shard
    pub routing_key: String,
    /// Opaque model input
    #[serde(default)]
    pub payload: serde_json::Value,
}

impl InferenceRequest {
    pub fn new(request_id: u64, routing_key: impl Into<String>, payload: serde_json::Value) -> Self {
        Self {
            request_id,
            routing_key: routing_key.into(),
            payload,
        }
    }
}

/// Result produced by the shard that served a request
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InferenceResult {
    pub request_id: u64,
    /// Rank that produced the output
    pub rank: GlobalRank,
    /// Opaque model output
    pub output: serde_json::Value,
}

/// New weights pushed by the trainer loop
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WeightUpdate {
    /// Strictly increasing weight version
    pub version: u64,
    /// Where the engine should load the weights from
    pub source: String,
}

/// Hands out monotonically increasing request ids
#[derive(Debug, Default)]
pub struct RequestIdGenerator {
    next: AtomicU64,
}

impl RequestIdGenerator {
    pub fn new() -> Self {
        Self::starting_at(1)
    }

    pub fn starting_at(first: u64) -> Self {
        Self {
            next: AtomicU64::new(first),
        }
    }

    pub fn next_id(&self) -> u64 {
        self.next.fetch_add(1, Ordering::Relaxed)
    }

    /// Make sure future ids stay above an id supplied by a client
    pub fn observe(&self, id: u64) {
        self.next.fetch_max(id + 1, Ordering::Relaxed);
    }
}

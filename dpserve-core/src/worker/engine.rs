//! Model engine interface
//!
//! The forward pass and weight loading live outside this crate. A worker
//! group drives one engine per process and addresses it by shard slot.

use std::time::Duration;

use async_trait::async_trait;
use serde_json::json;
use tokio_util::sync::CancellationToken;

use crate::coordinator::rank_table::{GlobalRank, TensorParallelGroup};
use crate::error::{ClusterError, Result};
use crate::request::{InferenceRequest, WeightUpdate};

/// One local shard slot handed to the engine
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ShardSlot {
    pub rank: GlobalRank,
    pub local_rank: u32,
    pub tp_group: TensorParallelGroup,
}

/// Model serving backend for a worker group
#[async_trait]
pub trait InferenceEngine: Send + Sync + 'static {
    /// Run one request on `slot`. Implementations should stop early once
    /// `cancel` fires.
    async fn infer(
        &self,
        slot: ShardSlot,
        request: &InferenceRequest,
        cancel: CancellationToken,
    ) -> Result<serde_json::Value>;

    /// Load new weights on every slot
    async fn load_weights(&self, update: &WeightUpdate) -> Result<()>;
}

/// Loopback engine that echoes payloads back, for dry runs and wiring tests
#[derive(Debug, Clone, Default)]
pub struct EchoEngine {
    latency: Duration,
}

impl EchoEngine {
    pub fn new() -> Self {
        Self::default()
    }

    /// Delay every response by `latency`
    pub fn with_latency(latency: Duration) -> Self {
        Self { latency }
    }
}

#[async_trait]
impl InferenceEngine for EchoEngine {
    async fn infer(
        &self,
        slot: ShardSlot,
        request: &InferenceRequest,
        cancel: CancellationToken,
    ) -> Result<serde_json::Value> {
        if !self.latency.is_zero() {
            tokio::select! {
                _ = tokio::time::sleep(self.latency) => {}
                _ = cancel.cancelled() => {
                    return Err(ClusterError::RequestCancelled { request_id: request.request_id });
                }
            }
        }

        Ok(json!({
            "echo": request.payload,
            "rank": slot.rank,
            "devices": [slot.tp_group.devices().start, slot.tp_group.devices().end],
        }))
    }

    async fn load_weights(&self, _update: &WeightUpdate) -> Result<()> {
        Ok(())
    }
}

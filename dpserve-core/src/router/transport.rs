//! Shard transports
//!
//! How the router reaches a rank: in-process for the head's own shards,
//! HTTP to the owning node's control listener for everything else.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::coordinator::rank_table::{GlobalRank, SealedRankTable};
use crate::discovery::protocol::{paths, CancelRequest, ShardCall, WeightPush, WireError};
use crate::error::{ClusterError, Result};
use crate::request::{InferenceRequest, InferenceResult, WeightUpdate};

/// Delivers calls to one rank
#[async_trait]
pub trait ShardTransport: Send + Sync {
    /// Run `request` on `rank`. Firing `cancel` must abort the call on the
    /// shard, not only locally.
    async fn infer(
        &self,
        rank: GlobalRank,
        request: InferenceRequest,
        cancel: CancellationToken,
    ) -> Result<InferenceResult>;

    /// Push new weights to the node serving `rank`
    async fn push_weights(&self, rank: GlobalRank, update: &WeightUpdate) -> Result<()>;
}

/// HTTP transport to remote worker groups
pub struct HttpShardTransport {
    client: Client,
    table: Arc<SealedRankTable>,
}

impl HttpShardTransport {
    pub fn new(table: Arc<SealedRankTable>, connect_timeout: Duration) -> Result<Self> {
        let client = Client::builder()
            .connect_timeout(connect_timeout)
            .build()
            .map_err(|e| ClusterError::Internal {
                message: format!("Failed to create HTTP client: {}", e),
            })?;
        Ok(Self { client, table })
    }

    fn base_url(&self, rank: GlobalRank) -> Result<String> {
        Ok(self.table.lookup(rank)?.node.control_url())
    }

    async fn post<B, R>(&self, rank: GlobalRank, path: &str, body: &B) -> Result<R>
    where
        B: Serialize + Sync,
        R: DeserializeOwned,
    {
        let url = format!("{}{}", self.base_url(rank)?, path);
        let transport_failure = |reason: String| ClusterError::RequestTransportFailure { rank, reason };

        let resp = self
            .client
            .post(&url)
            .json(body)
            .send()
            .await
            .map_err(|e| transport_failure(e.to_string()))?;

        let status = resp.status();
        if status.is_success() {
            return resp
                .json::<R>()
                .await
                .map_err(|e| transport_failure(format!("bad response body: {}", e)));
        }

        match resp.json::<WireError>().await {
            Ok(wire) => Err(wire.error),
            Err(_) => Err(transport_failure(format!("status {}", status))),
        }
    }
}

#[async_trait]
impl ShardTransport for HttpShardTransport {
    async fn infer(
        &self,
        rank: GlobalRank,
        request: InferenceRequest,
        cancel: CancellationToken,
    ) -> Result<InferenceResult> {
        let request_id = request.request_id;
        let call_token = cancel.child_token();
        let done = CancellationToken::new();

        // Tell the shard when the call is abandoned, including when this
        // future is dropped mid-flight.
        {
            let client = self.client.clone();
            let url = format!("{}{}", self.base_url(rank)?, paths::SHARD_CANCEL);
            let call_token = call_token.clone();
            let done = done.clone();
            tokio::spawn(async move {
                tokio::select! {
                    biased;
                    _ = done.cancelled() => {}
                    _ = call_token.cancelled() => {
                        match client.post(&url).json(&CancelRequest { request_id }).send().await {
                            Ok(_) => debug!(rank, request_id, "Propagated cancellation to shard"),
                            Err(e) => warn!(rank, request_id, "Failed to propagate cancellation: {}", e),
                        }
                    }
                }
            });
        }
        let _abandon_guard = call_token.clone().drop_guard();

        let call = ShardCall { rank, request };
        tokio::select! {
            result = self.post::<_, InferenceResult>(rank, paths::SHARD_INFER, &call) => {
                done.cancel();
                result
            }
            _ = call_token.cancelled() => Err(ClusterError::RequestCancelled { request_id }),
        }
    }

    async fn push_weights(&self, rank: GlobalRank, update: &WeightUpdate) -> Result<()> {
        let push = WeightPush { rank, update: update.clone() };
        self.post::<_, serde_json::Value>(rank, paths::SHARD_WEIGHTS, &push)
            .await
            .map(|_| ())
    }
}

/// Sends local ranks to an in-process transport and the rest over the network
pub struct SplitTransport {
    local_ranks: HashSet<GlobalRank>,
    local: Arc<dyn ShardTransport>,
    remote: Arc<dyn ShardTransport>,
}

impl SplitTransport {
    pub fn new(
        local_ranks: impl IntoIterator<Item = GlobalRank>,
        local: Arc<dyn ShardTransport>,
        remote: Arc<dyn ShardTransport>,
    ) -> Self {
        Self {
            local_ranks: local_ranks.into_iter().collect(),
            local,
            remote,
        }
    }

    fn pick(&self, rank: GlobalRank) -> &Arc<dyn ShardTransport> {
        if self.local_ranks.contains(&rank) {
            &self.local
        } else {
            &self.remote
        }
    }
}

#[async_trait]
impl ShardTransport for SplitTransport {
    async fn infer(
        &self,
        rank: GlobalRank,
        request: InferenceRequest,
        cancel: CancellationToken,
    ) -> Result<InferenceResult> {
        self.pick(rank).infer(rank, request, cancel).await
    }

    async fn push_weights(&self, rank: GlobalRank, update: &WeightUpdate) -> Result<()> {
        self.pick(rank).push_weights(rank, update).await
    }
}

//! Request routing across data-parallel shards
//!
//! The router owns the shard health map and routes every request against
//! the sealed rank table. Routing is read-mostly; health updates are the
//! only hot writes.

pub mod health;
pub mod heartbeat;
pub mod selector;
pub mod transport;

use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

use crate::coordinator::rank_table::{GlobalRank, SealedRankTable};
use crate::coordinator::weight_sync::{WeightSyncReport, WeightSyncTracker};
use crate::error::{ClusterError, Result};
use crate::metrics::standard;
use crate::request::{InferenceRequest, InferenceResult, RequestIdGenerator, WeightUpdate};

pub use health::{HeartbeatConfig, ShardEndpoint, ShardHealth, ShardHealthMap};
pub use heartbeat::HeartbeatMonitor;
pub use selector::ShardSelector;
pub use transport::{HttpShardTransport, ShardTransport, SplitTransport};

struct InflightCall {
    rank: GlobalRank,
    token: CancellationToken,
    force_closed: Arc<AtomicBool>,
}

/// In-flight shard calls, so draining can close them
#[derive(Default)]
struct InflightRegistry {
    next_call: AtomicU64,
    calls: Mutex<HashMap<u64, InflightCall>>,
}

/// Removes its call from the registry on drop
struct InflightGuard<'a> {
    registry: &'a InflightRegistry,
    call_id: u64,
    force_closed: Arc<AtomicBool>,
}

impl InflightRegistry {
    fn register(&self, rank: GlobalRank, token: CancellationToken) -> InflightGuard<'_> {
        let call_id = self.next_call.fetch_add(1, Ordering::Relaxed);
        let force_closed = Arc::new(AtomicBool::new(false));
        self.calls.lock().insert(
            call_id,
            InflightCall {
                rank,
                token,
                force_closed: force_closed.clone(),
            },
        );
        standard::INFLIGHT_REQUESTS.inc();
        InflightGuard {
            registry: self,
            call_id,
            force_closed,
        }
    }

    fn force_close(&self, rank: GlobalRank) -> usize {
        let calls = self.calls.lock();
        let mut closed = 0;
        for call in calls.values().filter(|c| c.rank == rank) {
            call.force_closed.store(true, Ordering::Release);
            call.token.cancel();
            closed += 1;
        }
        closed
    }

    fn len(&self) -> usize {
        self.calls.lock().len()
    }
}

impl InflightGuard<'_> {
    fn force_closed(&self) -> bool {
        self.force_closed.load(Ordering::Acquire)
    }
}

impl Drop for InflightGuard<'_> {
    fn drop(&mut self) {
        self.registry.calls.lock().remove(&self.call_id);
        standard::INFLIGHT_REQUESTS.dec();
    }
}

/// Routes inference requests to exactly one data-parallel shard
pub struct RequestRouter {
    table: Arc<SealedRankTable>,
    health: Arc<ShardHealthMap>,
    selector: ShardSelector,
    transport: Arc<dyn ShardTransport>,
    inflight: InflightRegistry,
    ids: RequestIdGenerator,
    weights: WeightSyncTracker,
    closing: AtomicBool,
}

impl RequestRouter {
    /// Router over `table` with every shard starting `Ready`
    pub fn new(table: Arc<SealedRankTable>, transport: Arc<dyn ShardTransport>) -> Self {
        let health = Arc::new(ShardHealthMap::new(&table, ShardHealth::Ready));
        Self::with_health(table, health, transport)
    }

    pub fn with_health(
        table: Arc<SealedRankTable>,
        health: Arc<ShardHealthMap>,
        transport: Arc<dyn ShardTransport>,
    ) -> Self {
        standard::ROUTABLE_SHARDS.set(health.routable_count() as i64);
        Self {
            selector: ShardSelector::new(table.clone()),
            table,
            health,
            transport,
            inflight: InflightRegistry::default(),
            ids: RequestIdGenerator::new(),
            weights: WeightSyncTracker::new(),
            closing: AtomicBool::new(false),
        }
    }

    pub fn table(&self) -> &Arc<SealedRankTable> {
        &self.table
    }

    pub fn health(&self) -> &Arc<ShardHealthMap> {
        &self.health
    }

    /// Fresh id for a request submitted without one
    pub fn next_request_id(&self) -> u64 {
        self.ids.next_id()
    }

    /// Keep generated ids above a client-supplied id
    pub fn observe_request_id(&self, id: u64) {
        self.ids.observe(id);
    }

    /// Select the shard for `request` without calling it
    pub fn route(&self, request: &InferenceRequest) -> Result<ShardEndpoint> {
        let rank = self.selector.select(&request.routing_key, &self.health, &[])?;
        self.health
            .endpoint(rank)
            .ok_or(ClusterError::UnknownRank { rank })
    }

    /// Route and execute `request`.
    ///
    /// A transport failure marks the shard unreachable and retries once on
    /// the next healthy shard. Firing `cancel` aborts the shard call.
    pub async fn dispatch(
        &self,
        request: InferenceRequest,
        cancel: CancellationToken,
    ) -> Result<InferenceResult> {
        if self.closing.load(Ordering::Acquire) {
            return Err(ClusterError::ShutdownInProgress);
        }

        let started = Instant::now();
        let first = self.selector.select(&request.routing_key, &self.health, &[])?;
        standard::REQUESTS_ROUTED.inc();

        let result = match self.call_shard(first, &request, &cancel).await {
            Err(ClusterError::RequestTransportFailure { rank, reason })
                if !cancel.is_cancelled() && !self.closing.load(Ordering::Acquire) =>
            {
                warn!(rank, request_id = request.request_id, "Shard call failed: {}", reason);
                self.mark_unreachable(rank);

                match self.selector.fallback(&self.health, &[rank]) {
                    Ok(retry_rank) => {
                        standard::REQUEST_RETRIES.inc();
                        debug!(request_id = request.request_id, retry_rank, "Retrying on next healthy shard");
                        let retried = self.call_shard(retry_rank, &request, &cancel).await;
                        if let Err(ClusterError::RequestTransportFailure { rank, .. }) = &retried {
                            self.mark_unreachable(*rank);
                        }
                        retried
                    }
                    Err(_) => Err(ClusterError::RequestTransportFailure { rank, reason }),
                }
            }
            other => other,
        };

        standard::ROUTE_LATENCY.observe_since(started);
        if result.is_err() {
            standard::REQUEST_FAILURES.inc();
        }
        result
    }

    async fn call_shard(
        &self,
        rank: GlobalRank,
        request: &InferenceRequest,
        caller: &CancellationToken,
    ) -> Result<InferenceResult> {
        let token = caller.child_token();
        let guard = self.inflight.register(rank, token.clone());
        // Dropping the dispatch future cancels the shard call too
        let _abandon_guard = token.clone().drop_guard();

        let outcome = tokio::select! {
            biased;
            _ = token.cancelled() => Err(ClusterError::RequestCancelled { request_id: request.request_id }),
            result = self.transport.infer(rank, request.clone(), token.clone()) => result,
        };

        match outcome {
            Err(ClusterError::RequestCancelled { .. }) if guard.force_closed() => {
                Err(ClusterError::RequestTransportFailure {
                    rank,
                    reason: "shard force-closed during drain".into(),
                })
            }
            other => other,
        }
    }

    /// Record a router-observed failure of `rank`
    pub fn mark_unreachable(&self, rank: GlobalRank) {
        self.health.mark_unreachable(rank);
        standard::ROUTABLE_SHARDS.set(self.health.routable_count() as i64);
    }

    /// Record a heartbeat for `rank`
    pub fn observe_heartbeat(&self, rank: GlobalRank, health: ShardHealth) -> Result<()> {
        self.health.observe_heartbeat(rank, health)?;
        standard::ROUTABLE_SHARDS.set(self.health.routable_count() as i64);
        Ok(())
    }

    /// Mark ranks silent for longer than `timeout` unreachable
    pub fn expire_stale(&self, timeout: Duration) -> Vec<GlobalRank> {
        let expired = self.health.expire_stale(timeout);
        if !expired.is_empty() {
            standard::ROUTABLE_SHARDS.set(self.health.routable_count() as i64);
        }
        expired
    }

    /// Stop accepting new requests
    pub fn begin_drain(&self) {
        self.closing.store(true, Ordering::Release);
    }

    pub fn is_draining(&self) -> bool {
        self.closing.load(Ordering::Acquire)
    }

    /// Abort every in-flight call to `rank` and exclude it from routing
    pub fn force_close(&self, rank: GlobalRank) -> usize {
        let closed = self.inflight.force_close(rank);
        self.mark_unreachable(rank);
        if closed > 0 {
            warn!(rank, closed, "Force-closed in-flight requests");
        }
        closed
    }

    /// Number of shard calls currently in flight
    pub fn in_flight(&self) -> usize {
        self.inflight.len()
    }

    /// Version acknowledged by every rank
    pub async fn weight_version(&self) -> Option<u64> {
        self.weights.active_version().await
    }

    /// Push `update` to every node, once per node
    pub async fn sync_weights(&self, update: WeightUpdate) -> Result<WeightSyncReport> {
        let mut round = self.weights.begin(update.version).await?;
        let expected: BTreeSet<GlobalRank> = self.table.ranks().collect();

        let mut pushes = JoinSet::new();
        for node in self.table.nodes() {
            let ranks = self.table.ranks_for(&node);
            let transport = self.transport.clone();
            let update = update.clone();
            pushes.spawn(async move {
                let result = match ranks.first() {
                    Some(&lead) => transport.push_weights(lead, &update).await,
                    None => Ok(()),
                };
                (ranks, result)
            });
        }

        let mut settled = BTreeSet::new();
        while let Some(joined) = pushes.join_next().await {
            match joined {
                Ok((ranks, Ok(()))) => {
                    settled.extend(ranks.iter().copied());
                    round.acknowledge(ranks);
                }
                Ok((ranks, Err(e))) => {
                    warn!(ranks = ?ranks, "Weight push failed: {}", e);
                    settled.extend(ranks.iter().copied());
                    round.fail(ranks, &e.to_string());
                }
                Err(e) => error!("Weight push task aborted: {}", e),
            }
        }

        let missing: Vec<GlobalRank> = expected.difference(&settled).copied().collect();
        if !missing.is_empty() {
            round.fail(missing, "weight push task aborted");
        }

        let report = round.finish().await;
        if report.is_complete() {
            standard::WEIGHT_VERSION.set(report.version as i64);
        }
        Ok(report)
    }
}

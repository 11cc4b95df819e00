//! Worker group
//!
//! One per process. Owns the node's shard slots, admits requests through a
//! bounded pool per slot, remembers recent results so retried request ids
//! are not executed twice, and drains in-flight work on shutdown.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::{Mutex, RwLock};
use tokio::sync::{Notify, Semaphore};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::engine::{InferenceEngine, ShardSlot};
use super::state::{WorkerPhase, WorkerState};
use crate::coordinator::rank_table::{GlobalRank, NodeDescriptor, SealedRankTable};
use crate::discovery::protocol::{DrainResponse, HealthReport, ShardStatus};
use crate::error::{ClusterError, Result};
use crate::request::{InferenceRequest, InferenceResult, WeightUpdate};
use crate::router::health::ShardHealth;
use crate::router::transport::ShardTransport;

/// Worker group tuning
#[derive(Debug, Clone)]
pub struct WorkerGroupConfig {
    /// Concurrent requests admitted per shard slot
    pub max_inflight_per_shard: usize,
    /// Completed results kept for retried request ids
    pub result_cache_size: usize,
}

impl Default for WorkerGroupConfig {
    fn default() -> Self {
        Self {
            max_inflight_per_shard: 64,
            result_cache_size: 1024,
        }
    }
}

struct LocalShard {
    slot: ShardSlot,
    permits: Arc<Semaphore>,
    in_flight: AtomicUsize,
}

/// Bounded window of completed results keyed by request id
struct ResultCache {
    capacity: usize,
    order: VecDeque<u64>,
    results: HashMap<u64, InferenceResult>,
}

impl ResultCache {
    fn new(capacity: usize) -> Self {
        Self {
            capacity,
            order: VecDeque::with_capacity(capacity),
            results: HashMap::with_capacity(capacity),
        }
    }

    fn get(&self, request_id: u64) -> Option<InferenceResult> {
        self.results.get(&request_id).cloned()
    }

    fn insert(&mut self, result: InferenceResult) {
        if self.capacity == 0 || self.results.contains_key(&result.request_id) {
            return;
        }
        if self.order.len() == self.capacity {
            if let Some(oldest) = self.order.pop_front() {
                self.results.remove(&oldest);
            }
        }
        self.order.push_back(result.request_id);
        self.results.insert(result.request_id, result);
    }
}

/// Ids cancelled before their call arrived, oldest evicted first
struct CancelledIds {
    capacity: usize,
    order: VecDeque<u64>,
    ids: HashSet<u64>,
}

impl CancelledIds {
    fn new(capacity: usize) -> Self {
        Self {
            capacity,
            order: VecDeque::new(),
            ids: HashSet::new(),
        }
    }

    fn insert(&mut self, request_id: u64) {
        if self.capacity == 0 || !self.ids.insert(request_id) {
            return;
        }
        if self.order.len() == self.capacity {
            if let Some(oldest) = self.order.pop_front() {
                self.ids.remove(&oldest);
            }
        }
        self.order.push_back(request_id);
    }

    /// Consume a tombstone, returning whether one existed
    fn take(&mut self, request_id: u64) -> bool {
        if self.ids.remove(&request_id) {
            self.order.retain(|id| *id != request_id);
            true
        } else {
            false
        }
    }
}

/// Cancellation handle of one call, registered from admission until the
/// call returns. Several calls may share a request id.
struct Registration<'a> {
    group: &'a WorkerGroup,
    request_id: u64,
    call: u64,
}

impl Drop for Registration<'_> {
    fn drop(&mut self) {
        let mut inflight = self.group.inflight.lock();
        if let Some(calls) = inflight.get_mut(&self.request_id) {
            calls.retain(|(call, _)| *call != self.call);
            if calls.is_empty() {
                inflight.remove(&self.request_id);
            }
        }
    }
}

/// Tracks one executing request; releases its counters on drop
struct Execution<'a> {
    group: &'a WorkerGroup,
    shard: &'a LocalShard,
}

impl Drop for Execution<'_> {
    fn drop(&mut self) {
        self.shard.in_flight.fetch_sub(1, Ordering::AcqRel);
        if self.group.in_flight.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.group.idle.notify_waiters();
        }
    }
}

/// The shards served by this process
pub struct WorkerGroup {
    node: NodeDescriptor,
    config: WorkerGroupConfig,
    state: WorkerState,
    engine: Arc<dyn InferenceEngine>,
    shards: OnceLock<Vec<LocalShard>>,
    health: RwLock<HashMap<GlobalRank, ShardHealth>>,
    inflight: Mutex<HashMap<u64, Vec<(u64, CancellationToken)>>>,
    cancelled: Mutex<CancelledIds>,
    next_call: AtomicU64,
    in_flight: AtomicUsize,
    idle: Notify,
    completed: Mutex<ResultCache>,
    weight_lock: tokio::sync::Mutex<()>,
}

impl WorkerGroup {
    pub fn new(node: NodeDescriptor, engine: Arc<dyn InferenceEngine>, config: WorkerGroupConfig) -> Self {
        let cache = ResultCache::new(config.result_cache_size);
        let cancelled = CancelledIds::new(config.result_cache_size);
        Self {
            node,
            config,
            state: WorkerState::new(),
            engine,
            shards: OnceLock::new(),
            health: RwLock::new(HashMap::new()),
            inflight: Mutex::new(HashMap::new()),
            cancelled: Mutex::new(cancelled),
            next_call: AtomicU64::new(0),
            in_flight: AtomicUsize::new(0),
            idle: Notify::new(),
            completed: Mutex::new(cache),
            weight_lock: tokio::sync::Mutex::new(()),
        }
    }

    pub fn node(&self) -> &NodeDescriptor {
        &self.node
    }

    pub fn state(&self) -> &WorkerState {
        &self.state
    }

    /// Install the sealed table and start serving.
    ///
    /// Installing the same table again is a no-op, which keeps repeated
    /// broadcasts idempotent.
    pub async fn install_table(&self, table: Arc<SealedRankTable>) -> Result<Vec<GlobalRank>> {
        table.validate()?;
        let ranks = table.ranks_for(&self.node);
        if ranks.is_empty() {
            return Err(ClusterError::InvalidMessage {
                reason: format!("sealed table assigns no ranks to {}", self.node),
            });
        }
        if let Some(assigned) = self.state.assigned().await {
            if ranks != assigned.iter().collect::<Vec<_>>() {
                return Err(ClusterError::InvalidMessage {
                    reason: format!("sealed table ranks {:?} differ from assigned {}", ranks, assigned),
                });
            }
        }

        if let Some(existing) = self.state.table() {
            if *existing == *table {
                return Ok(ranks);
            }
            return Err(ClusterError::InvalidMessage {
                reason: "a different sealed table is already installed".into(),
            });
        }

        let shards = table
            .assignments()
            .iter()
            .filter(|a| a.node == self.node)
            .map(|a| LocalShard {
                slot: ShardSlot {
                    rank: a.rank,
                    local_rank: a.local_rank,
                    tp_group: a.tp_group,
                },
                permits: Arc::new(Semaphore::new(self.config.max_inflight_per_shard)),
                in_flight: AtomicUsize::new(0),
            })
            .collect();

        if self.shards.set(shards).is_err() {
            return Ok(ranks);
        }
        {
            let mut health = self.health.write();
            for rank in &ranks {
                health.insert(*rank, ShardHealth::Ready);
            }
        }
        self.state.set_phase(WorkerPhase::Ready);
        self.state.install_table(table);

        info!(node = %self.node, ranks = ?ranks, "Worker group ready");
        Ok(ranks)
    }

    /// Ranks served locally, empty until the table is installed
    pub fn ranks(&self) -> Vec<GlobalRank> {
        self.shards
            .get()
            .map(|s| s.iter().map(|s| s.slot.rank).collect())
            .unwrap_or_default()
    }

    pub fn serves(&self, rank: GlobalRank) -> bool {
        self.shard(rank).is_some()
    }

    fn shard(&self, rank: GlobalRank) -> Option<&LocalShard> {
        self.shards.get()?.iter().find(|s| s.slot.rank == rank)
    }

    /// Report a health transition for a local rank
    pub fn set_health(&self, rank: GlobalRank, health: ShardHealth) -> Result<()> {
        if !self.serves(rank) {
            return Err(ClusterError::UnknownRank { rank });
        }
        let previous = self.health.write().insert(rank, health);
        if previous != Some(health) {
            info!(rank, from = ?previous, to = ?health, "Local shard health changed");
        }
        Ok(())
    }

    pub fn health(&self, rank: GlobalRank) -> Option<ShardHealth> {
        self.health.read().get(&rank).copied()
    }

    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::Acquire)
    }

    /// Heartbeat payload for the head coordinator
    pub fn health_report(&self) -> HealthReport {
        let health = self.health.read();
        let shards = self
            .shards
            .get()
            .map(|shards| {
                shards
                    .iter()
                    .map(|s| ShardStatus {
                        rank: s.slot.rank,
                        health: health.get(&s.slot.rank).copied().unwrap_or(ShardHealth::Starting),
                        in_flight: s.in_flight.load(Ordering::Acquire),
                    })
                    .collect()
            })
            .unwrap_or_default();

        HealthReport {
            node: self.node.clone(),
            phase: self.state.phase(),
            shards,
            weight_version: self.state.weight_version(),
            reported_at: Utc::now(),
        }
    }

    /// Run `request` on local rank `rank`
    pub async fn execute(
        &self,
        rank: GlobalRank,
        request: InferenceRequest,
        cancel: CancellationToken,
    ) -> Result<InferenceResult> {
        match self.state.phase() {
            WorkerPhase::Ready => {}
            WorkerPhase::Draining | WorkerPhase::Stopped => return Err(ClusterError::ShutdownInProgress),
            phase => {
                return Err(ClusterError::RequestTransportFailure {
                    rank,
                    reason: format!("worker group is {:?}", phase),
                })
            }
        }

        let request_id = request.request_id;
        if let Some(cached) = self.completed.lock().get(request_id) {
            debug!(request_id, "Returning cached result for retried request");
            return Ok(cached);
        }

        let shard = self.shard(rank).ok_or(ClusterError::UnknownRank { rank })?;
        if self.health(rank) == Some(ShardHealth::Unreachable) {
            return Err(ClusterError::RequestTransportFailure {
                rank,
                reason: "shard reported unreachable".into(),
            });
        }

        // Registered before queueing for a slot so a cancel can reach it there
        let token = cancel.child_token();
        let _registration = {
            let mut inflight = self.inflight.lock();
            if self.cancelled.lock().take(request_id) {
                debug!(request_id, "Request was cancelled before it arrived");
                return Err(ClusterError::RequestCancelled { request_id });
            }
            let call = self.next_call.fetch_add(1, Ordering::Relaxed);
            inflight.entry(request_id).or_default().push((call, token.clone()));
            Registration { group: self, request_id, call }
        };

        let _permit = tokio::select! {
            biased;
            _ = token.cancelled() => return Err(ClusterError::RequestCancelled { request_id }),
            permit = shard.permits.clone().acquire_owned() => permit.map_err(|_| ClusterError::ShutdownInProgress)?,
        };

        shard.in_flight.fetch_add(1, Ordering::AcqRel);
        self.in_flight.fetch_add(1, Ordering::AcqRel);
        let _execution = Execution { group: self, shard };

        let output = tokio::select! {
            biased;
            _ = token.cancelled() => Err(ClusterError::RequestCancelled { request_id }),
            output = self.engine.infer(shard.slot, &request, token.clone()) => output,
        }?;

        let result = InferenceResult { request_id, rank, output };
        self.completed.lock().insert(result.clone());
        Ok(result)
    }

    /// Cancel every call running or queued under `request_id`.
    ///
    /// Returns false if none was found. Unless the request already
    /// completed, its id is then remembered so a call arriving after the
    /// cancel is refused.
    pub fn cancel(&self, request_id: u64) -> bool {
        let inflight = self.inflight.lock();
        match inflight.get(&request_id) {
            Some(calls) => {
                for (_, token) in calls {
                    token.cancel();
                }
                debug!(request_id, calls = calls.len(), "Cancelled in-flight request");
                true
            }
            None => {
                if self.completed.lock().get(request_id).is_none() {
                    debug!(request_id, "Cancel arrived before the request");
                    self.cancelled.lock().insert(request_id);
                }
                false
            }
        }
    }

    /// Load new weights. Re-applying the active version is a no-op.
    pub async fn apply_weights(&self, update: &WeightUpdate) -> Result<()> {
        let _guard = self.weight_lock.lock().await;

        match self.state.weight_version() {
            Some(active) if active == update.version => return Ok(()),
            Some(active) if active > update.version => {
                return Err(ClusterError::StaleWeightVersion { active, received: update.version })
            }
            _ => {}
        }

        self.engine.load_weights(update).await?;
        self.state
            .advance_weight_version(update.version)
            .map_err(|active| ClusterError::StaleWeightVersion { active, received: update.version })?;

        info!(version = update.version, source = %update.source, "Weights updated");
        Ok(())
    }

    /// Refuse new requests from now on
    pub fn begin_drain(&self) {
        if self.state.phase() != WorkerPhase::Stopped {
            self.state.set_phase(WorkerPhase::Draining);
        }
    }

    /// Wait until nothing is in flight. Returns false if `deadline` passed first.
    pub async fn wait_idle(&self, deadline: Duration) -> bool {
        let idle = async {
            loop {
                let notified = self.idle.notified();
                if self.in_flight() == 0 {
                    break;
                }
                notified.await;
            }
        };
        tokio::time::timeout(deadline, idle).await.is_ok()
    }

    /// Cancel everything still running, returning how many were cancelled
    pub fn cancel_all(&self) -> usize {
        let inflight = self.inflight.lock();
        let mut cancelled = 0;
        for (_, token) in inflight.values().flatten() {
            token.cancel();
            cancelled += 1;
        }
        cancelled
    }

    /// Stop admitting work and wait for in-flight requests.
    ///
    /// Requests still running at the deadline are left alone; the head
    /// force-closes them from the router side.
    pub async fn drain(&self, deadline: Duration) -> DrainResponse {
        self.begin_drain();
        info!(node = %self.node, in_flight = self.in_flight(), "Draining worker group");

        let drained = self.wait_idle(deadline).await;
        let in_flight = self.in_flight();
        if drained {
            info!(node = %self.node, "Worker group drained");
        } else {
            warn!(node = %self.node, in_flight, "Drain deadline passed with requests in flight");
        }

        self.state.set_phase(WorkerPhase::Stopped);
        DrainResponse { drained, in_flight }
    }
}

#[async_trait]
impl ShardTransport for WorkerGroup {
    async fn infer(
        &self,
        rank: GlobalRank,
        request: InferenceRequest,
        cancel: CancellationToken,
    ) -> Result<InferenceResult> {
        self.execute(rank, request, cancel).await
    }

    async fn push_weights(&self, _rank: GlobalRank, update: &WeightUpdate) -> Result<()> {
        self.apply_weights(update).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::coordinator::rank_table::RankAssignmentTable;
    use crate::worker::engine::EchoEngine;
    use serde_json::json;

    async fn ready_group(engine: EchoEngine) -> WorkerGroup {
        ready_group_with(engine, WorkerGroupConfig::default()).await
    }

    async fn ready_group_with(engine: EchoEngine, config: WorkerGroupConfig) -> WorkerGroup {
        let node = NodeDescriptor::new("10.0.0.2", 13346, 2);
        let mut table = RankAssignmentTable::new(0, 2, 2);
        table.register(node.clone(), 2, None).unwrap();
        let group = WorkerGroup::new(node, Arc::new(engine), config);
        group.install_table(table.seal().unwrap()).await.unwrap();
        group
    }

    fn spawn_execute(
        group: &Arc<WorkerGroup>,
        rank: GlobalRank,
        request_id: u64,
    ) -> tokio::task::JoinHandle<Result<InferenceResult>> {
        let group = group.clone();
        tokio::spawn(async move {
            group
                .execute(rank, InferenceRequest::new(request_id, "k", json!(null)), CancellationToken::new())
                .await
        })
    }

    #[tokio::test]
    async fn test_execute_and_cache() {
        let group = ready_group(EchoEngine::new()).await;
        let req = InferenceRequest::new(1, "k", json!({"prompt": "hi"}));

        let first = group.execute(1, req.clone(), CancellationToken::new()).await.unwrap();
        assert_eq!(first.rank, 1);
        assert_eq!(first.output["echo"]["prompt"], "hi");
        assert_eq!(first.output["devices"], json!([2, 4]));

        // A retried id gets the cached result, even on another slot
        let again = group.execute(0, req, CancellationToken::new()).await.unwrap();
        assert_eq!(again, first);
    }

    #[tokio::test]
    async fn test_not_ready_before_table() {
        let group = WorkerGroup::new(
            NodeDescriptor::new("a", 1, 1),
            Arc::new(EchoEngine::new()),
            WorkerGroupConfig::default(),
        );
        let err = group
            .execute(0, InferenceRequest::new(1, "k", json!(null)), CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, ClusterError::RequestTransportFailure { .. }));
    }

    #[tokio::test]
    async fn test_cancel_in_flight() {
        let group = Arc::new(ready_group(EchoEngine::with_latency(Duration::from_secs(30))).await);
        let task = {
            let group = group.clone();
            tokio::spawn(async move {
                group
                    .execute(0, InferenceRequest::new(9, "k", json!(null)), CancellationToken::new())
                    .await
            })
        };

        while group.in_flight() == 0 {
            tokio::task::yield_now().await;
        }
        assert!(group.cancel(9));

        let result = task.await.unwrap();
        assert_eq!(result.unwrap_err(), ClusterError::RequestCancelled { request_id: 9 });
        assert_eq!(group.in_flight(), 0);
    }

    #[tokio::test]
    async fn test_cancel_while_queued_for_slot() {
        let config = WorkerGroupConfig {
            max_inflight_per_shard: 1,
            ..Default::default()
        };
        let group = Arc::new(ready_group_with(EchoEngine::with_latency(Duration::from_millis(300)), config).await);

        let running = spawn_execute(&group, 0, 1);
        while group.in_flight() == 0 {
            tokio::task::yield_now().await;
        }
        let queued = spawn_execute(&group, 0, 2);
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(group.in_flight(), 1);

        assert!(group.cancel(2));
        let result = tokio::time::timeout(Duration::from_millis(100), queued).await.unwrap().unwrap();
        assert_eq!(result.unwrap_err(), ClusterError::RequestCancelled { request_id: 2 });

        assert_eq!(running.await.unwrap().unwrap().request_id, 1);
        assert_eq!(group.in_flight(), 0);
    }

    #[tokio::test]
    async fn test_cancel_before_arrival_refuses_request() {
        let group = ready_group(EchoEngine::new()).await;
        assert!(!group.cancel(11));

        let refused = group
            .execute(0, InferenceRequest::new(11, "k", json!(null)), CancellationToken::new())
            .await;
        assert_eq!(refused.unwrap_err(), ClusterError::RequestCancelled { request_id: 11 });

        // The tombstone is consumed; a later retry runs
        let retried = group
            .execute(0, InferenceRequest::new(11, "k", json!(null)), CancellationToken::new())
            .await;
        assert_eq!(retried.unwrap().request_id, 11);

        // Cancelling a completed request leaves no tombstone behind
        assert!(!group.cancel(11));
        let cached = group
            .execute(1, InferenceRequest::new(11, "k", json!(null)), CancellationToken::new())
            .await;
        assert!(cached.is_ok());
    }

    #[tokio::test]
    async fn test_duplicate_ids_keep_their_own_tokens() {
        let group = Arc::new(ready_group(EchoEngine::with_latency(Duration::from_millis(400))).await);

        let first = spawn_execute(&group, 0, 7);
        tokio::time::sleep(Duration::from_millis(150)).await;
        let second = spawn_execute(&group, 1, 7);

        // The first call finishing must not unregister the second
        assert!(first.await.unwrap().is_ok());
        assert!(group.cancel(7));
        let result = second.await.unwrap();
        assert_eq!(result.unwrap_err(), ClusterError::RequestCancelled { request_id: 7 });
        assert_eq!(group.in_flight(), 0);
    }

    #[tokio::test]
    async fn test_weights_reject_stale() {
        let group = ready_group(EchoEngine::new()).await;
        let update = |version| WeightUpdate { version, source: format!("ckpt/{}", version) };

        group.apply_weights(&update(2)).await.unwrap();
        group.apply_weights(&update(2)).await.unwrap();
        assert!(matches!(
            group.apply_weights(&update(1)).await,
            Err(ClusterError::StaleWeightVersion { active: 2, received: 1 })
        ));
        assert_eq!(group.health_report().weight_version, Some(2));
    }

    #[tokio::test]
    async fn test_drain_deadline_reports_in_flight() {
        let group = Arc::new(ready_group(EchoEngine::with_latency(Duration::from_secs(30))).await);
        let task = {
            let group = group.clone();
            tokio::spawn(async move {
                group
                    .execute(1, InferenceRequest::new(4, "k", json!(null)), CancellationToken::new())
                    .await
            })
        };
        while group.in_flight() == 0 {
            tokio::task::yield_now().await;
        }

        let response = group.drain(Duration::from_millis(20)).await;
        assert!(!response.drained);
        assert_eq!(response.in_flight, 1);

        let refused = group
            .execute(0, InferenceRequest::new(5, "k", json!(null)), CancellationToken::new())
            .await;
        assert_eq!(refused.unwrap_err(), ClusterError::ShutdownInProgress);

        assert_eq!(group.cancel_all(), 1);
        assert!(task.await.unwrap().is_err());
    }

    #[tokio::test]
    async fn test_idle_drain() {
        let group = ready_group(EchoEngine::new()).await;
        let response = group.drain(Duration::from_secs(1)).await;
        assert!(response.drained);
        assert_eq!(group.state().phase(), WorkerPhase::Stopped);
    }
}

//! Head coordinator
//!
//! Runs on the node whose start rank is the cluster base. Collects
//! registrations, seals the rank table once every rank is accounted for,
//! broadcasts the sealed table to child nodes, and drives draining.

use std::sync::Arc;
use std::time::{Duration, Instant};

use reqwest::Client;
use serde::{Deserialize, Serialize};
use tokio::sync::{watch, Mutex};
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

use super::rank_table::{GlobalRank, NodeDescriptor, RankAssignmentTable, RankRange, SealedRankTable};
use crate::discovery::protocol::{paths, AnnounceRequest, AnnounceResponse, DrainRequest, DrainResponse, SealAck};
use crate::error::{ClusterError, Result};
use crate::metrics::standard;
use crate::router::RequestRouter;
use crate::worker::WorkerGroup;

const MAX_BROADCAST_BACKOFF: Duration = Duration::from_secs(5);

/// Extra time given to a child to answer a drain after its own deadline
const DRAIN_GRACE: Duration = Duration::from_secs(2);

/// Configuration for the head coordinator
#[derive(Debug, Clone)]
pub struct CoordinatorConfig {
    /// First global rank of the cluster
    pub base_rank: GlobalRank,
    /// Declared data-parallel size
    pub total_ranks: u32,
    pub tensor_parallel_size: u32,
    /// Deadline for every rank to register
    pub startup_timeout: Duration,
    /// Sealed table deliveries per node before giving up
    pub broadcast_attempts: u32,
    /// First retry delay, doubled per attempt
    pub broadcast_backoff: Duration,
    /// Hard deadline for draining
    pub drain_timeout: Duration,
    pub connect_timeout: Duration,
    pub request_timeout: Duration,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            base_rank: 0,
            total_ranks: 1,
            tensor_parallel_size: 1,
            startup_timeout: Duration::from_secs(300),
            broadcast_attempts: 5,
            broadcast_backoff: Duration::from_millis(200),
            drain_timeout: Duration::from_secs(30),
            connect_timeout: Duration::from_secs(5),
            request_timeout: Duration::from_secs(10),
        }
    }
}

/// Head coordinator lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HeadState {
    /// Accepting registrations
    WaitingForRegistrations,
    /// Every rank registered, sealing and broadcasting
    Sealing,
    /// Table sealed and acknowledged everywhere
    Ready,
    /// Refusing new work
    Draining,
    Stopped,
}

/// Outcome of a cluster drain
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DrainReport {
    /// Nodes that reported zero in-flight requests in time
    pub confirmed: Vec<NodeDescriptor>,
    /// Ranks whose in-flight calls were force-closed
    pub force_closed: Vec<GlobalRank>,
}

/// Single owner of the rank table during bring-up
pub struct HeadCoordinator {
    config: CoordinatorConfig,
    node: NodeDescriptor,
    table: Mutex<RankAssignmentTable>,
    state: watch::Sender<HeadState>,
    client: Client,
}

impl HeadCoordinator {
    /// Create a coordinator for the head node `node`
    pub fn new(config: CoordinatorConfig, node: NodeDescriptor) -> Result<Self> {
        if config.total_ranks == 0 || config.tensor_parallel_size == 0 {
            return Err(ClusterError::InvalidConfiguration {
                reason: "cluster size and tensor-parallel size must be at least 1".into(),
            });
        }
        if config.broadcast_attempts == 0 {
            return Err(ClusterError::InvalidConfiguration {
                reason: "broadcast attempts must be at least 1".into(),
            });
        }

        let client = Client::builder()
            .connect_timeout(config.connect_timeout)
            .timeout(config.request_timeout)
            .build()
            .map_err(|e| ClusterError::Internal {
                message: format!("Failed to create HTTP client: {}", e),
            })?;

        let table = RankAssignmentTable::new(config.base_rank, config.total_ranks, config.tensor_parallel_size);
        let (state, _) = watch::channel(HeadState::WaitingForRegistrations);

        Ok(Self {
            config,
            node,
            table: Mutex::new(table),
            state,
            client,
        })
    }

    pub fn config(&self) -> &CoordinatorConfig {
        &self.config
    }

    pub fn node(&self) -> &NodeDescriptor {
        &self.node
    }

    pub fn state(&self) -> HeadState {
        *self.state.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<HeadState> {
        self.state.subscribe()
    }

    pub async fn registered_count(&self) -> u32 {
        self.table.lock().await.registered_count()
    }

    /// Register the head's own shards at the cluster base rank
    pub async fn register_local(&self) -> Result<RankRange> {
        self.register(self.node.clone(), self.node.local_shard_count, Some(self.config.base_rank))
            .await
    }

    async fn register(
        &self,
        node: NodeDescriptor,
        local_rank_count: u32,
        start_rank_hint: Option<GlobalRank>,
    ) -> Result<RankRange> {
        let mut table = self.table.lock().await;
        let range = table.register(node, local_rank_count, start_rank_hint)?;

        standard::REGISTERED_RANKS.set(table.registered_count() as i64);
        if table.is_complete() && self.state() == HeadState::WaitingForRegistrations {
            info!(total = table.total(), "All ranks registered");
            self.state.send_replace(HeadState::Sealing);
        }
        Ok(range)
    }

    /// Handle an announce from a child node
    pub async fn announce(&self, req: AnnounceRequest) -> AnnounceResponse {
        let reject = |error: ClusterError| {
            warn!(node = %req.node, "Rejecting announce: {}", error);
            AnnounceResponse::Reject { reason: error.to_string() }
        };

        if req.protocol_version != crate::PROTOCOL_VERSION {
            return reject(ClusterError::VersionMismatch {
                server: crate::PROTOCOL_VERSION,
                client: req.protocol_version,
            });
        }
        if req.declared_total != self.config.total_ranks {
            return reject(ClusterError::InvalidConfiguration {
                reason: format!(
                    "node declares {} data-parallel ranks, cluster has {}",
                    req.declared_total, self.config.total_ranks
                ),
            });
        }
        if req.tensor_parallel_size != self.config.tensor_parallel_size {
            return reject(ClusterError::InvalidConfiguration {
                reason: format!(
                    "node uses tensor-parallel size {}, cluster uses {}",
                    req.tensor_parallel_size, self.config.tensor_parallel_size
                ),
            });
        }
        if req.requested_local_rank_count != req.node.local_shard_count {
            return reject(ClusterError::InvalidMessage {
                reason: "requested rank count differs from descriptor shard count".into(),
            });
        }
        if matches!(self.state(), HeadState::Draining | HeadState::Stopped) {
            return reject(ClusterError::ShutdownInProgress);
        }

        match self
            .register(req.node.clone(), req.requested_local_rank_count, req.start_rank_hint)
            .await
        {
            Ok(range) => {
                if self.state() == HeadState::Ready {
                    self.redeliver(req.node.clone()).await;
                }
                AnnounceResponse::Assigned {
                    range,
                    tensor_parallel_size: self.config.tensor_parallel_size,
                    total: self.config.total_ranks,
                }
            }
            Err(e) => reject(e),
        }
    }

    /// Send the sealed table to a node that re-announced after bring-up,
    /// e.g. a restarted child. Runs in the background so the announce
    /// reply is not held up.
    async fn redeliver(&self, node: NodeDescriptor) {
        let Some(table) = self.sealed().await else {
            return;
        };
        info!(node = %node, "Known node re-announced, resending sealed table");

        let client = self.client.clone();
        let attempts = self.config.broadcast_attempts;
        let backoff = self.config.broadcast_backoff;
        tokio::spawn(async move {
            if let Err(e) = deliver_sealed(&client, &node, &table, attempts, backoff).await {
                warn!(node = %node, "Sealed table redelivery failed: {}", e);
            }
        });
    }

    /// The sealed table, once sealing has happened
    pub async fn sealed(&self) -> Option<Arc<SealedRankTable>> {
        let mut table = self.table.lock().await;
        if table.is_sealed() {
            table.seal().ok()
        } else {
            None
        }
    }

    /// Wait for every rank, then seal and broadcast the table.
    ///
    /// Fails with `ClusterStartupTimeout` if the cluster is not populated
    /// within `timeout`, and with `BroadcastUnacknowledged` if a child never
    /// acknowledges the sealed table.
    pub async fn await_sealed(&self, timeout: Duration) -> Result<Arc<SealedRankTable>> {
        let started = Instant::now();
        let mut state = self.state.subscribe();

        let populated = tokio::time::timeout(
            timeout,
            state.wait_for(|s| *s != HeadState::WaitingForRegistrations),
        )
        .await
        .map(|changed| changed.is_ok());

        match populated {
            Ok(true) => {}
            Ok(false) => {
                return Err(ClusterError::Internal {
                    message: "head state channel closed".into(),
                })
            }
            Err(_) => {
                let registered = self.registered_count().await;
                error!(
                    registered,
                    expected = self.config.total_ranks,
                    "Cluster did not form before the startup deadline"
                );
                return Err(ClusterError::ClusterStartupTimeout {
                    registered,
                    expected: self.config.total_ranks,
                    waited_secs: timeout.as_secs(),
                });
            }
        }

        let sealed = self.table.lock().await.seal()?;
        if self.state() == HeadState::Sealing {
            self.broadcast(&sealed).await?;
            self.state.send_replace(HeadState::Ready);
            info!(
                ranks = sealed.len(),
                nodes = sealed.nodes().len(),
                elapsed_ms = started.elapsed().as_millis() as u64,
                "Cluster ready"
            );
        }
        Ok(sealed)
    }

    /// Deliver the sealed table to every child and wait for all acks
    async fn broadcast(&self, table: &Arc<SealedRankTable>) -> Result<()> {
        let mut deliveries = JoinSet::new();
        for node in table.nodes().into_iter().filter(|n| *n != self.node) {
            let client = self.client.clone();
            let table = table.clone();
            let attempts = self.config.broadcast_attempts;
            let backoff = self.config.broadcast_backoff;
            deliveries.spawn(async move { deliver_sealed(&client, &node, &table, attempts, backoff).await });
        }

        while let Some(joined) = deliveries.join_next().await {
            match joined {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    error!("Sealed table broadcast failed: {}", e);
                    deliveries.abort_all();
                    return Err(e);
                }
                Err(e) => {
                    deliveries.abort_all();
                    return Err(ClusterError::Internal {
                        message: format!("broadcast task failed: {}", e),
                    });
                }
            }
        }
        Ok(())
    }

    /// Drain the whole cluster.
    ///
    /// New requests are refused immediately. Nodes that do not report zero
    /// in-flight requests before the drain deadline have their in-flight
    /// router calls force-closed.
    pub async fn drain(&self, router: &RequestRouter, local: Option<&WorkerGroup>) -> DrainReport {
        self.state.send_replace(HeadState::Draining);
        router.begin_drain();

        let deadline = self.config.drain_timeout;
        let table = router.table().clone();
        info!(deadline_ms = deadline.as_millis() as u64, in_flight = router.in_flight(), "Draining cluster");

        let mut remotes = JoinSet::new();
        for node in table.nodes().into_iter().filter(|n| *n != self.node) {
            let client = self.client.clone();
            remotes.spawn(async move {
                let drained = request_drain(&client, &node, deadline).await;
                (node, drained)
            });
        }

        let local_drain = async {
            match local {
                Some(group) => Some((group.node().clone(), group.drain(deadline).await.drained)),
                None => None,
            }
        };
        let remote_drain = async {
            let mut results = Vec::new();
            while let Some(joined) = remotes.join_next().await {
                match joined {
                    Ok(result) => results.push(result),
                    Err(e) => error!("Drain task failed: {}", e),
                }
            }
            results
        };
        let (local_result, mut results) = tokio::join!(local_drain, remote_drain);
        results.extend(local_result);

        let mut report = DrainReport::default();
        for node in table.nodes() {
            let drained = results.iter().any(|(n, drained)| *n == node && *drained);
            if drained {
                report.confirmed.push(node);
                continue;
            }
            for rank in table.ranks_for(&node) {
                router.force_close(rank);
                report.force_closed.push(rank);
            }
        }

        if let Some(group) = local {
            if !report.force_closed.is_empty() {
                group.cancel_all();
            }
        }

        self.state.send_replace(HeadState::Stopped);
        if report.force_closed.is_empty() {
            info!(nodes = report.confirmed.len(), "Cluster drained");
        } else {
            warn!(force_closed = ?report.force_closed, "Cluster drained with force-closed ranks");
        }
        report
    }
}

async fn deliver_sealed(
    client: &Client,
    node: &NodeDescriptor,
    table: &SealedRankTable,
    attempts: u32,
    initial_backoff: Duration,
) -> Result<()> {
    let url = format!("{}{}", node.control_url(), paths::SEALED);
    let expected = table.ranks_for(node);
    let mut backoff = initial_backoff;

    for attempt in 1..=attempts {
        match client.post(&url).json(table).send().await {
            Ok(resp) if resp.status().is_success() => match resp.json::<SealAck>().await {
                Ok(ack) if ack.node == *node && ack.ranks == expected => {
                    debug!(node = %node, attempt, "Sealed table acknowledged");
                    return Ok(());
                }
                Ok(ack) => warn!(node = %node, ranks = ?ack.ranks, "Sealed table ack does not match assignment"),
                Err(e) => warn!(node = %node, "Malformed sealed table ack: {}", e),
            },
            Ok(resp) => warn!(node = %node, status = %resp.status(), attempt, "Sealed table delivery refused"),
            Err(e) => warn!(node = %node, attempt, "Sealed table delivery failed: {}", e),
        }

        if attempt < attempts {
            standard::BROADCAST_RETRIES.inc();
            tokio::time::sleep(backoff).await;
            backoff = (backoff * 2).min(MAX_BROADCAST_BACKOFF);
        }
    }

    Err(ClusterError::BroadcastUnacknowledged {
        node: node.to_string(),
        attempts,
    })
}

/// Ask a child to drain. Returns true only if it confirmed zero in-flight.
async fn request_drain(client: &Client, node: &NodeDescriptor, deadline: Duration) -> bool {
    let url = format!("{}{}", node.control_url(), paths::DRAIN);
    let body = DrainRequest {
        deadline_ms: deadline.as_millis() as u64,
    };

    let resp = client
        .post(&url)
        .json(&body)
        .timeout(deadline + DRAIN_GRACE)
        .send()
        .await;

    match resp {
        Ok(resp) if resp.status().is_success() => match resp.json::<DrainResponse>().await {
            Ok(drained) => {
                debug!(node = %node, drained = drained.drained, in_flight = drained.in_flight, "Node drain reply");
                drained.drained
            }
            Err(e) => {
                warn!(node = %node, "Malformed drain reply: {}", e);
                false
            }
        },
        Ok(resp) => {
            warn!(node = %node, status = %resp.status(), "Node refused drain");
            false
        }
        Err(e) => {
            warn!(node = %node, "Node did not confirm drain: {}", e);
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(total: u32) -> CoordinatorConfig {
        CoordinatorConfig {
            total_ranks: total,
            tensor_parallel_size: 2,
            ..Default::default()
        }
    }

    fn announce(node: NodeDescriptor, total: u32) -> AnnounceRequest {
        AnnounceRequest {
            protocol_version: crate::PROTOCOL_VERSION,
            requested_local_rank_count: node.local_shard_count,
            node,
            start_rank_hint: None,
            declared_total: total,
            tensor_parallel_size: 2,
        }
    }

    #[tokio::test]
    async fn test_single_node_cluster_seals() {
        let head = HeadCoordinator::new(config(2), NodeDescriptor::new("127.0.0.1", 13345, 2)).unwrap();
        head.register_local().await.unwrap();
        assert_eq!(head.state(), HeadState::Sealing);

        let sealed = head.await_sealed(Duration::from_secs(1)).await.unwrap();
        assert_eq!(sealed.ranks().collect::<Vec<_>>(), vec![0, 1]);
        assert_eq!(head.state(), HeadState::Ready);
    }

    #[tokio::test]
    async fn test_announce_rejects_mismatched_total() {
        let head = HeadCoordinator::new(config(4), NodeDescriptor::new("127.0.0.1", 13345, 2)).unwrap();
        let response = head.announce(announce(NodeDescriptor::new("10.0.0.2", 13346, 2), 6)).await;
        assert!(matches!(response, AnnounceResponse::Reject { .. }));
    }

    #[tokio::test]
    async fn test_announce_rejects_protocol_mismatch() {
        let head = HeadCoordinator::new(config(4), NodeDescriptor::new("127.0.0.1", 13345, 2)).unwrap();
        let mut req = announce(NodeDescriptor::new("10.0.0.2", 13346, 2), 4);
        req.protocol_version = crate::PROTOCOL_VERSION + 1;
        assert!(matches!(head.announce(req).await, AnnounceResponse::Reject { .. }));
    }

    #[tokio::test]
    async fn test_announce_is_idempotent() {
        let head = HeadCoordinator::new(config(4), NodeDescriptor::new("127.0.0.1", 13345, 2)).unwrap();
        head.register_local().await.unwrap();

        let child = NodeDescriptor::new("10.0.0.2", 13346, 2);
        let first = head.announce(announce(child.clone(), 4)).await;
        let second = head.announce(announce(child, 4)).await;
        assert_eq!(first, second);
        assert_eq!(
            first,
            AnnounceResponse::Assigned {
                range: RankRange::new(2, 2),
                tensor_parallel_size: 2,
                total: 4
            }
        );
    }

    #[tokio::test]
    async fn test_reannounce_after_seal_resends_table() {
        use axum::routing::post;
        use axum::Json;

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let child = NodeDescriptor::new("127.0.0.1", listener.local_addr().unwrap().port(), 2);
        let (delivered_tx, mut delivered) = tokio::sync::mpsc::unbounded_channel();
        let app = axum::Router::new().route(
            paths::SEALED,
            post({
                let child = child.clone();
                move |Json(table): Json<SealedRankTable>| {
                    let child = child.clone();
                    let delivered_tx = delivered_tx.clone();
                    async move {
                        let ranks = table.ranks_for(&child);
                        let _ = delivered_tx.send(ranks.clone());
                        Json(SealAck { node: child, ranks })
                    }
                }
            }),
        );
        tokio::spawn(async move { axum::serve(listener, app).await });

        let head = HeadCoordinator::new(config(4), NodeDescriptor::new("127.0.0.1", 1, 2)).unwrap();
        head.register_local().await.unwrap();
        head.announce(announce(child.clone(), 4)).await;
        head.await_sealed(Duration::from_secs(5)).await.unwrap();
        assert_eq!(delivered.recv().await.unwrap(), vec![2, 3]);

        // The restarted child announces again and gets the table pushed
        let response = head.announce(announce(child, 4)).await;
        assert!(matches!(response, AnnounceResponse::Assigned { range, .. } if range == RankRange::new(2, 2)));
        let redelivered = tokio::time::timeout(Duration::from_secs(5), delivered.recv()).await.unwrap();
        assert_eq!(redelivered, Some(vec![2, 3]));
    }

    #[tokio::test]
    async fn test_startup_timeout() {
        let head = HeadCoordinator::new(config(4), NodeDescriptor::new("127.0.0.1", 13345, 2)).unwrap();
        head.register_local().await.unwrap();

        let err = head.await_sealed(Duration::from_millis(50)).await.unwrap_err();
        assert_eq!(
            err,
            ClusterError::ClusterStartupTimeout { registered: 2, expected: 4, waited_secs: 0 }
        );
        assert!(err.is_fatal());
        assert!(head.sealed().await.is_none());
    }
}

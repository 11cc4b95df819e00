//! Request router behavior against a scripted transport
//!
//! Tests key-hash stability, single retry, cancellation and force-close.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dpserve_core::coordinator::{GlobalRank, NodeDescriptor, RankAssignmentTable, SealedRankTable};
use dpserve_core::error::{ClusterError, Result};
use dpserve_core::request::{InferenceRequest, InferenceResult, WeightUpdate};
use dpserve_core::router::{RequestRouter, ShardHealth, ShardTransport};
use parking_lot::Mutex;
use serde_json::json;
use tokio_util::sync::CancellationToken;

/// Fails `failing` ranks, hangs on `hanging` ranks, echoes on the rest
#[derive(Default)]
struct ScriptedTransport {
    failing: Mutex<HashSet<GlobalRank>>,
    hanging: Mutex<HashSet<GlobalRank>>,
    calls: Mutex<Vec<GlobalRank>>,
    saw_cancel: Arc<AtomicBool>,
}

impl ScriptedTransport {
    fn calls(&self) -> Vec<GlobalRank> {
        self.calls.lock().clone()
    }
}

#[async_trait]
impl ShardTransport for ScriptedTransport {
    async fn infer(
        &self,
        rank: GlobalRank,
        request: InferenceRequest,
        cancel: CancellationToken,
    ) -> Result<InferenceResult> {
        self.calls.lock().push(rank);

        // Observes cancellation even after this future is dropped
        let saw_cancel = self.saw_cancel.clone();
        let watch = cancel.clone();
        tokio::spawn(async move {
            watch.cancelled().await;
            saw_cancel.store(true, Ordering::SeqCst);
        });

        if self.failing.lock().contains(&rank) {
            return Err(ClusterError::RequestTransportFailure {
                rank,
                reason: "connection reset".into(),
            });
        }
        if self.hanging.lock().contains(&rank) {
            cancel.cancelled().await;
            return Err(ClusterError::RequestCancelled {
                request_id: request.request_id,
            });
        }
        Ok(InferenceResult {
            request_id: request.request_id,
            rank,
            output: request.payload,
        })
    }

    async fn push_weights(&self, _rank: GlobalRank, _update: &WeightUpdate) -> Result<()> {
        Ok(())
    }
}

/// Four single-shard nodes
fn sealed_table() -> Arc<SealedRankTable> {
    let mut table = RankAssignmentTable::new(0, 4, 1);
    for i in 0..4u16 {
        table
            .register(NodeDescriptor::new("10.0.0.1", 9000 + i, 1), 1, None)
            .unwrap();
    }
    table.seal().unwrap()
}

fn setup() -> (Arc<RequestRouter>, Arc<ScriptedTransport>) {
    let transport = Arc::new(ScriptedTransport::default());
    let router = Arc::new(RequestRouter::new(sealed_table(), transport.clone()));
    (router, transport)
}

fn request(id: u64, key: &str) -> InferenceRequest {
    InferenceRequest::new(id, key, json!({ "id": id }))
}

#[tokio::test]
async fn test_same_key_same_shard_until_unreachable_then_back() {
    let (router, _) = setup();
    let req = request(1, "user-42");

    let owner = router.route(&req).unwrap().rank;
    for _ in 0..10 {
        assert_eq!(router.route(&req).unwrap().rank, owner);
    }

    router.mark_unreachable(owner);
    let failover = router.route(&req).unwrap().rank;
    assert_ne!(failover, owner);

    // Restart: a fresh heartbeat brings the original owner back
    router.observe_heartbeat(owner, ShardHealth::Ready).unwrap();
    assert_eq!(router.route(&req).unwrap().rank, owner);
}

#[tokio::test]
async fn test_transport_failure_retries_once_on_other_shard() {
    let (router, transport) = setup();
    let req = request(7, "retry-me");
    let owner = router.route(&req).unwrap().rank;
    transport.failing.lock().insert(owner);

    let result = router.dispatch(req, CancellationToken::new()).await.unwrap();
    assert_ne!(result.rank, owner);
    assert_eq!(transport.calls(), vec![owner, result.rank]);
    assert_eq!(router.health().health(owner), Some(ShardHealth::Unreachable));
}

#[tokio::test]
async fn test_second_failure_surfaces_without_third_attempt() {
    let (router, transport) = setup();
    transport.failing.lock().extend(0..4);

    let err = router
        .dispatch(request(8, "doomed"), CancellationToken::new())
        .await
        .unwrap_err();
    assert!(matches!(err, ClusterError::RequestTransportFailure { .. }));

    let calls = transport.calls();
    assert_eq!(calls.len(), 2);
    assert_ne!(calls[0], calls[1]);
    for rank in calls {
        assert_eq!(router.health().health(rank), Some(ShardHealth::Unreachable));
    }
}

#[tokio::test]
async fn test_all_unreachable_fails_fast() {
    let (router, transport) = setup();
    for rank in 0..4 {
        router.mark_unreachable(rank);
    }

    let result = tokio::time::timeout(
        Duration::from_millis(100),
        router.dispatch(request(9, "nowhere"), CancellationToken::new()),
    )
    .await
    .expect("routing must not block");
    assert_eq!(result.unwrap_err(), ClusterError::NoHealthyShards);
    assert!(transport.calls().is_empty());
}

#[tokio::test]
async fn test_caller_cancellation_reaches_shard() {
    let (router, transport) = setup();
    transport.hanging.lock().extend(0..4);

    let cancel = CancellationToken::new();
    let call = {
        let router = router.clone();
        let cancel = cancel.clone();
        tokio::spawn(async move { router.dispatch(request(10, "slow"), cancel).await })
    };

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(router.in_flight(), 1);
    cancel.cancel();

    let result = call.await.unwrap();
    assert_eq!(result.unwrap_err(), ClusterError::RequestCancelled { request_id: 10 });
    // Cancelled calls are never retried
    assert_eq!(transport.calls().len(), 1);

    tokio::time::sleep(Duration::from_millis(20)).await;
    assert!(transport.saw_cancel.load(Ordering::SeqCst));
    assert_eq!(router.in_flight(), 0);
}

#[tokio::test]
async fn test_dropped_caller_cancels_shard_call() {
    let (router, transport) = setup();
    transport.hanging.lock().extend(0..4);

    let dispatch = router.dispatch(request(11, "abandoned"), CancellationToken::new());
    let timed_out = tokio::time::timeout(Duration::from_millis(50), dispatch).await;
    assert!(timed_out.is_err());

    tokio::time::sleep(Duration::from_millis(20)).await;
    assert!(transport.saw_cancel.load(Ordering::SeqCst));
    assert_eq!(router.in_flight(), 0);
}

#[tokio::test]
async fn test_force_close_reports_transport_failure() {
    let (router, transport) = setup();
    transport.hanging.lock().extend(0..4);

    let req = request(12, "drain-me");
    let owner = router.route(&req).unwrap().rank;
    let call = {
        let router = router.clone();
        tokio::spawn(async move { router.dispatch(req, CancellationToken::new()).await })
    };

    tokio::time::sleep(Duration::from_millis(50)).await;
    router.begin_drain();
    assert_eq!(router.force_close(owner), 1);

    let err = call.await.unwrap().unwrap_err();
    assert!(matches!(err, ClusterError::RequestTransportFailure { rank, .. } if rank == owner));
    assert_eq!(router.health().health(owner), Some(ShardHealth::Unreachable));
    // No retry once the router is closing
    assert_eq!(transport.calls().len(), 1);
}

#[tokio::test]
async fn test_draining_router_refuses_new_requests() {
    let (router, transport) = setup();
    router.begin_drain();

    let err = router
        .dispatch(request(13, "late"), CancellationToken::new())
        .await
        .unwrap_err();
    assert_eq!(err, ClusterError::ShutdownInProgress);
    assert!(transport.calls().is_empty());
}

#[tokio::test]
async fn test_request_ids_stay_above_observed() {
    let (router, _) = setup();
    let first = router.next_request_id();
    router.observe_request_id(first + 100);
    assert!(router.next_request_id() > first + 100);
}

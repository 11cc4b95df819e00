//! Control listener routes
//!
//! Internal routes a worker group serves to the head coordinator: sealed
//! table delivery, drain, heartbeat, and per-shard inference traffic.
//! Errors are returned as [`WireError`] so the caller recovers the exact
//! [`ClusterError`].

use std::sync::Arc;
use std::time::Duration;

use axum::extract::State;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use super::group::WorkerGroup;
use crate::api::error::status_for;
use crate::coordinator::rank_table::SealedRankTable;
use crate::discovery::protocol::{
    paths, CancelRequest, CancelResponse, DrainRequest, DrainResponse, HealthReport, SealAck, ShardCall,
    WeightPush, WireError,
};
use crate::error::ClusterError;
use crate::request::InferenceResult;

/// Error response for control routes
pub struct ControlError(pub ClusterError);

impl From<ClusterError> for ControlError {
    fn from(err: ClusterError) -> Self {
        ControlError(err)
    }
}

impl IntoResponse for ControlError {
    fn into_response(self) -> Response {
        (status_for(&self.0), Json(WireError { error: self.0 })).into_response()
    }
}

type ControlResult<T> = std::result::Result<Json<T>, ControlError>;

/// Routes served on a node's control port
pub fn control_routes(group: Arc<WorkerGroup>) -> Router {
    Router::new()
        .route(paths::SEALED, post(install_sealed))
        .route(paths::DRAIN, post(drain))
        .route(paths::HEALTH, get(health))
        .route(paths::SHARD_INFER, post(shard_infer))
        .route(paths::SHARD_CANCEL, post(shard_cancel))
        .route(paths::SHARD_WEIGHTS, post(shard_weights))
        .with_state(group)
}

async fn install_sealed(
    State(group): State<Arc<WorkerGroup>>,
    Json(table): Json<SealedRankTable>,
) -> ControlResult<SealAck> {
    let ranks = group.install_table(Arc::new(table)).await?;
    info!(ranks = ?ranks, "Sealed table received");
    Ok(Json(SealAck {
        node: group.node().clone(),
        ranks,
    }))
}

async fn drain(State(group): State<Arc<WorkerGroup>>, Json(req): Json<DrainRequest>) -> Json<DrainResponse> {
    Json(group.drain(Duration::from_millis(req.deadline_ms)).await)
}

async fn health(State(group): State<Arc<WorkerGroup>>) -> Json<HealthReport> {
    Json(group.health_report())
}

/// Runs one request. If the head drops the connection the handler future
/// is dropped with it, which releases the slot.
async fn shard_infer(
    State(group): State<Arc<WorkerGroup>>,
    Json(call): Json<ShardCall>,
) -> ControlResult<InferenceResult> {
    debug!(rank = call.rank, request_id = call.request.request_id, "Shard call");
    let result = group
        .execute(call.rank, call.request, CancellationToken::new())
        .await?;
    Ok(Json(result))
}

async fn shard_cancel(
    State(group): State<Arc<WorkerGroup>>,
    Json(req): Json<CancelRequest>,
) -> Json<CancelResponse> {
    Json(CancelResponse {
        cancelled: group.cancel(req.request_id),
    })
}

async fn shard_weights(
    State(group): State<Arc<WorkerGroup>>,
    Json(push): Json<WeightPush>,
) -> ControlResult<serde_json::Value> {
    if !group.serves(push.rank) {
        return Err(ClusterError::UnknownRank { rank: push.rank }.into());
    }
    group.apply_weights(&push.update).await?;
    Ok(Json(serde_json::json!({ "version": push.update.version })))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::coordinator::rank_table::{NodeDescriptor, RankAssignmentTable};
    use crate::request::{InferenceRequest, WeightUpdate};
    use crate::worker::engine::EchoEngine;
    use crate::worker::group::WorkerGroupConfig;
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use serde::de::DeserializeOwned;
    use tower::ServiceExt;

    fn sealed_for(node: &NodeDescriptor) -> SealedRankTable {
        let mut table = RankAssignmentTable::new(0, 3, 1);
        table.register(NodeDescriptor::new("10.0.0.1", 13345, 1), 1, Some(0)).unwrap();
        table.register(node.clone(), 2, None).unwrap();
        table.seal().unwrap().as_ref().clone()
    }

    fn post_json<T: serde::Serialize>(path: &str, body: &T) -> Request<Body> {
        Request::post(path)
            .header("content-type", "application/json")
            .body(Body::from(serde_json::to_vec(body).unwrap()))
            .unwrap()
    }

    async fn read_json<T: DeserializeOwned>(resp: Response) -> T {
        let body = axum::body::to_bytes(resp.into_body(), usize::MAX).await.unwrap();
        serde_json::from_slice(&body).unwrap()
    }

    #[tokio::test]
    async fn test_sealed_then_infer() {
        let node = NodeDescriptor::new("10.0.0.2", 13346, 2);
        let group = Arc::new(WorkerGroup::new(node.clone(), Arc::new(EchoEngine::new()), WorkerGroupConfig::default()));
        let app = control_routes(group.clone());

        let resp = app.clone().oneshot(post_json(paths::SEALED, &sealed_for(&node))).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let ack: SealAck = read_json(resp).await;
        assert_eq!(ack.ranks, vec![1, 2]);

        let call = ShardCall {
            rank: 2,
            request: InferenceRequest::new(7, "user-1", serde_json::json!({"n": 1})),
        };
        let resp = app.oneshot(post_json(paths::SHARD_INFER, &call)).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let result: InferenceResult = read_json(resp).await;
        assert_eq!(result.rank, 2);
        assert_eq!(result.request_id, 7);
    }

    #[tokio::test]
    async fn test_unknown_rank_is_wire_error() {
        let node = NodeDescriptor::new("10.0.0.2", 13346, 2);
        let group = Arc::new(WorkerGroup::new(node.clone(), Arc::new(EchoEngine::new()), WorkerGroupConfig::default()));
        group.install_table(Arc::new(sealed_for(&node))).await.unwrap();
        let app = control_routes(group);

        let push = WeightPush {
            rank: 0,
            update: WeightUpdate { version: 1, source: "ckpt/1".into() },
        };
        let resp = app.oneshot(post_json(paths::SHARD_WEIGHTS, &push)).await.unwrap();
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
        let wire: WireError = read_json(resp).await;
        assert_eq!(wire.error, ClusterError::UnknownRank { rank: 0 });
    }

    #[tokio::test]
    async fn test_health_report() {
        let node = NodeDescriptor::new("10.0.0.2", 13346, 2);
        let group = Arc::new(WorkerGroup::new(node.clone(), Arc::new(EchoEngine::new()), WorkerGroupConfig::default()));
        group.install_table(Arc::new(sealed_for(&node))).await.unwrap();

        let resp = control_routes(group)
            .oneshot(Request::get(paths::HEALTH).body(Body::empty()).unwrap())
            .await
            .unwrap();
        let report: HealthReport = read_json(resp).await;
        assert_eq!(report.shards.len(), 2);
        assert_eq!(report.node, node);
    }
}

//! Public serving endpoint
//!
//! Served by the head node once the cluster is ready. Inference, weight
//! and cluster routes require the API key when one is configured; health,
//! readiness and metrics are open.

pub mod error;
pub mod middleware;

use std::sync::Arc;

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use crate::coordinator::leader::{HeadCoordinator, HeadState};
use crate::coordinator::rank_table::GlobalRank;
use crate::coordinator::weight_sync::WeightSyncReport;
use crate::request::{InferenceRequest, InferenceResult, WeightUpdate};
use crate::router::{RequestRouter, ShardEndpoint};
use error::ApiError;

/// Shared state of the serving endpoint
#[derive(Clone)]
pub struct AppState {
    pub router: Arc<RequestRouter>,
    pub head: Option<Arc<HeadCoordinator>>,
    pub api_key: Option<Arc<str>>,
}

/// Body of `POST /v1/infer`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InferBody {
    /// Generated by the head when absent
    #[serde(default)]
    pub request_id: Option<u64>,
    pub routing_key: String,
    #[serde(default)]
    pub payload: serde_json::Value,
}

/// Body of `GET /v1/cluster`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClusterInfo {
    pub state: Option<HeadState>,
    pub base_rank: GlobalRank,
    pub total_ranks: usize,
    pub tensor_parallel_size: u32,
    pub weight_version: Option<u64>,
    pub in_flight: usize,
    pub shards: Vec<ShardEndpoint>,
}

pub fn create_router(state: AppState) -> Router {
    create_router_with_cors(state, CorsLayer::very_permissive())
}

pub fn create_router_with_cors(state: AppState, cors: CorsLayer) -> Router {
    let protected = Router::new()
        .route("/v1/infer", post(infer))
        .route("/v1/weights", post(sync_weights))
        .route("/v1/cluster", get(cluster))
        .route_layer(axum::middleware::from_fn_with_state(
            state.api_key.clone(),
            middleware::require_api_key,
        ))
        .route_layer(axum::middleware::from_fn_with_state(
            state.router.clone(),
            middleware::reject_while_draining,
        ));

    Router::new()
        .route("/health", get(health))
        .route("/ready", get(ready))
        .route("/metrics", get(metrics))
        .merge(protected)
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state)
}

async fn infer(
    State(state): State<AppState>,
    Json(body): Json<InferBody>,
) -> Result<Json<InferenceResult>, ApiError> {
    if body.routing_key.is_empty() {
        return Err(ApiError::InvalidRequest("routing_key must not be empty".into()));
    }

    let request_id = match body.request_id {
        Some(id) => {
            state.router.observe_request_id(id);
            id
        }
        None => state.router.next_request_id(),
    };

    // Dropped with the handler when the client disconnects
    let cancel = CancellationToken::new();
    let _disconnect_guard = cancel.clone().drop_guard();

    let request = InferenceRequest::new(request_id, body.routing_key, body.payload);
    let result = state.router.dispatch(request, cancel).await?;
    Ok(Json(result))
}

async fn sync_weights(
    State(state): State<AppState>,
    Json(update): Json<WeightUpdate>,
) -> Result<Json<WeightSyncReport>, ApiError> {
    Ok(Json(state.router.sync_weights(update).await?))
}

async fn cluster(State(state): State<AppState>) -> Json<ClusterInfo> {
    let table = state.router.table();
    Json(ClusterInfo {
        state: state.head.as_ref().map(|h| h.state()),
        base_rank: table.base_rank(),
        total_ranks: table.len(),
        tensor_parallel_size: table.tp_size(),
        weight_version: state.router.weight_version().await,
        in_flight: state.router.in_flight(),
        shards: state.router.health().snapshot(),
    })
}

async fn health() -> impl IntoResponse {
    Json(serde_json::json!({ "status": "ok" }))
}

async fn ready(State(state): State<AppState>) -> impl IntoResponse {
    let routable = state.router.health().routable_count();
    if state.router.is_draining() || routable == 0 {
        (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(serde_json::json!({ "ready": false, "routable_shards": routable })),
        )
    } else {
        (
            StatusCode::OK,
            Json(serde_json::json!({ "ready": true, "routable_shards": routable })),
        )
    }
}

async fn metrics() -> String {
    crate::metrics::gather_system_metrics()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::coordinator::rank_table::{NodeDescriptor, RankAssignmentTable};
    use crate::router::ShardTransport;
    use crate::worker::{EchoEngine, WorkerGroup, WorkerGroupConfig};
    use axum::body::Body;
    use axum::http::Request;
    use tower::ServiceExt;

    async fn test_state(api_key: Option<&str>) -> AppState {
        let node = NodeDescriptor::new("127.0.0.1", 13345, 2);
        let mut table = RankAssignmentTable::new(0, 2, 1);
        table.register(node.clone(), 2, Some(0)).unwrap();
        let sealed = table.seal().unwrap();

        let group = Arc::new(WorkerGroup::new(node, Arc::new(EchoEngine::new()), WorkerGroupConfig::default()));
        group.install_table(sealed.clone()).await.unwrap();
        let transport: Arc<dyn ShardTransport> = group;

        AppState {
            router: Arc::new(RequestRouter::new(sealed, transport)),
            head: None,
            api_key: api_key.map(Arc::from),
        }
    }

    fn infer_request(key: Option<&str>, body: serde_json::Value) -> Request<Body> {
        let mut builder = Request::post("/v1/infer").header("content-type", "application/json");
        if let Some(key) = key {
            builder = builder.header("authorization", format!("Bearer {}", key));
        }
        builder.body(Body::from(body.to_string())).unwrap()
    }

    #[tokio::test]
    async fn test_infer_generates_request_id() {
        let app = create_router(test_state(Some("secret")).await);
        let resp = app
            .oneshot(infer_request(Some("secret"), serde_json::json!({"routing_key": "a", "payload": 1})))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);

        let body = axum::body::to_bytes(resp.into_body(), usize::MAX).await.unwrap();
        let result: InferenceResult = serde_json::from_slice(&body).unwrap();
        assert_eq!(result.request_id, 1);
        assert_eq!(result.output["echo"], 1);
    }

    #[tokio::test]
    async fn test_auth_required_for_infer_only() {
        let app = create_router(test_state(Some("secret")).await);
        let resp = app
            .clone()
            .oneshot(infer_request(None, serde_json::json!({"routing_key": "a"})))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);

        let resp = app
            .oneshot(Request::get("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_draining_rejects_with_503() {
        let state = test_state(None).await;
        state.router.begin_drain();
        let app = create_router(state);

        let resp = app
            .clone()
            .oneshot(infer_request(None, serde_json::json!({"routing_key": "a"})))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::SERVICE_UNAVAILABLE);

        let resp = app
            .oneshot(Request::get("/ready").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::SERVICE_UNAVAILABLE);
    }

    #[tokio::test]
    async fn test_no_healthy_shards_maps_to_503() {
        let state = test_state(None).await;
        state.router.mark_unreachable(0);
        state.router.mark_unreachable(1);
        let app = create_router(state);

        let resp = app
            .oneshot(infer_request(None, serde_json::json!({"routing_key": "a"})))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::SERVICE_UNAVAILABLE);
    }

    #[tokio::test]
    async fn test_stale_weights_conflict() {
        let app = create_router(test_state(None).await);
        let push = |version: u64| {
            Request::post("/v1/weights")
                .header("content-type", "application/json")
                .body(Body::from(serde_json::json!({"version": version, "source": "ckpt"}).to_string()))
                .unwrap()
        };

        assert_eq!(app.clone().oneshot(push(3)).await.unwrap().status(), StatusCode::OK);
        assert_eq!(app.oneshot(push(2)).await.unwrap().status(), StatusCode::CONFLICT);
    }
}

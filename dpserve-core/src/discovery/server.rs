//! Head-side discovery listener

use std::sync::Arc;

use axum::extract::State;
use axum::routing::post;
use axum::{Json, Router};
use tracing::debug;

use super::protocol::{paths, AnnounceRequest, AnnounceResponse};
use crate::coordinator::leader::HeadCoordinator;

/// Announce route served on the head's discovery port
pub fn discovery_routes(head: Arc<HeadCoordinator>) -> Router {
    Router::new()
        .route(paths::ANNOUNCE, post(announce))
        .with_state(head)
}

async fn announce(
    State(head): State<Arc<HeadCoordinator>>,
    Json(req): Json<AnnounceRequest>,
) -> Json<AnnounceResponse> {
    debug!(node = %req.node, count = req.requested_local_rank_count, "Announce received");
    Json(head.announce(req).await)
}

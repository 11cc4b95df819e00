//! Serving endpoint middleware

use std::sync::Arc;

use axum::extract::{Request, State};
use axum::http::header::AUTHORIZATION;
use axum::http::StatusCode;
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;

use super::error::ApiError;
use crate::router::RequestRouter;

/// Requires `Authorization: Bearer <key>` when a key is configured
pub async fn require_api_key(
    State(api_key): State<Option<Arc<str>>>,
    request: Request,
    next: Next,
) -> Response {
    let Some(expected) = api_key else {
        return next.run(request).await;
    };

    let presented = request
        .headers()
        .get(AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "));

    match presented {
        Some(key) if key == &*expected => next.run(request).await,
        _ => ApiError::Unauthorized.into_response(),
    }
}

/// Rejects requests with 503 once the cluster is draining
pub async fn reject_while_draining(
    State(router): State<Arc<RequestRouter>>,
    request: Request,
    next: Next,
) -> Response {
    if router.is_draining() {
        return (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(json!({
                "error": {
                    "message": "Cluster is draining, not accepting new requests",
                    "type": "service_unavailable",
                    "code": "shutdown_in_progress"
                }
            })),
        )
            .into_response();
    }
    next.run(request).await
}

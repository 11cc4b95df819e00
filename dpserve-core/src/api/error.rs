use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde::{Deserialize, Serialize};

use crate::error::ClusterError;

/// Errors returned by the serving endpoint
#[derive(Debug)]
pub enum ApiError {
    Cluster(ClusterError),
    Unauthorized,
    InvalidRequest(String),
}

impl From<ClusterError> for ApiError {
    fn from(err: ClusterError) -> Self {
        ApiError::Cluster(err)
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: ErrorBody,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorBody {
    pub message: String,
    pub r#type: String,
    pub code: Option<String>,
    /// Structured error, so clients can recover the exact variant
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<ClusterError>,
}

/// HTTP status for a cluster error
pub fn status_for(err: &ClusterError) -> StatusCode {
    match err {
        ClusterError::InvalidConfiguration { .. }
        | ClusterError::InvalidMessage { .. }
        | ClusterError::DuplicateRank { .. }
        | ClusterError::RankOutOfRange { .. }
        | ClusterError::VersionMismatch { .. }
        | ClusterError::Rejected { .. } => StatusCode::BAD_REQUEST,
        ClusterError::UnknownRank { .. } => StatusCode::NOT_FOUND,
        ClusterError::StaleWeightVersion { .. } | ClusterError::TableSealed { .. } => StatusCode::CONFLICT,
        ClusterError::NoHealthyShards
        | ClusterError::ShutdownInProgress
        | ClusterError::IncompleteCluster { .. }
        | ClusterError::ClusterStartupTimeout { .. } => StatusCode::SERVICE_UNAVAILABLE,
        ClusterError::RequestTransportFailure { .. }
        | ClusterError::ConnectionFailed { .. }
        | ClusterError::BroadcastUnacknowledged { .. } => StatusCode::BAD_GATEWAY,
        ClusterError::RequestTimeout { .. } => StatusCode::GATEWAY_TIMEOUT,
        ClusterError::RequestCancelled { .. } => StatusCode::REQUEST_TIMEOUT,
        ClusterError::Internal { .. } => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

/// Stable machine-readable code for a cluster error
fn code_for(err: &ClusterError) -> &'static str {
    match err {
        ClusterError::InvalidConfiguration { .. } => "invalid_configuration",
        ClusterError::DuplicateRank { .. } => "duplicate_rank",
        ClusterError::RankOutOfRange { .. } => "rank_out_of_range",
        ClusterError::TableSealed { .. } => "table_sealed",
        ClusterError::IncompleteCluster { .. } => "incomplete_cluster",
        ClusterError::ClusterStartupTimeout { .. } => "cluster_startup_timeout",
        ClusterError::BroadcastUnacknowledged { .. } => "broadcast_unacknowledged",
        ClusterError::Rejected { .. } => "rejected",
        ClusterError::NoHealthyShards => "no_healthy_shards",
        ClusterError::RequestTimeout { .. } => "request_timeout",
        ClusterError::RequestTransportFailure { .. } => "request_transport_failure",
        ClusterError::RequestCancelled { .. } => "request_cancelled",
        ClusterError::UnknownRank { .. } => "unknown_rank",
        ClusterError::StaleWeightVersion { .. } => "stale_weight_version",
        ClusterError::VersionMismatch { .. } => "version_mismatch",
        ClusterError::ConnectionFailed { .. } => "connection_failed",
        ClusterError::InvalidMessage { .. } => "invalid_message",
        ClusterError::ShutdownInProgress => "shutdown_in_progress",
        ClusterError::Internal { .. } => "internal",
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, error_type, code, message, detail) = match self {
            ApiError::Cluster(err) => {
                let status = status_for(&err);
                let error_type = if status.is_server_error() {
                    "server_error"
                } else {
                    "invalid_request_error"
                };
                (status, error_type, Some(code_for(&err)), err.to_string(), Some(err))
            }
            ApiError::Unauthorized => (
                StatusCode::UNAUTHORIZED,
                "authentication_error",
                Some("invalid_api_key"),
                "Missing or invalid API key".to_string(),
                None,
            ),
            ApiError::InvalidRequest(msg) => {
                (StatusCode::BAD_REQUEST, "invalid_request_error", None, msg, None)
            }
        };

        let body = ErrorResponse {
            error: ErrorBody {
                message,
                r#type: error_type.to_string(),
                code: code.map(str::to_string),
                detail,
            },
        };

        (status, axum::Json(body)).into_response()
    }
}

//! Orchestrator loop interface
//!
//! Submits bounded batches of inference requests and triggers weight
//! synchronization, either in-process against a [`RequestRouter`] or over
//! HTTP against the head's serving endpoint.

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use reqwest::Client;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::api::error::ErrorResponse;
use crate::api::{ClusterInfo, InferBody};
use crate::coordinator::weight_sync::WeightSyncReport;
use crate::error::{ClusterError, Result};
use crate::request::{InferenceRequest, InferenceResult, WeightUpdate};
use crate::router::RequestRouter;

/// Something that can run inference requests and accept weight updates
#[async_trait]
pub trait InferenceSubmitter: Send + Sync {
    async fn submit(&self, request: InferenceRequest, cancel: CancellationToken) -> Result<InferenceResult>;

    async fn sync_weights(&self, update: WeightUpdate) -> Result<WeightSyncReport>;
}

#[async_trait]
impl InferenceSubmitter for RequestRouter {
    async fn submit(&self, request: InferenceRequest, cancel: CancellationToken) -> Result<InferenceResult> {
        self.dispatch(request, cancel).await
    }

    async fn sync_weights(&self, update: WeightUpdate) -> Result<WeightSyncReport> {
        RequestRouter::sync_weights(self, update).await
    }
}

/// Client for the head's serving endpoint
pub struct HttpOrchestratorClient {
    base_url: String,
    api_key: Option<String>,
    client: Client,
}

impl HttpOrchestratorClient {
    pub fn new(base_url: impl Into<String>, api_key: Option<String>, request_timeout: Duration) -> Result<Self> {
        let client = Client::builder()
            .timeout(request_timeout)
            .build()
            .map_err(|e| ClusterError::Internal {
                message: format!("Failed to create HTTP client: {}", e),
            })?;
        Ok(Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            api_key,
            client,
        })
    }

    fn authorize(&self, builder: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.api_key {
            Some(key) => builder.bearer_auth(key),
            None => builder,
        }
    }

    async fn read<R: DeserializeOwned>(&self, resp: reqwest::Response) -> Result<R> {
        let status = resp.status();
        if status.is_success() {
            return resp.json::<R>().await.map_err(|e| ClusterError::InvalidMessage {
                reason: format!("bad response body: {}", e),
            });
        }

        match resp.json::<ErrorResponse>().await {
            Ok(ErrorResponse { error }) => Err(error.detail.unwrap_or(ClusterError::Internal {
                message: format!("{} ({})", error.message, status),
            })),
            Err(_) => Err(ClusterError::Internal {
                message: format!("serving endpoint returned {}", status),
            }),
        }
    }

    async fn post<B: Serialize + Sync, R: DeserializeOwned>(&self, path: &str, body: &B) -> Result<R> {
        let url = format!("{}{}", self.base_url, path);
        let resp = self
            .authorize(self.client.post(&url).json(body))
            .send()
            .await
            .map_err(|e| self.connection_error(e))?;
        self.read(resp).await
    }

    fn connection_error(&self, e: reqwest::Error) -> ClusterError {
        ClusterError::ConnectionFailed {
            endpoint: self.base_url.clone(),
            reason: e.to_string(),
        }
    }

    /// Current cluster view
    pub async fn cluster_info(&self) -> Result<ClusterInfo> {
        let url = format!("{}/v1/cluster", self.base_url);
        let resp = self
            .authorize(self.client.get(&url))
            .send()
            .await
            .map_err(|e| self.connection_error(e))?;
        self.read(resp).await
    }

    /// Whether the serving endpoint reports ready
    pub async fn is_ready(&self) -> bool {
        let url = format!("{}/ready", self.base_url);
        matches!(self.client.get(&url).send().await, Ok(resp) if resp.status().is_success())
    }
}

#[async_trait]
impl InferenceSubmitter for HttpOrchestratorClient {
    /// Firing `cancel` drops the HTTP call, which the head treats as a
    /// disconnect and cancels on the shard.
    async fn submit(&self, request: InferenceRequest, cancel: CancellationToken) -> Result<InferenceResult> {
        let request_id = request.request_id;
        let body = InferBody {
            request_id: Some(request_id),
            routing_key: request.routing_key,
            payload: request.payload,
        };

        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(ClusterError::RequestCancelled { request_id }),
            result = self.post::<_, InferenceResult>("/v1/infer", &body) => result,
        }
    }

    async fn sync_weights(&self, update: WeightUpdate) -> Result<WeightSyncReport> {
        self.post("/v1/weights", &update).await
    }
}

/// Batch limits
#[derive(Debug, Clone)]
pub struct BatchConfig {
    pub max_batch_size: usize,
    /// Time allowed for the whole batch
    pub batch_timeout: Duration,
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            max_batch_size: 256,
            batch_timeout: Duration::from_secs(60),
        }
    }
}

/// Runs batches of requests against a submitter
pub struct BatchDriver {
    submitter: Arc<dyn InferenceSubmitter>,
    config: BatchConfig,
}

impl BatchDriver {
    pub fn new(submitter: Arc<dyn InferenceSubmitter>, config: BatchConfig) -> Self {
        Self { submitter, config }
    }

    /// Submit every request concurrently and wait for all results or the
    /// batch timeout. Results come back in request order; requests still
    /// running at the timeout are cancelled and reported as `RequestTimeout`.
    pub async fn run_batch(&self, requests: Vec<InferenceRequest>) -> Result<Vec<Result<InferenceResult>>> {
        if requests.len() > self.config.max_batch_size {
            return Err(ClusterError::InvalidConfiguration {
                reason: format!(
                    "batch of {} exceeds max batch size {}",
                    requests.len(),
                    self.config.max_batch_size
                ),
            });
        }

        let started = Instant::now();
        let ids: Vec<u64> = requests.iter().map(|r| r.request_id).collect();
        let mut results: Vec<Option<Result<InferenceResult>>> = ids.iter().map(|_| None).collect();

        let batch = CancellationToken::new();
        let mut calls = JoinSet::new();
        for (idx, request) in requests.into_iter().enumerate() {
            let submitter = self.submitter.clone();
            let cancel = batch.child_token();
            calls.spawn(async move { (idx, submitter.submit(request, cancel).await) });
        }

        let deadline = tokio::time::sleep(self.config.batch_timeout);
        tokio::pin!(deadline);

        loop {
            tokio::select! {
                joined = calls.join_next() => match joined {
                    Some(Ok((idx, result))) => results[idx] = Some(result),
                    Some(Err(e)) => warn!("Batch task failed: {}", e),
                    None => break,
                },
                _ = &mut deadline => {
                    debug!(pending = calls.len(), "Batch timeout, cancelling pending requests");
                    batch.cancel();
                    calls.abort_all();
                    while calls.join_next().await.is_some() {}
                    break;
                }
            }
        }

        let mut timeouts = 0usize;
        let results: Vec<Result<InferenceResult>> = results
            .into_iter()
            .zip(ids)
            .map(|(result, request_id)| {
                result.unwrap_or_else(|| {
                    timeouts += 1;
                    Err(ClusterError::RequestTimeout { request_id })
                })
            })
            .collect();

        let failed = results.iter().filter(|r| r.is_err()).count();
        info!(
            size = results.len(),
            failed,
            timeouts,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Batch finished"
        );
        Ok(results)
    }

    /// Push new weights to every shard
    pub async fn trigger_weight_sync(&self, update: WeightUpdate) -> Result<WeightSyncReport> {
        let version = update.version;
        let report = self.submitter.sync_weights(update).await?;
        if !report.is_complete() {
            warn!(version, failed = report.failed.len(), "Weight sync left ranks behind");
        }
        Ok(report)
    }
}

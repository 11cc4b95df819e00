//! Discovery client for child nodes
//!
//! Announces to the head coordinator until ranks are assigned, backing off
//! exponentially between attempts. The whole exchange is bounded by the
//! startup timeout.

use std::time::{Duration, Instant};

use reqwest::Client;
use tracing::{debug, info, warn};

use super::protocol::{paths, AnnounceRequest, AnnounceResponse};
use crate::coordinator::rank_table::RankRange;
use crate::error::{ClusterError, Result};

/// Configuration for the discovery client
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Base URL of the head's discovery listener
    pub discovery_url: String,
    /// Connection timeout
    pub connect_timeout: Duration,
    /// Per-announce request timeout
    pub request_timeout: Duration,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
    /// Give up announcing after this long
    pub startup_timeout: Duration,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            discovery_url: "http://127.0.0.1:13345".into(),
            connect_timeout: Duration::from_secs(5),
            request_timeout: Duration::from_secs(10),
            initial_backoff: Duration::from_millis(100),
            max_backoff: Duration::from_secs(5),
            startup_timeout: Duration::from_secs(300),
        }
    }
}

/// Client side of the discovery channel
pub struct DiscoveryClient {
    config: ClientConfig,
    client: Client,
}

impl DiscoveryClient {
    pub fn new(config: ClientConfig) -> Result<Self> {
        let client = Client::builder()
            .connect_timeout(config.connect_timeout)
            .timeout(config.request_timeout)
            .build()
            .map_err(|e| ClusterError::Internal {
                message: format!("Failed to create HTTP client: {}", e),
            })?;
        Ok(Self { config, client })
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    /// Send one announce
    pub async fn announce_once(&self, req: &AnnounceRequest) -> Result<AnnounceResponse> {
        let url = format!("{}{}", self.config.discovery_url, paths::ANNOUNCE);
        let resp = self
            .client
            .post(&url)
            .json(req)
            .send()
            .await
            .map_err(|e| ClusterError::ConnectionFailed {
                endpoint: self.config.discovery_url.clone(),
                reason: e.to_string(),
            })?;

        if !resp.status().is_success() {
            return Err(ClusterError::ConnectionFailed {
                endpoint: self.config.discovery_url.clone(),
                reason: format!("status {}", resp.status()),
            });
        }

        resp.json::<AnnounceResponse>()
            .await
            .map_err(|e| ClusterError::InvalidMessage {
                reason: format!("bad announce response: {}", e),
            })
    }

    /// Announce until ranks are assigned.
    ///
    /// A `Reject` is returned at once as `Rejected`. Connection failures are
    /// retried until the startup timeout, then surface as
    /// `ClusterStartupTimeout`.
    pub async fn announce(&self, req: &AnnounceRequest) -> Result<RankRange> {
        let started = Instant::now();
        let deadline = started + self.config.startup_timeout;
        let mut backoff = self.config.initial_backoff;
        let mut attempt = 0u32;

        loop {
            attempt += 1;
            match self.announce_once(req).await {
                Ok(AnnounceResponse::Assigned { range, tensor_parallel_size, total }) => {
                    check_assignment(req, range, tensor_parallel_size, total)?;
                    info!(range = %range, attempt, "Ranks assigned by head coordinator");
                    return Ok(range);
                }
                Ok(AnnounceResponse::Reject { reason }) => {
                    return Err(ClusterError::Rejected { reason });
                }
                Err(e) if e.is_retryable() => {
                    debug!(attempt, "Announce failed: {}", e);
                    if attempt % 10 == 1 {
                        warn!(url = %self.config.discovery_url, attempt, "Head coordinator not reachable yet: {}", e);
                    }
                }
                Err(e) => return Err(e),
            }

            let now = Instant::now();
            if now + backoff >= deadline {
                return Err(ClusterError::ClusterStartupTimeout {
                    registered: 0,
                    expected: req.declared_total,
                    waited_secs: now.duration_since(started).as_secs(),
                });
            }
            tokio::time::sleep(backoff).await;
            backoff = (backoff * 2).min(self.config.max_backoff);
        }
    }
}

fn check_assignment(req: &AnnounceRequest, range: RankRange, tp: u32, total: u32) -> Result<()> {
    if range.len() != req.requested_local_rank_count {
        return Err(ClusterError::InvalidMessage {
            reason: format!(
                "assigned {} ranks, requested {}",
                range.len(),
                req.requested_local_rank_count
            ),
        });
    }
    if tp != req.tensor_parallel_size || total != req.declared_total {
        return Err(ClusterError::InvalidConfiguration {
            reason: format!("head runs tp={} total={}, node runs tp={} total={}", tp, total, req.tensor_parallel_size, req.declared_total),
        });
    }
    Ok(())
}

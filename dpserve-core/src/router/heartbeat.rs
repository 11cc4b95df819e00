//! Heartbeat monitor
//!
//! Polls every node's health report on a fixed interval and feeds it into
//! the router's health map. Ranks that stay silent past the heartbeat
//! timeout are marked unreachable.

use std::sync::Arc;

use reqwest::Client;
use tokio::task::JoinSet;
use tokio::time::{interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::health::HeartbeatConfig;
use super::RequestRouter;
use crate::coordinator::rank_table::{GlobalRank, NodeDescriptor};
use crate::discovery::protocol::{paths, HealthReport};
use crate::error::{ClusterError, Result};
use crate::worker::WorkerGroup;

pub struct HeartbeatMonitor {
    router: Arc<RequestRouter>,
    local: Option<Arc<WorkerGroup>>,
    client: Client,
    config: HeartbeatConfig,
}

impl HeartbeatMonitor {
    /// `local` is the worker group in this process, read directly instead
    /// of over HTTP
    pub fn new(
        router: Arc<RequestRouter>,
        local: Option<Arc<WorkerGroup>>,
        config: HeartbeatConfig,
    ) -> Result<Self> {
        let client = Client::builder()
            .timeout(config.interval)
            .build()
            .map_err(|e| ClusterError::Internal {
                message: format!("Failed to create HTTP client: {}", e),
            })?;
        Ok(Self {
            router,
            local,
            client,
            config,
        })
    }

    /// Poll every node once, then expire silent ranks. Returns newly expired ranks.
    pub async fn poll_once(&self) -> Vec<GlobalRank> {
        let table = self.router.table().clone();
        let mut polls = JoinSet::new();

        for node in table.nodes() {
            match &self.local {
                Some(group) if *group.node() == node => self.apply(group.health_report()),
                _ => {
                    let client = self.client.clone();
                    polls.spawn(async move {
                        let report = fetch_report(&client, &node).await;
                        (node, report)
                    });
                }
            }
        }

        while let Some(joined) = polls.join_next().await {
            match joined {
                Ok((_, Ok(report))) => self.apply(report),
                Ok((node, Err(e))) => debug!(node = %node, "Heartbeat poll failed: {}", e),
                Err(e) => warn!("Heartbeat task failed: {}", e),
            }
        }

        self.router.expire_stale(self.config.timeout)
    }

    fn apply(&self, report: HealthReport) {
        for shard in report.shards {
            if let Err(e) = self.router.observe_heartbeat(shard.rank, shard.health) {
                warn!(node = %report.node, "Ignoring heartbeat entry: {}", e);
            }
        }
    }

    /// Poll until `cancel` fires
    pub async fn run(self, cancel: CancellationToken) {
        info!(
            interval_ms = self.config.interval.as_millis() as u64,
            timeout_ms = self.config.timeout.as_millis() as u64,
            "Heartbeat monitor started"
        );
        let mut ticker = interval(self.config.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    let expired = self.poll_once().await;
                    if !expired.is_empty() {
                        warn!(ranks = ?expired, "Ranks missed heartbeats");
                    }
                }
            }
        }
        debug!("Heartbeat monitor stopped");
    }
}

async fn fetch_report(client: &Client, node: &NodeDescriptor) -> Result<HealthReport> {
    let url = format!("{}{}", node.control_url(), paths::HEALTH);
    let resp = client
        .get(&url)
        .send()
        .await
        .map_err(|e| ClusterError::ConnectionFailed {
            endpoint: node.to_string(),
            reason: e.to_string(),
        })?;
    resp.error_for_status()
        .map_err(|e| ClusterError::ConnectionFailed {
            endpoint: node.to_string(),
            reason: e.to_string(),
        })?
        .json::<HealthReport>()
        .await
        .map_err(|e| ClusterError::InvalidMessage {
            reason: format!("bad health report from {}: {}", node, e),
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::coordinator::rank_table::RankAssignmentTable;
    use crate::router::health::ShardHealth;
    use crate::worker::{EchoEngine, WorkerGroupConfig};
    use std::time::Duration;

    #[tokio::test]
    async fn test_local_report_restores_and_remote_silence_expires() {
        let head = NodeDescriptor::new("127.0.0.1", 13345, 1);
        // Nothing listens on port 1
        let child = NodeDescriptor::new("127.0.0.1", 1, 1);
        let mut table = RankAssignmentTable::new(0, 2, 1);
        table.register(head.clone(), 1, Some(0)).unwrap();
        table.register(child, 1, None).unwrap();
        let sealed = table.seal().unwrap();

        let group = Arc::new(WorkerGroup::new(head, Arc::new(EchoEngine::new()), WorkerGroupConfig::default()));
        group.install_table(sealed.clone()).await.unwrap();

        let router = Arc::new(RequestRouter::new(sealed, group.clone()));
        router.mark_unreachable(0);

        let monitor = HeartbeatMonitor::new(
            router.clone(),
            Some(group),
            HeartbeatConfig {
                interval: Duration::from_millis(200),
                timeout: Duration::from_millis(50),
            },
        )
        .unwrap();

        tokio::time::sleep(Duration::from_millis(100)).await;
        let expired = monitor.poll_once().await;

        assert_eq!(router.health().health(0), Some(ShardHealth::Ready));
        assert_eq!(expired, vec![1]);
        assert_eq!(router.health().health(1), Some(ShardHealth::Unreachable));
    }
}

//! Orchestrator driver binary
//!
//! Drives rounds of inference batches against the head's serving endpoint
//! and, when a weight source is given, pushes a new weight version after
//! every round.

use std::sync::Arc;
use std::time::{Duration, Instant};

use clap::Parser;
use dpserve_core::config::LogFormat;
use dpserve_core::error::ClusterError;
use dpserve_core::logging;
use dpserve_core::orchestrator::{BatchConfig, BatchDriver, HttpOrchestratorClient};
use dpserve_core::request::{InferenceRequest, RequestIdGenerator, WeightUpdate};
use serde_json::json;
use tracing::{error, info, warn};

#[derive(Debug, Parser)]
#[command(name = "dpserve-orchestrator", version, about = "Drive inference batches against a dpserve cluster")]
struct Args {
    /// Serving endpoint of the head node
    #[arg(long, env = "DPSERVE_BASE_URL", default_value = "http://127.0.0.1:8000")]
    base_url: String,

    #[arg(long, env = "DPSERVE_API_KEY")]
    api_key: Option<String>,

    #[arg(long, default_value_t = 64)]
    batch_size: usize,

    #[arg(long, default_value_t = 60)]
    batch_timeout_secs: u64,

    #[arg(long, default_value_t = 1)]
    rounds: u32,

    /// Weight source pushed after each round
    #[arg(long)]
    weight_source: Option<String>,

    /// Version of the first weight push, incremented every round
    #[arg(long, default_value_t = 1)]
    weight_version: u64,

    /// Time to wait for the cluster to report ready
    #[arg(long, default_value_t = 300)]
    ready_timeout_secs: u64,

    #[arg(long, env = "DPSERVE_LOG_FORMAT", value_enum, default_value = "pretty")]
    log_format: LogFormat,
}

async fn wait_ready(client: &HttpOrchestratorClient, timeout: Duration) -> bool {
    let started = Instant::now();
    while started.elapsed() < timeout {
        if client.is_ready().await {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(500)).await;
    }
    false
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();
    logging::init(None, args.log_format);

    let batch_timeout = Duration::from_secs(args.batch_timeout_secs);
    let client = Arc::new(HttpOrchestratorClient::new(
        args.base_url.clone(),
        args.api_key.clone(),
        batch_timeout,
    )?);

    info!(base_url = %args.base_url, "Waiting for cluster");
    if !wait_ready(&client, Duration::from_secs(args.ready_timeout_secs)).await {
        error!("Cluster did not become ready");
        return Err(ClusterError::ConnectionFailed {
            endpoint: args.base_url,
            reason: "serving endpoint never reported ready".into(),
        }
        .into());
    }

    let info = client.cluster_info().await?;
    info!(
        base_rank = info.base_rank,
        total = info.total_ranks,
        tp = info.tensor_parallel_size,
        weight_version = ?info.weight_version,
        "Cluster ready"
    );

    let driver = BatchDriver::new(
        client,
        BatchConfig {
            max_batch_size: args.batch_size,
            batch_timeout,
        },
    );

    // Ids must not repeat across orchestrator runs, shards cache results by id
    let ids = RequestIdGenerator::starting_at(chrono::Utc::now().timestamp_micros().max(1) as u64);

    for round in 0..args.rounds {
        let batch: Vec<InferenceRequest> = (0..args.batch_size)
            .map(|i| {
                let id = ids.next_id();
                InferenceRequest::new(id, format!("prompt-{}", i), json!({ "round": round, "prompt": i }))
            })
            .collect();

        let results = driver.run_batch(batch).await?;
        let failed = results.iter().filter(|r| r.is_err()).count();
        info!(round, completed = results.len() - failed, failed, "Round finished");

        if let Some(source) = &args.weight_source {
            let update = WeightUpdate {
                version: args.weight_version + round as u64,
                source: source.clone(),
            };
            match driver.trigger_weight_sync(update).await {
                Ok(report) => info!(
                    version = report.version,
                    acknowledged = report.acknowledged.len(),
                    failed = report.failed.len(),
                    "Weights synchronized"
                ),
                Err(e) => warn!(round, "Weight sync failed: {}", e),
            }
        }
    }

    Ok(())
}

//! Cluster node binary
//!
//! Starts as the head when `--data-parallel-address` is absent, otherwise as
//! a child that announces to the head. The model is served by the loopback
//! engine until a real engine is linked in.

use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use dpserve_core::config::NodeConfig;
use dpserve_core::runtime::{os_signal, NodeRuntime, RuntimeConfig, ShutdownSignal};
use dpserve_core::worker::EchoEngine;
use dpserve_core::{logging, node};
use tracing::{error, info};

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let config = NodeConfig::parse();
    logging::init(config.log_level.as_deref(), config.log_format);

    let role = match config.validate() {
        Ok(role) => role,
        Err(e) => {
            error!("Invalid configuration: {}", e);
            return Err(e.into());
        }
    };
    info!(
        ?role,
        total = config.data_parallel_size,
        local = config.data_parallel_size_local,
        tp = config.tensor_parallel_size,
        "Starting dpserve node"
    );

    let runtime = NodeRuntime::new(RuntimeConfig::for_local_shards(config.data_parallel_size_local))?;
    let shutdown = ShutdownSignal::new();

    let trigger = shutdown.clone();
    runtime.spawn(async move {
        os_signal().await;
        info!("Shutdown signal received");
        trigger.shutdown();
    });

    let result = runtime.block_on(node::run(config, Arc::new(EchoEngine::new()), shutdown));
    runtime.shutdown(Duration::from_secs(5));

    if let Err(e) = result {
        error!(fatal = e.is_fatal(), "Node failed: {}", e);
        return Err(e.into());
    }
    info!("Node stopped");
    Ok(())
}

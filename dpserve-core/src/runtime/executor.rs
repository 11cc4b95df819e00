//! Tokio runtime for one node process
//!
//! The runtime gets one worker thread per local shard slot plus a small
//! fixed number for the control and serving listeners.

use std::future::Future;
use std::time::Duration;

use tokio::runtime::{Builder, Runtime};

use crate::error::{ClusterError, Result};

/// Threads reserved for listeners and background loops
const LISTENER_THREADS: usize = 2;

#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    pub worker_threads: usize,
    pub thread_name: String,
}

impl RuntimeConfig {
    /// Size the runtime for `local_shards` shard slots
    pub fn for_local_shards(local_shards: u32) -> Self {
        Self {
            worker_threads: local_shards.max(1) as usize + LISTENER_THREADS,
            ..Default::default()
        }
    }
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            worker_threads: num_cpus::get().max(LISTENER_THREADS),
            thread_name: "dpserve-worker".into(),
        }
    }
}

/// Multi-thread runtime owned by the node binary
pub struct NodeRuntime {
    runtime: Runtime,
    config: RuntimeConfig,
}

impl NodeRuntime {
    pub fn new(config: RuntimeConfig) -> Result<Self> {
        let runtime = Builder::new_multi_thread()
            .worker_threads(config.worker_threads)
            .thread_name(config.thread_name.clone())
            .enable_all()
            .build()
            .map_err(|e| ClusterError::Internal {
                message: format!("Failed to create runtime: {}", e),
            })?;

        Ok(Self { runtime, config })
    }

    pub fn config(&self) -> &RuntimeConfig {
        &self.config
    }

    pub fn spawn<F>(&self, future: F) -> tokio::task::JoinHandle<F::Output>
    where
        F: Future + Send + 'static,
        F::Output: Send + 'static,
    {
        self.runtime.spawn(future)
    }

    /// Run a future to completion on the runtime
    pub fn block_on<F: Future>(&self, future: F) -> F::Output {
        self.runtime.block_on(future)
    }

    pub fn handle(&self) -> tokio::runtime::Handle {
        self.runtime.handle().clone()
    }

    /// Stop the runtime, giving background tasks `timeout` to finish
    pub fn shutdown(self, timeout: Duration) {
        self.runtime.shutdown_timeout(timeout);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sized_to_local_shards() {
        let config = RuntimeConfig::for_local_shards(4);
        assert_eq!(config.worker_threads, 6);

        let runtime = NodeRuntime::new(config).unwrap();
        let result = runtime.block_on(async { runtime_handle_works().await });
        assert_eq!(result, 42);
        runtime.shutdown(Duration::from_millis(100));
    }

    async fn runtime_handle_works() -> u32 {
        tokio::spawn(async { 42 }).await.unwrap()
    }
}

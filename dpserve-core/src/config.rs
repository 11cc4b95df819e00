//! Node startup configuration
//!
//! Every node is started with the same flag set. Values come from CLI
//! arguments first, then `DPSERVE_*` environment variables, then defaults.
//! Validation runs before any socket is opened.

use std::time::Duration;

use clap::{Parser, ValueEnum};

use crate::coordinator::leader::CoordinatorConfig;
use crate::coordinator::rank_table::{GlobalRank, NodeDescriptor};
use crate::discovery::client::ClientConfig;
use crate::error::{ClusterError, Result};
use crate::router::health::HeartbeatConfig;
use crate::worker::group::WorkerGroupConfig;

/// Log output format
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum LogFormat {
    /// Human-readable output
    Pretty,
    /// One JSON object per line
    Json,
}

/// Role of this process, resolved once at startup
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NodeRole {
    /// Owns rank assignment; its start rank is the cluster's base rank
    Head,
    /// Joins by announcing to the head's discovery listener
    Child { discovery_url: String },
}

/// Per-node startup configuration
#[derive(Debug, Clone, Parser)]
#[command(name = "dpserve-node", version, about = "Data-parallel inference cluster node")]
pub struct NodeConfig {
    /// Total data-parallel ranks across the cluster
    #[arg(long = "data-parallel-size", env = "DPSERVE_DATA_PARALLEL_SIZE")]
    pub data_parallel_size: u32,

    /// Data-parallel ranks served by this node
    #[arg(long = "data-parallel-size-local", env = "DPSERVE_DATA_PARALLEL_SIZE_LOCAL", default_value_t = 1)]
    pub data_parallel_size_local: u32,

    /// Device slots per model replica
    #[arg(long = "tensor-parallel-size", env = "DPSERVE_TENSOR_PARALLEL_SIZE", default_value_t = 1)]
    pub tensor_parallel_size: u32,

    /// Head discovery address. Absent on the head itself.
    #[arg(long = "data-parallel-address", env = "DPSERVE_DATA_PARALLEL_ADDRESS")]
    pub data_parallel_address: Option<String>,

    /// Head discovery port
    #[arg(long = "data-parallel-rpc-port", env = "DPSERVE_DATA_PARALLEL_RPC_PORT", default_value_t = 13345)]
    pub data_parallel_rpc_port: u16,

    /// First global rank served by this node
    /// Defaults to 0 on the head; a child without it takes the lowest free block
    #[arg(long = "data-parallel-start-rank", env = "DPSERVE_DATA_PARALLEL_START_RANK")]
    pub data_parallel_start_rank: Option<GlobalRank>,

    /// Bearer token required by the serving endpoint
    #[arg(long = "api-key", env = "DPSERVE_API_KEY")]
    pub api_key: Option<String>,

    /// Do not expose the serving endpoint
    #[arg(long)]
    pub headless: bool,

    /// Serving endpoint bind host
    #[arg(long, env = "DPSERVE_HOST", default_value = "0.0.0.0")]
    pub host: String,

    /// Serving endpoint port
    #[arg(long, env = "DPSERVE_PORT", default_value_t = 8000)]
    pub port: u16,

    /// Address other nodes use to reach this node
    #[arg(long, env = "DPSERVE_ADVERTISE_ADDRESS", default_value = "127.0.0.1")]
    pub advertise_address: String,

    /// Control listener port on child nodes
    #[arg(long, env = "DPSERVE_CONTROL_PORT", default_value_t = 13346)]
    pub control_port: u16,

    /// Seconds to wait for the cluster to form
    #[arg(long, default_value_t = 300)]
    pub startup_timeout_secs: u64,

    /// Delivery attempts for the sealed table per node
    #[arg(long, default_value_t = 5)]
    pub broadcast_attempts: u32,

    /// Hard deadline for draining in-flight requests
    #[arg(long, default_value_t = 30)]
    pub drain_timeout_secs: u64,

    #[arg(long, default_value_t = 5)]
    pub heartbeat_interval_secs: u64,

    /// Silence after which a shard is considered unreachable
    #[arg(long, default_value_t = 15)]
    pub heartbeat_timeout_secs: u64,

    /// Concurrent requests admitted per local shard
    #[arg(long, default_value_t = 64)]
    pub max_inflight_per_shard: usize,

    /// Log filter, overrides RUST_LOG
    #[arg(long)]
    pub log_level: Option<String>,

    #[arg(long, env = "DPSERVE_LOG_FORMAT", value_enum, default_value_t = LogFormat::Pretty)]
    pub log_format: LogFormat,
}

impl NodeConfig {
    /// Validate the configuration and resolve the node role
    pub fn validate(&self) -> Result<NodeRole> {
        let invalid = |reason: String| Err(ClusterError::InvalidConfiguration { reason });

        if self.data_parallel_size == 0 {
            return invalid("--data-parallel-size must be at least 1".into());
        }
        if self.data_parallel_size_local == 0 {
            return invalid("--data-parallel-size-local must be at least 1".into());
        }
        if self.tensor_parallel_size == 0 {
            return invalid("--tensor-parallel-size must be at least 1".into());
        }
        if self.data_parallel_size_local > self.data_parallel_size {
            return invalid(format!(
                "local data-parallel size {} exceeds total {}",
                self.data_parallel_size_local, self.data_parallel_size
            ));
        }
        if self.start_rank().checked_add(self.data_parallel_size).is_none() {
            return invalid(format!("start rank {} overflows the rank space", self.start_rank()));
        }
        if self.data_parallel_rpc_port == 0 {
            return invalid("--data-parallel-rpc-port must be non-zero".into());
        }
        if self.advertise_address.trim().is_empty() {
            return invalid("--advertise-address must not be empty".into());
        }
        if matches!(self.api_key.as_deref(), Some(key) if key.trim().is_empty()) {
            return invalid("--api-key must not be empty when supplied".into());
        }
        if self.startup_timeout_secs == 0 || self.drain_timeout_secs == 0 {
            return invalid("startup and drain timeouts must be non-zero".into());
        }
        if self.broadcast_attempts == 0 {
            return invalid("--broadcast-attempts must be at least 1".into());
        }
        if self.heartbeat_interval_secs == 0 || self.heartbeat_timeout_secs <= self.heartbeat_interval_secs {
            return invalid(format!(
                "heartbeat timeout {}s must exceed a non-zero interval {}s",
                self.heartbeat_timeout_secs, self.heartbeat_interval_secs
            ));
        }
        if self.max_inflight_per_shard == 0 {
            return invalid("--max-inflight-per-shard must be at least 1".into());
        }

        match self.data_parallel_address.as_deref().map(str::trim) {
            None | Some("") => {
                if !self.headless && (self.port == 0 || self.port == self.data_parallel_rpc_port) {
                    return invalid(format!(
                        "serving port {} must be non-zero and differ from the discovery port",
                        self.port
                    ));
                }
                Ok(NodeRole::Head)
            }
            Some(address) => {
                if !self.headless {
                    return invalid("child nodes must run with --headless".into());
                }
                if self.control_port == 0 {
                    return invalid("--control-port must be non-zero".into());
                }
                Ok(NodeRole::Child {
                    discovery_url: format!("http://{}:{}", address, self.data_parallel_rpc_port),
                })
            }
        }
    }

    /// Descriptor this node registers with
    pub fn descriptor(&self, role: &NodeRole) -> NodeDescriptor {
        let port = match role {
            NodeRole::Head => self.data_parallel_rpc_port,
            NodeRole::Child { .. } => self.control_port,
        };
        NodeDescriptor::new(self.advertise_address.clone(), port, self.data_parallel_size_local)
    }

    /// First rank of this node, and the cluster base rank on the head
    pub fn start_rank(&self) -> GlobalRank {
        self.data_parallel_start_rank.unwrap_or(0)
    }

    pub fn startup_timeout(&self) -> Duration {
        Duration::from_secs(self.startup_timeout_secs)
    }

    pub fn drain_timeout(&self) -> Duration {
        Duration::from_secs(self.drain_timeout_secs)
    }

    pub fn coordinator_config(&self) -> CoordinatorConfig {
        CoordinatorConfig {
            base_rank: self.start_rank(),
            total_ranks: self.data_parallel_size,
            tensor_parallel_size: self.tensor_parallel_size,
            startup_timeout: self.startup_timeout(),
            broadcast_attempts: self.broadcast_attempts,
            drain_timeout: self.drain_timeout(),
            ..Default::default()
        }
    }

    pub fn client_config(&self, discovery_url: &str) -> ClientConfig {
        ClientConfig {
            discovery_url: discovery_url.to_string(),
            startup_timeout: self.startup_timeout(),
            ..Default::default()
        }
    }

    pub fn worker_group_config(&self) -> WorkerGroupConfig {
        WorkerGroupConfig {
            max_inflight_per_shard: self.max_inflight_per_shard,
            ..Default::default()
        }
    }

    pub fn heartbeat_config(&self) -> HeartbeatConfig {
        HeartbeatConfig {
            interval: Duration::from_secs(self.heartbeat_interval_secs),
            timeout: Duration::from_secs(self.heartbeat_timeout_secs),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(args: &[&str]) -> NodeConfig {
        let mut argv = vec!["dpserve-node"];
        argv.extend_from_slice(args);
        NodeConfig::try_parse_from(argv).unwrap()
    }

    #[test]
    fn test_head_role_without_address() {
        let config = parse(&[
            "--data-parallel-size", "12",
            "--data-parallel-size-local", "4",
            "--tensor-parallel-size", "2",
            "--data-parallel-start-rank", "4",
            "--api-key", "secret",
        ]);
        assert_eq!(config.validate().unwrap(), NodeRole::Head);

        let descriptor = config.descriptor(&NodeRole::Head);
        assert_eq!(descriptor.rpc_port, 13345);
        assert_eq!(descriptor.local_shard_count, 4);
        assert_eq!(config.coordinator_config().base_rank, 4);
    }

    #[test]
    fn test_child_role_with_address() {
        let config = parse(&[
            "--data-parallel-size", "12",
            "--data-parallel-size-local", "4",
            "--data-parallel-address", "10.0.0.1",
            "--data-parallel-rpc-port", "20000",
            "--data-parallel-start-rank", "8",
            "--headless",
        ]);
        let role = config.validate().unwrap();
        assert_eq!(role, NodeRole::Child { discovery_url: "http://10.0.0.1:20000".into() });
        assert_eq!(config.descriptor(&role).rpc_port, 13346);
    }

    #[test]
    fn test_child_must_be_headless() {
        let config = parse(&["--data-parallel-size", "2", "--data-parallel-address", "10.0.0.1"]);
        assert!(matches!(config.validate(), Err(ClusterError::InvalidConfiguration { .. })));
    }

    #[test]
    fn test_local_exceeds_total() {
        let config = parse(&["--data-parallel-size", "2", "--data-parallel-size-local", "4"]);
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("exceeds total"));
    }

    #[test]
    fn test_zero_sizes_rejected() {
        let config = parse(&["--data-parallel-size", "0"]);
        assert!(config.validate().is_err());

        let config = parse(&["--data-parallel-size", "2", "--tensor-parallel-size", "0"]);
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_empty_api_key_rejected() {
        let config = parse(&["--data-parallel-size", "2", "--api-key", " "]);
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_heartbeat_timeout_must_exceed_interval() {
        let config = parse(&[
            "--data-parallel-size", "2",
            "--heartbeat-interval-secs", "5",
            "--heartbeat-timeout-secs", "5",
        ]);
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_serving_port_conflicts_with_discovery() {
        let config = parse(&["--data-parallel-size", "2", "--port", "13345"]);
        assert!(config.validate().is_err());
    }
}

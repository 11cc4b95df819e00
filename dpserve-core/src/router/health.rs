//! Shard health tracking
//!
//! Tracks heartbeats and the health state of every sealed rank. The map is
//! the router's hot write path, so every method holds the lock briefly and
//! never across an await.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::coordinator::rank_table::{GlobalRank, SealedRankTable};
use crate::error::{ClusterError, Result};

/// Health of one data-parallel shard
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ShardHealth {
    /// Registered but not yet serving
    Starting,
    /// Serving normally
    Ready,
    /// Serving, but should be deprioritized
    Degraded,
    /// Excluded from routing until a fresh heartbeat
    Unreachable,
}

impl ShardHealth {
    /// Whether the router may send traffic to this shard
    pub fn is_routable(self) -> bool {
        matches!(self, ShardHealth::Ready | ShardHealth::Degraded)
    }
}

/// A rank together with its address and current health
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShardEndpoint {
    pub rank: GlobalRank,
    /// Control URL of the owning node
    pub address: String,
    pub health: ShardHealth,
}

/// Heartbeat timing
#[derive(Debug, Clone)]
pub struct HeartbeatConfig {
    /// How often the head polls each node
    pub interval: Duration,
    /// Silence after which a shard is marked unreachable
    pub timeout: Duration,
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(crate::DEFAULT_HEARTBEAT_INTERVAL_SECS),
            timeout: Duration::from_secs(crate::DEFAULT_HEARTBEAT_TIMEOUT_SECS),
        }
    }
}

#[derive(Debug, Clone)]
struct ShardState {
    address: String,
    health: ShardHealth,
    last_heartbeat: Instant,
}

/// Health of every rank in the sealed table
#[derive(Debug)]
pub struct ShardHealthMap {
    shards: RwLock<HashMap<GlobalRank, ShardState>>,
}

impl ShardHealthMap {
    /// Build the map for a sealed table with every rank in `initial` health
    pub fn new(table: &SealedRankTable, initial: ShardHealth) -> Self {
        let now = Instant::now();
        let shards = table
            .shard_endpoints()
            .into_iter()
            .map(|endpoint| {
                (
                    endpoint.rank,
                    ShardState {
                        address: endpoint.address,
                        health: initial,
                        last_heartbeat: now,
                    },
                )
            })
            .collect();

        Self {
            shards: RwLock::new(shards),
        }
    }

    pub fn health(&self, rank: GlobalRank) -> Option<ShardHealth> {
        self.shards.read().get(&rank).map(|s| s.health)
    }

    pub fn endpoint(&self, rank: GlobalRank) -> Option<ShardEndpoint> {
        self.shards.read().get(&rank).map(|s| ShardEndpoint {
            rank,
            address: s.address.clone(),
            health: s.health,
        })
    }

    /// Record a heartbeat carrying the shard's self-reported health.
    ///
    /// A fresh heartbeat is the only way back from `Unreachable`.
    pub fn observe_heartbeat(&self, rank: GlobalRank, reported: ShardHealth) -> Result<()> {
        let mut shards = self.shards.write();
        let shard = shards
            .get_mut(&rank)
            .ok_or(ClusterError::UnknownRank { rank })?;

        shard.last_heartbeat = Instant::now();
        if shard.health != reported {
            if shard.health == ShardHealth::Unreachable {
                info!(rank, health = ?reported, "Shard recovered");
            } else {
                debug!(rank, from = ?shard.health, to = ?reported, "Shard health changed");
            }
            shard.health = reported;
        }
        Ok(())
    }

    /// Exclude a shard from routing, e.g. after a transport failure
    pub fn mark_unreachable(&self, rank: GlobalRank) {
        if let Some(shard) = self.shards.write().get_mut(&rank) {
            if shard.health != ShardHealth::Unreachable {
                warn!(rank, "Shard marked unreachable");
                shard.health = ShardHealth::Unreachable;
            }
        }
    }

    /// Mark shards silent for longer than `timeout` unreachable, returning them
    pub fn expire_stale(&self, timeout: Duration) -> Vec<GlobalRank> {
        let now = Instant::now();
        let mut expired = Vec::new();

        let mut shards = self.shards.write();
        for (rank, shard) in shards.iter_mut() {
            if shard.health == ShardHealth::Unreachable {
                continue;
            }
            if now.duration_since(shard.last_heartbeat) > timeout {
                warn!(rank, "Shard missed heartbeats, marked unreachable");
                shard.health = ShardHealth::Unreachable;
                expired.push(*rank);
            }
        }

        expired.sort_unstable();
        expired
    }

    /// Number of shards the router may use
    pub fn routable_count(&self) -> usize {
        self.shards
            .read()
            .values()
            .filter(|s| s.health.is_routable())
            .count()
    }

    /// All endpoints ordered by rank
    pub fn snapshot(&self) -> Vec<ShardEndpoint> {
        let mut endpoints: Vec<ShardEndpoint> = self
            .shards
            .read()
            .iter()
            .map(|(rank, s)| ShardEndpoint {
                rank: *rank,
                address: s.address.clone(),
                health: s.health,
            })
            .collect();
        endpoints.sort_by_key(|e| e.rank);
        endpoints
    }
}

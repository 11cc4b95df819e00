//! Deterministic shard selection
//!
//! A routing key owns the shard at `crc32c(key) % shard_count` in sealed rank
//! order. When that shard cannot take traffic, selection falls back to
//! round-robin over the healthy shards.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use tracing::debug;

use super::health::{ShardHealth, ShardHealthMap};
use crate::coordinator::rank_table::{GlobalRank, SealedRankTable};
use crate::error::{ClusterError, Result};

/// Picks a shard for a routing key
pub struct ShardSelector {
    table: Arc<SealedRankTable>,
    cursor: AtomicUsize,
}

impl ShardSelector {
    pub fn new(table: Arc<SealedRankTable>) -> Self {
        Self {
            table,
            cursor: AtomicUsize::new(0),
        }
    }

    /// Shard that owns `routing_key` when everything is healthy
    pub fn preferred(&self, routing_key: &str) -> GlobalRank {
        let hash = crc32c::crc32c(routing_key.as_bytes()) as usize;
        self.table.rank_at(hash % self.table.len())
    }

    /// Pick a shard for `routing_key`, skipping ranks in `exclude`.
    ///
    /// A degraded owner still gets its keys; only unreachable or starting
    /// owners trigger the fallback.
    pub fn select(
        &self,
        routing_key: &str,
        health: &ShardHealthMap,
        exclude: &[GlobalRank],
    ) -> Result<GlobalRank> {
        let preferred = self.preferred(routing_key);
        let routable = health.health(preferred).is_some_and(ShardHealth::is_routable);

        if routable && !exclude.contains(&preferred) {
            return Ok(preferred);
        }

        let fallback = self.fallback(health, exclude)?;
        debug!(routing_key, preferred, fallback, "Preferred shard unavailable, falling back");
        Ok(fallback)
    }

    /// Next healthy shard in round-robin order, preferring ready over degraded
    pub fn fallback(&self, health: &ShardHealthMap, exclude: &[GlobalRank]) -> Result<GlobalRank> {
        let count = self.table.len();
        let start = self.cursor.fetch_add(1, Ordering::Relaxed) % count;
        let mut degraded = None;

        for offset in 0..count {
            let rank = self.table.rank_at((start + offset) % count);
            if exclude.contains(&rank) {
                continue;
            }
            match health.health(rank) {
                Some(ShardHealth::Ready) => return Ok(rank),
                Some(ShardHealth::Degraded) => {
                    degraded.get_or_insert(rank);
                }
                _ => {}
            }
        }

        degraded.ok_or(ClusterError::NoHealthyShards)
    }
}

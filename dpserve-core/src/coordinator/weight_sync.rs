//! Weight synchronization rounds
//!
//! Tracks which weight version the whole cluster has acknowledged. Rounds
//! run one at a time; a round that leaves any rank behind does not advance
//! the cluster version, so the same version can be pushed again.

use std::collections::VecDeque;

use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, MutexGuard, RwLock};
use tracing::{info, warn};

use crate::coordinator::rank_table::GlobalRank;
use crate::error::{ClusterError, Result};

const HISTORY_LEN: usize = 16;

/// A rank that failed to load an update
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RankFailure {
    pub rank: GlobalRank,
    pub reason: String,
}

/// Outcome of one synchronization round
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WeightSyncReport {
    pub version: u64,
    pub acknowledged: Vec<GlobalRank>,
    pub failed: Vec<RankFailure>,
}

impl WeightSyncReport {
    pub fn is_complete(&self) -> bool {
        self.failed.is_empty()
    }
}

/// Tracks the cluster-wide weight version
pub struct WeightSyncTracker {
    active_version: RwLock<Option<u64>>,
    round_lock: Mutex<()>,
    history: RwLock<VecDeque<WeightSyncReport>>,
}

/// An open round; holding it keeps other rounds out
pub struct SyncRound<'a> {
    tracker: &'a WeightSyncTracker,
    version: u64,
    acknowledged: Vec<GlobalRank>,
    failed: Vec<RankFailure>,
    _guard: MutexGuard<'a, ()>,
}

impl WeightSyncTracker {
    pub fn new() -> Self {
        Self {
            active_version: RwLock::new(None),
            round_lock: Mutex::new(()),
            history: RwLock::new(VecDeque::with_capacity(HISTORY_LEN)),
        }
    }

    /// Version every rank has acknowledged
    pub async fn active_version(&self) -> Option<u64> {
        *self.active_version.read().await
    }

    /// Open a round for `version`, waiting for any running round to finish
    pub async fn begin(&self, version: u64) -> Result<SyncRound<'_>> {
        let guard = self.round_lock.lock().await;

        if let Some(active) = *self.active_version.read().await {
            if version <= active {
                return Err(ClusterError::StaleWeightVersion { active, received: version });
            }
        }

        info!(version, "Beginning weight sync round");
        Ok(SyncRound {
            tracker: self,
            version,
            acknowledged: Vec::new(),
            failed: Vec::new(),
            _guard: guard,
        })
    }

    /// Most recent reports, oldest first
    pub async fn history(&self) -> Vec<WeightSyncReport> {
        self.history.read().await.iter().cloned().collect()
    }
}

impl Default for WeightSyncTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl SyncRound<'_> {
    pub fn version(&self) -> u64 {
        self.version
    }

    pub fn acknowledge(&mut self, ranks: impl IntoIterator<Item = GlobalRank>) {
        self.acknowledged.extend(ranks);
    }

    pub fn fail(&mut self, ranks: impl IntoIterator<Item = GlobalRank>, reason: &str) {
        self.failed.extend(ranks.into_iter().map(|rank| RankFailure {
            rank,
            reason: reason.to_string(),
        }));
    }

    /// Close the round, advancing the cluster version only if nothing failed
    pub async fn finish(mut self) -> WeightSyncReport {
        self.acknowledged.sort_unstable();
        self.failed.sort_by_key(|f| f.rank);

        let report = WeightSyncReport {
            version: self.version,
            acknowledged: std::mem::take(&mut self.acknowledged),
            failed: std::mem::take(&mut self.failed),
        };

        if report.is_complete() {
            *self.tracker.active_version.write().await = Some(report.version);
            info!(version = report.version, ranks = report.acknowledged.len(), "Weight sync complete");
        } else {
            warn!(
                version = report.version,
                failed = report.failed.len(),
                "Weight sync incomplete, cluster version unchanged"
            );
        }

        let mut history = self.tracker.history.write().await;
        if history.len() == HISTORY_LEN {
            history.pop_front();
        }
        history.push_back(report.clone());

        report
    }
}

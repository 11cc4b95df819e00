//! Worker group state machine
//!
//! Tracks local lifecycle phase, assigned ranks, the sealed table once it
//! arrives, and the active weight version.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::{watch, RwLock};

use crate::coordinator::rank_table::{RankRange, SealedRankTable};

/// Worker group lifecycle phase
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerPhase {
    /// Process started, nothing registered yet
    Initializing,
    /// Announcing to the head coordinator
    Announcing,
    /// Ranks assigned, waiting for the sealed table
    AwaitingTable,
    /// Serving requests
    Ready,
    /// Refusing new work, finishing in-flight requests
    Draining,
    /// Shut down
    Stopped,
    /// Bring-up failed
    Failed,
}

/// Local worker group state
pub struct WorkerState {
    phase: watch::Sender<WorkerPhase>,
    assigned: RwLock<Option<RankRange>>,
    table: watch::Sender<Option<Arc<SealedRankTable>>>,
    /// Active weight version, 0 until the first update
    weight_version: AtomicU64,
}

impl WorkerState {
    pub fn new() -> Self {
        let (phase, _) = watch::channel(WorkerPhase::Initializing);
        let (table, _) = watch::channel(None);
        Self {
            phase,
            assigned: RwLock::new(None),
            table,
            weight_version: AtomicU64::new(0),
        }
    }

    pub fn phase(&self) -> WorkerPhase {
        *self.phase.borrow()
    }

    pub fn set_phase(&self, phase: WorkerPhase) {
        self.phase.send_replace(phase);
    }

    /// Receiver that observes every phase change
    pub fn subscribe_phase(&self) -> watch::Receiver<WorkerPhase> {
        self.phase.subscribe()
    }

    /// Record the assigned range. The sealed table may already have arrived,
    /// in which case the phase is left alone.
    pub async fn set_assigned(&self, range: RankRange) {
        *self.assigned.write().await = Some(range);
        self.phase.send_if_modified(|phase| {
            if matches!(phase, WorkerPhase::Initializing | WorkerPhase::Announcing) {
                *phase = WorkerPhase::AwaitingTable;
                true
            } else {
                false
            }
        });
    }

    pub async fn assigned(&self) -> Option<RankRange> {
        *self.assigned.read().await
    }

    /// Install the sealed table. The first table wins; repeats are ignored.
    pub fn install_table(&self, table: Arc<SealedRankTable>) -> bool {
        self.table.send_if_modified(|current| {
            if current.is_none() {
                *current = Some(table);
                true
            } else {
                false
            }
        })
    }

    pub fn table(&self) -> Option<Arc<SealedRankTable>> {
        self.table.borrow().clone()
    }

    /// Wait until the sealed table is installed or `timeout` elapses
    pub async fn wait_for_table(&self, timeout: Duration) -> Option<Arc<SealedRankTable>> {
        let mut rx = self.table.subscribe();
        let waited = tokio::time::timeout(timeout, rx.wait_for(|t| t.is_some())).await;
        match waited {
            Ok(Ok(table)) => table.clone(),
            _ => None,
        }
    }

    pub fn weight_version(&self) -> Option<u64> {
        match self.weight_version.load(Ordering::Acquire) {
            0 => None,
            v => Some(v),
        }
    }

    /// Advance the weight version if `version` is newer. Returns the active
    /// version on rejection.
    pub fn advance_weight_version(&self, version: u64) -> std::result::Result<(), u64> {
        self.weight_version
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |active| {
                (version > active).then_some(version)
            })
            .map(|_| ())
    }
}

impl Default for WorkerState {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::coordinator::rank_table::{NodeDescriptor, RankAssignmentTable};

    fn sealed() -> Arc<SealedRankTable> {
        let mut table = RankAssignmentTable::new(0, 1, 1);
        table.register(NodeDescriptor::new("a", 1, 1), 1, None).unwrap();
        table.seal().unwrap()
    }

    #[tokio::test]
    async fn test_assignment_moves_phase() {
        let state = WorkerState::new();
        assert_eq!(state.phase(), WorkerPhase::Initializing);

        state.set_assigned(RankRange::new(4, 4)).await;
        assert_eq!(state.phase(), WorkerPhase::AwaitingTable);
        assert_eq!(state.assigned().await, Some(RankRange::new(4, 4)));
    }

    #[tokio::test]
    async fn test_late_assignment_keeps_ready() {
        // The sealed table can beat the announce reply
        let state = WorkerState::new();
        state.set_phase(WorkerPhase::Ready);
        state.set_assigned(RankRange::new(0, 1)).await;
        assert_eq!(state.phase(), WorkerPhase::Ready);
    }

    #[tokio::test]
    async fn test_wait_for_table() {
        let state = Arc::new(WorkerState::new());
        assert!(state.wait_for_table(Duration::from_millis(10)).await.is_none());

        let waiter = {
            let state = state.clone();
            tokio::spawn(async move { state.wait_for_table(Duration::from_secs(5)).await })
        };
        assert!(state.install_table(sealed()));
        assert!(!state.install_table(sealed()));

        assert!(waiter.await.unwrap().is_some());
    }

    #[test]
    fn test_weight_versions_increase() {
        let state = WorkerState::new();
        assert_eq!(state.weight_version(), None);

        state.advance_weight_version(3).unwrap();
        assert_eq!(state.advance_weight_version(3), Err(3));
        assert_eq!(state.advance_weight_version(2), Err(3));
        state.advance_weight_version(4).unwrap();
        assert_eq!(state.weight_version(), Some(4));
    }
}

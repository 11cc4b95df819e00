//! Head-side cluster coordination
//!
//! Rank assignment, the head coordinator state machine, and weight
//! synchronization rounds.

pub mod leader;
pub mod rank_table;
pub mod weight_sync;

pub use leader::{CoordinatorConfig, DrainReport, HeadCoordinator, HeadState};
pub use rank_table::{
    GlobalRank, NodeDescriptor, RankAssignment, RankAssignmentTable, RankRange, SealedRankTable,
    TensorParallelGroup,
};
pub use weight_sync::{RankFailure, WeightSyncReport, WeightSyncTracker};

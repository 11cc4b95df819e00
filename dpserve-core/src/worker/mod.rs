//! Worker side of the cluster
//!
//! A worker group serves the node's data-parallel shards behind the
//! control listener and tracks its own lifecycle.

pub mod control;
pub mod engine;
pub mod group;
pub mod state;

pub use control::control_routes;
pub use engine::{EchoEngine, InferenceEngine, ShardSlot};
pub use group::{WorkerGroup, WorkerGroupConfig};
pub use state::{WorkerPhase, WorkerState};

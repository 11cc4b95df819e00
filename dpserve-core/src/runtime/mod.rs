//! Process runtime and shutdown handling

pub mod executor;
pub mod shutdown;

pub use executor::{NodeRuntime, RuntimeConfig};
pub use shutdown::{os_signal, ShutdownSignal};

//! Discovery channel
//!
//! Child nodes announce themselves to the head's discovery listener and
//! receive their rank range. Wire types are shared with the control routes.

pub mod client;
pub mod protocol;
pub mod server;

pub use client::{ClientConfig, DiscoveryClient};
pub use server::discovery_routes;

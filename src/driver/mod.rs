//! Async Driver
//!
//! Bridges the synchronous machine stack to an [`IoSubmitter`]: one
//! [`PortDiscovery`] per session and a [`DiscoveryManager`] that serializes
//! sessions per port.
//!
//! [`IoSubmitter`]: crate::domain::ports::IoSubmitter

pub mod manager;
pub mod port;

pub use manager::DiscoveryManager;
pub use port::PortDiscovery;

//! Domain layer - Port definitions
//!
//! This module defines the traits (ports) that collaborators implement:
//! the request submission path below the core and the mapping layer above it.

pub mod ports;

pub use ports::*;

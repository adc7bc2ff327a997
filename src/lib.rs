//! SAS Topology - Fabric Discovery Core
//!
//! Discovers the expanders and end devices behind each host port, programs
//! expander route tables, brings devices up, and reconciles the result with
//! the previous session before handing it to the storage stack.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────────┐
//! │                           Discovery Manager                                  │
//! │              (one session per port, retry with backoff)                      │
//! ├─────────────────────────────────────────────────────────────────────────────┤
//! │  ┌─────────────────┐  ┌─────────────────┐  ┌─────────────────────────────┐  │
//! │  │  Port Driver    │  │  Machine Stack  │  │      Reconciliation         │  │
//! │  │ (timeout/quirk) │─►│ (resumable FSMs)│─►│  (hot-plug, multipath)      │  │
//! │  └────────┬────────┘  └────────┬────────┘  └─────────────┬───────────────┘  │
//! │           │                    │                         │                   │
//! │           │        ┌───────────┴───────────┐             │                   │
//! │           │        │   Target Registry     │◄────────────┘                   │
//! │           │        │ (generational arena)  │──► TopologyEvent broadcast      │
//! │           │        └───────────────────────┘                                │
//! ├───────────┼─────────────────────────────────────────────────────────────────┤
//! │           ▼                 Ports                                            │
//! │  ┌─────────────────────────────┐  ┌─────────────────────────────────────┐   │
//! │  │        IoSubmitter          │  │           MappingLayer              │   │
//! │  │ (HBA driver or simulation)  │  │        (storage stack)              │   │
//! │  └─────────────────────────────┘  └─────────────────────────────────────┘   │
//! └─────────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Modules
//!
//! - [`discovery`]: Machine stack and every discovery machine
//! - [`driver`]: Async driver and per-port session manager
//! - [`topology`]: Targets, route tables and the registry
//! - [`domain`]: Ports to the I/O collaborator and the mapping layer
//! - [`sim`]: In-memory fabric for tests and dry runs
//! - [`metrics`]: Prometheus metrics
//! - [`error`]: Error types and handling

pub mod discovery;
pub mod domain;
pub mod driver;
pub mod error;
pub mod metrics;
pub mod sim;
pub mod topology;

// Re-export commonly used types
pub use discovery::{
    Advisory, DiscoveryConfig, MachineStack, PortDescriptor, QuirkHook, RouteAlgorithm, SessionState,
    VitesseSesQuirk,
};

pub use domain::ports::{
    Completion, IoSubmitter, IoSubmitterRef, MappingLayer, MappingLayerRef, PendingRequest, RequestOutcome,
    SessionReport, TargetSnapshot,
};

pub use driver::{DiscoveryManager, PortDiscovery};

pub use error::{Error, ErrorAction, Result};

pub use metrics::{gather_text, DiscoveryMetrics};

pub use sim::{FabricSpec, RecordingMappingLayer, SimulatedFabric};

pub use topology::{
    CommandSet, DeviceRole, LinkRate, Listing, PortId, SasAddress, Target, TargetHandle, TargetRegistry,
    TopologyEvent, TransportKind,
};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Library name
pub const NAME: &str = env!("CARGO_PKG_NAME");

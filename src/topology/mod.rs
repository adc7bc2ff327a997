//! Fabric Topology Model
//!
//! Value types, target nodes, the route-table mirror and the registry that
//! owns them. Everything here is synchronous; the discovery machines mutate
//! the registry between suspension points.

pub mod address;
pub mod events;
pub mod identity;
pub mod registry;
pub mod route_table;
pub mod target;

mod proptests;

pub use address::{DeviceRole, LinkRate, PortId, ProtocolSet, RoutingAttribute, SasAddress};
pub use events::TopologyEvent;
pub use identity::{
    AtaFeatures, AtaIdentifyData, EndDeviceIdentity, FeaturePolicy, Fis, IdSource, InquirySummary, SetFeature,
    UniqueId,
};
pub use registry::{Origin, RegistryStats, TargetRegistry, DEFAULT_MAX_TARGETS};
pub use route_table::{Placement, RouteEntry, RouteTable};
pub use target::{
    CommandSet, ExpanderState, Listing, ManufacturerInfo, PhyDescriptor, Target, TargetFlags, TargetHandle,
    TransportKind, Upstream,
};

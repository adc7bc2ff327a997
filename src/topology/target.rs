//! Target Node
//!
//! One addressable node of the fabric, either an expander or an end device.
//! Tree and multipath relationships are stored as registry handles; the
//! registry owns every Target and keeps both sides of each link consistent.

use crate::topology::address::{DeviceRole, LinkRate, PortId, ProtocolSet, RoutingAttribute, SasAddress};
use crate::topology::identity::EndDeviceIdentity;
use crate::topology::route_table::RouteTable;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// =============================================================================
// Target Handle
// =============================================================================

/// Stable handle into the target registry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TargetHandle {
    pub(crate) index: u32,
    pub(crate) generation: u32,
}

impl TargetHandle {
    pub(crate) fn new(index: u32, generation: u32) -> Self {
        Self { index, generation }
    }
}

impl std::fmt::Display for TargetHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "t{}.{}", self.index, self.generation)
    }
}

// =============================================================================
// Classification
// =============================================================================

/// Transport used to reach the target
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransportKind {
    /// SMP
    Management,
    /// SSP
    ScsiTransport,
    /// STP through an expander
    AtaTransport,
    /// SATA device directly on a host phy
    LegacyAtaDirect,
}

impl std::fmt::Display for TransportKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TransportKind::Management => write!(f, "smp"),
            TransportKind::ScsiTransport => write!(f, "ssp"),
            TransportKind::AtaTransport => write!(f, "stp"),
            TransportKind::LegacyAtaDirect => write!(f, "sata"),
        }
    }
}

/// Command set spoken by the target
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CommandSet {
    Unknown,
    Scsi,
    Ata,
    Atapi,
    Management,
    /// Bring-up gave up on this device
    Invalid,
}

impl CommandSet {
    pub fn is_ata(self) -> bool {
        matches!(self, CommandSet::Ata | CommandSet::Atapi)
    }
}

impl std::fmt::Display for CommandSet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CommandSet::Unknown => write!(f, "unknown"),
            CommandSet::Scsi => write!(f, "scsi"),
            CommandSet::Ata => write!(f, "ata"),
            CommandSet::Atapi => write!(f, "atapi"),
            CommandSet::Management => write!(f, "management"),
            CommandSet::Invalid => write!(f, "invalid"),
        }
    }
}

/// Which working list a target currently belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Listing {
    /// Result of the last completed session
    Committed,
    /// Seen last session, not yet re-found this session
    Previous,
    /// Found and placed this session
    Current,
    /// Found on the far side of a device-set join, merged after configuration
    AttachedSet,
    /// Found while walking upstream but not yet placed
    Unplaced,
    /// On no list (being enumerated, or excluded)
    Detached,
}

/// Lifecycle flags
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct TargetFlags {
    pub online: bool,
    /// Previously seen and re-found during the running session
    pub reseen: bool,
    pub mapped: bool,
    pub needs_map: bool,
    pub hot_added: bool,
    pub hot_removed: bool,
}

// =============================================================================
// Expander State
// =============================================================================

/// One neighbor-table entry, as reported by a discover response
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct PhyDescriptor {
    pub phy_id: u8,
    pub attached_address: SasAddress,
    #[serde(default)]
    pub attached_phy: u8,
    pub attached_role: DeviceRole,
    #[serde(default)]
    pub routing: RoutingAttribute,
    #[serde(default)]
    pub negotiated_rate: LinkRate,
    #[serde(default)]
    pub target_protocols: ProtocolSet,
    #[serde(default)]
    pub initiator_protocols: ProtocolSet,
}

/// The unique subtractive neighbor of an expander
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Upstream {
    pub address: SasAddress,
    pub attached_phy: u8,
    pub rate: LinkRate,
    /// Local phy facing upstream
    pub phy: u8,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ManufacturerInfo {
    pub vendor: String,
    pub product: String,
    pub revision: String,
}

/// State only expanders carry
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ExpanderState {
    pub phys: Vec<PhyDescriptor>,
    pub route_table: RouteTable,
    pub configurable_route_table: bool,
    pub device_set_root: bool,
    pub manufacturer: Option<ManufacturerInfo>,
}

impl ExpanderState {
    pub fn new(owner: SasAddress, num_phys: usize, route_indexes: usize, configurable: bool) -> Self {
        Self {
            phys: (0..num_phys)
                .map(|i| PhyDescriptor {
                    phy_id: i as u8,
                    ..Default::default()
                })
                .collect(),
            route_table: RouteTable::new(owner, num_phys, route_indexes),
            configurable_route_table: configurable,
            device_set_root: false,
            manufacturer: None,
        }
    }

    pub fn num_phys(&self) -> usize {
        self.phys.len()
    }

    /// Local phys whose neighbor is `address`
    pub fn phys_attached_to(&self, address: SasAddress) -> impl Iterator<Item = u8> + '_ {
        self.phys
            .iter()
            .filter(move |p| !address.is_zero() && p.attached_address == address)
            .map(|p| p.phy_id)
    }

    /// `address` is a direct neighbor of this expander
    pub fn directly_attached(&self, address: SasAddress) -> bool {
        self.phys_attached_to(address).next().is_some()
    }
}

// =============================================================================
// Target
// =============================================================================

/// One node of the fabric
#[derive(Debug, Clone)]
pub struct Target {
    pub handle: TargetHandle,
    pub address: SasAddress,
    /// Local ordinal, assigned once at allocation
    pub ordinal: u32,
    pub port: PortId,
    pub link_rate: LinkRate,
    pub transport: TransportKind,
    pub command_set: CommandSet,
    pub role: DeviceRole,
    pub parent: Option<TargetHandle>,
    pub children: Vec<TargetHandle>,
    /// Secondary paths to this device, held by the primary path
    pub multipath: Vec<TargetHandle>,
    /// Primary path this target is chained onto
    pub multipath_of: Option<TargetHandle>,
    pub flags: TargetFlags,
    pub listing: Listing,
    pub(crate) seq: u64,
    pub expander: Option<ExpanderState>,
    pub identity: EndDeviceIdentity,
    /// Upper-stack id once mapped
    pub mapped_id: Option<u32>,
    pub first_seen: DateTime<Utc>,
}

impl Target {
    pub(crate) fn new(
        handle: TargetHandle,
        ordinal: u32,
        port: PortId,
        address: SasAddress,
        link_rate: LinkRate,
        transport: TransportKind,
    ) -> Self {
        Self {
            handle,
            address,
            ordinal,
            port,
            link_rate,
            transport,
            command_set: CommandSet::Unknown,
            role: DeviceRole::Unknown,
            parent: None,
            children: Vec::new(),
            multipath: Vec::new(),
            multipath_of: None,
            flags: TargetFlags::default(),
            listing: Listing::Detached,
            seq: 0,
            expander: None,
            identity: EndDeviceIdentity::default(),
            mapped_id: None,
            first_seen: Utc::now(),
        }
    }

    #[inline]
    pub fn is_expander(&self) -> bool {
        self.role.is_expander()
    }

    #[inline]
    pub fn is_end_device(&self) -> bool {
        self.role == DeviceRole::EndDevice
    }

    pub fn is_device_set_root(&self) -> bool {
        self.expander.as_ref().map(|e| e.device_set_root).unwrap_or(false)
    }

    /// Neighbor table, empty for end devices
    pub fn phys(&self) -> &[PhyDescriptor] {
        self.expander.as_ref().map(|e| e.phys.as_slice()).unwrap_or(&[])
    }

    pub fn num_phys(&self) -> usize {
        self.phys().len()
    }

    /// Identity used to recognise the same device behind another path
    pub fn same_device(&self, other: &Target) -> bool {
        if self.handle == other.handle {
            return false;
        }
        match (self.transport, other.transport) {
            (TransportKind::ScsiTransport, TransportKind::ScsiTransport) => {
                match (&self.identity.unique_id, &other.identity.unique_id) {
                    (Some(a), Some(b)) => a.bytes == b.bytes,
                    _ => false,
                }
            }
            (TransportKind::AtaTransport, TransportKind::AtaTransport) => self.address == other.address,
            _ => false,
        }
    }
}

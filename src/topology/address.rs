//! Fabric Addressing and Link Attributes
//!
//! Value types shared by every layer: fabric addresses, port identifiers,
//! negotiated link rates, routing attributes and device roles as reported by
//! an expander's discover response.

use serde::{Deserialize, Serialize};

// =============================================================================
// Fabric Address
// =============================================================================

/// Globally unique 8-byte fabric address
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SasAddress(pub u64);

impl SasAddress {
    /// The all-zero address, meaning "nothing attached"
    pub const ZERO: SasAddress = SasAddress(0);

    pub fn new(raw: u64) -> Self {
        Self(raw)
    }

    /// Build from the big-endian wire representation
    pub fn from_bytes(bytes: [u8; 8]) -> Self {
        Self(u64::from_be_bytes(bytes))
    }

    /// Big-endian wire representation
    pub fn to_bytes(self) -> [u8; 8] {
        self.0.to_be_bytes()
    }

    #[inline]
    pub fn is_zero(self) -> bool {
        self.0 == 0
    }

    /// First three bytes (IEEE company id for NAA 5 addresses)
    pub fn vendor_prefix(self) -> [u8; 3] {
        let b = self.to_bytes();
        [b[0], b[1], b[2]]
    }

    pub fn as_u64(self) -> u64 {
        self.0
    }
}

impl std::fmt::Display for SasAddress {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:#018x}", self.0)
    }
}

impl From<u64> for SasAddress {
    fn from(raw: u64) -> Self {
        Self(raw)
    }
}

// =============================================================================
// Port ID
// =============================================================================

/// Host-side port identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PortId(pub u8);

impl std::fmt::Display for PortId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u8> for PortId {
    fn from(id: u8) -> Self {
        Self(id)
    }
}

// =============================================================================
// Link Rate
// =============================================================================

/// Negotiated physical link rate.
///
/// Variants are ordered by their wire encoding so the slower of two rates is
/// simply `min(a, b)`. The non-speed states (spin-up hold and friends) sort
/// below every real speed, which keeps a held device held when a faster
/// upstream rate is folded in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
#[repr(u8)]
pub enum LinkRate {
    Unknown = 0x0,
    Disabled = 0x1,
    Failed = 0x2,
    SpinupHold = 0x3,
    PortSelector = 0x4,
    G1_5 = 0x8,
    G3 = 0x9,
    G6 = 0xa,
}

impl LinkRate {
    /// A rate at which a connection can actually be opened
    pub fn is_usable(self) -> bool {
        !matches!(self, LinkRate::Unknown | LinkRate::Disabled | LinkRate::Failed)
    }

    pub fn is_spinup_hold(self) -> bool {
        self == LinkRate::SpinupHold
    }
}

impl Default for LinkRate {
    fn default() -> Self {
        LinkRate::Unknown
    }
}

impl std::fmt::Display for LinkRate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LinkRate::Unknown => write!(f, "unknown"),
            LinkRate::Disabled => write!(f, "disabled"),
            LinkRate::Failed => write!(f, "failed"),
            LinkRate::SpinupHold => write!(f, "spinup-hold"),
            LinkRate::PortSelector => write!(f, "port-selector"),
            LinkRate::G1_5 => write!(f, "1.5G"),
            LinkRate::G3 => write!(f, "3G"),
            LinkRate::G6 => write!(f, "6G"),
        }
    }
}

// =============================================================================
// Routing Attribute
// =============================================================================

/// Per-phy routing attribute of an expander
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RoutingAttribute {
    Direct,
    Subtractive,
    Table,
}

impl Default for RoutingAttribute {
    fn default() -> Self {
        RoutingAttribute::Direct
    }
}

impl std::fmt::Display for RoutingAttribute {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RoutingAttribute::Direct => write!(f, "direct"),
            RoutingAttribute::Subtractive => write!(f, "subtractive"),
            RoutingAttribute::Table => write!(f, "table"),
        }
    }
}

// =============================================================================
// Device Role
// =============================================================================

/// Role of a node in the fabric
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeviceRole {
    NoDevice,
    EndDevice,
    EdgeExpander,
    FanoutExpander,
    Unknown,
}

impl DeviceRole {
    #[inline]
    pub fn is_expander(self) -> bool {
        matches!(self, DeviceRole::EdgeExpander | DeviceRole::FanoutExpander)
    }
}

impl Default for DeviceRole {
    fn default() -> Self {
        DeviceRole::NoDevice
    }
}

impl std::fmt::Display for DeviceRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DeviceRole::NoDevice => write!(f, "none"),
            DeviceRole::EndDevice => write!(f, "end-device"),
            DeviceRole::EdgeExpander => write!(f, "edge-expander"),
            DeviceRole::FanoutExpander => write!(f, "fanout-expander"),
            DeviceRole::Unknown => write!(f, "unknown"),
        }
    }
}

// =============================================================================
// Protocol Set
// =============================================================================

/// Protocols advertised on one side of a link
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ProtocolSet {
    #[serde(default)]
    pub ssp: bool,
    #[serde(default)]
    pub stp: bool,
    #[serde(default)]
    pub smp: bool,
    #[serde(default)]
    pub sata: bool,
}

impl ProtocolSet {
    pub fn is_empty(&self) -> bool {
        !(self.ssp || self.stp || self.smp || self.sata)
    }

    pub fn ssp() -> Self {
        Self { ssp: true, ..Default::default() }
    }

    pub fn stp() -> Self {
        Self { stp: true, ..Default::default() }
    }

    pub fn sata() -> Self {
        Self { sata: true, ..Default::default() }
    }

    pub fn smp() -> Self {
        Self { smp: true, ..Default::default() }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_address_bytes_are_big_endian() {
        let addr = SasAddress::from_bytes([0x50, 0x00, 0x1c, 0x00, 0x00, 0x00, 0x00, 0x0d]);
        assert_eq!(addr.as_u64(), 0x5000_1c00_0000_000d);
        assert_eq!(addr.vendor_prefix(), [0x50, 0x00, 0x1c]);
        assert_eq!(addr.to_string(), "0x50001c000000000d");
        assert!(SasAddress::ZERO.is_zero());
    }

    #[test]
    fn test_slowest_rate_keeps_spinup_hold() {
        assert_eq!(LinkRate::G6.min(LinkRate::G3), LinkRate::G3);
        assert_eq!(LinkRate::G3.min(LinkRate::SpinupHold), LinkRate::SpinupHold);
        assert!(LinkRate::SpinupHold.is_usable());
        assert!(!LinkRate::Failed.is_usable());
    }

    #[test]
    fn test_role_is_expander() {
        assert!(DeviceRole::EdgeExpander.is_expander());
        assert!(DeviceRole::FanoutExpander.is_expander());
        assert!(!DeviceRole::EndDevice.is_expander());
        assert!(!DeviceRole::NoDevice.is_expander());
    }
}

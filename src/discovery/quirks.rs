//! Vendor Quirks
//!
//! Hooks consulted by the driver when a request times out. A hook can ask for
//! the target's link to be re-enabled and the same request resubmitted; the
//! number of such retries per session is capped by
//! [`DiscoveryConfig::max_quirk_retries`](crate::discovery::config::DiscoveryConfig).

use crate::topology::registry::TargetRegistry;
use crate::topology::target::Target;

/// What the driver should do about a timed-out request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QuirkAction {
    /// Deliver the timeout as usual
    None,
    /// Re-enable the link, then resubmit the same request
    RelinkAndRetry,
}

/// Device-specific workaround
pub trait QuirkHook: Send + Sync + std::fmt::Debug {
    fn name(&self) -> &'static str;

    /// Consulted when a request to `target` times out
    fn on_timeout(&self, registry: &TargetRegistry, target: &Target) -> QuirkAction;
}

/// Enclosure processors that stop answering until their link is re-enabled
#[derive(Debug, Clone, Copy, Default)]
pub struct VitesseSesQuirk;

impl VitesseSesQuirk {
    pub const ADDRESS_PREFIX: [u8; 3] = [0x50, 0x00, 0x1c];
}

impl QuirkHook for VitesseSesQuirk {
    fn name(&self) -> &'static str {
        "vitesse_ses"
    }

    fn on_timeout(&self, registry: &TargetRegistry, target: &Target) -> QuirkAction {
        if target.address.vendor_prefix() != Self::ADDRESS_PREFIX {
            return QuirkAction::None;
        }
        let Some(parent) = target.parent.and_then(|p| registry.get(p)) else {
            return QuirkAction::None;
        };
        // The enclosure sits on a virtual phy numbered past the real ones
        if (target.address.as_u64() & 0xf) as usize >= parent.num_phys() {
            QuirkAction::RelinkAndRetry
        } else {
            QuirkAction::None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::topology::address::{LinkRate, PortId, SasAddress};
    use crate::topology::target::{ExpanderState, TransportKind};

    fn fabric(device: u64, parent_phys: usize) -> (TargetRegistry, crate::topology::target::TargetHandle) {
        let mut reg = TargetRegistry::new();
        let parent = reg
            .allocate(PortId(0), SasAddress(0x5000_0000_0000_0100), LinkRate::G3, TransportKind::Management)
            .unwrap();
        reg.target_mut(parent).unwrap().expander = Some(ExpanderState::new(SasAddress(0x100), parent_phys, 0, false));
        let dev = reg
            .allocate(PortId(0), SasAddress(device), LinkRate::G3, TransportKind::ScsiTransport)
            .unwrap();
        reg.add_child(parent, dev, Some(parent));
        (reg, dev)
    }

    #[test]
    fn test_virtual_phy_requests_relink() {
        let (reg, dev) = fabric(0x5000_1c00_0000_000d, 12);
        let target = reg.target(dev).unwrap();
        assert_eq!(VitesseSesQuirk.on_timeout(&reg, target), QuirkAction::RelinkAndRetry);
    }

    #[test]
    fn test_real_phy_or_other_vendor_ignored() {
        let (reg, dev) = fabric(0x5000_1c00_0000_0003, 12);
        assert_eq!(VitesseSesQuirk.on_timeout(&reg, reg.target(dev).unwrap()), QuirkAction::None);

        let (reg, dev) = fabric(0x5000_c500_0000_000d, 12);
        assert_eq!(VitesseSesQuirk.on_timeout(&reg, reg.target(dev).unwrap()), QuirkAction::None);
    }

    #[test]
    fn test_no_parent_ignored() {
        let mut reg = TargetRegistry::new();
        let dev = reg
            .allocate(PortId(0), SasAddress(0x5000_1c00_0000_000f), LinkRate::G3, TransportKind::ScsiTransport)
            .unwrap();
        assert_eq!(VitesseSesQuirk.on_timeout(&reg, reg.target(dev).unwrap()), QuirkAction::None);
    }
}

//! Expander Route-Table Mirror
//!
//! The engine's own copy of every expander's per-phy route table. Future
//! placement decisions read this mirror, so it is only ever written after the
//! matching configure-route request has been accepted by the expander.

use crate::error::{Error, Result};
use crate::topology::address::SasAddress;
use serde::{Deserialize, Serialize};

/// One slot of a phy's route table
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct RouteEntry {
    pub address: SasAddress,
    /// Slot is reserved as a positional placeholder
    pub disabled: bool,
}

impl RouteEntry {
    /// Empty and not reserved
    #[inline]
    pub fn is_vacant(&self) -> bool {
        self.address.is_zero() && !self.disabled
    }
}

/// Where a routed address should go
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Placement {
    /// The address already occupies this slot; nothing to program
    Existing(u16),
    /// Program this slot
    Allocate { index: u16, disabled: bool },
}

/// Route-table mirror of a single expander
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RouteTable {
    owner: SasAddress,
    capacity: usize,
    phys: Vec<Vec<RouteEntry>>,
}

impl RouteTable {
    /// Zeroed table with `capacity` slots on each of `num_phys` phys
    pub fn new(owner: SasAddress, num_phys: usize, capacity: usize) -> Self {
        Self {
            owner,
            capacity,
            phys: vec![vec![RouteEntry::default(); capacity]; num_phys],
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn num_phys(&self) -> usize {
        self.phys.len()
    }

    /// Slots in use (routed or reserved) on one phy
    pub fn fill(&self, phy: u8) -> usize {
        self.phys
            .get(phy as usize)
            .map(|slots| slots.iter().filter(|e| !e.is_vacant()).count())
            .unwrap_or(0)
    }

    pub fn entries(&self, phy: u8) -> &[RouteEntry] {
        self.phys.get(phy as usize).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn entry(&self, phy: u8, index: u16) -> Option<&RouteEntry> {
        self.phys.get(phy as usize)?.get(index as usize)
    }

    /// Slot currently routing `address` on `phy`
    pub fn position(&self, phy: u8, address: SasAddress) -> Option<u16> {
        if address.is_zero() {
            return None;
        }
        self.entries(phy)
            .iter()
            .position(|e| e.address == address)
            .map(|i| i as u16)
    }

    pub fn contains(&self, phy: u8, address: SasAddress) -> bool {
        self.position(phy, address).is_some()
    }

    /// Decide which slot `address` should use on `phy`.
    ///
    /// Direct-attribute sources always consume a fresh slot. Anything else
    /// already routed reuses its slot. New slots come from the lowest vacant
    /// index; a zero address takes its slot as a disabled placeholder.
    pub fn place(&self, phy: u8, address: SasAddress, direct: bool) -> Result<Placement> {
        let slots = self.slots(phy)?;

        if !direct {
            if let Some(index) = self.position(phy, address) {
                return Ok(Placement::Existing(index));
            }
        }

        match slots.iter().position(RouteEntry::is_vacant) {
            Some(index) => Ok(Placement::Allocate {
                index: index as u16,
                disabled: address.is_zero(),
            }),
            None => Err(self.full(phy)),
        }
    }

    /// Mirror an accepted configure-route request
    pub fn commit(&mut self, phy: u8, index: u16, address: SasAddress, disabled: bool) -> Result<()> {
        if index as usize >= self.capacity {
            return Err(self.full(phy));
        }
        let slots = self.slots_mut(phy)?;
        slots[index as usize] = RouteEntry { address, disabled };
        Ok(())
    }

    /// Forget all routed addresses; hardware is reprogrammed every session
    pub fn clear(&mut self) {
        for slots in &mut self.phys {
            slots.iter_mut().for_each(|e| *e = RouteEntry::default());
        }
    }

    fn slots(&self, phy: u8) -> Result<&[RouteEntry]> {
        self.phys
            .get(phy as usize)
            .map(Vec::as_slice)
            .ok_or_else(|| Error::Internal(format!("expander {} has no phy {}", self.owner, phy)))
    }

    fn slots_mut(&mut self, phy: u8) -> Result<&mut Vec<RouteEntry>> {
        let owner = self.owner;
        self.phys
            .get_mut(phy as usize)
            .ok_or_else(|| Error::Internal(format!("expander {} has no phy {}", owner, phy)))
    }

    fn full(&self, phy: u8) -> Error {
        Error::RouteTableFull {
            expander: self.owner.to_string(),
            phy,
            capacity: self.capacity,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    const OWNER: SasAddress = SasAddress(0x5000_0000_0000_0100);

    #[test]
    fn test_place_appends_then_reuses() {
        let mut table = RouteTable::new(OWNER, 4, 3);
        let dev = SasAddress(0x5000_0000_0000_0201);

        let placement = table.place(1, dev, false).unwrap();
        assert_eq!(placement, Placement::Allocate { index: 0, disabled: false });
        table.commit(1, 0, dev, false).unwrap();

        assert_eq!(table.place(1, dev, false).unwrap(), Placement::Existing(0));
        assert_eq!(table.fill(1), 1);
        assert_eq!(table.fill(0), 0);
    }

    #[test]
    fn test_direct_always_allocates() {
        let mut table = RouteTable::new(OWNER, 1, 3);
        let dev = SasAddress(0x5000_0000_0000_0201);
        table.commit(0, 0, dev, false).unwrap();

        assert_matches!(
            table.place(0, dev, true).unwrap(),
            Placement::Allocate { index: 1, disabled: false }
        );
    }

    #[test]
    fn test_zero_address_reserves_placeholder() {
        let mut table = RouteTable::new(OWNER, 1, 2);
        let placement = table.place(0, SasAddress::ZERO, false).unwrap();
        assert_eq!(placement, Placement::Allocate { index: 0, disabled: true });
        table.commit(0, 0, SasAddress::ZERO, true).unwrap();

        // The placeholder is not handed out again
        let next = table.place(0, SasAddress(7), false).unwrap();
        assert_eq!(next, Placement::Allocate { index: 1, disabled: false });
        assert_eq!(table.fill(0), 1);
    }

    #[test]
    fn test_full_table_is_an_error() {
        let mut table = RouteTable::new(OWNER, 1, 1);
        table.commit(0, 0, SasAddress(1), false).unwrap();

        assert_matches!(
            table.place(0, SasAddress(2), false),
            Err(Error::RouteTableFull { phy: 0, capacity: 1, .. })
        );
        assert_matches!(
            table.commit(0, 1, SasAddress(2), false),
            Err(Error::RouteTableFull { .. })
        );
    }

    #[test]
    fn test_clear_empties_every_phy() {
        let mut table = RouteTable::new(OWNER, 2, 2);
        table.commit(0, 0, SasAddress(1), false).unwrap();
        table.commit(1, 1, SasAddress::ZERO, true).unwrap();
        table.clear();
        assert_eq!(table.fill(0), 0);
        assert_eq!(table.fill(1), 0);
        assert!(!table.contains(0, SasAddress(1)));
    }

    #[test]
    fn test_unknown_phy_is_internal_error() {
        let table = RouteTable::new(OWNER, 1, 1);
        assert_matches!(table.place(5, SasAddress(1), false), Err(Error::Internal(_)));
    }
}

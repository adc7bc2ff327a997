//! Property-Based Tests for the Route-Table Mirror and Registry
//!
//! # Test Properties
//!
//! 1. **Capacity**: per-phy fill never exceeds capacity; overflow is an error
//! 2. **Round-trip**: a committed route is found again at its slot
//! 3. **Handle stability**: released handles never alias live targets

#![cfg(test)]

use proptest::prelude::*;

use super::address::{LinkRate, PortId, SasAddress};
use super::registry::TargetRegistry;
use super::route_table::{Placement, RouteTable};
use super::target::{Listing, TransportKind};
use crate::error::Error;

// =============================================================================
// Property Strategies
// =============================================================================

/// Addresses drawn from a small pool so duplicates are common
fn address_strategy() -> impl Strategy<Value = SasAddress> {
    prop_oneof![
        1 => Just(SasAddress::ZERO),
        8 => (1u64..=24).prop_map(|n| SasAddress(0x5000_0000_0000_0000 | n)),
    ]
}

/// (address, direct) route requests against one phy
fn requests_strategy() -> impl Strategy<Value = Vec<(SasAddress, bool)>> {
    prop::collection::vec((address_strategy(), any::<bool>()), 0..64)
}

// =============================================================================
// Route Table Properties
// =============================================================================

proptest! {
    #![proptest_config(ProptestConfig::with_cases(100))]

    /// Fill never exceeds capacity, and overflow surfaces as RouteTableFull
    #[test]
    fn prop_fill_bounded_by_capacity(
        capacity in 1usize..16,
        requests in requests_strategy(),
    ) {
        let mut table = RouteTable::new(SasAddress(1), 2, capacity);
        for (address, direct) in requests {
            match table.place(1, address, direct) {
                Ok(Placement::Allocate { index, disabled }) => {
                    prop_assert!((index as usize) < capacity);
                    table.commit(1, index, address, disabled).unwrap();
                }
                Ok(Placement::Existing(index)) => {
                    prop_assert!(!direct);
                    prop_assert_eq!(table.entry(1, index).unwrap().address, address);
                }
                Err(Error::RouteTableFull { capacity: c, .. }) => {
                    prop_assert_eq!(c, capacity);
                    prop_assert_eq!(table.fill(1), capacity);
                }
                Err(e) => prop_assert!(false, "unexpected error: {}", e),
            }
            prop_assert!(table.fill(1) <= capacity);
        }
        prop_assert_eq!(table.fill(0), 0);
    }

    /// A committed non-zero route is retrievable at the slot it was given
    #[test]
    fn prop_commit_round_trip(
        capacity in 1usize..16,
        raw in 1u64..u64::MAX,
    ) {
        let mut table = RouteTable::new(SasAddress(1), 1, capacity);
        let address = SasAddress(raw);
        let index = match table.place(0, address, false).unwrap() {
            Placement::Allocate { index, .. } => index,
            Placement::Existing(_) => unreachable!("table starts empty"),
        };
        table.commit(0, index, address, false).unwrap();
        prop_assert_eq!(table.position(0, address), Some(index));
        prop_assert_eq!(table.place(0, address, false).unwrap(), Placement::Existing(index));
    }
}

// =============================================================================
// Registry Properties
// =============================================================================

proptest! {
    #![proptest_config(ProptestConfig::with_cases(100))]

    /// Interleaved allocate/release never lets a stale handle resolve
    #[test]
    fn prop_released_handles_stay_dead(ops in prop::collection::vec(any::<bool>(), 1..128)) {
        let mut reg = TargetRegistry::new();
        let mut live = Vec::new();
        let mut dead = Vec::new();
        for (i, allocate) in ops.into_iter().enumerate() {
            if allocate || live.is_empty() {
                let h = reg
                    .allocate(PortId(0), SasAddress(i as u64 + 1), LinkRate::G3, TransportKind::ScsiTransport)
                    .unwrap();
                live.push(h);
            } else {
                let h = live.swap_remove(0);
                reg.release(h);
                dead.push(h);
            }
        }
        prop_assert_eq!(reg.len(), live.len());
        for h in &dead {
            prop_assert!(reg.get(*h).is_none());
        }
        for h in &live {
            prop_assert_eq!(reg.target(*h).unwrap().handle, *h);
        }
    }

    /// Re-found addresses keep their handle across acquire
    #[test]
    fn prop_acquire_reidentifies(count in 1usize..32) {
        let mut reg = TargetRegistry::new();
        let port = PortId(3);
        let mut handles = Vec::new();
        for i in 0..count {
            let h = reg
                .allocate(port, SasAddress(0x100 + i as u64), LinkRate::G3, TransportKind::ScsiTransport)
                .unwrap();
            reg.set_listing(h, Listing::Previous).unwrap();
            handles.push(h);
        }
        for (i, h) in handles.iter().enumerate() {
            let (found, _) = reg
                .acquire(port, SasAddress(0x100 + i as u64), LinkRate::G6, TransportKind::ScsiTransport)
                .unwrap();
            prop_assert_eq!(found, *h);
        }
        prop_assert!(reg.listed(port, Listing::Previous).is_empty());
    }
}

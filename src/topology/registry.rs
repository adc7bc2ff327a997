//! Target Registry
//!
//! A generational arena owning every Target the adapter knows about. Tree
//! links and multipath chains are handle sets maintained from both ends here,
//! and a per-target listing tag stands in for membership of the working lists
//! (committed, previous, current, unplaced). List order is insertion order,
//! tracked with a monotonically increasing sequence number.

use crate::error::{Error, Result};
use crate::topology::address::{LinkRate, PortId, SasAddress};
use crate::topology::events::TopologyEvent;
use crate::topology::target::{Listing, Target, TargetHandle, TransportKind};
use tokio::sync::broadcast;

// =============================================================================
// Constants
// =============================================================================

/// Default upper bound on live targets across all ports
pub const DEFAULT_MAX_TARGETS: usize = 4096;

/// Capacity of the event channel
const EVENT_CHANNEL_CAPACITY: usize = 1024;

// =============================================================================
// Slots
// =============================================================================

#[derive(Debug)]
struct Slot {
    generation: u32,
    target: Option<Target>,
}

/// Where `acquire` found its target
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Origin {
    /// Re-found from the previous session
    Previous,
    /// Already found earlier this session but not yet placed
    Unplaced,
    /// Freshly allocated
    New,
}

/// Registry counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RegistryStats {
    pub live: usize,
    pub allocated: u64,
    pub released: u64,
    pub reidentified: u64,
}

// =============================================================================
// Target Registry
// =============================================================================

#[derive(Debug)]
pub struct TargetRegistry {
    slots: Vec<Slot>,
    free: Vec<u32>,
    max_targets: usize,
    next_ordinal: u32,
    next_seq: u64,
    stats: RegistryStats,
    event_sender: broadcast::Sender<TopologyEvent>,
}

impl TargetRegistry {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_MAX_TARGETS)
    }

    pub fn with_capacity(max_targets: usize) -> Self {
        let (event_sender, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            slots: Vec::new(),
            free: Vec::new(),
            max_targets,
            next_ordinal: 0,
            next_seq: 0,
            stats: RegistryStats::default(),
            event_sender,
        }
    }

    /// Subscribe to topology events
    pub fn subscribe(&self) -> broadcast::Receiver<TopologyEvent> {
        self.event_sender.subscribe()
    }

    pub(crate) fn emit(&self, event: TopologyEvent) {
        // No subscribers is fine
        let _ = self.event_sender.send(event);
    }

    pub fn stats(&self) -> RegistryStats {
        self.stats
    }

    pub fn len(&self) -> usize {
        self.stats.live
    }

    pub fn is_empty(&self) -> bool {
        self.stats.live == 0
    }

    // =========================================================================
    // Allocation
    // =========================================================================

    /// Allocate a fresh, detached target
    pub fn allocate(
        &mut self,
        port: PortId,
        address: SasAddress,
        link_rate: LinkRate,
        transport: TransportKind,
    ) -> Result<TargetHandle> {
        if self.stats.live >= self.max_targets {
            return Err(Error::RegistryExhausted {
                capacity: self.max_targets,
            });
        }

        let index = match self.free.pop() {
            Some(index) => index,
            None => {
                self.slots.push(Slot {
                    generation: 0,
                    target: None,
                });
                (self.slots.len() - 1) as u32
            }
        };
        let slot = &mut self.slots[index as usize];
        let handle = TargetHandle::new(index, slot.generation);
        let ordinal = self.next_ordinal;
        self.next_ordinal = self.next_ordinal.wrapping_add(1);
        slot.target = Some(Target::new(handle, ordinal, port, address, link_rate, transport));

        self.stats.live += 1;
        self.stats.allocated += 1;
        Ok(handle)
    }

    /// Re-identify `address` from the previous session, then from the
    /// unplaced list, or allocate a new target. The result is detached.
    pub fn acquire(
        &mut self,
        port: PortId,
        address: SasAddress,
        link_rate: LinkRate,
        transport: TransportKind,
    ) -> Result<(TargetHandle, Origin)> {
        if let Some(handle) = self.find(port, Listing::Previous, address) {
            let target = self.target_mut(handle)?;
            target.flags.reseen = true;
            target.link_rate = link_rate;
            target.listing = Listing::Detached;
            self.stats.reidentified += 1;
            return Ok((handle, Origin::Previous));
        }
        if let Some(handle) = self.find(port, Listing::Unplaced, address) {
            self.target_mut(handle)?.listing = Listing::Detached;
            return Ok((handle, Origin::Unplaced));
        }
        let handle = self.allocate(port, address, link_rate, transport)?;
        Ok((handle, Origin::New))
    }

    /// Drop a target, unlinking it from the tree and any multipath chain
    pub fn release(&mut self, handle: TargetHandle) {
        if self.get(handle).is_none() {
            return;
        }
        self.detach_parent(handle);
        self.unchain_multipath(handle);

        let (children, peers) = match self.get_mut(handle) {
            Some(t) => (std::mem::take(&mut t.children), std::mem::take(&mut t.multipath)),
            None => return,
        };
        for child in children {
            if let Some(c) = self.get_mut(child) {
                c.parent = None;
            }
        }
        for peer in peers {
            if let Some(p) = self.get_mut(peer) {
                p.multipath_of = None;
            }
        }

        let slot = &mut self.slots[handle.index as usize];
        slot.target = None;
        slot.generation = slot.generation.wrapping_add(1);
        self.free.push(handle.index);
        self.stats.live -= 1;
        self.stats.released += 1;
    }

    /// Put back a copy taken earlier, if its handle is still live
    pub(crate) fn restore(&mut self, snapshot: Target) -> bool {
        let handle = snapshot.handle;
        match self.get_mut(handle) {
            Some(target) => {
                *target = snapshot;
                true
            }
            None => false,
        }
    }

    // =========================================================================
    // Access
    // =========================================================================

    pub fn get(&self, handle: TargetHandle) -> Option<&Target> {
        self.slots
            .get(handle.index as usize)
            .filter(|s| s.generation == handle.generation)
            .and_then(|s| s.target.as_ref())
    }

    pub fn get_mut(&mut self, handle: TargetHandle) -> Option<&mut Target> {
        self.slots
            .get_mut(handle.index as usize)
            .filter(|s| s.generation == handle.generation)
            .and_then(|s| s.target.as_mut())
    }

    pub fn target(&self, handle: TargetHandle) -> Result<&Target> {
        self.get(handle).ok_or_else(|| Error::TargetNotFound {
            handle: handle.to_string(),
        })
    }

    pub fn target_mut(&mut self, handle: TargetHandle) -> Result<&mut Target> {
        self.get_mut(handle).ok_or_else(|| Error::TargetNotFound {
            handle: handle.to_string(),
        })
    }

    pub fn contains(&self, handle: TargetHandle) -> bool {
        self.get(handle).is_some()
    }

    /// All live targets, in arena order
    pub fn iter(&self) -> impl Iterator<Item = &Target> {
        self.slots.iter().filter_map(|s| s.target.as_ref())
    }

    // =========================================================================
    // Listings
    // =========================================================================

    /// Move a target to the tail of `listing`
    pub fn set_listing(&mut self, handle: TargetHandle, listing: Listing) -> Result<()> {
        let seq = self.next_seq;
        let target = self.target_mut(handle)?;
        target.listing = listing;
        target.seq = seq;
        self.next_seq += 1;
        Ok(())
    }

    /// Targets of `port` on `listing`, in list order
    pub fn listed(&self, port: PortId, listing: Listing) -> Vec<TargetHandle> {
        let mut found: Vec<(u64, TargetHandle)> = self
            .iter()
            .filter(|t| t.port == port && t.listing == listing)
            .map(|t| (t.seq, t.handle))
            .collect();
        found.sort_unstable();
        found.into_iter().map(|(_, h)| h).collect()
    }

    /// Targets of every port on `listing`, in list order
    pub fn listed_all_ports(&self, listing: Listing) -> Vec<TargetHandle> {
        let mut found: Vec<(u64, TargetHandle)> = self
            .iter()
            .filter(|t| t.listing == listing)
            .map(|t| (t.seq, t.handle))
            .collect();
        found.sort_unstable();
        found.into_iter().map(|(_, h)| h).collect()
    }

    /// Move every target of `port` on `from` to the tail of `to`, keeping order
    pub fn splice(&mut self, port: PortId, from: Listing, to: Listing) {
        for handle in self.listed(port, from) {
            // Handles come straight from `listed`, so they are live
            let _ = self.set_listing(handle, to);
        }
    }

    /// First target of `port` on `listing` with `address`
    pub fn find(&self, port: PortId, listing: Listing, address: SasAddress) -> Option<TargetHandle> {
        self.iter()
            .filter(|t| t.port == port && t.listing == listing && t.address == address)
            .min_by_key(|t| t.seq)
            .map(|t| t.handle)
    }

    // =========================================================================
    // Tree Links
    // =========================================================================

    /// Link `child` under `parent` unless it is the tree root or already has
    /// a parent. Returns whether a link was made.
    pub fn add_child(&mut self, parent: TargetHandle, child: TargetHandle, tree_root: Option<TargetHandle>) -> bool {
        if Some(child) == tree_root || parent == child {
            return false;
        }
        match self.get(child) {
            Some(c) if c.parent.is_none() => {}
            _ => return false,
        }
        if !self.contains(parent) {
            return false;
        }
        if let Some(c) = self.get_mut(child) {
            c.parent = Some(parent);
        }
        if let Some(p) = self.get_mut(parent) {
            p.children.push(child);
        }
        true
    }

    /// Remove `handle` from its parent's child set
    pub fn detach_parent(&mut self, handle: TargetHandle) {
        let parent = match self.get_mut(handle) {
            Some(t) => t.parent.take(),
            None => return,
        };
        if let Some(p) = parent.and_then(|p| self.get_mut(p)) {
            p.children.retain(|&c| c != handle);
        }
    }

    /// Forget tree links ahead of a fresh walk. Multipath chains span ports
    /// and survive until reconciliation.
    pub fn reset_links(&mut self, handle: TargetHandle) {
        self.detach_parent(handle);
        let children = match self.get_mut(handle) {
            Some(t) => std::mem::take(&mut t.children),
            None => return,
        };
        for child in children {
            if let Some(c) = self.get_mut(child) {
                c.parent = None;
            }
        }
    }

    // =========================================================================
    // Multipath Chains
    // =========================================================================

    /// Chain `secondary` (and anything already chained on it) onto `primary`
    pub fn chain_multipath(&mut self, primary: TargetHandle, secondary: TargetHandle) {
        if primary == secondary || !self.contains(primary) || !self.contains(secondary) {
            return;
        }
        self.unchain_multipath(secondary);
        let inherited = match self.get_mut(secondary) {
            Some(s) => {
                s.multipath_of = Some(primary);
                std::mem::take(&mut s.multipath)
            }
            None => return,
        };
        for &peer in &inherited {
            if let Some(p) = self.get_mut(peer) {
                p.multipath_of = Some(primary);
            }
        }
        if let Some(p) = self.get_mut(primary) {
            if !p.multipath.contains(&secondary) {
                p.multipath.push(secondary);
            }
            for peer in inherited {
                if peer != primary && !p.multipath.contains(&peer) {
                    p.multipath.push(peer);
                }
            }
        }
    }

    /// Take `handle` off the chain it is a secondary of
    pub fn unchain_multipath(&mut self, handle: TargetHandle) {
        let primary = match self.get_mut(handle) {
            Some(t) => t.multipath_of.take(),
            None => return,
        };
        if let Some(p) = primary.and_then(|p| self.get_mut(p)) {
            p.multipath.retain(|&m| m != handle);
        }
    }
}

impl Default for TargetRegistry {
    fn default() -> Self {
        Self::new()
    }
}

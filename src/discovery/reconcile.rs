//! Reconciliation
//!
//! Compares the freshly placed target set against what the previous session
//! committed. Targets that vanished are either remapped onto another path to
//! the same device or reported as removals; new end devices are deduplicated
//! against every settled path and mapped once. Paths still being discovered
//! on another port are never used. The current list then becomes
//! the committed list.

use crate::discovery::context::Context;
use crate::domain::ports::{SessionReport, TargetSnapshot};
use crate::error::Result;
use crate::topology::address::PortId;
use crate::topology::events::TopologyEvent;
use crate::topology::registry::TargetRegistry;
use crate::topology::target::{CommandSet, Listing, Target, TargetHandle};
use chrono::Utc;
use std::collections::BTreeSet;
use tracing::{debug, info};

/// Fold the session's current list into the committed topology
pub fn reconcile(cx: &mut Context<'_>) -> Result<SessionReport> {
    let port = cx.port();
    let initial = cx.session.committed_snapshot.is_empty();

    let (removals, remapped) = retire_vanished(cx.registry, port)?;

    let current = cx.registry.listed(port, Listing::Current);
    let mut candidates = Vec::new();
    for &handle in &current {
        let target = cx.target_mut(handle)?;
        target.flags.online = true;
        target.flags.reseen = false;
        target.flags.hot_added = false;
        target.flags.needs_map = target.is_end_device()
            && !target.flags.mapped
            && target.multipath_of.is_none()
            && target.command_set != CommandSet::Invalid;
        if target.flags.needs_map {
            candidates.push(handle);
        }
    }

    mark_duplicates(cx.registry, port, &candidates);
    let added = map_targets(cx.registry, &candidates, !initial)?;

    cx.registry.splice(port, Listing::Current, Listing::Committed);

    let registry = &*cx.registry;
    let capture = |h: &TargetHandle| registry.get(*h).map(|t| TargetSnapshot::capture(registry, t));
    let targets: Vec<TargetSnapshot> = registry
        .listed(port, Listing::Committed)
        .iter()
        .filter_map(capture)
        .collect();
    let additions: Vec<TargetSnapshot> = added.iter().filter_map(capture).collect();

    let now = Utc::now();
    for snapshot in &additions {
        registry.emit(TopologyEvent::TargetAdded {
            port: port.0,
            address: snapshot.address.to_string(),
            role: snapshot.role.to_string(),
            timestamp: now,
        });
    }
    for snapshot in &removals {
        registry.emit(TopologyEvent::TargetRemoved {
            port: port.0,
            address: snapshot.address.to_string(),
            timestamp: now,
        });
    }
    registry.emit(TopologyEvent::SessionCompleted {
        port: port.0,
        targets: targets.len(),
        added: additions.len(),
        removed: removals.len(),
        timestamp: now,
    });

    info!(
        port = %port,
        targets = targets.len(),
        added = additions.len(),
        removed = removals.len(),
        remapped = remapped.len(),
        "topology committed"
    );

    Ok(SessionReport {
        port,
        targets,
        additions,
        removals,
        remapped,
        advisories: cx.session.advisories.iter().map(|a| a.to_string()).collect(),
    })
}

/// Handle every previous-session target that was not found again
fn retire_vanished(registry: &mut TargetRegistry, port: PortId) -> Result<(Vec<TargetSnapshot>, Vec<TargetSnapshot>)> {
    let mut removals = Vec::new();
    let mut remapped = Vec::new();

    for handle in registry.listed(port, Listing::Previous) {
        let target = registry.target_mut(handle)?;
        target.flags.hot_removed = true;
        target.flags.online = false;
        let mapped = target.flags.mapped;
        let from_port = target.port;
        let address = target.address;

        let survivor = same_device_path(registry, port, handle).or_else(|| {
            registry.get(handle).and_then(|t| {
                t.multipath
                    .iter()
                    .copied()
                    .find(|&p| registry.get(p).map(|p| settled(p, port)).unwrap_or(false))
            })
        });

        match survivor {
            Some(to) if mapped => {
                remap(registry, handle, to)?;
                let target = registry.target(to)?;
                registry.emit(TopologyEvent::TargetRemapped {
                    address: address.to_string(),
                    from_port: from_port.0,
                    to_port: target.port.0,
                    timestamp: Utc::now(),
                });
                debug!(address = %address, to = %target.address, to_port = %target.port, "remapped onto surviving path");
                remapped.push(TargetSnapshot::capture(registry, target));
            }
            _ if mapped => {
                let target = registry.target(handle)?;
                debug!(address = %address, "device removed");
                removals.push(TargetSnapshot::capture(registry, target));
            }
            _ => {}
        }
        registry.release(handle);
    }
    Ok((removals, remapped))
}

/// Whether `target` may take over or anchor a mapping from `port`'s commit.
/// Another port's working list can still be rolled back, so only its
/// committed targets count.
fn settled(target: &Target, port: PortId) -> bool {
    if target.port == port {
        target.listing == Listing::Current
    } else {
        target.listing == Listing::Committed
    }
}

/// Another settled path that reaches the same device
fn same_device_path(registry: &TargetRegistry, port: PortId, handle: TargetHandle) -> Option<TargetHandle> {
    let target = registry.get(handle)?;
    registry
        .iter()
        .filter(|t| settled(t, port))
        .find(|t| t.same_device(target))
        .map(|t| t.handle)
}

/// Move the mapping of `from` onto `to`, which becomes the primary path
fn remap(registry: &mut TargetRegistry, from: TargetHandle, to: TargetHandle) -> Result<()> {
    let (mapped_id, peers) = {
        let source = registry.target_mut(from)?;
        source.flags.mapped = false;
        (source.mapped_id.take(), source.multipath.clone())
    };
    registry.unchain_multipath(to);
    for peer in peers {
        if peer != to {
            registry.chain_multipath(to, peer);
        }
    }
    let target = registry.target_mut(to)?;
    target.flags.mapped = true;
    target.flags.needs_map = false;
    target.mapped_id = mapped_id;
    Ok(())
}

/// Chain every candidate that duplicates an already mapped device, or an
/// earlier candidate, onto that path
fn mark_duplicates(registry: &mut TargetRegistry, port: PortId, candidates: &[TargetHandle]) {
    let mut primaries: Vec<TargetHandle> = Vec::new();
    for &handle in candidates {
        let Some(target) = registry.get(handle) else {
            continue;
        };
        let primary = registry
            .iter()
            .filter(|p| p.flags.mapped && p.multipath_of.is_none())
            .filter(|p| settled(p, port))
            .find(|p| p.same_device(target))
            .map(|p| p.handle)
            .or_else(|| {
                primaries
                    .iter()
                    .copied()
                    .find(|&p| registry.get(p).map(|p| p.same_device(target)).unwrap_or(false))
            });

        match primary {
            Some(primary) => {
                let address = target.address;
                registry.chain_multipath(primary, handle);
                if let Some(t) = registry.get_mut(handle) {
                    t.flags.needs_map = false;
                }
                debug!(address = %address, "duplicate path chained");
            }
            None => primaries.push(handle),
        }
    }
}

/// Map every candidate still needing it. Returns the newly mapped handles.
fn map_targets(registry: &mut TargetRegistry, candidates: &[TargetHandle], hot_plug: bool) -> Result<Vec<TargetHandle>> {
    let mut used: BTreeSet<u32> = registry.iter().filter_map(|t| t.mapped_id).collect();
    let mut mapped = Vec::new();

    for &handle in candidates {
        let target = registry.target_mut(handle)?;
        if !target.flags.needs_map {
            continue;
        }
        let id = (0..).find(|id| !used.contains(id)).unwrap_or(u32::MAX);
        used.insert(id);

        target.flags.needs_map = false;
        target.flags.mapped = true;
        target.flags.hot_added = hot_plug;
        target.mapped_id = Some(id);
        // One upper-stack device per LUN; ATA devices only have LUN 0
        if target.command_set.is_ata() || target.identity.luns.is_empty() {
            target.identity.luns = vec![0];
        }
        mapped.push(handle);
    }
    Ok(mapped)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::discovery::config::DiscoveryConfig;
    use crate::discovery::context::{PortDescriptor, SessionState};
    use crate::topology::address::{DeviceRole, LinkRate, ProtocolSet, SasAddress};
    use crate::topology::identity::{IdSource, UniqueId};
    use crate::topology::target::TransportKind;

    fn session(port: u8) -> SessionState {
        SessionState::new(
            PortDescriptor {
                id: PortId(port),
                local_address: SasAddress(0xff),
                attached_address: SasAddress(0x100),
                attached_role: DeviceRole::EdgeExpander,
                attached_protocols: ProtocolSet::smp(),
                link_rate: LinkRate::G3,
                attached_fis: None,
            },
            DiscoveryConfig::default(),
        )
    }

    fn disk(reg: &mut TargetRegistry, port: u8, address: u64, id: &[u8], listing: Listing) -> TargetHandle {
        let h = reg
            .allocate(PortId(port), SasAddress(address), LinkRate::G3, TransportKind::ScsiTransport)
            .unwrap();
        let t = reg.target_mut(h).unwrap();
        t.role = DeviceRole::EndDevice;
        t.command_set = CommandSet::Scsi;
        t.identity.unique_id = Some(UniqueId::new(id.to_vec(), IdSource::DeviceIdentification));
        t.identity.luns = vec![0, 1];
        reg.set_listing(h, listing).unwrap();
        h
    }

    #[test]
    fn test_initial_session_maps_each_device_once() {
        let mut reg = TargetRegistry::new();
        let a = disk(&mut reg, 0, 0x10, &[1], Listing::Current);
        let b = disk(&mut reg, 0, 0x20, &[1], Listing::Current);
        let c = disk(&mut reg, 0, 0x30, &[2], Listing::Current);
        let mut session = session(0);
        let mut cx = Context::new(&mut reg, &mut session);

        let report = reconcile(&mut cx).unwrap();
        assert_eq!(report.targets.len(), 3);
        assert_eq!(report.additions.len(), 2);
        assert!(report.removals.is_empty());

        assert_eq!(cx.target(a).unwrap().multipath, vec![b]);
        assert!(!cx.target(b).unwrap().flags.mapped);
        assert!(cx.target(c).unwrap().flags.mapped);
        assert!(!cx.target(c).unwrap().flags.hot_added, "first session is not hot-plug");
        assert_eq!(cx.target(a).unwrap().listing, Listing::Committed);
        assert_ne!(cx.target(a).unwrap().mapped_id, cx.target(c).unwrap().mapped_id);
    }

    #[test]
    fn test_vanished_device_reported_removed() {
        let mut reg = TargetRegistry::new();
        let gone = disk(&mut reg, 0, 0x10, &[1], Listing::Previous);
        reg.target_mut(gone).unwrap().flags.mapped = true;
        let kept = disk(&mut reg, 0, 0x20, &[2], Listing::Current);
        {
            let t = reg.target_mut(kept).unwrap();
            t.flags.mapped = true;
            t.flags.reseen = true;
        }
        let mut session = session(0);
        session.committed_snapshot.push(reg.target(kept).unwrap().clone());
        let mut events = reg.subscribe();
        let mut cx = Context::new(&mut reg, &mut session);

        let report = reconcile(&mut cx).unwrap();
        assert_eq!(report.removals.len(), 1);
        assert_eq!(report.removals[0].address, SasAddress(0x10));
        assert!(report.additions.is_empty());
        assert!(report.find(SasAddress(0x10)).is_none());
        assert!(!cx.registry.contains(gone));
        assert!(!cx.target(kept).unwrap().flags.reseen);

        let first = events.try_recv().unwrap();
        assert!(matches!(first, TopologyEvent::TargetRemoved { .. }));
    }

    #[test]
    fn test_vanished_primary_remaps_onto_peer() {
        let mut reg = TargetRegistry::new();
        let primary = disk(&mut reg, 0, 0x10, &[7], Listing::Previous);
        let other = disk(&mut reg, 1, 0x11, &[7], Listing::Committed);
        reg.chain_multipath(primary, other);
        {
            let t = reg.target_mut(primary).unwrap();
            t.flags.mapped = true;
            t.mapped_id = Some(4);
        }
        let mut session = session(0);
        session.committed_snapshot.push(reg.target(primary).unwrap().clone());
        let mut cx = Context::new(&mut reg, &mut session);

        let report = reconcile(&mut cx).unwrap();
        assert!(report.removals.is_empty());
        assert_eq!(report.remapped.len(), 1);
        let survivor = cx.target(other).unwrap();
        assert!(survivor.flags.mapped);
        assert_eq!(survivor.mapped_id, Some(4));
        assert_eq!(survivor.multipath_of, None);
    }

    #[test]
    fn test_new_path_joins_mapped_device_on_other_port() {
        let mut reg = TargetRegistry::new();
        let mapped = disk(&mut reg, 0, 0x10, &[9], Listing::Committed);
        reg.target_mut(mapped).unwrap().flags.mapped = true;
        let second = disk(&mut reg, 1, 0x18, &[9], Listing::Current);
        let mut session = session(1);
        let mut cx = Context::new(&mut reg, &mut session);

        let report = reconcile(&mut cx).unwrap();
        assert!(report.additions.is_empty());
        assert_eq!(cx.target(second).unwrap().multipath_of, Some(mapped));
        assert_eq!(report.targets[0].mapped_id, None);
    }

    #[test]
    fn test_other_ports_working_list_is_not_a_survivor() {
        let mut reg = TargetRegistry::new();
        let gone = disk(&mut reg, 0, 0x10, &[5], Listing::Previous);
        {
            let t = reg.target_mut(gone).unwrap();
            t.flags.mapped = true;
            t.mapped_id = Some(0);
        }
        // Found by a session on port 1 that has not committed yet
        let pending = disk(&mut reg, 1, 0x11, &[5], Listing::Current);
        let mut session = session(0);
        session.committed_snapshot.push(reg.target(gone).unwrap().clone());
        let mut cx = Context::new(&mut reg, &mut session);

        let report = reconcile(&mut cx).unwrap();
        assert!(report.remapped.is_empty());
        assert_eq!(report.removals.len(), 1);
        assert_eq!(report.removals[0].address, SasAddress(0x10));
        let pending = cx.target(pending).unwrap();
        assert!(!pending.flags.mapped);
        assert_eq!(pending.mapped_id, None);
        assert_eq!(pending.listing, Listing::Current);
    }

    #[test]
    fn test_new_path_ignores_other_ports_working_list() {
        let mut reg = TargetRegistry::new();
        let pending = disk(&mut reg, 0, 0x10, &[3], Listing::Current);
        reg.target_mut(pending).unwrap().flags.mapped = true;
        let fresh = disk(&mut reg, 1, 0x18, &[3], Listing::Current);
        let mut session = session(1);
        let mut cx = Context::new(&mut reg, &mut session);

        let report = reconcile(&mut cx).unwrap();
        assert_eq!(report.additions.len(), 1);
        assert_eq!(cx.target(fresh).unwrap().multipath_of, None);
        assert!(cx.target(pending).unwrap().multipath.is_empty());
    }

    #[test]
    fn test_ata_maps_lun_zero_only() {
        let mut reg = TargetRegistry::new();
        let h = reg
            .allocate(PortId(0), SasAddress(0x40), LinkRate::G3, TransportKind::AtaTransport)
            .unwrap();
        {
            let t = reg.target_mut(h).unwrap();
            t.role = DeviceRole::EndDevice;
            t.command_set = CommandSet::Ata;
        }
        reg.set_listing(h, Listing::Current).unwrap();
        let mut session = session(0);
        let mut cx = Context::new(&mut reg, &mut session);

        let report = reconcile(&mut cx).unwrap();
        assert_eq!(report.additions[0].luns, vec![0]);
    }
}

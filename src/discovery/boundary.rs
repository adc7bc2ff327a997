//! Device-Set Boundary Detection
//!
//! Walks upstream from the expander attached to the port, following
//! subtractive phys, until it reaches an expander with no upstream neighbor
//! or a subtractive-to-subtractive join between two device sets. A climb
//! that comes back to an expander it already passed is a wiring loop.

use crate::discovery::context::Context;
use crate::discovery::expander::{DiscoverExpander, ExpanderArgs};
use crate::discovery::stack::{unexpected, Machine, Output, StateMachine, Step, Wake};
use crate::error::{Error, Result};
use crate::topology::address::{DeviceRole, RoutingAttribute, SasAddress};
use crate::topology::target::{Listing, Target, TargetHandle, Upstream};
use tracing::info;

/// Roots of the device sets found at the edge of the port's fabric
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Boundary {
    /// Root of the set containing (or above) the attached expander
    pub root: TargetHandle,
    /// Root of the set joined to `root` through a subtractive-subtractive link
    pub attached_root: Option<TargetHandle>,
}

/// The unique upstream neighbor of an expander, reached through its
/// subtractive phys. `None` means the expander is its device-set root.
pub fn find_subtractive_phy(expander: &Target) -> Result<Option<Upstream>> {
    let mut found: Option<Upstream> = None;
    for phy in expander.phys() {
        if phy.routing != RoutingAttribute::Subtractive || !phy.attached_role.is_expander() {
            continue;
        }
        match found {
            None => {
                found = Some(Upstream {
                    address: phy.attached_address,
                    attached_phy: phy.attached_phy,
                    rate: phy.negotiated_rate,
                    phy: phy.phy_id,
                })
            }
            Some(up) if up.address != phy.attached_address => {
                return Err(Error::TopologyConflict {
                    expander: expander.address.to_string(),
                    first: up.address.to_string(),
                    second: phy.attached_address.to_string(),
                });
            }
            Some(_) => {}
        }
    }
    Ok(found)
}

fn mark_root(cx: &mut Context<'_>, handle: TargetHandle) -> Result<()> {
    if let Some(exp) = cx.target_mut(handle)?.expander.as_mut() {
        exp.device_set_root = true;
    }
    Ok(())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Start,
    Ascending,
}

#[derive(Debug)]
pub struct FindBoundary {
    phase: Phase,
    current: TargetHandle,
    /// Expanders climbed through, in order
    path: Vec<SasAddress>,
}

impl FindBoundary {
    pub fn new(attached: TargetHandle) -> Self {
        Self {
            phase: Phase::Start,
            current: attached,
            path: Vec::new(),
        }
    }

    /// Record `current` on the climb path and reject an upstream neighbor
    /// that is already on it
    fn check_loop(&mut self, current: SasAddress, upstream: SasAddress) -> Result<()> {
        if self.path.last() != Some(&current) {
            self.path.push(current);
        }
        match self.path.iter().position(|&a| a == upstream) {
            None => Ok(()),
            Some(seen) => {
                let next = self.path.get(seen + 1).copied().unwrap_or(current);
                Err(Error::TopologyConflict {
                    expander: upstream.to_string(),
                    first: next.to_string(),
                    second: current.to_string(),
                })
            }
        }
    }

    /// Enumerate the upstream neighbor of `current`, or finish if there is none
    fn climb(&mut self, cx: &mut Context<'_>) -> Result<Step> {
        let current = cx.target(self.current)?;
        let upstream = match find_subtractive_phy(current)? {
            Some(up) if !up.address.is_zero() => up,
            _ => {
                mark_root(cx, self.current)?;
                return Ok(Step::Finished(Output::Boundary(Boundary {
                    root: self.current,
                    attached_root: None,
                })));
            }
        };
        let role = current
            .phys()
            .get(upstream.phy as usize)
            .map(|p| p.attached_role)
            .unwrap_or(DeviceRole::EdgeExpander);
        let current_address = current.address;
        self.check_loop(current_address, upstream.address)?;

        self.phase = Phase::Ascending;
        Ok(Step::Push(Machine::DiscoverExpander(DiscoverExpander::new(ExpanderArgs {
            address: upstream.address,
            role,
            ceiling: upstream.rate,
            upstream: Some(self.current),
        }))))
    }

    fn advance(&mut self, cx: &mut Context<'_>, wake: Wake) -> Result<Step> {
        match (self.phase, wake) {
            (Phase::Start, Wake::Start) => self.climb(cx),
            (Phase::Ascending, Wake::Child(result)) => {
                let upstream = match result? {
                    Output::Target(h) => h,
                    other => return Err(Error::Internal(format!("expected a target, got {:?}", other))),
                };
                let tree_root = cx.session.tree_root;
                cx.registry.add_child(self.current, upstream, tree_root);
                cx.registry.set_listing(upstream, Listing::Unplaced)?;

                let current_address = cx.target(self.current)?.address;
                match find_subtractive_phy(cx.target(upstream)?)? {
                    Some(next) if next.address == current_address => {
                        // Two device sets joined subtractive to subtractive
                        mark_root(cx, self.current)?;
                        mark_root(cx, upstream)?;
                        info!(
                            root = %current_address,
                            attached_root = %cx.target(upstream)?.address,
                            "subtractive join between device sets"
                        );
                        Ok(Step::Finished(Output::Boundary(Boundary {
                            root: self.current,
                            attached_root: Some(upstream),
                        })))
                    }
                    _ => {
                        self.current = upstream;
                        self.climb(cx)
                    }
                }
            }
            (phase, _) => Err(unexpected(self.name(), phase)),
        }
    }
}

impl StateMachine for FindBoundary {
    fn name(&self) -> &'static str {
        "find_boundary"
    }

    fn dispatch(&mut self, cx: &mut Context<'_>, wake: Wake) -> Step {
        self.advance(cx, wake).into()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::discovery::config::DiscoveryConfig;
    use crate::discovery::context::{PortDescriptor, SessionState};
    use crate::discovery::stack::{MachineStack, StackStatus};
    use crate::domain::ports::{Completion, GeneralReport, ManagementBody, ManagementResponse};
    use crate::topology::address::{LinkRate, PortId, ProtocolSet};
    use crate::topology::registry::TargetRegistry;
    use crate::topology::target::{ExpanderState, PhyDescriptor, TargetHandle, TransportKind};
    use assert_matches::assert_matches;

    fn expander_with(phys: Vec<PhyDescriptor>) -> Target {
        let mut t = Target::new(
            TargetHandle::new(0, 0),
            0,
            PortId(0),
            SasAddress(0x100),
            LinkRate::G3,
            TransportKind::Management,
        );
        let mut state = ExpanderState::new(t.address, phys.len(), 0, false);
        state.phys = phys;
        t.expander = Some(state);
        t.role = DeviceRole::EdgeExpander;
        t
    }

    fn subtractive(phy: u8, address: u64, role: DeviceRole) -> PhyDescriptor {
        PhyDescriptor {
            phy_id: phy,
            attached_address: SasAddress(address),
            attached_phy: 7,
            attached_role: role,
            routing: RoutingAttribute::Subtractive,
            negotiated_rate: LinkRate::G3,
            ..Default::default()
        }
    }

    #[test]
    fn test_no_subtractive_expander_is_root() {
        let t = expander_with(vec![subtractive(0, 0x200, DeviceRole::EndDevice)]);
        assert_eq!(find_subtractive_phy(&t).unwrap(), None);
    }

    #[test]
    fn test_wide_subtractive_port_is_one_upstream() {
        let t = expander_with(vec![
            subtractive(0, 0x300, DeviceRole::FanoutExpander),
            subtractive(1, 0x300, DeviceRole::FanoutExpander),
        ]);
        let up = find_subtractive_phy(&t).unwrap().unwrap();
        assert_eq!(up.address, SasAddress(0x300));
        assert_eq!(up.phy, 0);
        assert_eq!(up.attached_phy, 7);
    }

    #[test]
    fn test_conflicting_subtractive_neighbors() {
        let t = expander_with(vec![
            subtractive(0, 0x300, DeviceRole::EdgeExpander),
            subtractive(1, 0x400, DeviceRole::EdgeExpander),
        ]);
        assert_matches!(find_subtractive_phy(&t), Err(Error::TopologyConflict { .. }));
    }

    fn general(num_phys: usize) -> Completion {
        Completion::management(ManagementResponse::accepted(ManagementBody::General(GeneralReport {
            num_phys,
            route_indexes: 0,
            configurable_route_table: false,
        })))
    }

    fn discovered(phy: PhyDescriptor) -> Completion {
        Completion::management(ManagementResponse::accepted(ManagementBody::Discover(phy)))
    }

    #[test]
    fn test_subtractive_loop_is_a_conflict() {
        // 0xa00 -> 0xb00 -> 0xc00 -> 0xa00, all through subtractive phys
        let mut registry = TargetRegistry::new();
        let a = registry
            .allocate(PortId(0), SasAddress(0xa00), LinkRate::G3, TransportKind::Management)
            .unwrap();
        {
            let t = registry.target_mut(a).unwrap();
            t.role = DeviceRole::EdgeExpander;
            let mut state = ExpanderState::new(SasAddress(0xa00), 1, 0, false);
            state.phys = vec![subtractive(0, 0xb00, DeviceRole::EdgeExpander)];
            t.expander = Some(state);
        }
        registry.set_listing(a, Listing::Unplaced).unwrap();

        let mut session = SessionState::new(
            PortDescriptor {
                id: PortId(0),
                local_address: SasAddress(0xff),
                attached_address: SasAddress(0xa00),
                attached_role: DeviceRole::EdgeExpander,
                attached_protocols: ProtocolSet::smp(),
                link_rate: LinkRate::G3,
                attached_fis: None,
            },
            DiscoveryConfig::default(),
        );
        session.tree_root = Some(a);
        let mut cx = Context::new(&mut registry, &mut session);
        let mut stack = MachineStack::new(8);

        let status = stack.push(&mut cx, Machine::FindBoundary(FindBoundary::new(a)));
        assert_matches!(status, StackStatus::Suspended(r) if r.target.address == SasAddress(0xb00));
        stack.resume(&mut cx, general(1));
        let status = stack.resume(&mut cx, discovered(subtractive(0, 0xc00, DeviceRole::EdgeExpander)));
        assert_matches!(status, StackStatus::Suspended(r) if r.target.address == SasAddress(0xc00));
        stack.resume(&mut cx, general(1));
        let status = stack.resume(&mut cx, discovered(subtractive(0, 0xa00, DeviceRole::EdgeExpander)));

        // No third visit to 0xa00
        match status {
            StackStatus::Complete(Err(Error::TopologyConflict { expander, first, second })) => {
                assert_eq!(expander, SasAddress(0xa00).to_string());
                assert_eq!(first, SasAddress(0xb00).to_string());
                assert_eq!(second, SasAddress(0xc00).to_string());
            }
            other => panic!("unexpected {:?}", other),
        }
        assert!(stack.is_empty());
    }
}

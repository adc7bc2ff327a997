//! Route-Table Configuration
//!
//! When a new expander is placed below a table-routed phy, every expander
//! between it and the device-set root needs routes for the addresses behind
//! it. `ConfigureExpander` walks upward and programs each of those tables,
//! mirroring every accepted entry.

use crate::discovery::boundary::find_subtractive_phy;
use crate::discovery::config::RouteAlgorithm;
use crate::discovery::context::{management_body, Context};
use crate::discovery::stack::{unexpected, Output, StateMachine, Step, Wake};
use crate::domain::ports::ManagementRequest;
use crate::error::{Error, Result};
use crate::topology::address::{RoutingAttribute, SasAddress};
use crate::topology::route_table::Placement;
use crate::topology::target::{Listing, PhyDescriptor, Target, TargetHandle};
use tracing::{debug, info};

/// Whether a neighbor of the new expander needs a route
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Qualification {
    Skip,
    Route { address: SasAddress, direct: bool },
    /// Reserve the slot so later entries keep their positions
    Placeholder,
}

/// Decide whether `descriptor` (a phy of the new expander) needs an entry in
/// `configure`'s table for `phy`.
pub fn qualified_address(
    algorithm: RouteAlgorithm,
    configure: &Target,
    phy: u8,
    descriptor: &PhyDescriptor,
) -> Qualification {
    let address = descriptor.attached_address;
    let direct = descriptor.routing == RoutingAttribute::Direct;

    if algorithm == RouteAlgorithm::Exhaustive {
        return if address.is_zero() {
            Qualification::Placeholder
        } else {
            Qualification::Route { address, direct }
        };
    }

    if address.is_zero() {
        return Qualification::Placeholder;
    }
    let Some(exp) = configure.expander.as_ref() else {
        return Qualification::Skip;
    };
    if address == configure.address || exp.directly_attached(address) {
        return Qualification::Skip;
    }
    if !direct && exp.route_table.contains(phy, address) {
        return Qualification::Skip;
    }
    Qualification::Route { address, direct }
}

/// An entry about to be programmed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct PendingRoute {
    configure: TargetHandle,
    phy: u8,
    index: u16,
    address: SasAddress,
    disabled: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Start,
    Configuring,
}

/// Program the route tables above `new_expander`
#[derive(Debug)]
pub struct ConfigureExpander {
    new_expander: TargetHandle,
    listing: Listing,
    phase: Phase,
    current: TargetHandle,
    configure: Option<TargetHandle>,
    /// Phy of `configure` being programmed
    phy: usize,
    /// Phy of `new_expander` being considered
    route: usize,
    pending: Option<PendingRoute>,
}

impl ConfigureExpander {
    pub fn new(new_expander: TargetHandle, listing: Listing) -> Self {
        Self {
            new_expander,
            listing,
            phase: Phase::Start,
            current: new_expander,
            configure: None,
            phy: 0,
            route: 0,
            pending: None,
        }
    }

    /// Move `configure` one level up from `current`. `None` once the
    /// device-set root is reached.
    fn ascend(&mut self, cx: &Context<'_>) -> Result<Option<TargetHandle>> {
        let current = cx.target(self.current)?;
        if current.is_device_set_root() {
            return Ok(None);
        }
        let upstream = match find_subtractive_phy(current)? {
            Some(up) if !up.address.is_zero() => up,
            _ => return Ok(None),
        };
        cx.registry
            .find(cx.port(), self.listing, upstream.address)
            .map(Some)
            .ok_or_else(|| Error::UpstreamMissing {
                expander: current.address.to_string(),
                upstream: upstream.address.to_string(),
            })
    }

    /// Find the next entry to program, climbing as tables are exhausted
    fn next_route(&mut self, cx: &mut Context<'_>) -> Result<Option<PendingRoute>> {
        let algorithm = cx.config().route_algorithm;
        loop {
            let configure = match self.configure {
                Some(h) => h,
                None => match self.ascend(cx)? {
                    Some(h) => {
                        self.configure = Some(h);
                        self.phy = 0;
                        self.route = 0;
                        h
                    }
                    None => return Ok(None),
                },
            };

            let current_address = cx.target(self.current)?.address;
            let cfg = cx.target(configure)?;
            let new = cx.target(self.new_expander)?;

            while self.phy < cfg.num_phys() {
                if cfg.phys()[self.phy].attached_address != current_address {
                    self.phy += 1;
                    self.route = 0;
                    continue;
                }
                let phy = self.phy as u8;
                while self.route < new.num_phys() {
                    let descriptor = new.phys()[self.route];
                    self.route += 1;
                    let (address, direct, disabled) = match qualified_address(algorithm, cfg, phy, &descriptor) {
                        Qualification::Skip => continue,
                        Qualification::Placeholder => (SasAddress::ZERO, false, true),
                        Qualification::Route { address, direct } => (address, direct, false),
                    };
                    let table = match cfg.expander.as_ref() {
                        Some(exp) => &exp.route_table,
                        None => break,
                    };
                    match table.place(phy, address, direct)? {
                        Placement::Existing(_) => continue,
                        Placement::Allocate { index, disabled: placeholder } => {
                            return Ok(Some(PendingRoute {
                                configure,
                                phy,
                                index,
                                address,
                                disabled: disabled || placeholder,
                            }));
                        }
                    }
                }
                self.phy += 1;
                self.route = 0;
            }

            // This table is done; its expander is the next level's child
            self.current = configure;
            self.configure = None;
        }
    }

    fn issue_next(&mut self, cx: &mut Context<'_>) -> Result<Step> {
        match self.next_route(cx)? {
            Some(route) => {
                self.pending = Some(route);
                self.phase = Phase::Configuring;
                let request = ManagementRequest::ConfigureRouteInformation {
                    phy: route.phy,
                    index: route.index,
                    address: route.address,
                    disable: route.disabled,
                };
                Ok(Step::Issue(cx.management(route.configure, request)?))
            }
            None => {
                info!(expander = %cx.target(self.new_expander)?.address, "routes configured");
                Ok(Step::Finished(Output::Target(self.new_expander)))
            }
        }
    }

    fn advance(&mut self, cx: &mut Context<'_>, wake: Wake) -> Result<Step> {
        match (self.phase, wake) {
            (Phase::Start, Wake::Start) => self.issue_next(cx),
            (Phase::Configuring, Wake::Io(completion)) => {
                let route = self
                    .pending
                    .take()
                    .ok_or_else(|| Error::Internal("route completion with nothing pending".into()))?;
                let owner = cx.target(route.configure)?.address;
                management_body(completion, "configure route information", owner)?;

                let exp = cx
                    .target_mut(route.configure)?
                    .expander
                    .as_mut()
                    .ok_or_else(|| Error::Internal(format!("{} has no route table", owner)))?;
                exp.route_table.commit(route.phy, route.index, route.address, route.disabled)?;
                debug!(
                    expander = %owner,
                    phy = route.phy,
                    index = route.index,
                    address = %route.address,
                    disabled = route.disabled,
                    "route committed"
                );
                self.issue_next(cx)
            }
            (phase, _) => Err(unexpected(self.name(), phase)),
        }
    }
}

impl StateMachine for ConfigureExpander {
    fn name(&self) -> &'static str {
        "configure_expander"
    }

    fn dispatch(&mut self, cx: &mut Context<'_>, wake: Wake) -> Step {
        self.advance(cx, wake).into()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::topology::address::{DeviceRole, LinkRate, PortId};
    use crate::topology::target::{ExpanderState, TransportKind};

    fn configure_expander() -> Target {
        let mut t = Target::new(
            TargetHandle::new(0, 0),
            0,
            PortId(0),
            SasAddress(0x100),
            LinkRate::G3,
            TransportKind::Management,
        );
        let mut state = ExpanderState::new(t.address, 2, 4, true);
        state.phys[0].attached_address = SasAddress(0x200);
        state.phys[0].attached_role = DeviceRole::EdgeExpander;
        state.phys[1].attached_address = SasAddress(0x900);
        state.phys[1].attached_role = DeviceRole::EndDevice;
        t.expander = Some(state);
        t
    }

    fn neighbor(address: u64, routing: RoutingAttribute) -> PhyDescriptor {
        PhyDescriptor {
            attached_address: SasAddress(address),
            attached_role: DeviceRole::EndDevice,
            routing,
            ..Default::default()
        }
    }

    #[test]
    fn test_qualification_rules() {
        let mut cfg = configure_expander();
        let algo = RouteAlgorithm::UniqueLevelDescent;

        // Behind the new expander, not yet routed
        assert_eq!(
            qualified_address(algo, &cfg, 0, &neighbor(0x300, RoutingAttribute::Table)),
            Qualification::Route {
                address: SasAddress(0x300),
                direct: false
            }
        );
        // The configure expander itself, and its own neighbors
        assert_eq!(
            qualified_address(algo, &cfg, 0, &neighbor(0x100, RoutingAttribute::Subtractive)),
            Qualification::Skip
        );
        assert_eq!(
            qualified_address(algo, &cfg, 0, &neighbor(0x900, RoutingAttribute::Direct)),
            Qualification::Skip
        );
        // Empty slots hold their position
        assert_eq!(
            qualified_address(algo, &cfg, 0, &neighbor(0, RoutingAttribute::Direct)),
            Qualification::Placeholder
        );

        // Already routed: skipped unless the source phy is direct
        cfg.expander
            .as_mut()
            .unwrap()
            .route_table
            .commit(0, 0, SasAddress(0x300), false)
            .unwrap();
        assert_eq!(
            qualified_address(algo, &cfg, 0, &neighbor(0x300, RoutingAttribute::Table)),
            Qualification::Skip
        );
        assert_eq!(
            qualified_address(algo, &cfg, 0, &neighbor(0x300, RoutingAttribute::Direct)),
            Qualification::Route {
                address: SasAddress(0x300),
                direct: true
            }
        );
    }

    #[test]
    fn test_exhaustive_routes_everything() {
        let cfg = configure_expander();
        assert_eq!(
            qualified_address(
                RouteAlgorithm::Exhaustive,
                &cfg,
                0,
                &neighbor(0x900, RoutingAttribute::Direct)
            ),
            Qualification::Route {
                address: SasAddress(0x900),
                direct: true
            }
        );
    }
}

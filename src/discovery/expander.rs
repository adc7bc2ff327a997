//! Expander Enumeration
//!
//! Reads an expander's general report, then its neighbor table one phy at a
//! time. The target is re-identified from the previous session when possible.

use crate::discovery::context::{management_body, malformed, Context};
use crate::discovery::stack::{unexpected, Output, StateMachine, Step, Wake};
use crate::domain::ports::{FunctionResult, ManagementBody, ManagementRequest};
use crate::error::{Error, Result};
use crate::topology::address::{DeviceRole, LinkRate, SasAddress};
use crate::topology::registry::Origin;
use crate::topology::target::{CommandSet, ExpanderState, Listing, PhyDescriptor, TargetHandle, TransportKind};
use tracing::{debug, info};

/// Upper bound on phys an expander may report
pub const MAX_EXPANDER_PHYS: usize = 128;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExpanderArgs {
    pub address: SasAddress,
    pub role: DeviceRole,
    /// Rate of the link the expander was found on
    pub ceiling: LinkRate,
    /// Expander it was reached through, `None` when attached to the port
    pub upstream: Option<TargetHandle>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    ReportGeneral,
    Discover { phy: u8 },
}

#[derive(Debug)]
pub struct DiscoverExpander {
    args: ExpanderArgs,
    phase: Phase,
    target: Option<(TargetHandle, Origin)>,
    num_phys: usize,
}

impl DiscoverExpander {
    pub fn new(args: ExpanderArgs) -> Self {
        Self {
            args,
            phase: Phase::ReportGeneral,
            target: None,
            num_phys: 0,
        }
    }

    fn handle(&self) -> Result<TargetHandle> {
        self.target
            .map(|(h, _)| h)
            .ok_or_else(|| Error::Internal("expander enumeration has no target".into()))
    }

    fn acquire(&mut self, cx: &mut Context<'_>) -> Result<()> {
        let base = match self.args.upstream {
            Some(up) => cx.target(up)?.link_rate,
            None => cx.session.port.link_rate,
        };
        let rate = base.min(self.args.ceiling);
        let (handle, origin) = cx
            .registry
            .acquire(cx.port(), self.args.address, rate, TransportKind::Management)?;

        let target = cx.target_mut(handle)?;
        target.transport = TransportKind::Management;
        target.command_set = CommandSet::Management;
        target.role = self.args.role;
        self.target = Some((handle, origin));
        debug!(address = %self.args.address, ?origin, %rate, "enumerating expander");
        Ok(())
    }

    fn advance(&mut self, cx: &mut Context<'_>, wake: Wake) -> Result<Step> {
        let handle = self.handle()?;
        match (self.phase, wake) {
            (Phase::ReportGeneral, Wake::Start) => {
                Ok(Step::Issue(cx.management(handle, ManagementRequest::ReportGeneral)?))
            }
            (Phase::ReportGeneral, Wake::Io(completion)) => {
                let report = match management_body(completion, "report general", self.args.address)? {
                    ManagementBody::General(report) => report,
                    other => return Err(malformed("report general", format!("unexpected body {:?}", other))),
                };
                if report.num_phys > MAX_EXPANDER_PHYS {
                    return Err(Error::TooManyPhys {
                        expander: self.args.address.to_string(),
                        reported: report.num_phys,
                        max: MAX_EXPANDER_PHYS,
                    });
                }

                let target = cx.target_mut(handle)?;
                let manufacturer = target.expander.take().and_then(|e| e.manufacturer);
                let mut state = ExpanderState::new(
                    self.args.address,
                    report.num_phys,
                    report.route_indexes,
                    report.configurable_route_table,
                );
                state.manufacturer = manufacturer;
                target.expander = Some(state);
                self.num_phys = report.num_phys;

                if self.num_phys == 0 {
                    return Ok(Step::Finished(Output::Target(handle)));
                }
                self.phase = Phase::Discover { phy: 0 };
                Ok(Step::Issue(cx.management(handle, ManagementRequest::Discover { phy: 0 })?))
            }
            (Phase::Discover { phy }, Wake::Io(completion)) => {
                let descriptor = match completion.management_response().map(|r| r.result) {
                    // Vacant phys exist on many expanders; they just have nothing attached
                    Some(FunctionResult::PhyVacant) if completion.outcome.is_accepted() => PhyDescriptor {
                        phy_id: phy,
                        ..Default::default()
                    },
                    _ => match management_body(completion, "discover", self.args.address)? {
                        ManagementBody::Discover(descriptor) => PhyDescriptor {
                            phy_id: phy,
                            ..descriptor
                        },
                        other => return Err(malformed("discover", format!("unexpected body {:?}", other))),
                    },
                };

                let target = cx.target_mut(handle)?;
                if let Some(slot) = target.expander.as_mut().and_then(|e| e.phys.get_mut(phy as usize)) {
                    *slot = descriptor;
                }

                let next = phy as usize + 1;
                if next >= self.num_phys {
                    info!(
                        address = %self.args.address,
                        phys = self.num_phys,
                        "expander enumerated"
                    );
                    return Ok(Step::Finished(Output::Target(handle)));
                }
                self.phase = Phase::Discover { phy: next as u8 };
                Ok(Step::Issue(
                    cx.management(handle, ManagementRequest::Discover { phy: next as u8 })?,
                ))
            }
            (phase, _) => Err(unexpected(self.name(), phase)),
        }
    }
}

impl StateMachine for DiscoverExpander {
    fn name(&self) -> &'static str {
        "discover_expander"
    }

    fn initialize(&mut self, cx: &mut Context<'_>) -> Step {
        match self.acquire(cx) {
            Ok(()) => Step::Continue,
            Err(e) => Step::Failed(e),
        }
    }

    fn dispatch(&mut self, cx: &mut Context<'_>, wake: Wake) -> Step {
        self.advance(cx, wake).into()
    }

    fn finish(&mut self, cx: &mut Context<'_>, result: &Result<Output>) {
        if result.is_ok() {
            return;
        }
        match self.target.take() {
            Some((handle, Origin::New)) => cx.registry.release(handle),
            Some((handle, Origin::Previous)) => {
                if let Ok(target) = cx.target_mut(handle) {
                    target.flags.reseen = false;
                }
                let _ = cx.registry.set_listing(handle, Listing::Previous);
            }
            Some((handle, Origin::Unplaced)) => {
                let _ = cx.registry.set_listing(handle, Listing::Unplaced);
            }
            None => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::discovery::config::DiscoveryConfig;
    use crate::discovery::context::{PortDescriptor, SessionState};
    use crate::discovery::stack::{Machine, MachineStack, StackStatus};
    use crate::domain::ports::{Completion, GeneralReport, ManagementResponse};
    use crate::topology::address::{PortId, ProtocolSet, RoutingAttribute};
    use crate::topology::registry::TargetRegistry;
    use assert_matches::assert_matches;

    fn session() -> SessionState {
        SessionState::new(
            PortDescriptor {
                id: PortId(0),
                local_address: SasAddress(0xff),
                attached_address: SasAddress(0x100),
                attached_role: DeviceRole::EdgeExpander,
                attached_protocols: ProtocolSet::smp(),
                link_rate: LinkRate::G6,
                attached_fis: None,
            },
            DiscoveryConfig::default(),
        )
    }

    fn machine() -> Machine {
        Machine::DiscoverExpander(DiscoverExpander::new(ExpanderArgs {
            address: SasAddress(0x100),
            role: DeviceRole::EdgeExpander,
            ceiling: LinkRate::G3,
            upstream: None,
        }))
    }

    fn general(num_phys: usize) -> Completion {
        Completion::management(ManagementResponse::accepted(ManagementBody::General(GeneralReport {
            num_phys,
            route_indexes: 8,
            configurable_route_table: true,
        })))
    }

    #[test]
    fn test_enumerates_every_phy() {
        let mut registry = TargetRegistry::new();
        let mut session = session();
        let mut cx = Context::new(&mut registry, &mut session);
        let mut stack = MachineStack::new(8);

        stack.push(&mut cx, machine());
        let status = stack.resume(&mut cx, general(2));
        assert_matches!(status, StackStatus::Suspended(r) if r.name() == "discover");

        let d0 = PhyDescriptor {
            attached_address: SasAddress(0x200),
            attached_role: DeviceRole::EndDevice,
            routing: RoutingAttribute::Direct,
            negotiated_rate: LinkRate::G3,
            target_protocols: ProtocolSet::ssp(),
            ..Default::default()
        };
        stack.resume(&mut cx, Completion::management(ManagementResponse::accepted(ManagementBody::Discover(d0))));
        let status = stack.resume(
            &mut cx,
            Completion::management(ManagementResponse::failed(FunctionResult::PhyVacant)),
        );

        let handle = match status {
            StackStatus::Complete(Ok(Output::Target(h))) => h,
            other => panic!("unexpected {:?}", other),
        };
        let target = cx.target(handle).unwrap();
        assert_eq!(target.link_rate, LinkRate::G3, "ceiling caps the port rate");
        assert_eq!(target.num_phys(), 2);
        assert_eq!(target.phys()[0].attached_address, SasAddress(0x200));
        assert_eq!(target.phys()[1].phy_id, 1);
        assert!(target.phys()[1].attached_address.is_zero());
        let exp = target.expander.as_ref().unwrap();
        assert_eq!(exp.route_table.capacity(), 8);
        assert!(exp.configurable_route_table);
    }

    #[test]
    fn test_too_many_phys() {
        let mut registry = TargetRegistry::new();
        let mut session = session();
        let mut cx = Context::new(&mut registry, &mut session);
        let mut stack = MachineStack::new(8);

        stack.push(&mut cx, machine());
        assert_matches!(
            stack.resume(&mut cx, general(MAX_EXPANDER_PHYS + 1)),
            StackStatus::Complete(Err(Error::TooManyPhys { reported: 129, .. }))
        );
        assert!(cx.registry.is_empty());
    }
}

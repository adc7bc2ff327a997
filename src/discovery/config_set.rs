//! Device-Set Walk
//!
//! Starting at a device-set root, visits every expander on the working list
//! phy by phy. End devices are placed directly; table-routed expanders are
//! enumerated, linked into the tree, appended to the list and, when their
//! tables are configurable, have the routes above them programmed.

use crate::discovery::context::{Advisory, Context};
use crate::discovery::expander::{DiscoverExpander, ExpanderArgs};
use crate::discovery::routing::ConfigureExpander;
use crate::discovery::stack::{unexpected, Machine, Output, StateMachine, Step, Wake};
use crate::error::{Error, Result};
use crate::topology::address::{DeviceRole, RoutingAttribute, SasAddress};
use crate::topology::target::{CommandSet, Listing, PhyDescriptor, TargetHandle, TransportKind};
use tracing::{debug, warn};

/// Place the end device behind `expander`'s phy `descriptor` on `listing`
pub fn configure_device(
    cx: &mut Context<'_>,
    expander: TargetHandle,
    descriptor: &PhyDescriptor,
    listing: Listing,
) -> Result<Option<TargetHandle>> {
    let protocols = descriptor.target_protocols;
    if protocols.is_empty() {
        // Pure initiator
        return Ok(None);
    }
    let rate = cx.target(expander)?.link_rate.min(descriptor.negotiated_rate);
    if !rate.is_usable() {
        debug!(address = %descriptor.attached_address, %rate, "skipping device with unusable link");
        return Ok(None);
    }
    // A wide link shows the same device on several phys
    if cx.registry.find(cx.port(), listing, descriptor.attached_address).is_some() {
        return Ok(None);
    }

    let (transport, command_set) = if protocols.ssp {
        (TransportKind::ScsiTransport, CommandSet::Scsi)
    } else if protocols.stp || protocols.sata {
        (TransportKind::AtaTransport, CommandSet::Unknown)
    } else {
        (TransportKind::Management, CommandSet::Management)
    };

    let (handle, _) = cx
        .registry
        .acquire(cx.port(), descriptor.attached_address, rate, transport)?;
    let target = cx.target_mut(handle)?;
    target.transport = transport;
    target.command_set = command_set;
    target.role = DeviceRole::EndDevice;
    target.link_rate = rate;
    target.identity.reset_volatile();

    let tree_root = cx.session.tree_root;
    cx.registry.add_child(expander, handle, tree_root);
    cx.registry.set_listing(handle, listing)?;
    Ok(Some(handle))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Walking,
    Enumerating { parent: TargetHandle, address: SasAddress },
    Configuring,
}

#[derive(Debug)]
pub struct DiscoverConfigSet {
    root: TargetHandle,
    listing: Listing,
    phase: Phase,
    /// Position among the list's expanders
    cursor: usize,
    phy: usize,
}

impl DiscoverConfigSet {
    pub fn new(root: TargetHandle, listing: Listing) -> Self {
        Self {
            root,
            listing,
            phase: Phase::Walking,
            cursor: 0,
            phy: 0,
        }
    }

    fn walk(&mut self, cx: &mut Context<'_>) -> Result<Step> {
        loop {
            let expanders: Vec<TargetHandle> = cx
                .registry
                .listed(cx.port(), self.listing)
                .into_iter()
                .filter(|&h| cx.registry.get(h).map(|t| t.is_expander()).unwrap_or(false))
                .collect();
            let Some(&expander) = expanders.get(self.cursor) else {
                return Ok(Step::Finished(Output::Target(self.root)));
            };

            let exp = cx.target(expander)?;
            if self.phy >= exp.num_phys() {
                self.cursor += 1;
                self.phy = 0;
                continue;
            }
            let expander_address = exp.address;
            let mut descriptor = exp.phys()[self.phy];
            self.phy += 1;

            if descriptor.attached_address.is_zero() {
                continue;
            }

            if descriptor.attached_role == DeviceRole::EndDevice && descriptor.target_protocols.smp {
                cx.advise(Advisory::EndDeviceTreatedAsExpander {
                    expander: expander_address,
                    address: descriptor.attached_address,
                });
                descriptor.attached_role = DeviceRole::EdgeExpander;
            }

            match descriptor.attached_role {
                DeviceRole::EndDevice => {
                    configure_device(cx, expander, &descriptor, self.listing)?;
                }
                role if role.is_expander() => {
                    if descriptor.routing != RoutingAttribute::Table {
                        continue;
                    }
                    if cx
                        .registry
                        .find(cx.port(), self.listing, descriptor.attached_address)
                        .is_some()
                    {
                        continue;
                    }
                    self.phase = Phase::Enumerating {
                        parent: expander,
                        address: descriptor.attached_address,
                    };
                    return Ok(Step::Push(Machine::DiscoverExpander(DiscoverExpander::new(
                        ExpanderArgs {
                            address: descriptor.attached_address,
                            role,
                            ceiling: descriptor.negotiated_rate,
                            upstream: Some(expander),
                        },
                    ))));
                }
                _ => {}
            }
        }
    }

    fn advance(&mut self, cx: &mut Context<'_>, wake: Wake) -> Result<Step> {
        match (self.phase, wake) {
            (Phase::Walking, Wake::Start | Wake::Continue) => self.walk(cx),
            (Phase::Enumerating { parent, address }, Wake::Child(result)) => {
                self.phase = Phase::Walking;
                let child = match result {
                    Ok(Output::Target(h)) => h,
                    Ok(other) => return Err(Error::Internal(format!("expected a target, got {:?}", other))),
                    Err(e) => {
                        warn!(address = %address, error = %e, "expander enumeration failed, skipping");
                        cx.advise(Advisory::ExpanderSkipped {
                            address,
                            reason: e.to_string(),
                        });
                        return self.walk(cx);
                    }
                };

                let tree_root = cx.session.tree_root;
                cx.registry.add_child(parent, child, tree_root);
                cx.registry.set_listing(child, self.listing)?;

                let configurable = cx
                    .target(child)?
                    .expander
                    .as_ref()
                    .map(|e| e.configurable_route_table)
                    .unwrap_or(false);
                if configurable {
                    self.phase = Phase::Configuring;
                    return Ok(Step::Push(Machine::ConfigureExpander(ConfigureExpander::new(
                        child,
                        self.listing,
                    ))));
                }
                self.walk(cx)
            }
            (Phase::Configuring, Wake::Child(result)) => {
                result?;
                self.phase = Phase::Walking;
                self.walk(cx)
            }
            (phase, _) => Err(unexpected(self.name(), phase)),
        }
    }
}

impl StateMachine for DiscoverConfigSet {
    fn name(&self) -> &'static str {
        "discover_config_set"
    }

    fn initialize(&mut self, cx: &mut Context<'_>) -> Step {
        match cx.registry.set_listing(self.root, self.listing) {
            Ok(()) => Step::Continue,
            Err(e) => Step::Failed(e),
        }
    }

    fn dispatch(&mut self, cx: &mut Context<'_>, wake: Wake) -> Step {
        self.advance(cx, wake).into()
    }
}

//! SATA Spin-Up Hold Release
//!
//! STP devices parked in spin-up hold are released with a link reset on the
//! parent expander phy, then the phy is rediscovered to learn the rate it
//! came back at.

use crate::discovery::bringup::{current_targets, parent_phy};
use crate::discovery::context::{management_body, Context};
use crate::discovery::stack::{unexpected, Output, StateMachine, Step, Wake};
use crate::domain::ports::{ManagementBody, ManagementRequest, PhyOperation};
use crate::error::Result;
use crate::topology::address::LinkRate;
use crate::topology::target::{PhyDescriptor, TargetHandle, TransportKind};
use tracing::{debug, warn};

#[derive(Debug, Clone, PartialEq, Eq)]
enum Phase {
    Next,
    Resetting {
        target: TargetHandle,
        parent: TargetHandle,
    },
    Rediscovering {
        target: TargetHandle,
        parent: TargetHandle,
        phys: Vec<u8>,
        at: usize,
    },
}

#[derive(Debug)]
pub struct SpinHold {
    targets: Vec<TargetHandle>,
    cursor: usize,
    phase: Phase,
}

impl SpinHold {
    pub fn new() -> Self {
        Self {
            targets: Vec::new(),
            cursor: 0,
            phase: Phase::Next,
        }
    }

    fn next_device(&mut self, cx: &mut Context<'_>) -> Result<Step> {
        while let Some(&target) = self.targets.get(self.cursor) {
            self.cursor += 1;
            let Some((parent, phy)) = parent_phy(cx, target) else {
                continue;
            };
            self.phase = Phase::Resetting { target, parent };
            let request = ManagementRequest::PhyControl {
                phy,
                op: PhyOperation::LinkReset,
            };
            return Ok(Step::Issue(cx.management(parent, request)?));
        }
        self.phase = Phase::Next;
        Ok(Step::Finished(Output::None))
    }

    fn rediscover(&mut self, cx: &mut Context<'_>) -> Result<Step> {
        if let Phase::Rediscovering { parent, phys, at, .. } = &self.phase {
            if let Some(&phy) = phys.get(*at) {
                let parent = *parent;
                return Ok(Step::Issue(cx.management(parent, ManagementRequest::Discover { phy })?));
            }
        }
        self.next_device(cx)
    }

    fn advance(&mut self, cx: &mut Context<'_>, wake: Wake) -> Result<Step> {
        match (self.phase.clone(), wake) {
            (Phase::Next, Wake::Start) => self.next_device(cx),
            (Phase::Resetting { target, parent }, Wake::Io(completion)) => {
                let address = cx.target(target)?.address;
                if let Err(e) = management_body(completion, "phy control", cx.target(parent)?.address) {
                    warn!(address = %address, error = %e, "link reset failed, leaving device held");
                    return self.next_device(cx);
                }
                let phys = cx
                    .target(parent)?
                    .expander
                    .as_ref()
                    .map(|e| e.phys_attached_to(address).collect())
                    .unwrap_or_default();
                self.phase = Phase::Rediscovering {
                    target,
                    parent,
                    phys,
                    at: 0,
                };
                self.rediscover(cx)
            }
            (Phase::Rediscovering { target, parent, phys, at }, Wake::Io(completion)) => {
                let parent_address = cx.target(parent)?.address;
                let descriptor = match management_body(completion, "discover", parent_address) {
                    Ok(ManagementBody::Discover(d)) => d,
                    Ok(_) | Err(_) => {
                        warn!(expander = %parent_address, phy = phys[at], "rediscover after link reset failed");
                        return self.next_device(cx);
                    }
                };
                let phy = phys[at];
                let parent_rate = cx.target(parent)?.link_rate;
                if let Some(slot) = cx
                    .target_mut(parent)?
                    .expander
                    .as_mut()
                    .and_then(|e| e.phys.get_mut(phy as usize))
                {
                    *slot = PhyDescriptor { phy_id: phy, ..descriptor };
                }
                let rate = parent_rate.min(descriptor.negotiated_rate);
                let device = cx.target_mut(target)?;
                device.link_rate = rate;
                debug!(address = %device.address, %rate, "released from spin-up hold");

                self.phase = Phase::Rediscovering {
                    target,
                    parent,
                    phys,
                    at: at + 1,
                };
                self.rediscover(cx)
            }
            (phase, _) => Err(unexpected(self.name(), phase)),
        }
    }
}

impl Default for SpinHold {
    fn default() -> Self {
        Self::new()
    }
}

impl StateMachine for SpinHold {
    fn name(&self) -> &'static str {
        "spin_hold"
    }

    fn initialize(&mut self, cx: &mut Context<'_>) -> Step {
        self.targets = current_targets(cx, |t| {
            t.transport == TransportKind::AtaTransport && t.link_rate == LinkRate::SpinupHold && t.parent.is_some()
        });
        Step::Continue
    }

    fn dispatch(&mut self, cx: &mut Context<'_>, wake: Wake) -> Step {
        self.advance(cx, wake).into()
    }
}

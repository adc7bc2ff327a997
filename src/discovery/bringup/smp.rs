//! SMP Initialization
//!
//! Reads manufacturer information from every expander on the current list.
//! Failures are logged and otherwise ignored.

use crate::discovery::bringup::current_targets;
use crate::discovery::context::{management_body, Context};
use crate::discovery::stack::{unexpected, Output, StateMachine, Step, Wake};
use crate::domain::ports::{ManagementBody, ManagementRequest};
use crate::error::Result;
use crate::topology::target::{TargetHandle, TransportKind};
use tracing::{debug, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Next,
    Awaiting(TargetHandle),
}

#[derive(Debug)]
pub struct InitSmp {
    targets: Vec<TargetHandle>,
    cursor: usize,
    phase: Phase,
}

impl InitSmp {
    pub fn new() -> Self {
        Self {
            targets: Vec::new(),
            cursor: 0,
            phase: Phase::Next,
        }
    }

    fn next_expander(&mut self, cx: &mut Context<'_>) -> Result<Step> {
        match self.targets.get(self.cursor) {
            Some(&target) => {
                self.cursor += 1;
                self.phase = Phase::Awaiting(target);
                Ok(Step::Issue(cx.management(target, ManagementRequest::ReportManufacturerInfo)?))
            }
            None => {
                self.phase = Phase::Next;
                Ok(Step::Finished(Output::None))
            }
        }
    }

    fn advance(&mut self, cx: &mut Context<'_>, wake: Wake) -> Result<Step> {
        match (self.phase, wake) {
            (Phase::Next, Wake::Start) => self.next_expander(cx),
            (Phase::Awaiting(target), Wake::Io(completion)) => {
                let address = cx.target(target)?.address;
                match management_body(completion, "report manufacturer information", address) {
                    Ok(ManagementBody::Manufacturer(info)) => {
                        debug!(address = %address, vendor = %info.vendor, product = %info.product, "expander manufacturer");
                        if let Some(expander) = cx.target_mut(target)?.expander.as_mut() {
                            expander.manufacturer = Some(info);
                        }
                    }
                    Ok(other) => warn!(address = %address, body = ?other, "unexpected manufacturer response"),
                    Err(e) => warn!(address = %address, error = %e, "manufacturer information unavailable"),
                }
                self.next_expander(cx)
            }
            (phase, _) => Err(unexpected(self.name(), phase)),
        }
    }
}

impl Default for InitSmp {
    fn default() -> Self {
        Self::new()
    }
}

impl StateMachine for InitSmp {
    fn name(&self) -> &'static str {
        "init_smp"
    }

    fn initialize(&mut self, cx: &mut Context<'_>) -> Step {
        self.targets = current_targets(cx, |t| t.transport == TransportKind::Management && t.expander.is_some());
        Step::Continue
    }

    fn dispatch(&mut self, cx: &mut Context<'_>, wake: Wake) -> Step {
        self.advance(cx, wake).into()
    }
}

//! Resumable State-Machine Stack
//!
//! Nested discovery work is expressed as an explicit stack of frames. Each
//! frame owns one [`Machine`] and the input it will be dispatched with next.
//! The stack never blocks: when a machine needs hardware it returns
//! [`Step::Issue`], the stack reports [`StackStatus::Suspended`], and the
//! driver later hands the completion back through [`MachineStack::resume`].
//!
//! ```text
//!   push ──► initialize ──► dispatch(Start) ──┬─► Issue ──► Suspended
//!                                             ├─► Continue ─► dispatch(Continue)
//!                                             ├─► Push ────► child frame
//!                                             └─► Finished/Failed ─► finish, pop,
//!                                                 parent.dispatch(Child(result))
//! ```

use crate::discovery::boundary::{Boundary, FindBoundary};
use crate::discovery::bringup::ata_features::ConfigureAta;
use crate::discovery::bringup::sas::InitSas;
use crate::discovery::bringup::sata::InitSata;
use crate::discovery::bringup::smp::InitSmp;
use crate::discovery::bringup::spinhold::SpinHold;
use crate::discovery::config_set::DiscoverConfigSet;
use crate::discovery::context::{Context, IoRequest};
use crate::discovery::expander::DiscoverExpander;
use crate::discovery::routing::ConfigureExpander;
use crate::discovery::session::DiscoverySession;
use crate::domain::ports::{Completion, RequestHandle};
use crate::error::{Error, Result};
use crate::topology::target::TargetHandle;
use tracing::{debug, trace};

// =============================================================================
// Machine Protocol
// =============================================================================

/// Value a machine finishes with
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Output {
    None,
    Target(TargetHandle),
    Boundary(Boundary),
}

/// Input a machine is dispatched with
#[derive(Debug)]
pub enum Wake {
    /// First dispatch after initialize
    Start,
    /// The machine returned `Step::Continue`
    Continue,
    /// The request it issued completed
    Io(Completion),
    /// The child it pushed finished
    Child(Result<Output>),
}

/// What a machine wants next
#[derive(Debug)]
pub enum Step {
    Issue(IoRequest),
    Continue,
    Push(Machine),
    Finished(Output),
    Failed(Error),
}

impl Step {
    fn is_terminal(&self) -> bool {
        matches!(self, Step::Finished(_) | Step::Failed(_))
    }

    fn into_result(self) -> Result<Output> {
        match self {
            Step::Finished(output) => Ok(output),
            Step::Failed(e) => Err(e),
            _ => Err(Error::Internal("non-terminal step converted to a result".into())),
        }
    }
}

impl From<Result<Step>> for Step {
    fn from(result: Result<Step>) -> Self {
        result.unwrap_or_else(Step::Failed)
    }
}

/// One resumable machine
pub trait StateMachine {
    fn name(&self) -> &'static str;

    /// Prepare locals; a terminal step finishes the machine without dispatch
    fn initialize(&mut self, _cx: &mut Context<'_>) -> Step {
        Step::Continue
    }

    fn dispatch(&mut self, cx: &mut Context<'_>, wake: Wake) -> Step;

    /// Runs once when the machine reaches a terminal step
    fn finish(&mut self, _cx: &mut Context<'_>, _result: &Result<Output>) {}

    /// Runs instead of `finish` when the stack is torn down
    fn abort(&mut self, _cx: &mut Context<'_>) {}
}

/// Failure for a wake a machine can't handle in its current phase
pub(crate) fn unexpected(machine: &str, phase: impl std::fmt::Debug) -> Error {
    Error::UnexpectedWake {
        machine: machine.to_string(),
        phase: format!("{:?}", phase),
    }
}

// =============================================================================
// Machines
// =============================================================================

/// Every machine the stack can hold
#[derive(Debug)]
pub enum Machine {
    Discovery(DiscoverySession),
    DiscoverExpander(DiscoverExpander),
    FindBoundary(FindBoundary),
    ConfigSet(DiscoverConfigSet),
    ConfigureExpander(ConfigureExpander),
    SpinHold(SpinHold),
    InitSata(InitSata),
    ConfigureAta(ConfigureAta),
    InitSas(InitSas),
    InitSmp(InitSmp),
}

impl Machine {
    fn inner(&mut self) -> &mut dyn StateMachine {
        match self {
            Machine::Discovery(m) => m,
            Machine::DiscoverExpander(m) => m,
            Machine::FindBoundary(m) => m,
            Machine::ConfigSet(m) => m,
            Machine::ConfigureExpander(m) => m,
            Machine::SpinHold(m) => m,
            Machine::InitSata(m) => m,
            Machine::ConfigureAta(m) => m,
            Machine::InitSas(m) => m,
            Machine::InitSmp(m) => m,
        }
    }

    pub fn name(&mut self) -> &'static str {
        self.inner().name()
    }
}

// =============================================================================
// Stack
// =============================================================================

/// One nesting level
#[derive(Debug)]
pub struct Frame {
    pub machine: Machine,
    wake: Option<Wake>,
}

/// Where the stack stopped
#[derive(Debug)]
pub enum StackStatus {
    /// Waiting for this request to complete
    Suspended(IoRequest),
    /// The bottom machine finished
    Complete(Result<Output>),
}

#[derive(Debug)]
pub struct MachineStack {
    frames: Vec<Frame>,
    max_depth: usize,
}

impl MachineStack {
    pub fn new(max_depth: usize) -> Self {
        Self {
            frames: Vec::new(),
            max_depth,
        }
    }

    pub fn depth(&self) -> usize {
        self.frames.len()
    }

    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }

    /// Invoke a machine on top of the stack and run until it suspends
    pub fn push(&mut self, cx: &mut Context<'_>, machine: Machine) -> StackStatus {
        if let Some(result) = self.enter(cx, machine) {
            match self.frames.last_mut() {
                Some(parent) => parent.wake = Some(Wake::Child(result)),
                None => return StackStatus::Complete(result),
            }
        }
        self.run(cx)
    }

    /// Hand a completion to the suspended machine and continue
    pub fn resume(&mut self, cx: &mut Context<'_>, completion: Completion) -> StackStatus {
        cx.session.completion = Some(completion);
        self.run(cx)
    }

    /// Dispatch frames until one suspends or the bottom frame finishes
    pub fn run(&mut self, cx: &mut Context<'_>) -> StackStatus {
        loop {
            let depth = self.frames.len();
            let Some(top) = self.frames.last_mut() else {
                return StackStatus::Complete(Err(Error::StackEmpty));
            };

            let wake = match top.wake.take() {
                Some(wake) => wake,
                None => match (cx.session.in_flight, cx.session.completion.take()) {
                    (Some(_), Some(completion)) => {
                        cx.session.in_flight = None;
                        cx.session.request_handle = None;
                        Wake::Io(completion)
                    }
                    (Some(request), None) => return StackStatus::Suspended(request),
                    (None, stray) => {
                        if stray.is_some() {
                            debug!(port = %cx.port(), "dropping completion with no request in flight");
                        }
                        let name = top.machine.name();
                        let step = Step::Failed(unexpected(name, "idle"));
                        top.wake = None;
                        if let Some(status) = self.pop(cx, step) {
                            return status;
                        }
                        continue;
                    }
                },
            };

            let machine = top.machine.inner();
            trace!(port = %cx.port(), machine = machine.name(), depth, "dispatch");
            let step = machine.dispatch(cx, wake);

            match step {
                Step::Issue(request) => {
                    debug!(
                        port = %cx.port(),
                        machine = machine.name(),
                        request = request.name(),
                        address = %request.target.address,
                        "issue"
                    );
                    cx.session.in_flight = Some(request);
                    return StackStatus::Suspended(request);
                }
                Step::Continue => top.wake = Some(Wake::Continue),
                Step::Push(child) => {
                    if let Some(result) = self.enter(cx, child) {
                        if let Some(parent) = self.frames.last_mut() {
                            parent.wake = Some(Wake::Child(result));
                        }
                    }
                }
                terminal => {
                    if let Some(status) = self.pop(cx, terminal) {
                        return status;
                    }
                }
            }
        }
    }

    /// Tear the stack down without finishing any machine. Returns the
    /// request that was in flight so it can be cancelled.
    pub fn abort(&mut self, cx: &mut Context<'_>) -> Option<RequestHandle> {
        while let Some(mut frame) = self.frames.pop() {
            let machine = frame.machine.inner();
            debug!(port = %cx.port(), machine = machine.name(), "abort");
            machine.abort(cx);
        }
        cx.session.in_flight = None;
        cx.session.completion = None;
        cx.session.request_handle.take()
    }

    /// Push a frame and initialize it. A machine that finishes during
    /// initialize is popped again and its result returned.
    fn enter(&mut self, cx: &mut Context<'_>, mut machine: Machine) -> Option<Result<Output>> {
        if self.frames.len() >= self.max_depth {
            return Some(Err(Error::StackOverflow { depth: self.max_depth }));
        }
        let inner = machine.inner();
        let step = inner.initialize(cx);
        if step.is_terminal() {
            let result = step.into_result();
            inner.finish(cx, &result);
            return Some(result);
        }
        self.frames.push(Frame {
            machine,
            wake: Some(Wake::Start),
        });
        None
    }

    /// Finish and pop the top frame, delivering its result to the parent
    fn pop(&mut self, cx: &mut Context<'_>, step: Step) -> Option<StackStatus> {
        let mut frame = self.frames.pop()?;
        let result = step.into_result();
        let machine = frame.machine.inner();
        if let Err(e) = &result {
            debug!(port = %cx.port(), machine = machine.name(), error = %e, "machine failed");
        }
        machine.finish(cx, &result);
        match self.frames.last_mut() {
            Some(parent) => {
                parent.wake = Some(Wake::Child(result));
                None
            }
            None => Some(StackStatus::Complete(result)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::discovery::config::DiscoveryConfig;
    use crate::discovery::context::{PortDescriptor, SessionState};
    use crate::domain::ports::{ManagementBody, ManagementResponse};
    use crate::topology::address::{DeviceRole, LinkRate, PortId, ProtocolSet, SasAddress};
    use crate::topology::registry::TargetRegistry;
    use crate::topology::target::{Listing, TransportKind};
    use assert_matches::assert_matches;

    fn session() -> SessionState {
        SessionState::new(
            PortDescriptor {
                id: PortId(0),
                local_address: SasAddress(0x5000_0000_0000_00ff),
                attached_address: SasAddress(0x5000_0000_0000_0100),
                attached_role: DeviceRole::EdgeExpander,
                attached_protocols: ProtocolSet::smp(),
                link_rate: LinkRate::G3,
                attached_fis: None,
            },
            DiscoveryConfig::default(),
        )
    }

    fn general(num_phys: usize) -> Completion {
        Completion::management(ManagementResponse::accepted(ManagementBody::General(
            crate::domain::ports::GeneralReport {
                num_phys,
                route_indexes: 4,
                configurable_route_table: false,
            },
        )))
    }

    fn expander(address: u64) -> Machine {
        Machine::DiscoverExpander(DiscoverExpander::new(crate::discovery::expander::ExpanderArgs {
            address: SasAddress(address),
            role: DeviceRole::EdgeExpander,
            ceiling: LinkRate::G3,
            upstream: None,
        }))
    }

    #[test]
    fn test_push_suspends_on_first_request() {
        let mut registry = TargetRegistry::new();
        let mut session = session();
        let mut cx = Context::new(&mut registry, &mut session);
        let mut stack = MachineStack::new(8);

        let status = stack.push(&mut cx, expander(0x100));
        assert_matches!(status, StackStatus::Suspended(req) if req.name() == "report_general");
        assert_eq!(stack.depth(), 1);

        // Running again without a completion stays suspended
        assert_matches!(stack.run(&mut cx), StackStatus::Suspended(_));
    }

    #[test]
    fn test_resume_completes_and_pops() {
        let mut registry = TargetRegistry::new();
        let mut session = session();
        let mut cx = Context::new(&mut registry, &mut session);
        let mut stack = MachineStack::new(8);

        stack.push(&mut cx, expander(0x100));
        let status = stack.resume(&mut cx, general(0));
        let handle = match status {
            StackStatus::Complete(Ok(Output::Target(h))) => h,
            other => panic!("unexpected status {:?}", other),
        };
        assert!(stack.is_empty());
        assert_eq!(cx.target(handle).unwrap().num_phys(), 0);
        assert!(cx.session.in_flight.is_none());
    }

    #[test]
    fn test_failure_releases_fresh_target() {
        let mut registry = TargetRegistry::new();
        let mut session = session();
        let mut cx = Context::new(&mut registry, &mut session);
        let mut stack = MachineStack::new(8);

        stack.push(&mut cx, expander(0x100));
        let status = stack.resume(&mut cx, Completion::timed_out());
        assert_matches!(status, StackStatus::Complete(Err(Error::RequestFailed { .. })));
        assert!(cx.registry.is_empty());
    }

    #[test]
    fn test_abort_discards_frames_and_returns_handle() {
        let mut registry = TargetRegistry::new();
        let mut session = session();
        let mut cx = Context::new(&mut registry, &mut session);
        let mut stack = MachineStack::new(8);

        stack.push(&mut cx, expander(0x100));
        cx.session.request_handle = Some(RequestHandle(7));
        assert_eq!(stack.abort(&mut cx), Some(RequestHandle(7)));
        assert!(stack.is_empty());
        assert!(cx.session.in_flight.is_none());
        // finish never ran, so the target is still there for rollback to deal with
        assert_eq!(cx.registry.len(), 1);
    }

    #[test]
    fn test_depth_limit_overflows() {
        let mut registry = TargetRegistry::new();
        let mut session = session();
        let mut cx = Context::new(&mut registry, &mut session);
        let mut stack = MachineStack::new(0);

        assert_matches!(
            stack.push(&mut cx, expander(0x100)),
            StackStatus::Complete(Err(Error::StackOverflow { depth: 0 }))
        );
    }

    #[test]
    fn test_reidentified_target_returns_to_previous_on_failure() {
        let mut registry = TargetRegistry::new();
        let old = registry
            .allocate(PortId(0), SasAddress(0x100), LinkRate::G3, TransportKind::Management)
            .unwrap();
        registry.set_listing(old, Listing::Previous).unwrap();

        let mut session = session();
        let mut cx = Context::new(&mut registry, &mut session);
        let mut stack = MachineStack::new(8);
        stack.push(&mut cx, expander(0x100));
        stack.resume(&mut cx, Completion::timed_out());

        let target = cx.target(old).unwrap();
        assert_eq!(target.listing, Listing::Previous);
        assert!(!target.flags.reseen);
    }

    #[test]
    fn test_empty_stack_run() {
        let mut registry = TargetRegistry::new();
        let mut session = session();
        let mut cx = Context::new(&mut registry, &mut session);
        let mut stack = MachineStack::new(8);
        assert_matches!(stack.run(&mut cx), StackStatus::Complete(Err(Error::StackEmpty)));
    }
}

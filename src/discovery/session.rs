//! Discovery Session
//!
//! The bottom frame of every stack. Runs the session phases in order:
//!
//! ```text
//!   discover attached ─► find boundary ─► configure boundary set
//!        │                                   │
//!        │ (end device)                      ▼
//!        │                      configure attached set (join only)
//!        ▼                                   │
//!   spin-up hold ◄───────────────────────────┘
//!        │
//!        ▼
//!   init sata ─► init sas ─► init smp ─► reconcile
//! ```
//!
//! A failed or aborted session restores the committed topology exactly as it
//! was when the session started.

use crate::discovery::boundary::FindBoundary;
use crate::discovery::bringup::{InitSas, InitSata, InitSmp, SpinHold};
use crate::discovery::config_set::DiscoverConfigSet;
use crate::discovery::context::Context;
use crate::discovery::expander::{DiscoverExpander, ExpanderArgs};
use crate::discovery::reconcile::reconcile;
use crate::discovery::stack::{unexpected, Machine, Output, StateMachine, Step, Wake};
use crate::error::{Error, Result};
use crate::topology::address::DeviceRole;
use crate::topology::events::TopologyEvent;
use crate::topology::target::{CommandSet, Listing, TargetHandle, TransportKind};
use chrono::Utc;
use std::collections::HashSet;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Start,
    DiscoverAttached,
    FindBoundary,
    ConfigureBoundarySet { attached_root: Option<TargetHandle> },
    ConfigureAttachedSet,
    SpinHold,
    InitSata,
    InitSas,
    InitSmp,
}

#[derive(Debug)]
pub struct DiscoverySession {
    phase: Phase,
}

fn expect_target(output: Output) -> Result<TargetHandle> {
    match output {
        Output::Target(h) => Ok(h),
        other => Err(Error::Internal(format!("expected a target, got {:?}", other))),
    }
}

impl DiscoverySession {
    pub fn new() -> Self {
        Self { phase: Phase::Start }
    }

    fn push(&mut self, phase: Phase, machine: Machine) -> Result<Step> {
        self.phase = phase;
        Ok(Step::Push(machine))
    }

    /// Place the end device sitting directly on the host port
    fn attach_end_device(&mut self, cx: &mut Context<'_>) -> Result<Step> {
        let port = cx.session.port.clone();
        let protocols = port.attached_protocols;
        let (transport, command_set) = if protocols.ssp {
            (TransportKind::ScsiTransport, CommandSet::Scsi)
        } else if protocols.stp || protocols.sata {
            (TransportKind::LegacyAtaDirect, CommandSet::Unknown)
        } else {
            (TransportKind::Management, CommandSet::Management)
        };

        let (handle, origin) = cx
            .registry
            .acquire(port.id, port.attached_address, port.link_rate, transport)?;
        let target = cx.target_mut(handle)?;
        target.transport = transport;
        target.command_set = command_set;
        target.role = DeviceRole::EndDevice;
        target.identity.reset_volatile();
        if transport == TransportKind::LegacyAtaDirect {
            target.identity.fis = port.attached_fis;
        }
        cx.registry.set_listing(handle, Listing::Current)?;
        cx.session.tree_root = Some(handle);
        debug!(port = %port.id, address = %port.attached_address, ?origin, "direct-attached end device");

        self.push(Phase::SpinHold, Machine::SpinHold(SpinHold::new()))
    }

    fn start(&mut self, cx: &mut Context<'_>) -> Result<Step> {
        let port = cx.session.port.clone();
        if !port.has_attached_device() {
            info!(port = %port.id, "nothing attached");
            return self.commit(cx);
        }
        if !port.attached_role.is_expander() {
            return self.attach_end_device(cx);
        }

        // The tree and route tables are rebuilt from scratch
        for handle in cx.registry.listed(port.id, Listing::Previous) {
            cx.registry.reset_links(handle);
            if let Some(expander) = cx.target_mut(handle)?.expander.as_mut() {
                expander.route_table.clear();
            }
        }
        self.push(
            Phase::DiscoverAttached,
            Machine::DiscoverExpander(DiscoverExpander::new(ExpanderArgs {
                address: port.attached_address,
                role: port.attached_role,
                ceiling: port.link_rate,
                upstream: None,
            })),
        )
    }

    /// Targets found while climbing but never placed don't survive the
    /// session, unless placed targets still hang below them in the tree
    fn drop_unplaced(cx: &mut Context<'_>) -> Result<()> {
        let port = cx.port();
        loop {
            let anchors: Vec<TargetHandle> = cx
                .registry
                .listed(port, Listing::Unplaced)
                .into_iter()
                .filter(|&h| {
                    cx.registry.get(h).is_some_and(|t| {
                        t.children
                            .iter()
                            .any(|&c| cx.registry.get(c).is_some_and(|c| c.listing == Listing::Current))
                    })
                })
                .collect();
            if anchors.is_empty() {
                break;
            }
            for handle in anchors {
                debug!(port = %port, %handle, "keeping unplaced parent of placed targets");
                cx.registry.set_listing(handle, Listing::Current)?;
            }
        }

        for handle in cx.registry.listed(port, Listing::Unplaced) {
            let target = cx.target_mut(handle)?;
            if target.flags.reseen {
                target.flags.reseen = false;
                cx.registry.set_listing(handle, Listing::Previous)?;
            } else {
                cx.registry.release(handle);
            }
        }
        Ok(())
    }

    fn commit(&mut self, cx: &mut Context<'_>) -> Result<Step> {
        Self::drop_unplaced(cx)?;
        let report = reconcile(cx)?;
        cx.session.report = Some(report);
        Ok(Step::Finished(Output::None))
    }

    fn advance(&mut self, cx: &mut Context<'_>, wake: Wake) -> Result<Step> {
        let result = match (self.phase, wake) {
            (Phase::Start, Wake::Start) => return self.start(cx),
            (_, Wake::Child(result)) => result,
            (phase, _) => return Err(unexpected(self.name(), phase)),
        };

        match self.phase {
            Phase::DiscoverAttached => {
                let attached = expect_target(result?)?;
                cx.session.tree_root = Some(attached);
                cx.registry.set_listing(attached, Listing::Unplaced)?;
                self.push(Phase::FindBoundary, Machine::FindBoundary(FindBoundary::new(attached)))
            }
            Phase::FindBoundary => {
                let boundary = match result? {
                    Output::Boundary(b) => b,
                    other => return Err(Error::Internal(format!("expected a boundary, got {:?}", other))),
                };
                self.push(
                    Phase::ConfigureBoundarySet {
                        attached_root: boundary.attached_root,
                    },
                    Machine::ConfigSet(DiscoverConfigSet::new(boundary.root, Listing::Current)),
                )
            }
            Phase::ConfigureBoundarySet { attached_root } => {
                result?;
                match attached_root {
                    Some(root) => self.push(
                        Phase::ConfigureAttachedSet,
                        Machine::ConfigSet(DiscoverConfigSet::new(root, Listing::AttachedSet)),
                    ),
                    None => self.push(Phase::SpinHold, Machine::SpinHold(SpinHold::new())),
                }
            }
            Phase::ConfigureAttachedSet => {
                result?;
                cx.registry.splice(cx.port(), Listing::AttachedSet, Listing::Current);
                self.push(Phase::SpinHold, Machine::SpinHold(SpinHold::new()))
            }
            Phase::SpinHold => {
                result?;
                self.push(Phase::InitSata, Machine::InitSata(InitSata::new()))
            }
            Phase::InitSata => {
                if let Err(e) = result {
                    warn!(port = %cx.port(), error = %e, "sata initialization incomplete");
                }
                self.push(Phase::InitSas, Machine::InitSas(InitSas::new()))
            }
            Phase::InitSas => {
                result?;
                self.push(Phase::InitSmp, Machine::InitSmp(InitSmp::new()))
            }
            Phase::InitSmp => {
                result?;
                self.commit(cx)
            }
            Phase::Start => Err(unexpected(self.name(), self.phase)),
        }
    }

    /// Put the committed topology back the way it was before the session
    fn rollback(cx: &mut Context<'_>, reason: &str) {
        let port = cx.port();
        let snapshot = std::mem::take(&mut cx.session.committed_snapshot);
        let kept: HashSet<TargetHandle> = snapshot.iter().map(|t| t.handle).collect();

        let stale: Vec<TargetHandle> = cx
            .registry
            .iter()
            .filter(|t| t.port == port && !kept.contains(&t.handle))
            .map(|t| t.handle)
            .collect();
        for handle in &stale {
            cx.registry.release(*handle);
        }

        let restored = snapshot.len();
        for target in snapshot {
            let handle = target.handle;
            if !cx.registry.restore(target) {
                warn!(port = %port, %handle, "committed target vanished during session");
            }
        }
        cx.session.tree_root = None;
        cx.session.report = None;

        warn!(port = %port, released = stale.len(), restored, reason, "session rolled back");
        cx.registry.emit(TopologyEvent::SessionFailed {
            port: port.0,
            reason: reason.to_string(),
            timestamp: Utc::now(),
        });
    }
}

impl Default for DiscoverySession {
    fn default() -> Self {
        Self::new()
    }
}

impl StateMachine for DiscoverySession {
    fn name(&self) -> &'static str {
        "discovery"
    }

    fn initialize(&mut self, cx: &mut Context<'_>) -> Step {
        let port = cx.port();
        let committed = cx.registry.listed(port, Listing::Committed);
        cx.session.committed_snapshot = committed
            .iter()
            .filter_map(|&h| cx.registry.get(h).cloned())
            .collect();
        for &handle in &committed {
            if let Some(target) = cx.registry.get_mut(handle) {
                target.flags.online = false;
                target.flags.hot_added = false;
                target.flags.hot_removed = false;
            }
        }
        cx.registry.splice(port, Listing::Committed, Listing::Previous);
        cx.session.tree_root = None;
        cx.session.report = None;
        info!(port = %port, previous = committed.len(), "discovery session started");
        Step::Continue
    }

    fn dispatch(&mut self, cx: &mut Context<'_>, wake: Wake) -> Step {
        self.advance(cx, wake).into()
    }

    fn finish(&mut self, cx: &mut Context<'_>, result: &Result<Output>) {
        match result {
            Ok(_) => cx.session.committed_snapshot.clear(),
            Err(e) => Self::rollback(cx, &e.to_string()),
        }
    }

    fn abort(&mut self, cx: &mut Context<'_>) {
        let reason = Error::SessionAborted {
            port: cx.port().to_string(),
        }
        .to_string();
        Self::rollback(cx, &reason);
    }
}

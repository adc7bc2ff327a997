//! SATA Initialization
//!
//! Captures each ATA device's signature, reads its identify data, and hands
//! identified devices to [`ConfigureAta`] for feature negotiation.

use crate::discovery::bringup::{current_targets, invalidate, parent_phy, ConfigureAta};
use crate::discovery::context::{data_in, management_body, malformed, Context};
use crate::discovery::stack::{unexpected, Machine, Output, StateMachine, Step, Wake};
use crate::domain::ports::{ManagementBody, ManagementRequest, ProtocolCommand};
use crate::error::Result;
use crate::topology::identity::{AtaFeatures, AtaIdentifyData, Fis};
use crate::topology::target::{CommandSet, TargetHandle, TransportKind};
use tracing::{debug, info};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Signatures,
    AwaitSignature(TargetHandle),
    Identify,
    AwaitIdentify { target: TargetHandle, attempt: u32 },
    Configure,
    AwaitConfigure,
}

#[derive(Debug)]
pub struct InitSata {
    targets: Vec<TargetHandle>,
    cursor: usize,
    identified: Vec<TargetHandle>,
    phase: Phase,
}

fn classify(fis: &Fis) -> CommandSet {
    if fis.is_atapi() {
        CommandSet::Atapi
    } else {
        CommandSet::Ata
    }
}

impl InitSata {
    pub fn new() -> Self {
        Self {
            targets: Vec::new(),
            cursor: 0,
            identified: Vec::new(),
            phase: Phase::Signatures,
        }
    }

    fn record_signature(cx: &mut Context<'_>, handle: TargetHandle, fis: Fis) -> Result<()> {
        let target = cx.target_mut(handle)?;
        target.identity.fis = Some(fis);
        target.command_set = classify(&fis);
        debug!(address = %target.address, command_set = %target.command_set, "ata signature");
        Ok(())
    }

    /// Step 1: signatures for every ATA target
    fn signatures(&mut self, cx: &mut Context<'_>) -> Result<Step> {
        while let Some(&target) = self.targets.get(self.cursor) {
            self.cursor += 1;
            let transport = cx.target(target)?.transport;
            if transport == TransportKind::LegacyAtaDirect {
                match cx.target(target)?.identity.fis.or(cx.session.port.attached_fis) {
                    Some(fis) => Self::record_signature(cx, target, fis)?,
                    None => invalidate(cx, target, "no initial register FIS"),
                }
                continue;
            }
            match parent_phy(cx, target) {
                Some((parent, phy)) => {
                    self.phase = Phase::AwaitSignature(target);
                    return Ok(Step::Issue(cx.management(parent, ManagementRequest::ReportPhySata { phy })?));
                }
                None => invalidate(cx, target, "no parent phy for report phy sata"),
            }
        }
        self.cursor = 0;
        self.phase = Phase::Identify;
        self.identify(cx)
    }

    /// Step 2: identify every device with a signature
    fn identify(&mut self, cx: &mut Context<'_>) -> Result<Step> {
        while let Some(&target) = self.targets.get(self.cursor) {
            self.cursor += 1;
            let command_set = cx.target(target)?.command_set;
            if command_set.is_ata() {
                return self.issue_identify(cx, target, 0);
            }
        }
        self.cursor = 0;
        self.phase = Phase::Configure;
        self.configure(cx)
    }

    fn issue_identify(&mut self, cx: &mut Context<'_>, target: TargetHandle, attempt: u32) -> Result<Step> {
        let packet = cx.target(target)?.command_set == CommandSet::Atapi;
        self.phase = Phase::AwaitIdentify { target, attempt };
        Ok(Step::Issue(cx.protocol(target, ProtocolCommand::AtaIdentify { packet })?))
    }

    /// Step 3: negotiate features on every identified device
    fn configure(&mut self, cx: &mut Context<'_>) -> Result<Step> {
        match self.identified.get(self.cursor) {
            Some(&target) => {
                self.cursor += 1;
                self.phase = Phase::AwaitConfigure;
                Ok(Step::Push(Machine::ConfigureAta(ConfigureAta::new(target))))
            }
            None => {
                info!(port = %cx.port(), devices = self.identified.len(), "sata devices initialized");
                Ok(Step::Finished(Output::None))
            }
        }
    }

    fn advance(&mut self, cx: &mut Context<'_>, wake: Wake) -> Result<Step> {
        match (self.phase, wake) {
            (Phase::Signatures, Wake::Start) => self.signatures(cx),
            (Phase::AwaitSignature(target), Wake::Io(completion)) => {
                let address = cx.target(target)?.address;
                let fis = management_body(completion, "report phy sata", address).and_then(|body| match body {
                    ManagementBody::PhySata(fis) => Ok(fis),
                    other => Err(malformed("report phy sata", format!("unexpected body {:?}", other))),
                });
                match fis {
                    Ok(fis) => Self::record_signature(cx, target, fis)?,
                    Err(e) => invalidate(cx, target, e.to_string()),
                }
                self.phase = Phase::Signatures;
                self.signatures(cx)
            }
            (Phase::AwaitIdentify { target, attempt }, Wake::Io(completion)) => {
                let address = cx.target(target)?.address;
                let identify = data_in(&completion, "identify", address).and_then(|data| {
                    AtaIdentifyData::from_bytes(&data).ok_or_else(|| malformed("identify", "short identify data"))
                });
                match identify {
                    Ok(id) => {
                        let policy = cx.config().feature_policy();
                        let target_mut = cx.target_mut(target)?;
                        target_mut.identity.features = Some(AtaFeatures::from_identify(&id, &policy));
                        target_mut.identity.identify = Some(id);
                        self.identified.push(target);
                        self.identify(cx)
                    }
                    Err(e) if attempt < cx.config().max_inquiry_retries => {
                        debug!(address = %address, attempt, error = %e, "identify failed, retrying");
                        self.issue_identify(cx, target, attempt + 1)
                    }
                    Err(e) => {
                        invalidate(cx, target, format!("identify failed: {}", e));
                        self.identify(cx)
                    }
                }
            }
            (Phase::AwaitConfigure, Wake::Child(result)) => {
                // Feature negotiation problems are advisories, not failures
                if let Err(e) = result {
                    debug!(error = %e, "ata configuration ended early");
                }
                self.configure(cx)
            }
            (phase, _) => Err(unexpected(self.name(), phase)),
        }
    }
}

impl Default for InitSata {
    fn default() -> Self {
        Self::new()
    }
}

impl StateMachine for InitSata {
    fn name(&self) -> &'static str {
        "init_sata"
    }

    fn initialize(&mut self, cx: &mut Context<'_>) -> Step {
        self.targets = current_targets(cx, |t| {
            matches!(t.transport, TransportKind::AtaTransport | TransportKind::LegacyAtaDirect)
                && t.command_set != CommandSet::Invalid
        });
        Step::Continue
    }

    fn dispatch(&mut self, cx: &mut Context<'_>, wake: Wake) -> Step {
        self.advance(cx, wake).into()
    }
}

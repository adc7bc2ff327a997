//! ATA Feature Negotiation
//!
//! Issues one SET FEATURES at a time until the device's feature state matches
//! what the host wants: write cache first, then read look-ahead, then the
//! transfer mode. A refused subcommand is abandoned for this pass.

use crate::discovery::context::{Advisory, Context};
use crate::discovery::stack::{unexpected, Output, StateMachine, Step, Wake};
use crate::domain::ports::ProtocolCommand;
use crate::error::Result;
use crate::topology::identity::SetFeature;
use crate::topology::target::TargetHandle;
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Start,
    Awaiting(SetFeature),
}

#[derive(Debug)]
pub struct ConfigureAta {
    target: TargetHandle,
    phase: Phase,
}

impl ConfigureAta {
    pub fn new(target: TargetHandle) -> Self {
        Self {
            target,
            phase: Phase::Start,
        }
    }

    fn issue_next(&mut self, cx: &mut Context<'_>) -> Result<Step> {
        let next = cx
            .target(self.target)?
            .identity
            .features
            .as_ref()
            .and_then(|f| f.next_feature());
        match next {
            Some((feature, sector_count)) => {
                self.phase = Phase::Awaiting(feature);
                Ok(Step::Issue(cx.protocol(
                    self.target,
                    ProtocolCommand::AtaSetFeatures { feature, sector_count },
                )?))
            }
            None => Ok(Step::Finished(Output::Target(self.target))),
        }
    }

    fn advance(&mut self, cx: &mut Context<'_>, wake: Wake) -> Result<Step> {
        match (self.phase, wake) {
            (Phase::Start, Wake::Start) => self.issue_next(cx),
            (Phase::Awaiting(feature), Wake::Io(completion)) => {
                let accepted = completion.outcome.is_accepted();
                let target = cx.target_mut(self.target)?;
                let address = target.address;
                if let Some(features) = target.identity.features.as_mut() {
                    if accepted {
                        features.apply(feature);
                    } else {
                        features.abandon(feature);
                    }
                }
                if accepted {
                    debug!(address = %address, %feature, "set features accepted");
                } else {
                    cx.advise(Advisory::FeatureAbandoned { address, feature });
                }
                self.issue_next(cx)
            }
            (phase, _) => Err(unexpected(self.name(), phase)),
        }
    }
}

impl StateMachine for ConfigureAta {
    fn name(&self) -> &'static str {
        "configure_ata"
    }

    fn dispatch(&mut self, cx: &mut Context<'_>, wake: Wake) -> Step {
        self.advance(cx, wake).into()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::discovery::config::DiscoveryConfig;
    use crate::discovery::context::{PortDescriptor, RequestKind, SessionState};
    use crate::discovery::stack::{Machine, MachineStack, StackStatus};
    use crate::domain::ports::{Completion, RequestOutcome};
    use crate::topology::address::{DeviceRole, LinkRate, PortId, ProtocolSet, SasAddress};
    use crate::topology::identity::{AtaFeatures, AtaIdentifyData, FeaturePolicy};
    use crate::topology::registry::TargetRegistry;
    use crate::topology::target::TransportKind;

    fn issued_feature(status: &StackStatus) -> Option<SetFeature> {
        match status {
            StackStatus::Suspended(req) => match req.kind {
                RequestKind::Protocol(ProtocolCommand::AtaSetFeatures { feature, .. }, _) => Some(feature),
                _ => None,
            },
            _ => None,
        }
    }

    #[test]
    fn test_refused_feature_is_abandoned_and_negotiation_continues() {
        let mut registry = TargetRegistry::new();
        let h = registry
            .allocate(PortId(0), SasAddress(0x300), LinkRate::G3, TransportKind::AtaTransport)
            .unwrap();
        let mut words = vec![0u16; AtaIdentifyData::WORDS];
        words[82] = 0x0060;
        let id = AtaIdentifyData::from_words(words);
        registry.target_mut(h).unwrap().identity.features =
            Some(AtaFeatures::from_identify(&id, &FeaturePolicy::default()));

        let mut session = SessionState::new(
            PortDescriptor {
                id: PortId(0),
                local_address: SasAddress(0xff),
                attached_address: SasAddress(0x100),
                attached_role: DeviceRole::EdgeExpander,
                attached_protocols: ProtocolSet::smp(),
                link_rate: LinkRate::G3,
                attached_fis: None,
            },
            DiscoveryConfig::default(),
        );
        let mut cx = Context::new(&mut registry, &mut session);
        let mut stack = MachineStack::new(4);

        let status = stack.push(&mut cx, Machine::ConfigureAta(ConfigureAta::new(h)));
        assert_eq!(issued_feature(&status), Some(SetFeature::EnableWriteCache));

        let status = stack.resume(&mut cx, Completion::failed(RequestOutcome::ProtocolError));
        assert_eq!(issued_feature(&status), Some(SetFeature::EnableReadAhead));

        let status = stack.resume(&mut cx, Completion::data(Vec::new()));
        assert!(matches!(status, StackStatus::Complete(Ok(Output::Target(t))) if t == h));

        let features = cx.target(h).unwrap().identity.features.unwrap();
        assert!(!features.state.write_cache);
        assert!(features.state.read_ahead);
        assert_eq!(cx.session.advisories.len(), 1);
    }
}

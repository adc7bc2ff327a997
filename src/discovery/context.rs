//! Discovery Session Context
//!
//! State that outlives any single machine frame: the port being walked, the
//! request in flight, the most recent completion, the committed snapshot used
//! for rollback, and advisories raised along the way.

use crate::discovery::config::DiscoveryConfig;
use crate::discovery::quirks::QuirkHook;
use crate::domain::ports::{
    Completion, DataDirection, ManagementBody, ManagementRequest, ProtocolCommand, RequestHandle, SessionReport,
    TargetRef,
};
use crate::error::{Error, Result};
use crate::topology::address::{DeviceRole, LinkRate, PortId, ProtocolSet, SasAddress};
use crate::topology::identity::{Fis, SetFeature};
use crate::topology::registry::TargetRegistry;
use crate::topology::target::{Target, TargetHandle};
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::warn;

// =============================================================================
// Port Descriptor
// =============================================================================

/// What link bring-up learned about a host port
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortDescriptor {
    pub id: PortId,
    /// Host-side address of the port
    #[serde(default)]
    pub local_address: SasAddress,
    /// Address of the device on the other end of the link, zero if none
    #[serde(default)]
    pub attached_address: SasAddress,
    #[serde(default)]
    pub attached_role: DeviceRole,
    #[serde(default)]
    pub attached_protocols: ProtocolSet,
    #[serde(default)]
    pub link_rate: LinkRate,
    /// Initial register FIS of a directly attached SATA device
    #[serde(default)]
    pub attached_fis: Option<Fis>,
}

impl PortDescriptor {
    pub fn has_attached_device(&self) -> bool {
        !self.attached_address.is_zero() && self.attached_role != DeviceRole::NoDevice
    }
}

// =============================================================================
// Advisories
// =============================================================================

/// User-visible warnings that don't fail a session
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Advisory {
    /// No usable unique id; one was derived from the fabric address
    SyntheticIdentifier { address: SasAddress },
    /// An expander reported an end device that advertises a management target
    EndDeviceTreatedAsExpander { expander: SasAddress, address: SasAddress },
    /// An expander below the boundary could not be enumerated
    ExpanderSkipped { address: SasAddress, reason: String },
    /// A SET FEATURES subcommand was refused
    FeatureAbandoned { address: SasAddress, feature: SetFeature },
    /// Bring-up gave up on a device
    DeviceInvalid { address: SasAddress, reason: String },
    /// A quirk hook asked for a relink and retry
    QuirkRetry { address: SasAddress, quirk: String },
}

impl std::fmt::Display for Advisory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Advisory::SyntheticIdentifier { address } => {
                write!(f, "{}: no usable device identifier, using synthetic id", address)
            }
            Advisory::EndDeviceTreatedAsExpander { expander, address } => write!(
                f,
                "expander {} reports {} as an end device with a management target, assuming expander",
                expander, address
            ),
            Advisory::ExpanderSkipped { address, reason } => write!(f, "expander {} skipped: {}", address, reason),
            Advisory::FeatureAbandoned { address, feature } => {
                write!(f, "{}: set features {} refused", address, feature)
            }
            Advisory::DeviceInvalid { address, reason } => write!(f, "{}: {}", address, reason),
            Advisory::QuirkRetry { address, quirk } => write!(f, "{}: {} relink and retry", address, quirk),
        }
    }
}

// =============================================================================
// I/O Requests
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestKind {
    Management(ManagementRequest),
    Protocol(ProtocolCommand, DataDirection),
}

/// A request a machine wants issued before it can advance
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IoRequest {
    pub target: TargetRef,
    pub handle: TargetHandle,
    pub kind: RequestKind,
}

impl IoRequest {
    pub fn name(&self) -> &'static str {
        match &self.kind {
            RequestKind::Management(request) => request.name(),
            RequestKind::Protocol(command, _) => command.name(),
        }
    }
}

// =============================================================================
// Session State
// =============================================================================

/// Per-port state owned by one discovery session
#[derive(Debug)]
pub struct SessionState {
    pub port: PortDescriptor,
    pub config: DiscoveryConfig,
    pub quirks: Vec<Arc<dyn QuirkHook>>,
    /// Device attached to the port; never gets a parent
    pub tree_root: Option<TargetHandle>,
    pub in_flight: Option<IoRequest>,
    pub request_handle: Option<RequestHandle>,
    pub completion: Option<Completion>,
    /// Quirk retries spent this session
    pub quirk_retries: u32,
    pub advisories: Vec<Advisory>,
    /// Committed targets as they were when the session started
    pub(crate) committed_snapshot: Vec<Target>,
    /// Filled in by reconciliation once the session commits
    pub report: Option<SessionReport>,
}

impl SessionState {
    pub fn new(port: PortDescriptor, config: DiscoveryConfig) -> Self {
        Self {
            port,
            config,
            quirks: Vec::new(),
            tree_root: None,
            in_flight: None,
            request_handle: None,
            completion: None,
            quirk_retries: 0,
            advisories: Vec::new(),
            committed_snapshot: Vec::new(),
            report: None,
        }
    }

    pub fn with_quirk(mut self, quirk: Arc<dyn QuirkHook>) -> Self {
        self.quirks.push(quirk);
        self
    }

    pub fn port_id(&self) -> PortId {
        self.port.id
    }
}

/// What every machine sees while it runs
pub struct Context<'a> {
    pub registry: &'a mut TargetRegistry,
    pub session: &'a mut SessionState,
}

impl<'a> Context<'a> {
    pub fn new(registry: &'a mut TargetRegistry, session: &'a mut SessionState) -> Self {
        Self { registry, session }
    }

    #[inline]
    pub fn port(&self) -> PortId {
        self.session.port.id
    }

    #[inline]
    pub fn config(&self) -> &DiscoveryConfig {
        &self.session.config
    }

    pub fn target(&self, handle: TargetHandle) -> Result<&Target> {
        self.registry.target(handle)
    }

    pub fn target_mut(&mut self, handle: TargetHandle) -> Result<&mut Target> {
        self.registry.target_mut(handle)
    }

    pub fn management(&self, handle: TargetHandle, request: ManagementRequest) -> Result<IoRequest> {
        let target = self.registry.target(handle)?;
        Ok(IoRequest {
            target: TargetRef::of(target),
            handle,
            kind: RequestKind::Management(request),
        })
    }

    pub fn protocol(&self, handle: TargetHandle, command: ProtocolCommand) -> Result<IoRequest> {
        let target = self.registry.target(handle)?;
        Ok(IoRequest {
            target: TargetRef::of(target),
            handle,
            kind: RequestKind::Protocol(command, command.direction()),
        })
    }

    pub fn advise(&mut self, advisory: Advisory) {
        warn!(port = %self.port(), "{}", advisory);
        self.session.advisories.push(advisory);
    }
}

// =============================================================================
// Completion Checks
// =============================================================================

/// Body of an accepted management response
pub(crate) fn management_body(completion: Completion, operation: &str, target: SasAddress) -> Result<ManagementBody> {
    if !completion.outcome.is_accepted() {
        return Err(Error::RequestFailed {
            operation: operation.to_string(),
            target: target.to_string(),
            outcome: completion.outcome.to_string(),
        });
    }
    let response = completion.management_response().cloned().ok_or_else(|| Error::MalformedResponse {
        operation: operation.to_string(),
        reason: "no management response".into(),
    })?;
    if response.result != crate::domain::ports::FunctionResult::Accepted {
        return Err(Error::FunctionFailed {
            operation: operation.to_string(),
            target: target.to_string(),
            result: response.result.to_string(),
        });
    }
    Ok(response.body)
}

/// Transferred bytes of an accepted data-in request
pub(crate) fn data_in(completion: &Completion, operation: &str, target: SasAddress) -> Result<Bytes> {
    if !completion.outcome.is_accepted() {
        return Err(Error::RequestFailed {
            operation: operation.to_string(),
            target: target.to_string(),
            outcome: completion.outcome.to_string(),
        });
    }
    completion.data_in().ok_or_else(|| Error::MalformedResponse {
        operation: operation.to_string(),
        reason: "no data returned".into(),
    })
}

pub(crate) fn malformed(operation: &str, reason: impl Into<String>) -> Error {
    Error::MalformedResponse {
        operation: operation.to_string(),
        reason: reason.into(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::ports::{FunctionResult, ManagementResponse, RequestOutcome};
    use assert_matches::assert_matches;

    #[test]
    fn test_management_body_checks_outcome_then_result() {
        let addr = SasAddress(0x5000_0000_0000_0001);
        assert_matches!(
            management_body(Completion::timed_out(), "discover", addr),
            Err(Error::RequestFailed { .. })
        );
        assert_matches!(
            management_body(
                Completion::management(ManagementResponse::failed(FunctionResult::PhyDoesNotExist)),
                "discover",
                addr
            ),
            Err(Error::FunctionFailed { .. })
        );
        assert_matches!(
            management_body(Completion::data(vec![0u8; 4]), "discover", addr),
            Err(Error::MalformedResponse { .. })
        );
        assert_matches!(
            management_body(Completion::management(ManagementResponse::accepted(ManagementBody::Ack)), "x", addr),
            Ok(ManagementBody::Ack)
        );
    }

    #[test]
    fn test_data_in_rejects_failed_outcome() {
        let addr = SasAddress(1);
        assert_matches!(
            data_in(&Completion::failed(RequestOutcome::LinkDown), "inquiry", addr),
            Err(Error::RequestFailed { .. })
        );
        assert_eq!(data_in(&Completion::data(vec![1, 2, 3]), "inquiry", addr).unwrap().len(), 3);
    }

    #[test]
    fn test_port_descriptor_attached_device() {
        let mut port = PortDescriptor {
            id: PortId(0),
            local_address: SasAddress(0x5000_0000_0000_00ff),
            attached_address: SasAddress::ZERO,
            attached_role: DeviceRole::NoDevice,
            attached_protocols: ProtocolSet::default(),
            link_rate: LinkRate::G3,
            attached_fis: None,
        };
        assert!(!port.has_attached_device());
        port.attached_address = SasAddress(1);
        port.attached_role = DeviceRole::EndDevice;
        assert!(port.has_attached_device());
    }
}

//! Domain Ports - Boundaries between the discovery core and its collaborators
//!
//! The core never touches hardware. It hands typed requests to an
//! [`IoSubmitter`] and receives a [`Completion`] on a oneshot channel, and it
//! reports each finished session to a [`MappingLayer`].

use crate::error::Result;
use crate::topology::address::{DeviceRole, LinkRate, PortId, SasAddress};
use crate::topology::identity::{AtaIdentifyData, Fis, SetFeature, UniqueId};
use crate::topology::registry::TargetRegistry;
use crate::topology::target::{CommandSet, ManufacturerInfo, PhyDescriptor, Target, TargetHandle, TransportKind};
use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::oneshot;

// =============================================================================
// Request Addressing
// =============================================================================

/// Collaborator-assigned identifier of an in-flight request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RequestHandle(pub u64);

impl std::fmt::Display for RequestHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "req-{}", self.0)
    }
}

/// Everything the collaborator needs to open a connection to a target
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TargetRef {
    pub port: PortId,
    pub address: SasAddress,
    pub transport: TransportKind,
    pub link_rate: LinkRate,
}

impl TargetRef {
    pub fn of(target: &Target) -> Self {
        Self {
            port: target.port,
            address: target.address,
            transport: target.transport,
            link_rate: target.link_rate,
        }
    }
}

impl std::fmt::Display for TargetRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}@port{}", self.address, self.port)
    }
}

/// Data transfer direction of a protocol request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DataDirection {
    None,
    In,
    Out,
}

// =============================================================================
// Management Requests
// =============================================================================

/// Link operations for phy control
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PhyOperation {
    LinkReset,
    HardReset,
    Disable,
}

/// Fabric-management requests issued to expanders
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "function", rename_all = "snake_case")]
pub enum ManagementRequest {
    ReportGeneral,
    Discover {
        phy: u8,
    },
    ConfigureRouteInformation {
        phy: u8,
        index: u16,
        address: SasAddress,
        disable: bool,
    },
    PhyControl {
        phy: u8,
        op: PhyOperation,
    },
    ReportPhySata {
        phy: u8,
    },
    ReportManufacturerInfo,
}

impl ManagementRequest {
    /// Short name used in logs, errors and metric labels
    pub fn name(&self) -> &'static str {
        match self {
            ManagementRequest::ReportGeneral => "report_general",
            ManagementRequest::Discover { .. } => "discover",
            ManagementRequest::ConfigureRouteInformation { .. } => "configure_route",
            ManagementRequest::PhyControl { .. } => "phy_control",
            ManagementRequest::ReportPhySata { .. } => "report_phy_sata",
            ManagementRequest::ReportManufacturerInfo => "report_manufacturer",
        }
    }
}

/// Function result carried in every management response
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FunctionResult {
    Accepted,
    UnknownFunction,
    FunctionFailed,
    InvalidFrameLength,
    PhyDoesNotExist,
    IndexDoesNotExist,
    PhyVacant,
}

impl std::fmt::Display for FunctionResult {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FunctionResult::Accepted => write!(f, "accepted"),
            FunctionResult::UnknownFunction => write!(f, "unknown function"),
            FunctionResult::FunctionFailed => write!(f, "function failed"),
            FunctionResult::InvalidFrameLength => write!(f, "invalid frame length"),
            FunctionResult::PhyDoesNotExist => write!(f, "phy does not exist"),
            FunctionResult::IndexDoesNotExist => write!(f, "index does not exist"),
            FunctionResult::PhyVacant => write!(f, "phy vacant"),
        }
    }
}

/// Decoded report-general body
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct GeneralReport {
    pub num_phys: usize,
    pub route_indexes: usize,
    pub configurable_route_table: bool,
}

/// Decoded management response body
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ManagementBody {
    General(GeneralReport),
    Discover(PhyDescriptor),
    PhySata(Fis),
    Manufacturer(ManufacturerInfo),
    Ack,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManagementResponse {
    pub result: FunctionResult,
    pub body: ManagementBody,
}

impl ManagementResponse {
    pub fn accepted(body: ManagementBody) -> Self {
        Self {
            result: FunctionResult::Accepted,
            body,
        }
    }

    pub fn failed(result: FunctionResult) -> Self {
        Self {
            result,
            body: ManagementBody::Ack,
        }
    }
}

// =============================================================================
// Protocol Requests
// =============================================================================

/// Device commands issued to end devices
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "command", rename_all = "snake_case")]
pub enum ProtocolCommand {
    Inquiry { allocation: u16 },
    InquiryVpd { page: u8, allocation: u16 },
    ReportLuns { allocation: u32 },
    ModeSense { page: u8 },
    AtaIdentify { packet: bool },
    AtaSetFeatures { feature: SetFeature, sector_count: u8 },
}

impl ProtocolCommand {
    pub fn name(&self) -> &'static str {
        match self {
            ProtocolCommand::Inquiry { .. } => "inquiry",
            ProtocolCommand::InquiryVpd { .. } => "inquiry_vpd",
            ProtocolCommand::ReportLuns { .. } => "report_luns",
            ProtocolCommand::ModeSense { .. } => "mode_sense",
            ProtocolCommand::AtaIdentify { .. } => "ata_identify",
            ProtocolCommand::AtaSetFeatures { .. } => "ata_set_features",
        }
    }

    pub fn direction(&self) -> DataDirection {
        match self {
            ProtocolCommand::AtaSetFeatures { .. } => DataDirection::None,
            _ => DataDirection::In,
        }
    }
}

// =============================================================================
// Outcomes
// =============================================================================

/// Reasons a connection open can be rejected
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RejectReason {
    NoDestination,
    BadDestination,
    ProtocolNotSupported,
    RateNotSupported,
    WrongDestination,
    PathwayBlocked,
    Retry,
}

/// Open status and completion of one request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum RequestOutcome {
    Accepted,
    AcceptedWithUnderrun { residual: u32 },
    TransportReject { reason: RejectReason },
    LinkDown,
    OpenTimeout,
    Aborted,
    ProtocolError,
    TimedOut,
}

impl RequestOutcome {
    #[inline]
    pub fn is_accepted(&self) -> bool {
        matches!(self, RequestOutcome::Accepted | RequestOutcome::AcceptedWithUnderrun { .. })
    }
}

impl std::fmt::Display for RequestOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RequestOutcome::Accepted => write!(f, "accepted"),
            RequestOutcome::AcceptedWithUnderrun { residual } => write!(f, "accepted (underrun {})", residual),
            RequestOutcome::TransportReject { reason } => write!(f, "rejected ({:?})", reason),
            RequestOutcome::LinkDown => write!(f, "link down"),
            RequestOutcome::OpenTimeout => write!(f, "open timeout"),
            RequestOutcome::Aborted => write!(f, "aborted"),
            RequestOutcome::ProtocolError => write!(f, "protocol error"),
            RequestOutcome::TimedOut => write!(f, "timed out"),
        }
    }
}

/// Payload delivered with a completion
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResponsePayload {
    None,
    Management(ManagementResponse),
    Data(Bytes),
}

/// Everything the core learns about a finished request
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Completion {
    pub outcome: RequestOutcome,
    pub payload: ResponsePayload,
    /// Bytes of the data buffer not transferred
    pub residual: u32,
}

impl Completion {
    pub fn management(response: ManagementResponse) -> Self {
        Self {
            outcome: RequestOutcome::Accepted,
            payload: ResponsePayload::Management(response),
            residual: 0,
        }
    }

    pub fn data(data: impl Into<Bytes>) -> Self {
        Self {
            outcome: RequestOutcome::Accepted,
            payload: ResponsePayload::Data(data.into()),
            residual: 0,
        }
    }

    /// Successful non-data command
    pub fn accepted() -> Self {
        Self::failed(RequestOutcome::Accepted)
    }

    pub fn failed(outcome: RequestOutcome) -> Self {
        Self {
            outcome,
            payload: ResponsePayload::None,
            residual: 0,
        }
    }

    /// Synthesized by the driver when the request deadline expires
    pub fn timed_out() -> Self {
        Self::failed(RequestOutcome::TimedOut)
    }

    /// Transferred bytes of a data-in response, trimmed by the residual
    pub fn data_in(&self) -> Option<Bytes> {
        match &self.payload {
            ResponsePayload::Data(data) => {
                let residual = match self.outcome {
                    RequestOutcome::AcceptedWithUnderrun { residual } => residual.max(self.residual),
                    _ => self.residual,
                } as usize;
                let len = data.len().saturating_sub(residual);
                Some(data.slice(..len))
            }
            _ => None,
        }
    }

    pub fn management_response(&self) -> Option<&ManagementResponse> {
        match &self.payload {
            ResponsePayload::Management(response) => Some(response),
            _ => None,
        }
    }
}

/// A submitted request and the channel its completion arrives on
#[derive(Debug)]
pub struct PendingRequest {
    pub handle: RequestHandle,
    pub completion: oneshot::Receiver<Completion>,
}

// =============================================================================
// I/O Submitter Port
// =============================================================================

/// Port for the low-level request submission path
#[async_trait]
pub trait IoSubmitter: Send + Sync {
    /// Submit a fabric-management request to an expander
    async fn submit_management_request(
        &self,
        target: &TargetRef,
        request: ManagementRequest,
    ) -> Result<PendingRequest>;

    /// Submit a device command to an end device
    async fn submit_protocol_request(
        &self,
        target: &TargetRef,
        command: ProtocolCommand,
        direction: DataDirection,
    ) -> Result<PendingRequest>;

    /// Cancel an in-flight request; its completion may never arrive
    async fn cancel(&self, handle: RequestHandle);

    /// Re-enable the link to a target before a quirk retry
    async fn relink(&self, _target: &TargetRef) -> Result<()> {
        Ok(())
    }
}

// =============================================================================
// Mapping Layer Port
// =============================================================================

/// Point-in-time view of a target handed to the storage stack
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TargetSnapshot {
    pub handle: TargetHandle,
    pub port: PortId,
    pub address: SasAddress,
    pub role: DeviceRole,
    pub transport: TransportKind,
    pub command_set: CommandSet,
    pub link_rate: LinkRate,
    pub luns: Vec<u64>,
    pub unique_id: Option<UniqueId>,
    pub identify: Option<AtaIdentifyData>,
    pub parent_address: Option<SasAddress>,
    pub multipath_peers: Vec<SasAddress>,
    pub mapped_id: Option<u32>,
}

impl TargetSnapshot {
    pub fn capture(registry: &TargetRegistry, target: &Target) -> Self {
        let address_of = |h: TargetHandle| registry.get(h).map(|t| t.address);
        Self {
            handle: target.handle,
            port: target.port,
            address: target.address,
            role: target.role,
            transport: target.transport,
            command_set: target.command_set,
            link_rate: target.link_rate,
            luns: target.identity.luns.clone(),
            unique_id: target.identity.unique_id.clone(),
            identify: target.identity.identify.clone(),
            parent_address: target.parent.and_then(address_of),
            multipath_peers: target.multipath.iter().filter_map(|&h| address_of(h)).collect(),
            mapped_id: target.mapped_id,
        }
    }
}

/// Result of one committed session
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionReport {
    pub port: PortId,
    /// Committed targets in list order
    pub targets: Vec<TargetSnapshot>,
    /// Devices newly handed to the storage stack
    pub additions: Vec<TargetSnapshot>,
    /// Devices the storage stack should tear down
    pub removals: Vec<TargetSnapshot>,
    /// Devices that lost a path and moved to another
    pub remapped: Vec<TargetSnapshot>,
    /// User-visible warnings raised during the session
    pub advisories: Vec<String>,
}

impl SessionReport {
    pub fn find(&self, address: SasAddress) -> Option<&TargetSnapshot> {
        self.targets.iter().find(|t| t.address == address)
    }
}

/// Port exposed to the storage stack
#[async_trait]
pub trait MappingLayer: Send + Sync {
    /// Called once per committed session
    async fn on_session_complete(&self, report: &SessionReport) -> Result<()>;
}

// =============================================================================
// Type Aliases for Arc'd Traits
// =============================================================================

pub type IoSubmitterRef = Arc<dyn IoSubmitter>;
pub type MappingLayerRef = Arc<dyn MappingLayer>;

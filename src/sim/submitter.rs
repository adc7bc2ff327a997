//! Simulated Request Submission
//!
//! [`SimulatedFabric`] answers management and protocol requests from a
//! [`FabricSpec`], keeps the route tables the core programs, and can be told
//! to stall or fail requests to exercise timeouts and rollback.

use crate::discovery::context::PortDescriptor;
use crate::domain::ports::{
    Completion, DataDirection, FunctionResult, GeneralReport, IoSubmitter, ManagementBody, ManagementRequest,
    ManagementResponse, PendingRequest, PhyOperation, ProtocolCommand, RejectReason, RequestHandle, RequestOutcome,
    TargetRef,
};
use crate::error::Result;
use crate::sim::fabric::{FabricSpec, SimDeviceKind, SimPhy};
use crate::topology::address::{PortId, SasAddress};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::oneshot;
use tracing::{debug, trace};

/// A route entry programmed into a simulated expander
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProgrammedRoute {
    pub address: SasAddress,
    pub disabled: bool,
}

/// One request as the fabric saw it
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RequestRecord {
    pub handle: RequestHandle,
    pub address: SasAddress,
    pub name: &'static str,
}

enum Verdict {
    Answer,
    Hold,
    Fail(Completion),
}

#[derive(Debug, Default)]
struct FabricState {
    spec: FabricSpec,
    /// (expander, phy, index) -> entry
    routes: BTreeMap<(SasAddress, u8, u16), ProgrammedRoute>,
    /// Remaining requests to swallow per address
    stalls: HashMap<SasAddress, u32>,
    /// Outcome forced on every request to an address
    failures: HashMap<SasAddress, RequestOutcome>,
    /// Senders of swallowed requests, kept so their receivers stay pending
    held: HashMap<RequestHandle, oneshot::Sender<Completion>>,
    log: Vec<RequestRecord>,
    relinks: Vec<SasAddress>,
}

/// In-memory SAS domain implementing [`IoSubmitter`]
#[derive(Debug, Default)]
pub struct SimulatedFabric {
    state: Mutex<FabricState>,
    next_handle: AtomicU64,
}

impl SimulatedFabric {
    pub fn new(spec: FabricSpec) -> Self {
        Self {
            state: Mutex::new(FabricState {
                spec,
                ..Default::default()
            }),
            next_handle: AtomicU64::new(1),
        }
    }

    /// Port descriptor as link bring-up would report it
    pub fn port(&self, id: PortId) -> Option<PortDescriptor> {
        self.state.lock().spec.ports.iter().find(|p| p.id == id).cloned()
    }

    pub fn ports(&self) -> Vec<PortDescriptor> {
        self.state.lock().spec.ports.clone()
    }

    /// Change the fabric in place, e.g. to pull or insert a device
    pub fn modify(&self, f: impl FnOnce(&mut FabricSpec)) {
        f(&mut self.state.lock().spec);
    }

    /// Empty an expander phy as if its cable were pulled
    pub fn detach(&self, expander: SasAddress, phy: usize) {
        self.modify(|spec| {
            if let Some(slot) = spec
                .expanders
                .iter_mut()
                .find(|e| e.address == expander)
                .and_then(|e| e.phys.get_mut(phy))
            {
                *slot = SimPhy::default();
            }
        });
    }

    /// Swallow the next `count` requests to `address`; they never complete
    pub fn stall(&self, address: SasAddress, count: u32) {
        self.state.lock().stalls.insert(address, count);
    }

    /// Fail every request to `address` with `outcome` until cleared
    pub fn fail(&self, address: SasAddress, outcome: RequestOutcome) {
        self.state.lock().failures.insert(address, outcome);
    }

    pub fn clear_faults(&self) {
        let mut state = self.state.lock();
        state.stalls.clear();
        state.failures.clear();
    }

    /// Route entries programmed into an expander, in (phy, index) order
    pub fn routes(&self, expander: SasAddress) -> Vec<(u8, u16, ProgrammedRoute)> {
        self.state
            .lock()
            .routes
            .iter()
            .filter(|((owner, _, _), _)| *owner == expander)
            .map(|(&(_, phy, index), &route)| (phy, index, route))
            .collect()
    }

    pub fn requests(&self) -> Vec<RequestRecord> {
        self.state.lock().log.clone()
    }

    pub fn requests_to(&self, address: SasAddress, name: &str) -> usize {
        self.state
            .lock()
            .log
            .iter()
            .filter(|r| r.address == address && r.name == name)
            .count()
    }

    pub fn relinks(&self) -> Vec<SasAddress> {
        self.state.lock().relinks.clone()
    }

    /// Requests swallowed and not yet cancelled
    pub fn held(&self) -> usize {
        self.state.lock().held.len()
    }

    /// Log the request and decide whether to answer it at all
    fn intercept(&self, state: &mut FabricState, address: SasAddress, name: &'static str) -> (RequestHandle, Verdict) {
        let handle = RequestHandle(self.next_handle.fetch_add(1, Ordering::Relaxed));
        state.log.push(RequestRecord { handle, address, name });
        trace!(%handle, %address, name, "simulated request");

        if let Some(remaining) = state.stalls.get_mut(&address) {
            if *remaining > 0 {
                *remaining -= 1;
                debug!(%handle, %address, name, "stalling request");
                return (handle, Verdict::Hold);
            }
        }
        if let Some(outcome) = state.failures.get(&address) {
            return (handle, Verdict::Fail(Completion::failed(*outcome)));
        }
        if !state.spec.is_attached(address) {
            let reject = RequestOutcome::TransportReject {
                reason: RejectReason::NoDestination,
            };
            return (handle, Verdict::Fail(Completion::failed(reject)));
        }
        (handle, Verdict::Answer)
    }

    fn deliver(&self, state: &mut FabricState, handle: RequestHandle, completion: Option<Completion>) -> PendingRequest {
        let (tx, rx) = oneshot::channel();
        match completion {
            Some(completion) => {
                let _ = tx.send(completion);
            }
            None => {
                state.held.insert(handle, tx);
            }
        }
        PendingRequest { handle, completion: rx }
    }

    fn management(spec: &mut FabricSpec, target: SasAddress, request: ManagementRequest) -> Completion {
        let Some(expander) = spec.expanders.iter_mut().find(|e| e.address == target) else {
            return Completion::failed(RequestOutcome::TransportReject {
                reason: RejectReason::ProtocolNotSupported,
            });
        };
        let num_phys = expander.phys.len();
        let response = match request {
            ManagementRequest::ReportGeneral => ManagementResponse::accepted(ManagementBody::General(GeneralReport {
                num_phys,
                route_indexes: expander.route_indexes,
                configurable_route_table: expander.configurable_route_table,
            })),
            ManagementRequest::Discover { phy } => match expander.phys.get(phy as usize) {
                Some(p) => ManagementResponse::accepted(ManagementBody::Discover(p.descriptor(phy))),
                None => ManagementResponse::failed(FunctionResult::PhyDoesNotExist),
            },
            ManagementRequest::ConfigureRouteInformation { phy, index, .. } => {
                if phy as usize >= num_phys {
                    ManagementResponse::failed(FunctionResult::PhyDoesNotExist)
                } else if index as usize >= expander.route_indexes {
                    ManagementResponse::failed(FunctionResult::IndexDoesNotExist)
                } else {
                    ManagementResponse::accepted(ManagementBody::Ack)
                }
            }
            ManagementRequest::PhyControl { phy, op } => match expander.phys.get_mut(phy as usize) {
                Some(p) => {
                    if op == PhyOperation::LinkReset || op == PhyOperation::HardReset {
                        if let Some(rate) = p.rate_after_reset.take() {
                            p.negotiated_rate = rate;
                        }
                    }
                    ManagementResponse::accepted(ManagementBody::Ack)
                }
                None => ManagementResponse::failed(FunctionResult::PhyDoesNotExist),
            },
            ManagementRequest::ReportPhySata { phy } => {
                let attached = expander.phys.get(phy as usize).map(|p| p.attached_address);
                let fis = attached
                    .and_then(|a| spec.devices.iter().find(|d| d.address == a))
                    .filter(|d| d.is_ata())
                    .map(|d| d.signature());
                match fis {
                    Some(fis) => ManagementResponse::accepted(ManagementBody::PhySata(fis)),
                    None => ManagementResponse::failed(FunctionResult::FunctionFailed),
                }
            }
            ManagementRequest::ReportManufacturerInfo => match &expander.manufacturer {
                Some(info) => ManagementResponse::accepted(ManagementBody::Manufacturer(info.clone())),
                None => ManagementResponse::failed(FunctionResult::UnknownFunction),
            },
        };
        Completion::management(response)
    }

    fn protocol(spec: &mut FabricSpec, target: SasAddress, command: ProtocolCommand) -> Completion {
        let Some(device) = spec.devices.iter_mut().find(|d| d.address == target) else {
            return Completion::failed(RequestOutcome::TransportReject {
                reason: RejectReason::ProtocolNotSupported,
            });
        };
        let protocol_error = Completion::failed(RequestOutcome::ProtocolError);
        match command {
            ProtocolCommand::Inquiry { allocation } => truncated(device.inquiry(), allocation as usize),
            ProtocolCommand::InquiryVpd { page: 0x83, allocation } => match device.device_identification() {
                Ok(page) => truncated(page, allocation as usize),
                Err(_) => protocol_error,
            },
            ProtocolCommand::InquiryVpd { page: 0x80, allocation } => {
                truncated(device.unit_serial(), allocation as usize)
            }
            ProtocolCommand::InquiryVpd { .. } => protocol_error,
            ProtocolCommand::ReportLuns { allocation } => truncated(device.report_luns(), allocation as usize),
            ProtocolCommand::ModeSense { page } => Completion::data(vec![0x07, 0x00, 0x00, 0x00, page, 0x06, 0x00, 0x00]),
            ProtocolCommand::AtaIdentify { packet } => {
                let is_packet = device.kind == SimDeviceKind::Atapi;
                if !device.is_ata() || packet != is_packet {
                    protocol_error
                } else {
                    Completion::data(device.identify())
                }
            }
            ProtocolCommand::AtaSetFeatures { feature, .. } => {
                if device.is_ata() && device.set_feature(feature) {
                    Completion::accepted()
                } else {
                    debug!(address = %target, %feature, "set features refused");
                    protocol_error
                }
            }
        }
    }
}

fn truncated(mut data: Vec<u8>, allocation: usize) -> Completion {
    data.truncate(allocation);
    Completion::data(data)
}

#[async_trait]
impl IoSubmitter for SimulatedFabric {
    async fn submit_management_request(
        &self,
        target: &TargetRef,
        request: ManagementRequest,
    ) -> Result<PendingRequest> {
        let mut state = self.state.lock();
        let (handle, verdict) = self.intercept(&mut state, target.address, request.name());
        let completion = match verdict {
            Verdict::Hold => None,
            Verdict::Fail(completion) => Some(completion),
            Verdict::Answer => {
                let answer = Self::management(&mut state.spec, target.address, request);
                let accepted = answer.management_response().map(|r| r.result) == Some(FunctionResult::Accepted);
                if let ManagementRequest::ConfigureRouteInformation {
                    phy,
                    index,
                    address,
                    disable,
                } = request
                {
                    if accepted {
                        let route = ProgrammedRoute {
                            address,
                            disabled: disable,
                        };
                        state.routes.insert((target.address, phy, index), route);
                    }
                }
                Some(answer)
            }
        };
        Ok(self.deliver(&mut state, handle, completion))
    }

    async fn submit_protocol_request(
        &self,
        target: &TargetRef,
        command: ProtocolCommand,
        _direction: DataDirection,
    ) -> Result<PendingRequest> {
        let mut state = self.state.lock();
        let (handle, verdict) = self.intercept(&mut state, target.address, command.name());
        let completion = match verdict {
            Verdict::Hold => None,
            Verdict::Fail(completion) => Some(completion),
            Verdict::Answer => Some(Self::protocol(&mut state.spec, target.address, command)),
        };
        Ok(self.deliver(&mut state, handle, completion))
    }

    async fn cancel(&self, handle: RequestHandle) {
        if self.state.lock().held.remove(&handle).is_some() {
            debug!(%handle, "cancelled held request");
        }
    }

    async fn relink(&self, target: &TargetRef) -> Result<()> {
        debug!(address = %target.address, "relink");
        self.state.lock().relinks.push(target.address);
        Ok(())
    }
}

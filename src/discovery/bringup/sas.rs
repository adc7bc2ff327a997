//! SAS Initialization
//!
//! For every SCSI target: standard inquiry, a unique identifier (device
//! identification page, then unit serial number, then a synthetic id), the
//! LUN list, and the protocol-specific port control mode page.

use crate::discovery::bringup::{current_targets, invalidate};
use crate::discovery::context::{data_in, Advisory, Context};
use crate::discovery::stack::{unexpected, Output, StateMachine, Step, Wake};
use crate::domain::ports::ProtocolCommand;
use crate::error::Result;
use crate::topology::address::SasAddress;
use crate::topology::identity::{IdSource, InquirySummary, UniqueId};
use crate::topology::target::{CommandSet, TargetHandle};
use bytes::Bytes;
use tracing::{debug, info};

/// Most LUNs recorded per target
pub const MAX_LUNS: usize = 128;

const INQUIRY_LEN: u16 = 255;
const VPD_DEVICE_IDENTIFICATION: u8 = 0x83;
const VPD_UNIT_SERIAL_NUMBER: u8 = 0x80;
const MODE_PAGE_PORT_CONTROL: u8 = 0x19;

const DESIGNATOR_NAA: u8 = 0x3;
const PIV_VALID: u8 = 0x80;
const PROTOCOL_SAS: u8 = 0x6;
const ASSOCIATION_LOGICAL_UNIT: u8 = 0;
const ASSOCIATION_TARGET_PORT: u8 = 1;
const ASSOCIATION_TARGET_DEVICE: u8 = 2;

// =============================================================================
// Response Parsing
// =============================================================================

/// First usable NAA designator in a device identification page
pub fn parse_device_identification(page: &[u8]) -> Option<Vec<u8>> {
    if page.len() < 4 {
        return None;
    }
    let page_len = (u16::from_be_bytes([page[2], page[3]]) as usize + 4).min(page.len());
    let mut offset = 4;
    while offset + 4 <= page_len {
        let d = &page[offset..];
        let len = d[3] as usize + 4;
        if offset + len > page_len {
            break;
        }
        offset += len;

        if d[1] & 0x0f != DESIGNATOR_NAA {
            continue;
        }
        let protocol = d[0] >> 4;
        let piv = d[1] & PIV_VALID != 0;
        let usable = match (d[1] >> 4) & 0x3 {
            ASSOCIATION_LOGICAL_UNIT => !piv,
            ASSOCIATION_TARGET_PORT | ASSOCIATION_TARGET_DEVICE => piv && protocol == PROTOCOL_SAS,
            _ => false,
        };
        if usable && len > 4 {
            return Some(d[4..len].to_vec());
        }
    }
    None
}

/// Serial number from a unit serial number page
pub fn parse_unit_serial(page: &[u8]) -> Option<Vec<u8>> {
    if page.len() < 4 {
        return None;
    }
    let end = (4 + page[3] as usize).min(page.len());
    let serial = &page[4..end];
    if serial.iter().all(|b| *b == 0 || *b == b' ') {
        return None;
    }
    Some(serial.to_vec())
}

/// LUN list from REPORT LUNS data, capped at [`MAX_LUNS`]
pub fn parse_report_luns(data: &[u8]) -> Vec<u64> {
    if data.len() < 8 {
        return Vec::new();
    }
    let count = (u32::from_be_bytes([data[0], data[1], data[2], data[3]]) as usize / 8).min(MAX_LUNS);
    data[8..]
        .chunks_exact(8)
        .take(count)
        .map(|lun| u64::from_be_bytes([lun[0], lun[1], lun[2], lun[3], lun[4], lun[5], lun[6], lun[7]]))
        .collect()
}

/// Identifier derived from the fabric address
pub fn synthetic_id(address: SasAddress) -> UniqueId {
    UniqueId::new((address.as_u64() & !0xf).to_be_bytes().to_vec(), IdSource::Synthetic)
}

// =============================================================================
// InitSas Machine
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Next,
    Inquiry { attempt: u32 },
    DeviceId,
    SerialNumber,
    ReportLuns,
    PortControl,
}

#[derive(Debug)]
pub struct InitSas {
    targets: Vec<TargetHandle>,
    cursor: usize,
    current: Option<TargetHandle>,
    phase: Phase,
    initialized: usize,
}

impl InitSas {
    pub fn new() -> Self {
        Self {
            targets: Vec::new(),
            cursor: 0,
            current: None,
            phase: Phase::Next,
            initialized: 0,
        }
    }

    fn issue(&mut self, cx: &mut Context<'_>, phase: Phase, command: ProtocolCommand) -> Result<Step> {
        let target = self.current.ok_or_else(|| crate::error::Error::Internal("no current target".into()))?;
        self.phase = phase;
        Ok(Step::Issue(cx.protocol(target, command)?))
    }

    fn next_device(&mut self, cx: &mut Context<'_>) -> Result<Step> {
        match self.targets.get(self.cursor) {
            Some(&target) => {
                self.cursor += 1;
                self.current = Some(target);
                self.issue(
                    cx,
                    Phase::Inquiry { attempt: 0 },
                    ProtocolCommand::Inquiry {
                        allocation: INQUIRY_LEN,
                    },
                )
            }
            None => {
                self.current = None;
                self.phase = Phase::Next;
                info!(port = %cx.port(), devices = self.initialized, "sas devices initialized");
                Ok(Step::Finished(Output::None))
            }
        }
    }

    fn serial_number(&mut self, cx: &mut Context<'_>) -> Result<Step> {
        self.issue(
            cx,
            Phase::SerialNumber,
            ProtocolCommand::InquiryVpd {
                page: VPD_UNIT_SERIAL_NUMBER,
                allocation: INQUIRY_LEN,
            },
        )
    }

    fn report_luns(&mut self, cx: &mut Context<'_>) -> Result<Step> {
        self.issue(
            cx,
            Phase::ReportLuns,
            ProtocolCommand::ReportLuns {
                allocation: 8 + 8 * MAX_LUNS as u32,
            },
        )
    }

    fn set_id(cx: &mut Context<'_>, target: TargetHandle, id: UniqueId) -> Result<()> {
        let t = cx.target_mut(target)?;
        debug!(address = %t.address, id = %id, source = ?id.source, "unique id");
        t.identity.unique_id = Some(id);
        Ok(())
    }

    fn advance(&mut self, cx: &mut Context<'_>, wake: Wake) -> Result<Step> {
        let phase = self.phase;
        if let (Phase::Next, Wake::Start) = (phase, &wake) {
            return self.next_device(cx);
        }
        let (target, completion) = match (self.current, wake) {
            (Some(target), Wake::Io(completion)) => (target, completion),
            _ => return Err(unexpected(self.name(), phase)),
        };
        let address = cx.target(target)?.address;

        match phase {
            Phase::Inquiry { attempt } => {
                let inquiry = data_in(&completion, "inquiry", address).and_then(|data| {
                    InquirySummary::parse(&data)
                        .map(|summary| (data.clone(), summary))
                        .ok_or_else(|| crate::discovery::context::malformed("inquiry", "empty inquiry data"))
                });
                let (data, summary): (Bytes, InquirySummary) = match inquiry {
                    Ok(v) => v,
                    Err(e) if attempt < cx.config().max_inquiry_retries => {
                        debug!(address = %address, attempt, error = %e, "inquiry failed, retrying");
                        return self.issue(
                            cx,
                            Phase::Inquiry { attempt: attempt + 1 },
                            ProtocolCommand::Inquiry {
                                allocation: INQUIRY_LEN,
                            },
                        );
                    }
                    Err(e) => {
                        invalidate(cx, target, format!("inquiry failed: {}", e));
                        return self.next_device(cx);
                    }
                };

                let unreachable = summary.is_unreachable();
                let t = cx.target_mut(target)?;
                t.identity.inquiry = Some(data);
                t.identity.inquiry_summary = Some(summary);
                if unreachable {
                    // Stays in the topology but is never mapped
                    t.command_set = CommandSet::Invalid;
                    debug!(address = %address, "logical unit not reachable through this initiator");
                    return self.next_device(cx);
                }
                self.issue(
                    cx,
                    Phase::DeviceId,
                    ProtocolCommand::InquiryVpd {
                        page: VPD_DEVICE_IDENTIFICATION,
                        allocation: INQUIRY_LEN,
                    },
                )
            }
            Phase::DeviceId => {
                let id = data_in(&completion, "device identification", address)
                    .ok()
                    .and_then(|page| parse_device_identification(&page));
                match id {
                    Some(bytes) => {
                        Self::set_id(cx, target, UniqueId::new(bytes, IdSource::DeviceIdentification))?;
                        self.report_luns(cx)
                    }
                    None => self.serial_number(cx),
                }
            }
            Phase::SerialNumber => {
                let serial = data_in(&completion, "unit serial number", address)
                    .ok()
                    .and_then(|page| parse_unit_serial(&page));
                match serial {
                    Some(bytes) => Self::set_id(cx, target, UniqueId::new(bytes, IdSource::SerialNumber))?,
                    None => {
                        cx.advise(Advisory::SyntheticIdentifier { address });
                        Self::set_id(cx, target, synthetic_id(address))?;
                    }
                }
                self.report_luns(cx)
            }
            Phase::ReportLuns => {
                let mut luns = data_in(&completion, "report luns", address)
                    .map(|data| parse_report_luns(&data))
                    .unwrap_or_default();
                if luns.is_empty() {
                    luns.push(0);
                }
                cx.target_mut(target)?.identity.luns = luns;
                self.issue(
                    cx,
                    Phase::PortControl,
                    ProtocolCommand::ModeSense {
                        page: MODE_PAGE_PORT_CONTROL,
                    },
                )
            }
            Phase::PortControl => {
                // Informational only
                if let Ok(data) = data_in(&completion, "mode sense", address) {
                    cx.target_mut(target)?.identity.port_control = Some(data);
                }
                self.initialized += 1;
                self.next_device(cx)
            }
            Phase::Next => Err(unexpected(self.name(), phase)),
        }
    }
}

impl Default for InitSas {
    fn default() -> Self {
        Self::new()
    }
}

impl StateMachine for InitSas {
    fn name(&self) -> &'static str {
        "init_sas"
    }

    fn initialize(&mut self, cx: &mut Context<'_>) -> Step {
        self.targets = current_targets(cx, |t| t.command_set == CommandSet::Scsi);
        Step::Continue
    }

    fn dispatch(&mut self, cx: &mut Context<'_>, wake: Wake) -> Step {
        self.advance(cx, wake).into()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn designator(protocol: u8, piv: bool, association: u8, kind: u8, body: &[u8]) -> Vec<u8> {
        let mut d = vec![
            (protocol << 4) | 0x1,
            (if piv { PIV_VALID } else { 0 }) | (association << 4) | kind,
            0,
            body.len() as u8,
        ];
        d.extend_from_slice(body);
        d
    }

    fn page(designators: &[Vec<u8>]) -> Vec<u8> {
        let body: Vec<u8> = designators.concat();
        let mut p = vec![0, VPD_DEVICE_IDENTIFICATION, 0, body.len() as u8];
        p.extend(body);
        p
    }

    #[test]
    fn test_device_identification_prefers_usable_naa() {
        let lu_with_piv = designator(PROTOCOL_SAS, true, ASSOCIATION_LOGICAL_UNIT, DESIGNATOR_NAA, &[1; 8]);
        let port_wrong_protocol = designator(0x1, true, ASSOCIATION_TARGET_PORT, DESIGNATOR_NAA, &[2; 8]);
        let vendor = designator(0, false, ASSOCIATION_LOGICAL_UNIT, 0x0, &[3; 8]);
        let port_sas = designator(PROTOCOL_SAS, true, ASSOCIATION_TARGET_PORT, DESIGNATOR_NAA, &[4; 8]);

        let p = page(&[lu_with_piv, port_wrong_protocol, vendor, port_sas]);
        assert_eq!(parse_device_identification(&p), Some(vec![4; 8]));
    }

    #[test]
    fn test_device_identification_logical_unit_without_piv() {
        let lu = designator(0, false, ASSOCIATION_LOGICAL_UNIT, DESIGNATOR_NAA, &[9; 16]);
        assert_eq!(parse_device_identification(&page(&[lu])), Some(vec![9; 16]));
    }

    #[test]
    fn test_device_identification_truncated_page() {
        let lu = designator(0, false, ASSOCIATION_LOGICAL_UNIT, DESIGNATOR_NAA, &[9; 16]);
        let mut p = page(&[lu]);
        p.truncate(12);
        assert_eq!(parse_device_identification(&p), None);
        assert_eq!(parse_device_identification(&[0, 0x83]), None);
    }

    #[test]
    fn test_unit_serial() {
        let mut p = vec![0, VPD_UNIT_SERIAL_NUMBER, 0, 6];
        p.extend_from_slice(b"ABC123");
        assert_eq!(parse_unit_serial(&p), Some(b"ABC123".to_vec()));
        assert_eq!(parse_unit_serial(&[0, 0x80, 0, 4, b' ', b' ', b' ', b' ']), None);
    }

    #[test]
    fn test_report_luns_capped() {
        let count = 200usize;
        let mut data = ((count * 8) as u32).to_be_bytes().to_vec();
        data.extend_from_slice(&[0; 4]);
        for lun in 0..count as u64 {
            data.extend_from_slice(&(lun << 48).to_be_bytes());
        }
        let luns = parse_report_luns(&data);
        assert_eq!(luns.len(), MAX_LUNS);
        assert_eq!(luns[1], 1 << 48);
    }

    #[test]
    fn test_synthetic_id_masks_low_nibble() {
        let id = synthetic_id(SasAddress(0x5000_c500_1234_567f));
        assert_eq!(id.bytes, 0x5000_c500_1234_5670u64.to_be_bytes().to_vec());
        assert_eq!(id.source, IdSource::Synthetic);
    }
}

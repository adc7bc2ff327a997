//! Fabric Description
//!
//! Serializable description of a simulated SAS domain: host ports, expanders
//! with their neighbor tables, and end devices with the identity they report.
//! Loaded from YAML or JSON.

use crate::discovery::context::PortDescriptor;
use crate::error::{Error, Result};
use crate::topology::address::{DeviceRole, LinkRate, ProtocolSet, RoutingAttribute, SasAddress};
use crate::topology::identity::{AtaIdentifyData, Fis, SetFeature};
use crate::topology::target::{ManufacturerInfo, PhyDescriptor};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// One phy of a simulated expander
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct SimPhy {
    #[serde(default)]
    pub attached_address: SasAddress,
    #[serde(default)]
    pub attached_phy: u8,
    #[serde(default)]
    pub attached_role: DeviceRole,
    #[serde(default)]
    pub routing: RoutingAttribute,
    #[serde(default)]
    pub negotiated_rate: LinkRate,
    #[serde(default)]
    pub target_protocols: ProtocolSet,
    #[serde(default)]
    pub initiator_protocols: ProtocolSet,
    /// Rate the link comes back at after a link reset
    #[serde(default)]
    pub rate_after_reset: Option<LinkRate>,
}

impl SimPhy {
    pub fn descriptor(&self, phy_id: u8) -> PhyDescriptor {
        PhyDescriptor {
            phy_id,
            attached_address: self.attached_address,
            attached_phy: self.attached_phy,
            attached_role: self.attached_role,
            routing: self.routing,
            negotiated_rate: self.negotiated_rate,
            target_protocols: self.target_protocols,
            initiator_protocols: self.initiator_protocols,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SimExpander {
    pub address: SasAddress,
    #[serde(default)]
    pub route_indexes: usize,
    #[serde(default)]
    pub configurable_route_table: bool,
    #[serde(default)]
    pub manufacturer: Option<ManufacturerInfo>,
    #[serde(default)]
    pub phys: Vec<SimPhy>,
}

/// Command set a simulated end device answers in
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SimDeviceKind {
    #[default]
    Scsi,
    Ata,
    Atapi,
}

/// ATA capabilities, expanded into identify data on request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct SimAtaCapabilities {
    #[serde(default)]
    pub write_cache: bool,
    #[serde(default)]
    pub write_cache_enabled: bool,
    #[serde(default)]
    pub read_ahead: bool,
    #[serde(default)]
    pub read_ahead_enabled: bool,
    #[serde(default)]
    pub smart: bool,
    /// Bitmask of supported ultra DMA modes
    #[serde(default)]
    pub udma_modes: u16,
}

impl SimAtaCapabilities {
    pub fn identify(&self) -> AtaIdentifyData {
        let mut words = vec![0u16; AtaIdentifyData::WORDS];
        let bit = |on: bool, mask: u16| if on { mask } else { 0 };
        words[49] = 1 << 8;
        words[82] = bit(self.smart, 1 << 0) | bit(self.write_cache, 1 << 5) | bit(self.read_ahead, 1 << 6);
        words[85] = bit(self.smart, 1 << 0)
            | bit(self.write_cache && self.write_cache_enabled, 1 << 5)
            | bit(self.read_ahead && self.read_ahead_enabled, 1 << 6);
        words[86] = 1 << 10;
        if self.udma_modes != 0 {
            words[53] = 1 << 2;
            words[88] = self.udma_modes & 0x7f;
        }
        AtaIdentifyData::from_words(words)
    }

    fn to_bytes(self) -> Vec<u8> {
        self.identify().words.iter().flat_map(|w| w.to_le_bytes()).collect()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SimDevice {
    pub address: SasAddress,
    #[serde(default)]
    pub kind: SimDeviceKind,
    #[serde(default)]
    pub vendor: String,
    #[serde(default)]
    pub product: String,
    #[serde(default)]
    pub revision: String,
    /// NAA designator as a hex string
    #[serde(default)]
    pub naa: Option<String>,
    #[serde(default)]
    pub serial: Option<String>,
    #[serde(default)]
    pub luns: Vec<u64>,
    /// Reports peripheral qualifier 3 on inquiry
    #[serde(default)]
    pub unreachable: bool,
    #[serde(default)]
    pub ata: SimAtaCapabilities,
    /// SET FEATURES subcommands the device refuses
    #[serde(default)]
    pub refuse_features: Vec<SetFeature>,
}

const INQUIRY_STANDARD_LEN: usize = 36;

fn padded(text: &str, width: usize) -> Vec<u8> {
    let mut bytes: Vec<u8> = text.bytes().take(width).collect();
    bytes.resize(width, b' ');
    bytes
}

fn decode_hex(hex: &str) -> Result<Vec<u8>> {
    let hex = hex.trim_start_matches("0x");
    if hex.len() % 2 != 0 {
        return Err(Error::Configuration(format!("odd-length hex string {:?}", hex)));
    }
    (0..hex.len())
        .step_by(2)
        .map(|i| {
            u8::from_str_radix(&hex[i..i + 2], 16)
                .map_err(|e| Error::Configuration(format!("bad hex string {:?}: {}", hex, e)))
        })
        .collect()
}

impl SimDevice {
    pub fn is_ata(&self) -> bool {
        matches!(self.kind, SimDeviceKind::Ata | SimDeviceKind::Atapi)
    }

    /// Signature the device leaves in its initial register FIS
    pub fn signature(&self) -> Fis {
        match self.kind {
            SimDeviceKind::Atapi => Fis::atapi_signature(),
            _ => Fis::ata_signature(),
        }
    }

    pub fn inquiry(&self) -> Vec<u8> {
        let mut data = vec![0u8; 8];
        if self.unreachable {
            data[0] = 0b011 << 5;
        }
        data[4] = (INQUIRY_STANDARD_LEN - 5) as u8;
        data.extend(padded(&self.vendor, 8));
        data.extend(padded(&self.product, 16));
        data.extend(padded(&self.revision, 4));
        data
    }

    pub fn device_identification(&self) -> Result<Vec<u8>> {
        let mut page = vec![0x00, 0x83, 0x00, 0x00];
        if let Some(naa) = &self.naa {
            let designator = decode_hex(naa)?;
            // Logical unit association, binary code set, no PIV
            page.extend([0x01, 0x03, 0x00, designator.len() as u8]);
            page.extend(designator);
        }
        let len = (page.len() - 4) as u16;
        page[2..4].copy_from_slice(&len.to_be_bytes());
        Ok(page)
    }

    pub fn unit_serial(&self) -> Vec<u8> {
        let serial = self.serial.as_deref().unwrap_or_default().as_bytes();
        let mut page = vec![0x00, 0x80, 0x00, serial.len() as u8];
        page.extend_from_slice(serial);
        page
    }

    pub fn report_luns(&self) -> Vec<u8> {
        let mut data = ((self.luns.len() * 8) as u32).to_be_bytes().to_vec();
        data.extend([0u8; 4]);
        for lun in &self.luns {
            data.extend(lun.to_be_bytes());
        }
        data
    }

    pub fn identify(&self) -> Vec<u8> {
        self.ata.to_bytes()
    }

    /// Apply an accepted SET FEATURES so the next identify reflects it
    pub fn set_feature(&mut self, feature: SetFeature) -> bool {
        if self.refuse_features.contains(&feature) {
            return false;
        }
        match feature {
            SetFeature::EnableWriteCache => self.ata.write_cache_enabled = true,
            SetFeature::DisableWriteCache => self.ata.write_cache_enabled = false,
            SetFeature::EnableReadAhead => self.ata.read_ahead_enabled = true,
            SetFeature::DisableReadAhead => self.ata.read_ahead_enabled = false,
            SetFeature::TransferMode => {}
        }
        true
    }
}

/// A complete simulated domain
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FabricSpec {
    #[serde(default)]
    pub ports: Vec<PortDescriptor>,
    #[serde(default)]
    pub expanders: Vec<SimExpander>,
    #[serde(default)]
    pub devices: Vec<SimDevice>,
}

impl FabricSpec {
    pub fn from_yaml(text: &str) -> Result<Self> {
        Ok(serde_yaml::from_str(text)?)
    }

    pub fn from_json(text: &str) -> Result<Self> {
        Ok(serde_json::from_str(text)?)
    }

    /// Load from a file, picking the format from its extension
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)?;
        match path.extension().and_then(|e| e.to_str()) {
            Some("json") => Self::from_json(&text),
            _ => Self::from_yaml(&text),
        }
    }

    pub fn expander(&self, address: SasAddress) -> Option<&SimExpander> {
        self.expanders.iter().find(|e| e.address == address)
    }

    pub fn device(&self, address: SasAddress) -> Option<&SimDevice> {
        self.devices.iter().find(|d| d.address == address)
    }

    /// Whether anything in the domain still links to `address`
    pub fn is_attached(&self, address: SasAddress) -> bool {
        if address.is_zero() {
            return false;
        }
        self.ports.iter().any(|p| p.attached_address == address)
            || self
                .expanders
                .iter()
                .any(|e| e.phys.iter().any(|p| p.attached_address == address))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::discovery::bringup::sas::{parse_device_identification, parse_report_luns, parse_unit_serial};
    use crate::topology::identity::{AtaFeatures, FeaturePolicy, InquirySummary};
    use std::io::Write;

    const FABRIC: &str = r#"
ports:
  - id: 0
    attached_address: 0x5000000000000100
    attached_role: edge_expander
    attached_protocols: { smp: true }
    link_rate: g6
expanders:
  - address: 0x5000000000000100
    route_indexes: 8
    phys:
      - attached_address: 0x5000000000000200
        attached_role: end_device
        negotiated_rate: g3
        target_protocols: { ssp: true }
      - {}
devices:
  - address: 0x5000000000000200
    vendor: SEAGATE
    product: ST4000NM
    naa: "5000c50012345678"
    luns: [0, 1]
"#;

    fn device() -> SimDevice {
        FabricSpec::from_yaml(FABRIC).unwrap().devices.remove(0)
    }

    #[test]
    fn test_yaml_fabric() {
        let spec = FabricSpec::from_yaml(FABRIC).unwrap();
        assert_eq!(spec.ports[0].link_rate, LinkRate::G6);
        assert_eq!(spec.expanders[0].phys.len(), 2);
        assert_eq!(spec.expanders[0].phys[1].attached_role, DeviceRole::NoDevice);
        assert!(spec.is_attached(SasAddress(0x5000000000000200)));
        assert!(!spec.is_attached(SasAddress(0x5000000000000300)));
    }

    #[test]
    fn test_load_picks_format_from_extension() {
        let spec = FabricSpec::from_yaml(FABRIC).unwrap();
        let dir = tempfile::tempdir().unwrap();

        let json_path = dir.path().join("fabric.json");
        std::fs::write(&json_path, serde_json::to_string(&spec).unwrap()).unwrap();
        assert_eq!(FabricSpec::load(&json_path).unwrap(), spec);

        let yaml_path = dir.path().join("fabric.yaml");
        let mut file = std::fs::File::create(&yaml_path).unwrap();
        file.write_all(FABRIC.as_bytes()).unwrap();
        assert_eq!(FabricSpec::load(&yaml_path).unwrap(), spec);
    }

    #[test]
    fn test_scsi_pages_parse() {
        let dev = device();
        let summary = InquirySummary::parse(&dev.inquiry()).unwrap();
        assert_eq!(summary.vendor, "SEAGATE");
        assert_eq!(summary.product, "ST4000NM");
        assert!(!summary.is_unreachable());

        assert_eq!(
            parse_device_identification(&dev.device_identification().unwrap()).unwrap(),
            vec![0x50, 0x00, 0xc5, 0x00, 0x12, 0x34, 0x56, 0x78]
        );
        assert_eq!(parse_report_luns(&dev.report_luns()), vec![0, 1]);
        assert_eq!(parse_unit_serial(&dev.unit_serial()), None);
    }

    #[test]
    fn test_set_features_update_identify() {
        let mut dev = device();
        dev.kind = SimDeviceKind::Ata;
        dev.ata = SimAtaCapabilities {
            write_cache: true,
            read_ahead: true,
            udma_modes: 0x3f,
            ..Default::default()
        };
        dev.refuse_features = vec![SetFeature::EnableReadAhead];

        let policy = FeaturePolicy::default();
        let id = AtaIdentifyData::from_bytes(&dev.identify()).unwrap();
        let features = AtaFeatures::from_identify(&id, &policy);
        assert_eq!(features.next_feature(), Some((SetFeature::EnableWriteCache, 0)));

        assert!(dev.set_feature(SetFeature::EnableWriteCache));
        assert!(!dev.set_feature(SetFeature::EnableReadAhead));
        let id = AtaIdentifyData::from_bytes(&dev.identify()).unwrap();
        let features = AtaFeatures::from_identify(&id, &policy);
        assert!(features.state.write_cache);
        assert!(!features.state.read_ahead);
    }
}

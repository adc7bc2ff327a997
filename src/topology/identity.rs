//! End-Device Identity
//!
//! Protocol-specific identity captured during bring-up: SCSI inquiry data,
//! unique identifiers and LUN lists, or the ATA signature, identify data and
//! negotiated feature set.

use bytes::Bytes;
use serde::{Deserialize, Serialize};

// =============================================================================
// SCSI Identity
// =============================================================================

/// Peripheral device type for enclosure services devices
pub const PERIPHERAL_ENCLOSURE: u8 = 0x0d;

/// Where a unique identifier came from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IdSource {
    /// NAA designator from the device identification page
    DeviceIdentification,
    /// Unit serial number page
    SerialNumber,
    /// Derived from the fabric address when the device offers nothing usable
    Synthetic,
}

/// Vendor-neutral identifier used to detect multipath
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct UniqueId {
    pub bytes: Vec<u8>,
    pub source: IdSource,
}

impl UniqueId {
    pub fn new(bytes: impl Into<Vec<u8>>, source: IdSource) -> Self {
        Self {
            bytes: bytes.into(),
            source,
        }
    }
}

impl std::fmt::Display for UniqueId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        for b in &self.bytes {
            write!(f, "{:02x}", b)?;
        }
        Ok(())
    }
}

/// Fields decoded from standard inquiry data
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InquirySummary {
    pub peripheral_qualifier: u8,
    pub device_type: u8,
    pub vendor: String,
    pub product: String,
    pub revision: String,
}

impl InquirySummary {
    pub fn parse(data: &[u8]) -> Option<Self> {
        if data.is_empty() {
            return None;
        }
        let text = |range: std::ops::Range<usize>| -> String {
            data.get(range)
                .map(|b| String::from_utf8_lossy(b).trim().to_string())
                .unwrap_or_default()
        };
        Some(Self {
            peripheral_qualifier: data[0] >> 5,
            device_type: data[0] & 0x1f,
            vendor: text(8..16),
            product: text(16..32),
            revision: text(32..36),
        })
    }

    /// The LUN can't be reached through this initiator
    pub fn is_unreachable(&self) -> bool {
        self.peripheral_qualifier == 0b011 || self.device_type == PERIPHERAL_ENCLOSURE
    }
}

// =============================================================================
// ATA Identity
// =============================================================================

/// Register device-to-host FIS fields that carry the device signature
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Fis {
    pub status: u8,
    pub error: u8,
    pub sector_count: u8,
    pub lba_low: u8,
    pub lba_mid: u8,
    pub lba_high: u8,
    pub device: u8,
}

impl Fis {
    /// Signature left by a packet (ATAPI) device after reset
    pub fn atapi_signature() -> Self {
        Self {
            sector_count: 0x01,
            lba_low: 0x01,
            lba_mid: 0x14,
            lba_high: 0xeb,
            ..Default::default()
        }
    }

    /// Signature left by a plain ATA device after reset
    pub fn ata_signature() -> Self {
        Self {
            sector_count: 0x01,
            lba_low: 0x01,
            ..Default::default()
        }
    }

    pub fn is_atapi(&self) -> bool {
        self.sector_count == 0x01 && self.lba_low == 0x01 && self.lba_mid == 0x14 && self.lba_high == 0xeb
    }
}

/// IDENTIFY (PACKET) DEVICE data as 256 little-endian words
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AtaIdentifyData {
    pub words: Vec<u16>,
}

mod word {
    pub const CONFIG: usize = 0;
    pub const CAPABILITY: usize = 49;
    pub const FIELD_VALID: usize = 53;
    pub const COMMAND_SET_1: usize = 82;
    pub const FEATURE_SUPPORT_EXT: usize = 84;
    pub const COMMAND_SET_1_ENABLED: usize = 85;
    pub const COMMAND_SET_2_ENABLED: usize = 86;
    pub const ULTRA_DMA: usize = 88;
}

mod bit {
    pub const REMOVABLE: u16 = 1 << 7;
    pub const DMA: u16 = 1 << 8;
    pub const ULTRA_VALID: u16 = 1 << 2;
    pub const SMART: u16 = 1 << 0;
    pub const WRITE_CACHE: u16 = 1 << 5;
    pub const LOOK_AHEAD: u16 = 1 << 6;
    pub const LBA48: u16 = 1 << 10;
    pub const WRITE_FUA: u16 = 1 << 6;
    pub const ULTRA_MODES: u16 = 0x7f;
}

impl AtaIdentifyData {
    pub const WORDS: usize = 256;

    pub fn from_bytes(data: &[u8]) -> Option<Self> {
        if data.len() < Self::WORDS * 2 {
            return None;
        }
        let words = data[..Self::WORDS * 2]
            .chunks_exact(2)
            .map(|w| u16::from_le_bytes([w[0], w[1]]))
            .collect();
        Some(Self { words })
    }

    pub fn from_words(words: Vec<u16>) -> Self {
        let mut words = words;
        words.resize(Self::WORDS, 0);
        Self { words }
    }

    #[inline]
    pub fn word(&self, index: usize) -> u16 {
        self.words.get(index).copied().unwrap_or(0)
    }

    fn has(&self, index: usize, mask: u16) -> bool {
        self.word(index) & mask != 0
    }
}

// =============================================================================
// ATA Feature Negotiation
// =============================================================================

/// Transfer-mode value flag for ultra DMA modes
pub const UDMA_XFER_MODE: u8 = 0x40;

/// SET FEATURES subcommands issued during bring-up
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum SetFeature {
    EnableWriteCache = 0x02,
    TransferMode = 0x03,
    DisableReadAhead = 0x55,
    DisableWriteCache = 0x82,
    EnableReadAhead = 0xaa,
}

impl SetFeature {
    pub fn code(self) -> u8 {
        self as u8
    }
}

impl std::fmt::Display for SetFeature {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SetFeature::EnableWriteCache => write!(f, "enable-write-cache"),
            SetFeature::TransferMode => write!(f, "transfer-mode"),
            SetFeature::DisableReadAhead => write!(f, "disable-read-ahead"),
            SetFeature::DisableWriteCache => write!(f, "disable-write-cache"),
            SetFeature::EnableReadAhead => write!(f, "enable-read-ahead"),
        }
    }
}

/// Operator preference for features that the device supports
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct FeaturePolicy {
    /// Force write cache on or off; `None` follows device capability
    #[serde(default)]
    pub write_cache: Option<bool>,
    /// Force read look-ahead on or off; `None` follows device capability
    #[serde(default)]
    pub read_ahead: Option<bool>,
}

/// Features currently in effect on the device
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct FeatureState {
    pub write_cache: bool,
    pub read_ahead: bool,
    pub udma: bool,
    pub dma: bool,
    pub lba48: bool,
    pub smart: bool,
    pub write_fua: bool,
    pub removable: bool,
}

/// Features the host wants in effect
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct DesiredFeatures {
    pub write_cache: bool,
    pub read_ahead: bool,
    pub smart: bool,
    /// Transfer mode still has to be programmed
    pub needs_transfer_mode: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct AtaFeatures {
    pub state: FeatureState,
    pub desired: DesiredFeatures,
    /// `UDMA_XFER_MODE | highest supported mode`, zero without ultra DMA
    pub dma_mode_level: u8,
}

impl AtaFeatures {
    /// Compute current and desired feature state from identify data
    pub fn from_identify(id: &AtaIdentifyData, policy: &FeaturePolicy) -> Self {
        let supports_wc = id.has(word::COMMAND_SET_1, bit::WRITE_CACHE);
        let supports_la = id.has(word::COMMAND_SET_1, bit::LOOK_AHEAD);
        let supports_smart = id.has(word::COMMAND_SET_1, bit::SMART);

        let mut state = FeatureState {
            write_cache: supports_wc && id.has(word::COMMAND_SET_1_ENABLED, bit::WRITE_CACHE),
            read_ahead: supports_la && id.has(word::COMMAND_SET_1_ENABLED, bit::LOOK_AHEAD),
            udma: false,
            dma: id.has(word::CAPABILITY, bit::DMA),
            lba48: id.has(word::COMMAND_SET_2_ENABLED, bit::LBA48),
            smart: supports_smart && id.has(word::COMMAND_SET_1_ENABLED, bit::SMART),
            write_fua: id.has(word::FEATURE_SUPPORT_EXT, bit::WRITE_FUA),
            removable: id.has(word::CONFIG, bit::REMOVABLE),
        };

        let mut desired = DesiredFeatures {
            write_cache: supports_wc && policy.write_cache.unwrap_or(true),
            read_ahead: supports_la && policy.read_ahead.unwrap_or(true),
            smart: supports_smart,
            needs_transfer_mode: false,
        };

        let mut dma_mode_level = 0u8;
        if id.has(word::FIELD_VALID, bit::ULTRA_VALID) {
            let modes = id.word(word::ULTRA_DMA) & bit::ULTRA_MODES;
            if modes != 0 {
                state.udma = true;
                desired.needs_transfer_mode = true;
                let highest = 15 - modes.leading_zeros() as u8;
                dma_mode_level = UDMA_XFER_MODE | highest;
            }
        }

        Self {
            state,
            desired,
            dma_mode_level,
        }
    }

    /// Next SET FEATURES to issue and its sector-count argument
    pub fn next_feature(&self) -> Option<(SetFeature, u8)> {
        if self.desired.write_cache != self.state.write_cache {
            return Some(if self.desired.write_cache {
                (SetFeature::EnableWriteCache, 0)
            } else {
                (SetFeature::DisableWriteCache, 0)
            });
        }
        if self.desired.read_ahead != self.state.read_ahead {
            return Some(if self.desired.read_ahead {
                (SetFeature::EnableReadAhead, 0)
            } else {
                (SetFeature::DisableReadAhead, 0)
            });
        }
        if self.state.udma && self.desired.needs_transfer_mode {
            return Some((SetFeature::TransferMode, self.dma_mode_level));
        }
        None
    }

    /// Record that the device accepted `feature`
    pub fn apply(&mut self, feature: SetFeature) {
        match feature {
            SetFeature::EnableWriteCache => self.state.write_cache = true,
            SetFeature::DisableWriteCache => self.state.write_cache = false,
            SetFeature::EnableReadAhead => self.state.read_ahead = true,
            SetFeature::DisableReadAhead => self.state.read_ahead = false,
            SetFeature::TransferMode => self.desired.needs_transfer_mode = false,
        }
    }

    /// Stop trying `feature` for this bring-up pass
    pub fn abandon(&mut self, feature: SetFeature) {
        match feature {
            SetFeature::EnableWriteCache | SetFeature::DisableWriteCache => {
                self.desired.write_cache = self.state.write_cache
            }
            SetFeature::EnableReadAhead | SetFeature::DisableReadAhead => {
                self.desired.read_ahead = self.state.read_ahead
            }
            SetFeature::TransferMode => self.desired.needs_transfer_mode = false,
        }
    }
}

// =============================================================================
// End-Device Identity
// =============================================================================

/// Identity blobs of an end device
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EndDeviceIdentity {
    #[serde(skip)]
    pub inquiry: Option<Bytes>,
    pub inquiry_summary: Option<InquirySummary>,
    pub unique_id: Option<UniqueId>,
    pub luns: Vec<u64>,
    #[serde(skip)]
    pub port_control: Option<Bytes>,
    pub fis: Option<Fis>,
    pub identify: Option<AtaIdentifyData>,
    pub features: Option<AtaFeatures>,
}

impl EndDeviceIdentity {
    /// Drop data that is re-read on every bring-up
    pub fn reset_volatile(&mut self) {
        self.inquiry = None;
        self.port_control = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn identify(words: &[(usize, u16)]) -> AtaIdentifyData {
        let mut data = vec![0u16; AtaIdentifyData::WORDS];
        for &(i, w) in words {
            data[i] = w;
        }
        AtaIdentifyData::from_words(data)
    }

    #[test]
    fn test_fis_signature() {
        assert!(Fis::atapi_signature().is_atapi());
        assert!(!Fis::ata_signature().is_atapi());
    }

    #[test]
    fn test_identify_from_bytes_is_little_endian() {
        let mut raw = vec![0u8; 512];
        raw[82 * 2] = 0x60;
        let id = AtaIdentifyData::from_bytes(&raw).unwrap();
        assert_eq!(id.word(82), 0x0060);
        assert!(AtaIdentifyData::from_bytes(&raw[..100]).is_none());
    }

    #[test]
    fn test_feature_negotiation_order() {
        // Write cache and look-ahead supported but disabled; UDMA modes 0-5
        let id = identify(&[(82, 0x0060), (53, 0x0004), (88, 0x003f)]);
        let mut features = AtaFeatures::from_identify(&id, &FeaturePolicy::default());
        assert_eq!(features.dma_mode_level, UDMA_XFER_MODE | 5);

        let mut issued = Vec::new();
        while let Some((feature, count)) = features.next_feature() {
            issued.push((feature, count));
            features.apply(feature);
        }
        assert_eq!(
            issued,
            vec![
                (SetFeature::EnableWriteCache, 0),
                (SetFeature::EnableReadAhead, 0),
                (SetFeature::TransferMode, 0x45),
            ]
        );
    }

    #[test]
    fn test_policy_disables_enabled_write_cache() {
        let id = identify(&[(82, 0x0020), (85, 0x0020)]);
        let policy = FeaturePolicy {
            write_cache: Some(false),
            read_ahead: None,
        };
        let features = AtaFeatures::from_identify(&id, &policy);
        assert_eq!(features.next_feature(), Some((SetFeature::DisableWriteCache, 0)));
    }

    #[test]
    fn test_abandon_stops_retrying() {
        let id = identify(&[(82, 0x0020)]);
        let mut features = AtaFeatures::from_identify(&id, &FeaturePolicy::default());
        assert_eq!(features.next_feature(), Some((SetFeature::EnableWriteCache, 0)));
        features.abandon(SetFeature::EnableWriteCache);
        assert_eq!(features.next_feature(), None);
    }

    #[test]
    fn test_inquiry_summary() {
        let mut data = vec![0u8; 36];
        data[0] = 0x0d;
        data[8..16].copy_from_slice(b"ADAPTEC ");
        data[16..32].copy_from_slice(b"SANbloc         ");
        let summary = InquirySummary::parse(&data).unwrap();
        assert_eq!(summary.vendor, "ADAPTEC");
        assert_eq!(summary.product, "SANbloc");
        assert!(summary.is_unreachable());

        data[0] = 0x60;
        assert!(InquirySummary::parse(&data).unwrap().is_unreachable());
        data[0] = 0x00;
        assert!(!InquirySummary::parse(&data).unwrap().is_unreachable());
    }
}

// SPDX-FileCopyrightText: © 2025 Phala Network <dstack@phala.network>
//
// SPDX-License-Identifier: Apache-2.0

//! Intel CSME records logged as `EV_NONHOST_INFO`
//!
//! The management engine logs three kinds of records: a firmware info block,
//! a measurement block carrying the engine's own extend chain (the "ER") as
//! tagged sub-events, and the AMT configuration.

use std::fmt;

use anyhow::{bail, Result};
use nom::{
    bytes::complete::take,
    number::complete::{le_u16, le_u32, le_u8},
    sequence::tuple,
    IResult,
};
use serde::{Serialize, Serializer};
use serde_human_bytes as hex_bytes;
use tracing::debug;

use crate::efi::finish;
use crate::tcg::{HashAlg, RawEvent};

pub const MEASUREMENT_SIGNATURE: &[u8; 20] = b"IntelCSxEEvent01\0\0\0\0";
pub const INFO_SIGNATURE: &[u8; 20] = b"IntelCSxEInfoEvent\0\0";
pub const CONFIG_SIGNATURE: &[u8; 20] = b"IntelCSMEAmtConfig\0\0";

const CONFIG_DATA_MIN_LEN: u32 = 2 + 2 + 256 + 4 + 64;
const MANIFEST_VERSION_LEN: usize = 22;

// sub-event data types
pub const INITIALIZE_MANIFEST: u8 = 0;
pub const EXTEND_MANIFEST: u8 = 1;
pub const MANIFEST_VERSION: u8 = 2;
pub const CONFIGURATION_DATA: u8 = 3;

// measured entities of CONFIGURATION_DATA
pub const SECURITY_PARAMETERS: u8 = 0;
pub const OEM_ENABLED_CAPABILITIES: u8 = 2;
pub const OPERATION_MODE: u8 = 3;
pub const SKU_INFORMATION: u8 = 4;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct FirmwareInfo {
    pub version: u32,
    pub vendor_id: u16,
    pub device_id: u16,
    pub hardware_rot: bool,
    pub invalid_state: bool,
    pub untrusted_measurement: bool,
    pub invalid_measurement: bool,
    pub log_unavailable: bool,
    pub fdo_invalid_measurement: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ProvisioningMode {
    None,
    Enterprise,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AmtConfig {
    pub globally_enabled: bool,
    pub mebx_power_set: bool,
    pub provisioned: bool,
    pub provisioning_mode: ProvisioningMode,
    pub zero_touch: bool,
    pub kvm: bool,
    pub serial_over_lan: bool,
    pub usb_redirect: bool,
    pub secure_pki_suffix: String,
    pub certificate_hash_algorithm: u32,
    #[serde(with = "hex_bytes")]
    pub certificate_hash: Vec<u8>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ManifestVersion {
    pub version: [u16; 4],
    pub tcb_svn: u32,
    pub arb_svn: u32,
    pub vcn: u32,
    pub verification_status: u8,
    pub manifest_identifier: u8,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct SecurityParameters {
    pub soc_config_lock_fuse: bool,
    pub end_of_manufacturing: bool,
    pub manageability_hardware_disabled: bool,
    /// 0 for SPI, 1 for UFS/eMMC
    pub boot_source: u8,
    pub spi_region_write_locked: bool,
    pub spi_descriptor_locked: bool,
    pub rpmc_enabled: bool,
}

impl SecurityParameters {
    fn from_bits(flags: u32) -> Self {
        let bit = |n: u32| (flags >> n) & 1 != 0;
        Self {
            soc_config_lock_fuse: bit(0),
            end_of_manufacturing: bit(1),
            manageability_hardware_disabled: bit(2),
            boot_source: ((flags >> 3) & 1) as u8,
            spi_region_write_locked: bit(4),
            spi_descriptor_locked: bit(5),
            rpmc_enabled: bit(6),
        }
    }
}

#[derive(Clone, Copy, PartialEq, Eq)]
pub struct OperationMode(pub u8);

impl OperationMode {
    pub fn name(self) -> &'static str {
        match self.0 {
            0 => "normal",
            2 => "debug",
            3 => "soft disable",
            4 => "HDA_SDO disable",
            5 => "disabled for refurbishing",
            7 => "enhanced debug",
            _ => "unknown",
        }
    }
}

impl fmt::Debug for OperationMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "OperationMode({}, {})", self.0, self.name())
    }
}

impl Serialize for OperationMode {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.name())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CsmePayload {
    InitializeManifest,
    ExtendManifest,
    ManifestVersion(ManifestVersion),
    SecurityParameters(SecurityParameters),
    OemEnabledCapabilities(u32),
    OperationMode(OperationMode),
    SkuInformation(u8),
    Other,
}

/// One tagged sub-event of a CSME measurement block.
///
/// `raw.alg` is the algorithm of the engine's extend register, not the bank
/// the enclosing event was logged in.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CsmeEvent {
    pub raw: RawEvent,
    pub event_data_type: u8,
    pub measured_entity_id: u8,
    pub payload: CsmePayload,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MeasurementBlock {
    /// `None` when the engine reported an algorithm we do not know
    pub er_alg: Option<HashAlg>,
    pub events: Vec<CsmeEvent>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CsmeRecord {
    Info(FirmwareInfo),
    Measurement(MeasurementBlock),
    AmtConfig(AmtConfig),
    Unrecognized,
}

/// `EV_NONHOST_INFO` event with its CSME record decoded
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NonHostInfoEvent {
    pub raw: RawEvent,
    pub record: CsmeRecord,
}

impl NonHostInfoEvent {
    /// Decode the record by its signature. Records that fail to parse are
    /// kept as [`CsmeRecord::Unrecognized`] and ignored downstream.
    pub fn decode(raw: RawEvent) -> Self {
        let parsed = match raw.data.get(..20) {
            Some(sig) if sig == INFO_SIGNATURE => parse_info_event(&raw.data).map(CsmeRecord::Info),
            Some(sig) if sig == MEASUREMENT_SIGNATURE => {
                parse_measurement_event(&raw).map(CsmeRecord::Measurement)
            }
            Some(sig) if sig == CONFIG_SIGNATURE => {
                parse_config_event(&raw.data).map(CsmeRecord::AmtConfig)
            }
            _ => Ok(CsmeRecord::Unrecognized),
        };
        let record = parsed.unwrap_or_else(|err| {
            debug!("ignoring malformed CSME record: {err:#}");
            CsmeRecord::Unrecognized
        });
        Self { raw, record }
    }
}

fn check_signature(data: &[u8], expected: &[u8; 20]) -> Result<()> {
    if data.get(..20) != Some(&expected[..]) {
        bail!("invalid signature");
    }
    Ok(())
}

pub fn parse_info_event(data: &[u8]) -> Result<FirmwareInfo> {
    check_signature(data, INFO_SIGNATURE)?;
    let (_, (version, vendor_id, device_id, flags)) =
        finish("CSME info", tuple((le_u32, le_u16, le_u16, le_u32))(&data[20..]))?;
    let bit = |n: u32| flags & (1 << n) != 0;
    Ok(FirmwareInfo {
        version,
        vendor_id,
        device_id,
        hardware_rot: bit(0),
        invalid_state: bit(1),
        untrusted_measurement: bit(2),
        invalid_measurement: bit(3),
        log_unavailable: bit(4),
        fdo_invalid_measurement: bit(5),
    })
}

pub fn parse_config_event(data: &[u8]) -> Result<AmtConfig> {
    check_signature(data, CONFIG_SIGNATURE)?;
    let (rest, data_len) = finish("AMT config length", le_u32(&data[20..]))?;
    if data_len < CONFIG_DATA_MIN_LEN {
        bail!("AMT config too short: {data_len} bytes");
    }
    let (_, (flags, suffix, hash_alg, hash)) = finish(
        "AMT config",
        tuple((le_u16, take(256usize), le_u32, take(64usize)))(rest),
    )?;
    let bit = |n: u16| flags & (1 << n) != 0;
    let suffix_len = suffix.iter().rposition(|&b| b != 0).map_or(0, |p| p + 1);
    Ok(AmtConfig {
        globally_enabled: bit(0),
        mebx_power_set: bit(1),
        provisioned: bit(2),
        provisioning_mode: if bit(3) {
            ProvisioningMode::Enterprise
        } else {
            ProvisioningMode::None
        },
        zero_touch: bit(4),
        kvm: bit(8),
        serial_over_lan: bit(9),
        usb_redirect: bit(10),
        secure_pki_suffix: String::from_utf8_lossy(&suffix[..suffix_len]).into_owned(),
        certificate_hash_algorithm: hash_alg,
        certificate_hash: hash.to_vec(),
    })
}

fn tagged_event(input: &[u8]) -> IResult<&[u8], (u8, u8, &[u8])> {
    let (input, (event_data_type, entity, _reserved, size)) =
        tuple((le_u8, le_u8, le_u16, le_u32))(input)?;
    let (input, data) = take(size)(input)?;
    Ok((input, (event_data_type, entity, data)))
}

fn decode_payload(event_data_type: u8, entity: u8, data: &[u8]) -> Result<CsmePayload> {
    let payload = match (event_data_type, entity) {
        (INITIALIZE_MANIFEST, _) => CsmePayload::InitializeManifest,
        (EXTEND_MANIFEST, _) => CsmePayload::ExtendManifest,
        (MANIFEST_VERSION, _) if data.len() >= MANIFEST_VERSION_LEN => {
            let (_, (v0, v1, v2, v3, tcb_svn, arb_svn, vcn, verification_status, manifest_identifier)) =
                finish(
                    "manifest version",
                    tuple((
                        le_u16, le_u16, le_u16, le_u16, le_u32, le_u32, le_u32, le_u8, le_u8,
                    ))(data),
                )?;
            CsmePayload::ManifestVersion(ManifestVersion {
                version: [v0, v1, v2, v3],
                tcb_svn,
                arb_svn,
                vcn,
                verification_status,
                manifest_identifier,
            })
        }
        (CONFIGURATION_DATA, SECURITY_PARAMETERS) if data.len() == 4 => {
            let (_, flags) = finish("security parameters", le_u32(data))?;
            CsmePayload::SecurityParameters(SecurityParameters::from_bits(flags))
        }
        (CONFIGURATION_DATA, OEM_ENABLED_CAPABILITIES) if data.len() == 4 => {
            let (_, flags) = finish("OEM capabilities", le_u32(data))?;
            CsmePayload::OemEnabledCapabilities(flags)
        }
        (CONFIGURATION_DATA, OPERATION_MODE) if data.len() == 1 => {
            CsmePayload::OperationMode(OperationMode(data[0]))
        }
        (CONFIGURATION_DATA, SKU_INFORMATION) if data.len() == 1 => {
            CsmePayload::SkuInformation(data[0])
        }
        _ => CsmePayload::Other,
    };
    Ok(payload)
}

/// Split a measurement block into its tagged sub-events.
///
/// Sub-events inherit index and event type from `raw` and carry the extend
/// register algorithm (or `raw.alg` when that is unknown).
pub fn parse_measurement_event(raw: &RawEvent) -> Result<MeasurementBlock> {
    check_signature(&raw.data, MEASUREMENT_SIGNATURE)?;
    let (mut input, numalg) = finish("CSME ER algorithm", le_u32(&raw.data[20..]))?;
    let er_alg = match numalg {
        0 => Some(HashAlg::Sha1),
        2 => Some(HashAlg::Sha256),
        4 => Some(HashAlg::Sha384),
        _ => None,
    };
    let mut events = vec![];
    while !input.is_empty() {
        let (rest, (event_data_type, measured_entity_id, data)) =
            finish("CSME sub-event", tagged_event(input))?;
        input = rest;
        events.push(CsmeEvent {
            raw: RawEvent {
                sequence: raw.sequence,
                index: raw.index,
                event_type: raw.event_type,
                alg: er_alg.unwrap_or(raw.alg),
                digest: vec![],
                data: data.to_vec(),
            },
            event_data_type,
            measured_entity_id,
            payload: decode_payload(event_data_type, measured_entity_id, data)?,
        });
    }
    Ok(MeasurementBlock { er_alg, events })
}

/// Recompute the engine's extend register from its sub-events.
///
/// Each step is `ER = H(ER || data)` with `data` zero-padded to the digest
/// size and `ER` starting as zeros. The final register is reported as a
/// sequence of little-endian words, so every 4-byte group is byte swapped.
/// An empty sequence yields an empty register.
pub fn replay_er(alg: HashAlg, events: &[CsmeEvent]) -> Vec<u8> {
    let size = alg.size();
    let mut er: Vec<u8> = vec![];
    for event in events {
        let mut data = event.raw.data.clone();
        if data.len() < size {
            data.resize(size, 0);
        }
        if er.is_empty() {
            er = vec![0; size];
        }
        er = alg.digest(&[&er, &data]);
    }
    er.chunks_exact(4)
        .flat_map(|word| [word[3], word[2], word[1], word[0]])
        .collect()
}

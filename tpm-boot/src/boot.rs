// SPDX-FileCopyrightText: © 2025 Phala Network <dstack@phala.network>
//
// SPDX-License-Identifier: Apache-2.0

use std::collections::{BTreeMap, BTreeSet};

use serde::{ser::SerializeMap, Serialize, Serializer};
use tpm_eventlog::csme::{AmtConfig, FirmwareInfo, ManifestVersion, OperationMode, SecurityParameters};
use tpm_eventlog::{Certificate, Partition, PartitionTableHeader, TpmEvent};

use crate::{Error, Hash, Separators};

/// Progress through `ExitBootServices()` as logged in PCR 5
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ExitBootServices {
    #[default]
    Pre,
    Running,
    Done,
}

/// Platform firmware and vendor detection
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct FirmwareState {
    pub boot_guard_ibb: Hash,
    pub setup: Hash,
    /// Firmware volumes in the BIOS flash window, by hex base address
    pub embedded_firmware: BTreeMap<String, Hash>,
    pub is_lenovo: bool,
    pub is_dell: bool,
}

/// Intel Converged Security and Management Engine
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CsmeState {
    pub info: Option<FirmwareInfo>,
    pub amt_config: Option<AmtConfig>,
    /// Manifest version per measured entity
    pub component_versions: BTreeMap<u8, ManifestVersion>,
    /// Manifest hash per measured entity
    #[serde(serialize_with = "hex_values")]
    pub component_hash: BTreeMap<u8, Vec<u8>>,
    pub security_parameters: Option<SecurityParameters>,
    pub operation_mode: Option<OperationMode>,
}

/// UEFI Secure Boot variables and shim's MOK lists
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SecureBootState {
    pub secure_boot: Option<u8>,
    pub audit_mode: Option<u8>,
    pub deployed_mode: Option<u8>,
    pub setup_mode: Option<u8>,
    pub pk: Hash,
    pub pk_parsed: Option<Certificate>,
    pub kek: Hash,
    pub kek_parsed: Vec<Certificate>,
    pub db: Hash,
    /// TBS fingerprints and image hashes in `db`, hex encoded
    pub db_contents: BTreeSet<String>,
    pub dbx: Hash,
    /// TBS fingerprints and image hashes in `dbx`, hex encoded
    pub dbx_contents: BTreeSet<String>,
    pub mok_list: Hash,
    pub mok_list_x: Hash,
}

/// Boot manager, OS loader and kernel hand-off
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct BootloaderState {
    /// UEFI boot variables other than `Boot####`, by name
    pub boot_variables: BTreeMap<String, Hash>,
    pub boot_order: Hash,
    /// Boot applications by device path
    pub boot_applications: BTreeMap<String, Hash>,
    pub exit_boot_services: ExitBootServices,
    pub gpt: Hash,
    pub partition_table_header: Option<PartitionTableHeader>,
    pub partitions: Vec<Partition>,
    pub linux_file: Option<String>,
    pub linux_digest: Hash,
    pub linux_command: Option<Vec<String>>,
    pub initrd_file: Option<String>,
    pub initrd_digest: Hash,
}

/// Linux Integrity Measurement Architecture
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ImaState {
    pub boot_aggregate: Hash,
    /// Measured files by absolute path
    pub files: BTreeMap<String, Hash>,
    pub kexec_cmdline: Hash,
}

/// Boot-chain facts reconstructed from one replayed event log
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Boot {
    /// No event was consumed yet
    pub is_empty: bool,
    pub firmware: FirmwareState,
    pub csme: CsmeState,
    pub secure_boot: SecureBootState,
    pub bootloader: BootloaderState,
    pub ima: ImaState,
    pub separators: Separators,
}

impl Default for Boot {
    fn default() -> Self {
        Self::empty()
    }
}

impl Boot {
    pub fn empty() -> Self {
        Self {
            is_empty: true,
            firmware: FirmwareState::default(),
            csme: CsmeState::default(),
            secure_boot: SecureBootState::default(),
            bootloader: BootloaderState::default(),
            ima: ImaState::default(),
            separators: Separators::default(),
        }
    }

    /// Replay `events` in order into a fresh snapshot. The first error
    /// aborts the replay.
    pub fn from_events<'a>(events: impl IntoIterator<Item = &'a TpmEvent>) -> Result<Self, Error> {
        let mut boot = Self::empty();
        for event in events {
            boot.consume(event)?;
        }
        Ok(boot)
    }
}

fn hex_values<S: Serializer>(map: &BTreeMap<u8, Vec<u8>>, serializer: S) -> Result<S::Ok, S::Error> {
    let mut out = serializer.serialize_map(Some(map.len()))?;
    for (k, v) in map {
        out.serialize_entry(k, &hex::encode(v))?;
    }
    out.end()
}

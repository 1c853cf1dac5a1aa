// SPDX-FileCopyrightText: © 2025 Phala Network <dstack@phala.network>
//
// SPDX-License-Identifier: Apache-2.0

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use serde_human_bytes as hex_bytes;
use tpm2::{Marshal, Name, TpmtPublic, Unmarshal};
use tpm_types::Configuration;

/// Everything known about a device before its next quote arrives
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct VerifierConfig {
    /// Freshness state left by the last accepted quote
    #[serde(default)]
    pub configuration: Configuration,
    /// Qualified name of the hierarchy the AIK was enrolled under
    #[serde(with = "hex_bytes")]
    pub root_qn: Vec<u8>,
    /// Marshalled TPMT_PUBLIC of the AIK
    #[serde(with = "hex_bytes")]
    pub aik: Vec<u8>,
}

impl VerifierConfig {
    pub fn new(configuration: Configuration, root_qn: &Name, aik: &TpmtPublic) -> Result<Self> {
        Ok(Self {
            configuration,
            root_qn: root_qn.to_bytes(),
            aik: aik.to_bytes().context("failed to encode AIK")?,
        })
    }

    pub fn root_qn(&self) -> Result<Name> {
        Name::from_bytes(&self.root_qn).context("invalid root qualified name")
    }

    pub fn aik(&self) -> Result<TpmtPublic> {
        TpmtPublic::from_bytes_exact(&self.aik).context("invalid AIK public area")
    }

    /// Same device, with the freshness state of a newly accepted quote
    pub fn with_configuration(&self, configuration: Configuration) -> Self {
        Self {
            configuration,
            ..self.clone()
        }
    }
}

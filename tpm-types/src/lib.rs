// SPDX-FileCopyrightText: © 2025 Phala Network <dstack@phala.network>
//
// SPDX-License-Identifier: Apache-2.0

//! TPM Types - evidence exchanged between attestation clients and the verifier
//!
//! This crate contains type definitions shared across the verifier crates:
//! - tpm-qvl (checks the quote inside [`Evidence`])
//! - verifier (drives quote verification and boot reconstruction)

use std::collections::BTreeMap;
use std::ops::Deref;

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use serde_human_bytes as hex_bytes;
use sha2::{Digest, Sha256};

pub use canonical::to_canonical_json;

mod canonical;

/// Byte string, hex encoded in human-readable formats
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Buffer(#[serde(with = "hex_bytes")] pub Vec<u8>);

impl Deref for Buffer {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        &self.0
    }
}

impl From<Vec<u8>> for Buffer {
    fn from(v: Vec<u8>) -> Self {
        Self(v)
    }
}

/// PCR index (decimal string) to PCR value
pub type PcrBank = BTreeMap<String, Buffer>;

/// Hash algorithm id (decimal string, e.g. `"11"` for SHA-256) to PCR bank
pub type PcrDigests = BTreeMap<String, PcrBank>;

/// Quote and supporting data submitted by a device
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Evidence {
    /// Marshalled TPMS_ATTEST
    #[serde(with = "hex_bytes")]
    pub quote: Vec<u8>,

    /// Marshalled TPMT_SIGNATURE over `quote`
    #[serde(with = "hex_bytes")]
    pub signature: Vec<u8>,

    /// TPMI_ALG_HASH of the legacy `pcrs` bank, as an integer literal
    pub algorithm: String,

    /// Legacy single-bank PCR values
    #[serde(default)]
    pub pcrs: PcrBank,

    /// PCR values of every quoted bank; some clients send empty banks
    #[serde(default, rename = "allpcrs")]
    pub all_pcrs: BTreeMap<String, Option<PcrBank>>,

    pub firmware: FirmwareProperties,
}

impl Evidence {
    /// Hash algorithm of the legacy PCR bank
    pub fn algorithm_id(&self) -> Result<u16> {
        parse_algorithm_id(&self.algorithm)
    }

    /// PCR values the quote is checked against.
    ///
    /// `allpcrs` wins over the legacy `pcrs`/`algorithm` pair. Banks that are
    /// null or empty are dropped. `None` means the client claims a quote over
    /// no PCRs at all.
    pub fn digest_map(&self) -> Result<Option<PcrDigests>> {
        let alg = self.algorithm_id()?;
        if !self.all_pcrs.is_empty() {
            let banks = self
                .all_pcrs
                .iter()
                .filter_map(|(alg, bank)| match bank {
                    Some(bank) if !bank.is_empty() => Some((alg.clone(), bank.clone())),
                    _ => None,
                })
                .collect();
            return Ok(Some(banks));
        }
        if self.pcrs.is_empty() {
            return Ok(None);
        }
        Ok(Some(BTreeMap::from([(alg.to_string(), self.pcrs.clone())])))
    }
}

/// Parse an integer literal the way the clients format algorithm ids:
/// `0x`/`0o`/`0b` prefixes, a bare leading `0` for octal, decimal otherwise.
pub fn parse_algorithm_id(s: &str) -> Result<u16> {
    let digits = s.replace('_', "");
    let (radix, body) = if let Some(rest) = digits
        .strip_prefix("0x")
        .or_else(|| digits.strip_prefix("0X"))
    {
        (16, rest)
    } else if let Some(rest) = digits
        .strip_prefix("0o")
        .or_else(|| digits.strip_prefix("0O"))
    {
        (8, rest)
    } else if let Some(rest) = digits
        .strip_prefix("0b")
        .or_else(|| digits.strip_prefix("0B"))
    {
        (2, rest)
    } else if digits.len() > 1 && digits.starts_with('0') {
        (8, &digits[1..])
    } else {
        (10, digits.as_str())
    };
    if body.is_empty() || body.starts_with(['+', '-']) {
        bail!("invalid algorithm id: {s:?}");
    }
    u16::from_str_radix(body, radix).with_context(|| format!("invalid algorithm id: {s:?}"))
}

/// Firmware and platform properties reported alongside the quote.
///
/// The verifier never interprets most of these; it only needs them byte-for-byte
/// to recompute the hash the client put into the quote's extra data. The IMA log
/// is split out because older clients left it out of that hash.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FirmwareProperties {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ima_log: Option<serde_json::Value>,

    #[serde(flatten)]
    pub properties: serde_json::Map<String, serde_json::Value>,
}

impl FirmwareProperties {
    pub fn canonical_json(&self) -> Result<String> {
        to_canonical_json(self)
    }

    /// SHA-256 of the canonical JSON, first without and then with the IMA log.
    pub fn evidence_hashes(&self) -> Result<[Vec<u8>; 2]> {
        let without_ima = FirmwareProperties {
            ima_log: None,
            properties: self.properties.clone(),
        };
        Ok([
            Sha256::digest(without_ima.canonical_json()?.as_bytes()).to_vec(),
            Sha256::digest(self.canonical_json()?.as_bytes()).to_vec(),
        ])
    }
}

/// State carried between two verifications of the same device
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Configuration {
    /// Highest TPM clock accepted so far, zero when unknown
    pub last_clock: u64,
    /// Highest TPM firmware version accepted so far, zero when unknown
    pub last_firmware_version: u64,
}

impl Configuration {
    /// Configuration to use after a quote with these counters was accepted
    pub fn advance(self, clock: u64, firmware_version: u64) -> Self {
        Self {
            last_clock: self.last_clock.max(clock),
            last_firmware_version: self.last_firmware_version.max(firmware_version),
        }
    }
}

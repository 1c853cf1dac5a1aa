// SPDX-FileCopyrightText: © 2024 Phala Network <dstack@phala.network>
//
// SPDX-License-Identifier: Apache-2.0

use anyhow::{bail, Result};
use serde::Serialize;
use serde_human_bytes as hex_bytes;
use sha1::Sha1;
use sha2::{Digest, Sha256, Sha384};

pub const TPM_ALG_SHA1: u16 = 0x4;
pub const TPM_ALG_SHA256: u16 = 0xB;
pub const TPM_ALG_SHA384: u16 = 0xC;

/***
    TCG EventType defined at
   https://trustedcomputinggroup.org/wp-content/uploads/PC-Client-Platform-Firmware-Profile-Version-1.06-Revision-52_pub.pdf
*/
pub const EV_POST_CODE: u32 = 0x1;
pub const EV_NO_ACTION: u32 = 0x3;
pub const EV_SEPARATOR: u32 = 0x4;
pub const EV_ACTION: u32 = 0x5;
pub const EV_S_CRTM_CONTENTS: u32 = 0x7;
pub const EV_S_CRTM_VERSION: u32 = 0x8;
pub const EV_COMPACT_HASH: u32 = 0xc;
pub const EV_IPL: u32 = 0xd;
pub const EV_NONHOST_INFO: u32 = 0x11;

pub const EV_EFI_EVENT_BASE: u32 = 0x80000000;
pub const EV_EFI_VARIABLE_DRIVER_CONFIG: u32 = EV_EFI_EVENT_BASE + 0x1;
pub const EV_EFI_VARIABLE_BOOT: u32 = EV_EFI_EVENT_BASE + 0x2;
pub const EV_EFI_BOOT_SERVICES_APPLICATION: u32 = EV_EFI_EVENT_BASE + 0x3;
pub const EV_EFI_BOOT_SERVICES_DRIVER: u32 = EV_EFI_EVENT_BASE + 0x4;
pub const EV_EFI_RUNTIME_SERVICES_DRIVER: u32 = EV_EFI_EVENT_BASE + 0x5;
pub const EV_EFI_GPT_EVENT: u32 = EV_EFI_EVENT_BASE + 0x6;
pub const EV_EFI_ACTION: u32 = EV_EFI_EVENT_BASE + 0x7;
pub const EV_EFI_PLATFORM_FIRMWARE_BLOB: u32 = EV_EFI_EVENT_BASE + 0x8;
pub const EV_EFI_PLATFORM_FIRMWARE_BLOB2: u32 = EV_EFI_EVENT_BASE + 0xa;
pub const EV_EFI_VARIABLE_BOOT2: u32 = EV_EFI_EVENT_BASE + 0xc;
pub const EV_EFI_GPT_EVENT2: u32 = EV_EFI_EVENT_BASE + 0xd;
pub const EV_EFI_VARIABLE_AUTHORITY: u32 = EV_EFI_EVENT_BASE + 0xe0;

/// Pseudo event type for entries of the Linux IMA runtime log
pub const IMA_MEASUREMENT_EVENT: u32 = 0x14;

/// PCR bank an event was replayed in
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub enum HashAlg {
    Sha1,
    Sha256,
    Sha384,
}

impl HashAlg {
    pub fn from_tpm_alg(alg: u16) -> Option<Self> {
        match alg {
            TPM_ALG_SHA1 => Some(HashAlg::Sha1),
            TPM_ALG_SHA256 => Some(HashAlg::Sha256),
            TPM_ALG_SHA384 => Some(HashAlg::Sha384),
            _ => None,
        }
    }

    pub fn tpm_alg(self) -> u16 {
        match self {
            HashAlg::Sha1 => TPM_ALG_SHA1,
            HashAlg::Sha256 => TPM_ALG_SHA256,
            HashAlg::Sha384 => TPM_ALG_SHA384,
        }
    }

    pub fn size(self) -> usize {
        match self {
            HashAlg::Sha1 => 20,
            HashAlg::Sha256 => 32,
            HashAlg::Sha384 => 48,
        }
    }

    pub fn digest(self, chunks: &[&[u8]]) -> Vec<u8> {
        fn run<D: Digest>(chunks: &[&[u8]]) -> Vec<u8> {
            let mut hasher = D::new();
            for chunk in chunks {
                hasher.update(chunk);
            }
            hasher.finalize().to_vec()
        }
        match self {
            HashAlg::Sha1 => run::<Sha1>(chunks),
            HashAlg::Sha256 => run::<Sha256>(chunks),
            HashAlg::Sha384 => run::<Sha384>(chunks),
        }
    }
}

/// One replayed event log entry: where it was extended, what it claims to
/// have measured and the digest that went into the PCR.
#[derive(Clone, PartialEq, Eq, Serialize)]
pub struct RawEvent {
    pub sequence: u32,
    pub index: u32,
    pub event_type: u32,
    pub alg: HashAlg,
    #[serde(with = "hex_bytes")]
    pub digest: Vec<u8>,
    #[serde(with = "hex_bytes")]
    pub data: Vec<u8>,
}

impl RawEvent {
    pub fn new(index: u32, event_type: u32, alg: HashAlg, digest: Vec<u8>, data: Vec<u8>) -> Self {
        Self {
            sequence: 0,
            index,
            event_type,
            alg,
            digest,
            data,
        }
    }

    /// Event whose digest really is the bank hash of its data
    pub fn measured(index: u32, event_type: u32, alg: HashAlg, data: Vec<u8>) -> Self {
        let digest = alg.digest(&[&data]);
        Self::new(index, event_type, alg, digest, data)
    }

    /// Whether the digest is the hash of `data`.
    ///
    /// The hash function is picked by the digest length, so a SHA-1 digest
    /// recorded in the SHA-256 bank is still checked with SHA-1.
    pub fn digest_equals(&self, data: &[u8]) -> Result<bool> {
        let alg = match self.digest.len() {
            0 => bail!("no digests present"),
            20 => HashAlg::Sha1,
            32 => HashAlg::Sha256,
            48 => HashAlg::Sha384,
            n => bail!("cannot compare digest of {n} bytes"),
        };
        Ok(alg.digest(&[data]) == self.digest)
    }
}

impl std::fmt::Debug for RawEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RawEvent")
            .field("sequence", &self.sequence)
            .field("index", &self.index)
            .field("event_type", &format_args!("{:#x}", self.event_type))
            .field("alg", &self.alg)
            .field("digest", &hex::encode(&self.digest))
            .field("data", &hex::encode(&self.data))
            .finish()
    }
}

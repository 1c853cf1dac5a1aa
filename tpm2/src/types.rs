// SPDX-FileCopyrightText: © 2025 Phala Network <dstack@phala.network>
//
// SPDX-License-Identifier: BUSL-1.1

//! TPM 2.0 data types

use anyhow::{anyhow, bail, Result};

use super::constants::*;
use super::marshal::*;

fn get_alg(buf: &mut WireCursor) -> Result<TpmAlgId> {
    let raw = buf.get_u16()?;
    TpmAlgId::from_u16(raw).ok_or_else(|| anyhow!("unknown algorithm: 0x{raw:04x}"))
}

/// TPMS_PCR_SELECTION - PCR selection for a single hash algorithm
///
/// The bank is kept as the raw `TPM_ALG_ID` so that quotes over banks this
/// crate has no digest for still decode.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TpmsPcrSelection {
    pub hash: u16,
    pub pcr_select: Vec<u8>, // Bitmap of selected PCRs
}

impl TpmsPcrSelection {
    pub fn new(alg: TpmAlgId, pcrs: &[u32]) -> Self {
        let hash = alg.to_u16();
        // At least 3 bytes, enough for PCR 0-23
        let max_pcr = pcrs.iter().max().copied().unwrap_or(0);
        let size = ((max_pcr / 8) + 1).max(3) as usize;
        let mut pcr_select = vec![0u8; size];
        for &pcr in pcrs {
            pcr_select[(pcr / 8) as usize] |= 1 << (pcr % 8);
        }
        Self { hash, pcr_select }
    }

    pub fn alg(&self) -> Option<TpmAlgId> {
        TpmAlgId::from_u16(self.hash)
    }

    /// Selected PCR indices in ascending order
    pub fn pcr_indices(&self) -> Vec<u32> {
        let mut indices = Vec::new();
        for (byte_idx, &byte) in self.pcr_select.iter().enumerate() {
            for bit_idx in 0..8 {
                if byte & (1 << bit_idx) != 0 {
                    indices.push((byte_idx * 8 + bit_idx) as u32);
                }
            }
        }
        indices
    }
}

impl Marshal for TpmsPcrSelection {
    fn marshal(&self, buf: &mut WireBuffer) -> Result<()> {
        let Ok(size) = u8::try_from(self.pcr_select.len()) else {
            bail!("PCR bitmap too large: {} bytes", self.pcr_select.len());
        };
        buf.put_u16(self.hash);
        buf.put_u8(size);
        buf.put_bytes(&self.pcr_select);
        Ok(())
    }
}

impl Unmarshal for TpmsPcrSelection {
    fn unmarshal(buf: &mut WireCursor) -> Result<Self> {
        let hash = buf.get_u16()?;
        let size = buf.get_u8()? as usize;
        let pcr_select = buf.get_bytes(size)?;
        Ok(Self { hash, pcr_select })
    }
}

/// TPML_PCR_SELECTION - List of PCR selections
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TpmlPcrSelection {
    pub pcr_selections: Vec<TpmsPcrSelection>,
}

impl TpmlPcrSelection {
    pub fn new(selections: Vec<TpmsPcrSelection>) -> Self {
        Self {
            pcr_selections: selections,
        }
    }

    /// The only encoding of "no PCRs" a TPM produces: one selection with
    /// `TPM_ALG_ERROR` and an empty bitmap.
    pub fn is_empty_selection(&self) -> bool {
        match self.pcr_selections.as_slice() {
            [only] => only.alg() == Some(TpmAlgId::Error) && only.pcr_indices().is_empty(),
            _ => false,
        }
    }
}

impl Marshal for TpmlPcrSelection {
    fn marshal(&self, buf: &mut WireBuffer) -> Result<()> {
        buf.put_u32(self.pcr_selections.len() as u32);
        for sel in &self.pcr_selections {
            sel.marshal(buf)?;
        }
        Ok(())
    }
}

impl Unmarshal for TpmlPcrSelection {
    fn unmarshal(buf: &mut WireCursor) -> Result<Self> {
        let count = buf.get_u32()? as usize;
        // each entry needs at least 3 bytes
        if count > buf.remaining() / 3 {
            bail!("PCR selection count {count} exceeds input");
        }
        let mut pcr_selections = Vec::with_capacity(count);
        for _ in 0..count {
            pcr_selections.push(TpmsPcrSelection::unmarshal(buf)?);
        }
        Ok(Self { pcr_selections })
    }
}

/// TPMS_CLOCK_INFO
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TpmsClockInfo {
    pub clock: u64,
    pub reset_count: u32,
    pub restart_count: u32,
    pub safe: u8,
}

impl Marshal for TpmsClockInfo {
    fn marshal(&self, buf: &mut WireBuffer) -> Result<()> {
        buf.put_u64(self.clock);
        buf.put_u32(self.reset_count);
        buf.put_u32(self.restart_count);
        buf.put_u8(self.safe);
        Ok(())
    }
}

impl Unmarshal for TpmsClockInfo {
    fn unmarshal(buf: &mut WireCursor) -> Result<Self> {
        Ok(Self {
            clock: buf.get_u64()?,
            reset_count: buf.get_u32()?,
            restart_count: buf.get_u32()?,
            safe: buf.get_u8()?,
        })
    }
}

/// TPMS_QUOTE_INFO
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TpmsQuoteInfo {
    pub pcr_select: TpmlPcrSelection,
    pub pcr_digest: Vec<u8>,
}

impl Marshal for TpmsQuoteInfo {
    fn marshal(&self, buf: &mut WireBuffer) -> Result<()> {
        self.pcr_select.marshal(buf)?;
        buf.put_tpm2b(&self.pcr_digest)
    }
}

impl Unmarshal for TpmsQuoteInfo {
    fn unmarshal(buf: &mut WireCursor) -> Result<Self> {
        Ok(Self {
            pcr_select: TpmlPcrSelection::unmarshal(buf)?,
            pcr_digest: buf.get_tpm2b()?,
        })
    }
}

/// TPMU_ATTEST
///
/// Only quotes are decoded; the body of every other attestation type is kept
/// verbatim so re-encoding stays byte-exact.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TpmuAttest {
    Quote(TpmsQuoteInfo),
    Other(Vec<u8>),
}

/// TPMS_ATTEST - Attestation structure (returned by Quote)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TpmsAttest {
    pub magic: u32,
    pub attest_type: u16,
    /// TPM2B_NAME of the signing key, qualified by its hierarchy
    pub qualified_signer: Vec<u8>,
    pub extra_data: Vec<u8>,
    pub clock_info: TpmsClockInfo,
    pub firmware_version: u64,
    pub attested: TpmuAttest,
}

impl TpmsAttest {
    pub fn quote_info(&self) -> Option<&TpmsQuoteInfo> {
        match &self.attested {
            TpmuAttest::Quote(info) if self.attest_type == TpmStAttest::Quote.to_u16() => {
                Some(info)
            }
            _ => None,
        }
    }
}

impl Marshal for TpmsAttest {
    fn marshal(&self, buf: &mut WireBuffer) -> Result<()> {
        buf.put_u32(self.magic);
        buf.put_u16(self.attest_type);
        buf.put_tpm2b(&self.qualified_signer)?;
        buf.put_tpm2b(&self.extra_data)?;
        self.clock_info.marshal(buf)?;
        buf.put_u64(self.firmware_version);
        match &self.attested {
            TpmuAttest::Quote(info) => info.marshal(buf),
            TpmuAttest::Other(body) => {
                buf.put_bytes(body);
                Ok(())
            }
        }
    }
}

impl Unmarshal for TpmsAttest {
    fn unmarshal(buf: &mut WireCursor) -> Result<Self> {
        let magic = buf.get_u32()?;
        let attest_type = buf.get_u16()?;
        let qualified_signer = buf.get_tpm2b()?;
        let extra_data = buf.get_tpm2b()?;
        let clock_info = TpmsClockInfo::unmarshal(buf)?;
        let firmware_version = buf.get_u64()?;
        let attested = if attest_type == TpmStAttest::Quote.to_u16() {
            TpmuAttest::Quote(TpmsQuoteInfo::unmarshal(buf)?)
        } else {
            TpmuAttest::Other(buf.get_remaining())
        };
        Ok(Self {
            magic,
            attest_type,
            qualified_signer,
            extra_data,
            clock_info,
            firmware_version,
            attested,
        })
    }
}

/// TPMT_SYM_DEF_OBJECT - Symmetric definition for objects
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TpmtSymDefObject {
    pub algorithm: TpmAlgId,
    pub key_bits: u16,
    pub mode: TpmAlgId,
}

impl TpmtSymDefObject {
    pub fn null() -> Self {
        Self {
            algorithm: TpmAlgId::Null,
            key_bits: 0,
            mode: TpmAlgId::Null,
        }
    }
}

impl Marshal for TpmtSymDefObject {
    fn marshal(&self, buf: &mut WireBuffer) -> Result<()> {
        buf.put_u16(self.algorithm.to_u16());
        if self.algorithm != TpmAlgId::Null {
            buf.put_u16(self.key_bits);
            buf.put_u16(self.mode.to_u16());
        }
        Ok(())
    }
}

impl Unmarshal for TpmtSymDefObject {
    fn unmarshal(buf: &mut WireCursor) -> Result<Self> {
        let algorithm = get_alg(buf)?;
        if algorithm == TpmAlgId::Null {
            return Ok(Self::null());
        }
        Ok(Self {
            algorithm,
            key_bits: buf.get_u16()?,
            mode: get_alg(buf)?,
        })
    }
}

/// Any of the TPMT_*_SCHEME unions
///
/// Every non-null scheme carries a hash algorithm. ECDAA additionally carries a
/// commit count and XOR a KDF, both kept in `extra`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TpmtScheme {
    pub scheme: TpmAlgId,
    pub hash_alg: Option<TpmAlgId>,
    pub extra: Option<u16>,
}

impl TpmtScheme {
    pub fn null() -> Self {
        Self {
            scheme: TpmAlgId::Null,
            hash_alg: None,
            extra: None,
        }
    }

    pub fn with_hash(scheme: TpmAlgId, hash: TpmAlgId) -> Self {
        Self {
            scheme,
            hash_alg: Some(hash),
            extra: None,
        }
    }
}

impl Marshal for TpmtScheme {
    fn marshal(&self, buf: &mut WireBuffer) -> Result<()> {
        buf.put_u16(self.scheme.to_u16());
        if let Some(hash) = self.hash_alg {
            buf.put_u16(hash.to_u16());
        }
        if let Some(extra) = self.extra {
            buf.put_u16(extra);
        }
        Ok(())
    }
}

impl Unmarshal for TpmtScheme {
    fn unmarshal(buf: &mut WireCursor) -> Result<Self> {
        let scheme = get_alg(buf)?;
        if scheme == TpmAlgId::Null {
            return Ok(Self::null());
        }
        let hash_alg = Some(get_alg(buf)?);
        let extra = match scheme {
            TpmAlgId::EcDaa | TpmAlgId::Xor => Some(buf.get_u16()?),
            _ => None,
        };
        Ok(Self {
            scheme,
            hash_alg,
            extra,
        })
    }
}

/// TPMS_RSA_PARMS - RSA key parameters
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TpmsRsaParms {
    pub symmetric: TpmtSymDefObject,
    pub scheme: TpmtScheme,
    pub key_bits: u16,
    /// Zero selects the default exponent 65537
    pub exponent: u32,
}

/// TPMS_ECC_PARMS - ECC key parameters
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TpmsEccParms {
    pub symmetric: TpmtSymDefObject,
    pub scheme: TpmtScheme,
    pub curve_id: u16,
    pub kdf: TpmtScheme,
}

impl TpmsEccParms {
    pub fn curve(&self) -> Option<TpmEccCurve> {
        TpmEccCurve::from_u16(self.curve_id)
    }
}

/// TPMU_PUBLIC_PARMS - Public parameters union
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TpmtPublicParms {
    Rsa(TpmsRsaParms),
    Ecc(TpmsEccParms),
    KeyedHash(TpmtScheme),
    SymCipher(TpmtSymDefObject),
}

impl Marshal for TpmtPublicParms {
    fn marshal(&self, buf: &mut WireBuffer) -> Result<()> {
        match self {
            TpmtPublicParms::Rsa(p) => {
                p.symmetric.marshal(buf)?;
                p.scheme.marshal(buf)?;
                buf.put_u16(p.key_bits);
                buf.put_u32(p.exponent);
                Ok(())
            }
            TpmtPublicParms::Ecc(p) => {
                p.symmetric.marshal(buf)?;
                p.scheme.marshal(buf)?;
                buf.put_u16(p.curve_id);
                p.kdf.marshal(buf)
            }
            TpmtPublicParms::KeyedHash(scheme) => scheme.marshal(buf),
            TpmtPublicParms::SymCipher(sym) => sym.marshal(buf),
        }
    }
}

/// TPMU_PUBLIC_ID - Unique identifier union
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TpmtPublicUnique {
    Rsa(Vec<u8>),               // TPM2B_PUBLIC_KEY_RSA
    Ecc { x: Vec<u8>, y: Vec<u8> }, // TPMS_ECC_POINT
    KeyedHash(Vec<u8>),         // TPM2B_DIGEST
    SymCipher(Vec<u8>),         // TPM2B_DIGEST
}

impl Marshal for TpmtPublicUnique {
    fn marshal(&self, buf: &mut WireBuffer) -> Result<()> {
        match self {
            TpmtPublicUnique::Rsa(n) => buf.put_tpm2b(n),
            TpmtPublicUnique::Ecc { x, y } => {
                buf.put_tpm2b(x)?;
                buf.put_tpm2b(y)
            }
            TpmtPublicUnique::KeyedHash(d) | TpmtPublicUnique::SymCipher(d) => buf.put_tpm2b(d),
        }
    }
}

/// TPMT_PUBLIC - Public area of a TPM object
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TpmtPublic {
    pub type_alg: TpmAlgId,
    pub name_alg: TpmAlgId,
    pub object_attributes: TpmaObject,
    pub auth_policy: Vec<u8>,
    pub parameters: TpmtPublicParms,
    pub unique: TpmtPublicUnique,
}

impl TpmtPublic {
    /// Restricted RSA-PSS signing key, the shape of an RSA attestation key
    pub fn rsa_attestation_key(modulus: Vec<u8>, exponent: u32) -> Self {
        Self {
            type_alg: TpmAlgId::Rsa,
            name_alg: TpmAlgId::Sha256,
            object_attributes: TpmaObject::attestation_key(),
            auth_policy: Vec::new(),
            parameters: TpmtPublicParms::Rsa(TpmsRsaParms {
                symmetric: TpmtSymDefObject::null(),
                scheme: TpmtScheme::with_hash(TpmAlgId::RsaPss, TpmAlgId::Sha256),
                key_bits: (modulus.len() * 8) as u16,
                exponent,
            }),
            unique: TpmtPublicUnique::Rsa(modulus),
        }
    }

    /// Restricted ECDSA signing key, the shape of an ECC attestation key
    pub fn ecc_attestation_key(curve: TpmEccCurve, x: Vec<u8>, y: Vec<u8>) -> Self {
        Self {
            type_alg: TpmAlgId::Ecc,
            name_alg: TpmAlgId::Sha256,
            object_attributes: TpmaObject::attestation_key(),
            auth_policy: Vec::new(),
            parameters: TpmtPublicParms::Ecc(TpmsEccParms {
                symmetric: TpmtSymDefObject::null(),
                scheme: TpmtScheme::with_hash(TpmAlgId::EcDsa, TpmAlgId::Sha256),
                curve_id: curve.to_u16(),
                kdf: TpmtScheme::null(),
            }),
            unique: TpmtPublicUnique::Ecc { x, y },
        }
    }
}

impl Marshal for TpmtPublic {
    fn marshal(&self, buf: &mut WireBuffer) -> Result<()> {
        buf.put_u16(self.type_alg.to_u16());
        buf.put_u16(self.name_alg.to_u16());
        buf.put_u32(self.object_attributes.0);
        buf.put_tpm2b(&self.auth_policy)?;
        self.parameters.marshal(buf)?;
        self.unique.marshal(buf)
    }
}

impl Unmarshal for TpmtPublic {
    fn unmarshal(buf: &mut WireCursor) -> Result<Self> {
        let type_alg = get_alg(buf)?;
        let name_alg = get_alg(buf)?;
        let object_attributes = TpmaObject(buf.get_u32()?);
        let auth_policy = buf.get_tpm2b()?;
        let (parameters, unique) = match type_alg {
            TpmAlgId::Rsa => {
                let parms = TpmsRsaParms {
                    symmetric: TpmtSymDefObject::unmarshal(buf)?,
                    scheme: TpmtScheme::unmarshal(buf)?,
                    key_bits: buf.get_u16()?,
                    exponent: buf.get_u32()?,
                };
                (
                    TpmtPublicParms::Rsa(parms),
                    TpmtPublicUnique::Rsa(buf.get_tpm2b()?),
                )
            }
            TpmAlgId::Ecc => {
                let parms = TpmsEccParms {
                    symmetric: TpmtSymDefObject::unmarshal(buf)?,
                    scheme: TpmtScheme::unmarshal(buf)?,
                    curve_id: buf.get_u16()?,
                    kdf: TpmtScheme::unmarshal(buf)?,
                };
                let x = buf.get_tpm2b()?;
                let y = buf.get_tpm2b()?;
                (TpmtPublicParms::Ecc(parms), TpmtPublicUnique::Ecc { x, y })
            }
            TpmAlgId::KeyedHash => (
                TpmtPublicParms::KeyedHash(TpmtScheme::unmarshal(buf)?),
                TpmtPublicUnique::KeyedHash(buf.get_tpm2b()?),
            ),
            TpmAlgId::SymCipher => (
                TpmtPublicParms::SymCipher(TpmtSymDefObject::unmarshal(buf)?),
                TpmtPublicUnique::SymCipher(buf.get_tpm2b()?),
            ),
            other => bail!("unsupported public area type: {other:?}"),
        };
        Ok(Self {
            type_alg,
            name_alg,
            object_attributes,
            auth_policy,
            parameters,
            unique,
        })
    }
}

/// TPMT_SIGNATURE - Signature structure
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TpmtSignature {
    EcDsa {
        hash_alg: TpmAlgId,
        r: Vec<u8>,
        s: Vec<u8>,
    },
    RsaPss {
        hash_alg: TpmAlgId,
        sig: Vec<u8>,
    },
    RsaSsa {
        hash_alg: TpmAlgId,
        sig: Vec<u8>,
    },
    Null,
    /// Schemes this crate does not decode, body kept verbatim
    Other {
        sig_alg: u16,
        body: Vec<u8>,
    },
}

impl Marshal for TpmtSignature {
    fn marshal(&self, buf: &mut WireBuffer) -> Result<()> {
        match self {
            TpmtSignature::EcDsa { hash_alg, r, s } => {
                buf.put_u16(TpmAlgId::EcDsa.to_u16());
                buf.put_u16(hash_alg.to_u16());
                buf.put_tpm2b(r)?;
                buf.put_tpm2b(s)
            }
            TpmtSignature::RsaPss { hash_alg, sig } => {
                buf.put_u16(TpmAlgId::RsaPss.to_u16());
                buf.put_u16(hash_alg.to_u16());
                buf.put_tpm2b(sig)
            }
            TpmtSignature::RsaSsa { hash_alg, sig } => {
                buf.put_u16(TpmAlgId::RsaSsa.to_u16());
                buf.put_u16(hash_alg.to_u16());
                buf.put_tpm2b(sig)
            }
            TpmtSignature::Null => {
                buf.put_u16(TpmAlgId::Null.to_u16());
                Ok(())
            }
            TpmtSignature::Other { sig_alg, body } => {
                buf.put_u16(*sig_alg);
                buf.put_bytes(body);
                Ok(())
            }
        }
    }
}

impl Unmarshal for TpmtSignature {
    fn unmarshal(buf: &mut WireCursor) -> Result<Self> {
        let sig_alg = buf.get_u16()?;
        Ok(match TpmAlgId::from_u16(sig_alg) {
            Some(TpmAlgId::EcDsa) => TpmtSignature::EcDsa {
                hash_alg: get_alg(buf)?,
                r: buf.get_tpm2b()?,
                s: buf.get_tpm2b()?,
            },
            Some(TpmAlgId::RsaPss) => TpmtSignature::RsaPss {
                hash_alg: get_alg(buf)?,
                sig: buf.get_tpm2b()?,
            },
            Some(TpmAlgId::RsaSsa) => TpmtSignature::RsaSsa {
                hash_alg: get_alg(buf)?,
                sig: buf.get_tpm2b()?,
            },
            Some(TpmAlgId::Null) => TpmtSignature::Null,
            _ => TpmtSignature::Other {
                sig_alg,
                body: buf.get_remaining(),
            },
        })
    }
}

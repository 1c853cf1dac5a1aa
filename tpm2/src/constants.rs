// SPDX-FileCopyrightText: © 2025 Phala Network <dstack@phala.network>
//
// SPDX-License-Identifier: BUSL-1.1

//! TPM 2.0 constants

use anyhow::{bail, Result};
use sha1::Sha1;
use sha2::{Digest, Sha256, Sha384, Sha512};

/// `TPM_GENERATED_VALUE`, the magic every TPM-produced `TPMS_ATTEST` starts with
pub const TPM_GENERATED_VALUE: u32 = 0xff54_4347;

/// TPM 2.0 Algorithm IDs (TPM_ALG_ID)
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(u16)]
pub enum TpmAlgId {
    Error = 0x0000,
    Rsa = 0x0001,
    Sha1 = 0x0004,
    Hmac = 0x0005,
    Aes = 0x0006,
    Mgf1 = 0x0007,
    KeyedHash = 0x0008,
    Xor = 0x000A,
    Sha256 = 0x000B,
    Sha384 = 0x000C,
    Sha512 = 0x000D,
    Null = 0x0010,
    RsaSsa = 0x0014,
    RsaPss = 0x0016,
    EcDsa = 0x0018,
    EcDaa = 0x001A,
    Sm2 = 0x001B,
    EcSchnorr = 0x001C,
    Kdf1Sp800_56a = 0x0020,
    Kdf1Sp800_108 = 0x0022,
    Ecc = 0x0023,
    SymCipher = 0x0025,
    Ctr = 0x0040,
    Ofb = 0x0041,
    Cbc = 0x0042,
    Cfb = 0x0043,
    Ecb = 0x0044,
}

impl TpmAlgId {
    pub fn to_u16(self) -> u16 {
        self as u16
    }

    pub fn from_u16(v: u16) -> Option<Self> {
        use TpmAlgId::*;
        Some(match v {
            0x0000 => Error,
            0x0001 => Rsa,
            0x0004 => Sha1,
            0x0005 => Hmac,
            0x0006 => Aes,
            0x0007 => Mgf1,
            0x0008 => KeyedHash,
            0x000A => Xor,
            0x000B => Sha256,
            0x000C => Sha384,
            0x000D => Sha512,
            0x0010 => Null,
            0x0014 => RsaSsa,
            0x0016 => RsaPss,
            0x0018 => EcDsa,
            0x001A => EcDaa,
            0x001B => Sm2,
            0x001C => EcSchnorr,
            0x0020 => Kdf1Sp800_56a,
            0x0022 => Kdf1Sp800_108,
            0x0023 => Ecc,
            0x0025 => SymCipher,
            0x0040 => Ctr,
            0x0041 => Ofb,
            0x0042 => Cbc,
            0x0043 => Cfb,
            0x0044 => Ecb,
            _ => return None,
        })
    }

    pub fn digest_size(self) -> usize {
        match self {
            TpmAlgId::Sha1 => 20,
            TpmAlgId::Sha256 => 32,
            TpmAlgId::Sha384 => 48,
            TpmAlgId::Sha512 => 64,
            _ => 0,
        }
    }

    /// Hash the concatenation of `chunks` with this algorithm.
    pub fn digest(self, chunks: &[&[u8]]) -> Result<Vec<u8>> {
        fn run<D: Digest>(chunks: &[&[u8]]) -> Vec<u8> {
            let mut hasher = D::new();
            for chunk in chunks {
                hasher.update(chunk);
            }
            hasher.finalize().to_vec()
        }
        Ok(match self {
            TpmAlgId::Sha1 => run::<Sha1>(chunks),
            TpmAlgId::Sha256 => run::<Sha256>(chunks),
            TpmAlgId::Sha384 => run::<Sha384>(chunks),
            TpmAlgId::Sha512 => run::<Sha512>(chunks),
            other => bail!("not a hash algorithm: {other:?}"),
        })
    }
}

/// TPM 2.0 Permanent Handles
pub mod tpm_rh {
    pub const OWNER: u32 = 0x40000001;
    pub const NULL: u32 = 0x40000007;
    pub const ENDORSEMENT: u32 = 0x4000000B;
    pub const PLATFORM: u32 = 0x4000000C;
}

/// `TPMI_ST_ATTEST` structure tags
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum TpmStAttest {
    Nv = 0x8014,
    CommandAudit = 0x8015,
    SessionAudit = 0x8016,
    Certify = 0x8017,
    Quote = 0x8018,
    Time = 0x8019,
    Creation = 0x801A,
}

impl TpmStAttest {
    pub fn to_u16(self) -> u16 {
        self as u16
    }
}

/// TPM 2.0 Object Attributes
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TpmaObject(pub u32);

impl TpmaObject {
    pub const FIXED_TPM: u32 = 1 << 1;
    pub const FIXED_PARENT: u32 = 1 << 4;
    pub const SENSITIVE_DATA_ORIGIN: u32 = 1 << 5;
    pub const USER_WITH_AUTH: u32 = 1 << 6;
    pub const RESTRICTED: u32 = 1 << 16;
    pub const DECRYPT: u32 = 1 << 17;
    pub const SIGN_ENCRYPT: u32 = 1 << 18;

    /// Attributes of a restricted signing key as used for quoting
    pub fn attestation_key() -> Self {
        Self(
            Self::FIXED_TPM
                | Self::FIXED_PARENT
                | Self::SENSITIVE_DATA_ORIGIN
                | Self::USER_WITH_AUTH
                | Self::RESTRICTED
                | Self::SIGN_ENCRYPT,
        )
    }

    pub fn is_restricted_signer(self) -> bool {
        self.0 & (Self::RESTRICTED | Self::SIGN_ENCRYPT) == Self::RESTRICTED | Self::SIGN_ENCRYPT
    }
}

/// ECC Curve IDs
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum TpmEccCurve {
    None = 0x0000,
    NistP192 = 0x0001,
    NistP224 = 0x0002,
    NistP256 = 0x0003,
    NistP384 = 0x0004,
    NistP521 = 0x0005,
    BnP256 = 0x0010,
    BnP638 = 0x0011,
    Sm2P256 = 0x0020,
}

impl TpmEccCurve {
    pub fn to_u16(self) -> u16 {
        self as u16
    }

    pub fn from_u16(v: u16) -> Option<Self> {
        use TpmEccCurve::*;
        Some(match v {
            0x0000 => None,
            0x0001 => NistP192,
            0x0002 => NistP224,
            0x0003 => NistP256,
            0x0004 => NistP384,
            0x0005 => NistP521,
            0x0010 => BnP256,
            0x0011 => BnP638,
            0x0020 => Sm2P256,
            _ => return Option::None,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn alg_ids_round_trip() {
        for alg in [TpmAlgId::Error, TpmAlgId::Sha256, TpmAlgId::EcDsa, TpmAlgId::Ecb] {
            assert_eq!(TpmAlgId::from_u16(alg.to_u16()), Some(alg));
        }
        assert_eq!(TpmAlgId::from_u16(0x7777), None);
    }

    #[test]
    fn digest_concatenates_chunks() {
        let split = TpmAlgId::Sha256.digest(&[b"ab", b"c"]).unwrap();
        assert_eq!(
            hex::encode(split),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
        assert_eq!(TpmAlgId::Sha1.digest(&[]).unwrap().len(), 20);
        assert!(TpmAlgId::Rsa.digest(&[b"x"]).is_err());
    }
}

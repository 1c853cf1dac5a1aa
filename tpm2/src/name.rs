// SPDX-FileCopyrightText: © 2025 Phala Network <dstack@phala.network>
//
// SPDX-License-Identifier: BUSL-1.1

//! Object names and qualified names (TPM 2.0 Part 1, 16 Names)

use anyhow::{anyhow, bail, Result};

use super::constants::*;
use super::marshal::*;
use super::types::TpmtPublic;

/// TPMU_NAME: a bare handle for permanent entities, otherwise the name
/// algorithm followed by the digest of the public area.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Name {
    Handle(u32),
    Digest { hash_alg: TpmAlgId, digest: Vec<u8> },
}

impl Name {
    /// Name bytes without the TPM2B size prefix
    pub fn to_bytes(&self) -> Vec<u8> {
        match self {
            Name::Handle(handle) => handle.to_be_bytes().to_vec(),
            Name::Digest { hash_alg, digest } => {
                let mut out = Vec::with_capacity(2 + digest.len());
                out.extend_from_slice(&hash_alg.to_u16().to_be_bytes());
                out.extend_from_slice(digest);
                out
            }
        }
    }

    pub fn from_bytes(data: &[u8]) -> Result<Self> {
        if let Ok(handle) = <[u8; 4]>::try_from(data) {
            return Ok(Name::Handle(u32::from_be_bytes(handle)));
        }
        let Some((alg, digest)) = data.split_first_chunk::<2>() else {
            bail!("name too short: {} bytes", data.len());
        };
        let raw = u16::from_be_bytes(*alg);
        let hash_alg =
            TpmAlgId::from_u16(raw).ok_or_else(|| anyhow!("unknown name algorithm 0x{raw:04x}"))?;
        if hash_alg.digest_size() == 0 || hash_alg.digest_size() != digest.len() {
            bail!(
                "name digest of {} bytes does not match {hash_alg:?}",
                digest.len()
            );
        }
        Ok(Name::Digest {
            hash_alg,
            digest: digest.to_vec(),
        })
    }
}

impl TpmtPublic {
    /// Name of the object: `nameAlg || H_nameAlg(TPMT_PUBLIC)`
    pub fn name(&self) -> Result<Name> {
        let public = self.to_bytes()?;
        Ok(Name::Digest {
            hash_alg: self.name_alg,
            digest: self.name_alg.digest(&[&public])?,
        })
    }
}

/// Qualified name of `child` under a parent with qualified name `parent`:
/// `nameAlg || H_nameAlg(QN(parent) || Name(child))`
pub fn qualified_name(parent: &Name, child: &TpmtPublic) -> Result<Name> {
    let name = child.name()?;
    Ok(Name::Digest {
        hash_alg: child.name_alg,
        digest: child
            .name_alg
            .digest(&[&parent.to_bytes(), &name.to_bytes()])?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn handle_names() {
        let name = Name::from_bytes(&[0x40, 0x00, 0x00, 0x0b]).unwrap();
        assert_eq!(name, Name::Handle(tpm_rh::ENDORSEMENT));
        assert_eq!(name.to_bytes(), vec![0x40, 0x00, 0x00, 0x0b]);
    }

    #[test]
    fn digest_names_check_length() {
        let mut bytes = vec![0x00, 0x0b];
        bytes.extend_from_slice(&[0x55; 32]);
        let name = Name::from_bytes(&bytes).unwrap();
        assert_eq!(name.to_bytes(), bytes);
        assert!(Name::from_bytes(&bytes[..20]).is_err());
        assert!(Name::from_bytes(&[0x00]).is_err());
    }

    #[test]
    fn qualified_name_chains_parent() {
        let key = TpmtPublic::ecc_attestation_key(TpmEccCurve::NistP256, vec![7; 32], vec![9; 32]);
        let name = key.name().unwrap();
        let parent = Name::Handle(tpm_rh::ENDORSEMENT);
        let qn = qualified_name(&parent, &key).unwrap();

        let expected = TpmAlgId::Sha256
            .digest(&[&parent.to_bytes(), &name.to_bytes()])
            .unwrap();
        let Name::Digest { hash_alg, digest } = &qn else {
            panic!("expected digest name");
        };
        assert_eq!(*hash_alg, TpmAlgId::Sha256);
        assert_eq!(digest, &expected);
        assert_ne!(qn, name);
    }
}

// SPDX-FileCopyrightText: © 2025 Phala Network <dstack@phala.network>
//
// SPDX-License-Identifier: BUSL-1.1

use anyhow::{anyhow, bail, Context, Result};
use p256::ecdsa::VerifyingKey;
use rsa::{traits::PublicKeyParts, BigUint, RsaPublicKey};
use tracing::debug;
use tpm2::{TpmAlgId, TpmEccCurve, TpmtPublic, TpmtPublicParms, TpmtPublicUnique};

const DEFAULT_RSA_EXPONENT: u32 = 65537;

/// Public part of an attestation key, ready for signature checks
#[derive(Debug, Clone)]
pub enum AikKey {
    Rsa(RsaPublicKey),
    P256(VerifyingKey),
    /// ECC key on a curve quotes are never accepted for
    Ecc(TpmEccCurve),
}

fn left_pad(bytes: &[u8], len: usize) -> Result<Vec<u8>> {
    if bytes.len() > len {
        bail!("coordinate of {} bytes exceeds {len}", bytes.len());
    }
    let mut out = vec![0u8; len - bytes.len()];
    out.extend_from_slice(bytes);
    Ok(out)
}

impl AikKey {
    pub fn from_public(public: &TpmtPublic) -> Result<Self> {
        match (&public.parameters, &public.unique) {
            (TpmtPublicParms::Rsa(parms), TpmtPublicUnique::Rsa(modulus)) => {
                let exponent = match parms.exponent {
                    0 => DEFAULT_RSA_EXPONENT,
                    e => e,
                };
                let key = RsaPublicKey::new(
                    BigUint::from_bytes_be(modulus),
                    BigUint::from(exponent),
                )
                .context("invalid RSA public key")?;
                debug!("extracted RSA AIK ({} bits)", key.size() * 8);
                Ok(AikKey::Rsa(key))
            }
            (TpmtPublicParms::Ecc(parms), TpmtPublicUnique::Ecc { x, y }) => {
                let curve = parms
                    .curve()
                    .ok_or_else(|| anyhow!("unknown ECC curve 0x{:04x}", parms.curve_id))?;
                match curve {
                    TpmEccCurve::NistP256 => {
                        let mut point = vec![0x04];
                        point.extend(left_pad(x, 32)?);
                        point.extend(left_pad(y, 32)?);
                        let key = VerifyingKey::from_sec1_bytes(&point)
                            .context("invalid P-256 public key")?;
                        debug!("extracted ECC P-256 AIK");
                        Ok(AikKey::P256(key))
                    }
                    TpmEccCurve::NistP192
                    | TpmEccCurve::NistP224
                    | TpmEccCurve::NistP384
                    | TpmEccCurve::NistP521 => Ok(AikKey::Ecc(curve)),
                    other => bail!("unsupported ECC curve {other:?}"),
                }
            }
            _ if !matches!(public.type_alg, TpmAlgId::Rsa | TpmAlgId::Ecc) => {
                bail!("AIK of type {:?} cannot sign quotes", public.type_alg)
            }
            _ => bail!("AIK parameters do not match its unique field"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use p256::ecdsa::SigningKey;

    #[test]
    fn p256_key_from_public_area() {
        let signing = SigningKey::random(&mut rand::rngs::OsRng);
        let point = VerifyingKey::from(&signing).to_encoded_point(false);
        let public = TpmtPublic::ecc_attestation_key(
            TpmEccCurve::NistP256,
            point.x().unwrap().to_vec(),
            point.y().unwrap().to_vec(),
        );
        let AikKey::P256(key) = AikKey::from_public(&public).unwrap() else {
            panic!("expected P-256 key");
        };
        assert_eq!(key, VerifyingKey::from(&signing));
    }

    #[test]
    fn other_curves_are_kept_for_rejection() {
        let public = TpmtPublic::ecc_attestation_key(TpmEccCurve::NistP384, vec![1; 48], vec![2; 48]);
        assert!(matches!(
            AikKey::from_public(&public).unwrap(),
            AikKey::Ecc(TpmEccCurve::NistP384)
        ));

        let off_curve = TpmtPublic::ecc_attestation_key(TpmEccCurve::NistP256, vec![1; 32], vec![2; 32]);
        assert!(AikKey::from_public(&off_curve).is_err());
    }

    #[test]
    fn rsa_default_exponent() {
        let mut modulus = vec![0xc5; 256];
        modulus[255] |= 1;
        let public = TpmtPublic::rsa_attestation_key(modulus, 0);
        let AikKey::Rsa(key) = AikKey::from_public(&public).unwrap() else {
            panic!("expected RSA key");
        };
        assert_eq!(key.e(), &BigUint::from(65537u32));
        assert_eq!(key.size(), 256);
    }
}

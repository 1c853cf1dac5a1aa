// SPDX-FileCopyrightText: © 2025 Phala Network <dstack@phala.network>
//
// SPDX-License-Identifier: BUSL-1.1

//! TPM Quote Verification Module

use anyhow::anyhow;
use p256::ecdsa::{signature::hazmat::PrehashVerifier, Signature, VerifyingKey};
use rsa::{pss::Pss, traits::PublicKeyParts, BigUint, RsaPublicKey};
use sha2::{Digest, Sha256};
use tracing::{debug, warn};

use tpm2::{
    qualified_name, Marshal, Name, TpmsAttest, TpmtPublic, TpmtSignature, Unmarshal,
    TPM_GENERATED_VALUE,
};
use tpm_types::{Configuration, Evidence, PcrDigests};

use crate::{AikKey, Error};

type Result<T, E = Error> = std::result::Result<T, E>;

/// Reject with a `QuoteError`, logging the reason
macro_rules! reject {
    ($($arg:tt)*) => {{
        let reason = format!($($arg)*);
        warn!("{reason}");
        return Err(Error::Quote(anyhow!(reason)));
    }};
}

/// A quote that passed every check
#[derive(Debug, Clone)]
pub struct VerifiedQuote {
    pub attest: TpmsAttest,
    /// Qualified name of the AIK that signed the quote
    pub signer: Name,
}

impl VerifiedQuote {
    pub fn clock(&self) -> u64 {
        self.attest.clock_info.clock
    }

    pub fn firmware_version(&self) -> u64 {
        self.attest.firmware_version
    }

    /// Freshness state to verify the next quote of this device against
    pub fn next_configuration(&self, config: &Configuration) -> Configuration {
        config.advance(self.clock(), self.firmware_version())
    }
}

/// Verify `evidence` was quoted by `aik`, a key enrolled under `root_qn`.
///
/// `config` carries the clock and firmware version of the last accepted
/// quote; neither may go backwards.
pub fn validate(
    evidence: &Evidence,
    config: &Configuration,
    root_qn: &Name,
    aik: &TpmtPublic,
) -> Result<VerifiedQuote> {
    let key = AikKey::from_public(aik)
        .map_err(|e| Error::Format(e.context("failed to extract AIK")))?;
    let qn = qualified_name(root_qn, aik)
        .map_err(|e| Error::Format(e.context("failed to compute AIK qualified name")))?;
    let attest = verify_evidence_data(evidence, &qn, config)?;
    let signature = TpmtSignature::from_bytes_exact(&evidence.signature)
        .map_err(|e| Error::Format(e.context("failed to decode TPMT_SIGNATURE")))?;
    verify_quote_signature(&attest, &signature, &qn, &key)?;
    debug!("✓ quote verification successful");
    Ok(VerifiedQuote {
        attest,
        signer: qn,
    })
}

/// Decode the quote and check its fields against the rest of the evidence
pub fn verify_evidence_data(
    evidence: &Evidence,
    quote_key_qn: &Name,
    config: &Configuration,
) -> Result<TpmsAttest> {
    let fw_hashes = evidence
        .firmware
        .evidence_hashes()
        .map_err(|e| Error::Format(e.context("failed to hash firmware properties")))?;
    let digests = evidence
        .digest_map()
        .map_err(|e| Error::Format(e.context("failed to select algorithm")))?;
    let attest = TpmsAttest::from_bytes_exact(&evidence.quote)
        .map_err(|e| Error::Format(e.context("failed to decode TPMS_ATTEST")))?;
    verify_quote_fields(&attest, digests.as_ref(), &fw_hashes, quote_key_qn, config)?;
    Ok(attest)
}

/// Check signer, PCR selection and digest, extra data, magic and freshness.
///
/// `digests` of `None` stands for a client that quoted no PCRs at all.
pub fn verify_quote_fields(
    attest: &TpmsAttest,
    digests: Option<&PcrDigests>,
    fw_hashes: &[Vec<u8>],
    quote_key_qn: &Name,
    config: &Configuration,
) -> Result<()> {
    let expected_signer = quote_key_qn.to_bytes();
    if attest.qualified_signer != expected_signer {
        reject!(
            "wrong signer: expected {}, received {}",
            hex::encode(&expected_signer),
            hex::encode(&attest.qualified_signer)
        );
    }

    let Some(info) = attest.quote_info() else {
        reject!("not a quote: attestation type 0x{:04x}", attest.attest_type);
    };

    let selections = &info.pcr_select.pcr_selections;
    // a quote over no PCRs decodes as a single empty TPM_ALG_ERROR selection
    if !info.pcr_select.is_empty_selection() {
        let received = digests.map_or(0, |d| d.len());
        if selections.len() != received {
            reject!(
                "number of PCR banks mismatch: received {received}, quoted {}",
                selections.len()
            );
        }
        for selection in selections {
            let bank_id = selection.hash.to_string();
            let Some(bank) = digests.and_then(|d| d.get(&bank_id)) else {
                reject!("quoted PCR bank {bank_id} missing in evidence");
            };
            let pcrs = selection.pcr_indices();
            if pcrs.len() != bank.len() {
                reject!(
                    "wrong PCR set in bank {bank_id}: received {:?}, quoted {pcrs:?}",
                    bank.keys().collect::<Vec<_>>()
                );
            }
            if let Some(pcr) = pcrs.iter().find(|pcr| !bank.contains_key(&pcr.to_string())) {
                reject!("PCR {pcr} missing in bank {bank_id}");
            }
        }
    }

    let mut hasher = Sha256::new();
    for selection in selections {
        let bank = digests.and_then(|d| d.get(&selection.hash.to_string()));
        for pcr in selection.pcr_indices() {
            if let Some(value) = bank.and_then(|b| b.get(&pcr.to_string())) {
                hasher.update(&value.0);
            }
        }
    }
    let pcr_digest = hasher.finalize();
    if info.pcr_digest != pcr_digest.as_slice() {
        reject!(
            "wrong PCR digest: expected {}, received {}",
            hex::encode(pcr_digest),
            hex::encode(&info.pcr_digest)
        );
    }

    if !fw_hashes.iter().any(|h| *h == attest.extra_data) {
        reject!(
            "wrong firmware properties hash: received {}",
            hex::encode(&attest.extra_data)
        );
    }

    if attest.magic != TPM_GENERATED_VALUE {
        reject!(
            "wrong attestation structure magic value: 0x{:08x}",
            attest.magic
        );
    }

    if attest.clock_info.clock < config.last_clock {
        reject!(
            "clock was rolled back: last {}, received {}",
            config.last_clock,
            attest.clock_info.clock
        );
    }

    if attest.firmware_version < config.last_firmware_version {
        reject!(
            "firmware was rolled back: last {}, received {}",
            config.last_firmware_version,
            attest.firmware_version
        );
    }

    debug!("✓ quote fields verified");
    Ok(())
}

/// Check `signature` over the re-encoded `attest` with the AIK.
///
/// The message is hashed with the name algorithm of the AIK qualified name.
pub fn verify_quote_signature(
    attest: &TpmsAttest,
    signature: &TpmtSignature,
    quote_key_qn: &Name,
    key: &AikKey,
) -> Result<()> {
    let Name::Digest { hash_alg, .. } = quote_key_qn else {
        return Err(Error::Format(anyhow!(
            "qualified name of the quote key has no hash algorithm"
        )));
    };
    let message = attest
        .to_bytes()
        .map_err(|e| Error::Format(e.context("failed to re-encode attestation structure")))?;
    let message_hash = hash_alg
        .digest(&[&message])
        .map_err(|e| Error::Format(e.context("failed to create hasher")))?;
    debug!("message hash: {}", hex::encode(&message_hash));

    let valid = match signature {
        TpmtSignature::EcDsa { r, s, .. } => {
            let AikKey::P256(ecc_key) = key else {
                reject!("quote key is not a ECDSA key over NIST P-256");
            };
            verify_ecdsa(ecc_key, &message_hash, r, s)
        }
        TpmtSignature::RsaPss { sig, .. } => match key {
            AikKey::Rsa(rsa_key) => verify_rsa_pss(rsa_key, &message_hash, sig),
            _ => {
                warn!("RSA-PSS signature with a non-RSA quote key");
                false
            }
        },
        other => {
            warn!("unsupported signature scheme: {other:?}");
            false
        }
    };

    if !valid {
        reject!("attestation signature invalid");
    }
    debug!("✓ quote signature verified");
    Ok(())
}

fn verify_ecdsa(key: &VerifyingKey, message_hash: &[u8], r: &[u8], s: &[u8]) -> bool {
    let signature = scalar_pair(r, s).and_then(|bytes| {
        Signature::from_slice(&bytes).map_err(|e| anyhow!("failed to parse ECDSA signature: {e}"))
    });
    let signature = match signature {
        Ok(signature) => signature,
        Err(e) => {
            warn!("{e:#}");
            return false;
        }
    };
    match key.verify_prehash(message_hash, &signature) {
        Ok(()) => {
            debug!("✓ ECC signature verification successful");
            true
        }
        Err(e) => {
            warn!("ECC signature verification failed: {e}");
            false
        }
    }
}

/// `r || s`, each left padded to the P-256 scalar size
fn scalar_pair(r: &[u8], s: &[u8]) -> anyhow::Result<Vec<u8>> {
    let mut out = Vec::with_capacity(64);
    for scalar in [r, s] {
        let scalar = match scalar.iter().position(|&b| b != 0) {
            Some(first) => &scalar[first..],
            None => &[][..],
        };
        if scalar.len() > 32 {
            anyhow::bail!("ECDSA scalar of {} bytes", scalar.len());
        }
        out.extend(std::iter::repeat(0).take(32 - scalar.len()));
        out.extend_from_slice(scalar);
    }
    Ok(out)
}

/// Salt length of an EMSA-PSS block, read back from the signature.
///
/// Opens `sig` with the public key, unmasks DB with MGF1-SHA-256 and finds
/// the `0x01` octet that ends the zero padding.
fn pss_salt_len(key: &RsaPublicKey, sig: &[u8]) -> Option<usize> {
    let h_len = Sha256::output_size();
    let em_bits = key.n().bits().checked_sub(1)?;
    let em_len = em_bits.div_ceil(8);
    if sig.len() != key.size() || em_len < h_len + 2 {
        return None;
    }
    let s = BigUint::from_bytes_be(sig);
    if &s >= key.n() {
        return None;
    }
    let m = s.modpow(key.e(), key.n()).to_bytes_be();
    if m.len() > em_len {
        return None;
    }
    let mut em = vec![0u8; em_len - m.len()];
    em.extend(m);

    let (&trailer, em) = em.split_last()?;
    if trailer != 0xbc {
        return None;
    }
    let (masked_db, h) = em.split_at(em_len - h_len - 1);
    let mut db = masked_db.to_vec();
    for (counter, chunk) in (0u32..).zip(db.chunks_mut(h_len)) {
        let mask = Sha256::new()
            .chain_update(h)
            .chain_update(counter.to_be_bytes())
            .finalize();
        chunk.iter_mut().zip(mask).for_each(|(b, m)| *b ^= m);
    }
    db[0] &= 0xff >> (8 * em_len - em_bits);
    let one = db.iter().position(|&b| b != 0)?;
    (db[one] == 0x01).then(|| db.len() - one - 1)
}

/// RSA-PSS with SHA-256. The salt length is whatever the signer used.
fn verify_rsa_pss(key: &RsaPublicKey, message_hash: &[u8], sig: &[u8]) -> bool {
    if message_hash.len() != Sha256::output_size() {
        warn!(
            "RSA-PSS over a {} byte hash, expected SHA-256",
            message_hash.len()
        );
        return false;
    }
    let Some(salt) = pss_salt_len(key, sig) else {
        warn!("RSA signature verification failed: malformed PSS encoding");
        return false;
    };
    match key.verify(Pss::new_with_salt::<Sha256>(salt), message_hash, sig) {
        Ok(()) => {
            debug!("✓ RSA signature verification successful (salt {salt})");
            true
        }
        Err(e) => {
            warn!("RSA signature verification failed: {e}");
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;
    use tpm2::{
        TpmAlgId, TpmStAttest, TpmlPcrSelection, TpmsClockInfo, TpmsPcrSelection, TpmsQuoteInfo,
        TpmuAttest,
    };
    use tpm_types::Buffer;

    fn signer() -> Name {
        Name::Digest {
            hash_alg: TpmAlgId::Sha256,
            digest: vec![0x42; 32],
        }
    }

    fn attest(selection: TpmlPcrSelection, pcr_digest: Vec<u8>) -> TpmsAttest {
        TpmsAttest {
            magic: TPM_GENERATED_VALUE,
            attest_type: TpmStAttest::Quote.to_u16(),
            qualified_signer: signer().to_bytes(),
            extra_data: vec![0xee; 32],
            clock_info: TpmsClockInfo {
                clock: 1000,
                ..Default::default()
            },
            firmware_version: 7,
            attested: TpmuAttest::Quote(TpmsQuoteInfo {
                pcr_select: selection,
                pcr_digest,
            }),
        }
    }

    fn bank(values: &[(u32, u8)]) -> BTreeMap<String, Buffer> {
        values
            .iter()
            .map(|(pcr, v)| (pcr.to_string(), Buffer(vec![*v; 32])))
            .collect()
    }

    fn check(attest: &TpmsAttest, digests: Option<&PcrDigests>) -> Result<()> {
        verify_quote_fields(
            attest,
            digests,
            &[vec![0xee; 32]],
            &signer(),
            &Configuration::default(),
        )
    }

    #[test]
    fn pcr_digest_follows_selection_order() {
        let digests = PcrDigests::from([("11".to_string(), bank(&[(0, 1), (7, 2)]))]);
        let mut hasher = Sha256::new();
        hasher.update([1; 32]);
        hasher.update([2; 32]);
        let selection = TpmlPcrSelection::new(vec![TpmsPcrSelection::new(TpmAlgId::Sha256, &[0, 7])]);
        let quote = attest(selection, hasher.finalize().to_vec());
        check(&quote, Some(&digests)).unwrap();

        let reordered = PcrDigests::from([("11".to_string(), bank(&[(0, 2), (7, 1)]))]);
        assert!(check(&quote, Some(&reordered)).unwrap_err().is_quote());
    }

    #[test]
    fn empty_selection_skips_bank_checks() {
        let selection = TpmlPcrSelection::new(vec![TpmsPcrSelection {
            hash: TpmAlgId::Error.to_u16(),
            pcr_select: vec![],
        }]);
        let quote = attest(selection, Sha256::digest([]).to_vec());
        check(&quote, None).unwrap();
        let extra = PcrDigests::from([
            ("4".to_string(), bank(&[(0, 1)])),
            ("11".to_string(), bank(&[(0, 1)])),
        ]);
        check(&quote, Some(&extra)).unwrap();
    }

    #[test]
    fn bank_checks() {
        let selection = TpmlPcrSelection::new(vec![TpmsPcrSelection::new(TpmAlgId::Sha256, &[0, 1])]);
        let quote = attest(selection, vec![0; 32]);

        let none = check(&quote, None).unwrap_err();
        assert!(none.to_string().contains("number of PCR banks mismatch"));

        let wrong_bank = PcrDigests::from([("4".to_string(), bank(&[(0, 1), (1, 1)]))]);
        let err = check(&quote, Some(&wrong_bank)).unwrap_err();
        assert!(err.to_string().contains("missing in evidence"), "{err}");

        let short = PcrDigests::from([("11".to_string(), bank(&[(0, 1)]))]);
        let err = check(&quote, Some(&short)).unwrap_err();
        assert!(err.to_string().contains("wrong PCR set"), "{err}");

        let other_pcr = PcrDigests::from([("11".to_string(), bank(&[(0, 1), (2, 1)]))]);
        let err = check(&quote, Some(&other_pcr)).unwrap_err();
        assert!(err.to_string().contains("PCR 1 missing"), "{err}");
    }

    #[test]
    fn non_quote_is_rejected_after_signer() {
        let mut quote = attest(TpmlPcrSelection::default(), vec![]);
        quote.attest_type = TpmStAttest::Certify.to_u16();
        quote.attested = TpmuAttest::Other(vec![]);
        let err = check(&quote, None).unwrap_err();
        assert!(err.to_string().contains("not a quote"), "{err}");

        quote.qualified_signer[2] ^= 1;
        let err = check(&quote, None).unwrap_err();
        assert!(err.to_string().contains("wrong signer"), "{err}");
    }

    #[test]
    fn scalars_are_padded() {
        let pair = scalar_pair(&[1], &[0, 0, 2]).unwrap();
        assert_eq!(pair.len(), 64);
        assert_eq!(pair[31], 1);
        assert_eq!(pair[63], 2);
        assert!(scalar_pair(&[1; 33], &[1]).is_err());
    }

    #[test]
    fn pss_salt_is_recovered() {
        let mut rng = rand::rngs::OsRng;
        let key = rsa::RsaPrivateKey::new(&mut rng, 1024).unwrap();
        let public = key.to_public_key();
        let hash = Sha256::digest(b"quote");
        for salt in [0, 20, 32, 94] {
            let sig = key
                .sign_with_rng(&mut rng, Pss::new_with_salt::<Sha256>(salt), &hash)
                .unwrap();
            assert_eq!(pss_salt_len(&public, &sig), Some(salt));
        }
        assert_eq!(pss_salt_len(&public, &[0; 128]), None);
        assert_eq!(pss_salt_len(&public, &[1; 64]), None);
    }
}

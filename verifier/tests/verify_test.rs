// SPDX-FileCopyrightText: © 2025 Phala Network <dstack@phala.network>
//
// SPDX-License-Identifier: Apache-2.0

// Full pipeline runs with a genuine P-256 quote and a scripted log replayer
use std::collections::BTreeMap;

use anyhow::{bail, Result};
use p256::ecdsa::{signature::hazmat::PrehashSigner, Signature, SigningKey};
use sha2::{Digest, Sha256};
use tpm2::{
    qualified_name, tpm_rh, Marshal, Name, TpmAlgId, TpmEccCurve, TpmStAttest, TpmlPcrSelection,
    TpmsAttest, TpmsClockInfo, TpmsPcrSelection, TpmsQuoteInfo, TpmtPublic, TpmtSignature,
    TpmuAttest, TPM_GENERATED_VALUE,
};
use tpm_eventlog::tcg::{EV_EFI_VARIABLE_DRIVER_CONFIG, EV_SEPARATOR};
use tpm_eventlog::{
    efi::EFI_GLOBAL_VARIABLE, EventLogReplay, HashAlg, QuotedPcrs, RawEvent, TpmEvent,
    UefiVariableEvent, VariableData,
};
use tpm_types::{Buffer, Configuration, Evidence, FirmwareProperties, PcrBank};
use verifier::{verify, Error, VerifierConfig};

const CLOCK: u64 = 987_654;
const FIRMWARE_VERSION: u64 = 0x0007_0002_0000_0000;

fn pcr_bank() -> PcrBank {
    [(0u32, 0x10u8), (4, 0x40), (7, 0x70)]
        .into_iter()
        .map(|(pcr, v)| (pcr.to_string(), Buffer(vec![v; 32])))
        .collect()
}

struct Device {
    key: SigningKey,
    aik: TpmtPublic,
}

impl Device {
    fn new() -> Self {
        let key = SigningKey::random(&mut rand::rngs::OsRng);
        let point = key.verifying_key().to_encoded_point(false);
        let aik = TpmtPublic::ecc_attestation_key(
            TpmEccCurve::NistP256,
            point.x().expect("x").to_vec(),
            point.y().expect("y").to_vec(),
        );
        Self { key, aik }
    }

    fn config(&self, configuration: Configuration) -> VerifierConfig {
        VerifierConfig::new(configuration, &Name::Handle(tpm_rh::ENDORSEMENT), &self.aik)
            .expect("verifier config")
    }

    fn evidence(&self) -> Evidence {
        let firmware: FirmwareProperties =
            serde_json::from_value(serde_json::json!({ "Vendor": "INTC" })).expect("firmware");
        let pcrs = pcr_bank();
        let mut pcr_digest = Sha256::new();
        for value in pcrs.values() {
            pcr_digest.update(&value.0);
        }
        let signer = qualified_name(&Name::Handle(tpm_rh::ENDORSEMENT), &self.aik)
            .expect("qualified name");
        let attest = TpmsAttest {
            magic: TPM_GENERATED_VALUE,
            attest_type: TpmStAttest::Quote.to_u16(),
            qualified_signer: signer.to_bytes(),
            extra_data: firmware.evidence_hashes().expect("firmware hash")[0].clone(),
            clock_info: TpmsClockInfo {
                clock: CLOCK,
                ..Default::default()
            },
            firmware_version: FIRMWARE_VERSION,
            attested: TpmuAttest::Quote(TpmsQuoteInfo {
                pcr_select: TpmlPcrSelection::new(vec![TpmsPcrSelection::new(
                    TpmAlgId::Sha256,
                    &[0, 4, 7],
                )]),
                pcr_digest: pcr_digest.finalize().to_vec(),
            }),
        };
        let quote = attest.to_bytes().expect("encode quote");
        let signature: Signature = self
            .key
            .sign_prehash(&Sha256::digest(&quote))
            .expect("sign");
        let (r, s) = signature.split_bytes();
        let signature = TpmtSignature::EcDsa {
            hash_alg: TpmAlgId::Sha256,
            r: r.to_vec(),
            s: s.to_vec(),
        };
        Evidence {
            quote,
            signature: signature.to_bytes().expect("encode signature"),
            algorithm: "11".into(),
            pcrs,
            all_pcrs: BTreeMap::new(),
            firmware,
        }
    }
}

/// Replays nothing itself: checks it was handed the quoted PCRs and returns
/// prepared events
struct ScriptedReplay {
    events: Vec<TpmEvent>,
    fail: bool,
}

impl ScriptedReplay {
    fn returning(events: Vec<TpmEvent>) -> Self {
        Self {
            events,
            fail: false,
        }
    }

    fn check_pcrs(pcrs: &QuotedPcrs) -> Result<()> {
        let sha256 = &pcrs[&HashAlg::Sha256];
        if pcrs.len() != 1 || sha256.keys().copied().collect::<Vec<_>>() != [0, 4, 7] {
            bail!("unexpected PCR selection {pcrs:?}");
        }
        if sha256[&7] != vec![0x70; 32] {
            bail!("PCR 7 value not passed through");
        }
        Ok(())
    }
}

impl EventLogReplay for ScriptedReplay {
    fn replay(&self, log: &[u8], pcrs: &QuotedPcrs) -> Result<Vec<TpmEvent>> {
        if self.fail {
            bail!("PCR 0 does not match the log");
        }
        Self::check_pcrs(pcrs)?;
        if log != b"tcg log" {
            bail!("wrong log");
        }
        Ok(self.events.clone())
    }

    fn replay_ima(&self, events: Vec<TpmEvent>, pcrs: &QuotedPcrs) -> Result<Vec<TpmEvent>> {
        Self::check_pcrs(pcrs)?;
        Ok(events)
    }
}

fn secure_boot(enabled: u8) -> TpmEvent {
    let variable = VariableData {
        guid: EFI_GLOBAL_VARIABLE,
        name: "SecureBoot".into(),
        data: vec![enabled],
    };
    let raw = RawEvent::measured(
        7,
        EV_EFI_VARIABLE_DRIVER_CONFIG,
        HashAlg::Sha256,
        variable.encode(),
    );
    TpmEvent::UefiVariableDriverConfig(UefiVariableEvent { raw, variable })
}

fn separator(index: u32) -> TpmEvent {
    TpmEvent::Separator(RawEvent::measured(index, EV_SEPARATOR, HashAlg::Sha256, vec![0; 4]))
}

fn sized(data: &[u8]) -> Vec<u8> {
    let mut out = (data.len() as u32).to_le_bytes().to_vec();
    out.extend_from_slice(data);
    out
}

/// One `ima-ng` entry of `binary_runtime_measurements`
fn ima_entry(path: &str, file_digest: &[u8]) -> Vec<u8> {
    let mut digest_field = b"sha256:\0".to_vec();
    digest_field.extend_from_slice(file_digest);
    let mut data = sized(&digest_field);
    data.extend(sized(format!("{path}\0").as_bytes()));

    let mut entry = 10u32.to_le_bytes().to_vec();
    entry.extend_from_slice(&HashAlg::Sha1.digest(&[&data]));
    entry.extend(sized(b"ima-ng"));
    entry.extend(sized(&data));
    entry
}

#[test]
fn test_verify_reconstructs_boot() {
    tracing_subscriber::fmt::try_init().ok();

    let device = Device::new();
    let config = device.config(Configuration {
        last_clock: CLOCK - 1,
        last_firmware_version: 0,
    });
    let replayer = ScriptedReplay::returning(vec![secure_boot(1), separator(7), secure_boot(0)]);
    let mut ima_log = ima_entry("boot_aggregate", &[0xba; 32]);
    ima_log.extend(ima_entry("/usr/sbin/init", &[0x1e; 32]));

    let verification = verify(
        &device.evidence(),
        b"tcg log",
        Some(ima_log.as_slice()),
        &config,
        &replayer,
    )
    .expect("evidence should verify");

    assert_eq!(
        verification.configuration,
        Configuration {
            last_clock: CLOCK,
            last_firmware_version: FIRMWARE_VERSION,
        }
    );
    let boot = &verification.boot;
    assert!(!boot.is_empty);
    assert_eq!(boot.secure_boot.secure_boot, Some(1));
    assert!(boot.separators.is_past(7, HashAlg::Sha256));
    assert_eq!(
        boot.ima.boot_aggregate,
        tpm_boot::Hash::from_digest(&[0xba; 32]).expect("hash")
    );
    assert!(boot.ima.files.contains_key("/usr/sbin/init"));

    // equal counters are not a rollback
    let next = config.with_configuration(verification.configuration);
    verify(&device.evidence(), b"tcg log", None, &next, &replayer)
        .expect("second verification");
}

#[test]
fn test_rollback_rejected_before_replay() {
    let device = Device::new();
    let config = device.config(Configuration {
        last_clock: CLOCK + 1,
        last_firmware_version: 0,
    });
    let replayer = ScriptedReplay {
        events: vec![],
        fail: true,
    };
    let err = verify(&device.evidence(), b"tcg log", None, &config, &replayer)
        .expect_err("clock went backwards");
    let Error::Quote(err) = err else {
        panic!("expected quote error, got {err}");
    };
    assert!(err.is_quote());
    assert!(err.to_string().contains("clock was rolled back"));
}

#[test]
fn test_wrong_aik_rejected() {
    let device = Device::new();
    let other = Device::new();
    let err = verify(
        &device.evidence(),
        b"tcg log",
        None,
        &other.config(Configuration::default()),
        &ScriptedReplay::returning(vec![]),
    )
    .expect_err("signed by a different key");
    assert!(matches!(err, Error::Quote(ref e) if e.is_quote()), "{err}");
}

#[test]
fn test_corrupt_config_is_format_error() {
    let device = Device::new();
    let mut config = device.config(Configuration::default());
    config.aik.truncate(10);
    let err = verify(
        &device.evidence(),
        b"tcg log",
        None,
        &config,
        &ScriptedReplay::returning(vec![]),
    )
    .expect_err("aik cannot be decoded");
    assert!(matches!(err, Error::Quote(ref e) if e.is_format()), "{err}");
}

#[test]
fn test_replay_failure() {
    let device = Device::new();
    let replayer = ScriptedReplay {
        events: vec![],
        fail: true,
    };
    let err = verify(
        &device.evidence(),
        b"tcg log",
        None,
        &device.config(Configuration::default()),
        &replayer,
    )
    .expect_err("replay fails");
    assert!(matches!(err, Error::Replay(_)));
    assert!(err.to_string().contains("PCR 0 does not match the log"));

    let err = verify(
        &device.evidence(),
        b"tcg log",
        Some(&b"\x0a\x00"[..]),
        &device.config(Configuration::default()),
        &ScriptedReplay::returning(vec![]),
    )
    .expect_err("truncated IMA log");
    assert!(matches!(err, Error::Replay(_)));
}

#[test]
fn test_manipulated_event_rejected() {
    let device = Device::new();
    let TpmEvent::UefiVariableDriverConfig(mut forged) = secure_boot(1) else {
        unreachable!()
    };
    forged.variable.data = vec![0];
    forged.raw.data = forged.variable.encode();

    let err = verify(
        &device.evidence(),
        b"tcg log",
        None,
        &device.config(Configuration::default()),
        &ScriptedReplay::returning(vec![TpmEvent::UefiVariableDriverConfig(forged)]),
    )
    .expect_err("payload does not match digest");
    assert!(matches!(
        err,
        Error::Boot(tpm_boot::Error::Payload { index: 7, .. })
    ));
}

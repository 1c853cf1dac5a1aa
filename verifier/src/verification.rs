// SPDX-FileCopyrightText: © 2024-2025 Phala Network <dstack@phala.network>
//
// SPDX-License-Identifier: Apache-2.0

use std::collections::BTreeMap;

use anyhow::anyhow;
use tpm_boot::Boot;
use tpm_eventlog::{parse_ima_log, EventLogReplay, HashAlg, QuotedPcrs, TpmEvent};
use tpm_qvl::VerifiedQuote;
use tpm_types::{Configuration, Evidence};
use tracing::{debug, info};

use crate::{Error, VerifierConfig};

/// Accepted evidence
#[derive(Debug, Clone)]
pub struct Verification {
    pub quote: VerifiedQuote,
    /// Freshness state to verify the device's next quote against
    pub configuration: Configuration,
    pub boot: Boot,
}

fn format_error(err: anyhow::Error) -> Error {
    Error::Quote(tpm_qvl::Error::Format(err))
}

/// Submitted PCR values by bank, in the shape the log replayer expects.
///
/// Only the SHA-1 (`"4"`) and SHA-256 (`"11"`) banks can be replayed.
pub fn quoted_pcrs(evidence: &Evidence) -> Result<QuotedPcrs, Error> {
    let digests = evidence
        .digest_map()
        .map_err(|e| format_error(e.context("failed to select algorithm")))?;
    let mut pcrs = QuotedPcrs::new();
    for (bank, values) in digests.into_iter().flatten() {
        let alg = match bank.as_str() {
            "4" => HashAlg::Sha1,
            "11" => HashAlg::Sha256,
            _ => return Err(Error::UnknownBank(bank)),
        };
        let mut bank_values = BTreeMap::new();
        for (index, value) in values {
            let index: u32 = index
                .parse()
                .map_err(|_| format_error(anyhow!("invalid PCR index {index:?} in bank {bank}")))?;
            bank_values.insert(index, value.0);
        }
        pcrs.insert(alg, bank_values);
    }
    Ok(pcrs)
}

/// Verify `evidence` and reconstruct the boot chain from its event logs.
///
/// `event_log` is the TCG firmware log and `ima_log` the optional IMA
/// `binary_runtime_measurements`. Both are replayed by `replayer` against
/// the PCR values the quote covers; IMA events are consumed after the
/// firmware events.
pub fn verify(
    evidence: &Evidence,
    event_log: &[u8],
    ima_log: Option<&[u8]>,
    config: &VerifierConfig,
    replayer: &dyn EventLogReplay,
) -> Result<Verification, Error> {
    let root_qn = config.root_qn().map_err(format_error)?;
    let aik = config.aik().map_err(format_error)?;
    let quote = tpm_qvl::validate(evidence, &config.configuration, &root_qn, &aik)?;

    let pcrs = quoted_pcrs(evidence)?;
    let events = replayer.replay(event_log, &pcrs).map_err(Error::Replay)?;
    debug!(events = events.len(), "event log replayed");
    let ima_events: Vec<TpmEvent> = match ima_log {
        Some(log) => {
            let parsed = parse_ima_log(log)
                .map_err(|e| Error::Replay(e.context("failed to parse IMA log")))?;
            replayer.replay_ima(parsed, &pcrs).map_err(Error::Replay)?
        }
        None => vec![],
    };
    debug!(events = ima_events.len(), "IMA log replayed");

    let boot = Boot::from_events(events.iter().chain(&ima_events))?;
    let configuration = quote.next_configuration(&config.configuration);
    info!(
        clock = quote.clock(),
        firmware_version = quote.firmware_version(),
        "evidence verified"
    );
    Ok(Verification {
        quote,
        configuration,
        boot,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tpm_types::{Buffer, FirmwareProperties, PcrBank};

    fn evidence(all_pcrs: Vec<(&str, PcrBank)>) -> Evidence {
        Evidence {
            quote: vec![],
            signature: vec![],
            algorithm: "11".into(),
            pcrs: PcrBank::new(),
            all_pcrs: all_pcrs
                .into_iter()
                .map(|(bank, values)| (bank.to_string(), Some(values)))
                .collect(),
            firmware: FirmwareProperties::default(),
        }
    }

    fn bank(entries: &[(&str, u8)]) -> PcrBank {
        entries
            .iter()
            .map(|(pcr, v)| (pcr.to_string(), Buffer(vec![*v; 32])))
            .collect()
    }

    #[test]
    fn selects_replayable_banks() {
        let ev = evidence(vec![("4", bank(&[("0", 1)])), ("11", bank(&[("0", 2), ("7", 3)]))]);
        let pcrs = quoted_pcrs(&ev).unwrap();
        assert_eq!(pcrs.len(), 2);
        assert_eq!(pcrs[&HashAlg::Sha256][&7], vec![3; 32]);
        assert_eq!(pcrs[&HashAlg::Sha1][&0], vec![1; 32]);
    }

    #[test]
    fn rejects_unknown_banks() {
        let ev = evidence(vec![("12", bank(&[("0", 1)]))]);
        assert!(matches!(quoted_pcrs(&ev), Err(Error::UnknownBank(bank)) if bank == "12"));

        let ev = evidence(vec![("11", bank(&[("zero", 1)]))]);
        assert!(matches!(
            quoted_pcrs(&ev),
            Err(Error::Quote(tpm_qvl::Error::Format(_)))
        ));
    }

    #[test]
    fn no_pcrs_quoted() {
        assert!(quoted_pcrs(&evidence(vec![])).unwrap().is_empty());
    }
}

// SPDX-FileCopyrightText: © 2024-2025 Phala Network <dstack@phala.network>
//
// SPDX-License-Identifier: Apache-2.0

//! Device evidence verification
//!
//! Runs the whole pipeline for one piece of evidence: the quote is checked
//! against the enrolled attestation key, the firmware and IMA event logs are
//! replayed against the quoted PCR values, and the replayed events are folded
//! into a [`tpm_boot::Boot`] snapshot for the policy layer.

mod config;
mod verification;

pub use config::VerifierConfig;
pub use verification::{quoted_pcrs, verify, Verification};

/// Why evidence was not accepted
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error(transparent)]
    Quote(#[from] tpm_qvl::Error),
    #[error(transparent)]
    Boot(#[from] tpm_boot::Error),
    /// The event log could not be replayed against the quoted PCRs
    #[error("event log replay failed: {0:#}")]
    Replay(anyhow::Error),
    /// A PCR bank with no event log replay support
    #[error("unknown pcr bank {0}")]
    UnknownBank(String),
}

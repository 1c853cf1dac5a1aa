// SPDX-FileCopyrightText: © 2025 Phala Network <dstack@phala.network>
//
// SPDX-License-Identifier: BUSL-1.1

//! TPM Quote Verification Library (QVL)
//!
//! Checks a quote submitted as [`tpm_types::Evidence`] against the attestation
//! key enrolled for the device:
//!
//! 1. The AIK public area is decoded and its qualified name under the
//!    enrolled root is computed.
//! 2. The quote fields are checked against the submitted PCR values and
//!    firmware properties (`verify_evidence_data`).
//! 3. The quote signature is checked with the AIK (`verify_quote_signature`).
//!
//! The first failing check aborts verification.

pub use key::AikKey;
pub use verify::{
    validate, verify_evidence_data, verify_quote_fields, verify_quote_signature, VerifiedQuote,
};

mod key;
mod verify;

/// Why a quote was rejected
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Input could not be decoded; may be a client/server version mismatch
    #[error("format invalid: {0:#}")]
    Format(anyhow::Error),
    /// Well-formed input that failed an authenticity, binding or freshness check
    #[error("quote invalid: {0:#}")]
    Quote(anyhow::Error),
}

impl Error {
    pub fn is_format(&self) -> bool {
        matches!(self, Error::Format(_))
    }

    pub fn is_quote(&self) -> bool {
        matches!(self, Error::Quote(_))
    }
}

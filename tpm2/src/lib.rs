// SPDX-FileCopyrightText: © 2025 Phala Network <dstack@phala.network>
//
// SPDX-License-Identifier: Apache-2.0

//! Pure Rust TPM 2.0 wire structures
//!
//! This crate decodes and re-encodes the TPM 2.0 structures a remote verifier
//! receives from a device, without any TPM device or C library.
//!
//! ## Supported Structures
//!
//! - `TPMS_ATTEST` (quotes decoded, other attestation types kept opaque)
//! - `TPMT_PUBLIC` for RSA, ECC, keyed-hash and symmetric objects
//! - `TPMT_SIGNATURE` for ECDSA, RSA-PSS and RSASSA
//! - Object names and qualified names
//!
//! ## Example
//!
//! ```
//! use tpm2::{qualified_name, tpm_rh, Name, TpmEccCurve, TpmtPublic};
//!
//! let aik = TpmtPublic::ecc_attestation_key(TpmEccCurve::NistP256, vec![1; 32], vec![2; 32]);
//! let qn = qualified_name(&Name::Handle(tpm_rh::ENDORSEMENT), &aik)?;
//! assert_eq!(qn.to_bytes().len(), 34);
//! # Ok::<(), anyhow::Error>(())
//! ```

mod constants;
mod marshal;
mod name;
mod types;

pub use constants::*;
pub use marshal::{Marshal, Unmarshal, WireBuffer, WireCursor};
pub use name::{qualified_name, Name};
pub use types::*;

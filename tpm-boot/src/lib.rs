// SPDX-FileCopyrightText: © 2025 Phala Network <dstack@phala.network>
//
// SPDX-License-Identifier: Apache-2.0

//! Boot-chain reconstruction
//!
//! [`Boot`] folds replayed TCG events into a snapshot of what the platform
//! booted: firmware, CSME state, Secure Boot variables, boot loader
//! artifacts and IMA measurements. Events are interpreted only in the PCR
//! and separator phase they are meaningful in, and every payload the
//! snapshot takes a value from is checked against its logged digest.

pub use boot::{
    Boot, BootloaderState, CsmeState, ExitBootServices, FirmwareState, ImaState, SecureBootState,
};
pub use error::Error;
pub use hash::Hash;
pub use separator::{BankPhases, Phase, Separators, SEPARATED_PCRS};

mod boot;
mod consume;
mod error;
mod hash;
mod separator;

// SPDX-FileCopyrightText: © 2025 Phala Network <dstack@phala.network>
//
// SPDX-License-Identifier: Apache-2.0

use serde::Serialize;
use tpm_eventlog::HashAlg;

/// PCRs 0 to 7 are closed by a separator before the OS loader runs
pub const SEPARATED_PCRS: usize = 8;

/// Whether firmware (pre) or the OS loader (post) extends a PCR
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    #[default]
    PreSeparator,
    PostSeparator,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct BankPhases {
    pub sha1: Phase,
    pub sha256: Phase,
}

/// Phase of every separated PCR, per bank. A recorded separator is never
/// undone.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(transparent)]
pub struct Separators([BankPhases; SEPARATED_PCRS]);

impl Separators {
    fn slot(&mut self, index: u32, alg: HashAlg) -> Option<&mut Phase> {
        let phases = self.0.get_mut(usize::try_from(index).ok()?)?;
        match alg {
            HashAlg::Sha1 => Some(&mut phases.sha1),
            HashAlg::Sha256 => Some(&mut phases.sha256),
            HashAlg::Sha384 => None,
        }
    }

    /// Phase of `index` in the `alg` bank.
    ///
    /// PCRs above 7 and banks without separator tracking are always
    /// [`Phase::PreSeparator`].
    pub fn phase(&self, index: u32, alg: HashAlg) -> Phase {
        let Some(phases) = usize::try_from(index).ok().and_then(|i| self.0.get(i)) else {
            return Phase::PreSeparator;
        };
        match alg {
            HashAlg::Sha1 => phases.sha1,
            HashAlg::Sha256 => phases.sha256,
            HashAlg::Sha384 => Phase::PreSeparator,
        }
    }

    pub fn is_past(&self, index: u32, alg: HashAlg) -> bool {
        self.phase(index, alg) == Phase::PostSeparator
    }

    /// Move `index` in the `alg` bank past its separator. Returns whether
    /// the phase changed.
    pub fn record(&mut self, index: u32, alg: HashAlg) -> bool {
        match self.slot(index, alg) {
            Some(phase) if *phase == Phase::PreSeparator => {
                *phase = Phase::PostSeparator;
                true
            }
            _ => false,
        }
    }
}

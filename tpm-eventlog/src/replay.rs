// SPDX-FileCopyrightText: © 2025 Phala Network <dstack@phala.network>
//
// SPDX-License-Identifier: Apache-2.0

use std::collections::BTreeMap;

use anyhow::Result;

use crate::event::TpmEvent;
use crate::tcg::HashAlg;

/// Quoted PCR values: bank to PCR index to value
pub type QuotedPcrs = BTreeMap<HashAlg, BTreeMap<u32, Vec<u8>>>;

/// Hash-chain replay of event logs against quoted PCR values.
///
/// Implementations must only return events whose extends reproduce the
/// quoted values, in log order.
pub trait EventLogReplay {
    /// Replay a TCG firmware event log and return its typed events
    fn replay(&self, log: &[u8], pcrs: &QuotedPcrs) -> Result<Vec<TpmEvent>>;

    /// Replay IMA events and return the prefix that matches the quoted PCR
    fn replay_ima(&self, events: Vec<TpmEvent>, pcrs: &QuotedPcrs) -> Result<Vec<TpmEvent>>;
}

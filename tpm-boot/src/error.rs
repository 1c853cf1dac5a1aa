// SPDX-FileCopyrightText: © 2025 Phala Network <dstack@phala.network>
//
// SPDX-License-Identifier: Apache-2.0

use tpm_eventlog::RawEvent;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The logged digest does not match the event's own payload
    #[error("event payload manipulated: event {event} in PCR {index}")]
    Payload {
        index: u32,
        /// Sequence number of the event in its log
        event: u32,
    },
    /// A digest whose length matches no supported PCR bank
    #[error("unknown pcr bank for a {0} byte digest")]
    UnknownBank(usize),
}

impl Error {
    pub(crate) fn payload(raw: &RawEvent) -> Self {
        Error::Payload {
            index: raw.index,
            event: raw.sequence,
        }
    }
}

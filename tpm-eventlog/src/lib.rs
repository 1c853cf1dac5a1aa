// SPDX-FileCopyrightText: © 2024 Phala Network <dstack@phala.network>
//
// SPDX-License-Identifier: Apache-2.0

//! Typed boot events
//!
//! The types in this crate describe a TCG event log after it was replayed
//! against the quoted PCRs: every entry carries its PCR index, bank, logged
//! digest and payload, classified into a closed set of [`TpmEvent`] variants.
//! Payload decoders for the UEFI and Intel CSME structures that the boot
//! reconstructor interprets live here too.

pub use csme::{CsmeEvent, CsmePayload, CsmeRecord, MeasurementBlock, NonHostInfoEvent};
pub use efi::{
    device_path_to_string, parse_efi_signature_list, Certificate, EfiGuid, Partition,
    PartitionTableHeader, VariableData,
};
pub use event::{
    FirmwareBlobEvent, GptEvent, ImageLoadEvent, MessageEvent, TpmEvent, UefiVariableEvent,
};
pub use ima::{parse_ima_log, ImaNgEvent};
pub use replay::{EventLogReplay, QuotedPcrs};
pub use tcg::{HashAlg, RawEvent};

pub mod csme;
pub mod efi;
mod event;
mod ima;
mod replay;
pub mod tcg;

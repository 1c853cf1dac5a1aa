// SPDX-FileCopyrightText: © 2025 Phala Network <dstack@phala.network>
//
// SPDX-License-Identifier: Apache-2.0

use anyhow::{Context, Result};

use crate::csme::{CsmeEvent, NonHostInfoEvent};
use crate::efi::{self, FirmwareBlob, ImageLoad, Partition, PartitionTableHeader, VariableData};
use crate::ima::ImaNgEvent;
use crate::tcg::*;

/// Event whose payload is free-form text
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageEvent {
    pub raw: RawEvent,
    /// Payload as logged, including any trailing NULs
    pub message: String,
}

impl MessageEvent {
    pub fn new(raw: RawEvent) -> Self {
        let message = String::from_utf8_lossy(&raw.data).into_owned();
        Self { raw, message }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UefiVariableEvent {
    pub raw: RawEvent,
    pub variable: VariableData,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageLoadEvent {
    pub raw: RawEvent,
    pub image: ImageLoad,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GptEvent {
    pub raw: RawEvent,
    pub header: PartitionTableHeader,
    pub partitions: Vec<Partition>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FirmwareBlobEvent {
    pub raw: RawEvent,
    pub blob: FirmwareBlob,
}

/// A replayed event log entry, classified by its event type
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TpmEvent {
    NoAction(RawEvent),
    Separator(RawEvent),
    PostCode(RawEvent),
    CrtmContents(MessageEvent),
    CrtmVersion(RawEvent),
    CompactHash(RawEvent),
    Ipl(MessageEvent),
    Action(MessageEvent),
    NonHostInfo(NonHostInfoEvent),
    /// Sub-event of a CSME measurement block
    Csme(CsmeEvent),
    UefiVariableDriverConfig(UefiVariableEvent),
    UefiBootVariable(UefiVariableEvent),
    UefiVariableAuthority(UefiVariableEvent),
    UefiBootServicesApplication(ImageLoadEvent),
    UefiBootServicesDriver(ImageLoadEvent),
    UefiRuntimeServicesDriver(ImageLoadEvent),
    UefiGpt(GptEvent),
    UefiAction(MessageEvent),
    UefiPlatformFirmwareBlob(FirmwareBlobEvent),
    ImaNg(ImaNgEvent),
    Other(RawEvent),
}

impl TpmEvent {
    /// Classify `raw` by its event type and decode the payload.
    ///
    /// Unknown event types become [`TpmEvent::Other`]; a known type whose
    /// payload does not decode is an error.
    pub fn from_raw(raw: RawEvent) -> Result<Self> {
        let kind = raw.event_type;
        let event = match kind {
            EV_NO_ACTION => TpmEvent::NoAction(raw),
            EV_SEPARATOR => TpmEvent::Separator(raw),
            EV_POST_CODE => TpmEvent::PostCode(raw),
            EV_S_CRTM_CONTENTS => TpmEvent::CrtmContents(MessageEvent::new(raw)),
            EV_S_CRTM_VERSION => TpmEvent::CrtmVersion(raw),
            EV_COMPACT_HASH => TpmEvent::CompactHash(raw),
            EV_IPL => TpmEvent::Ipl(MessageEvent::new(raw)),
            EV_ACTION => TpmEvent::Action(MessageEvent::new(raw)),
            EV_NONHOST_INFO => TpmEvent::NonHostInfo(NonHostInfoEvent::decode(raw)),
            EV_EFI_VARIABLE_DRIVER_CONFIG => {
                TpmEvent::UefiVariableDriverConfig(variable_event(raw)?)
            }
            EV_EFI_VARIABLE_BOOT | EV_EFI_VARIABLE_BOOT2 => {
                TpmEvent::UefiBootVariable(variable_event(raw)?)
            }
            EV_EFI_VARIABLE_AUTHORITY => TpmEvent::UefiVariableAuthority(variable_event(raw)?),
            EV_EFI_BOOT_SERVICES_APPLICATION => {
                TpmEvent::UefiBootServicesApplication(image_event(raw)?)
            }
            EV_EFI_BOOT_SERVICES_DRIVER => TpmEvent::UefiBootServicesDriver(image_event(raw)?),
            EV_EFI_RUNTIME_SERVICES_DRIVER => {
                TpmEvent::UefiRuntimeServicesDriver(image_event(raw)?)
            }
            EV_EFI_GPT_EVENT | EV_EFI_GPT_EVENT2 => {
                let (header, partitions) = efi::decode_gpt(&raw.data)
                    .with_context(|| format!("event {}: bad GPT payload", raw.sequence))?;
                TpmEvent::UefiGpt(GptEvent {
                    raw,
                    header,
                    partitions,
                })
            }
            EV_EFI_ACTION => TpmEvent::UefiAction(MessageEvent::new(raw)),
            EV_EFI_PLATFORM_FIRMWARE_BLOB | EV_EFI_PLATFORM_FIRMWARE_BLOB2 => {
                let blob = if kind == EV_EFI_PLATFORM_FIRMWARE_BLOB {
                    FirmwareBlob::decode(&raw.data)
                } else {
                    FirmwareBlob::decode_v2(&raw.data)
                }
                .with_context(|| format!("event {}: bad firmware blob", raw.sequence))?;
                TpmEvent::UefiPlatformFirmwareBlob(FirmwareBlobEvent { raw, blob })
            }
            _ => TpmEvent::Other(raw),
        };
        Ok(event)
    }

    pub fn raw(&self) -> &RawEvent {
        match self {
            TpmEvent::NoAction(raw)
            | TpmEvent::Separator(raw)
            | TpmEvent::PostCode(raw)
            | TpmEvent::CrtmVersion(raw)
            | TpmEvent::CompactHash(raw)
            | TpmEvent::Other(raw) => raw,
            TpmEvent::CrtmContents(ev)
            | TpmEvent::Ipl(ev)
            | TpmEvent::Action(ev)
            | TpmEvent::UefiAction(ev) => &ev.raw,
            TpmEvent::NonHostInfo(ev) => &ev.raw,
            TpmEvent::Csme(ev) => &ev.raw,
            TpmEvent::UefiVariableDriverConfig(ev)
            | TpmEvent::UefiBootVariable(ev)
            | TpmEvent::UefiVariableAuthority(ev) => &ev.raw,
            TpmEvent::UefiBootServicesApplication(ev)
            | TpmEvent::UefiBootServicesDriver(ev)
            | TpmEvent::UefiRuntimeServicesDriver(ev) => &ev.raw,
            TpmEvent::UefiGpt(ev) => &ev.raw,
            TpmEvent::UefiPlatformFirmwareBlob(ev) => &ev.raw,
            TpmEvent::ImaNg(ev) => &ev.raw,
        }
    }
}

fn variable_event(raw: RawEvent) -> Result<UefiVariableEvent> {
    let variable = VariableData::decode(&raw.data)
        .with_context(|| format!("event {}: bad UEFI variable", raw.sequence))?;
    Ok(UefiVariableEvent { raw, variable })
}

fn image_event(raw: RawEvent) -> Result<ImageLoadEvent> {
    let image = ImageLoad::decode(&raw.data)
        .with_context(|| format!("event {}: bad image load event", raw.sequence))?;
    Ok(ImageLoadEvent { raw, image })
}

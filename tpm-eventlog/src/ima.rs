// SPDX-FileCopyrightText: © 2025 Phala Network <dstack@phala.network>
//
// SPDX-License-Identifier: Apache-2.0

//! Linux IMA binary runtime measurement log

use anyhow::{bail, Context, Result};
use nom::{
    bytes::complete::{take, take_until},
    number::complete::le_u32,
    IResult,
};
use serde::Serialize;
use serde_human_bytes as hex_bytes;

use crate::efi::finish;
use crate::event::TpmEvent;
use crate::tcg::{HashAlg, RawEvent, IMA_MEASUREMENT_EVENT};

/// Entry of an `ima-ng`, `ima-sig` or `ima-buf` template.
///
/// `raw.data` is the template data and `raw.digest` the SHA-1 template hash
/// extended into the PCR.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ImaNgEvent {
    pub raw: RawEvent,
    pub template: String,
    pub file_digest_alg: String,
    #[serde(with = "hex_bytes")]
    pub file_digest: Vec<u8>,
    pub path: String,
    #[serde(with = "hex_bytes")]
    pub signature: Vec<u8>,
}

fn sized(input: &[u8]) -> IResult<&[u8], &[u8]> {
    let (input, len) = le_u32(input)?;
    take(len)(input)
}

fn digest_ng(input: &[u8]) -> IResult<&[u8], (&[u8], &[u8])> {
    let (rest, field) = sized(input)?;
    let (digest, alg) = take_until(&b"\0"[..])(field)?;
    Ok((rest, (alg, &digest[1..])))
}

fn trim_nul(bytes: &[u8]) -> String {
    let end = bytes.iter().rposition(|&b| b != 0).map_or(0, |p| p + 1);
    String::from_utf8_lossy(&bytes[..end]).into_owned()
}

impl ImaNgEvent {
    pub fn decode(raw: RawEvent, template: &str) -> Result<Self> {
        let (rest, (alg, file_digest)) = finish("IMA d-ng field", digest_ng(&raw.data))?;
        let (rest, path) = finish("IMA n-ng field", sized(rest))?;
        let signature = if template == "ima-sig" {
            finish("IMA sig field", sized(rest))?.1.to_vec()
        } else {
            vec![]
        };
        Ok(Self {
            template: template.to_string(),
            file_digest_alg: trim_nul(alg).trim_end_matches(':').to_string(),
            file_digest: file_digest.to_vec(),
            path: trim_nul(path),
            signature,
            raw,
        })
    }
}

fn ima_entry(input: &[u8]) -> IResult<&[u8], (u32, &[u8], &[u8])> {
    let (input, pcr) = le_u32(input)?;
    let (input, digest) = take(20usize)(input)?;
    let (input, name) = sized(input)?;
    Ok((input, (pcr, digest, name)))
}

/// Parse `binary_runtime_measurements`.
///
/// The legacy `ima` template has no length prefix and cannot be walked, so
/// it fails the whole log. Templates other than the `-ng` family are kept as
/// [`TpmEvent::Other`].
pub fn parse_ima_log(mut input: &[u8]) -> Result<Vec<TpmEvent>> {
    let mut events = vec![];
    let mut sequence = 0u32;
    while !input.is_empty() {
        let (rest, (pcr, digest, name)) = finish("IMA entry", ima_entry(input))?;
        let name = std::str::from_utf8(name).context("IMA template name is not UTF-8")?;
        if name == "ima" {
            bail!("legacy ima template is not supported");
        }
        let (rest, data) = finish("IMA template data", sized(rest))?;
        input = rest;

        let raw = RawEvent {
            sequence,
            index: pcr,
            event_type: IMA_MEASUREMENT_EVENT,
            alg: HashAlg::Sha1,
            digest: digest.to_vec(),
            data: data.to_vec(),
        };
        sequence += 1;
        let event = match name {
            "ima-ng" | "ima-sig" | "ima-buf" => TpmEvent::ImaNg(
                ImaNgEvent::decode(raw, name)
                    .with_context(|| format!("IMA entry {}", sequence - 1))?,
            ),
            _ => TpmEvent::Other(raw),
        };
        events.push(event);
    }
    Ok(events)
}

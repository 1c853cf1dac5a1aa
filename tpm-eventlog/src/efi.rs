// SPDX-FileCopyrightText: © 2025 Phala Network <dstack@phala.network>
//
// SPDX-License-Identifier: Apache-2.0

//! UEFI structures carried in boot event payloads

use std::fmt;

use anyhow::{anyhow, bail, Context, Result};
use nom::{
    bytes::complete::take,
    number::complete::{le_u16, le_u32, le_u64, le_u8},
    sequence::tuple,
    IResult,
};
use serde::{Serialize, Serializer};
use serde_human_bytes as hex_bytes;
use sha2::{Digest, Sha256};
use x509_parser::prelude::{FromDer, X509Certificate};

/// Upper bound for a single EFI signature list
const MAX_SIGNATURE_LIST_SIZE: usize = 1024 * 1024;
const SIGNATURE_LIST_HEADER_SIZE: usize = 28;
const GPT_HEADER_SIZE: usize = 92;

/// EFI_GUID in its mixed-endian wire layout
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct EfiGuid {
    pub data1: u32,
    pub data2: u16,
    pub data3: u16,
    pub data4: [u8; 8],
}

impl EfiGuid {
    pub const fn new(data1: u32, data2: u16, data3: u16, data4: [u8; 8]) -> Self {
        Self {
            data1,
            data2,
            data3,
            data4,
        }
    }

    pub fn from_le_bytes(bytes: [u8; 16]) -> Self {
        let mut data4 = [0u8; 8];
        data4.copy_from_slice(&bytes[8..]);
        Self {
            data1: u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]),
            data2: u16::from_le_bytes([bytes[4], bytes[5]]),
            data3: u16::from_le_bytes([bytes[6], bytes[7]]),
            data4,
        }
    }

    pub fn to_le_bytes(&self) -> [u8; 16] {
        let mut out = [0u8; 16];
        out[..4].copy_from_slice(&self.data1.to_le_bytes());
        out[4..6].copy_from_slice(&self.data2.to_le_bytes());
        out[6..8].copy_from_slice(&self.data3.to_le_bytes());
        out[8..].copy_from_slice(&self.data4);
        out
    }
}

impl fmt::Display for EfiGuid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let d = &self.data4;
        write!(
            f,
            "{:08x}-{:04x}-{:04x}-{:02x}{:02x}-{:02x}{:02x}{:02x}{:02x}{:02x}{:02x}",
            self.data1, self.data2, self.data3, d[0], d[1], d[2], d[3], d[4], d[5], d[6], d[7]
        )
    }
}

impl fmt::Debug for EfiGuid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

impl Serialize for EfiGuid {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

pub const EFI_GLOBAL_VARIABLE: EfiGuid = EfiGuid::new(
    0x8be4df61,
    0x93ca,
    0x11d2,
    [0xaa, 0x0d, 0x00, 0xe0, 0x98, 0x03, 0x2b, 0x8c],
);
pub const EFI_IMAGE_SECURITY_DATABASE: EfiGuid = EfiGuid::new(
    0xd719b2cb,
    0x3d3a,
    0x4596,
    [0xa3, 0xbc, 0xda, 0xd0, 0x0e, 0x67, 0x65, 0x6f],
);
pub const EFI_CERT_X509: EfiGuid = EfiGuid::new(
    0xa5c059a1,
    0x94e4,
    0x4aa7,
    [0x87, 0xb5, 0xab, 0x15, 0x5c, 0x2b, 0xf0, 0x72],
);
pub const EFI_CERT_SHA256: EfiGuid = EfiGuid::new(
    0xc1c41626,
    0x504c,
    0x4092,
    [0xac, 0xa9, 0x41, 0xf9, 0x36, 0x93, 0x43, 0x28],
);
/// Vendor GUID of the `LenovoSecurityConfig` variable
pub const LENOVO_SECURITY_CONFIG: EfiGuid = EfiGuid::new(
    0xa2c1808f,
    0x0d4f,
    0x4cc9,
    [0xa6, 0x19, 0xd1, 0xe6, 0x41, 0xd3, 0x9d, 0x49],
);
/// Vendor GUID of the Intel reference `Setup` variable
pub const SETUP_VARIABLE: EfiGuid = EfiGuid::new(
    0xec87d643,
    0xeba4,
    0x4bb5,
    [0xa1, 0xe5, 0x3f, 0x3e, 0x36, 0xb2, 0x0d, 0xa9],
);

pub(crate) fn parse_guid(input: &[u8]) -> IResult<&[u8], EfiGuid> {
    let (input, bytes) = take(16usize)(input)?;
    let mut raw = [0u8; 16];
    raw.copy_from_slice(bytes);
    Ok((input, EfiGuid::from_le_bytes(raw)))
}

/// Run a nom parser to completion, turning its error into an owned one
pub(crate) fn finish<'a, T>(what: &str, result: IResult<&'a [u8], T>) -> Result<(&'a [u8], T)> {
    result.map_err(|e| anyhow!("failed to parse {what}: {e:?}"))
}

pub(crate) fn utf16_string(bytes: &[u8]) -> String {
    let units: Vec<u16> = bytes
        .chunks_exact(2)
        .map(|c| u16::from_le_bytes([c[0], c[1]]))
        .take_while(|&u| u != 0)
        .collect();
    String::from_utf16_lossy(&units)
}

/// The parts of an X.509 certificate the policy engine looks at
#[derive(Clone, PartialEq, Eq, Serialize)]
pub struct Certificate {
    #[serde(with = "hex_bytes")]
    pub der: Vec<u8>,
    pub subject: String,
    pub issuer: String,
    pub serial: String,
    /// SHA-256 of the DER encoded TBSCertificate
    #[serde(with = "hex_bytes")]
    pub tbs_fingerprint: Vec<u8>,
}

impl Certificate {
    pub fn from_der(der: &[u8]) -> Result<Self> {
        let (rest, cert) =
            X509Certificate::from_der(der).map_err(|e| anyhow!("invalid certificate: {e}"))?;
        if !rest.is_empty() {
            bail!("trailing data after certificate");
        }
        Ok(Self {
            der: der.to_vec(),
            subject: cert.subject().to_string(),
            issuer: cert.issuer().to_string(),
            serial: cert.raw_serial_as_string(),
            tbs_fingerprint: Sha256::digest(cert.tbs_certificate.as_ref()).to_vec(),
        })
    }
}

impl fmt::Debug for Certificate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Certificate")
            .field("subject", &self.subject)
            .field("issuer", &self.issuer)
            .field("serial", &self.serial)
            .field("tbs_fingerprint", &hex::encode(&self.tbs_fingerprint))
            .finish()
    }
}

struct SignatureList<'a> {
    signature_type: EfiGuid,
    signature_size: usize,
    entries: &'a [u8],
}

fn parse_signature_list(input: &[u8]) -> IResult<&[u8], (EfiGuid, u32, u32, u32)> {
    tuple((parse_guid, le_u32, le_u32, le_u32))(input)
}

fn split_signature_list(input: &[u8]) -> Result<(&[u8], SignatureList<'_>)> {
    let (rest, (signature_type, list_size, header_size, signature_size)) =
        finish("signature list header", parse_signature_list(input))?;
    let list_size = list_size as usize;
    let header_size = header_size as usize;
    let signature_size = signature_size as usize;
    if list_size > MAX_SIGNATURE_LIST_SIZE {
        bail!("signature list of {list_size} bytes is too large");
    }
    if signature_size < 16 {
        bail!("signature size {signature_size} is smaller than the owner GUID");
    }
    let body = list_size
        .checked_sub(SIGNATURE_LIST_HEADER_SIZE)
        .and_then(|n| n.checked_sub(header_size))
        .context("signature list size smaller than its headers")?;
    if body % signature_size != 0 {
        bail!("signature list body is not a multiple of the signature size");
    }
    let (rest, _header) = finish("signature header", take(header_size)(rest))?;
    let (rest, entries) = finish("signature entries", take(body)(rest))?;
    Ok((
        rest,
        SignatureList {
            signature_type,
            signature_size,
            entries,
        },
    ))
}

/// Parse an EFI_SIGNATURE_LIST sequence (the payload of `PK`, `KEK`, `db`
/// and `dbx`) into X.509 certificates and SHA-256 hashes.
///
/// Payloads shorter than one list header are treated as empty variables.
pub fn parse_efi_signature_list(data: &[u8]) -> Result<(Vec<Certificate>, Vec<Vec<u8>>)> {
    let mut certificates = vec![];
    let mut hashes = vec![];
    if data.len() < SIGNATURE_LIST_HEADER_SIZE {
        return Ok((certificates, hashes));
    }
    let mut input = data;
    while !input.is_empty() {
        let (rest, list) = split_signature_list(input)?;
        for entry in list.entries.chunks_exact(list.signature_size) {
            let signature = &entry[16..];
            match list.signature_type {
                EFI_CERT_X509 => certificates.push(Certificate::from_der(signature)?),
                EFI_CERT_SHA256 => hashes.push(signature.to_vec()),
                other => bail!("unhandled signature type {other}"),
            }
        }
        input = rest;
    }
    Ok((certificates, hashes))
}

/// UEFI_VARIABLE_DATA
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct VariableData {
    pub guid: EfiGuid,
    pub name: String,
    #[serde(with = "hex_bytes")]
    pub data: Vec<u8>,
}

impl VariableData {
    pub fn decode(input: &[u8]) -> Result<Self> {
        let (rest, (guid, name_len, data_len)) =
            finish("variable header", tuple((parse_guid, le_u64, le_u64))(input))?;
        let name_bytes = usize::try_from(name_len)
            .ok()
            .and_then(|n| n.checked_mul(2))
            .context("variable name too long")?;
        let data_len = usize::try_from(data_len).context("variable data too long")?;
        let (rest, name) = finish("variable name", take(name_bytes)(rest))?;
        let (_, data) = finish("variable data", take(data_len)(rest))?;
        Ok(Self {
            guid,
            name: utf16_string(name),
            data: data.to_vec(),
        })
    }

    /// Wire form accepted by [`VariableData::decode`]
    pub fn encode(&self) -> Vec<u8> {
        let name: Vec<u16> = self.name.encode_utf16().collect();
        let mut out = self.guid.to_le_bytes().to_vec();
        out.extend_from_slice(&(name.len() as u64).to_le_bytes());
        out.extend_from_slice(&(self.data.len() as u64).to_le_bytes());
        out.extend(name.iter().flat_map(|u| u.to_le_bytes()));
        out.extend_from_slice(&self.data);
        out
    }
}

/// UEFI_IMAGE_LOAD_EVENT
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ImageLoad {
    pub image_location: u64,
    pub image_length: u64,
    pub link_time_address: u64,
    pub device_path: String,
}

impl ImageLoad {
    pub fn decode(input: &[u8]) -> Result<Self> {
        let (rest, (image_location, image_length, link_time_address, path_len)) = finish(
            "image load event",
            tuple((le_u64, le_u64, le_u64, le_u64))(input),
        )?;
        let path_len = usize::try_from(path_len).context("device path too long")?;
        let (_, path) = finish("device path", take(path_len)(rest))?;
        Ok(Self {
            image_location,
            image_length,
            link_time_address,
            device_path: device_path_to_string(path)?,
        })
    }
}

fn device_path_node(input: &[u8]) -> IResult<&[u8], (u8, u8, &[u8])> {
    let (input, (kind, sub_type, len)) = tuple((le_u8, le_u8, le_u16))(input)?;
    let (input, body) = take((len as usize).saturating_sub(4))(input)?;
    Ok((input, (kind, sub_type, body)))
}

/// Text form of an EFI device path, close to the UEFI shell rendering for
/// the node types boot loaders are loaded from.
pub fn device_path_to_string(mut input: &[u8]) -> Result<String> {
    let mut nodes = vec![];
    while !input.is_empty() {
        let (rest, (kind, sub_type, body)) = finish("device path node", device_path_node(input))?;
        input = rest;
        let node = match (kind, sub_type) {
            (0x7f, 0xff) => break,
            (0x7f, _) => continue,
            (0x04, 0x04) => utf16_string(body),
            (0x04, 0x01) if body.len() >= 38 => {
                let partition = u32::from_le_bytes([body[0], body[1], body[2], body[3]]);
                let mut signature = [0u8; 16];
                signature.copy_from_slice(&body[20..36]);
                match body[37] {
                    0x02 => format!(
                        "HD({partition},GPT,{})",
                        EfiGuid::from_le_bytes(signature)
                    ),
                    _ => format!("HD({partition},MBR)"),
                }
            }
            (0x01, 0x01) if body.len() >= 2 => format!("Pci(0x{:x},0x{:x})", body[1], body[0]),
            _ => format!("Path({kind},{sub_type},{})", hex::encode(body)),
        };
        nodes.push(node);
    }
    Ok(nodes.join("/"))
}

/// UEFI_PLATFORM_FIRMWARE_BLOB and UEFI_PLATFORM_FIRMWARE_BLOB2
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct FirmwareBlob {
    pub base: u64,
    pub length: u64,
}

impl FirmwareBlob {
    pub fn decode(input: &[u8]) -> Result<Self> {
        let (_, (base, length)) = finish("firmware blob", tuple((le_u64, le_u64))(input))?;
        Ok(Self { base, length })
    }

    pub fn decode_v2(input: &[u8]) -> Result<Self> {
        let (rest, desc_len) = finish("firmware blob description", le_u8(input))?;
        let (rest, _desc) = finish("firmware blob description", take(desc_len)(rest))?;
        Self::decode(rest)
    }
}

/// EFI_PARTITION_TABLE_HEADER
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PartitionTableHeader {
    pub signature: u64,
    pub revision: u32,
    pub header_size: u32,
    pub header_crc32: u32,
    pub my_lba: u64,
    pub alternate_lba: u64,
    pub first_usable_lba: u64,
    pub last_usable_lba: u64,
    pub disk_guid: EfiGuid,
    pub partition_entry_lba: u64,
    pub number_of_partition_entries: u32,
    pub size_of_partition_entry: u32,
    pub partition_entry_array_crc32: u32,
}

/// EFI_PARTITION_ENTRY
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Partition {
    pub type_guid: EfiGuid,
    pub unique_guid: EfiGuid,
    pub starting_lba: u64,
    pub ending_lba: u64,
    pub attributes: u64,
    pub name: String,
}

fn gpt_header(input: &[u8]) -> IResult<&[u8], PartitionTableHeader> {
    let (input, (signature, revision, header_size, header_crc32, _reserved)) =
        tuple((le_u64, le_u32, le_u32, le_u32, le_u32))(input)?;
    let (input, (my_lba, alternate_lba, first_usable_lba, last_usable_lba)) =
        tuple((le_u64, le_u64, le_u64, le_u64))(input)?;
    let (
        input,
        (
            disk_guid,
            partition_entry_lba,
            number_of_partition_entries,
            size_of_partition_entry,
            partition_entry_array_crc32,
        ),
    ) = tuple((parse_guid, le_u64, le_u32, le_u32, le_u32))(input)?;
    Ok((
        input,
        PartitionTableHeader {
            signature,
            revision,
            header_size,
            header_crc32,
            my_lba,
            alternate_lba,
            first_usable_lba,
            last_usable_lba,
            disk_guid,
            partition_entry_lba,
            number_of_partition_entries,
            size_of_partition_entry,
            partition_entry_array_crc32,
        },
    ))
}

fn gpt_partition(input: &[u8]) -> IResult<&[u8], Partition> {
    let (input, (type_guid, unique_guid, starting_lba, ending_lba, attributes, name)) = tuple((
        parse_guid,
        parse_guid,
        le_u64,
        le_u64,
        le_u64,
        take(72usize),
    ))(input)?;
    Ok((
        input,
        Partition {
            type_guid,
            unique_guid,
            starting_lba,
            ending_lba,
            attributes,
            name: utf16_string(name),
        },
    ))
}

/// UEFI_GPT_DATA: the partition table header followed by the used entries
pub fn decode_gpt(input: &[u8]) -> Result<(PartitionTableHeader, Vec<Partition>)> {
    if input.len() < GPT_HEADER_SIZE {
        bail!("GPT event too short: {} bytes", input.len());
    }
    let (_, header) = finish("GPT header", gpt_header(&input[..GPT_HEADER_SIZE]))?;
    let (mut rest, count) = finish("GPT partition count", le_u64(&input[GPT_HEADER_SIZE..]))?;
    let entry_size = header.size_of_partition_entry as usize;
    if entry_size < 128 {
        bail!("GPT partition entry size {entry_size} too small");
    }
    let count = usize::try_from(count).context("too many partitions")?;
    if count.saturating_mul(entry_size) > rest.len() {
        bail!("GPT event truncated: {count} partitions announced");
    }
    let mut partitions = Vec::with_capacity(count);
    for _ in 0..count {
        let (next, entry) = finish("GPT partition", take(entry_size)(rest))?;
        let (_, partition) = finish("GPT partition", gpt_partition(entry))?;
        partitions.push(partition);
        rest = next;
    }
    Ok((header, partitions))
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    pub(crate) fn utf16(s: &str) -> Vec<u8> {
        s.encode_utf16().flat_map(|u| u.to_le_bytes()).collect()
    }

    pub(crate) fn variable_data(guid: EfiGuid, name: &str, data: &[u8]) -> Vec<u8> {
        VariableData {
            guid,
            name: name.to_string(),
            data: data.to_vec(),
        }
        .encode()
    }

    fn signature_list(kind: EfiGuid, entries: &[&[u8]]) -> Vec<u8> {
        let sig_size = 16 + entries.first().map_or(0, |e| e.len());
        let mut out = kind.to_le_bytes().to_vec();
        out.extend_from_slice(&((28 + sig_size * entries.len()) as u32).to_le_bytes());
        out.extend_from_slice(&0u32.to_le_bytes());
        out.extend_from_slice(&(sig_size as u32).to_le_bytes());
        for entry in entries {
            out.extend_from_slice(&[0x11; 16]);
            out.extend_from_slice(entry);
        }
        out
    }

    #[test]
    fn guid_text_form() {
        assert_eq!(
            EFI_GLOBAL_VARIABLE.to_string(),
            "8be4df61-93ca-11d2-aa0d-00e098032b8c"
        );
        let bytes = EFI_IMAGE_SECURITY_DATABASE.to_le_bytes();
        assert_eq!(&bytes[..4], &[0xcb, 0xb2, 0x19, 0xd7]);
        assert_eq!(EfiGuid::from_le_bytes(bytes), EFI_IMAGE_SECURITY_DATABASE);
    }

    #[test]
    fn signature_list_hashes() {
        let mut data = signature_list(EFI_CERT_SHA256, &[&[0xaa; 32], &[0xbb; 32]]);
        data.extend(signature_list(EFI_CERT_SHA256, &[&[0xcc; 32]]));
        let (certs, hashes) = parse_efi_signature_list(&data).unwrap();
        assert!(certs.is_empty());
        assert_eq!(hashes, vec![vec![0xaa; 32], vec![0xbb; 32], vec![0xcc; 32]]);
    }

    #[test]
    fn signature_list_edge_cases() {
        assert_eq!(parse_efi_signature_list(&[0; 27]).unwrap().1.len(), 0);

        let unknown = signature_list(EFI_GLOBAL_VARIABLE, &[&[0; 4]]);
        assert!(parse_efi_signature_list(&unknown).is_err());

        let mut truncated = signature_list(EFI_CERT_SHA256, &[&[0xaa; 32]]);
        truncated.truncate(truncated.len() - 1);
        assert!(parse_efi_signature_list(&truncated).is_err());

        let mut huge = signature_list(EFI_CERT_SHA256, &[&[0xaa; 32]]);
        huge[16..20].copy_from_slice(&(2u32 << 20).to_le_bytes());
        assert!(parse_efi_signature_list(&huge).is_err());

        let bad_cert = signature_list(EFI_CERT_X509, &[&[0x30, 0x03, 0x02, 0x01, 0x01]]);
        assert!(parse_efi_signature_list(&bad_cert).is_err());
    }

    #[test]
    fn variable_data_layout() {
        let raw = variable_data(EFI_GLOBAL_VARIABLE, "SecureBoot", &[1]);
        let var = VariableData::decode(&raw).unwrap();
        assert_eq!(var.guid, EFI_GLOBAL_VARIABLE);
        assert_eq!(var.name, "SecureBoot");
        assert_eq!(var.data, vec![1]);
        assert!(VariableData::decode(&raw[..raw.len() - 1]).is_err());
    }

    #[test]
    fn device_path_text() {
        let mut path = vec![0x04, 0x04];
        let file = utf16("\\EFI\\BOOT\\BOOTX64.EFI\0");
        path.extend_from_slice(&((4 + file.len()) as u16).to_le_bytes());
        path.extend_from_slice(&file);
        path.extend_from_slice(&[0x7f, 0xff, 0x04, 0x00]);

        let mut event = vec![];
        for field in [0x1000u64, 0x2000, 0, path.len() as u64] {
            event.extend_from_slice(&field.to_le_bytes());
        }
        event.extend_from_slice(&path);
        let load = ImageLoad::decode(&event).unwrap();
        assert_eq!(load.device_path, "\\EFI\\BOOT\\BOOTX64.EFI");
        assert_eq!(load.image_length, 0x2000);
    }

    #[test]
    fn firmware_blob_layouts() {
        let mut v1 = 0xffd0_0000u64.to_le_bytes().to_vec();
        v1.extend_from_slice(&0x1000u64.to_le_bytes());
        let blob = FirmwareBlob::decode(&v1).unwrap();
        assert_eq!(blob.base, 0xffd0_0000);

        let mut v2 = vec![3, b'R', b'O', b'M'];
        v2.extend_from_slice(&v1);
        assert_eq!(FirmwareBlob::decode_v2(&v2).unwrap(), blob);
    }

    #[test]
    fn gpt_event() {
        let mut data = vec![];
        data.extend_from_slice(&0x5452_4150_2049_4645u64.to_le_bytes());
        data.extend_from_slice(&0x0001_0000u32.to_le_bytes());
        data.extend_from_slice(&92u32.to_le_bytes());
        data.extend_from_slice(&[0; 8]);
        for lba in [1u64, 1000, 34, 966] {
            data.extend_from_slice(&lba.to_le_bytes());
        }
        data.extend_from_slice(&[0x22; 16]);
        data.extend_from_slice(&2u64.to_le_bytes());
        data.extend_from_slice(&128u32.to_le_bytes());
        data.extend_from_slice(&128u32.to_le_bytes());
        data.extend_from_slice(&0u32.to_le_bytes());
        assert_eq!(data.len(), 92);

        data.extend_from_slice(&1u64.to_le_bytes());
        let mut entry = vec![0x33; 16];
        entry.extend_from_slice(&[0x44; 16]);
        for v in [34u64, 500, 0] {
            entry.extend_from_slice(&v.to_le_bytes());
        }
        let mut name = utf16("root");
        name.resize(72, 0);
        entry.extend_from_slice(&name);
        data.extend_from_slice(&entry);

        let (header, partitions) = decode_gpt(&data).unwrap();
        assert_eq!(header.number_of_partition_entries, 128);
        assert_eq!(partitions.len(), 1);
        assert_eq!(partitions[0].name, "root");
        assert_eq!(partitions[0].ending_lba, 500);

        data[92] = 3;
        assert!(decode_gpt(&data).is_err());
    }
}

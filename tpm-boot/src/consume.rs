// SPDX-FileCopyrightText: © 2025 Phala Network <dstack@phala.network>
//
// SPDX-License-Identifier: Apache-2.0

//! Per-event handlers.
//!
//! Handlers check the PCR index an event is meaningful in, and for PCRs 0-7
//! the separator phase, and leave the snapshot untouched otherwise.

use std::collections::BTreeSet;
use std::sync::LazyLock;

use regex::Regex;
use tracing::{debug, warn};

use tpm_eventlog::csme::replay_er;
use tpm_eventlog::efi::{
    EFI_GLOBAL_VARIABLE, EFI_IMAGE_SECURITY_DATABASE, LENOVO_SECURITY_CONFIG, SETUP_VARIABLE,
};
use tpm_eventlog::{
    parse_efi_signature_list, Certificate, CsmeEvent, CsmePayload, CsmeRecord, FirmwareBlobEvent,
    GptEvent, HashAlg, ImaNgEvent, ImageLoadEvent, MessageEvent, NonHostInfoEvent, RawEvent,
    TpmEvent, UefiVariableEvent,
};

use crate::{Boot, Error, ExitBootServices, Hash};

static BOOT_ENTRY: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^Boot\d{4}$").expect("boot entry pattern is valid"));

const SEPARATOR_DATA: [u8; 4] = [0; 4];
const BOOT_GUARD_MARKER: &str = "Boot Guard Measured S-CRTM";
const DELL_CONFIGURATION: [&[u8]; 2] = [
    b"Dell Configuration Information 1",
    b"Dell Configuration Information 2",
];
/// BIOS flash is mapped right below 4 GiB
const FLASH_WINDOW: std::ops::Range<u64> = 0xff00_0000..0x1_0000_0000;
/// Template hash of IMA entries that were not extended into the TPM
const IMA_NOT_MEASURED: [u8; 20] = [0; 20];

/// Check the logged digest of `raw` against the hash of `data`.
///
/// Events without a digest cannot be checked and pass.
fn check_payload(raw: &RawEvent, data: &[u8]) -> Result<(), Error> {
    if raw.digest.is_empty() {
        return Ok(());
    }
    match raw.digest_equals(data) {
        Ok(true) => Ok(()),
        Ok(false) => {
            warn!(
                index = raw.index,
                event = raw.sequence,
                digest = %hex::encode(&raw.digest),
                "event digest does not match its payload"
            );
            Err(Error::payload(raw))
        }
        Err(err) => {
            warn!(index = raw.index, event = raw.sequence, "cannot verify event digest: {err:#}");
            Err(Error::payload(raw))
        }
    }
}

fn trim_nul(message: &str) -> &str {
    message.trim_end_matches('\0')
}

fn set_once(flag: &mut Option<u8>, data: &[u8]) {
    if let (true, [value]) = (flag.is_none(), data) {
        *flag = Some(*value);
    }
}

/// Hex encoded TBS fingerprints and hashes of a signature list
fn signature_list_contents(data: &[u8]) -> Option<BTreeSet<String>> {
    match parse_efi_signature_list(data) {
        Ok((certs, hashes)) => Some(
            certs
                .iter()
                .map(|cert| hex::encode(&cert.tbs_fingerprint))
                .chain(hashes.iter().map(hex::encode))
                .collect(),
        ),
        Err(err) => {
            debug!("ignoring malformed signature list: {err:#}");
            None
        }
    }
}

impl Boot {
    fn past_separator(&self, raw: &RawEvent) -> bool {
        self.separators.is_past(raw.index, raw.alg)
    }

    /// Fold one event into the snapshot.
    ///
    /// Events are expected in log order. Unrecognized events are ignored;
    /// an event whose payload contradicts its logged digest fails with
    /// [`Error::Payload`].
    pub fn consume(&mut self, event: &TpmEvent) -> Result<(), Error> {
        self.is_empty = false;
        match event {
            TpmEvent::Separator(raw) => self.separator(raw)?,
            TpmEvent::CrtmContents(ev) => self.crtm_contents(ev),
            TpmEvent::CompactHash(raw) => self.dell_config(raw),
            TpmEvent::Ipl(ev) => {
                self.grub(ev);
                self.shim(ev);
            }
            TpmEvent::NonHostInfo(ev) => self.csme(ev)?,
            TpmEvent::Csme(ev) => self.csme_event(ev),
            TpmEvent::UefiVariableDriverConfig(ev) => {
                self.secure_boot_variable(ev)?;
                self.uefi_config(ev)?;
                self.lenovo_config(ev);
            }
            TpmEvent::UefiBootVariable(ev) => self.boot_variable(ev),
            TpmEvent::UefiBootServicesApplication(ev) => self.boot_application(ev),
            TpmEvent::UefiGpt(ev) => self.gpt(ev)?,
            TpmEvent::UefiAction(ev) => self.exit_boot_services(ev)?,
            TpmEvent::UefiPlatformFirmwareBlob(ev) => self.option_rom(ev),
            TpmEvent::ImaNg(ev) => self.ima(ev)?,
            TpmEvent::NoAction(_)
            | TpmEvent::PostCode(_)
            | TpmEvent::CrtmVersion(_)
            | TpmEvent::Action(_)
            | TpmEvent::UefiVariableAuthority(_)
            | TpmEvent::UefiBootServicesDriver(_)
            | TpmEvent::UefiRuntimeServicesDriver(_)
            | TpmEvent::Other(_) => {}
        }
        Ok(())
    }

    fn separator(&mut self, raw: &RawEvent) -> Result<(), Error> {
        if raw.index as usize >= crate::SEPARATED_PCRS || self.past_separator(raw) {
            return Ok(());
        }
        check_payload(raw, &raw.data)?;
        if raw.data != SEPARATOR_DATA {
            warn!(index = raw.index, "separator with error payload {}", hex::encode(&raw.data));
            return Err(Error::payload(raw));
        }
        if self.separators.record(raw.index, raw.alg) {
            debug!(index = raw.index, alg = ?raw.alg, "separator");
        }
        Ok(())
    }

    fn crtm_contents(&mut self, ev: &MessageEvent) {
        let raw = &ev.raw;
        if raw.index != 0 || self.past_separator(raw) {
            return;
        }
        if trim_nul(&ev.message) == BOOT_GUARD_MARKER {
            self.firmware.boot_guard_ibb.union_with(&Hash::event_digest(raw));
        }
    }

    fn dell_config(&mut self, raw: &RawEvent) {
        if raw.index != 1 || self.past_separator(raw) {
            return;
        }
        if DELL_CONFIGURATION.contains(&raw.data.as_slice()) {
            self.firmware.is_dell = true;
        }
    }

    fn option_rom(&mut self, ev: &FirmwareBlobEvent) {
        let raw = &ev.raw;
        if raw.index != 0 || self.past_separator(raw) {
            return;
        }
        let blob = &ev.blob;
        let in_flash = FLASH_WINDOW.contains(&blob.base)
            && blob
                .base
                .checked_add(blob.length)
                .is_some_and(|end| end < FLASH_WINDOW.end);
        if !in_flash {
            return;
        }
        let digest = Hash::event_digest(raw);
        if digest.is_unset() {
            return;
        }
        self.firmware
            .embedded_firmware
            .entry(format!("{:x}", blob.base))
            .or_default()
            .union_with(&digest);
    }

    fn boot_variable(&mut self, ev: &UefiVariableEvent) {
        let raw = &ev.raw;
        if raw.index != 1 || self.past_separator(raw) {
            return;
        }
        let var = &ev.variable;
        if var.guid != EFI_GLOBAL_VARIABLE {
            return;
        }
        let digest = Hash::event_digest(raw);
        if digest.is_unset() || BOOT_ENTRY.is_match(&var.name) {
            return;
        }
        if var.name == "BootOrder" {
            self.bootloader.boot_order.union_with(&digest);
        }
        // first measurement of a name wins
        self.bootloader
            .boot_variables
            .entry(var.name.clone())
            .or_insert(digest);
    }

    fn uefi_config(&mut self, ev: &UefiVariableEvent) -> Result<(), Error> {
        let raw = &ev.raw;
        if raw.index != 1 || self.past_separator(raw) {
            return Ok(());
        }
        check_payload(raw, &raw.data)?;
        if ev.variable.guid == SETUP_VARIABLE && ev.variable.name == "Setup" {
            self.firmware.setup.union_with(&Hash::event_digest(raw));
        }
        Ok(())
    }

    fn lenovo_config(&mut self, ev: &UefiVariableEvent) {
        let raw = &ev.raw;
        if raw.index != 1 || self.past_separator(raw) {
            return;
        }
        if ev.variable.guid == LENOVO_SECURITY_CONFIG && ev.variable.name == "LenovoSecurityConfig" {
            self.firmware.is_lenovo = true;
        }
    }

    fn secure_boot_variable(&mut self, ev: &UefiVariableEvent) -> Result<(), Error> {
        let raw = &ev.raw;
        if raw.index != 7 || self.past_separator(raw) {
            return Ok(());
        }
        check_payload(raw, &raw.data)?;

        let var = &ev.variable;
        let digest = Hash::event_digest(raw);
        let sb = &mut self.secure_boot;
        match (var.guid, var.name.as_str()) {
            (EFI_IMAGE_SECURITY_DATABASE, "db") => {
                sb.db.union_with(&digest);
                if let Some(contents) = signature_list_contents(&var.data) {
                    sb.db_contents = contents;
                }
            }
            (EFI_IMAGE_SECURITY_DATABASE, "dbx") => {
                sb.dbx.union_with(&digest);
                if let Some(contents) = signature_list_contents(&var.data) {
                    sb.dbx_contents = contents;
                }
            }
            (EFI_GLOBAL_VARIABLE, "SecureBoot") => set_once(&mut sb.secure_boot, &var.data),
            (EFI_GLOBAL_VARIABLE, "AuditMode") => set_once(&mut sb.audit_mode, &var.data),
            (EFI_GLOBAL_VARIABLE, "DeployedMode") => set_once(&mut sb.deployed_mode, &var.data),
            (EFI_GLOBAL_VARIABLE, "SetupMode") => set_once(&mut sb.setup_mode, &var.data),
            (EFI_GLOBAL_VARIABLE, "PK") => {
                if sb.pk_parsed.is_none() {
                    match Certificate::from_der(&var.data) {
                        Ok(cert) => sb.pk_parsed = Some(cert),
                        Err(err) => debug!("PK is not a certificate: {err:#}"),
                    }
                }
                sb.pk.union_with(&digest);
            }
            (EFI_GLOBAL_VARIABLE, "KEK") => {
                match parse_efi_signature_list(&var.data) {
                    Ok((certs, _)) => sb.kek_parsed.extend(certs),
                    Err(err) => debug!("ignoring malformed KEK: {err:#}"),
                }
                sb.kek.union_with(&digest);
            }
            _ => {}
        }
        Ok(())
    }

    fn csme(&mut self, ev: &NonHostInfoEvent) -> Result<(), Error> {
        let raw = &ev.raw;
        if self.past_separator(raw) {
            return Ok(());
        }
        match (raw.index, &ev.record) {
            (0 | 2, CsmeRecord::Info(info)) => {
                check_payload(raw, &raw.data)?;
                self.csme.info = Some(*info);
            }
            (0 | 2, CsmeRecord::Measurement(block)) => {
                let Some(alg) = block.er_alg else {
                    warn!(index = raw.index, "CSME measurement with unknown ER algorithm");
                    return Ok(());
                };
                check_payload(raw, &replay_er(alg, &block.events))?;
                // sub-events carry no measurement blocks of their own
                for sub in &block.events {
                    self.csme_event(sub);
                }
            }
            (1 | 3, CsmeRecord::AmtConfig(config)) => {
                check_payload(raw, &raw.data)?;
                self.csme.amt_config = Some(config.clone());
            }
            _ => {}
        }
        Ok(())
    }

    fn csme_event(&mut self, ev: &CsmeEvent) {
        let raw = &ev.raw;
        if !matches!(raw.index, 0 | 2) || self.past_separator(raw) {
            return;
        }
        let entity = ev.measured_entity_id;
        let csme = &mut self.csme;
        match &ev.payload {
            CsmePayload::ManifestVersion(version) => {
                csme.component_versions.entry(entity).or_insert(*version);
            }
            CsmePayload::InitializeManifest | CsmePayload::ExtendManifest => {
                csme.component_hash
                    .entry(entity)
                    .or_insert_with(|| raw.data.clone());
            }
            CsmePayload::SecurityParameters(params) => {
                csme.security_parameters.get_or_insert(*params);
            }
            CsmePayload::OperationMode(mode) => {
                csme.operation_mode.get_or_insert(*mode);
            }
            CsmePayload::OemEnabledCapabilities(_)
            | CsmePayload::SkuInformation(_)
            | CsmePayload::Other => {}
        }
    }

    fn boot_application(&mut self, ev: &ImageLoadEvent) {
        let raw = &ev.raw;
        let digest = Hash::event_digest(raw);
        if raw.index != 4 || !self.past_separator(raw) || digest.is_unset() {
            return;
        }
        self.bootloader
            .boot_applications
            .entry(ev.image.device_path.clone())
            .or_default()
            .union_with(&digest);
    }

    fn gpt(&mut self, ev: &GptEvent) -> Result<(), Error> {
        let raw = &ev.raw;
        if raw.index != 5 || !self.past_separator(raw) {
            return Ok(());
        }
        check_payload(raw, &raw.data)?;
        let bootloader = &mut self.bootloader;
        bootloader.gpt.union_with(&Hash::event_digest(raw));
        bootloader.partition_table_header = Some(ev.header.clone());
        bootloader.partitions = ev.partitions.clone();
        Ok(())
    }

    fn exit_boot_services(&mut self, ev: &MessageEvent) -> Result<(), Error> {
        let raw = &ev.raw;
        if raw.index != 5 || !self.past_separator(raw) {
            return Ok(());
        }
        check_payload(raw, &raw.data)?;
        let state = &mut self.bootloader.exit_boot_services;
        *state = match (*state, ev.message.as_str()) {
            (ExitBootServices::Pre, "Exit Boot Services Invocation") => ExitBootServices::Running,
            (ExitBootServices::Running, "Exit Boot Services Returned with Success") => {
                ExitBootServices::Done
            }
            (current, _) => current,
        };
        Ok(())
    }

    /// GRUB logs its commands to PCR 8 and the files it loads to PCR 9
    fn grub(&mut self, ev: &MessageEvent) {
        let message = trim_nul(&ev.message);
        let bootloader = &mut self.bootloader;
        match ev.raw.index {
            8 => {
                let tokens: Vec<&str> = message.split(' ').collect();
                match tokens.as_slice() {
                    ["grub_cmd:", "linux", file, ..] => {
                        bootloader.linux_file.get_or_insert_with(|| file.to_string());
                    }
                    ["grub_cmd:", "initrd", file, ..] => {
                        bootloader.initrd_file.get_or_insert_with(|| file.to_string());
                    }
                    // the image path and the root device come first
                    ["kernel_cmdline:", _image, _root, args @ ..] => {
                        bootloader
                            .linux_command
                            .get_or_insert_with(|| args.iter().map(|s| s.to_string()).collect());
                    }
                    _ => {}
                }
            }
            9 => {
                if bootloader.linux_file.as_deref() == Some(message) {
                    bootloader.linux_digest.union_with(&Hash::event_digest(&ev.raw));
                }
                if bootloader.initrd_file.as_deref() == Some(message) {
                    bootloader.initrd_digest.union_with(&Hash::event_digest(&ev.raw));
                }
            }
            _ => {}
        }
    }

    fn shim(&mut self, ev: &MessageEvent) {
        if ev.raw.index != 14 {
            return;
        }
        let list = match ev.message.as_str() {
            "MokList\0" => &mut self.secure_boot.mok_list,
            "MokListX\0" => &mut self.secure_boot.mok_list_x,
            _ => return,
        };
        list.union_with(&Hash::event_digest(&ev.raw));
    }

    fn ima(&mut self, ev: &ImaNgEvent) -> Result<(), Error> {
        let raw = &ev.raw;
        if !raw.digest.is_empty() && raw.digest != IMA_NOT_MEASURED {
            let template_hash = HashAlg::Sha1.digest(&[&raw.data]);
            if raw.digest != template_hash {
                warn!(
                    path = %ev.path,
                    logged = %hex::encode(&raw.digest),
                    computed = %hex::encode(&template_hash),
                    "IMA template hash mismatch"
                );
                return Err(Error::payload(raw));
            }
        }

        match ev.path.as_str() {
            "boot_aggregate" => {
                let aggregate = Hash::from_digest(&ev.file_digest)?;
                self.ima.boot_aggregate.union_with(&aggregate);
            }
            "kexec-cmdline" => {
                self.ima.kexec_cmdline.union_with(&Hash::event_digest(raw));
            }
            path if path.starts_with('/') => {
                let digest = Hash::event_digest(raw);
                if !digest.is_unset() {
                    self.ima
                        .files
                        .entry(path.to_string())
                        .or_default()
                        .union_with(&digest);
                }
            }
            _ => {}
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tpm_eventlog::tcg::{EV_COMPACT_HASH, EV_IPL, EV_SEPARATOR};

    fn separator(index: u32, alg: HashAlg) -> TpmEvent {
        TpmEvent::Separator(RawEvent::measured(index, EV_SEPARATOR, alg, vec![0; 4]))
    }

    fn ipl(index: u32, message: &str) -> TpmEvent {
        TpmEvent::Ipl(MessageEvent::new(RawEvent::measured(
            index,
            EV_IPL,
            HashAlg::Sha256,
            message.as_bytes().to_vec(),
        )))
    }

    #[test]
    fn separator_payload_errors() {
        let mut boot = Boot::empty();
        let error_sep = RawEvent::measured(4, EV_SEPARATOR, HashAlg::Sha256, vec![1, 0, 0, 0]);
        assert!(matches!(
            boot.consume(&TpmEvent::Separator(error_sep)),
            Err(Error::Payload { index: 4, .. })
        ));
        assert!(!boot.separators.is_past(4, HashAlg::Sha256));

        let mut forged = RawEvent::measured(4, EV_SEPARATOR, HashAlg::Sha256, vec![0; 4]);
        forged.digest[0] ^= 1;
        assert!(boot.consume(&TpmEvent::Separator(forged)).is_err());
        assert!(!boot.separators.is_past(4, HashAlg::Sha256));
        assert!(!boot.is_empty);
    }

    #[test]
    fn separator_above_pcr7_is_ignored() {
        let mut boot = Boot::empty();
        boot.consume(&separator(8, HashAlg::Sha256)).unwrap();
        let garbage = RawEvent::new(9, EV_SEPARATOR, HashAlg::Sha1, vec![1; 20], vec![7]);
        boot.consume(&TpmEvent::Separator(garbage)).unwrap();
        assert_eq!(boot.separators, crate::Separators::default());
    }

    #[test]
    fn sha384_is_never_separated() {
        let mut boot = Boot::empty();
        boot.consume(&separator(0, HashAlg::Sha384)).unwrap();
        assert!(!boot.separators.is_past(0, HashAlg::Sha384));
    }

    #[test]
    fn grub_files_and_digests() {
        let mut boot = Boot::empty();
        for ev in [
            ipl(8, "grub_cmd: linux (hd0,gpt2)/vmlinuz-6.1 root=/dev/sda2\0"),
            ipl(8, "grub_cmd: linux /other"),
            ipl(8, "grub_cmd: initrd (hd0,gpt2)/initrd.img-6.1"),
            ipl(8, "kernel_cmdline: BOOT_IMAGE=(hd0,gpt2)/vmlinuz-6.1 root=/dev/sda2 ro quiet"),
            ipl(8, "kernel_cmdline: /ignored"),
            ipl(9, "(hd0,gpt2)/vmlinuz-6.1"),
            ipl(9, "(hd0,gpt2)/initrd.img-6.1\0"),
            ipl(9, "(hd0,gpt2)/grub.cfg"),
        ] {
            boot.consume(&ev).unwrap();
        }
        let bl = &boot.bootloader;
        assert_eq!(bl.linux_file.as_deref(), Some("(hd0,gpt2)/vmlinuz-6.1"));
        assert_eq!(bl.initrd_file.as_deref(), Some("(hd0,gpt2)/initrd.img-6.1"));
        assert_eq!(
            bl.linux_command,
            Some(vec!["ro".into(), "quiet".into()])
        );
        assert_eq!(bl.linux_digest.sha256().count(), 1);
        assert_eq!(bl.initrd_digest.sha256().count(), 1);
        assert!(bl.linux_digest.compare_digest(b"(hd0,gpt2)/vmlinuz-6.1"));
    }

    #[test]
    fn short_grub_commands_are_ignored() {
        let mut boot = Boot::empty();
        boot.consume(&ipl(8, "grub_cmd: linux")).unwrap();
        boot.consume(&ipl(8, "kernel_cmdline:")).unwrap();
        boot.consume(&ipl(8, "kernel_cmdline: BOOT_IMAGE=/vmlinuz")).unwrap();
        boot.consume(&ipl(8, "")).unwrap();
        assert_eq!(boot.bootloader.linux_file, None);
        assert_eq!(boot.bootloader.linux_command, None);
    }

    #[test]
    fn shim_mok_lists() {
        let mut boot = Boot::empty();
        boot.consume(&ipl(14, "MokList\0")).unwrap();
        boot.consume(&ipl(14, "MokListX\0")).unwrap();
        boot.consume(&ipl(14, "MokListTrusted\0")).unwrap();
        boot.consume(&ipl(13, "MokList\0")).unwrap();
        assert_eq!(boot.secure_boot.mok_list.sha256().count(), 1);
        assert_eq!(boot.secure_boot.mok_list_x.sha256().count(), 1);
    }

    #[test]
    fn dell_detection() {
        let mut boot = Boot::empty();
        let other = RawEvent::new(1, EV_COMPACT_HASH, HashAlg::Sha1, vec![], b"Dell".to_vec());
        boot.consume(&TpmEvent::CompactHash(other)).unwrap();
        assert!(!boot.firmware.is_dell);

        let dell = RawEvent::new(
            1,
            EV_COMPACT_HASH,
            HashAlg::Sha1,
            vec![],
            b"Dell Configuration Information 2".to_vec(),
        );
        boot.consume(&TpmEvent::CompactHash(dell.clone())).unwrap();
        assert!(boot.firmware.is_dell);

        let mut late = Boot::empty();
        late.consume(&separator(1, HashAlg::Sha1)).unwrap();
        late.consume(&TpmEvent::CompactHash(dell)).unwrap();
        assert!(!late.firmware.is_dell);
    }
}

// SPDX-FileCopyrightText: © 2025 Phala Network <dstack@phala.network>
//
// SPDX-License-Identifier: Apache-2.0

//! Set-valued digest register for one measurement topic

use std::collections::BTreeSet;
use std::fmt;

use serde::ser::{Serialize, SerializeMap, Serializer};
use tpm_eventlog::{HashAlg, RawEvent};

use crate::Error;

/// Every digest observed for a topic, per PCR bank.
///
/// Values are only ever added by [`Hash::union_with`]; a topic measured
/// several times keeps all of its digests.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Hash {
    sha1: BTreeSet<[u8; 20]>,
    sha256: BTreeSet<[u8; 32]>,
}

impl Hash {
    /// Hash holding one digest, banked by its length. An empty digest gives
    /// an unset hash.
    pub fn from_digest(digest: &[u8]) -> Result<Self, Error> {
        let mut hash = Hash::default();
        hash.insert(digest)?;
        Ok(hash)
    }

    /// The digest logged for `raw`; unset if it fits no bank
    pub fn event_digest(raw: &RawEvent) -> Self {
        Self::from_digest(&raw.digest).unwrap_or_default()
    }

    pub fn is_unset(&self) -> bool {
        self.sha1.is_empty() && self.sha256.is_empty()
    }

    /// Record `digest`, returning whether it was new.
    pub fn insert(&mut self, digest: &[u8]) -> Result<bool, Error> {
        if let Ok(sha1) = <[u8; 20]>::try_from(digest) {
            return Ok(self.sha1.insert(sha1));
        }
        if let Ok(sha256) = <[u8; 32]>::try_from(digest) {
            return Ok(self.sha256.insert(sha256));
        }
        match digest.len() {
            0 => Ok(false),
            n => Err(Error::UnknownBank(n)),
        }
    }

    /// Merge every digest of `other`, returning whether anything was added.
    pub fn union_with(&mut self, other: &Hash) -> bool {
        let before = (self.sha1.len(), self.sha256.len());
        self.sha1.extend(other.sha1.iter().copied());
        self.sha256.extend(other.sha256.iter().copied());
        before != (self.sha1.len(), self.sha256.len())
    }

    /// Overwrite the banks `other` has values for.
    pub fn replace_with(&mut self, other: &Hash) -> bool {
        let mut changed = false;
        if !other.sha1.is_empty() {
            changed |= self.sha1 != other.sha1;
            self.sha1 = other.sha1.clone();
        }
        if !other.sha256.is_empty() {
            changed |= self.sha256 != other.sha256;
            self.sha256 = other.sha256.clone();
        }
        changed
    }

    /// Whether the two hashes agree on every bank both have values for
    pub fn intersects_with(&self, other: &Hash) -> bool {
        fn bank<T: Ord>(a: &BTreeSet<T>, b: &BTreeSet<T>) -> bool {
            a.is_empty() || b.is_empty() || !a.is_disjoint(b)
        }
        bank(&self.sha1, &other.sha1) && bank(&self.sha256, &other.sha256)
    }

    /// Whether the hash of `buf` is recorded in every bank that has values
    pub fn compare_digest(&self, buf: &[u8]) -> bool {
        let sha1_ok = self.sha1.is_empty()
            || HashAlg::Sha1
                .digest(&[buf])
                .try_into()
                .is_ok_and(|d: [u8; 20]| self.sha1.contains(&d));
        let sha256_ok = self.sha256.is_empty()
            || HashAlg::Sha256
                .digest(&[buf])
                .try_into()
                .is_ok_and(|d: [u8; 32]| self.sha256.contains(&d));
        sha1_ok && sha256_ok
    }

    pub fn sha1(&self) -> impl Iterator<Item = &[u8; 20]> {
        self.sha1.iter()
    }

    pub fn sha256(&self) -> impl Iterator<Item = &[u8; 32]> {
        self.sha256.iter()
    }
}

impl fmt::Display for Hash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let sha1: Vec<_> = self.sha1.iter().map(hex::encode).collect();
        let sha256: Vec<_> = self.sha256.iter().map(hex::encode).collect();
        write!(f, "{{[{}] [{}]}}", sha1.join(" "), sha256.join(" "))
    }
}

impl Serialize for Hash {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let banks = [
            ("sha1", self.sha1.iter().map(hex::encode).collect::<Vec<_>>()),
            ("sha256", self.sha256.iter().map(hex::encode).collect()),
        ];
        let mut map = serializer.serialize_map(None)?;
        for (name, values) in banks.iter().filter(|(_, v)| !v.is_empty()) {
            map.serialize_entry(name, values)?;
        }
        map.end()
    }
}

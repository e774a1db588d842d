use crate::crypto::{AesKey, AesXtsKey, TitleKey};
use crate::ids::RightsId;
use binrw::BinRead;
use serde::{Deserialize, Serialize};
use snafu::Snafu;
use std::collections::HashMap;
use std::fmt::{Debug, Display, Formatter};

/// Number of master key revisions a keyset can hold keys for.
pub const MAX_KEY_REVISIONS: usize = 0x20;

const RSA_2048_MODULUS_SIZE: usize = 0x100;

/// Keys needed to decode NCAs.
///
/// The keyset is never mutated by the decoder, so it can be shared between any number of open
/// NCAs.
#[derive(Clone, Default, Serialize, Deserialize)]
pub struct KeySet {
    header_key: Option<AesXtsKey>,
    title_kek: HashMap<u8, AesKey>,
    key_area_key_application: HashMap<u8, AesKey>,
    key_area_key_ocean: HashMap<u8, AesKey>,
    key_area_key_system: HashMap<u8, AesKey>,
    title_keys: HashMap<RightsId, TitleKey>,
    #[serde(skip)]
    nca_header_fixed_key_moduli: HashMap<u8, Vec<u8>>,
}

impl Debug for KeySet {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        // don't print the keys themselves
        f.debug_struct("KeySet")
            .field("has_header_key", &self.header_key.is_some())
            .field("title_kek_count", &self.title_kek.len())
            .field("title_key_count", &self.title_keys.len())
            .finish_non_exhaustive()
    }
}

#[derive(Clone, Copy, PartialEq, Eq)]
pub struct KeyName {
    pub key_name: &'static str,
    pub index: Option<u8>,
}

impl Debug for KeyName {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        if let Some(index) = self.index {
            write!(f, "{}_{:02x}", self.key_name, index)
        } else {
            write!(f, "{}", self.key_name)
        }
    }
}

impl Display for KeyName {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        Debug::fmt(self, f)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyType {
    /// A console-wide key (header key, key area keys, title KEKs).
    Common,
    /// A per-title key looked up by rights id.
    Title,
}

#[derive(Snafu, Debug, Clone, PartialEq, Eq)]
pub enum MissingKeyError {
    #[snafu(display("Missing key {}", key_name))]
    Common { key_name: KeyName },
    #[snafu(display("Missing title key for RightsId {}", rights_id))]
    Title { rights_id: RightsId },
}

impl MissingKeyError {
    pub fn key_type(&self) -> KeyType {
        match self {
            MissingKeyError::Common { .. } => KeyType::Common,
            MissingKeyError::Title { .. } => KeyType::Title,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, BinRead)]
#[br(repr = u8)]
pub enum KeyAreaKeyIndex {
    Application = 0,
    Ocean = 1,
    System = 2,
}

impl KeySet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_header_key(mut self, key: AesXtsKey) -> Self {
        self.header_key = Some(key);
        self
    }

    pub fn with_title_kek(mut self, master_key_revision: u8, key: AesKey) -> Self {
        self.title_kek.insert(master_key_revision, key);
        self
    }

    pub fn with_key_area_key(
        mut self,
        master_key_revision: u8,
        key_area_key_index: KeyAreaKeyIndex,
        key: AesKey,
    ) -> Self {
        self.key_area_keys_mut(key_area_key_index)
            .insert(master_key_revision, key);
        self
    }

    pub fn with_nca_header_fixed_key_modulus(mut self, generation: u8, modulus: Vec<u8>) -> Self {
        self.nca_header_fixed_key_moduli.insert(generation, modulus);
        self
    }

    pub fn add_title_key(&mut self, rights_id: RightsId, title_key: TitleKey) {
        self.title_keys.insert(rights_id, title_key);
    }

    fn key_area_keys(&self, index: KeyAreaKeyIndex) -> (&HashMap<u8, AesKey>, &'static str) {
        match index {
            KeyAreaKeyIndex::Application => {
                (&self.key_area_key_application, "key_area_key_application")
            }
            KeyAreaKeyIndex::Ocean => (&self.key_area_key_ocean, "key_area_key_ocean"),
            KeyAreaKeyIndex::System => (&self.key_area_key_system, "key_area_key_system"),
        }
    }

    fn key_area_keys_mut(&mut self, index: KeyAreaKeyIndex) -> &mut HashMap<u8, AesKey> {
        match index {
            KeyAreaKeyIndex::Application => &mut self.key_area_key_application,
            KeyAreaKeyIndex::Ocean => &mut self.key_area_key_ocean,
            KeyAreaKeyIndex::System => &mut self.key_area_key_system,
        }
    }
}

fn missing(key_name: &'static str, index: Option<u8>) -> MissingKeyError {
    MissingKeyError::Common {
        key_name: KeyName { key_name, index },
    }
}

impl KeySet {
    pub fn header_key(&self) -> Result<AesXtsKey, MissingKeyError> {
        self.header_key.ok_or_else(|| missing("header_key", None))
    }

    pub fn title_kek(&self, master_key_revision: u8) -> Result<AesKey, MissingKeyError> {
        self.title_kek
            .get(&master_key_revision)
            .copied()
            .ok_or_else(|| missing("titlekek", Some(master_key_revision)))
    }

    pub fn key_area_key(
        &self,
        master_key_revision: u8,
        key_area_key_index: KeyAreaKeyIndex,
    ) -> Result<AesKey, MissingKeyError> {
        let (keys, name) = self.key_area_keys(key_area_key_index);
        keys.get(&master_key_revision)
            .copied()
            .ok_or_else(|| missing(name, Some(master_key_revision)))
    }

    pub fn title_key(&self, rights_id: &RightsId) -> Result<TitleKey, MissingKeyError> {
        self.title_keys
            .get(rights_id)
            .copied()
            .ok_or(MissingKeyError::Title {
                rights_id: *rights_id,
            })
    }

    /// Modulus of the key used for the first NCA header signature.
    pub fn nca_header_fixed_key_modulus(&self, generation: u8) -> Result<&[u8], MissingKeyError> {
        self.nca_header_fixed_key_moduli
            .get(&generation)
            .filter(|m| m.len() == RSA_2048_MODULUS_SIZE)
            .map(Vec::as_slice)
            .ok_or_else(|| missing("nca_hdr_fixed_key_modulus", Some(generation)))
    }
}

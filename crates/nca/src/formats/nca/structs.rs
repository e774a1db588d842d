use crate::crypto::keyset::KeyAreaKeyIndex;
use crate::crypto::{sha256, EncryptedAesKey};
use crate::hexstring::HexData;
use crate::ids::{RightsId, TitleId};
use binrw::BinRead;
use std::fmt::Debug;

pub const NCA_SECTOR_SIZE: u64 = 0x200;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NcaSectionType {
    Code,
    Data,
    Logo,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, BinRead)]
#[br(repr = u8)]
pub enum NcaContentType {
    Program,
    Meta,
    Control,
    Manual,
    Data,
    PublicData,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, BinRead)]
#[br(repr = u8)]
pub enum DistributionType {
    Download,
    GameCard,
}

/// Encryption of a section's data.
///
/// The on-disk `Auto` value (0) and the newer skip-layer values are not accepted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NcaEncryptionType {
    None,
    Xts,
    AesCtr,
    AesCtrEx,
}

impl TryFrom<u8> for NcaEncryptionType {
    type Error = u8;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            1 => Ok(Self::None),
            2 => Ok(Self::Xts),
            3 => Ok(Self::AesCtr),
            4 => Ok(Self::AesCtrEx),
            v => Err(v),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NcaHashType {
    None,
    Sha256,
    Ivfc,
}

impl TryFrom<u8> for NcaHashType {
    type Error = u8;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            1 => Ok(Self::None),
            2 => Ok(Self::Sha256),
            3 => Ok(Self::Ivfc),
            v => Err(v),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NcaFormatType {
    Romfs,
    Pfs0,
}

impl TryFrom<u8> for NcaFormatType {
    type Error = u8;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(Self::Romfs),
            1 => Ok(Self::Pfs0),
            v => Err(v),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, BinRead)]
pub struct NcaSignature(pub HexData<0x100>);

/// Start and end of a section, in 0x200-byte sectors.
#[derive(Debug, Clone, Copy, Eq, PartialEq, BinRead)]
pub struct SectionTableEntry {
    pub start: u32,
    #[br(pad_after = 0x8)]
    pub end: u32,
}

impl SectionTableEntry {
    pub fn is_enabled(&self) -> bool {
        self.start != 0 || self.end != 0
    }

    pub fn start_offset(&self) -> u64 {
        self.start as u64 * NCA_SECTOR_SIZE
    }

    pub fn end_offset(&self) -> u64 {
        self.end as u64 * NCA_SECTOR_SIZE
    }

    /// Zero for a malformed entry that ends before it starts.
    pub fn size(&self) -> u64 {
        self.end_offset().saturating_sub(self.start_offset())
    }
}

#[repr(transparent)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, BinRead)]
pub struct Sha256Hash(pub HexData<0x20>);

impl Sha256Hash {
    pub fn verify(&self, data: &[u8]) -> bool {
        sha256(data) == self.0 .0
    }
}

#[derive(Debug, Clone, Copy, Eq, PartialEq, BinRead)]
pub struct NcaKeyArea {
    /// XTS data key, XTS tweak key, CTR key and the unused hardware CTR key.
    #[br(pad_after = 0xc0)]
    pub encrypted_keys: [EncryptedAesKey; 4],
}

/// NCA header, corresponding to the first 0x400 bytes of the decrypted NCA
#[derive(Debug, Clone, Copy, PartialEq, Eq, BinRead)]
#[br(little)]
pub struct NcaHeader {
    pub fixed_key_signature: NcaSignature,
    pub npdm_signature: NcaSignature,
    pub magic: [u8; 4],
    pub distribution_type: DistributionType,
    pub content_type: NcaContentType,
    pub key_generation_1: u8,
    pub key_area_key_index: KeyAreaKeyIndex,
    pub nca_size: u64,
    pub title_id: TitleId,
    pub content_index: u32,
    pub sdk_version: u32,
    pub key_generation_2: u8,
    #[br(pad_after = 0xe)]
    pub signature_key_generation: u8,
    pub rights_id: RightsId,
    pub section_table: [SectionTableEntry; 4],
    pub fs_header_hashes: [Sha256Hash; 4],
    pub key_area: NcaKeyArea,
}

impl NcaHeader {
    pub fn key_generation(&self) -> u8 {
        std::cmp::max(self.key_generation_1, self.key_generation_2)
    }

    /// Revisions 0 and 1 both use the first master key.
    pub fn master_key_revision(&self) -> u8 {
        self.key_generation().saturating_sub(1)
    }

    pub fn has_rights_id(&self) -> bool {
        !self.rights_id.is_empty()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, BinRead)]
pub struct Sha256IntegrityInfoLevel {
    pub offset: u64,
    pub size: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, BinRead)]
#[br(little)]
pub struct Sha256IntegrityInfo {
    pub master_hash: Sha256Hash,
    pub block_size: u32,
    pub level_count: u32,
    pub level_info: [Sha256IntegrityInfoLevel; 6],
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, BinRead)]
pub struct IvfcIntegrityInfoLevel {
    pub offset: u64,
    pub size: u64,
    /// log2 of the block size
    #[br(pad_after = 4)]
    pub block_size: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, BinRead)]
#[br(little, magic = b"IVFC")]
pub struct IvfcIntegrityInfo {
    pub version: u32,
    pub master_hash_size: u32,
    /// Number of levels, the master hash included.
    pub level_count: u32,
    pub level_info: [IvfcIntegrityInfoLevel; 6],
    pub salt_source: HexData<0x20>,
    pub master_hash: HexData<0x38>, // this is the max size of the hash
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IntegrityInfo {
    None,
    Sha256(Sha256IntegrityInfo),
    Ivfc(IvfcIntegrityInfo),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, BinRead)]
pub struct PatchInfo {
    pub relocation_tree_offset: u64,
    pub relocation_tree_size: u64,
    pub relocation_tree_header: HexData<0x10>,
    pub encryption_tree_offset: u64,
    pub encryption_tree_size: u64,
    pub encryption_tree_header: HexData<0x10>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, BinRead)]
pub struct SparseInfo {
    pub meta_offset: u64,
    pub meta_size: u64,
    pub meta_header: HexData<0x10>,
    pub physical_offset: u64,
    pub generation: u16,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, BinRead)]
pub struct CompressionInfo {
    pub table_offset: u64,
    pub table_size: u64,
    pub table_header: HexData<0x10>,
}

/// Per-section header. The type bytes are kept raw: an unknown value only matters once the section
/// is opened.
#[derive(Debug, Clone, Copy, PartialEq, Eq, BinRead)]
#[br(little)]
pub struct NcaFsHeader {
    pub version: u16,
    pub format_type: u8,
    pub hash_type: u8,
    #[br(pad_after = 0x3)]
    pub encryption_type: u8,

    pub integrity_info: HexData<0xf8>,

    #[br(pad_size_to = 0x40)]
    pub patch_info: PatchInfo,

    pub upper_counter: u64,

    #[br(pad_size_to = 0x30)]
    pub sparse_info: SparseInfo,

    #[br(pad_size_to = 0x28)] // this is the allocated size for CompressionInfo
    #[br(pad_after = 0x60)] // this is unused space after it
    pub compression_info: CompressionInfo,
}

impl NcaFsHeader {
    pub fn format_type(&self) -> Result<NcaFormatType, u8> {
        self.format_type.try_into()
    }

    pub fn hash_type(&self) -> Result<NcaHashType, u8> {
        self.hash_type.try_into()
    }

    pub fn encryption_type(&self) -> Result<NcaEncryptionType, u8> {
        self.encryption_type.try_into()
    }

    pub fn is_patch_section(&self) -> bool {
        self.patch_info.relocation_tree_size != 0
    }

    pub fn exists_sparse_layer(&self) -> bool {
        self.sparse_info.generation != 0
    }

    pub fn exists_compression_layer(&self) -> bool {
        self.compression_info.table_offset != 0 && self.compression_info.table_size != 0
    }
}

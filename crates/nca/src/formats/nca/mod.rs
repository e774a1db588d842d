pub mod bucket_tree;
mod contents;
mod crypt_storage;
mod indirect_storage;
mod structs;
mod validation;
mod verification_storage;

use binrw::BinRead;
use snafu::{ResultExt, Snafu};
use std::io::Cursor;
use tracing::debug;

use crate::crypto::keyset::{KeyAreaKeyIndex, KeySet, MissingKeyError};
use crate::crypto::{AesKey, AesXtsKey, EncryptedAesKey};
use crate::formats::nca::bucket_tree::BucketTreeError;
use crate::ids::{RightsId, TitleId};
use crate::storage::{ReadableStorage, ReadableStorageExt, SharedStorage, StorageError};

pub use contents::{
    PatchBaseStorage, PatchedDataStorage, PatchedSectionStorage, RawDecryptedSectionStorage,
    RawEncryptedSectionStorage, VerifiedSectionStorage,
};
pub use crypt_storage::{make_counter, NcaCryptStorage};
pub use indirect_storage::IndirectStorage;
pub use structs::{
    DistributionType, IntegrityInfo, IvfcIntegrityInfo, IvfcIntegrityInfoLevel, NcaContentType,
    NcaEncryptionType, NcaFormatType, NcaFsHeader, NcaHashType, NcaHeader, NcaSectionType,
    NcaSignature, PatchInfo, SectionTableEntry, Sha256Hash, Sha256IntegrityInfo,
    Sha256IntegrityInfoLevel, NCA_SECTOR_SIZE,
};
pub use verification_storage::{
    HashLevel, IntegrityCheckLevel, IntegrityInfoError, IntegrityStorageType,
    NcaVerificationStorage, Validity,
};

#[derive(Snafu, Debug)]
#[snafu(visibility(pub(crate)))]
pub enum NcaError {
    /// NCA: Failed to read from the storage
    Storage { source: StorageError },
    /// NCA: Unsupported NCA version {version:#x}
    UnsupportedVersion { version: u8 },
    /// NCA: Failed to parse the NCA header
    NcaHeaderParsing { source: binrw::Error },
    /// NCA: Failed to parse the NCA FS header for section {index}
    FsHeaderParsing { index: usize, source: binrw::Error },
    /// NCA: Unable to decrypt the NCA header, the header key is probably wrong
    HeaderDecryption {},
    /// NCA: Missing a crypto key
    MissingKey { source: MissingKeyError },
    /// NCA: Section {index} ({start:#x}..{end:#x}) lies outside of the NCA of size {container_size:#x}
    SectionOutOfBounds {
        index: usize,
        start: u64,
        end: u64,
        container_size: u64,
    },
    /// NCA: FS header hash mismatch for section {index}
    FsHeaderHashMismatch { index: usize },
    /// NCA: Corrupt relocation table in section {index}
    CorruptRelocationTable {
        index: usize,
        source: BucketTreeError,
    },
    /// NCA: Corrupt AES-CTR generation table in section {index}
    CorruptEncryptionTable {
        index: usize,
        source: BucketTreeError,
    },
    /// NCA: Invalid integrity info in section {index}
    InvalidIntegrityInfo {
        index: usize,
        source: IntegrityInfoError,
    },
    /// NCA: Section {index} uses an unsupported {what}
    UnsupportedFormat { index: usize, what: String },
    /// NCA: There is no section {index}
    SectionIndex { index: usize },
    /// NCA: Section {index} is not enabled
    SectionNotEnabled { index: usize },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NcaVersion {
    Nca2,
    Nca3,
}

pub const SECTION_COUNT: usize = 4;

const ALL_HEADERS_SIZE: usize = 0xc00;
const NCA_HEADER_SIZE: usize = 0x400;
const HEADER_SECTOR_SIZE: usize = 0x200;
const MAGIC_OFFSET: usize = 0x200;
const FS_HEADER_VERSION: u16 = 2;

#[derive(Debug)]
struct AllNcaHeaders {
    /// The whole decrypted 0xc00-byte header.
    data: Vec<u8>,
    nca_header: NcaHeader,
    fs_headers: [Option<NcaFsHeader>; SECTION_COUNT],
    version: NcaVersion,
    is_decrypted: bool,
}

/// The decrypted content keys of an NCA.
#[derive(Debug, Clone, Copy)]
struct NcaContentKeys([AesKey; 4]);

impl NcaContentKeys {
    fn xts_key(&self) -> AesXtsKey {
        AesXtsKey::from_halves(self.0[0], self.0[1])
    }

    fn ctr_key(&self) -> AesKey {
        self.0[2]
    }
}

/// An opened NCA.
///
/// Only the headers are decrypted and parsed when the NCA is opened, sections are decrypted
/// while reading from the storages returned by [`Nca::open_section`].
#[derive(Debug)]
pub struct Nca<S: ReadableStorage> {
    storage: SharedStorage<S>,
    headers: AllNcaHeaders,
    content_keys: Result<NcaContentKeys, MissingKeyError>,
}

fn version_from_digit(digit: u8) -> Result<NcaVersion, NcaError> {
    match digit {
        b'2' => Ok(NcaVersion::Nca2),
        b'3' => Ok(NcaVersion::Nca3),
        version => UnsupportedVersionSnafu { version }.fail(),
    }
}

fn has_nca_magic(data: &[u8]) -> bool {
    &data[MAGIC_OFFSET..MAGIC_OFFSET + 3] == b"NCA"
}

/// A header is left plaintext by some tools: the magic reads fine and the first FS header has
/// a sensible version without any decryption.
fn is_plaintext_header(data: &[u8]) -> bool {
    has_nca_magic(data)
        && matches!(data[MAGIC_OFFSET + 3], b'2' | b'3')
        && u16::from_le_bytes([data[NCA_HEADER_SIZE], data[NCA_HEADER_SIZE + 1]])
            == FS_HEADER_VERSION
}

fn decrypt_headers(key_set: &KeySet, data: &mut [u8]) -> Result<NcaVersion, NcaError> {
    let key = key_set.header_key().context(MissingKeySnafu)?;

    let (nca_header, fs_headers) = data.split_at_mut(NCA_HEADER_SIZE);
    key.decrypt(nca_header, 0, HEADER_SECTOR_SIZE);

    if !has_nca_magic(nca_header) {
        return HeaderDecryptionSnafu.fail();
    }
    let version = version_from_digit(nca_header[MAGIC_OFFSET + 3])?;

    match version {
        NcaVersion::Nca2 => {
            // NCA2 encrypts every fs header as if it was sector 0
            for fs_header in fs_headers.chunks_exact_mut(HEADER_SECTOR_SIZE) {
                key.decrypt(fs_header, 0, HEADER_SECTOR_SIZE);
            }
        }
        NcaVersion::Nca3 => {
            key.decrypt(
                fs_headers,
                (NCA_HEADER_SIZE / HEADER_SECTOR_SIZE) as u64,
                HEADER_SECTOR_SIZE,
            );
        }
    }

    Ok(version)
}

fn parse_headers<S: ReadableStorage>(
    key_set: &KeySet,
    storage: &S,
) -> Result<AllNcaHeaders, NcaError> {
    let mut data = vec![0; ALL_HEADERS_SIZE];
    storage.read(0, &mut data).context(StorageSnafu)?;

    let (version, is_decrypted) = if is_plaintext_header(&data) {
        (version_from_digit(data[MAGIC_OFFSET + 3])?, true)
    } else {
        (decrypt_headers(key_set, &mut data)?, false)
    };

    let nca_header = NcaHeader::read(&mut Cursor::new(&data[..NCA_HEADER_SIZE]))
        .context(NcaHeaderParsingSnafu)?;

    let mut fs_headers = [None; SECTION_COUNT];
    for (index, fs_header_data) in data[NCA_HEADER_SIZE..]
        .chunks_exact(HEADER_SECTOR_SIZE)
        .enumerate()
    {
        if !nca_header.section_table[index].is_enabled() {
            continue;
        }

        if !nca_header.fs_header_hashes[index].verify(fs_header_data) {
            return FsHeaderHashMismatchSnafu { index }.fail();
        }

        fs_headers[index] = Some(
            NcaFsHeader::read(&mut Cursor::new(fs_header_data))
                .context(FsHeaderParsingSnafu { index })?,
        );
    }

    Ok(AllNcaHeaders {
        data,
        nca_header,
        fs_headers,
        version,
        is_decrypted,
    })
}

fn derive_content_keys(
    key_set: &KeySet,
    header: &NcaHeader,
) -> Result<NcaContentKeys, MissingKeyError> {
    let revision = header.master_key_revision();

    if header.has_rights_id() {
        let title_key = key_set.title_key(&header.rights_id)?;
        let title_kek = key_set.title_kek(revision)?;
        // the title key is used for every key slot
        Ok(NcaContentKeys([title_key.decrypt(title_kek); 4]))
    } else {
        let key_area_key = key_set.key_area_key(revision, header.key_area_key_index)?;
        Ok(NcaContentKeys(
            header
                .key_area
                .encrypted_keys
                .map(|key| key_area_key.decrypt_key(key)),
        ))
    }
}

impl<S: ReadableStorage> Nca<S> {
    /// Decrypts and parses the headers of the NCA in `storage`.
    ///
    /// Missing content keys are not an error here: they are reported when a section needing them
    /// is opened.
    pub fn new(key_set: &KeySet, storage: S) -> Result<Self, NcaError> {
        let headers = parse_headers(key_set, &storage)?;
        let content_keys = derive_content_keys(key_set, &headers.nca_header);

        debug!(
            title_id = %headers.nca_header.title_id,
            content_type = ?headers.nca_header.content_type,
            version = ?headers.version,
            is_decrypted = headers.is_decrypted,
            has_content_keys = content_keys.is_ok(),
            "Opened NCA"
        );

        Ok(Self {
            storage: storage.shared(),
            headers,
            content_keys,
        })
    }

    fn content_keys(&self) -> Result<NcaContentKeys, NcaError> {
        self.content_keys.clone().context(MissingKeySnafu)
    }

    fn check_section_index(index: usize) -> Result<(), NcaError> {
        if index >= SECTION_COUNT {
            return SectionIndexSnafu { index }.fail();
        }
        Ok(())
    }
}

/// Header accessors.
impl<S: ReadableStorage> Nca<S> {
    pub fn header(&self) -> &NcaHeader {
        &self.headers.nca_header
    }

    pub fn version(&self) -> NcaVersion {
        self.headers.version
    }

    /// Whether the header was stored without encryption.
    pub fn is_header_plaintext(&self) -> bool {
        self.headers.is_decrypted
    }

    /// The decrypted header, FS headers included.
    pub fn header_bytes(&self) -> &[u8] {
        &self.headers.data
    }

    pub fn content_type(&self) -> NcaContentType {
        self.headers.nca_header.content_type
    }

    pub fn distribution_type(&self) -> DistributionType {
        self.headers.nca_header.distribution_type
    }

    pub fn title_id(&self) -> TitleId {
        self.headers.nca_header.title_id
    }

    pub fn content_index(&self) -> u32 {
        self.headers.nca_header.content_index
    }

    pub fn sdk_version(&self) -> u32 {
        self.headers.nca_header.sdk_version
    }

    pub fn key_generation(&self) -> u8 {
        self.headers.nca_header.key_generation()
    }

    pub fn master_key_revision(&self) -> u8 {
        self.headers.nca_header.master_key_revision()
    }

    pub fn key_area_key_index(&self) -> KeyAreaKeyIndex {
        self.headers.nca_header.key_area_key_index
    }

    pub fn rights_id(&self) -> RightsId {
        self.headers.nca_header.rights_id
    }

    pub fn has_rights_id(&self) -> bool {
        self.headers.nca_header.has_rights_id()
    }

    /// The size of the NCA as declared in the header.
    pub fn nca_size(&self) -> u64 {
        self.headers.nca_header.nca_size
    }

    pub fn section_entry(&self, index: usize) -> Result<SectionTableEntry, NcaError> {
        Self::check_section_index(index)?;
        Ok(self.headers.nca_header.section_table[index])
    }

    pub fn is_section_enabled(&self, index: usize) -> bool {
        index < SECTION_COUNT && self.headers.nca_header.section_table[index].is_enabled()
    }

    pub fn section_start_offset(&self, index: usize) -> Result<u64, NcaError> {
        Ok(self.section_entry(index)?.start_offset())
    }

    pub fn section_size(&self, index: usize) -> Result<u64, NcaError> {
        Ok(self.section_entry(index)?.size())
    }

    pub fn fs_header(&self, index: usize) -> Result<&NcaFsHeader, NcaError> {
        Self::check_section_index(index)?;
        self.headers.fs_headers[index]
            .as_ref()
            .ok_or(NcaError::SectionNotEnabled { index })
    }

    pub fn fs_header_hash(&self, index: usize) -> Result<Sha256Hash, NcaError> {
        Self::check_section_index(index)?;
        Ok(self.headers.nca_header.fs_header_hashes[index])
    }

    /// An encrypted key from the key area. Slots 0 and 1 hold the XTS key, slot 2 the CTR key.
    pub fn encrypted_key(&self, index: usize) -> Result<EncryptedAesKey, NcaError> {
        self.headers
            .nca_header
            .key_area
            .encrypted_keys
            .get(index)
            .copied()
            .ok_or(NcaError::SectionIndex { index })
    }

    pub fn section_type(&self, index: usize) -> Option<NcaSectionType> {
        use NcaContentType::Program;
        use NcaSectionType::{Code, Data, Logo};

        match (index, self.content_type()) {
            (0, Program) => Some(Code),
            (1, Program) => Some(Data),
            (2, Program) => Some(Logo),
            (0, _) => Some(Data),
            _ => None,
        }
    }

    /// Index of the section holding `ty`, if the NCA has it.
    pub fn section_index(&self, ty: NcaSectionType) -> Option<usize> {
        (0..SECTION_COUNT)
            .find(|&index| self.section_type(index) == Some(ty) && self.is_section_enabled(index))
    }
}

use crate::formats::nca::bucket_tree::{BucketTreeHeader, TableOutOfBoundsSnafu};
use crate::formats::nca::crypt_storage::NcaCryptStorage;
use crate::formats::nca::indirect_storage::IndirectStorage;
use crate::formats::nca::structs::{NcaEncryptionType, NcaFsHeader};
use crate::formats::nca::verification_storage::{IntegrityCheckLevel, NcaVerificationStorage};
use crate::formats::nca::{
    CorruptEncryptionTableSnafu, CorruptRelocationTableSnafu, InvalidIntegrityInfoSnafu, Nca,
    NcaError, SectionOutOfBoundsSnafu, UnsupportedFormatSnafu,
};
use crate::storage::{
    DenyStorage, EitherStorage, ReadableStorage, ReadableStorageExt, SharedStorage, SliceStorage,
};
use snafu::ResultExt;
use tracing::debug;

pub type RawEncryptedSectionStorage<S> = SliceStorage<SharedStorage<S>>;
pub type RawDecryptedSectionStorage<S> = NcaCryptStorage<RawEncryptedSectionStorage<S>>;
pub type VerifiedSectionStorage<S> = NcaVerificationStorage<RawDecryptedSectionStorage<S>>;

/// The base side of a patched section: the base NCA's section, or a storage refusing every read
/// when the base NCA doesn't have the section.
pub type PatchBaseStorage<B> = EitherStorage<RawDecryptedSectionStorage<B>, DenyStorage>;
/// The patched data: relocated between the base and the patch, or the patch alone when the
/// section has no relocation table.
pub type PatchedDataStorage<B, S> = EitherStorage<
    IndirectStorage<PatchBaseStorage<B>, SharedStorage<RawDecryptedSectionStorage<S>>>,
    SharedStorage<RawDecryptedSectionStorage<S>>,
>;
pub type PatchedSectionStorage<B, S> = NcaVerificationStorage<PatchedDataStorage<B, S>>;

fn unsupported(index: usize, what: String) -> NcaError {
    UnsupportedFormatSnafu { index, what }.build()
}

/// Rejects the section features this decoder doesn't implement.
fn check_section_supported(index: usize, fs_header: &NcaFsHeader) -> Result<(), NcaError> {
    if let Err(value) = fs_header.encryption_type() {
        return Err(unsupported(index, format!("encryption type {}", value)));
    }
    if let Err(value) = fs_header.hash_type() {
        return Err(unsupported(index, format!("hash type {}", value)));
    }
    if let Err(value) = fs_header.format_type() {
        return Err(unsupported(index, format!("format type {}", value)));
    }
    if fs_header.exists_sparse_layer() {
        return Err(unsupported(index, "sparse layer".to_string()));
    }
    if fs_header.exists_compression_layer() {
        return Err(unsupported(index, "compression layer".to_string()));
    }
    Ok(())
}

impl<S: ReadableStorage> Nca<S> {
    /// The FS header of a section that can be opened, in the sense of the supported features.
    pub(super) fn supported_fs_header(&self, index: usize) -> Result<&NcaFsHeader, NcaError> {
        let fs_header = self.fs_header(index)?;
        check_section_supported(index, fs_header)?;
        Ok(fs_header)
    }

    /// Byte range of the section in the NCA, checked against both the size declared in the header
    /// and the size of the underlying storage.
    pub fn section_range(&self, index: usize) -> Result<(u64, u64), NcaError> {
        let entry = self.section_entry(index)?;
        let (start, end) = (entry.start_offset(), entry.end_offset());
        let container_size = std::cmp::min(self.nca_size(), self.storage.get_size());

        if end < start || end > container_size {
            return SectionOutOfBoundsSnafu {
                index,
                start,
                end,
                container_size,
            }
            .fail();
        }
        Ok((start, end))
    }

    /// The section exactly as stored in the NCA.
    pub fn open_encrypted_section(
        &self,
        index: usize,
    ) -> Result<RawEncryptedSectionStorage<S>, NcaError> {
        self.supported_fs_header(index)?;
        let (start, end) = self.section_range(index)?;

        // the range was checked against the storage size above
        self.storage
            .clone()
            .slice(start, end - start)
            .map_err(|_| NcaError::SectionOutOfBounds {
                index,
                start,
                end,
                container_size: self.storage.get_size(),
            })
    }

    /// The decrypted section, without any integrity checks.
    pub fn open_raw_section(&self, index: usize) -> Result<RawDecryptedSectionStorage<S>, NcaError> {
        let fs_header = self.supported_fs_header(index)?;
        let storage = self.open_encrypted_section(index)?;
        let start_offset = storage.offset();

        let encryption_type = fs_header
            .encryption_type()
            .map_err(|value| unsupported(index, format!("encryption type {}", value)))?;

        debug!(
            index,
            ?encryption_type,
            start_offset,
            size = storage.get_size(),
            "Opening NCA section"
        );

        Ok(match encryption_type {
            NcaEncryptionType::None => NcaCryptStorage::new_plaintext(storage),
            NcaEncryptionType::Xts => {
                NcaCryptStorage::new_xts(storage, self.content_keys()?.xts_key())
            }
            NcaEncryptionType::AesCtr => NcaCryptStorage::new_ctr(
                storage,
                self.content_keys()?.ctr_key(),
                fs_header.upper_counter,
                start_offset,
            ),
            NcaEncryptionType::AesCtrEx => NcaCryptStorage::new_ctr_ex(
                storage,
                self.content_keys()?.ctr_key(),
                fs_header.upper_counter,
                start_offset,
                &fs_header.patch_info,
            )
            .context(CorruptEncryptionTableSnafu { index })?,
        })
    }

    /// Opens a section for reading.
    ///
    /// With `raw` set, or for patch sections (their hash tree covers the patched data, see
    /// [`Nca::open_section_with_patch`]), the decrypted section is returned without verification.
    pub fn open_section(
        &self,
        index: usize,
        integrity_level: IntegrityCheckLevel,
        raw: bool,
    ) -> Result<VerifiedSectionStorage<S>, NcaError> {
        let fs_header = self.supported_fs_header(index)?;
        let storage = self.open_raw_section(index)?;

        if raw || fs_header.encryption_type() == Ok(NcaEncryptionType::AesCtrEx) {
            return Ok(NcaVerificationStorage::Plain(storage));
        }

        let integrity_info = fs_header
            .integrity_info()
            .context(InvalidIntegrityInfoSnafu { index })?;
        NcaVerificationStorage::new(storage, &integrity_info, integrity_level)
            .context(InvalidIntegrityInfoSnafu { index })
    }

    /// Opens section `index` of this patch NCA on top of the same section of `base`.
    ///
    /// Reads of ranges the relocation table maps to the base fail with
    /// [`StorageError::Inaccessible`](crate::storage::StorageError::Inaccessible) when `base`
    /// doesn't have the section.
    pub fn open_section_with_patch<B: ReadableStorage>(
        &self,
        index: usize,
        base: &Nca<B>,
        integrity_level: IntegrityCheckLevel,
    ) -> Result<PatchedSectionStorage<B, S>, NcaError> {
        let fs_header = self.supported_fs_header(index)?;
        let patch_storage = self.open_raw_section(index)?.shared();
        let patch_info = &fs_header.patch_info;

        let data = if !fs_header.is_patch_section() {
            EitherStorage::Right(patch_storage)
        } else {
            let base_storage = if base.is_section_enabled(index) {
                EitherStorage::Left(base.open_raw_section(index)?)
            } else {
                debug!(index, "Base NCA has no such section, denying reads from the base");
                EitherStorage::Right(DenyStorage::new(u64::MAX))
            };

            let header = BucketTreeHeader::parse(&patch_info.relocation_tree_header)
                .context(CorruptRelocationTableSnafu { index })?;
            let table = patch_storage
                .clone()
                .slice(
                    patch_info.relocation_tree_offset,
                    patch_info.relocation_tree_size,
                )
                .context(TableOutOfBoundsSnafu)
                .context(CorruptRelocationTableSnafu { index })?;

            EitherStorage::Left(
                IndirectStorage::new(base_storage, patch_storage, &table, &header)
                    .context(CorruptRelocationTableSnafu { index })?,
            )
        };

        let integrity_info = fs_header
            .integrity_info()
            .context(InvalidIntegrityInfoSnafu { index })?;
        NcaVerificationStorage::new(data, &integrity_info, integrity_level)
            .context(InvalidIntegrityInfoSnafu { index })
    }

    /// Whether [`Nca::open_section`] would succeed as far as headers and keys are concerned.
    pub fn can_open_section(&self, index: usize) -> bool {
        let Ok(fs_header) = self.supported_fs_header(index) else {
            return false;
        };
        if self.section_range(index).is_err() {
            return false;
        }

        match fs_header.encryption_type() {
            Ok(NcaEncryptionType::None) => true,
            Ok(_) => self.content_keys.is_ok(),
            Err(_) => false,
        }
    }
}

use crate::crypto::keyset::KeySet;
use crate::crypto::verify_rsa2048_pss_sha256;
use crate::formats::nca::structs::{IntegrityInfo, NcaEncryptionType};
use crate::formats::nca::verification_storage::{
    IntegrityCheckLevel, IntegrityInfoError, Validity, DIGEST_SIZE,
};
use crate::formats::nca::{
    InvalidIntegrityInfoSnafu, Nca, NcaError, StorageSnafu, MAGIC_OFFSET, NCA_HEADER_SIZE,
    SECTION_COUNT,
};
use crate::storage::{ReadableStorage, ReadableStorageExt, SliceStorage};
use sha2::{Digest, Sha256};
use snafu::ResultExt;
use tracing::warn;

const MAX_LOG2_BLOCK_SIZE: u32 = 30;
static ZEROES: [u8; 0x1000] = [0; 0x1000];

/// The first hash level of a section, checked against the section bounds.
fn level_slice<S: ReadableStorage>(
    storage: S,
    index: usize,
    offset: u64,
    size: u64,
) -> Result<SliceStorage<S>, NcaError> {
    storage
        .slice(offset, size)
        .map_err(|source| NcaError::InvalidIntegrityInfo {
            index,
            source: IntegrityInfoError::LevelOutOfBounds { source },
        })
}

/// Turns a missing key into [`Validity::MissingKey`].
fn missing_key_as_validity<T>(
    result: Result<T, NcaError>,
) -> Result<Result<T, Validity>, NcaError> {
    match result {
        Ok(value) => Ok(Ok(value)),
        Err(NcaError::MissingKey { .. }) => Ok(Err(Validity::MissingKey)),
        Err(e) => Err(e),
    }
}

fn validity_of(valid: bool) -> Validity {
    if valid {
        Validity::Valid
    } else {
        Validity::Invalid
    }
}

impl<S: ReadableStorage> Nca<S> {
    /// Checks the first hash level of a section against the master hash in its FS header.
    ///
    /// Patch sections can't be checked without the base NCA, for them only the consistency of the
    /// decrypted AES-CTR generation table is checked: [`Validity::Invalid`] means the section was
    /// decrypted with a wrong key or is corrupt.
    pub fn validate_section_master_hash(&self, index: usize) -> Result<Validity, NcaError> {
        let fs_header = self.supported_fs_header(index)?;
        let storage = match missing_key_as_validity(self.open_raw_section(index))? {
            Ok(storage) => storage,
            Err(validity) => return Ok(validity),
        };

        if fs_header.encryption_type() == Ok(NcaEncryptionType::AesCtrEx) {
            // the end offset in the L1 node header of the generation table
            let tree_offset = fs_header.patch_info.encryption_tree_offset;
            let mut end_offset = [0; 8];
            storage
                .read(tree_offset + 8, &mut end_offset)
                .context(StorageSnafu)?;

            return Ok(if u64::from_le_bytes(end_offset) != tree_offset {
                Validity::Invalid
            } else {
                Validity::Unchecked
            });
        }

        let integrity_info = fs_header
            .integrity_info()
            .context(InvalidIntegrityInfoSnafu { index })?;

        match integrity_info {
            IntegrityInfo::None => Ok(Validity::Unchecked),
            IntegrityInfo::Sha256(info) => {
                let level = info.level_info[0];
                let hash_table = level_slice(storage, index, level.offset, level.size)?
                    .read_all()
                    .context(StorageSnafu)?;

                Ok(validity_of(info.master_hash.verify(&hash_table)))
            }
            IntegrityInfo::Ivfc(info) => {
                let level = info.level_info[0];
                if level.block_size > MAX_LOG2_BLOCK_SIZE {
                    return Err(NcaError::InvalidIntegrityInfo {
                        index,
                        source: IntegrityInfoError::BlockSize { level: 1 },
                    });
                }
                let block_size = 1u64 << level.block_size;

                // the first block, zero-padded
                let size = std::cmp::min(level.size, block_size);
                let block = level_slice(storage, index, level.offset, size)?
                    .read_all()
                    .context(StorageSnafu)?;

                let mut hasher = Sha256::new();
                hasher.update(&block);
                let mut padding = block_size - size;
                while padding > 0 {
                    let len = std::cmp::min(padding, ZEROES.len() as u64);
                    hasher.update(&ZEROES[..len as usize]);
                    padding -= len;
                }

                Ok(validity_of(
                    hasher.finalize()[..] == info.master_hash.0[..DIGEST_SIZE],
                ))
            }
        }
    }

    /// Checks every block of a section against its hash tree.
    ///
    /// Patch sections fall back to [`Nca::validate_section_master_hash`].
    pub fn verify_section(&self, index: usize) -> Result<Validity, NcaError> {
        let fs_header = self.supported_fs_header(index)?;
        if fs_header.encryption_type() == Ok(NcaEncryptionType::AesCtrEx) {
            return self.validate_section_master_hash(index);
        }

        let storage = match missing_key_as_validity(self.open_section(
            index,
            IntegrityCheckLevel::IgnoreOnInvalid,
            false,
        ))? {
            Ok(storage) => storage,
            Err(validity) => return Ok(validity),
        };

        storage.validate(true).context(StorageSnafu)
    }

    /// Verifies every section that can be opened.
    ///
    /// Returns [`Validity::Invalid`] as soon as a section is invalid, [`Validity::Valid`] if every
    /// section could be checked and [`Validity::Unchecked`] if none of them could.
    pub fn verify_nca(&self) -> Result<Validity, NcaError> {
        let mut any_valid = false;

        for index in (0..SECTION_COUNT).filter(|&i| self.is_section_enabled(i)) {
            if !self.can_open_section(index) {
                warn!(index, "Unable to open NCA section, skipping verification");
                continue;
            }

            match self.verify_section(index)? {
                Validity::Invalid => {
                    warn!(index, "NCA section is invalid");
                    return Ok(Validity::Invalid);
                }
                Validity::Valid => any_valid = true,
                Validity::Unchecked | Validity::MissingKey => {}
            }
        }

        Ok(if any_valid {
            Validity::Valid
        } else {
            Validity::Unchecked
        })
    }

    fn signed_header_part(&self) -> &[u8] {
        &self.header_bytes()[MAGIC_OFFSET..NCA_HEADER_SIZE]
    }

    /// Checks the header signature made with the fixed key selected by the signature key
    /// generation.
    pub fn verify_signature1(&self, key_set: &KeySet) -> Validity {
        let generation = self.header().signature_key_generation;
        let Ok(modulus) = key_set.nca_header_fixed_key_modulus(generation) else {
            return Validity::MissingKey;
        };

        validity_of(verify_rsa2048_pss_sha256(
            modulus,
            &self.header().fixed_key_signature.0 .0,
            self.signed_header_part(),
        ))
    }

    /// Checks the header signature made with the key from the program's NPDM (ACID).
    pub fn verify_signature2(&self, modulus: &[u8]) -> Validity {
        validity_of(verify_rsa2048_pss_sha256(
            modulus,
            &self.header().npdm_signature.0 .0,
            self.signed_header_part(),
        ))
    }
}

use crate::formats::nca::verification_storage::{
    IntegrityCheckLevel, IntegrityStorageType, Validity, DIGEST_SIZE,
};
use crate::storage::{ReadableBlockStorage, ReadableBlockStorageExt, ReadableStorage, StorageError};
use digest::Digest;
use sha2::Sha256;
use std::ops::{Deref, DerefMut};
use std::sync::{Mutex, PoisonError};
use tracing::trace;

/// One level of a hash tree: every block of `storage` is checked against the digest stored for it
/// in `hash_storage`, the level above.
///
/// The outcome of each check is remembered, so a block is hashed at most once.
#[derive(Debug)]
pub struct IntegrityVerificationLevelStorage<S: ReadableBlockStorage, H: ReadableStorage> {
    storage: S,
    hash_storage: H,
    level: IntegrityCheckLevel,
    ty: IntegrityStorageType,
    block_statuses: Mutex<Vec<Validity>>,
}

impl<S: ReadableBlockStorage, H: ReadableStorage> IntegrityVerificationLevelStorage<S, H> {
    pub fn new(
        storage: S,
        hash_storage: H,
        level: IntegrityCheckLevel,
        ty: IntegrityStorageType,
    ) -> Self {
        let block_statuses = vec![Validity::Unchecked; storage.block_count() as usize];

        Self {
            storage,
            hash_storage,
            level,
            ty,
            block_statuses: Mutex::new(block_statuses),
        }
    }

    pub fn hash_storage(&self) -> &H {
        &self.hash_storage
    }

    /// Validity of every block of this level, as far as it has been checked.
    pub fn block_validities(&self) -> Vec<Validity> {
        self.block_statuses
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn compute_hash(&self, data: &[u8]) -> [u8; DIGEST_SIZE] {
        let mut hasher = Sha256::new();
        if let IntegrityStorageType::Save { salt } = self.ty {
            hasher.update(salt);
        }
        hasher.update(data);

        let mut hash = [0; DIGEST_SIZE];
        hash.copy_from_slice(&hasher.finalize());
        if let IntegrityStorageType::Save { .. } = self.ty {
            hash[DIGEST_SIZE - 1] |= 0x80;
        }
        hash
    }

    /// Checks every block of this level, and of the levels above it if `recursive` is set.
    ///
    /// Stops at the first invalid block.
    pub fn validate(&self, recursive: bool) -> Result<Validity, StorageError>
    where
        H: HashSource,
    {
        if self.level == IntegrityCheckLevel::None {
            return Ok(Validity::Unchecked);
        }

        if recursive && self.hash_storage.validate_levels()? == Validity::Invalid {
            return Ok(Validity::Invalid);
        }

        let mut buf = vec![0; self.block_size() as usize];
        for block_index in 0..self.block_count() {
            match self.read_block(block_index, &mut buf) {
                Ok(()) => {}
                Err(StorageError::IntegrityCheckFailed { .. }) => return Ok(Validity::Invalid),
                Err(e) => return Err(e),
            }

            let status = self
                .block_statuses
                .lock()
                .unwrap_or_else(PoisonError::into_inner)[block_index as usize];
            if status == Validity::Invalid {
                return Ok(Validity::Invalid);
            }
        }

        Ok(Validity::Valid)
    }
}

/// The storage holding the digests of a level: either the master hash or another verified level.
pub trait HashSource: ReadableStorage {
    /// Checks every block this storage is made of.
    fn validate_levels(&self) -> Result<Validity, StorageError>;
}

enum BlockBuffer<'a> {
    Borrowed(&'a mut [u8]),
    Owned(Vec<u8>),
}

impl Deref for BlockBuffer<'_> {
    type Target = [u8];

    fn deref(&self) -> &Self::Target {
        match self {
            BlockBuffer::Borrowed(buf) => buf,
            BlockBuffer::Owned(buf) => buf,
        }
    }
}

impl DerefMut for BlockBuffer<'_> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        match self {
            BlockBuffer::Borrowed(buf) => buf,
            BlockBuffer::Owned(buf) => buf,
        }
    }
}

impl<S: ReadableBlockStorage, H: ReadableStorage> ReadableBlockStorage
    for IntegrityVerificationLevelStorage<S, H>
{
    fn block_size(&self) -> u64 {
        self.storage.block_size()
    }

    fn read_block(&self, block_index: u64, buf: &mut [u8]) -> Result<(), StorageError> {
        if block_index >= self.block_count() {
            return Err(StorageError::OutOfBounds {});
        }
        let block_size = self.storage.block_size();

        // handle the trailing block, which may be smaller than the block size
        let current_block_size = self.nth_block_size(block_index);

        // handle partial block reads
        let mut block_buf = if buf.len() as u64 == block_size {
            BlockBuffer::Borrowed(buf)
        } else {
            BlockBuffer::Owned(vec![0; block_size as usize])
        };

        self.storage
            .read_block(block_index, &mut block_buf[..current_block_size as usize])?;

        if self.level != IntegrityCheckLevel::None {
            let mut block_statuses = self
                .block_statuses
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            let block_status = &mut block_statuses[block_index as usize];

            if *block_status == Validity::Unchecked {
                let bytes_to_hash = match self.ty {
                    // HierarchicalSha256 does not pad the last block
                    IntegrityStorageType::HierarchicalSha256 => current_block_size,
                    IntegrityStorageType::Ivfc | IntegrityStorageType::Save { .. } => {
                        // pad the unused part of the buffer (handling the last block, which may be smaller than the block size)
                        block_buf[current_block_size as usize..].fill(0);
                        block_size
                    }
                };

                let hash = self.compute_hash(&block_buf[..bytes_to_hash as usize]);
                let mut expected_hash = [0; DIGEST_SIZE];
                self.hash_storage
                    .read(block_index * DIGEST_SIZE as u64, &mut expected_hash)?;

                *block_status = if hash == expected_hash {
                    Validity::Valid
                } else {
                    trace!(block_index, "Hash mismatch");
                    Validity::Invalid
                };
            }

            if *block_status == Validity::Invalid
                && self.level == IntegrityCheckLevel::ErrorOnInvalid
            {
                return Err(StorageError::IntegrityCheckFailed {
                    offset: block_index * block_size,
                });
            }
        }

        if let BlockBuffer::Owned(block_buf) = block_buf {
            let len = std::cmp::min(buf.len(), block_buf.len());
            buf[..len].copy_from_slice(&block_buf[..len]);
        }
        Ok(())
    }

    fn get_size(&self) -> u64 {
        self.storage.get_size()
    }
}

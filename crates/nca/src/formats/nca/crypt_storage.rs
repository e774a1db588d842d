use crate::crypto::{AesKey, AesXtsKey};
use crate::formats::nca::bucket_tree::{
    BucketTree, BucketTreeError, BucketTreeHeader, EncryptionEntry,
    TableOutOfBoundsSnafu,
};
use crate::formats::nca::structs::PatchInfo;
use crate::storage::block_transforms::{
    AesCtrBlockTransform, AesCtrExBlockTransform, AesXtsBlockTransform, CounterGeneration,
};
use crate::storage::{
    AesCtrExStorage, AesCtrStorage, AesXtsStorage, BlockAdapterStorage, CachedStorage,
    ConcatStorage2, LinearAdapterStorage, ReadableStorage, ReadableStorageExt, SharedStorage,
    SliceStorage, StorageError,
};
use snafu::ResultExt;
use std::sync::Arc;
use tracing::debug;

const AES_BLOCK_SIZE: u64 = 0x10;
const XTS_SECTOR_SIZE: u64 = 0x200;

const CACHE_BLOCK_SIZE: u64 = 0x4000;
const CACHE_BLOCK_COUNT: u64 = 4;

type CtrStorage<S> = LinearAdapterStorage<AesCtrStorage<BlockAdapterStorage<S>>>;
type CtrExStorage<S> = LinearAdapterStorage<AesCtrExStorage<BlockAdapterStorage<S>>>;
type XtsStorage<S> = LinearAdapterStorage<AesXtsStorage<BlockAdapterStorage<S>>>;

type PatchRegion<S> = SliceStorage<SharedStorage<S>>;
type PatchBucketStorage<S> = SharedStorage<CachedStorage<CtrStorage<PatchRegion<S>>>>;

/// Decrypted view of a section's raw bytes.
#[derive(Debug)]
pub enum NcaCryptStorage<S: ReadableStorage> {
    Plaintext(S),
    Xts(XtsStorage<S>),
    AesCtr(CachedStorage<CtrStorage<S>>),
    /// The data region followed by the (plain CTR encrypted) bucket trees.
    AesCtrEx(ConcatStorage2<CtrExStorage<PatchRegion<S>>, PatchBucketStorage<S>>),
}

/// The initial AES-CTR counter for data at `offset` of the NCA.
///
/// The high 8 bytes come from the FS header, the low 8 bytes are the big-endian offset in AES
/// blocks.
pub fn make_counter(upper_counter: u64, offset: u64) -> [u8; 0x10] {
    let mut nonce = [0; 0x10];
    nonce[..8].copy_from_slice(&upper_counter.to_be_bytes());
    nonce[8..].copy_from_slice(&(offset / AES_BLOCK_SIZE).to_be_bytes());
    nonce
}

fn ctr_storage<S: ReadableStorage>(storage: S, key: AesKey, nonce: [u8; 0x10]) -> CtrStorage<S> {
    let block_adapter = BlockAdapterStorage::new(storage, AES_BLOCK_SIZE);
    let transform = AesCtrBlockTransform::new(key, nonce);
    LinearAdapterStorage::new(AesCtrStorage::new(block_adapter, transform))
}

impl<S: ReadableStorage> NcaCryptStorage<S> {
    pub fn new_plaintext(storage: S) -> Self {
        Self::Plaintext(storage)
    }

    /// Sector numbers are relative to the start of the section.
    pub fn new_xts(storage: S, key: AesXtsKey) -> Self {
        let block_adapter = BlockAdapterStorage::new(storage, XTS_SECTOR_SIZE);
        let transform = AesXtsBlockTransform::new(key);
        Self::Xts(LinearAdapterStorage::new(AesXtsStorage::new(
            block_adapter,
            transform,
        )))
    }

    /// `start_offset` is the offset of the section in the NCA.
    pub fn new_ctr(storage: S, key: AesKey, upper_counter: u64, start_offset: u64) -> Self {
        // the section decryptor itself will add the inner offset
        let nonce = make_counter(upper_counter, start_offset);

        Self::AesCtr(
            ctr_storage(storage, key, nonce).cached(CACHE_BLOCK_SIZE, CACHE_BLOCK_COUNT),
        )
    }

    /// Decrypts a patch section: the data region uses the generations from the encryption tree,
    /// the trees themselves are plain AES-CTR.
    pub fn new_ctr_ex(
        storage: S,
        key: AesKey,
        upper_counter: u64,
        start_offset: u64,
        patch_info: &PatchInfo,
    ) -> Result<Self, BucketTreeError> {
        let section_size = storage.get_size();
        let data_size = patch_info.relocation_tree_offset;
        if data_size % AES_BLOCK_SIZE != 0 {
            return Err(BucketTreeError::Misaligned {
                offset: data_size,
                alignment: AES_BLOCK_SIZE,
            });
        }

        let storage = storage.shared();
        let data_region = storage
            .clone()
            .slice(0, data_size)
            .context(TableOutOfBoundsSnafu)?;
        let bucket_region = storage
            .slice(data_size, section_size - data_size)
            .context(TableOutOfBoundsSnafu)?;

        let bucket_storage = ctr_storage(
            bucket_region,
            key,
            make_counter(upper_counter, start_offset + data_size),
        )
        .cached(CACHE_BLOCK_SIZE, CACHE_BLOCK_COUNT)
        .shared();

        let header = BucketTreeHeader::parse(&patch_info.encryption_tree_header)?;
        let tree_offset = patch_info
            .encryption_tree_offset
            .checked_sub(data_size)
            .ok_or(BucketTreeError::InvalidTreeOffset {
                offset: patch_info.encryption_tree_offset,
            })?;
        let tree_size = bucket_storage.get_size().saturating_sub(tree_offset);
        let tree_storage = bucket_storage
            .clone()
            .slice(tree_offset, tree_size)
            .context(TableOutOfBoundsSnafu)?;
        let tree = BucketTree::<EncryptionEntry>::read(&tree_storage, &header)?;

        let generations = tree
            .entries()
            .iter()
            .map(|entry| {
                let offset = entry.offset as u64;
                if offset % AES_BLOCK_SIZE != 0 {
                    return Err(BucketTreeError::Misaligned {
                        offset,
                        alignment: AES_BLOCK_SIZE,
                    });
                }
                Ok(CounterGeneration {
                    offset,
                    encrypted: entry.is_encrypted(),
                    generation: entry.generation,
                })
            })
            .collect::<Result<Arc<[_]>, _>>()?;

        debug!(
            generation_count = generations.len(),
            data_size,
            "Read AES-CTR generation table"
        );

        let block_adapter = BlockAdapterStorage::new(data_region, AES_BLOCK_SIZE);
        let transform =
            AesCtrExBlockTransform::new(key, make_counter(upper_counter, start_offset), generations);
        let data_storage =
            LinearAdapterStorage::new(AesCtrExStorage::new(block_adapter, transform));

        Ok(Self::AesCtrEx(ConcatStorage2::new(
            data_storage,
            bucket_storage,
        )))
    }
}

impl<S: ReadableStorage> ReadableStorage for NcaCryptStorage<S> {
    fn read(&self, offset: u64, buf: &mut [u8]) -> Result<(), StorageError> {
        match self {
            NcaCryptStorage::Plaintext(storage) => storage.read(offset, buf),
            NcaCryptStorage::Xts(storage) => storage.read(offset, buf),
            NcaCryptStorage::AesCtr(storage) => storage.read(offset, buf),
            NcaCryptStorage::AesCtrEx(storage) => storage.read(offset, buf),
        }
    }

    fn get_size(&self) -> u64 {
        match self {
            NcaCryptStorage::Plaintext(storage) => storage.get_size(),
            NcaCryptStorage::Xts(storage) => storage.get_size(),
            NcaCryptStorage::AesCtr(storage) => storage.get_size(),
            NcaCryptStorage::AesCtrEx(storage) => storage.get_size(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::VecStorage;

    #[test]
    fn counter_layout() {
        let counter = make_counter(0x0102_0304_0506_0708, 0x4000);
        assert_eq!(
            counter,
            [1, 2, 3, 4, 5, 6, 7, 8, 0, 0, 0, 0, 0, 0, 0x04, 0x00]
        );
    }

    #[test]
    fn ctr_section_decrypts_at_any_offset() {
        let key = AesKey::from([0x10; 0x10]);
        let plaintext = (0..0x600).map(|i| (i / 3) as u8).collect::<Vec<_>>();
        let mut encrypted = plaintext.clone();
        key.apply_ctr(&mut encrypted, &make_counter(7, 0xc00));

        let storage = NcaCryptStorage::new_ctr(VecStorage::new(encrypted), key, 7, 0xc00);
        assert_eq!(storage.read_all().unwrap(), plaintext);

        let mut buf = [0; 0x23];
        storage.read(0x1f5, &mut buf).unwrap();
        assert_eq!(&buf, &plaintext[0x1f5..0x218]);
    }

    #[test]
    fn xts_section_uses_relative_sectors() {
        let key = AesXtsKey::from_halves(AesKey::from([3; 0x10]), AesKey::from([4; 0x10]));
        let plaintext = (0..0x400).map(|i| (i % 7) as u8).collect::<Vec<_>>();
        let mut encrypted = plaintext.clone();
        key.encrypt(&mut encrypted, 0, 0x200);

        let storage = NcaCryptStorage::new_xts(VecStorage::new(encrypted), key);
        let mut buf = [0; 0x20];
        storage.read(0x1f0, &mut buf).unwrap();
        assert_eq!(&buf, &plaintext[0x1f0..0x210]);
    }
}

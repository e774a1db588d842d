use num_integer::Integer;
use snafu::Snafu;

mod block_adapter_storage;
mod block_cache_storage;
mod block_transform_storage;
mod concat_storage;
mod deny_storage;
mod either_storage;
mod io_storage;
mod linear_adapter_storage;
mod shared_storage;
mod slice_storage;
mod vec_storage;

pub use block_adapter_storage::BlockAdapterStorage;
pub use block_cache_storage::BlockCacheStorage;
pub use block_transform_storage::{
    block_transforms, AesCtrExStorage, AesCtrStorage, AesXtsStorage, BlockTransform,
    BlockTransformStorage,
};
pub use concat_storage::ConcatStorage2;
pub use deny_storage::DenyStorage;
pub use either_storage::EitherStorage;
pub use io_storage::{FileRoStorage, RoIoStorage};
pub use linear_adapter_storage::LinearAdapterStorage;
pub use shared_storage::SharedStorage;
pub use slice_storage::{SliceStorage, SliceStorageError};
pub use vec_storage::VecStorage;

/// A read-through block cache presented as a linear storage.
pub type CachedStorage<S> = LinearAdapterStorage<BlockCacheStorage<BlockAdapterStorage<S>>>;

pub trait ReadableStorage: Send + Sync {
    fn read(&self, offset: u64, buf: &mut [u8]) -> Result<(), StorageError>;
    fn get_size(&self) -> u64;
}

pub trait ReadableBlockStorage: Send + Sync {
    fn block_size(&self) -> u64;
    /// Reads block at given index.
    ///
    /// Note: this allows reading partial blocks at the end of the storage.
    fn read_block(&self, block_index: u64, buf: &mut [u8]) -> Result<(), StorageError>;
    /// Gets size of storage in bytes.
    ///
    /// Note: this does NOT have to be a multiple of block size.
    fn get_size(&self) -> u64;

    fn read_block_bulk(&self, block_index: u64, buf: &mut [u8]) -> Result<(), StorageError> {
        let block_size = self.block_size();
        let block_count = Integer::div_ceil(&(buf.len() as u64), &block_size);
        for i in 0..block_count {
            let buf = &mut buf[(i * block_size) as usize..];
            let read_size = std::cmp::min(block_size, buf.len() as u64);
            self.read_block(block_index + i, &mut buf[..read_size as usize])?;
        }
        Ok(())
    }
}

pub trait ReadableStorageExt: ReadableStorage {
    fn slice(self, offset: u64, size: u64) -> Result<SliceStorage<Self>, SliceStorageError>
    where
        Self: Sized,
    {
        SliceStorage::new(self, offset, size)
    }

    fn shared(self) -> SharedStorage<Self>
    where
        Self: Sized,
    {
        SharedStorage::new(self)
    }

    /// Puts a block cache with `blocks_in_cache` blocks of `block_size` bytes in front of the storage.
    fn cached(self, block_size: u64, blocks_in_cache: u64) -> CachedStorage<Self>
    where
        Self: Sized,
    {
        LinearAdapterStorage::new(BlockCacheStorage::new(
            BlockAdapterStorage::new(self, block_size),
            blocks_in_cache,
        ))
    }

    fn read_all(&self) -> Result<Vec<u8>, StorageError> {
        let mut buf = vec![0; self.get_size() as usize];
        self.read(0, &mut buf)?;
        Ok(buf)
    }
}

pub trait ReadableBlockStorageExt: ReadableBlockStorage {
    fn block_count(&self) -> u64 {
        Integer::div_ceil(&self.get_size(), &self.block_size())
    }

    fn nth_block_size(&self, block_index: u64) -> u64 {
        assert!(block_index < self.block_count());
        if block_index == self.block_count() - 1 {
            // the last block may be smaller than the block size
            // compute its size
            ((self.get_size() - 1) % self.block_size()) + 1
        } else {
            self.block_size()
        }
    }
}

impl<T: ReadableStorage> ReadableStorageExt for T {}
impl<T: ReadableBlockStorage> ReadableBlockStorageExt for T {}

#[derive(Snafu, Debug)]
pub enum StorageError {
    #[snafu(display("IO error in IoStorage during {}: {}", operation, source))]
    Io {
        source: std::io::Error,
        operation: &'static str,
    },
    #[snafu(display("Attempt to read from an inaccessible storage at offset {:#x}", offset))]
    Inaccessible { offset: u64 },
    #[snafu(display("Attempt to read or write to a storage out of bounds"))]
    OutOfBounds {},
    #[snafu(display("Integrity check failed for block at offset {:#x}", offset))]
    IntegrityCheckFailed { offset: u64 },
    #[snafu(display("A storage requiring aligned access was accessed with an unaligned offset"))]
    UnalignedAccess {},
}

use crate::storage::{ReadableBlockStorage, ReadableBlockStorageExt, ReadableStorage, StorageError};

/// Presents a linear storage as a sequence of `block_size` blocks.
#[derive(Debug)]
pub struct BlockAdapterStorage<S: ReadableStorage> {
    storage: S,
    block_size: u64,
}

impl<S: ReadableStorage> BlockAdapterStorage<S> {
    pub fn new(storage: S, block_size: u64) -> Self {
        assert_ne!(block_size, 0, "Block size must be non-zero");
        Self {
            storage,
            block_size,
        }
    }

    pub fn inner(&self) -> &S {
        &self.storage
    }
}

impl<S: ReadableStorage> ReadableBlockStorage for BlockAdapterStorage<S> {
    fn block_size(&self) -> u64 {
        self.block_size
    }

    fn read_block(&self, block_index: u64, buf: &mut [u8]) -> Result<(), StorageError> {
        if block_index >= self.block_count() {
            return Err(StorageError::OutOfBounds {});
        }
        // the trailing block may be shorter, callers may pass a full-sized buffer for it
        let read_size = std::cmp::min(buf.len() as u64, self.nth_block_size(block_index));
        let offset = block_index * self.block_size;
        self.storage.read(offset, &mut buf[..read_size as usize])
    }

    fn get_size(&self) -> u64 {
        self.storage.get_size()
    }

    fn read_block_bulk(&self, block_index: u64, buf: &mut [u8]) -> Result<(), StorageError> {
        let offset = block_index * self.block_size;
        self.storage.read(offset, buf)
    }
}

use crate::storage::{ReadableBlockStorage, ReadableBlockStorageExt, StorageError};
use mini_moka::sync::{Cache, CacheBuilder};
use std::fmt;
use std::sync::Arc;

/// Keeps the most recently read blocks of the inner storage in memory.
///
/// Purely a performance layer: the cache is owned by this view and never shared.
pub struct BlockCacheStorage<S> {
    storage: S,
    cache: Cache<u64, Arc<Vec<u8>>>,
}

impl<S: ReadableBlockStorage> BlockCacheStorage<S> {
    pub fn new(storage: S, blocks_in_cache: u64) -> Self {
        let cache = CacheBuilder::new(blocks_in_cache).build();

        Self { storage, cache }
    }
}

impl<S: ReadableBlockStorage> ReadableBlockStorage for BlockCacheStorage<S> {
    fn block_size(&self) -> u64 {
        self.storage.block_size()
    }

    fn read_block(&self, block_index: u64, buf: &mut [u8]) -> Result<(), StorageError> {
        if block_index >= self.block_count() {
            return Err(StorageError::OutOfBounds {});
        }
        let block_size = self.nth_block_size(block_index) as usize;
        let buf_len = buf.len();
        let buf = &mut buf[..std::cmp::min(block_size, buf_len)];

        match self.cache.get(&block_index) {
            Some(content) => {
                buf.copy_from_slice(&content[..buf.len()]);
                Ok(())
            }
            None => {
                let mut content = vec![0; block_size];
                self.storage.read_block(block_index, &mut content)?;
                buf.copy_from_slice(&content[..buf.len()]);
                self.cache.insert(block_index, Arc::new(content));
                Ok(())
            }
        }
    }

    fn get_size(&self) -> u64 {
        self.storage.get_size()
    }
}

impl<S: fmt::Debug> fmt::Debug for BlockCacheStorage<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BlockCacheStorage")
            .field("storage", &self.storage)
            .finish()
    }
}

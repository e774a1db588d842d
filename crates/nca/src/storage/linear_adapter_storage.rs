use crate::storage::{ReadableBlockStorage, ReadableStorage, StorageError};

/// Presents a block storage as a linear one, handling unaligned heads and tails of reads.
#[derive(Debug)]
pub struct LinearAdapterStorage<S: ReadableBlockStorage> {
    storage: S,
}

impl<S: ReadableBlockStorage> LinearAdapterStorage<S> {
    pub fn new(storage: S) -> Self {
        Self { storage }
    }

    pub fn inner(&self) -> &S {
        &self.storage
    }
}

impl<S: ReadableBlockStorage> ReadableStorage for LinearAdapterStorage<S> {
    fn read(&self, mut offset: u64, mut buf: &mut [u8]) -> Result<(), StorageError> {
        if offset
            .checked_add(buf.len() as u64)
            .map_or(true, |end| end > self.storage.get_size())
        {
            return Err(StorageError::OutOfBounds {});
        }
        if buf.is_empty() {
            return Ok(());
        }

        let block_size = self.storage.block_size();
        let mut block_buffer = vec![0u8; block_size as usize];

        // read head (block-unaligned start)
        let head_block_offset = offset % block_size;
        if head_block_offset != 0 {
            let head_block_index = offset / block_size;
            self.storage
                .read_block(head_block_index, &mut block_buffer)?;
            let head_block_size = block_size - head_block_offset;
            let head_block_size = std::cmp::min(head_block_size, buf.len() as u64);
            buf[..head_block_size as usize].copy_from_slice(
                &block_buffer[head_block_offset as usize..][..head_block_size as usize],
            );

            offset += head_block_size;
            buf = &mut buf[head_block_size as usize..];
        }

        // read body (block-aligned center)
        let body_block_count = buf.len() / block_size as usize;
        if body_block_count != 0 {
            self.storage.read_block_bulk(
                offset / block_size,
                &mut buf[..body_block_count * block_size as usize],
            )?;

            offset += body_block_count as u64 * block_size;
            buf = &mut buf[body_block_count * block_size as usize..];
        }

        // read tail (block-unaligned end)
        if !buf.is_empty() {
            let tail_block_index = offset / block_size;
            self.storage
                .read_block(tail_block_index, &mut block_buffer)?;
            buf.copy_from_slice(&block_buffer[..buf.len()]);
        }

        Ok(())
    }

    fn get_size(&self) -> u64 {
        self.storage.get_size()
    }
}

use crate::storage::{ReadableStorage, StorageError};
use snafu::Snafu;

/// A window of `size` bytes starting at `offset` of the inner storage.
#[derive(Debug)]
pub struct SliceStorage<S> {
    storage: S,
    offset: u64,
    size: u64,
}

#[derive(Snafu, Debug)]
pub enum SliceStorageError {
    #[snafu(display("Slice offset {:#x} is outside of the storage (size {:#x})", offset, bounds))]
    OffsetOutOfBounds { offset: u64, bounds: u64 },
    #[snafu(display(
        "Slice of {:#x} bytes at {:#x} does not fit into the storage (size {:#x})",
        size,
        offset,
        bounds
    ))]
    SizeOutOfBounds { offset: u64, size: u64, bounds: u64 },
}

impl<S: ReadableStorage> SliceStorage<S> {
    pub fn new(storage: S, offset: u64, size: u64) -> Result<Self, SliceStorageError> {
        let bounds = storage.get_size();
        if offset > bounds {
            return Err(SliceStorageError::OffsetOutOfBounds { offset, bounds });
        }
        if offset.checked_add(size).map_or(true, |end| end > bounds) {
            return Err(SliceStorageError::SizeOutOfBounds {
                offset,
                size,
                bounds,
            });
        }

        Ok(Self {
            storage,
            offset,
            size,
        })
    }

    pub fn offset(&self) -> u64 {
        self.offset
    }

    pub fn into_inner(self) -> S {
        self.storage
    }
}

impl<S: ReadableStorage> ReadableStorage for SliceStorage<S> {
    fn read(&self, offset: u64, buf: &mut [u8]) -> Result<(), StorageError> {
        if offset
            .checked_add(buf.len() as u64)
            .map_or(true, |end| end > self.size)
        {
            return Err(StorageError::OutOfBounds {});
        }
        self.storage.read(self.offset + offset, buf)
    }

    fn get_size(&self) -> u64 {
        self.size
    }
}

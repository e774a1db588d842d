use crate::storage::{ReadableStorage, StorageError};
use std::fmt::Debug;

/// An in-memory storage. Used for master hashes and in tests.
pub struct VecStorage {
    data: Vec<u8>,
}

impl Debug for VecStorage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VecStorage")
            .field("size", &self.data.len())
            .finish()
    }
}

impl VecStorage {
    pub fn new(data: Vec<u8>) -> Self {
        Self { data }
    }
}

impl ReadableStorage for VecStorage {
    fn read(&self, offset: u64, buf: &mut [u8]) -> Result<(), StorageError> {
        let start = usize::try_from(offset).map_err(|_| StorageError::OutOfBounds {})?;
        let source = start
            .checked_add(buf.len())
            .and_then(|end| self.data.get(start..end))
            .ok_or(StorageError::OutOfBounds {})?;
        buf.copy_from_slice(source);
        Ok(())
    }

    fn get_size(&self) -> u64 {
        self.data.len() as u64
    }
}

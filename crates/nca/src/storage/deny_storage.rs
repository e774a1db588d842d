use crate::storage::{ReadableStorage, StorageError};

/// A storage of known size that refuses every read.
///
/// Stands in for the base of a patch whose base NCA lacks the patched section: reads that the
/// relocation table maps to the base fail instead of returning made-up data.
#[derive(Debug)]
pub struct DenyStorage {
    size: u64,
}

impl DenyStorage {
    pub fn new(size: u64) -> Self {
        Self { size }
    }
}

impl ReadableStorage for DenyStorage {
    fn read(&self, offset: u64, buf: &mut [u8]) -> Result<(), StorageError> {
        if offset
            .checked_add(buf.len() as u64)
            .map_or(true, |end| end > self.size)
        {
            return Err(StorageError::OutOfBounds {});
        }

        Err(StorageError::Inaccessible { offset })
    }

    fn get_size(&self) -> u64 {
        self.size
    }
}

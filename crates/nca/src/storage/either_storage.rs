use crate::storage::{ReadableStorage, StorageError};

/// One of two storage types, picked when a section is opened.
#[derive(Debug, Clone)]
pub enum EitherStorage<L: ReadableStorage, R: ReadableStorage> {
    Left(L),
    Right(R),
}

impl<L: ReadableStorage, R: ReadableStorage> EitherStorage<L, R> {
    fn as_storage(&self) -> &dyn ReadableStorage {
        match self {
            Self::Left(storage) => storage,
            Self::Right(storage) => storage,
        }
    }
}

impl<L: ReadableStorage, R: ReadableStorage> ReadableStorage for EitherStorage<L, R> {
    fn read(&self, offset: u64, buf: &mut [u8]) -> Result<(), StorageError> {
        self.as_storage().read(offset, buf)
    }

    fn get_size(&self) -> u64 {
        self.as_storage().get_size()
    }
}

use crate::storage::{ReadableStorage, StorageError};
use std::ops::Deref;
use std::sync::Arc;

/// A cheaply clonable handle to a storage.
///
/// The NCA container, the sections of one NCA and their bucket trees read through clones of one
/// handle.
#[derive(Debug)]
pub struct SharedStorage<S: ReadableStorage>(Arc<S>);

impl<S: ReadableStorage> SharedStorage<S> {
    pub fn new(storage: S) -> Self {
        Self(Arc::new(storage))
    }

    /// Number of handles to the storage, including this one.
    pub fn handle_count(&self) -> usize {
        Arc::strong_count(&self.0)
    }
}

impl<S: ReadableStorage> Clone for SharedStorage<S> {
    fn clone(&self) -> Self {
        Self(Arc::clone(&self.0))
    }
}

impl<S: ReadableStorage> Deref for SharedStorage<S> {
    type Target = S;

    fn deref(&self) -> &S {
        &self.0
    }
}

impl<S: ReadableStorage> ReadableStorage for SharedStorage<S> {
    fn read(&self, offset: u64, buf: &mut [u8]) -> Result<(), StorageError> {
        self.0.read(offset, buf)
    }

    fn get_size(&self) -> u64 {
        self.0.get_size()
    }
}

use crate::storage::{ReadableStorage, StorageError};

/// `first` immediately followed by `second`.
///
/// Used for patch sections, where the generation-encrypted data region is followed by the plain
/// AES-CTR bucket trees.
#[derive(Debug)]
pub struct ConcatStorage2<First, Second> {
    first: First,
    second: Second,
    /// Size of `first`, where `second` begins.
    split: u64,
}

impl<First: ReadableStorage, Second: ReadableStorage> ConcatStorage2<First, Second> {
    pub fn new(first: First, second: Second) -> Self {
        let split = first.get_size();
        Self {
            first,
            second,
            split,
        }
    }
}

impl<First: ReadableStorage, Second: ReadableStorage> ReadableStorage
    for ConcatStorage2<First, Second>
{
    fn read(&self, offset: u64, buf: &mut [u8]) -> Result<(), StorageError> {
        if offset
            .checked_add(buf.len() as u64)
            .map_or(true, |end| end > self.get_size())
        {
            return Err(StorageError::OutOfBounds {});
        }

        if offset >= self.split {
            return self.second.read(offset - self.split, buf);
        }

        let first_len = std::cmp::min(buf.len() as u64, self.split - offset) as usize;
        let (head, tail) = buf.split_at_mut(first_len);
        self.first.read(offset, head)?;
        if !tail.is_empty() {
            self.second.read(0, tail)?;
        }
        Ok(())
    }

    fn get_size(&self) -> u64 {
        self.split + self.second.get_size()
    }
}

use crate::formats::nca::bucket_tree::{
    BucketTree, BucketTreeError, BucketTreeHeader, RelocationEntry,
};
use crate::storage::{ReadableStorage, StorageError};
use std::sync::Arc;
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RelocationSource {
    Base,
    Patch,
}

#[derive(Debug, Clone, Copy)]
struct Relocation {
    virtual_offset: u64,
    physical_offset: u64,
    source: RelocationSource,
}

/// The virtual storage of a patched section, stitched together from the base and the patch.
///
/// Each relocation maps the range from its virtual offset up to the next relocation's virtual
/// offset onto one of the sources.
#[derive(Debug)]
pub struct IndirectStorage<B: ReadableStorage, P: ReadableStorage> {
    base: B,
    patch: P,
    relocations: Arc<[Relocation]>,
    size: u64,
}

impl<B: ReadableStorage, P: ReadableStorage> IndirectStorage<B, P> {
    /// `table` holds the relocation bucket tree described by `header`.
    pub fn new<T: ReadableStorage>(
        base: B,
        patch: P,
        table: &T,
        header: &BucketTreeHeader,
    ) -> Result<Self, BucketTreeError> {
        let tree = BucketTree::<RelocationEntry>::read(table, header)?;
        let size = tree.end_offset();

        let relocations = tree
            .into_entries()
            .into_iter()
            .enumerate()
            .map(|(index, entry)| {
                let source = match entry.storage_index {
                    0 => RelocationSource::Base,
                    1 => RelocationSource::Patch,
                    storage_index => {
                        return Err(BucketTreeError::InvalidStorageIndex {
                            index,
                            storage_index,
                        })
                    }
                };
                let physical_offset = u64::try_from(entry.physical_offset)
                    .map_err(|_| BucketTreeError::InvalidPhysicalOffset { index })?;

                Ok(Relocation {
                    // non-negative, checked by the bucket tree
                    virtual_offset: entry.virtual_offset as u64,
                    physical_offset,
                    source,
                })
            })
            .collect::<Result<Arc<[_]>, _>>()?;

        debug!(
            relocation_count = relocations.len(),
            size, "Built indirect storage"
        );

        Ok(Self {
            base,
            patch,
            relocations,
            size,
        })
    }

    fn relocation_index(&self, offset: u64) -> usize {
        self.relocations
            .partition_point(|r| r.virtual_offset <= offset)
            .saturating_sub(1)
    }
}

impl<B: ReadableStorage, P: ReadableStorage> ReadableStorage for IndirectStorage<B, P> {
    fn read(&self, mut offset: u64, mut buf: &mut [u8]) -> Result<(), StorageError> {
        if offset
            .checked_add(buf.len() as u64)
            .map_or(true, |end| end > self.size)
        {
            return Err(StorageError::OutOfBounds {});
        }

        let mut index = self.relocation_index(offset);
        while !buf.is_empty() {
            let relocation = &self.relocations[index];
            let relocation_end = self
                .relocations
                .get(index + 1)
                .map_or(self.size, |next| next.virtual_offset);
            let len = std::cmp::min(relocation_end - offset, buf.len() as u64) as usize;

            let physical_offset =
                relocation.physical_offset + (offset - relocation.virtual_offset);
            let (chunk, rest) = std::mem::take(&mut buf).split_at_mut(len);
            match relocation.source {
                RelocationSource::Base => self.base.read(physical_offset, chunk)?,
                RelocationSource::Patch => self.patch.read(physical_offset, chunk)?,
            }

            offset += len as u64;
            buf = rest;
            index += 1;
        }

        Ok(())
    }

    fn get_size(&self) -> u64 {
        self.size
    }
}

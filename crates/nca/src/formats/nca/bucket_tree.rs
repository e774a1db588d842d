//! Bucket trees: the sorted tables of patch sections (relocation and AES-CTR generations).
//!
//! The table storage starts with the node storage (an L1 offset node, optionally followed by L2
//! offset nodes), followed by the entry sets. Every node is [`NODE_SIZE`] bytes and starts with a
//! [`NodeHeader`]. Only the entry sets are needed to rebuild the table, the offset nodes are used
//! for lookups on the console.

use crate::hexstring::HexData;
use crate::storage::{ReadableStorage, SliceStorageError, StorageError};
use binrw::{BinRead, BinReaderExt};
use itertools::Itertools;
use num_integer::Integer;
use snafu::{ResultExt, Snafu};
use std::io::Cursor;
use tracing::trace;

pub const NODE_SIZE: u64 = 0x4000;
const NODE_HEADER_SIZE: u64 = 0x10;
const MAX_VERSION: u32 = 1;

#[derive(Snafu, Debug)]
#[snafu(visibility(pub(crate)))]
pub enum BucketTreeError {
    /// Bucket tree: Failed to parse the tree header
    HeaderParsing { source: binrw::Error },
    /// Bucket tree: Unsupported version {version}
    UnsupportedVersion { version: u32 },
    /// Bucket tree: Negative entry count {entry_count}
    NegativeEntryCount { entry_count: i32 },
    /// Bucket tree: The table does not fit into the section
    TableOutOfBounds { source: SliceStorageError },
    /// Bucket tree: The table at {offset:#x} lies outside of the bucket region
    InvalidTreeOffset { offset: u64 },
    /// Bucket tree: The table must start at an offset aligned to {alignment:#x}, found {offset:#x}
    Misaligned { offset: u64, alignment: u64 },
    /// Bucket tree: {entry_count} entries need {required:#x} bytes, the table has {size:#x}
    TableTooSmall {
        entry_count: u64,
        required: u64,
        size: u64,
    },
    /// Bucket tree: Failed to read the table
    Storage { source: StorageError },
    /// Bucket tree: Failed to parse node {node}
    NodeParsing { node: u64, source: binrw::Error },
    /// Bucket tree: Node {node} has an invalid header
    InvalidNodeHeader { node: u64 },
    /// Bucket tree: Expected {expected} entries, found {actual}
    EntryCountMismatch { expected: u64, actual: u64 },
    /// Bucket tree: The first entry starts at {offset:#x} instead of 0
    InvalidStartOffset { offset: i64 },
    /// Bucket tree: Entry {index} at {offset:#x} is out of order
    UnsortedEntries { index: usize, offset: i64 },
    /// Bucket tree: Entry at {offset:#x} lies past the end of the tree ({end_offset:#x})
    InvalidEndOffset { offset: i64, end_offset: i64 },
    /// Bucket tree: Entry {index} refers to unknown storage {storage_index}
    InvalidStorageIndex { index: usize, storage_index: i32 },
    /// Bucket tree: Entry {index} has a negative physical offset
    InvalidPhysicalOffset { index: usize },
}

/// Tree header, stored in the patch info of the FS header.
#[derive(Debug, Clone, Copy, PartialEq, Eq, BinRead)]
#[br(little, magic = b"BKTR")]
pub struct BucketTreeHeader {
    pub version: u32,
    #[br(pad_after = 4)]
    pub entry_count: i32,
}

impl BucketTreeHeader {
    pub fn parse(data: &HexData<0x10>) -> Result<Self, BucketTreeError> {
        let header = Self::read(&mut Cursor::new(&data.0)).context(HeaderParsingSnafu)?;
        if header.version > MAX_VERSION {
            return UnsupportedVersionSnafu {
                version: header.version,
            }
            .fail();
        }
        if header.entry_count < 0 {
            return NegativeEntryCountSnafu {
                entry_count: header.entry_count,
            }
            .fail();
        }
        Ok(header)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, BinRead)]
#[br(little)]
struct NodeHeader {
    index: i32,
    count: i32,
    /// End offset of the entries covered by the node.
    offset: i64,
}

pub trait BucketTreeEntry: for<'a> BinRead<Args<'a> = ()> + Copy {
    const SIZE: u64;

    /// Virtual offset where the entry begins.
    fn offset(&self) -> i64;
}

/// Entry of the relocation (indirect storage) table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, BinRead)]
#[br(little)]
pub struct RelocationEntry {
    pub virtual_offset: i64,
    pub physical_offset: i64,
    /// 0 is the base, 1 the patch
    pub storage_index: i32,
}

impl BucketTreeEntry for RelocationEntry {
    const SIZE: u64 = 0x14;

    fn offset(&self) -> i64 {
        self.virtual_offset
    }
}

/// Entry of the AES-CTR generation table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, BinRead)]
#[br(little)]
pub struct EncryptionEntry {
    pub offset: i64,
    /// 0 for encrypted ranges, 1 for plaintext
    #[br(pad_after = 3)]
    pub encryption_value: u8,
    pub generation: u32,
}

impl EncryptionEntry {
    pub fn is_encrypted(&self) -> bool {
        self.encryption_value != 1
    }
}

impl BucketTreeEntry for EncryptionEntry {
    const SIZE: u64 = 0x10;

    fn offset(&self) -> i64 {
        self.offset
    }
}

fn entries_per_node(entry_size: u64) -> u64 {
    (NODE_SIZE - NODE_HEADER_SIZE) / entry_size
}

fn offsets_per_node() -> u64 {
    (NODE_SIZE - NODE_HEADER_SIZE) / 8
}

fn entry_set_count(entry_size: u64, entry_count: u64) -> u64 {
    Integer::div_ceil(&entry_count, &entries_per_node(entry_size))
}

fn node_l2_count(entry_size: u64, entry_count: u64) -> u64 {
    let offset_count = offsets_per_node();
    let entry_set_count = entry_set_count(entry_size, entry_count);
    if entry_set_count <= offset_count {
        return 0;
    }

    let l2_count = Integer::div_ceil(&entry_set_count, &offset_count);
    Integer::div_ceil(
        &(entry_set_count - (offset_count - (l2_count - 1))),
        &offset_count,
    )
}

/// Size of the offset nodes preceding the entry sets.
pub fn node_storage_size(entry_size: u64, entry_count: u64) -> u64 {
    (1 + node_l2_count(entry_size, entry_count)) * NODE_SIZE
}

pub fn entry_storage_size(entry_size: u64, entry_count: u64) -> u64 {
    entry_set_count(entry_size, entry_count) * NODE_SIZE
}

/// The entries of a bucket tree, sorted by offset.
///
/// Every entry covers the range from its offset to the offset of the next one, the last entry
/// ends at [`BucketTree::end_offset`].
#[derive(Debug, Clone)]
pub struct BucketTree<E> {
    entries: Vec<E>,
    end_offset: u64,
}

fn read_node<S: ReadableStorage>(storage: &S, offset: u64) -> Result<Vec<u8>, BucketTreeError> {
    let size = std::cmp::min(NODE_SIZE, storage.get_size().saturating_sub(offset));
    let mut node = vec![0; size as usize];
    storage.read(offset, &mut node).context(StorageSnafu)?;
    Ok(node)
}

impl<E: BucketTreeEntry> BucketTree<E> {
    /// Reads the tree from `storage`, which holds the node storage followed by the entry storage.
    pub fn read<S: ReadableStorage>(
        storage: &S,
        header: &BucketTreeHeader,
    ) -> Result<Self, BucketTreeError> {
        let entry_count = header.entry_count as u64;
        if entry_count == 0 {
            return Ok(Self {
                entries: Vec::new(),
                end_offset: 0,
            });
        }

        let required = node_storage_size(E::SIZE, entry_count)
            .saturating_add(entry_storage_size(E::SIZE, entry_count));
        if required > storage.get_size() {
            return TableTooSmallSnafu {
                entry_count,
                required,
                size: storage.get_size(),
            }
            .fail();
        }

        let l1 = read_node(storage, 0)?;
        let l1_header: NodeHeader = Cursor::new(&l1)
            .read_le()
            .context(NodeParsingSnafu { node: 0u64 })?;
        if l1_header.index != 0 || l1_header.count <= 0 || l1_header.offset < 0 {
            return InvalidNodeHeaderSnafu { node: 0u64 }.fail();
        }
        let end_offset = l1_header.offset;

        let entries_offset = node_storage_size(E::SIZE, entry_count);
        let set_count = entry_set_count(E::SIZE, entry_count);
        let max_entries = entries_per_node(E::SIZE);

        let mut entries = Vec::with_capacity(entry_count as usize);
        for set_index in 0..set_count {
            let node = read_node(storage, entries_offset + set_index * NODE_SIZE)?;
            let mut cur = Cursor::new(&node);
            let set_header: NodeHeader = cur
                .read_le()
                .context(NodeParsingSnafu { node: set_index + 1 })?;
            if set_header.index as i64 != set_index as i64
                || set_header.count <= 0
                || set_header.count as u64 > max_entries
            {
                return InvalidNodeHeaderSnafu { node: set_index + 1 }.fail();
            }

            for _ in 0..set_header.count {
                let entry: E = cur
                    .read_le()
                    .context(NodeParsingSnafu { node: set_index + 1 })?;
                entries.push(entry);
            }
        }

        if entries.len() as u64 != entry_count {
            return EntryCountMismatchSnafu {
                expected: entry_count,
                actual: entries.len() as u64,
            }
            .fail();
        }

        if let Some(first) = entries.first() {
            if first.offset() != 0 {
                return InvalidStartOffsetSnafu {
                    offset: first.offset(),
                }
                .fail();
            }
        }
        if let Some((index, (_, next))) = entries
            .iter()
            .tuple_windows()
            .find_position(|(prev, next)| next.offset() <= prev.offset())
        {
            return UnsortedEntriesSnafu {
                index: index + 1,
                offset: next.offset(),
            }
            .fail();
        }
        if let Some(last) = entries.last() {
            if last.offset() >= end_offset {
                return InvalidEndOffsetSnafu {
                    offset: last.offset(),
                    end_offset,
                }
                .fail();
            }
        }

        trace!(entry_count, end_offset, "Read bucket tree");

        Ok(Self {
            entries,
            end_offset: end_offset as u64,
        })
    }

    pub fn entries(&self) -> &[E] {
        &self.entries
    }

    pub fn end_offset(&self) -> u64 {
        self.end_offset
    }

    pub fn into_entries(self) -> Vec<E> {
        self.entries
    }
}

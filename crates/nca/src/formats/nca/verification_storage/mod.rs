use crate::formats::nca::structs::{
    IntegrityInfo, IvfcIntegrityInfo, NcaFsHeader, NcaHashType, Sha256IntegrityInfo,
};
use crate::storage::{
    BlockAdapterStorage, LinearAdapterStorage, ReadableStorage, ReadableStorageExt, SharedStorage,
    SliceStorage, SliceStorageError, StorageError, VecStorage,
};
use binrw::BinRead;
use num_integer::Integer;
use snafu::{ResultExt, Snafu};
use std::io::Cursor;

mod integrity_verification_level_storage;
pub use integrity_verification_level_storage::{HashSource, IntegrityVerificationLevelStorage};

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum IntegrityStorageType {
    /// PFS0 sections: a single hash table level, the last data block is hashed unpadded.
    HierarchicalSha256,
    /// RomFS sections: up to 6 levels, partial blocks are zero-padded before hashing.
    Ivfc,
    /// Save data: like IVFC, but the salt is hashed before each block and the top bit of the digest is set.
    Save { salt: [u8; DIGEST_SIZE] },
}

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum IntegrityCheckLevel {
    /// No integrity checks will be performed.
    None,
    /// Invalid blocks will be marked as invalid when read, and will not cause an error.
    IgnoreOnInvalid,
    /// An error will be returned when an invalid block is read.
    ErrorOnInvalid,
}

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum Validity {
    Unchecked,
    Invalid,
    Valid,
    /// The keys needed to check the data are not available.
    MissingKey,
}

#[derive(Snafu, Debug)]
pub enum IntegrityInfoError {
    /// Unknown hash type {value}
    UnknownHashType { value: u8 },
    /// Failed to parse the integrity info
    IntegrityInfoParsing { source: binrw::Error },
    /// Unsupported number of hash levels: {level_count}
    LevelCount { level_count: u32 },
    /// Hash level {level} has an invalid block size
    BlockSize { level: usize },
    /// Master hash size {size:#x} is not a SHA-256 digest
    MasterHashSize { size: u32 },
    /// A hash level does not fit into the section
    LevelOutOfBounds { source: SliceStorageError },
    /// Hash level {level} is too small to hold the hashes of the level below it
    HashLevelTooSmall { level: usize },
}

pub const DIGEST_SIZE: usize = 0x20;
const MAX_DATA_LEVELS: usize = 6;
const MAX_LOG2_BLOCK_SIZE: u32 = 30;

impl NcaFsHeader {
    pub fn integrity_info(&self) -> Result<IntegrityInfo, IntegrityInfoError> {
        let hash_type = self
            .hash_type()
            .map_err(|value| IntegrityInfoError::UnknownHashType { value })?;
        let mut cur = Cursor::new(&self.integrity_info.0);

        Ok(match hash_type {
            NcaHashType::None => IntegrityInfo::None,
            NcaHashType::Sha256 => IntegrityInfo::Sha256(
                Sha256IntegrityInfo::read(&mut cur).context(IntegrityInfoParsingSnafu)?,
            ),
            NcaHashType::Ivfc => IntegrityInfo::Ivfc(
                IvfcIntegrityInfo::read(&mut cur).context(IntegrityInfoParsingSnafu)?,
            ),
        })
    }
}

type AddLevel<S, B> = LinearAdapterStorage<
    IntegrityVerificationLevelStorage<BlockAdapterStorage<SliceStorage<SharedStorage<S>>>, B>,
>;

type VerificationStorage1<S> = AddLevel<S, VecStorage>;
type VerificationStorage2<S> = AddLevel<S, VerificationStorage1<S>>;
type VerificationStorage3<S> = AddLevel<S, VerificationStorage2<S>>;
type VerificationStorage4<S> = AddLevel<S, VerificationStorage3<S>>;
type VerificationStorage5<S> = AddLevel<S, VerificationStorage4<S>>;
type VerificationStorage6<S> = AddLevel<S, VerificationStorage5<S>>;

/// A section's data, optionally behind a hash tree of one to six levels.
///
/// Reads return the data of the last level; the levels above it are only read to check it.
#[derive(Debug)]
pub enum NcaVerificationStorage<S: ReadableStorage> {
    /// No hash tree, or the caller asked for the raw data.
    Plain(S),
    Level1(VerificationStorage1<S>),
    Level2(VerificationStorage2<S>),
    Level3(VerificationStorage3<S>),
    Level4(VerificationStorage4<S>),
    Level5(VerificationStorage5<S>),
    Level6(VerificationStorage6<S>),
}

impl HashSource for VecStorage {
    fn validate_levels(&self) -> Result<Validity, StorageError> {
        // the master hash comes from the (already verified) FS header
        Ok(Validity::Valid)
    }
}

impl<S: ReadableStorage, B: HashSource> HashSource for AddLevel<S, B> {
    fn validate_levels(&self) -> Result<Validity, StorageError> {
        self.inner().validate(true)
    }
}

/// Location of one hash tree level inside the section.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct HashLevel {
    pub offset: u64,
    pub size: u64,
    pub block_size: u64,
}

#[derive(Debug, Copy, Clone)]
struct VerificationParams {
    integrity_level: IntegrityCheckLevel,
    ty: IntegrityStorageType,
}

fn add_level<S: ReadableStorage, B: ReadableStorage>(
    base_storage: SharedStorage<S>,
    hash_storage: B,
    level: HashLevel,
    params: VerificationParams,
) -> Result<AddLevel<S, B>, SliceStorageError> {
    let data_storage = BlockAdapterStorage::new(
        SliceStorage::new(base_storage, level.offset, level.size)?,
        level.block_size,
    );

    Ok(LinearAdapterStorage::new(
        IntegrityVerificationLevelStorage::new(
            data_storage,
            hash_storage,
            params.integrity_level,
            params.ty,
        ),
    ))
}

fn make_level1_storage<S: ReadableStorage>(
    storage: SharedStorage<S>,
    master_hash: [u8; DIGEST_SIZE],
    levels: [HashLevel; 1],
    params: VerificationParams,
) -> Result<VerificationStorage1<S>, SliceStorageError> {
    let [level] = levels;
    let hash_storage = VecStorage::new(master_hash.into());
    add_level(storage, hash_storage, level, params)
}

macro_rules! make_level_storage {
    ($name:ident, $level:literal, $res:ident, $prev:ident) => {
        fn $name<S: ReadableStorage>(
            storage: SharedStorage<S>,
            master_hash: [u8; DIGEST_SIZE],
            levels: [HashLevel; $level],
            params: VerificationParams,
        ) -> Result<$res<S>, SliceStorageError> {
            let [levels @ .., level] = levels;
            let hash_storage = $prev(storage.clone(), master_hash, levels, params)?;
            add_level(storage, hash_storage, level, params)
        }
    };
}

make_level_storage!(
    make_level2_storage,
    2,
    VerificationStorage2,
    make_level1_storage
);
make_level_storage!(
    make_level3_storage,
    3,
    VerificationStorage3,
    make_level2_storage
);
make_level_storage!(
    make_level4_storage,
    4,
    VerificationStorage4,
    make_level3_storage
);
make_level_storage!(
    make_level5_storage,
    5,
    VerificationStorage5,
    make_level4_storage
);
make_level_storage!(
    make_level6_storage,
    6,
    VerificationStorage6,
    make_level5_storage
);

/// Checks that every level has a usable block size and that its parent can hold its hashes.
fn check_levels(levels: &[HashLevel]) -> Result<(), IntegrityInfoError> {
    let mut parent_size = DIGEST_SIZE as u64;
    for (index, level) in levels.iter().enumerate() {
        // level 0 is the master hash
        let level_number = index + 1;
        if level.block_size == 0 {
            return BlockSizeSnafu {
                level: level_number,
            }
            .fail();
        }

        let block_count = Integer::div_ceil(&level.size, &level.block_size);
        if block_count.saturating_mul(DIGEST_SIZE as u64) > parent_size {
            return HashLevelTooSmallSnafu {
                level: level_number - 1,
            }
            .fail();
        }
        parent_size = level.size;
    }
    Ok(())
}

impl<S: ReadableStorage> NcaVerificationStorage<S> {
    /// Puts the hash tree described by `integrity_info` on top of `storage`.
    pub fn new(
        storage: S,
        integrity_info: &IntegrityInfo,
        integrity_level: IntegrityCheckLevel,
    ) -> Result<Self, IntegrityInfoError> {
        match integrity_info {
            IntegrityInfo::None => Ok(Self::Plain(storage)),
            IntegrityInfo::Sha256(info) => {
                Self::new_hierarchical_sha256(storage, info, integrity_level)
            }
            IntegrityInfo::Ivfc(info) => Self::new_ivfc(storage, info, integrity_level),
        }
    }

    pub fn new_hierarchical_sha256(
        storage: S,
        info: &Sha256IntegrityInfo,
        integrity_level: IntegrityCheckLevel,
    ) -> Result<Self, IntegrityInfoError> {
        if info.level_count != 2 {
            return LevelCountSnafu {
                level_count: info.level_count,
            }
            .fail();
        }
        if info.block_size == 0 {
            return BlockSizeSnafu { level: 2usize }.fail();
        }

        let [hash_table, data, ..] = info.level_info;
        let levels = [
            // the hash table is checked against the master hash as a whole
            HashLevel {
                offset: hash_table.offset,
                size: hash_table.size,
                block_size: hash_table.size,
            },
            HashLevel {
                offset: data.offset,
                size: data.size,
                block_size: info.block_size as u64,
            },
        ];

        Self::from_levels(
            storage,
            info.master_hash.0 .0,
            &levels,
            integrity_level,
            IntegrityStorageType::HierarchicalSha256,
        )
    }

    pub fn new_ivfc(
        storage: S,
        info: &IvfcIntegrityInfo,
        integrity_level: IntegrityCheckLevel,
    ) -> Result<Self, IntegrityInfoError> {
        if info.master_hash_size != DIGEST_SIZE as u32 {
            return MasterHashSizeSnafu {
                size: info.master_hash_size,
            }
            .fail();
        }
        // the level count includes the master hash
        if !(2..=MAX_DATA_LEVELS as u32 + 1).contains(&info.level_count) {
            return LevelCountSnafu {
                level_count: info.level_count,
            }
            .fail();
        }

        let levels = info.level_info[..info.level_count as usize - 1]
            .iter()
            .enumerate()
            .map(|(index, level)| {
                if level.block_size == 0 || level.block_size > MAX_LOG2_BLOCK_SIZE {
                    return BlockSizeSnafu { level: index + 1 }.fail();
                }
                Ok(HashLevel {
                    offset: level.offset,
                    size: level.size,
                    block_size: 1 << level.block_size,
                })
            })
            .collect::<Result<Vec<_>, _>>()?;

        let mut master_hash = [0; DIGEST_SIZE];
        master_hash.copy_from_slice(&info.master_hash.0[..DIGEST_SIZE]);

        Self::from_levels(
            storage,
            master_hash,
            &levels,
            integrity_level,
            IntegrityStorageType::Ivfc,
        )
    }

    /// Builds a hash tree out of `levels`, the first one being checked against `master_hash` and
    /// the last one holding the data.
    pub fn from_levels(
        storage: S,
        master_hash: [u8; DIGEST_SIZE],
        levels: &[HashLevel],
        integrity_level: IntegrityCheckLevel,
        ty: IntegrityStorageType,
    ) -> Result<Self, IntegrityInfoError> {
        check_levels(levels)?;

        let params = VerificationParams {
            integrity_level,
            ty,
        };
        let storage = storage.shared();

        let storage = match *levels {
            [a] => make_level1_storage(storage, master_hash, [a], params).map(Self::Level1),
            [a, b] => make_level2_storage(storage, master_hash, [a, b], params).map(Self::Level2),
            [a, b, c] => {
                make_level3_storage(storage, master_hash, [a, b, c], params).map(Self::Level3)
            }
            [a, b, c, d] => make_level4_storage(storage, master_hash, [a, b, c, d], params)
                .map(Self::Level4),
            [a, b, c, d, e] => make_level5_storage(storage, master_hash, [a, b, c, d, e], params)
                .map(Self::Level5),
            [a, b, c, d, e, f] => {
                make_level6_storage(storage, master_hash, [a, b, c, d, e, f], params)
                    .map(Self::Level6)
            }
            _ => {
                return LevelCountSnafu {
                    level_count: levels.len() as u32,
                }
                .fail()
            }
        };

        storage.context(LevelOutOfBoundsSnafu)
    }

    /// Checks every block of the data level, and of the hash levels if `recursive` is set.
    pub fn validate(&self, recursive: bool) -> Result<Validity, StorageError> {
        match self {
            Self::Plain(_) => Ok(Validity::Unchecked),
            Self::Level1(storage) => storage.inner().validate(recursive),
            Self::Level2(storage) => storage.inner().validate(recursive),
            Self::Level3(storage) => storage.inner().validate(recursive),
            Self::Level4(storage) => storage.inner().validate(recursive),
            Self::Level5(storage) => storage.inner().validate(recursive),
            Self::Level6(storage) => storage.inner().validate(recursive),
        }
    }

    /// Per-block validity of the data level, `None` without a hash tree.
    pub fn block_validities(&self) -> Option<Vec<Validity>> {
        Some(match self {
            Self::Plain(_) => return None,
            Self::Level1(storage) => storage.inner().block_validities(),
            Self::Level2(storage) => storage.inner().block_validities(),
            Self::Level3(storage) => storage.inner().block_validities(),
            Self::Level4(storage) => storage.inner().block_validities(),
            Self::Level5(storage) => storage.inner().block_validities(),
            Self::Level6(storage) => storage.inner().block_validities(),
        })
    }
}

impl<S: ReadableStorage> ReadableStorage for NcaVerificationStorage<S> {
    fn read(&self, offset: u64, buf: &mut [u8]) -> Result<(), StorageError> {
        match self {
            Self::Plain(storage) => storage.read(offset, buf),
            Self::Level1(storage) => storage.read(offset, buf),
            Self::Level2(storage) => storage.read(offset, buf),
            Self::Level3(storage) => storage.read(offset, buf),
            Self::Level4(storage) => storage.read(offset, buf),
            Self::Level5(storage) => storage.read(offset, buf),
            Self::Level6(storage) => storage.read(offset, buf),
        }
    }

    fn get_size(&self) -> u64 {
        match self {
            Self::Plain(storage) => storage.get_size(),
            Self::Level1(storage) => storage.get_size(),
            Self::Level2(storage) => storage.get_size(),
            Self::Level3(storage) => storage.get_size(),
            Self::Level4(storage) => storage.get_size(),
            Self::Level5(storage) => storage.get_size(),
            Self::Level6(storage) => storage.get_size(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::sha256;

    const BLOCK_SIZE: usize = 0x100;

    /// Builds a two level IVFC-style tree: `[hash table][data]`, returning the storage and the master hash.
    fn build_ivfc_like(data: &[u8]) -> (Vec<u8>, [u8; DIGEST_SIZE], [HashLevel; 2]) {
        let mut hashes = Vec::new();
        for chunk in data.chunks(BLOCK_SIZE) {
            let mut block = chunk.to_vec();
            block.resize(BLOCK_SIZE, 0);
            hashes.extend_from_slice(&sha256(&block));
        }
        let mut hash_block = hashes.clone();
        hash_block.resize(BLOCK_SIZE, 0);
        let master_hash = sha256(&hash_block);

        let levels = [
            HashLevel {
                offset: 0,
                size: hashes.len() as u64,
                block_size: BLOCK_SIZE as u64,
            },
            HashLevel {
                offset: BLOCK_SIZE as u64,
                size: data.len() as u64,
                block_size: BLOCK_SIZE as u64,
            },
        ];

        let mut storage = hash_block;
        storage.extend_from_slice(data);
        (storage, master_hash, levels)
    }

    fn data() -> Vec<u8> {
        (0..0x380).map(|i| (i * 13) as u8).collect()
    }

    #[test]
    fn reads_verified_data() {
        let data = data();
        let (storage, master_hash, levels) = build_ivfc_like(&data);
        let storage = NcaVerificationStorage::from_levels(
            VecStorage::new(storage),
            master_hash,
            &levels,
            IntegrityCheckLevel::ErrorOnInvalid,
            IntegrityStorageType::Ivfc,
        )
        .unwrap();

        assert_eq!(storage.read_all().unwrap(), data);
        assert_eq!(storage.validate(true).unwrap(), Validity::Valid);
        // second validation is served from the recorded statuses
        assert_eq!(storage.validate(true).unwrap(), Validity::Valid);
    }

    #[test]
    fn corrupted_block_is_reported() {
        let data = data();
        let (mut storage, master_hash, levels) = build_ivfc_like(&data);
        storage[BLOCK_SIZE + 0x150] ^= 1;

        let ignoring = NcaVerificationStorage::from_levels(
            VecStorage::new(storage.clone()),
            master_hash,
            &levels,
            IntegrityCheckLevel::IgnoreOnInvalid,
            IntegrityStorageType::Ivfc,
        )
        .unwrap();
        let read = ignoring.read_all().unwrap();
        assert_eq!(read, &storage[BLOCK_SIZE..]);
        assert_eq!(
            ignoring.block_validities().unwrap(),
            vec![
                Validity::Valid,
                Validity::Invalid,
                Validity::Valid,
                Validity::Valid
            ]
        );
        assert_eq!(ignoring.validate(true).unwrap(), Validity::Invalid);

        let strict = NcaVerificationStorage::from_levels(
            VecStorage::new(storage),
            master_hash,
            &levels,
            IntegrityCheckLevel::ErrorOnInvalid,
            IntegrityStorageType::Ivfc,
        )
        .unwrap();
        let mut buf = [0; 0x10];
        strict.read(0, &mut buf).unwrap();
        assert!(matches!(
            strict.read(0x140, &mut buf),
            Err(StorageError::IntegrityCheckFailed { offset: 0x100 })
        ));
    }

    #[test]
    fn unchecked_without_verification() {
        let data = data();
        let (mut storage, master_hash, levels) = build_ivfc_like(&data);
        storage[BLOCK_SIZE] ^= 1;
        let storage = NcaVerificationStorage::from_levels(
            VecStorage::new(storage),
            master_hash,
            &levels,
            IntegrityCheckLevel::None,
            IntegrityStorageType::Ivfc,
        )
        .unwrap();
        assert_eq!(storage.validate(true).unwrap(), Validity::Unchecked);
    }

    #[test]
    fn save_hashes_are_salted() {
        let salt = [0x5a; DIGEST_SIZE];
        let data = vec![0x42u8; BLOCK_SIZE];

        let salted = |block: &[u8]| {
            let mut input = salt.to_vec();
            input.extend_from_slice(block);
            let mut hash = sha256(&input);
            hash[DIGEST_SIZE - 1] |= 0x80;
            hash
        };
        let hash_table = salted(&data);
        let mut hash_block = hash_table.to_vec();
        hash_block.resize(BLOCK_SIZE, 0);
        let master_hash = salted(&hash_block);

        let mut storage = hash_block;
        storage.extend_from_slice(&data);
        let levels = [
            HashLevel {
                offset: 0,
                size: DIGEST_SIZE as u64,
                block_size: BLOCK_SIZE as u64,
            },
            HashLevel {
                offset: BLOCK_SIZE as u64,
                size: BLOCK_SIZE as u64,
                block_size: BLOCK_SIZE as u64,
            },
        ];

        let storage = NcaVerificationStorage::from_levels(
            VecStorage::new(storage),
            master_hash,
            &levels,
            IntegrityCheckLevel::ErrorOnInvalid,
            IntegrityStorageType::Save { salt },
        )
        .unwrap();
        assert_eq!(storage.read_all().unwrap(), data);
        assert_eq!(storage.validate(true).unwrap(), Validity::Valid);
    }

    #[test]
    fn rejects_undersized_hash_level() {
        let levels = [
            HashLevel {
                offset: 0,
                size: 0x40,
                block_size: 0x100,
            },
            HashLevel {
                offset: 0x100,
                size: 0x300,
                block_size: 0x100,
            },
        ];
        assert!(matches!(
            NcaVerificationStorage::from_levels(
                VecStorage::new(vec![0; 0x400]),
                [0; DIGEST_SIZE],
                &levels,
                IntegrityCheckLevel::ErrorOnInvalid,
                IntegrityStorageType::Ivfc,
            ),
            Err(IntegrityInfoError::HashLevelTooSmall { level: 1 })
        ));
    }
}

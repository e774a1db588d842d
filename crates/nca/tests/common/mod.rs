//! Builds synthetic NCAs in memory.
//!
//! Headers are written at their on-disk offsets and encrypted with the crate's own primitives.
#![allow(dead_code)]

use hac_nca::crypto::keyset::{KeyAreaKeyIndex, KeySet};
use hac_nca::crypto::{sha256, AesKey, AesXtsKey, TitleKey};
use hac_nca::formats::nca::make_counter;
use hac_nca::ids::RightsId;

pub const HEADER_SIZE: usize = 0xc00;
pub const SECTOR_SIZE: usize = 0x200;

pub const FORMAT_ROMFS: u8 = 0;
pub const FORMAT_PFS0: u8 = 1;

pub const HASH_NONE: u8 = 1;
pub const HASH_SHA256: u8 = 2;
pub const HASH_IVFC: u8 = 3;

pub const ENCRYPTION_NONE: u8 = 1;
pub const ENCRYPTION_XTS: u8 = 2;
pub const ENCRYPTION_CTR: u8 = 3;
pub const ENCRYPTION_CTR_EX: u8 = 4;

pub const CONTENT_TYPE_PROGRAM: u8 = 0;
pub const CONTENT_TYPE_DATA: u8 = 4;

/// key generation 3 uses the keys of master key revision 2
pub const KEY_GENERATION: u8 = 3;
pub const MASTER_KEY_REVISION: u8 = 2;

pub const RIGHTS_ID: [u8; 0x10] = [
    0x01, 0x00, 0x00, 0x00, 0x00, 0x00, 0x10, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x03,
];

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

pub fn header_key() -> AesXtsKey {
    let mut key = [0; 0x20];
    hex::decode_to_slice(
        "aeaab1ca08adf9bef12991f369e3c567d6881e4e4a6a47a51f6e4877062d542d",
        &mut key,
    )
    .unwrap();
    AesXtsKey::from(key)
}

pub fn key_area_key() -> AesKey {
    AesKey::from([0x5a; 0x10])
}

pub fn title_kek() -> AesKey {
    AesKey::from([0x7e; 0x10])
}

/// The decrypted title key.
pub fn title_key() -> AesKey {
    AesKey::from([0x3c; 0x10])
}

/// Content keys stored in the key area: XTS data, XTS tweak, CTR and the unused hardware key.
pub fn content_keys() -> [AesKey; 4] {
    [
        AesKey::from([0x11; 0x10]),
        AesKey::from([0x22; 0x10]),
        AesKey::from([0x33; 0x10]),
        AesKey::from([0x44; 0x10]),
    ]
}

/// A key set holding every key the test NCAs need.
pub fn key_set() -> KeySet {
    let mut key_set = KeySet::new()
        .with_header_key(header_key())
        .with_key_area_key(
            MASTER_KEY_REVISION,
            KeyAreaKeyIndex::Application,
            key_area_key(),
        )
        .with_title_kek(MASTER_KEY_REVISION, title_kek());
    let encrypted_title_key = title_kek().encrypt_key(title_key());
    key_set.add_title_key(
        RightsId::new(RIGHTS_ID),
        TitleKey::from(*encrypted_title_key.as_bytes()),
    );
    key_set
}

/// An FS header, built field by field.
#[derive(Clone)]
pub struct FsHeaderBuilder {
    data: [u8; SECTOR_SIZE],
}

impl FsHeaderBuilder {
    pub fn new(format_type: u8, hash_type: u8, encryption_type: u8) -> Self {
        let mut data = [0; SECTOR_SIZE];
        data[0..2].copy_from_slice(&2u16.to_le_bytes());
        data[2] = format_type;
        data[3] = hash_type;
        data[4] = encryption_type;
        Self { data }
    }

    pub fn encryption_type(&self) -> u8 {
        self.data[4]
    }

    pub fn upper_counter(mut self, upper_counter: u64) -> Self {
        self.data[0x140..0x148].copy_from_slice(&upper_counter.to_le_bytes());
        self
    }

    pub fn get_upper_counter(&self) -> u64 {
        u64::from_le_bytes(self.data[0x140..0x148].try_into().unwrap())
    }

    pub fn sha256_info(mut self, tree: &Sha256Tree) -> Self {
        let info = &mut self.data[0x8..0x100];
        info[0..0x20].copy_from_slice(&tree.master_hash);
        info[0x20..0x24].copy_from_slice(&tree.block_size.to_le_bytes());
        info[0x24..0x28].copy_from_slice(&(tree.levels.len() as u32).to_le_bytes());
        for (i, (offset, size)) in tree.levels.iter().enumerate() {
            let level = &mut info[0x28 + i * 0x10..][..0x10];
            level[0..8].copy_from_slice(&offset.to_le_bytes());
            level[8..16].copy_from_slice(&size.to_le_bytes());
        }
        self
    }

    pub fn ivfc_info(mut self, tree: &IvfcTree) -> Self {
        let info = &mut self.data[0x8..0x100];
        info[0..4].copy_from_slice(b"IVFC");
        info[4..8].copy_from_slice(&0x20000u32.to_le_bytes());
        info[8..0xc].copy_from_slice(&0x20u32.to_le_bytes());
        // the master hash counts as a level
        info[0xc..0x10].copy_from_slice(&(tree.levels.len() as u32 + 1).to_le_bytes());
        for (i, (offset, size)) in tree.levels.iter().enumerate() {
            let level = &mut info[0x10 + i * 0x18..][..0x18];
            level[0..8].copy_from_slice(&offset.to_le_bytes());
            level[8..16].copy_from_slice(&size.to_le_bytes());
            level[16..20].copy_from_slice(&tree.log2_block_size.to_le_bytes());
        }
        info[0xc0..0xe0].copy_from_slice(&tree.master_hash);
        self
    }

    pub fn patch_info(
        mut self,
        relocation_tree: (u64, u64, i32),
        encryption_tree: (u64, u64, i32),
    ) -> Self {
        let info = &mut self.data[0x100..0x140];
        write_tree_info(&mut info[0..0x20], relocation_tree);
        write_tree_info(&mut info[0x20..0x40], encryption_tree);
        self
    }

    pub fn raw_mut(&mut self) -> &mut [u8; SECTOR_SIZE] {
        &mut self.data
    }

    pub fn bytes(&self) -> &[u8; SECTOR_SIZE] {
        &self.data
    }
}

fn write_tree_info(info: &mut [u8], (offset, size, entry_count): (u64, u64, i32)) {
    info[0..8].copy_from_slice(&offset.to_le_bytes());
    info[8..16].copy_from_slice(&size.to_le_bytes());
    info[16..20].copy_from_slice(b"BKTR");
    info[20..24].copy_from_slice(&1u32.to_le_bytes());
    info[24..28].copy_from_slice(&entry_count.to_le_bytes());
}

/// A PFS0-style section: the hash table followed by the data.
pub struct Sha256Tree {
    pub section: Vec<u8>,
    pub master_hash: [u8; 0x20],
    pub block_size: u32,
    pub levels: [(u64, u64); 2],
}

pub fn align_up(value: usize, alignment: usize) -> usize {
    (value + alignment - 1) / alignment * alignment
}

pub fn sha256_tree(data: &[u8], block_size: u32) -> Sha256Tree {
    let hash_table = data
        .chunks(block_size as usize)
        .flat_map(sha256)
        .collect::<Vec<_>>();
    let data_offset = align_up(hash_table.len(), 0x10);

    let mut section = vec![0; align_up(data_offset + data.len(), SECTOR_SIZE)];
    section[..hash_table.len()].copy_from_slice(&hash_table);
    section[data_offset..][..data.len()].copy_from_slice(data);

    Sha256Tree {
        section,
        master_hash: sha256(&hash_table),
        block_size,
        levels: [
            (0, hash_table.len() as u64),
            (data_offset as u64, data.len() as u64),
        ],
    }
}

/// A RomFS-style section: every level is hashed block by block (zero-padded) into the previous.
pub struct IvfcTree {
    pub section: Vec<u8>,
    pub master_hash: [u8; 0x20],
    pub log2_block_size: u32,
    pub levels: Vec<(u64, u64)>,
}

fn padded_hashes(level: &[u8], block_size: usize) -> Vec<u8> {
    level
        .chunks(block_size)
        .flat_map(|chunk| {
            let mut block = vec![0; block_size];
            block[..chunk.len()].copy_from_slice(chunk);
            sha256(&block)
        })
        .collect()
}

pub fn ivfc_tree(data: &[u8], log2_block_size: u32, data_levels: usize) -> IvfcTree {
    let block_size = 1usize << log2_block_size;

    let mut levels = vec![data.to_vec()];
    for _ in 1..data_levels {
        let hashes = padded_hashes(&levels[0], block_size);
        levels.insert(0, hashes);
    }
    assert!(levels[0].len() <= block_size, "the top level must be a single block");
    let master_hash: [u8; 0x20] = padded_hashes(&levels[0], block_size).try_into().unwrap();

    let mut section = Vec::new();
    let mut layout = Vec::new();
    for level in &levels {
        let offset = section.len();
        layout.push((offset as u64, level.len() as u64));
        section.extend_from_slice(level);
        section.resize(align_up(section.len(), block_size), 0);
    }
    section.resize(align_up(section.len(), SECTOR_SIZE), 0);

    IvfcTree {
        section,
        master_hash,
        log2_block_size,
        levels: layout,
    }
}

struct PendingSection {
    index: usize,
    fs_header: FsHeaderBuilder,
    data: Vec<u8>,
    /// Already encrypted by the caller.
    pre_encrypted: bool,
}

/// Offsets of a section inside the built NCA.
#[derive(Debug, Clone, Copy)]
pub struct SectionLayout {
    pub start: usize,
    pub end: usize,
}

pub struct BuiltNca {
    pub data: Vec<u8>,
    pub sections: [Option<SectionLayout>; 4],
}

pub struct NcaBuilder {
    version: u8,
    content_type: u8,
    rights_id: Option<[u8; 0x10]>,
    sections: Vec<PendingSection>,
    /// Where the next section starts, sections are laid out in the order they are added.
    next_offset: usize,
}

impl Default for NcaBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl NcaBuilder {
    pub fn new() -> Self {
        Self {
            version: b'3',
            content_type: CONTENT_TYPE_DATA,
            rights_id: None,
            sections: Vec::new(),
            next_offset: HEADER_SIZE,
        }
    }

    pub fn version(mut self, version: u8) -> Self {
        self.version = version;
        self
    }

    pub fn content_type(mut self, content_type: u8) -> Self {
        self.content_type = content_type;
        self
    }

    pub fn rights_id(mut self, rights_id: [u8; 0x10]) -> Self {
        self.rights_id = Some(rights_id);
        self
    }

    /// Where the next section added will start.
    pub fn next_section_offset(&self) -> usize {
        self.next_offset
    }

    /// Adds a plaintext section, encrypted according to its FS header when the NCA is built.
    pub fn section(self, index: usize, fs_header: FsHeaderBuilder, data: Vec<u8>) -> Self {
        self.push_section(index, fs_header, data, false)
    }

    pub fn encrypted_section(self, index: usize, fs_header: FsHeaderBuilder, data: Vec<u8>) -> Self {
        self.push_section(index, fs_header, data, true)
    }

    fn push_section(
        mut self,
        index: usize,
        fs_header: FsHeaderBuilder,
        mut data: Vec<u8>,
        pre_encrypted: bool,
    ) -> Self {
        data.resize(align_up(data.len(), SECTOR_SIZE), 0);
        self.next_offset += data.len();
        self.sections.push(PendingSection {
            index,
            fs_header,
            data,
            pre_encrypted,
        });
        self
    }

    /// The key the section data is encrypted with.
    pub fn ctr_key(&self) -> AesKey {
        match self.rights_id {
            Some(_) => title_key(),
            None => content_keys()[2],
        }
    }

    pub fn xts_key(&self) -> AesXtsKey {
        match self.rights_id {
            Some(_) => AesXtsKey::from_halves(title_key(), title_key()),
            None => AesXtsKey::from_halves(content_keys()[0], content_keys()[1]),
        }
    }

    /// The plaintext header.
    fn header(&self, layouts: &[Option<SectionLayout>; 4], total_size: usize) -> Vec<u8> {
        let mut header = vec![0; HEADER_SIZE];
        header[0x200..0x203].copy_from_slice(b"NCA");
        header[0x203] = self.version;
        header[0x204] = 0; // download
        header[0x205] = self.content_type;
        header[0x206] = KEY_GENERATION;
        header[0x207] = KeyAreaKeyIndex::Application as u8;
        header[0x208..0x210].copy_from_slice(&(total_size as u64).to_le_bytes());
        header[0x210..0x218].copy_from_slice(&0x0100_0000_0000_1000u64.to_le_bytes());
        header[0x218..0x21c].copy_from_slice(&0u32.to_le_bytes());
        header[0x21c..0x220].copy_from_slice(&0x000c_1100u32.to_le_bytes());
        header[0x220] = 0;
        if let Some(rights_id) = self.rights_id {
            header[0x230..0x240].copy_from_slice(&rights_id);
        }

        for section in &self.sections {
            let i = section.index;
            let Some(layout) = layouts[i] else { continue };

            let entry = &mut header[0x240 + i * 0x10..][..0x10];
            entry[0..4].copy_from_slice(&((layout.start / SECTOR_SIZE) as u32).to_le_bytes());
            entry[4..8].copy_from_slice(&((layout.end / SECTOR_SIZE) as u32).to_le_bytes());

            let fs_header = section.fs_header.bytes();
            header[0x280 + i * 0x20..][..0x20].copy_from_slice(&sha256(fs_header));
            header[0x400 + i * SECTOR_SIZE..][..SECTOR_SIZE].copy_from_slice(fs_header);
        }

        for (i, key) in content_keys().into_iter().enumerate() {
            let encrypted = key_area_key().encrypt_key(key);
            header[0x300 + i * 0x10..][..0x10].copy_from_slice(encrypted.as_bytes());
        }

        header
    }

    fn encrypt_section(&self, section: &PendingSection, layout: SectionLayout) -> Vec<u8> {
        let mut data = section.data.clone();
        if section.pre_encrypted {
            return data;
        }

        match section.fs_header.encryption_type() {
            ENCRYPTION_NONE => {}
            ENCRYPTION_XTS => self.xts_key().encrypt(&mut data, 0, SECTOR_SIZE),
            ENCRYPTION_CTR => self.ctr_key().apply_ctr(
                &mut data,
                &make_counter(section.fs_header.get_upper_counter(), layout.start as u64),
            ),
            other => panic!("can't encrypt sections of type {}", other),
        }
        data
    }

    pub fn build_plaintext_header(&self) -> BuiltNca {
        self.build_inner(false)
    }

    pub fn build(&self) -> BuiltNca {
        self.build_inner(true)
    }

    fn build_inner(&self, encrypt_header: bool) -> BuiltNca {
        let mut layouts = [None; 4];
        let mut offset = HEADER_SIZE;
        for section in &self.sections {
            layouts[section.index] = Some(SectionLayout {
                start: offset,
                end: offset + section.data.len(),
            });
            offset += section.data.len();
        }
        let total_size = offset;

        let mut data = self.header(&layouts, total_size);
        if encrypt_header {
            encrypt_header_in_place(&mut data, self.version);
        }

        for section in &self.sections {
            let layout = layouts[section.index].unwrap();
            data.extend_from_slice(&self.encrypt_section(section, layout));
        }
        assert_eq!(data.len(), total_size);

        BuiltNca {
            data,
            sections: layouts,
        }
    }
}

pub fn encrypt_header_in_place(header: &mut [u8], version: u8) {
    let key = header_key();
    if version == b'2' {
        key.encrypt(&mut header[..0x400], 0, SECTOR_SIZE);
        for fs_header in header[0x400..HEADER_SIZE].chunks_exact_mut(SECTOR_SIZE) {
            key.encrypt(fs_header, 0, SECTOR_SIZE);
        }
    } else {
        key.encrypt(&mut header[..HEADER_SIZE], 0, SECTOR_SIZE);
    }
}

/// Test data that differs between blocks.
pub fn pattern(len: usize, seed: u8) -> Vec<u8> {
    (0..len)
        .map(|i| (i as u8).wrapping_mul(31).wrapping_add(seed) ^ (i >> 8) as u8)
        .collect()
}

pub const BUCKET_NODE_SIZE: usize = 0x4000;

fn put_node_header(node: &mut [u8], index: i32, count: i32, end_offset: i64) {
    node[0..4].copy_from_slice(&index.to_le_bytes());
    node[4..8].copy_from_slice(&count.to_le_bytes());
    node[8..16].copy_from_slice(&end_offset.to_le_bytes());
}

/// A bucket tree with a single entry set: the L1 node followed by the entry set node.
pub fn bucket_tree(entries: &[Vec<u8>], end_offset: i64) -> Vec<u8> {
    let mut data = vec![0; BUCKET_NODE_SIZE * 2];
    let (l1, set) = data.split_at_mut(BUCKET_NODE_SIZE);
    put_node_header(l1, 0, 1, end_offset);
    put_node_header(set, 0, entries.len() as i32, end_offset);
    let mut pos = 0x10;
    for entry in entries {
        set[pos..pos + entry.len()].copy_from_slice(entry);
        pos += entry.len();
    }
    data
}

pub fn relocation_entry(virtual_offset: i64, physical_offset: i64, storage_index: i32) -> Vec<u8> {
    let mut entry = Vec::new();
    entry.extend_from_slice(&virtual_offset.to_le_bytes());
    entry.extend_from_slice(&physical_offset.to_le_bytes());
    entry.extend_from_slice(&storage_index.to_le_bytes());
    entry
}

pub fn encryption_entry(offset: i64, encrypted: bool, generation: u32) -> Vec<u8> {
    let mut entry = Vec::new();
    entry.extend_from_slice(&offset.to_le_bytes());
    entry.push(if encrypted { 0 } else { 1 });
    entry.extend_from_slice(&[0; 3]);
    entry.extend_from_slice(&generation.to_le_bytes());
    entry
}

/// The counter of a patch section block at `offset` of the NCA, with the generation set.
pub fn ctr_ex_counter(upper_counter: u64, offset: u64, generation: u32) -> [u8; 0x10] {
    let mut counter = make_counter(upper_counter, offset);
    counter[4..8].copy_from_slice(&generation.to_be_bytes());
    counter
}
